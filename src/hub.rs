// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Fan-out Hub (spec §4.E): per-channel client registry, bounded send
//! queues, backpressure-triggered eviction, snapshot-then-delta handshake.
//!
//! Grounded on `src/web/websocket.rs`'s upgrade/handler-task shape and
//! `src/web/live.rs`'s per-subscriber loop, generalized from one live-view
//! socket per stream to a bounded multi-client broadcast registry per
//! channel.

use crate::json::{LineView, ServerEvent, StreamView};
use db::Database;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Lines beyond this count trigger the `partialSync`-then-`sync` handshake
/// (spec §4.E step 3).
const PARTIAL_SYNC_THRESHOLD: usize = 100;
const PARTIAL_SYNC_TAIL: usize = 100;

pub type ClientId = u64;

struct ChannelState {
    clients: Mutex<HashMap<ClientId, tokio::sync::mpsc::Sender<ServerEvent>>>,
    connections: AtomicU32,
}

impl ChannelState {
    fn new() -> Self {
        ChannelState {
            clients: Mutex::new(HashMap::new()),
            connections: AtomicU32::new(0),
        }
    }
}

/// Registered once per configured channel at startup and never mutated
/// afterward (only its interior client list changes).
pub struct Hub {
    max_conn: u32,
    queue_depth: usize,
    channels: Mutex<HashMap<String, std::sync::Arc<ChannelState>>>,
    next_client_id: AtomicU64,
}

/// Returned to the caller on a successful [`Hub::register`]; wraps the
/// receiving half of the client's outbound queue for the dedicated writer
/// task (spec §4.E "single-writer-per-socket invariant").
pub struct ClientSession {
    pub id: ClientId,
    pub rx: tokio::sync::mpsc::Receiver<ServerEvent>,
}

/// Why [`Hub::register`] refused a connection. The two cases map to
/// different HTTP statuses at the websocket boundary (spec §6 route table:
/// `101/400/404`) and must not be collapsed into one.
#[derive(Debug, Eq, PartialEq)]
pub enum AdmissionError {
    /// `channel` was never registered (no such channel exists).
    UnknownChannel,
    /// `channel` exists but `client_connections >= max_conn`.
    AtCapacity,
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::UnknownChannel => write!(f, "no such channel"),
            AdmissionError::AtCapacity => write!(f, "connection limit reached"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl Hub {
    pub fn new(max_conn: u32, queue_depth: usize) -> Self {
        Hub {
            max_conn,
            queue_depth,
            channels: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Declares a channel the hub should accept connections for. Called
    /// once per configured channel at startup.
    pub fn register_channel(&self, channel: &str) {
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_insert_with(|| std::sync::Arc::new(ChannelState::new()));
    }

    fn channel(&self, channel: &str) -> Option<std::sync::Arc<ChannelState>> {
        self.channels.lock().unwrap().get(channel).cloned()
    }

    /// Admission + registration (spec §4.E "Admission"/"On accept").
    /// Distinguishes an unknown channel from one that's merely full
    /// ([`AdmissionError`]) so the HTTP boundary can return 404 vs 400.
    pub fn register(&self, channel: &str) -> Result<ClientSession, AdmissionError> {
        let state = self.channel(channel).ok_or(AdmissionError::UnknownChannel)?;
        if state.connections.load(Ordering::SeqCst) >= self.max_conn {
            return Err(AdmissionError::AtCapacity);
        }
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = tokio::sync::mpsc::channel(self.queue_depth);
        state.clients.lock().unwrap().insert(id, tx);
        state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(ClientSession { id, rx })
    }

    /// Removes a client from the registry. Idempotent: a repeat or unknown
    /// id is a no-op and never drives the connection counter negative (spec
    /// §4.E "Eviction is idempotent").
    pub fn evict(&self, channel: &str, id: ClientId) {
        let Some(state) = self.channel(channel) else {
            return;
        };
        let removed = state.clients.lock().unwrap().remove(&id).is_some();
        if removed {
            state.connections.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            }).ok();
        }
    }

    pub fn connection_count(&self, channel: &str) -> u32 {
        self.channel(channel)
            .map(|s| s.connections.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Sends `event` to a single client's queue; drops it silently (per spec
    /// §4.E "dropped if the queue is full") rather than evicting, since a
    /// lost `pong` is not fatal to the connection.
    pub fn send_to(&self, channel: &str, id: ClientId, event: ServerEvent) {
        let Some(state) = self.channel(channel) else {
            return;
        };
        let clients = state.clients.lock().unwrap();
        if let Some(tx) = clients.get(&id) {
            let _ = tx.try_send(event);
        }
    }

    /// Broadcasts `event` to every client on `channel`. Per-client sends
    /// are non-blocking; a full queue schedules that client for eviction
    /// (spec §4.E "Each send is non-blocking").
    pub fn broadcast(&self, channel: &str, event: ServerEvent) {
        let Some(state) = self.channel(channel) else {
            return;
        };
        let mut to_evict = Vec::new();
        {
            let clients = state.clients.lock().unwrap();
            for (&id, tx) in clients.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => to_evict.push(id),
                    Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => to_evict.push(id),
                }
            }
        }
        for id in to_evict {
            warn!(channel, client_id = id, "evicting slow consumer");
            self.evict(channel, id);
        }
    }

    /// Builds the initial handshake sequence for a freshly-registered client
    /// (spec §4.E "Initial handshake"): recent-stream snapshot (possibly
    /// split into `partialSync` + `sync` for long transcripts), then
    /// `pastStreams`.
    pub async fn handshake(
        &self,
        db: &Database,
        channel: &str,
        media_base_url: &str,
    ) -> Result<Vec<ServerEvent>, base::Error> {
        let mut frames = Vec::new();

        let recent = db.get_recent_stream(channel).await?;
        let stream_view = match &recent {
            Some(s) => StreamView::from_stream(s, media_base_url.to_string()),
            None => StreamView::stub(),
        };

        let transcript: Vec<LineView> = match &recent {
            Some(s) => db
                .get_transcript(channel, &s.stream_id)
                .await?
                .iter()
                .map(LineView::from)
                .collect(),
            None => Vec::new(),
        };

        if transcript.len() > PARTIAL_SYNC_THRESHOLD {
            let tail_start = transcript.len() - PARTIAL_SYNC_TAIL;
            frames.push(ServerEvent::PartialSync {
                stream: stream_view.clone(),
                transcript: transcript[tail_start..].to_vec(),
            });
        }
        frames.push(ServerEvent::Sync {
            stream: stream_view,
            transcript,
        });

        let exclude = recent.as_ref().map(|s| s.stream_id.as_str()).unwrap_or("");
        let past = db.get_past_streams(channel, exclude).await?;
        if !past.is_empty() {
            let streams = past
                .iter()
                .map(|s| StreamView::from_stream(s, media_base_url.to_string()))
                .collect();
            frames.push(ServerEvent::PastStreams { streams });
        }

        debug!(channel, frames = frames.len(), "built handshake sequence");
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_rejects_at_max_conn() {
        let hub = Hub::new(1, 8);
        hub.register_channel("chan");
        let _first = hub.register("chan").unwrap();
        assert_eq!(hub.register("chan").unwrap_err(), AdmissionError::AtCapacity);
    }

    #[test]
    fn admission_rejects_unknown_channel() {
        let hub = Hub::new(10, 8);
        assert_eq!(hub.register("nope").unwrap_err(), AdmissionError::UnknownChannel);
    }

    #[test]
    fn eviction_is_idempotent() {
        let hub = Hub::new(10, 8);
        hub.register_channel("chan");
        let session = hub.register("chan").unwrap();
        assert_eq!(hub.connection_count("chan"), 1);
        hub.evict("chan", session.id);
        assert_eq!(hub.connection_count("chan"), 0);
        hub.evict("chan", session.id);
        assert_eq!(hub.connection_count("chan"), 0);
        hub.evict("chan", 9999);
        assert_eq!(hub.connection_count("chan"), 0);
    }

    #[tokio::test]
    async fn broadcast_evicts_full_queue() {
        let hub = Hub::new(10, 1);
        hub.register_channel("chan");
        let session = hub.register("chan").unwrap();
        hub.broadcast("chan", ServerEvent::Pong { timestamp: 1 });
        hub.broadcast("chan", ServerEvent::Pong { timestamp: 2 });
        assert_eq!(hub.connection_count("chan"), 0);
        drop(session);
    }

    #[tokio::test]
    async fn handshake_splits_long_transcripts() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_channel("chan", "base", 3).await.unwrap();
        db.upsert_stream(db::Stream {
            channel_key: "chan".to_string(),
            stream_id: "s1".to_string(),
            title: "t".to_string(),
            start_time: "0".to_string(),
            is_live: true,
            media_type: db::MediaType::None,
            activated_time: 0,
        })
        .await
        .unwrap();
        for i in 0..150 {
            db.insert_transcript_line(
                "chan",
                "s1",
                db::Line {
                    line_id: i,
                    file_id: String::new(),
                    timestamp: i as i64,
                    segments: b"{}".to_vec(),
                    media_available: false,
                },
            )
            .await
            .unwrap();
        }
        let hub = Hub::new(10, 8);
        hub.register_channel("chan");
        let frames = hub.handshake(&db, "chan", "https://x/chan/s1").await.unwrap();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            ServerEvent::PartialSync { transcript, .. } => assert_eq!(transcript.len(), 100),
            _ => panic!("expected partialSync first"),
        }
        match &frames[1] {
            ServerEvent::Sync { transcript, .. } => assert_eq!(transcript.len(), 150),
            _ => panic!("expected sync second"),
        }
    }
}
