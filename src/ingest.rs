// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Ingestion Controller (spec §4.D): activation, deactivation, append-line
//! with gap detection, full sync, worker heartbeat.
//!
//! Grounded on `db/db.rs`'s stream upsert/transaction methods plus the
//! activation/retention sequencing described in `cmds/run/mod.rs`'s startup
//! wiring; per-channel serialization (spec §4.D.1 "Only one activation per
//! channel may be in flight") is modeled with a per-channel `tokio::Mutex`
//! rather than the teacher's single global database lock, since this
//! workload activates many channels independently.

use crate::hub::Hub;
use crate::json::{LineView, ServerEvent, StreamView};
use crate::metrics::Metrics;
use crate::retention;
use crate::storage::ObjectStore;
use base::clock::Clocks;
use db::{Database, Line, MediaType, Stream, WorkerStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Per-channel static config plus the mutex that serializes its activations
/// (spec §4.D.1).
struct ChannelEntry {
    base_media_folder: String,
    num_past_streams: i64,
    activation_lock: Mutex<()>,
}

pub struct IngestionController {
    db: Database,
    store: Arc<dyn ObjectStore>,
    hub: Arc<Hub>,
    clocks: Arc<dyn Clocks>,
    metrics: Arc<Metrics>,
    channels: HashMap<String, ChannelEntry>,
}

/// Outcome of an activation or deactivation call, distinguishing a true
/// transition (worth an HTTP 200 with a body) from "already reported" (spec
/// §4.D.1/§4.D.2), which the web boundary renders as 208.
pub enum ActivationResult {
    Activated,
    AlreadyReported,
}

impl IngestionController {
    pub fn new(
        db: Database,
        store: Arc<dyn ObjectStore>,
        hub: Arc<Hub>,
        clocks: Arc<dyn Clocks>,
        metrics: Arc<Metrics>,
        channels: impl IntoIterator<Item = (String, String, i64)>,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|(key, base_media_folder, num_past_streams)| {
                (
                    key,
                    ChannelEntry {
                        base_media_folder,
                        num_past_streams,
                        activation_lock: Mutex::new(()),
                    },
                )
            })
            .collect();
        IngestionController {
            db,
            store,
            hub,
            clocks,
            metrics,
            channels,
        }
    }

    fn entry(&self, channel: &str) -> Result<&ChannelEntry, base::Error> {
        self.channels
            .get(channel)
            .ok_or_else(|| base::err!(NotFound, base::msg!("no such channel {channel}")))
    }

    fn media_base_url(&self, channel: &str, stream_id: &str) -> String {
        self.store.get_url(&format!("{channel}/{stream_id}"))
    }

    /// Activation (spec §4.D.1).
    pub async fn activate(
        &self,
        channel: &str,
        stream_id: &str,
        title: &str,
        start_time: &str,
        media_type: MediaType,
    ) -> Result<ActivationResult, base::Error> {
        let entry = self.entry(channel)?;
        let _guard = entry.activation_lock.lock().await;

        let recent = self.db.get_recent_stream(channel).await?;

        if let Some(recent) = &recent {
            if recent.stream_id == stream_id {
                if recent.is_live {
                    return Ok(ActivationResult::AlreadyReported);
                }
                self.db.set_stream_live(channel, stream_id, true).await?;
                self.hub.broadcast(
                    channel,
                    ServerEvent::Status {
                        stream_id: stream_id.to_string(),
                        title: recent.title.clone(),
                        is_live: true,
                    },
                );
                return Ok(ActivationResult::Activated);
            }
            if recent.is_live {
                self.db.set_stream_live(channel, &recent.stream_id, false).await?;
            }
        }

        self.metrics.reset_stream_gauges(channel);

        let activated_time = base::strutil::parse_epoch_secs(start_time).unwrap_or_else(|| self.clocks.now_unix());
        self.db
            .upsert_stream(Stream {
                channel_key: channel.to_string(),
                stream_id: stream_id.to_string(),
                title: title.to_string(),
                start_time: start_time.to_string(),
                is_live: true,
                media_type,
                activated_time,
            })
            .await?;

        if self.store.is_local() {
            let prefix = format!("{channel}/{stream_id}/.keep");
            let empty: crate::storage::ByteStream =
                Box::pin(futures::stream::empty());
            let _ = self.store.save(&prefix, empty, 0, "application/octet-stream").await;
            retention::apply_local_retention(&self.db, &self.store, channel, entry.num_past_streams).await?;
        } else {
            if let Ok(changed) = retention::reconcile_remote(&self.db, &self.store, channel, stream_id).await {
                if changed {
                    info!(channel, "activation-time reconciliation dropped stale streams");
                }
            }
        }

        let media_base_url = self.media_base_url(channel, stream_id);
        let past = self.db.get_past_streams(channel, stream_id).await?;
        if !past.is_empty() {
            let streams = past
                .iter()
                .map(|s| StreamView::from_stream(s, media_base_url.clone()))
                .collect();
            self.hub.broadcast(channel, ServerEvent::PastStreams { streams });
        }
        self.hub.broadcast(
            channel,
            ServerEvent::NewStream {
                stream_id: stream_id.to_string(),
                title: title.to_string(),
                start_time: start_time.to_string(),
                media_type,
                media_base_url,
                is_live: true,
            },
        );

        Ok(ActivationResult::Activated)
    }

    /// Deactivation (spec §4.D.2). Only a `true -> false` transition for a
    /// matching `stream_id` is accepted.
    pub async fn deactivate(&self, channel: &str, stream_id: &str) -> Result<ActivationResult, base::Error> {
        self.entry(channel)?;
        let recent = self.db.get_recent_stream(channel).await?;
        let Some(recent) = recent else {
            return Ok(ActivationResult::AlreadyReported);
        };
        if recent.stream_id != stream_id || !recent.is_live {
            return Ok(ActivationResult::AlreadyReported);
        }
        self.db.set_stream_live(channel, stream_id, false).await?;
        self.hub.broadcast(
            channel,
            ServerEvent::Status {
                stream_id: stream_id.to_string(),
                title: recent.title,
                is_live: false,
            },
        );
        Ok(ActivationResult::Activated)
    }

    /// Append-line with gap detection (spec §4.D.3).
    pub async fn append_line(
        &self,
        channel: &str,
        stream_id: &str,
        mut line: Line,
        upload_time_ms: i64,
    ) -> Result<(), base::Error> {
        self.entry(channel)?;
        line.media_available = false;
        line.file_id = String::new();

        let last_id = self.db.get_last_line_id(channel, stream_id).await?;
        let expected = last_id + 1;
        if line.line_id != expected {
            self.metrics.on_out_of_sync(channel);
            base::bail!(
                Aborted,
                base::msg!(
                    "out of sync: channel {channel} stream {stream_id} expected line {expected}, got {}",
                    line.line_id
                )
            );
        }

        self.db.insert_transcript_line(channel, stream_id, line.clone()).await?;
        self.hub.broadcast(
            channel,
            ServerEvent::NewLine {
                stream_id: stream_id.to_string(),
                line: LineView::from(&line),
                upload_time_ms,
            },
        );
        Ok(())
    }

    /// Full sync (spec §4.D.4).
    pub async fn full_sync(
        &self,
        channel: &str,
        stream_id: &str,
        title: &str,
        start_time: &str,
        is_live: bool,
        media_type: MediaType,
        mut lines: Vec<Line>,
        upload_time_ms: i64,
    ) -> Result<(), base::Error> {
        self.entry(channel)?;
        let activated_time = base::strutil::parse_epoch_secs(start_time).unwrap_or_else(|| self.clocks.now_unix());

        self.db
            .upsert_stream(Stream {
                channel_key: channel.to_string(),
                stream_id: stream_id.to_string(),
                title: title.to_string(),
                start_time: start_time.to_string(),
                is_live,
                media_type,
                activated_time,
            })
            .await?;

        let availability = self
            .db
            .get_last_available_media_files(channel, stream_id, None)
            .await?
            .into_iter()
            .collect::<HashMap<i32, String>>();

        for line in &mut lines {
            line.media_available = false;
            line.file_id = String::new();
            if let Some(file_id) = availability.get(&line.line_id) {
                line.media_available = true;
                line.file_id = file_id.clone();
            }
        }

        self.db.replace_transcript(channel, stream_id, lines.clone()).await?;

        if let Some(last) = lines.last() {
            self.hub.broadcast(
                channel,
                ServerEvent::NewLine {
                    stream_id: stream_id.to_string(),
                    line: LineView::from(last),
                    upload_time_ms,
                },
            );
        }
        Ok(())
    }

    /// Worker heartbeat (spec §4.D.5): operator-facing liveness hint only.
    pub async fn heartbeat(&self, channel: &str, version: &str, build_time: &str) -> Result<(), base::Error> {
        self.entry(channel)?;
        self.db
            .upsert_worker_status(WorkerStatus {
                channel_key: channel.to_string(),
                version: version.to_string(),
                build_time: build_time.to_string(),
                last_seen: self.clocks.now_unix(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use base::clock::testutil::SimulatedClocks;

    async fn controller() -> (IngestionController, tempfile::TempDir) {
        let db = Database::open_in_memory().unwrap();
        db.ensure_channel("chan", "base", 2).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path().to_path_buf(), None));
        let hub = Arc::new(Hub::new(10_000, 256));
        hub.register_channel("chan");
        let clocks: Arc<dyn Clocks> = Arc::new(SimulatedClocks::new(jiff::Timestamp::from_second(1000).unwrap()));
        let metrics = Arc::new(crate::metrics::Metrics::new());
        let ctl = IngestionController::new(
            db,
            store,
            hub,
            clocks,
            metrics,
            [("chan".to_string(), "base".to_string(), 2i64)],
        );
        (ctl, dir)
    }

    #[tokio::test]
    async fn activation_of_new_stream_sets_live() {
        let (ctl, _dir) = controller().await;
        let res = ctl.activate("chan", "s1", "title", "1000", MediaType::Audio).await.unwrap();
        assert!(matches!(res, ActivationResult::Activated));
        let recent = ctl.db.get_recent_stream("chan").await.unwrap().unwrap();
        assert_eq!(recent.stream_id, "s1");
        assert!(recent.is_live);
    }

    #[tokio::test]
    async fn reactivating_same_live_stream_is_already_reported() {
        let (ctl, _dir) = controller().await;
        ctl.activate("chan", "s1", "title", "1000", MediaType::Audio).await.unwrap();
        let res = ctl.activate("chan", "s1", "title", "1000", MediaType::Audio).await.unwrap();
        assert!(matches!(res, ActivationResult::AlreadyReported));
    }

    #[tokio::test]
    async fn append_line_detects_gap() {
        let (ctl, _dir) = controller().await;
        ctl.activate("chan", "s1", "title", "1000", MediaType::Audio).await.unwrap();
        let line0 = Line {
            line_id: 0,
            file_id: String::new(),
            timestamp: 1,
            segments: b"{}".to_vec(),
            media_available: false,
        };
        ctl.append_line("chan", "s1", line0, 1).await.unwrap();

        let line_gap = Line {
            line_id: 2,
            file_id: String::new(),
            timestamp: 2,
            segments: b"{}".to_vec(),
            media_available: false,
        };
        let err = ctl.append_line("chan", "s1", line_gap, 2).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::Aborted);
    }

    #[tokio::test]
    async fn full_sync_overwrites_availability_from_db() {
        let (ctl, _dir) = controller().await;
        ctl.activate("chan", "s1", "title", "1000", MediaType::Audio).await.unwrap();
        ctl.db.set_media_available("chan", "s1", 0, "", false).await.ok();
        ctl.db
            .insert_transcript_line(
                "chan",
                "s1",
                Line { line_id: 0, file_id: String::new(), timestamp: 1, segments: b"{}".to_vec(), media_available: false },
            )
            .await
            .unwrap();
        ctl.db.set_media_available("chan", "s1", 0, "f1", true).await.unwrap();

        let lines = vec![Line {
            line_id: 0,
            file_id: "client-supplied-should-be-ignored".to_string(),
            timestamp: 1,
            segments: b"{}".to_vec(),
            media_available: false,
        }];
        ctl.full_sync("chan", "s1", "title", "1000", true, MediaType::Audio, lines, 5).await.unwrap();

        let transcript = ctl.db.get_transcript("chan", "s1").await.unwrap();
        assert_eq!(transcript[0].file_id, "f1");
        assert!(transcript[0].media_available);
    }
}
