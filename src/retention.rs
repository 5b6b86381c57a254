// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Retention & Reconciliation (spec §4.F): prunes past streams under two
//! storage regimes.
//!
//! Grounded on the garbage-collection scheduling in `db/writer.rs` and the
//! retention side-effects embedded in `cmds/run`'s startup wiring,
//! restructured into the spec's two regimes: local eager rotation during
//! activation, remote periodic reconciliation tick.

use crate::hub::Hub;
use crate::json::{ServerEvent, StreamView};
use crate::storage::ObjectStore;
use db::{Database, Stream};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Local regime (spec §4.D.1 step 5): keep at most `num_past_streams + 1`
/// streams (active + past); the tail of `activated_time DESC` order beyond
/// that is deleted, along with its transcript and storage folder.
pub async fn apply_local_retention(
    db: &Database,
    store: &Arc<dyn ObjectStore>,
    channel: &str,
    num_past_streams: i64,
) -> Result<(), base::Error> {
    let all = db.get_all_streams(channel).await?;
    let keep = (num_past_streams + 1).max(0) as usize;
    if all.len() <= keep {
        return Ok(());
    }
    for stream in &all[keep..] {
        info!(channel, stream_id = %stream.stream_id, "retention: dropping past stream");
        db.delete_stream(channel, &stream.stream_id).await?;
        db.delete_transcript(channel, &stream.stream_id).await?;
        let store = store.clone();
        let channel_owned = channel.to_string();
        let stream_id = stream.stream_id.clone();
        tokio::spawn(async move {
            let prefix = format!("{channel_owned}/{stream_id}");
            if let Err(e) = store.delete_folder(&prefix).await {
                warn!(error = %e, prefix, "retention: delete_folder failed");
            }
        });
    }
    Ok(())
}

/// Remote regime (spec §4.F): for each non-active stream, probe
/// `stream_exists`; delete the DB rows for any that's missing. Returns
/// `true` if anything was deleted, so the caller knows to re-broadcast
/// `pastStreams`.
pub async fn reconcile_remote(
    db: &Database,
    store: &Arc<dyn ObjectStore>,
    channel: &str,
    active_stream_id: &str,
) -> Result<bool, base::Error> {
    let past = db.get_past_streams(channel, active_stream_id).await?;
    let mut changed = false;
    for stream in past {
        let prefix = format!("{channel}/{}", stream.stream_id);
        let exists = store.stream_exists(&prefix).await.map_err(base::Error::from)?;
        if !exists {
            debug!(channel, stream_id = %stream.stream_id, "reconciliation: stream missing remotely, dropping rows");
            db.delete_stream(channel, &stream.stream_id).await?;
            db.delete_transcript(channel, &stream.stream_id).await?;
            changed = true;
        }
    }
    Ok(changed)
}

/// Emits a refreshed `pastStreams` after reconciliation or retention
/// changes the catalog (spec §4.F).
pub async fn broadcast_past_streams(
    db: &Database,
    hub: &Hub,
    channel: &str,
    active_stream_id: &str,
    media_base_url: &str,
) -> Result<(), base::Error> {
    let past: Vec<Stream> = db.get_past_streams(channel, active_stream_id).await?;
    let streams = past
        .iter()
        .map(|s| StreamView::from_stream(s, media_base_url.to_string()))
        .collect();
    hub.broadcast(channel, ServerEvent::PastStreams { streams });
    Ok(())
}

/// Drives the periodic remote reconciliation tick (spec §4.F "default 8h").
/// Cancellable via `shutdown`; each configured channel is reconciled in
/// turn on every tick.
pub async fn reconciliation_loop(
    db: Database,
    store: Arc<dyn ObjectStore>,
    hub: Arc<Hub>,
    channels: Vec<(String, String)>,
    interval: std::time::Duration,
    mut shutdown: base::shutdown::Receiver,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (channel, media_base_url) in &channels {
                    let active = db.get_recent_stream(channel).await.ok().flatten();
                    let active_id = active.as_ref().map(|s| s.stream_id.as_str()).unwrap_or("");
                    match reconcile_remote(&db, &store, channel, active_id).await {
                        Ok(true) => {
                            if let Err(e) = broadcast_past_streams(&db, &hub, channel, active_id, media_base_url).await {
                                warn!(error = %e, channel, "reconciliation: broadcast failed");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, channel, "reconciliation tick failed"),
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("reconciliation loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;

    async fn seeded(channel: &str, n: i64) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.ensure_channel(channel, "base", n).await.unwrap();
        for i in 0..5 {
            db.upsert_stream(db::Stream {
                channel_key: channel.to_string(),
                stream_id: format!("s{i}"),
                title: "t".to_string(),
                start_time: "0".to_string(),
                is_live: i == 4,
                media_type: db::MediaType::None,
                activated_time: i,
            })
            .await
            .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn local_retention_keeps_active_plus_n_past() {
        let db = seeded("chan", 2).await;
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path().to_path_buf(), None));
        apply_local_retention(&db, &store, "chan", 2).await.unwrap();
        let remaining = db.get_all_streams("chan").await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].stream_id, "s4");
    }

    #[tokio::test]
    async fn remote_reconciliation_drops_missing_streams() {
        let db = seeded("chan", 10).await;
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path().to_path_buf(), None));
        let changed = reconcile_remote(&db, &store, "chan", "s4").await.unwrap();
        assert!(changed);
        let remaining = db.get_all_streams("chan").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stream_id, "s4");
    }
}
