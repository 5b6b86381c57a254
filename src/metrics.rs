// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Operational counters/gauges (spec §5 "Cross-cutting counters/gauges":
//! required surface, implementation-defined names) and the `/metrics`
//! Prometheus text exporter (spec §6 boundary glue).
//!
//! The teacher has no metrics crate of its own (no `/metrics` surface, no
//! `prometheus`/`metrics` dependency); this module hand-rolls a small atomic
//! registry (named counters/gauges, rendered as Prometheus text exposition
//! format) rather than reaching for an unverified dependency not attested
//! anywhere in this corpus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct ChannelCounters {
    oos: AtomicU64,
    websocket_errors: AtomicU64,
    audio_played: AtomicI64,
    audio_clipped: AtomicI64,
    video_clipped: AtomicI64,
    frame_downloads: AtomicI64,
}

/// Process-wide metrics registry: global counters plus a lazily-populated
/// set of per-channel gauges (spec §9 DESIGN NOTES: "established at startup
/// and immutable thereafter" applies to the channel *set*; the counters
/// inside are mutated continuously).
pub struct Metrics {
    connections_total: AtomicU64,
    connections_current: AtomicI64,
    evictions_total: AtomicU64,
    media_chunks_total: AtomicU64,
    clips_total: AtomicU64,
    channels: Mutex<HashMap<String, ChannelCounters>>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            connections_total: AtomicU64::new(0),
            connections_current: AtomicI64::new(0),
            evictions_total: AtomicU64::new(0),
            media_chunks_total: AtomicU64::new(0),
            clips_total: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_channel(&self, channel: &str) {
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default();
    }

    pub fn on_connect(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_disconnect(&self) {
        self.connections_current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_eviction(&self) {
        self.evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_media_chunk(&self) {
        self.media_chunks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_clip(&self) {
        self.clips_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_out_of_sync(&self, channel: &str) {
        self.with_channel(channel, |c| {
            c.oos.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn on_websocket_error(&self, channel: &str) {
        self.with_channel(channel, |c| {
            c.websocket_errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Resets the per-stream gauges to zero (spec §4.D.1 step 1, on
    /// new-stream-id activation; see DESIGN.md for the restart-reset
    /// decision too).
    pub fn reset_stream_gauges(&self, channel: &str) {
        self.with_channel(channel, |c| {
            c.audio_played.store(0, Ordering::Relaxed);
            c.audio_clipped.store(0, Ordering::Relaxed);
            c.video_clipped.store(0, Ordering::Relaxed);
            c.frame_downloads.store(0, Ordering::Relaxed);
        });
    }

    pub fn on_audio_played(&self, channel: &str) {
        self.with_channel(channel, |c| {
            c.audio_played.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn on_audio_clipped(&self, channel: &str) {
        self.with_channel(channel, |c| {
            c.audio_clipped.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn on_video_clipped(&self, channel: &str) {
        self.with_channel(channel, |c| {
            c.video_clipped.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn on_frame_download(&self, channel: &str) {
        self.with_channel(channel, |c| {
            c.frame_downloads.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn with_channel(&self, channel: &str, f: impl FnOnce(&ChannelCounters)) {
        let mut channels = self.channels.lock().unwrap();
        let entry = channels.entry(channel.to_string()).or_default();
        f(entry);
    }

    /// Renders the registry as Prometheus text exposition format for the
    /// `/metrics` endpoint.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# TYPE transcript_hub_connections_total counter\ntranscript_hub_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "# TYPE transcript_hub_connections_current gauge\ntranscript_hub_connections_current {}\n",
            self.connections_current.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "# TYPE transcript_hub_evictions_total counter\ntranscript_hub_evictions_total {}\n",
            self.evictions_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "# TYPE transcript_hub_media_chunks_total counter\ntranscript_hub_media_chunks_total {}\n",
            self.media_chunks_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "# TYPE transcript_hub_clips_total counter\ntranscript_hub_clips_total {}\n",
            self.clips_total.load(Ordering::Relaxed)
        ));

        let channels = self.channels.lock().unwrap();
        let mut names: Vec<&String> = channels.keys().collect();
        names.sort();
        for name in names {
            let c = &channels[name];
            out.push_str(&format!(
                "transcript_hub_out_of_sync_total{{channel=\"{name}\"}} {}\n",
                c.oos.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "transcript_hub_websocket_errors_total{{channel=\"{name}\"}} {}\n",
                c.websocket_errors.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "transcript_hub_audio_played{{channel=\"{name}\"}} {}\n",
                c.audio_played.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "transcript_hub_audio_clipped{{channel=\"{name}\"}} {}\n",
                c.audio_clipped.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "transcript_hub_video_clipped{{channel=\"{name}\"}} {}\n",
                c.video_clipped.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "transcript_hub_frame_downloads{{channel=\"{name}\"}} {}\n",
                c.frame_downloads.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_channel() {
        let m = Metrics::new();
        m.register_channel("chan");
        m.on_out_of_sync("chan");
        m.on_audio_played("chan");
        let text = m.render();
        assert!(text.contains("transcript_hub_out_of_sync_total{channel=\"chan\"} 1"));
        assert!(text.contains("transcript_hub_audio_played{channel=\"chan\"} 1"));
    }

    #[test]
    fn gauge_reset_zeroes_counters() {
        let m = Metrics::new();
        m.on_audio_played("chan");
        m.on_audio_played("chan");
        m.reset_stream_gauges("chan");
        let text = m.render();
        assert!(text.contains("transcript_hub_audio_played{channel=\"chan\"} 0"));
    }
}
