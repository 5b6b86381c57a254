// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wire types for the WebSocket protocol (spec §6 "Socket protocol") and
//! the JSON request/response bodies of the HTTP surface.
//!
//! Grounded on the teacher's `src/json.rs` (plain serde structs mirroring
//! the wire format exactly, with a thin conversion layer from/to the db
//! crate's row types) and `src/web/websocket.rs` for the event-framing
//! idiom.

use db::{Line, MediaType, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every frame on the wire is `{"event": <tag>, "data": <payload>}`;
/// `serde`'s internally-tagged representation produces exactly that shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "sync")]
    Sync {
        stream: StreamView,
        transcript: Vec<LineView>,
    },
    #[serde(rename = "partialSync")]
    PartialSync {
        stream: StreamView,
        transcript: Vec<LineView>,
    },
    #[serde(rename = "newLine")]
    NewLine {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(flatten)]
        line: LineView,
        #[serde(rename = "uploadTimeMs")]
        upload_time_ms: i64,
    },
    #[serde(rename = "newStream")]
    NewStream {
        #[serde(rename = "streamId")]
        stream_id: String,
        title: String,
        #[serde(rename = "startTime")]
        start_time: String,
        #[serde(rename = "mediaType")]
        media_type: MediaType,
        #[serde(rename = "mediaBaseUrl")]
        media_base_url: String,
        #[serde(rename = "isLive")]
        is_live: bool,
    },
    #[serde(rename = "status")]
    Status {
        #[serde(rename = "streamId")]
        stream_id: String,
        title: String,
        #[serde(rename = "isLive")]
        is_live: bool,
    },
    #[serde(rename = "newMedia")]
    NewMedia {
        #[serde(rename = "streamId")]
        stream_id: String,
        files: BTreeMap<i32, String>,
    },
    #[serde(rename = "pastStreams")]
    PastStreams { streams: Vec<StreamView> },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamView {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    pub title: String,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "isLive")]
    pub is_live: bool,
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    #[serde(rename = "mediaBaseUrl")]
    pub media_base_url: String,
}

impl StreamView {
    pub fn from_stream(s: &Stream, media_base_url: String) -> Self {
        StreamView {
            stream_id: s.stream_id.clone(),
            title: s.title.clone(),
            start_time: s.start_time.clone(),
            is_live: s.is_live,
            media_type: s.media_type,
            media_base_url,
        }
    }

    /// A zero-value stub for the "no recent stream yet" handshake case
    /// (spec §4.E "or a zero-value stub when none").
    pub fn stub() -> Self {
        StreamView {
            stream_id: String::new(),
            title: String::new(),
            start_time: String::new(),
            is_live: false,
            media_type: MediaType::None,
            media_base_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LineView {
    #[serde(rename = "lineId")]
    pub line_id: i32,
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub timestamp: i64,
    pub segments: serde_json::Value,
    #[serde(rename = "mediaAvailable")]
    pub media_available: bool,
}

impl From<&Line> for LineView {
    fn from(l: &Line) -> Self {
        LineView {
            line_id: l.line_id,
            file_id: l.file_id.clone(),
            timestamp: l.timestamp,
            segments: segments_as_json(&l.segments),
            media_available: l.media_available,
        }
    }
}

/// `segments` is opaque to the core (spec §3: "treated as a byte string")
/// but is itself JSON on the wire; parse it back out so it round-trips as
/// an embedded object rather than a doubly-escaped string. Falls back to a
/// JSON string of the raw bytes (lossily, via `String::from_utf8_lossy`) if
/// a worker ever sends something that isn't valid JSON.
pub fn segments_as_json(raw: &[u8]) -> serde_json::Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(raw).into_owned()))
}

/// Body of `POST /{channel}/sync` (spec §4.D.4).
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    pub title: String,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "isLive")]
    pub is_live: bool,
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    pub transcript: Vec<LineRequest>,
}

/// Body of `POST /{channel}/line/{streamID}` (spec §4.D.3) and entries
/// within [`SyncRequest::transcript`]. `media_available` is accepted for
/// schema compatibility but always ignored server-side (spec §4.D.3/§4.D.4).
#[derive(Debug, Clone, Deserialize)]
pub struct LineRequest {
    #[serde(rename = "lineId")]
    pub line_id: i32,
    pub timestamp: i64,
    pub segments: serde_json::Value,
    #[serde(rename = "mediaAvailable", default)]
    pub media_available: bool,
}

impl LineRequest {
    pub fn into_line(self) -> Line {
        Line {
            line_id: self.line_id,
            file_id: String::new(),
            timestamp: self.timestamp,
            segments: serde_json::to_vec(&self.segments).unwrap_or_default(),
            media_available: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClipResponse {
    #[serde(rename = "clipId")]
    pub clip_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClipRequest {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(rename = "startLine")]
    pub start_line: i32,
    #[serde(rename = "endLine")]
    pub end_line: i32,
    #[serde(rename = "type")]
    pub kind: ClipKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipKind {
    M4a,
    Mp3,
    Mp4,
}

impl ClipKind {
    pub fn extension(self) -> &'static str {
        match self {
            ClipKind::M4a => "m4a",
            ClipKind::Mp3 => "mp3",
            ClipKind::Mp4 => "mp4",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrimRequest {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(rename = "clipId")]
    pub clip_id: String,
    #[serde(rename = "fileFormat")]
    pub file_format: ClipKind,
    #[serde(rename = "startSec")]
    pub start_sec: f64,
    #[serde(rename = "endSec")]
    pub end_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCheckResponse {
    #[serde(rename = "viewerCount")]
    pub viewer_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_frames_as_event_data() {
        let ev = ServerEvent::Pong { timestamp: 42 };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "pong");
        assert_eq!(v["data"]["timestamp"], 42);
    }

    #[test]
    fn segments_round_trip_as_embedded_json() {
        let raw = br#"{"text":"hello"}"#;
        let v = segments_as_json(raw);
        assert_eq!(v["text"], "hello");
    }

    #[test]
    fn segments_falls_back_to_string_for_non_json() {
        let v = segments_as_json(b"not json");
        assert_eq!(v, serde_json::Value::String("not json".to_string()));
    }
}
