// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared test fixtures, grounded on the teacher's `db::testutil`.

use crate::{Database, Line, MediaType, Stream};

/// An in-memory database pre-seeded with one channel, for use by this
/// crate's own tests and by the server binary's integration tests.
pub async fn seeded_db(channel: &str) -> Database {
    let db = Database::open_in_memory().expect("open in-memory db");
    db.ensure_channel(channel, "/tmp/unused", 2)
        .await
        .expect("ensure_channel");
    db
}

pub fn sample_stream(channel: &str, stream_id: &str, activated_time: i64, live: bool) -> Stream {
    Stream {
        channel_key: channel.to_string(),
        stream_id: stream_id.to_string(),
        title: format!("title-{stream_id}"),
        start_time: activated_time.to_string(),
        is_live: live,
        media_type: MediaType::Audio,
        activated_time,
    }
}

pub fn sample_line(line_id: i32) -> Line {
    Line {
        line_id,
        file_id: String::new(),
        timestamp: line_id as i64,
        segments: format!("segment {line_id}").into_bytes(),
        media_available: false,
    }
}
