// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Row types for the durable state store (spec §3).

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

#[derive(Debug, Copy, Clone, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    None,
    Audio,
    Video,
}

impl MediaType {
    fn as_str(self) -> &'static str {
        match self {
            MediaType::None => "none",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = base::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(MediaType::None),
            "audio" => Ok(MediaType::Audio),
            "video" => Ok(MediaType::Video),
            other => Err(base::err!(
                InvalidArgument,
                base::msg!("unrecognized media_type {other:?}")
            )),
        }
    }
}

impl ToSql for MediaType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for MediaType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: base::Error| FromSqlError::Other(Box::new(std::io::Error::other(e.to_string()))))
    }
}

/// A broadcast session. Primary key `(channel_key, stream_id)`; see spec §3
/// for the `activated_time` monotonicity invariant.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Stream {
    pub channel_key: String,
    pub stream_id: String,
    pub title: String,
    pub start_time: String,
    pub is_live: bool,
    pub media_type: MediaType,
    pub activated_time: i64,
}

/// A single transcript line. `line_id` is a signed 32-bit integer per spec
/// §4.B "Numeric semantics".
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Line {
    pub line_id: i32,
    #[serde(default)]
    pub file_id: String,
    pub timestamp: i64,
    pub segments: Vec<u8>,
    #[serde(default)]
    pub media_available: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerStatus {
    pub channel_key: String,
    pub version: String,
    pub build_time: String,
    pub last_seen: i64,
}
