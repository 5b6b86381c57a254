// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Durable state store for transcript-hub (spec §3, §4.B): schema, the
//! `Database` handle, and the legacy-schema migration path (spec §6).
//!
//! Grounded on the teacher's `db::db` module: a cache-warmed SQLite handle
//! behind a mutex, opened with a fixed pragma set, exposing typed query
//! methods rather than leaking `rusqlite` to callers.

mod db;
pub mod types;
pub mod upgrade;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use crate::db::{Database, Tunables};
pub use crate::types::{Line, MediaType, Stream, WorkerStatus};
