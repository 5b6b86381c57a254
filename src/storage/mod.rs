// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Object Store Interface (spec §4.A).
//!
//! Grounded on the teacher's `db::dir::SampleFileDir` — a pluggable handle
//! wrapping a place recordings live — generalized into a trait object with
//! two implementors, since unlike the teacher this workload has both a local
//! filesystem variant and a remote (S3-compatible) one rather than always
//! talking to an fcntl-managed local directory.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use local::LocalStore;
pub use remote::RemoteStore;

/// Whether a storage failure is worth retrying (spec §4.A "Failure").
#[derive(Debug)]
pub struct StorageError {
    pub transient: bool,
    pub source: base::Error,
}

impl StorageError {
    pub fn transient(source: base::Error) -> Self {
        StorageError {
            transient: true,
            source,
        }
    }

    pub fn permanent(source: base::Error) -> Self {
        StorageError {
            transient: false,
            source,
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<StorageError> for base::Error {
    fn from(e: StorageError) -> Self {
        e.source
    }
}

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A place media chunks and transcript files live, keyed by a caller-chosen
/// string (`{channel}/{stream_id}/{file_id}.{ext}` per spec §4.C). One
/// instance per channel's configured storage backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads `body` (of `length` bytes) under `key`, returning a URL
    /// viewers can fetch it from directly.
    async fn save(
        &self,
        key: &str,
        body: ByteStream,
        length: u64,
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Fetches the object at `key` as a stream of chunks.
    async fn get(&self, key: &str) -> Result<ByteStream, StorageError>;

    /// The URL viewers should use to fetch `key` directly, without actually
    /// performing the fetch.
    fn get_url(&self, key: &str) -> String;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Removes every object whose key starts with `prefix`. A no-op for
    /// backends where per-key deletion during retention is cheap enough that
    /// a bulk recursive delete isn't worth the extra round trip (spec §4.F:
    /// remote retention relies on reconciliation instead).
    async fn delete_folder(&self, prefix: &str) -> Result<(), StorageError>;

    /// Whether any object exists with the given key prefix. Used by
    /// reconciliation (spec §4.F) to decide whether a stream's media folder
    /// is still present.
    async fn stream_exists(&self, prefix: &str) -> Result<bool, StorageError>;

    /// True for backends where `delete_folder` is eager and authoritative
    /// (local disk); false where retention instead depends on periodic
    /// reconciliation (remote/S3-compatible).
    fn is_local(&self) -> bool;
}

/// Infers an upload `Content-Type` from a file extension, per the teacher's
/// `mime_guess`-free ad hoc table in `lib::body` — generalized to the small,
/// fixed set of file kinds this system ever stores.
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "jpg" | "jpeg" => "image/jpeg",
        "raw" => "application/octet-stream",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_table_covers_known_extensions() {
        assert_eq!(content_type_for_extension("mp4"), "video/mp4");
        assert_eq!(content_type_for_extension("jpg"), "image/jpeg");
        assert_eq!(content_type_for_extension("weird"), "application/octet-stream");
    }
}
