// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Local filesystem object store (spec §4.A "Local").

use super::{ByteStream, ObjectStore, StorageError};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub struct LocalStore {
    base_dir: PathBuf,
    public_url_base: Option<String>,
}

impl LocalStore {
    pub fn new(base_dir: PathBuf, public_url_base: Option<String>) -> Self {
        LocalStore {
            base_dir,
            public_url_base,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn save(
        &self,
        key: &str,
        mut body: ByteStream,
        _length: u64,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::permanent(e.into()))?;
        }
        let mut f = tokio::fs::File::create(&path)
            .await
            .map_err(|e| StorageError::transient(e.into()))?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                StorageError::transient(base::err!(e, base::msg!("reading upload body")))
            })?;
            f.write_all(&chunk)
                .await
                .map_err(|e| StorageError::transient(e.into()))?;
        }
        f.flush()
            .await
            .map_err(|e| StorageError::transient(e.into()))?;
        Ok(self.get_url(key))
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let path = self.path_for(key);
        let f = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::permanent(e.into())
            } else {
                StorageError::transient(e.into())
            }
        })?;
        let stream = tokio_util_file_stream(f);
        Ok(Box::pin(stream))
    }

    fn get_url(&self, key: &str) -> String {
        match &self.public_url_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("file://{}", self.path_for(key).display()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::transient(e.into())),
        }
    }

    async fn delete_folder(&self, prefix: &str) -> Result<(), StorageError> {
        let path = self.path_for(prefix);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::transient(e.into())),
        }
    }

    async fn stream_exists(&self, prefix: &str) -> Result<bool, StorageError> {
        Ok(path_exists(&self.path_for(prefix)).await)
    }

    fn is_local(&self) -> bool {
        true
    }
}

async fn path_exists(p: &Path) -> bool {
    tokio::fs::metadata(p).await.is_ok()
}

/// Turns a `tokio::fs::File` into the chunked byte stream the `ObjectStore`
/// trait deals in, reading in fixed-size blocks.
fn tokio_util_file_stream(
    mut f: tokio::fs::File,
) -> impl futures::Stream<Item = std::io::Result<bytes::Bytes>> {
    async_stream::try_stream! {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut f, &mut buf).await?;
            if n == 0 {
                break;
            }
            yield bytes::Bytes::copy_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body_of(bytes: &'static [u8]) -> ByteStream {
        Box::pin(stream::once(async move { Ok(bytes::Bytes::from_static(bytes)) }))
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf(), None);
        store
            .save("chan/stream/0.raw", body_of(b"hello"), 5, "application/octet-stream")
            .await
            .unwrap();
        let mut got = store.get("chan/stream/0.raw").await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = got.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn delete_folder_removes_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf(), None);
        store
            .save("chan/stream/0.raw", body_of(b"x"), 1, "application/octet-stream")
            .await
            .unwrap();
        assert!(store.stream_exists("chan/stream").await.unwrap());
        store.delete_folder("chan/stream").await.unwrap();
        assert!(!store.stream_exists("chan/stream").await.unwrap());
    }

    #[tokio::test]
    async fn get_url_prefers_public_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf(), Some("https://cdn.example/media".to_string()));
        assert_eq!(store.get_url("a/b.mp3"), "https://cdn.example/media/a/b.mp3");
    }
}
