// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clip/Trim Service (spec §4.G): merges a contiguous range of raw chunks,
//! transcodes to the requested container, stores it, returns a handle.
//!
//! Grounded on [`crate::media`]'s upload pipeline and [`crate::transcode`]'s
//! injectable transcoder; the teacher has no equivalent since it serves
//! already-muxed `.mp4` segments rather than assembling clips from
//! independently-stored chunks.

use crate::json::ClipKind;
use crate::storage::ObjectStore;
use bytes::Bytes;
use db::Database;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub struct ClipService {
    db: Database,
    store: Arc<dyn ObjectStore>,
    temp_dir: PathBuf,
    max_clip_size: i32,
}

impl ClipService {
    pub fn new(db: Database, store: Arc<dyn ObjectStore>, temp_dir: PathBuf, max_clip_size: i32) -> Self {
        ClipService {
            db,
            store,
            temp_dir,
            max_clip_size,
        }
    }

    /// Spec §4.G main algorithm: range validation, completeness check,
    /// streamed concatenation, transcode, upload.
    pub async fn create_clip(
        &self,
        channel: &str,
        stream_id: &str,
        start_line: i32,
        end_line: i32,
        kind: ClipKind,
    ) -> Result<String, base::Error> {
        if start_line < 0 || !(start_line < end_line) {
            base::bail!(InvalidArgument, base::msg!("range must satisfy 0 <= start_line < end_line"));
        }
        if end_line - start_line >= self.max_clip_size {
            base::bail!(
                InvalidArgument,
                base::msg!("clip range {} exceeds max_clip_size {}", end_line - start_line, self.max_clip_size)
            );
        }
        if kind == ClipKind::Mp4 {
            let stream = self
                .db
                .get_stream(channel, stream_id)
                .await?
                .ok_or_else(|| base::err!(NotFound, base::msg!("no such stream {channel}/{stream_id}")))?;
            if stream.media_type != db::MediaType::Video {
                // `OutOfRange` is otherwise unused by this workspace; reserved
                // for this one case so `error_response` can map it to 405
                // (spec §6 route table: `/clip` is `200/400/405/500`).
                base::bail!(OutOfRange, base::msg!("mp4 clips require a video stream"));
            }
        }

        let files = self
            .db
            .get_file_ids_in_range(channel, stream_id, start_line, end_line)
            .await?;
        let expected = (end_line - start_line + 1) as usize;
        if files.len() != expected {
            base::bail!(
                Unavailable,
                base::msg!(
                    "incomplete media range: expected {expected} chunks, have {}",
                    files.len()
                )
            );
        }

        let clip_id = base::strutil::new_id();
        let concat_path = self.temp_dir.join(format!("{clip_id}.concat.raw"));
        let _guard = TempFileGuard(concat_path.clone());

        {
            let mut out = tokio::fs::File::create(&concat_path)
                .await
                .map_err(|e| base::err!(e, base::msg!("creating concat temp file")))?;
            for (_, file_id) in &files {
                let key = format!("{channel}/{stream_id}/raw/{file_id}.raw");
                let mut chunk_stream = self.store.get(&key).await.map_err(base::Error::from)?;
                while let Some(chunk) = chunk_stream.next().await {
                    let chunk = chunk.map_err(|e| base::err!(e, base::msg!("reading chunk {key}")))?;
                    out.write_all(&chunk)
                        .await
                        .map_err(|e| base::err!(e, base::msg!("writing concat temp file")))?;
                }
            }
            out.flush().await.map_err(|e| base::err!(e, base::msg!("flushing concat temp file")))?;
        }

        let ext = kind.extension();
        let out_path = self.temp_dir.join(format!("{clip_id}.{ext}"));
        let _out_guard = TempFileGuard(out_path.clone());
        crate::transcode::remux_or_trim(&concat_path, &out_path, None).await?;

        if kind == ClipKind::Mp4 {
            let m4a_path = self.temp_dir.join(format!("{clip_id}.m4a"));
            let _m4a_guard = TempFileGuard(m4a_path.clone());
            if crate::transcode::transcode_to_m4a(&concat_path, &m4a_path).await.is_ok() {
                let key = format!("{channel}/{stream_id}/clips/{clip_id}.m4a");
                let _ = self.upload(&m4a_path, &key, "audio/mp4").await;
            }
        }

        let key = format!("{channel}/{stream_id}/clips/{clip_id}.{ext}");
        let content_type = crate::storage::content_type_for_extension(ext);
        self.upload(&out_path, &key, content_type).await?;

        Ok(clip_id)
    }

    /// Trim: download the existing clip, transcode-trim to `[start_sec,
    /// end_sec)`, upload as a new clip id (spec §4.G "Trim"). The original
    /// is untouched.
    pub async fn trim_clip(
        &self,
        channel: &str,
        stream_id: &str,
        clip_id: &str,
        file_format: ClipKind,
        start_sec: f64,
        end_sec: f64,
    ) -> Result<String, base::Error> {
        if !(start_sec < end_sec) {
            base::bail!(InvalidArgument, base::msg!("start_sec must be < end_sec"));
        }
        let ext = file_format.extension();
        let src_key = format!("{channel}/{stream_id}/clips/{clip_id}.{ext}");
        let download_path = self.temp_dir.join(format!("{clip_id}.src.{ext}"));
        let _guard = TempFileGuard(download_path.clone());
        {
            let mut in_stream = self.store.get(&src_key).await.map_err(base::Error::from)?;
            let mut f = tokio::fs::File::create(&download_path)
                .await
                .map_err(|e| base::err!(e, base::msg!("creating download temp file")))?;
            while let Some(chunk) = in_stream.next().await {
                let chunk = chunk.map_err(|e| base::err!(e, base::msg!("reading clip {src_key}")))?;
                f.write_all(&chunk)
                    .await
                    .map_err(|e| base::err!(e, base::msg!("writing download temp file")))?;
            }
            f.flush().await.map_err(|e| base::err!(e, base::msg!("flushing download temp file")))?;
        }

        let new_clip_id = base::strutil::new_id();
        let out_path = self.temp_dir.join(format!("{new_clip_id}.{ext}"));
        let _out_guard = TempFileGuard(out_path.clone());
        crate::transcode::remux_or_trim(&download_path, &out_path, Some((start_sec, end_sec))).await?;

        let dst_key = format!("{channel}/{stream_id}/clips/{new_clip_id}.{ext}");
        let content_type = crate::storage::content_type_for_extension(ext);
        self.upload(&out_path, &dst_key, content_type).await?;

        Ok(new_clip_id)
    }

    async fn upload(&self, path: &std::path::Path, key: &str, content_type: &str) -> Result<(), base::Error> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| base::err!(e, base::msg!("reading {}", path.display())))?;
        let len = bytes.len() as u64;
        let stream: crate::storage::ByteStream =
            Box::pin(futures::stream::once(async move { Ok(Bytes::from(bytes)) }));
        self.store
            .save(key, stream, len, content_type)
            .await
            .map_err(base::Error::from)?;
        Ok(())
    }
}

struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;

    async fn seeded() -> (ClipService, tempfile::TempDir, tempfile::TempDir) {
        let db = Database::open_in_memory().unwrap();
        db.ensure_channel("chan", "base", 3).await.unwrap();
        db.upsert_stream(db::Stream {
            channel_key: "chan".to_string(),
            stream_id: "s1".to_string(),
            title: "t".to_string(),
            start_time: "0".to_string(),
            is_live: true,
            media_type: db::MediaType::Audio,
            activated_time: 0,
        })
        .await
        .unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let temp_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(store_dir.path().to_path_buf(), None));

        for i in 0..3 {
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
            let file_id = format!("f{i}");
            db.set_media_available("chan", "s1", i, &file_id, true).await.unwrap();
            let key = format!("chan/s1/raw/{file_id}.raw");
            let body: crate::storage::ByteStream =
                Box::pin(futures::stream::once(async move { Ok(Bytes::from_static(b"raw-bytes")) }));
            store.save(&key, body, 9, "application/octet-stream").await.unwrap();
        }

        let svc = ClipService::new(db, store, temp_dir.path().to_path_buf(), 30);
        (svc, store_dir, temp_dir)
    }

    #[tokio::test]
    async fn rejects_range_exceeding_max_clip_size() {
        let (svc, _s, _t) = seeded().await;
        let svc = ClipService::new(svc.db.clone(), svc.store.clone(), svc.temp_dir.clone(), 2);
        let err = svc.create_clip("chan", "s1", 0, 2, ClipKind::Mp3).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn rejects_incomplete_range() {
        let (svc, _s, _t) = seeded().await;
        let err = svc.create_clip("chan", "s1", 0, 5, ClipKind::Mp3).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn mp4_requires_video_media_type() {
        let (svc, _s, _t) = seeded().await;
        let err = svc.create_clip("chan", "s1", 0, 1, ClipKind::Mp4).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::OutOfRange);
    }

    #[tokio::test]
    async fn rejects_negative_start_line() {
        let (svc, _s, _t) = seeded().await;
        let err = svc.create_clip("chan", "s1", -1, 1, ClipKind::Mp3).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::InvalidArgument);
    }
}
