// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! S3-compatible remote object store (spec §4.A "Remote").
//!
//! Grounded on `libs/remote_storage/src/s3_bucket.rs`'s `S3Bucket`: a client
//! built once at startup with an optional custom endpoint (for R2 and other
//! S3-compatible providers) and `force_path_style`, used for get/put/delete/
//! list. Credential resolution is simplified relative to the teacher's
//! multi-provider chain since this system only ever runs against one
//! configured bucket rather than arbitrary AWS accounts.

use super::{content_type_for_extension, ByteStream, ObjectStore, StorageError};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::Client;
use futures::StreamExt;

pub struct RemoteStore {
    client: Client,
    bucket: String,
    public_url_base: Option<String>,
}

impl RemoteStore {
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        public_url_base: Option<String>,
    ) -> Self {
        let region_provider = aws_config::Region::new(region);
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider);
        if let (Some(key), Some(secret)) = (&access_key_id, &secret_access_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "transcript-hub-config",
            ));
        }
        let shared_config = loader.load().await;
        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(endpoint) = endpoint_url {
            s3_builder = s3_builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(s3_builder.build());
        RemoteStore {
            client,
            bucket,
            public_url_base,
        }
    }

    fn extension_of(key: &str) -> &str {
        key.rsplit('.').next().unwrap_or("")
    }
}

#[async_trait]
impl ObjectStore for RemoteStore {
    async fn save(
        &self,
        key: &str,
        mut body: ByteStream,
        _length: u64,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                StorageError::transient(base::err!(e, base::msg!("reading upload body")))
            })?;
            buf.extend_from_slice(&chunk);
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(SdkByteStream::from(buf))
            .send()
            .await
            .map_err(|e| StorageError::transient(base::err!(e, base::msg!("s3 put_object {key}"))))?;
        Ok(self.get_url(key))
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = base::msg!("s3 get_object {key}");
                StorageError::transient(base::err!(e, msg))
            })?;
        let stream = out.body.map(|r| r.map_err(std::io::Error::other));
        Ok(Box::pin(stream))
    }

    fn get_url(&self, key: &str) -> String {
        match &self.public_url_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::transient(base::err!(e, base::msg!("s3 delete_object {key}"))))?;
        Ok(())
    }

    /// No-op: bulk recursive deletion of a remote prefix isn't cheap enough
    /// to do eagerly on every stream deactivation, so remote retention
    /// instead relies on periodic reconciliation (spec §4.F).
    async fn delete_folder(&self, _prefix: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn stream_exists(&self, prefix: &str) -> Result<bool, StorageError> {
        let out = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| StorageError::transient(base::err!(e, base::msg!("s3 list_objects_v2 {prefix}"))))?;
        Ok(out.contents().first().is_some())
    }

    fn is_local(&self) -> bool {
        false
    }
}

#[allow(dead_code)]
fn content_type_for_key(key: &str) -> &'static str {
    content_type_for_extension(RemoteStore::extension_of(key))
}
