// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! YAML configuration (spec §6 "Config"), grounded on the teacher's
//! `cmds::run::config::ConfigFile` shape but read with `serde_yaml` rather
//! than `serde_json`, per the spec's explicit wire format.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_http_addr")]
    pub http_addr: std::net::SocketAddr,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_max_conn")]
    pub max_connections_per_channel: u32,
    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,
    #[serde(default = "default_max_clip_size")]
    pub max_clip_size: u32,
}

fn default_http_addr() -> std::net::SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/transcript-hub/db.sqlite3")
}

fn default_max_conn() -> u32 {
    10_000
}

fn default_reconciliation_interval_secs() -> u64 {
    8 * 3600
}

fn default_max_clip_size() -> u32 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(rename = "apiKey", default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
    #[serde(default = "default_cache_size_kb")]
    pub cache_size_kb: i64,
    #[serde(default = "default_temp_store")]
    pub temp_store: String,
    #[serde(default = "default_mmap_size_bytes")]
    pub mmap_size_bytes: i64,
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_synchronous() -> String {
    "NORMAL".to_string()
}
fn default_cache_size_kb() -> i64 {
    200 * 1024
}
fn default_temp_store() -> String {
    "MEMORY".to_string()
}
fn default_mmap_size_bytes() -> i64 {
    500 * 1024 * 1024
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            journal_mode: default_journal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
            synchronous: default_synchronous(),
            cache_size_kb: default_cache_size_kb(),
            temp_store: default_temp_store(),
            mmap_size_bytes: default_mmap_size_bytes(),
        }
    }
}

impl DatabaseConfig {
    pub fn to_tunables(&self) -> db::Tunables {
        db::Tunables {
            busy_timeout: std::time::Duration::from_millis(self.busy_timeout_ms),
            synchronous: self.synchronous.clone(),
            cache_size_kb: self.cache_size_kb,
            temp_store: self.temp_store.clone(),
            mmap_size_bytes: self.mmap_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local(LocalStorageConfig),
    R2(RemoteStorageConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(rename = "baseDir")]
    pub base_dir: PathBuf,
    #[serde(rename = "publicUrlBase", default)]
    pub public_url_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStorageConfig {
    pub bucket: String,
    pub region: String,
    #[serde(rename = "endpointUrl", default)]
    pub endpoint_url: Option<String>,
    #[serde(rename = "accessKeyId", default)]
    pub access_key_id: Option<String>,
    #[serde(rename = "secretAccessKey", default)]
    pub secret_access_key: Option<String>,
    #[serde(rename = "publicUrlBase", default)]
    pub public_url_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(rename = "numPastStreams")]
    pub num_past_streams: i64,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config, base::Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            base::err!(e, base::msg!("unable to read config file {}", path.display()))
        })?;
        let cfg: Config = serde_yaml::from_str(&raw).map_err(|e| {
            base::err!(e, base::msg!("unable to parse config file {}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), base::Error> {
        if self.channels.is_empty() {
            base::bail!(InvalidArgument, base::msg!("config must declare at least one channel"));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.channels {
            if c.name.is_empty() {
                base::bail!(InvalidArgument, base::msg!("channel name must not be empty"));
            }
            if !seen.insert(c.name.clone()) {
                base::bail!(InvalidArgument, base::msg!("duplicate channel name {:?}", c.name));
            }
            if c.num_past_streams < 0 {
                base::bail!(
                    InvalidArgument,
                    base::msg!("numPastStreams must be non-negative for channel {:?}", c.name)
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_storage_config() {
        let yaml = r#"
credentials:
  apiKey: secret123
storage:
  type: local
  baseDir: /var/media
channels:
  - name: radio-one
    numPastStreams: 3
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.credentials.api_key.as_deref(), Some("secret123"));
        match cfg.storage {
            StorageConfig::Local(l) => assert_eq!(l.base_dir, PathBuf::from("/var/media")),
            StorageConfig::R2(_) => panic!("expected local"),
        }
        assert_eq!(cfg.channels[0].name, "radio-one");
    }

    #[test]
    fn rejects_duplicate_channel_names() {
        let yaml = r#"
storage:
  type: local
  baseDir: /var/media
channels:
  - name: dup
    numPastStreams: 1
  - name: dup
    numPastStreams: 2
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }
}
