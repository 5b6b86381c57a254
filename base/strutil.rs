// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Small string/id helpers shared by the db crate and the server binary.

use base64::Engine as _;

/// Generates a fresh opaque identifier: 22 url-safe, no-padding base64
/// characters, the same shape spec §4.C requires for a `file_id` and §4.G
/// for a `clip_id`.
///
/// A UUIDv7's 16 bytes base64url-no-pad-encode to exactly 22 characters, so
/// this reuses the `uuid`/`base64` crates the teacher already depends on
/// rather than pulling in a dedicated id-generation crate. UUIDv7 is time
/// ordered, which is a harmless (if unused) bonus for log correlation.
pub fn new_id() -> String {
    let uuid = uuid::Uuid::now_v7();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

/// Parses a worker-supplied `start_time` string (decimal seconds-since-epoch,
/// per spec §3) into an integer, returning `None` on any parse failure so
/// callers can fall back to "now" per spec §4.D.1 step 3.
pub fn parse_epoch_secs(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_22_chars() {
        let id = new_id();
        assert_eq!(id.len(), 22);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn parse_epoch_secs_handles_garbage() {
        assert_eq!(parse_epoch_secs("1700000000"), Some(1_700_000_000));
        assert_eq!(parse_epoch_secs(""), None);
        assert_eq!(parse_epoch_secs("not-a-number"), None);
        assert_eq!(parse_epoch_secs("  42  "), Some(42));
    }
}
