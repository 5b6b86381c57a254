// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! External transcoder invocation (design note §9: "treat as an injectable
//! function").
//!
//! The teacher links against its own `ffmpeg` crate, a native-linked wrapper
//! with no build system available here; this module instead shells out to
//! the `ffmpeg`/`ffprobe` binaries via `tokio::process::Command`, the same
//! external-process idiom `src/streamer.rs` uses for its own subprocess
//! invocations.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

async fn run_ffmpeg(args: &[&std::ffi::OsStr]) -> Result<(), base::Error> {
    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-loglevel")
        .arg("error")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| base::err!(e, base::msg!("spawning ffmpeg")))?;
    if !output.status.success() {
        base::bail!(
            Internal,
            base::msg!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )
        );
    }
    Ok(())
}

/// Transcodes `src` (spec §4.C step 3: raw chunk) to an AAC-in-MP4 (`.m4a`)
/// container at `dst`.
pub async fn transcode_to_m4a(src: &Path, dst: &Path) -> Result<(), base::Error> {
    run_ffmpeg(&[
        std::ffi::OsStr::new("-i"),
        src.as_os_str(),
        std::ffi::OsStr::new("-vn"),
        std::ffi::OsStr::new("-c:a"),
        std::ffi::OsStr::new("aac"),
        std::ffi::OsStr::new("-f"),
        std::ffi::OsStr::new("mp4"),
        dst.as_os_str(),
    ])
    .await
}

/// Extracts a single 480-px-wide JPEG frame from `src` (spec §4.C step 5,
/// video streams only).
pub async fn extract_frame(src: &Path, dst: &Path) -> Result<(), base::Error> {
    run_ffmpeg(&[
        std::ffi::OsStr::new("-i"),
        src.as_os_str(),
        std::ffi::OsStr::new("-frames:v"),
        std::ffi::OsStr::new("1"),
        std::ffi::OsStr::new("-vf"),
        std::ffi::OsStr::new("scale=480:-1"),
        dst.as_os_str(),
    ])
    .await
}

/// Remuxes/transcodes `src` into `dst`'s container (inferred from its
/// extension), trimming to `[start_sec, end_sec)` when both are given (spec
/// §4.G clip/trim).
pub async fn remux_or_trim(
    src: &Path,
    dst: &Path,
    range: Option<(f64, f64)>,
) -> Result<(), base::Error> {
    let mut args: Vec<std::ffi::OsString> = Vec::new();
    if let Some((start, _end)) = range {
        args.push("-ss".into());
        args.push(format!("{start}").into());
    }
    args.push("-i".into());
    args.push(src.as_os_str().to_owned());
    if let Some((start, end)) = range {
        args.push("-t".into());
        args.push(format!("{}", end - start).into());
    }
    let is_mp4 = dst.extension().and_then(|e| e.to_str()) == Some("mp4");
    if is_mp4 {
        args.push("-c".into());
        args.push("copy".into());
    } else {
        args.push("-c:a".into());
        args.push(codec_for(dst).into());
    }
    args.push(dst.as_os_str().to_owned());
    let refs: Vec<&std::ffi::OsStr> = args.iter().map(|a| a.as_os_str()).collect();
    run_ffmpeg(&refs).await
}

fn codec_for(dst: &Path) -> &'static str {
    match dst.extension().and_then(|e| e.to_str()) {
        Some("mp3") => "libmp3lame",
        _ => "aac",
    }
}
