// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Installs the global `tracing` subscriber, grounded on the teacher's
//! `base::tracing_setup::install()`: an `EnvFilter` from `RUST_LOG`
//! (defaulting to `info`), human-readable output when stderr is a terminal,
//! JSON lines otherwise (for log aggregation in production deployments).

use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber. Call once, as early as
/// possible in `main`.
pub fn install() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let is_tty = std::io::stderr().is_terminal();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if is_tty {
        subscriber.init();
    } else {
        subscriber.json().flatten_event(true).init();
    }
}
