// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Graceful-shutdown signal, grounded on the teacher's `base::shutdown`
//! broadcast-based cancellation, generalized to the single process-wide
//! signal spec §5 describes: the listener closes, in-flight requests drain
//! under a bounded deadline, the reconciliation tick is cancelled, and the
//! database is closed last.

use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Receiver(watch::Receiver<bool>);

impl Shutdown {
    pub fn new() -> (Self, Receiver) {
        let (tx, rx) = watch::channel(false);
        (Shutdown { tx }, Receiver(rx))
    }

    /// Trips the signal. Idempotent: subsequent calls are no-ops.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("shutting down")
    }
}

impl std::error::Error for ShutdownError {}

impl Receiver {
    /// Returns immediately if shutdown has already been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.borrow() {
            return Err(ShutdownError);
        }
        Ok(())
    }

    /// Resolves once shutdown is requested. Used as the cancellation arm of
    /// a `tokio::select!` in the reconciliation tick (§4.F) and the
    /// connection-accept loop (§4.E).
    pub async fn cancelled(&mut self) {
        // `changed()` only errors if the sender was dropped, which for us
        // means the process is tearing down anyway.
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.0.borrow()
    }
}

/// Runs `op` to completion, or gives it up to `deadline` more once shutdown
/// is requested before abandoning it. Used to drain in-flight requests with
/// the bounded deadline spec §5 requires.
pub async fn drain_with_deadline<F>(mut rx: Receiver, deadline: Duration, op: F)
where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(op);
    tokio::select! {
        _ = &mut op => {}
        _ = rx.cancelled() => {
            let _ = tokio::time::timeout(deadline, op).await;
        }
    }
}
