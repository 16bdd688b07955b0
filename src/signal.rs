/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Signal handling for restartable servers.
//!
//! Each server runs one dispatch task fed by a bounded channel. One forwarder
//! task per hookable signal pushes deliveries into the channel; a full channel
//! drops the delivery rather than blocking, the same way the kernel collapses
//! pending signals. Dispatch is strictly serial: the pre hooks for a signal
//! run to completion before the signal's action, the action before the post
//! hooks, and one signal is fully handled before the next is looked at. A
//! slow hook therefore delays later signals, which the channel buffer absorbs.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::server::{hammer, shutdown, ServerShared};

/// Hook placement relative to a signal's built-in action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Run before the signal's action.
    Pre,
    /// Run after the signal's action.
    Post,
}

/// The closed set of signals that drive the server lifecycle and accept
/// user hooks: HUP, USR1, USR2, INT, TERM, TSTP.
pub const HOOKABLE_SIGNALS: [SignalKind; 6] = [
    SignalKind::hangup(),
    SignalKind::user_defined1(),
    SignalKind::user_defined2(),
    SignalKind::interrupt(),
    SignalKind::terminate(),
    SignalKind::from_raw(libc::SIGTSTP),
];

/// Sized so a signal storm does not lose deliveries while a hook is running.
const SIGNAL_BUFFER: usize = 100;

pub(crate) fn is_hookable(kind: SignalKind) -> bool {
    HOOKABLE_SIGNALS.contains(&kind)
}

/// Installs the signal handlers and starts this server's dispatch task.
pub(crate) fn spawn_handler(shared: Arc<ServerShared>) {
    let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
    for kind in HOOKABLE_SIGNALS {
        match signal(kind) {
            Ok(mut stream) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        let _ = tx.try_send(kind);
                    }
                });
            }
            Err(err) => {
                tracing::error!(signal = ?kind, error = %err, "failed to install signal handler");
            }
        }
    }
    tokio::spawn(dispatch(shared, rx));
}

async fn dispatch(shared: Arc<ServerShared>, mut rx: mpsc::Receiver<SignalKind>) {
    let pid = std::process::id();
    while let Some(sig) = rx.recv().await {
        shared.run_hooks(Phase::Pre, sig);
        match sig.as_raw_value() {
            libc::SIGHUP => {
                tracing::info!(pid, "received SIGHUP, spawning replacement process");
                if let Err(err) = crate::fork::fork() {
                    tracing::error!(pid, error = %err, "upgrade failed");
                }
            }
            libc::SIGUSR1 => {
                tracing::info!(pid, "received SIGUSR1");
            }
            libc::SIGUSR2 => {
                tracing::info!(pid, "received SIGUSR2, releasing drain immediately");
                hammer(&shared, Duration::ZERO).await;
            }
            libc::SIGINT => {
                tracing::info!(pid, "received SIGINT, shutting down");
                shutdown(&shared);
            }
            libc::SIGTERM => {
                tracing::info!(pid, "received SIGTERM, shutting down");
                shutdown(&shared);
            }
            libc::SIGTSTP => {
                tracing::info!(pid, "received SIGTSTP");
            }
            other => {
                tracing::debug!(pid, signal = other, "ignoring unhandled signal");
            }
        }
        shared.run_hooks(Phase::Post, sig);
    }
}
