/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Error types returned by the restart-capable server.

use std::io;

use thiserror::Error;
use tokio::signal::unix::SignalKind;

/// Errors surfaced by server setup, serving, and upgrade coordination.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Binding a fresh listening socket failed.
    #[error("failed to bind `{addr}`: {source}")]
    Bind {
        /// The address the bind was attempted on.
        addr: String,
        /// The underlying bind error.
        source: io::Error,
    },

    /// Adopting an inherited listening socket failed.
    ///
    /// Restart children never fall back to a fresh bind: a misconfigured
    /// upgrade surfaces as a child exit while the parent continues serving.
    #[error("failed to adopt inherited listener at fd {fd}: {source}")]
    InheritedListener {
        /// The descriptor the adoption was attempted on.
        fd: i32,
        /// The underlying error.
        source: io::Error,
    },

    /// Loading or parsing the TLS certificate/key pair failed.
    #[error("invalid TLS certificate or key: {0}")]
    Tls(String),

    /// `serve` was called before a listener was acquired.
    #[error("server has no listener; call `listen` first")]
    NotListening,

    /// The listener was already closed.
    #[error("listener already closed")]
    ListenerClosed,

    /// Another upgrade already spawned a replacement process.
    ///
    /// Returned non-fatally; at most one fork happens per parent lifetime.
    #[error("another process already forked, ignoring this request")]
    AlreadyForked,

    /// A hook was registered for a signal outside the hookable set.
    #[error("signal {0:?} is not hookable")]
    UnsupportedSignal(SignalKind),

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
