/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Process-wide server defaults.
//!
//! These tunables are snapshotted into every [`Server`](crate::Server) at
//! construction time, with the exception of the hammer deadline, which is
//! read when a graceful shutdown begins. They live for the whole process,
//! like the restart environment they configure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

static DEFAULT_READ_TIMEOUT: RwLock<Option<Duration>> = RwLock::new(None);
static DEFAULT_WRITE_TIMEOUT: RwLock<Option<Duration>> = RwLock::new(None);
static DEFAULT_MAX_HEADER_BYTES: AtomicUsize = AtomicUsize::new(0);

// After an upgrade the parent finishes ongoing requests before exiting.
// `None` disables the forced drain entirely.
static DEFAULT_HAMMER_TIME: RwLock<Option<Duration>> = RwLock::new(Some(Duration::from_secs(60)));

/// Sets the per-operation read deadline applied to every new server's
/// connections. `None` disables the deadline.
pub fn set_default_read_timeout(timeout: Option<Duration>) {
    *DEFAULT_READ_TIMEOUT.write().unwrap() = timeout;
}

/// Returns the current default read deadline.
pub fn default_read_timeout() -> Option<Duration> {
    *DEFAULT_READ_TIMEOUT.read().unwrap()
}

/// Sets the per-operation write deadline applied to every new server's
/// connections. `None` disables the deadline.
pub fn set_default_write_timeout(timeout: Option<Duration>) {
    *DEFAULT_WRITE_TIMEOUT.write().unwrap() = timeout;
}

/// Returns the current default write deadline.
pub fn default_write_timeout() -> Option<Duration> {
    *DEFAULT_WRITE_TIMEOUT.read().unwrap()
}

/// Sets the maximum HTTP/1 header buffer size for every new server.
/// `0` keeps hyper's built-in default.
pub fn set_default_max_header_bytes(bytes: usize) {
    DEFAULT_MAX_HEADER_BYTES.store(bytes, Ordering::Relaxed);
}

/// Returns the maximum HTTP/1 header buffer size. `0` means hyper's default.
pub fn default_max_header_bytes() -> usize {
    DEFAULT_MAX_HEADER_BYTES.load(Ordering::Relaxed)
}

/// Sets how long a graceful shutdown waits for in-flight connections before
/// the drain is forcibly released. `None` disables the forced release, in
/// which case a handler that never returns keeps the process alive forever.
pub fn set_default_hammer_time(deadline: Option<Duration>) {
    *DEFAULT_HAMMER_TIME.write().unwrap() = deadline;
}

/// Returns the configured hammer deadline.
pub fn default_hammer_time() -> Option<Duration> {
    *DEFAULT_HAMMER_TIME.read().unwrap()
}
