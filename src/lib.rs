/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Zero-downtime restarts for hyper-based HTTP and HTTPS servers.
//!
//! Send a running server SIGHUP and it spawns a replacement process that
//! inherits the listening sockets and starts accepting on them immediately.
//! The replacement then signals the old process with SIGTERM, which stops
//! accepting, finishes its in-flight requests, and exits. Clients see no
//! dropped connections and no refused handshakes across the swap, because
//! there is never a moment when nobody holds the listening socket.
//!
//! ## How it works
//!
//! ```text
//! SIGHUP ──▶ parent spawns child with listener FDs at 3, 4, …
//!                 child adopts FDs, accepts, sends SIGTERM to parent
//! SIGTERM ──▶ parent closes listener, drains tracked connections, exits
//! ```
//!
//! Every accepted connection is counted; graceful shutdown waits for that
//! count to reach zero. If a drain deadline is configured (the default is
//! one minute, see [`config::set_default_hammer_time`]), a "hammer" task
//! force-releases the wait once the deadline passes so a stuck handler
//! cannot pin the old process forever.
//!
//! ## Example
//!
//! ```no_run
//! use std::convert::Infallible;
//!
//! use bytes::Bytes;
//! use http_body_util::Full;
//! use tower::service_fn;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), endless::Error> {
//!     let service = service_fn(|_req: http::Request<hyper::body::Incoming>| async {
//!         Ok::<_, Infallible>(http::Response::new(Full::new(Bytes::from("hello"))))
//!     });
//!     endless::listen_and_serve("127.0.0.1:4242", service).await
//! }
//! ```
//!
//! Signals understood by every server instance: SIGHUP forks the
//! replacement, SIGINT and SIGTERM begin a graceful shutdown, SIGUSR2
//! releases the drain immediately, SIGUSR1 and SIGTSTP only run registered
//! hooks. Hooks can be attached before or after the built-in handling with
//! [`Server::register_signal_hook`].

pub mod config;
pub mod error;
mod fork;
pub mod listener;
mod registry;
pub mod signal;
mod server;
mod timeout;
pub mod tls;

pub use self::error::Error;
pub use self::fork::{ENV_CONTINUE, ENV_SOCKET_ORDER};
pub use self::listener::{ConnCounter, TrackedStream, TrackingListener};
pub use self::server::{listen_and_serve, listen_and_serve_tls, Server, State};
pub use self::signal::{Phase, HOOKABLE_SIGNALS};
pub use self::timeout::TimeoutStream;

// The signal identifiers used throughout the public API.
pub use tokio::signal::unix::SignalKind;
