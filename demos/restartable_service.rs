/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! A small service to exercise the restart cycle by hand.
//!
//! ```text
//! cargo run --example restartable-service -- 127.0.0.1:4242
//! curl http://127.0.0.1:4242/            # note the pid
//! curl http://127.0.0.1:4242/slow &      # a request that takes 10 seconds
//! kill -HUP <pid>                        # spawn the replacement
//! curl http://127.0.0.1:4242/            # a new pid answers immediately
//! wait                                   # the slow request still completes
//! ```
//!
//! The old process exits once the slow request finishes (or after the drain
//! deadline), while the new one keeps serving the same port.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use tower::service_fn;

use endless::{config, Phase, Server, SignalKind};

async fn handle(request: http::Request<hyper::body::Incoming>) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let pid = std::process::id();
    let body = match request.uri().path() {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(10)).await;
            format!("pid {pid} finished the slow request\n")
        }
        _ => format!("pid {pid} says hello\n"),
    };
    Ok(http::Response::new(Full::new(Bytes::from(body))))
}

#[tokio::main]
async fn main() -> Result<(), endless::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,endless=debug")),
        )
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:4242".to_string());
    config::set_default_hammer_time(Some(Duration::from_secs(30)));

    let server = Server::new(addr, service_fn(handle));
    server.register_signal_hook(Phase::Pre, SignalKind::hangup(), || {
        tracing::info!("upgrade requested");
    })?;
    server.register_signal_hook(Phase::Post, SignalKind::terminate(), || {
        tracing::info!("drain underway");
    })?;

    server.listen_and_serve().await
}
