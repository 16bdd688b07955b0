/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The hammer abandons a drain that would otherwise never finish.
//!
//! Single test per file: the signal is process-wide.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tower::service_fn;

use endless::{config, Server};

/// A handler that never returns, holding its connection open forever.
async fn stuck(_request: http::Request<hyper::body::Incoming>) -> Result<http::Response<Full<Bytes>>, Infallible> {
    std::future::pending::<()>().await;
    unreachable!("the pending future never resolves")
}

#[tokio::test]
async fn hammer_releases_the_drain_after_its_deadline() {
    config::set_default_hammer_time(Some(Duration::from_millis(100)));

    let (addr_tx, addr_rx) = oneshot::channel();
    let mut server = Server::new("127.0.0.1:0", service_fn(stuck));
    server.set_before_begin(move |bound| {
        let _ = addr_tx.send(bound.to_string());
    });
    let server_handle = tokio::spawn(server.listen_and_serve());
    let addr = addr_rx.await.expect("server starts");

    // Park one connection inside the handler.
    let mut conn = tokio::net::TcpStream::connect(&addr).await.unwrap();
    conn.write_all(b"GET /stuck HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let begun = Instant::now();
    kill(Pid::this(), Signal::SIGTERM).expect("signal self");

    let result = tokio::time::timeout(Duration::from_secs(2), server_handle)
        .await
        .expect("hammer must release the drain")
        .expect("server task does not panic");
    assert!(result.is_ok(), "forced drain still exits cleanly: {result:?}");

    // The listener closed immediately and the hammer fired at its deadline,
    // well before any request-completion could have released the drain.
    assert!(
        begun.elapsed() < Duration::from_secs(1),
        "drain released in {:?}, expected roughly the 100ms deadline",
        begun.elapsed()
    );
}
