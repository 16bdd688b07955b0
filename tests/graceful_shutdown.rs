/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! SIGTERM begins a graceful shutdown: the listener closes immediately but
//! in-flight requests run to completion before the server returns.
//!
//! This file stays a single test: the signal is raised at the whole process,
//! so a second concurrently running server in this binary would drain too.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::oneshot;
use tower::service_fn;

use endless::Server;

async fn slow(_request: http::Request<hyper::body::Incoming>) -> Result<http::Response<Full<Bytes>>, Infallible> {
    tokio::time::sleep(Duration::from_millis(400)).await;
    Ok(http::Response::builder()
        .status(200)
        .body(Full::new(Bytes::from("finished late")))
        .unwrap())
}

#[tokio::test]
async fn sigterm_drains_in_flight_requests_before_returning() {
    let (addr_tx, addr_rx) = oneshot::channel();
    let mut server = Server::new("127.0.0.1:0", service_fn(slow));
    server.set_before_begin(move |bound| {
        let _ = addr_tx.send(bound.to_string());
    });
    let server_handle = tokio::spawn(server.listen_and_serve());
    let addr = addr_rx.await.expect("server starts");

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
    let request = http::Request::builder()
        .uri(format!("http://{addr}/slow"))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let in_flight = tokio::spawn(async move { client.request(request).await });

    // Let the request reach the handler, then ask the server to stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    kill(Pid::this(), Signal::SIGTERM).expect("signal self");

    // The slow request still completes with a full response.
    let response = in_flight.await.unwrap().expect("in-flight request survives shutdown");
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "finished late");

    // And only then does the serve call return.
    let result = tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .expect("server returns after the drain")
        .expect("server task does not panic");
    assert!(result.is_ok(), "drain-complete exit is clean: {result:?}");

    // The listener is gone; new connections are refused.
    let refused = tokio::net::TcpStream::connect(&addr).await;
    assert!(refused.is_err(), "listener should be closed after shutdown");
}
