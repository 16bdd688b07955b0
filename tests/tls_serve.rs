/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! HTTPS serving with a self-signed certificate.

use std::convert::Infallible;
use std::io::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tower::service_fn;

use endless::Server;

async fn hello(_request: http::Request<hyper::body::Incoming>) -> Result<http::Response<Full<Bytes>>, Infallible> {
    Ok(http::Response::builder()
        .status(200)
        .body(Full::new(Bytes::from("secure hello")))
        .unwrap())
}

fn write_temp(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn serves_https_with_a_self_signed_certificate() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_file = write_temp(&cert.cert.pem());
    let key_file = write_temp(&cert.key_pair.serialize_pem());

    let (addr_tx, addr_rx) = oneshot::channel();
    let mut server = Server::new("127.0.0.1:0", service_fn(hello));
    server.set_before_begin(move |bound| {
        let _ = addr_tx.send(bound.to_string());
    });
    tokio::spawn(async move {
        let result = server.listen_and_serve_tls(cert_file.path(), key_file.path()).await;
        drop((cert_file, key_file));
        result
    });
    let addr = addr_rx.await.expect("server starts");

    // A client that trusts exactly the server's certificate.
    let mut roots = RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("handshake against inherited-capable TLS listener");

    tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "got response: {response}");
    assert!(response.ends_with("secure hello"), "got response: {response}");
}

#[tokio::test]
async fn a_bad_certificate_pair_is_a_setup_error() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_file = write_temp(&cert.cert.pem());

    let server = Server::new("127.0.0.1:0", service_fn(hello));
    let err = server
        .listen_and_serve_tls(cert_file.path(), cert_file.path())
        .await
        .expect_err("a certificate file is not a key file");
    assert!(matches!(err, endless::Error::Tls(_)), "got {err:?}");
}
