/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! TLS support for restart-capable servers.
//!
//! TLS is an accept-time transform over the tracking listener: the listener
//! keeps handing out counted TCP connections (so its file descriptor stays
//! available for inheritance) and the handshake runs on the connection's own
//! task. A failed handshake closes that connection without disturbing the
//! accept loop.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::Error;
use crate::server::{Accept, ServerIo};

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Builds a rustls server configuration from a PEM certificate chain and
/// private key, making sure ALPN offers `http/1.1`.
pub fn server_config(cert_file: impl AsRef<Path>, key_file: impl AsRef<Path>) -> Result<Arc<ServerConfig>, Error> {
    let certs = load_certs(cert_file.as_ref())?;
    let key = load_key(key_file.as_ref())?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::Tls(err.to_string()))?;
    if !config.alpn_protocols.iter().any(|proto| proto == ALPN_HTTP1) {
        config.alpn_protocols.push(ALPN_HTTP1.to_vec());
    }
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|err| Error::Tls(format!("failed to read {}: {err}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(|err| Error::Tls(format!("invalid certificate in {}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|err| Error::Tls(format!("failed to read {}: {err}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| Error::Tls(format!("invalid private key in {}: {err}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Accept-time TLS handshake over tracked connections.
#[derive(Clone)]
pub(crate) struct TlsAccept {
    acceptor: TlsAcceptor,
}

impl TlsAccept {
    pub(crate) fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

impl Accept for TlsAccept {
    type Io = tokio_rustls::server::TlsStream<ServerIo>;

    fn accept(&self, io: ServerIo) -> impl Future<Output = io::Result<Self::Io>> + Send {
        self.acceptor.accept(io)
    }
}
