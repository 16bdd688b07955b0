/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Restart-capable HTTP server instances.
//!
//! A [`Server`] owns one listening address and serves it with a Tower service
//! through hyper. It differs from a plain serve loop in three ways: every
//! accepted connection is counted so shutdown can drain precisely, the six
//! lifecycle signals are handled per instance, and on SIGHUP the listening
//! socket is handed to a freshly spawned replacement process so the address
//! never stops accepting.
//!
//! ```ignore
//! use std::convert::Infallible;
//! use tower::service_fn;
//!
//! let service = service_fn(|_req| async {
//!     Ok::<_, Infallible>(http::Response::new(
//!         http_body_util::Full::new(bytes::Bytes::from("hello")),
//!     ))
//! });
//! endless::listen_and_serve("127.0.0.1:4242", service).await?;
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tower::Service;

use crate::config;
use crate::error::Error;
use crate::fork;
use crate::listener::{handle_accept_error, ConnCounter, TrackedStream, TrackingListener};
use crate::registry;
use crate::signal::{self, Phase};
use crate::timeout::TimeoutStream;
use crate::tls::TlsAccept;

/// Lifecycle of a server instance. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Created, not yet accepting.
    Init,
    /// Accepting connections.
    Running,
    /// Listener closed, draining in-flight connections.
    ShuttingDown,
    /// Drain complete.
    Terminated,
}

type SignalHook = Box<dyn Fn() + Send + Sync>;
type BeforeBegin = Box<dyn FnOnce(&str) + Send + Sync>;

/// The connection type handed to the per-connection accept step.
pub(crate) type ServerIo = TimeoutStream<TrackedStream>;

/// Per-connection setup run on the connection's own task, after the tracked
/// TCP accept. This is where the TLS handshake happens, so a slow or broken
/// handshake cannot stall the accept loop.
pub(crate) trait Accept: Clone + Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self, io: ServerIo) -> impl Future<Output = io::Result<Self::Io>> + Send;
}

/// Plaintext connections pass through untouched.
#[derive(Clone)]
pub(crate) struct DirectAccept;

impl Accept for DirectAccept {
    type Io = ServerIo;

    fn accept(&self, io: ServerIo) -> impl Future<Output = io::Result<Self::Io>> + Send {
        std::future::ready(Ok(io))
    }
}

/// State shared between a server, its signal dispatch task, and the
/// process-wide registry.
pub(crate) struct ServerShared {
    addr: String,
    is_child: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_header_bytes: usize,
    state: RwLock<State>,
    counter: Arc<ConnCounter>,
    listener: RwLock<Option<Arc<TrackingListener>>>,
    hooks: RwLock<HashMap<(Phase, i32), Vec<SignalHook>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerShared {
    fn new(addr: String, is_child: bool) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            addr,
            is_child,
            read_timeout: config::default_read_timeout(),
            write_timeout: config::default_write_timeout(),
            max_header_bytes: config::default_max_header_bytes(),
            state: RwLock::new(State::Init),
            counter: ConnCounter::new(),
            listener: RwLock::new(None),
            hooks: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    pub(crate) fn state(&self) -> State {
        *self.state.read().expect("server state lock poisoned")
    }

    fn set_state(&self, next: State) {
        let mut state = self.state.write().expect("server state lock poisoned");
        if next > *state {
            *state = next;
        }
    }

    fn set_listener(&self, listener: Arc<TrackingListener>) {
        *self.listener.write().expect("listener slot lock poisoned") = Some(listener);
    }

    fn listener(&self) -> Option<Arc<TrackingListener>> {
        self.listener.read().expect("listener slot lock poisoned").clone()
    }

    /// Closes the listener slot. The accept loop notices through the
    /// shutdown channel and releases the socket.
    fn close_listener(&self) -> Result<(), Error> {
        let listener = self
            .listener
            .write()
            .expect("listener slot lock poisoned")
            .take()
            .ok_or(Error::ListenerClosed)?;
        listener.close().map_err(|_| Error::ListenerClosed)
    }

    /// Duplicates the listening descriptor for handoff.
    pub(crate) fn listener_file(&self, min_fd: RawFd) -> Result<OwnedFd, Error> {
        let listener = self.listener().ok_or(Error::NotListening)?;
        Ok(listener.file(min_fd)?)
    }

    fn register_hook(&self, phase: Phase, kind: SignalKind, hook: SignalHook) -> Result<(), Error> {
        if !signal::is_hookable(kind) {
            return Err(Error::UnsupportedSignal(kind));
        }
        self.hooks
            .write()
            .expect("signal hook table lock poisoned")
            .entry((phase, kind.as_raw_value()))
            .or_default()
            .push(hook);
        Ok(())
    }

    pub(crate) fn run_hooks(&self, phase: Phase, kind: SignalKind) {
        let hooks = self.hooks.read().expect("signal hook table lock poisoned");
        if let Some(list) = hooks.get(&(phase, kind.as_raw_value())) {
            for hook in list {
                hook();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(addr: &str) -> Arc<Self> {
        Self::new(addr.to_string(), false)
    }
}

/// An HTTP/HTTPS server that survives binary upgrades.
///
/// Create one with [`Server::new`], optionally register signal hooks, then
/// call [`listen_and_serve`](Server::listen_and_serve) or
/// [`listen_and_serve_tls`](Server::listen_and_serve_tls). Both return only
/// after the listener has closed and every tracked connection has finished
/// (or the hammer gave up waiting).
pub struct Server<S> {
    shared: Arc<ServerShared>,
    service: S,
    before_begin: Option<BeforeBegin>,
}

impl<S> Server<S> {
    /// Creates a server for `addr` and registers it process-wide.
    ///
    /// An empty address serves `":http"` (or `":https"` for the TLS path);
    /// a bare `":port"` binds all interfaces. Whether this process is a
    /// restart child is captured here, from `ENDLESS_CONTINUE`.
    pub fn new(addr: impl Into<String>, service: S) -> Self {
        let addr = addr.into();
        let socket_order = std::env::var(fork::ENV_SOCKET_ORDER).unwrap_or_default();
        let is_child = std::env::var(fork::ENV_CONTINUE)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        tracing::debug!(
            is_child,
            pid = std::process::id(),
            ppid = nix::unistd::getppid().as_raw(),
            addr = %addr,
            "creating restartable server"
        );

        let shared = ServerShared::new(addr.clone(), is_child);
        registry::write().register(addr, Arc::clone(&shared), &socket_order);

        Server {
            shared,
            service,
            before_begin: Some(Box::new(|addr: &str| {
                tracing::info!(pid = std::process::id(), addr, "beginning to serve");
            })),
        }
    }

    /// Replaces the callback invoked with the bound address immediately
    /// before accepting begins. The default logs the pid and address.
    pub fn set_before_begin<F>(&mut self, f: F)
    where
        F: FnOnce(&str) + Send + Sync + 'static,
    {
        self.before_begin = Some(Box::new(f));
    }

    /// Registers `hook` to run in the given [`Phase`] of handling `signal`.
    ///
    /// Hooks for the same phase and signal run in registration order. Only
    /// the signals in [`HOOKABLE_SIGNALS`](crate::signal::HOOKABLE_SIGNALS)
    /// are accepted.
    pub fn register_signal_hook<F>(&self, phase: Phase, signal: SignalKind, hook: F) -> Result<(), Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.register_hook(phase, signal, Box::new(hook))
    }

    /// The address the listener is actually bound to, once listening.
    /// With a `:0` address this is where the kernel-assigned port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener().and_then(|l| l.local_addr().ok())
    }

    /// Number of accepted connections that have not yet closed.
    pub fn outstanding(&self) -> usize {
        self.shared.counter.outstanding()
    }

    /// Whether this process is a restart continuation of an older parent.
    pub fn is_child(&self) -> bool {
        self.shared.is_child
    }

    /// Acquires the listening socket without starting to serve.
    ///
    /// In a parent this binds fresh. In a restart child it adopts the
    /// inherited descriptor for this address's slot; there is deliberately no
    /// fallback to a fresh bind, so a misconfigured upgrade shows up as a
    /// child that exits while the parent keeps serving.
    pub async fn listen(&self) -> Result<(), Error> {
        self.acquire_listener("http").await
    }

    async fn acquire_listener(&self, default_service: &str) -> Result<(), Error> {
        let shared = &self.shared;
        let listener = if shared.is_child {
            let offset = registry::read().offset(&shared.addr).unwrap_or(0);
            let fd = fork::inherited_fd(offset);
            adopt_listener(fd)?
        } else {
            let addr = normalize_addr(&shared.addr, default_service);
            TcpListener::bind(&addr)
                .await
                .map_err(|source| Error::Bind { addr, source })?
        };
        let tracking = Arc::new(TrackingListener::new(listener, Arc::clone(&shared.counter)));
        shared.set_listener(tracking);
        Ok(())
    }

    /// Serves plaintext HTTP until drained. See [`Server`] for the overall
    /// lifecycle; most callers want [`listen_and_serve`](Server::listen_and_serve).
    pub async fn serve<B>(self) -> Result<(), Error>
    where
        S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        serve_with(self.shared, DirectAccept, self.service).await
    }

    /// Listens on the configured address and serves plaintext HTTP.
    ///
    /// Starts this instance's signal handling, acquires the listener, and if
    /// this process is a restart child signals the parent to begin draining.
    /// Returns once the drain completes.
    pub async fn listen_and_serve<B>(mut self) -> Result<(), Error>
    where
        S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        signal::spawn_handler(Arc::clone(&self.shared));
        if let Err(err) = self.acquire_listener("http").await {
            tracing::error!(addr = %self.shared.addr, error = %err, "failed to acquire listener");
            return Err(err);
        }
        if self.shared.is_child {
            fork::notify_parent().await;
        }
        self.invoke_before_begin();
        serve_with(self.shared, DirectAccept, self.service).await
    }

    /// Listens on the configured address and serves HTTPS using the given
    /// PEM certificate chain and private key.
    ///
    /// Identical to [`listen_and_serve`](Server::listen_and_serve) apart from
    /// the TLS handshake on each accepted connection. The underlying TCP
    /// listener stays directly owned by this server, so its descriptor can
    /// still be handed to a replacement process.
    pub async fn listen_and_serve_tls<B>(
        mut self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<(), Error>
    where
        S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let tls_config = crate::tls::server_config(cert_file, key_file)?;
        signal::spawn_handler(Arc::clone(&self.shared));
        if let Err(err) = self.acquire_listener("https").await {
            tracing::error!(addr = %self.shared.addr, error = %err, "failed to acquire listener");
            return Err(err);
        }
        if self.shared.is_child {
            fork::notify_parent().await;
        }
        self.invoke_before_begin();
        serve_with(self.shared, TlsAccept::new(tls_config), self.service).await
    }

    fn invoke_before_begin(&mut self) {
        let addr = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.shared.addr.clone());
        if let Some(hook) = self.before_begin.take() {
            hook(&addr);
        }
    }
}

/// Listens on `addr` and serves `service` over plaintext HTTP with restart
/// support. Convenience for [`Server::new`] + [`Server::listen_and_serve`].
pub async fn listen_and_serve<S, B>(addr: impl Into<String>, service: S) -> Result<(), Error>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    Server::new(addr, service).listen_and_serve().await
}

/// Listens on `addr` and serves `service` over HTTPS with restart support.
/// Convenience for [`Server::new`] + [`Server::listen_and_serve_tls`].
pub async fn listen_and_serve_tls<S, B>(
    addr: impl Into<String>,
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
    service: S,
) -> Result<(), Error>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    Server::new(addr, service).listen_and_serve_tls(cert_file, key_file).await
}

/// The accept-serve-drain loop.
async fn serve_with<A, S, B>(shared: Arc<ServerShared>, acceptor: A, service: S) -> Result<(), Error>
where
    A: Accept,
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let listener = shared.listener().ok_or(Error::NotListening)?;
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    shared.set_state(State::Running);

    let graceful = GracefulShutdown::new();
    let builder = Arc::new(hyper_builder(shared.max_header_bytes));

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, remote_addr)) => {
                    tracing::trace!(%remote_addr, "connection accepted");
                    let io = TimeoutStream::new(stream, shared.read_timeout, shared.write_timeout);
                    let acceptor = acceptor.clone();
                    let service = service.clone();
                    let builder = Arc::clone(&builder);
                    let watcher = graceful.watcher();
                    tokio::spawn(async move {
                        let io = match acceptor.accept(io).await {
                            Ok(io) => io,
                            Err(err) => {
                                tracing::debug!(error = %err, "connection setup failed");
                                return;
                            }
                        };
                        let conn = builder
                            .serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(service));
                        if let Err(err) = watcher.watch(conn).await {
                            tracing::trace!(error = ?err, "failed to serve connection");
                        }
                    });
                }
                Err(err) => {
                    if listener.is_closed() {
                        tracing::trace!("listener closed, leaving accept loop");
                        break;
                    }
                    handle_accept_error(err).await;
                }
            },
            _ = shutdown_rx.changed() => {
                tracing::trace!("shutdown requested, no longer accepting");
                break;
            }
        }
    }

    // Last handle on the listening socket outside any in-flight fork.
    drop(listener);
    // Nudge in-flight connections to finish their current request instead of
    // staying keep-alive for the next one.
    tokio::spawn(graceful.shutdown());

    tracing::debug!(
        pid = std::process::id(),
        outstanding = shared.counter.outstanding(),
        "waiting for connections to finish"
    );
    shared.counter.wait_drained().await;
    shared.set_state(State::Terminated);
    tracing::debug!(pid = std::process::id(), "serve returning");
    Ok(())
}

fn hyper_builder(max_header_bytes: usize) -> Builder<TokioExecutor> {
    let mut builder = Builder::new(TokioExecutor::new());
    if max_header_bytes > 0 {
        builder.http1().max_buf_size(max_header_bytes);
    }
    builder
}

/// Begins a graceful shutdown. No-op unless the server is running.
///
/// Closes the listener so nothing new is accepted, asks in-flight connections
/// to wind down, and arms the hammer when a drain deadline is configured.
/// The serve loop then waits for the outstanding-connection count to reach
/// zero.
pub(crate) fn shutdown(shared: &Arc<ServerShared>) {
    if shared.state() != State::Running {
        return;
    }
    shared.set_state(State::ShuttingDown);

    if let Some(deadline) = config::default_hammer_time() {
        let shared = Arc::clone(shared);
        tokio::spawn(async move { hammer(&shared, deadline).await });
    }

    match shared.close_listener() {
        Ok(()) => tracing::info!(pid = std::process::id(), addr = %shared.addr, "listener closed"),
        Err(err) => tracing::info!(pid = std::process::id(), error = %err, "listener close failed"),
    }
    let _ = shared.shutdown_tx.send(true);
}

/// Releases the drain barrier after `delay`. No-op unless the server is
/// shutting down.
///
/// This does not close the remaining connections; their handlers keep
/// running, but the serve loop stops waiting for them. A liveness device,
/// not a correctness one.
pub(crate) async fn hammer(shared: &Arc<ServerShared>, delay: Duration) {
    if shared.state() != State::ShuttingDown {
        return;
    }
    tokio::time::sleep(delay).await;
    if shared.state() == State::Terminated {
        return;
    }
    tracing::warn!(
        pid = std::process::id(),
        outstanding = shared.counter.outstanding(),
        "drain deadline reached, abandoning remaining connections"
    );
    shared.counter.force_release();
}

fn adopt_listener(fd: RawFd) -> Result<TcpListener, Error> {
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .map_err(|source| Error::InheritedListener { fd, source })?;
    TcpListener::from_std(std_listener).map_err(|source| Error::InheritedListener { fd, source })
}

/// Maps the `host:port` shorthand forms onto something bindable: an empty
/// address means the default service, a bare `:port` means all interfaces,
/// and the `http`/`https` service names become their port numbers.
fn normalize_addr(addr: &str, default_service: &str) -> String {
    let effective = if addr.is_empty() {
        format!(":{default_service}")
    } else {
        addr.to_string()
    };
    match effective.strip_prefix(':') {
        Some(port) => {
            let port = match port {
                "http" => "80",
                "https" => "443",
                other => other,
            };
            format!("0.0.0.0:{port}")
        }
        None => effective,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_normalize_like_the_shorthand_forms() {
        assert_eq!(normalize_addr("", "http"), "0.0.0.0:80");
        assert_eq!(normalize_addr("", "https"), "0.0.0.0:443");
        assert_eq!(normalize_addr(":8080", "http"), "0.0.0.0:8080");
        assert_eq!(normalize_addr(":https", "http"), "0.0.0.0:443");
        assert_eq!(normalize_addr("127.0.0.1:9000", "http"), "127.0.0.1:9000");
        assert_eq!(normalize_addr("[::1]:9000", "http"), "[::1]:9000");
    }

    #[test]
    fn state_only_moves_forward() {
        let shared = ServerShared::for_tests("127.0.0.1:0");
        assert_eq!(shared.state(), State::Init);

        shared.set_state(State::Running);
        shared.set_state(State::ShuttingDown);
        shared.set_state(State::Running);
        assert_eq!(shared.state(), State::ShuttingDown);

        shared.set_state(State::Terminated);
        shared.set_state(State::Init);
        assert_eq!(shared.state(), State::Terminated);
    }

    #[tokio::test]
    async fn shutdown_is_a_noop_unless_running() {
        let shared = ServerShared::for_tests("127.0.0.1:0");
        shutdown(&shared);
        assert_eq!(shared.state(), State::Init);

        shared.set_state(State::Running);
        shared.set_state(State::Terminated);
        shutdown(&shared);
        assert_eq!(shared.state(), State::Terminated);
    }

    #[tokio::test]
    async fn hammer_is_a_noop_unless_shutting_down() {
        let shared = ServerShared::for_tests("127.0.0.1:0");
        let _held = shared.counter.acquire();

        hammer(&shared, Duration::ZERO).await;
        assert!(!shared.counter.is_released());

        shared.set_state(State::Running);
        shared.set_state(State::ShuttingDown);
        hammer(&shared, Duration::ZERO).await;
        assert!(shared.counter.is_released());
    }

    #[tokio::test]
    async fn hammer_releases_a_blocked_drain() {
        let shared = ServerShared::for_tests("127.0.0.1:0");
        shared.set_state(State::Running);
        shared.set_state(State::ShuttingDown);
        let _held = shared.counter.acquire();

        let waiter = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { shared.counter.wait_drained().await })
        };
        hammer(&shared, Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain released by hammer")
            .unwrap();
    }

    #[test]
    fn hooks_reject_signals_outside_the_hookable_set() {
        let shared = ServerShared::for_tests("127.0.0.1:0");
        let err = shared
            .register_hook(Phase::Pre, SignalKind::alarm(), Box::new(|| {}))
            .expect_err("alarm is not hookable");
        assert!(matches!(err, Error::UnsupportedSignal(_)));
        assert!(shared.hooks.read().unwrap().is_empty());
    }

    #[test]
    fn hooks_run_in_registration_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let shared = ServerShared::for_tests("127.0.0.1:0");
        let calls = Arc::new(AtomicUsize::new(0));
        for expected in 0..3 {
            let calls = Arc::clone(&calls);
            shared
                .register_hook(
                    Phase::Pre,
                    SignalKind::user_defined1(),
                    Box::new(move || {
                        assert_eq!(calls.fetch_add(1, Ordering::SeqCst), expected);
                    }),
                )
                .unwrap();
        }
        shared.run_hooks(Phase::Pre, SignalKind::user_defined1());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
