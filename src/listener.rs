/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Connection-tracking TCP listener.
//!
//! [`TrackingListener`] wraps a [`tokio::net::TcpListener`] so that every
//! accepted connection is counted against its server's outstanding-connection
//! total. The count is incremented before the connection is handed out and
//! decremented exactly once when the connection is dropped. Graceful shutdown
//! waits on that count reaching zero; the hammer can force-release the wait.
//!
//! The listener also exposes a duplicated, inheritance-ready file descriptor
//! for handing the listening socket to a replacement process.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

// Matches the keep-alive period the standard HTTP serving stack applies to
// accepted connections.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Counter of accepted-but-unclosed connections, doubling as the drain
/// barrier a shutting-down server waits on.
#[derive(Debug, Default)]
pub struct ConnCounter {
    outstanding: AtomicUsize,
    forced: AtomicBool,
    drained: Notify,
}

impl ConnCounter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counts one accepted connection. The returned guard decrements the
    /// count when dropped, which is the only way it decrements.
    pub(crate) fn acquire(self: &Arc<Self>) -> ConnGuard {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        ConnGuard {
            counter: Arc::clone(self),
        }
    }

    /// Number of connections accepted and not yet closed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Releases the drain barrier regardless of the count. Called by the
    /// hammer once the drain deadline has passed.
    pub(crate) fn force_release(&self) {
        self.forced.store(true, Ordering::Release);
        self.drained.notify_waiters();
    }

    pub(crate) fn is_released(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0 || self.forced.load(Ordering::Acquire)
    }

    /// Waits until every tracked connection has closed, or until the barrier
    /// is force-released.
    pub(crate) async fn wait_drained(&self) {
        loop {
            // Register for the notification before re-checking, otherwise a
            // release between the check and the await is lost.
            let mut notified = std::pin::pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.is_released() {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the owning counter exactly once, on drop.
#[derive(Debug)]
pub(crate) struct ConnGuard {
    counter: Arc<ConnCounter>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.counter.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.counter.drained.notify_waiters();
        }
    }
}

pin_project! {
    /// An accepted connection counted by [`TrackingListener`].
    #[derive(Debug)]
    pub struct TrackedStream {
        #[pin]
        io: TcpStream,
        guard: ConnGuard,
    }
}

impl TrackedStream {
    /// Remote address of the peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.io.peer_addr()
    }
}

// Simply forward implementation to `io` field.
impl AsyncRead for TrackedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_read(cx, buf)
    }
}

// Simply forward implementation to `io` field.
impl AsyncWrite for TrackedStream {
    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }

    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write_vectored(cx, bufs)
    }
}

/// A TCP listener that counts the connections it accepts.
#[derive(Debug)]
pub struct TrackingListener {
    inner: TcpListener,
    counter: Arc<ConnCounter>,
    closed: AtomicBool,
}

impl TrackingListener {
    pub(crate) fn new(inner: TcpListener, counter: Arc<ConnCounter>) -> Self {
        Self {
            inner,
            counter,
            closed: AtomicBool::new(false),
        }
    }

    /// Accepts the next connection.
    ///
    /// Keep-alive is enabled on the connection with a three minute period and
    /// the outstanding-connection count is incremented before the connection
    /// is returned. Returns an error once the listener has been closed.
    pub async fn accept(&self) -> io::Result<(TrackedStream, SocketAddr)> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let (io, remote_addr) = self.inner.accept().await?;
        if let Err(err) = SockRef::from(&io).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD)) {
            tracing::trace!(error = %err, "failed to enable TCP keep-alive on accepted connection");
        }
        let guard = self.counter.acquire();
        Ok((TrackedStream { io, guard }, remote_addr))
    }

    /// Marks the listener closed. The listening socket itself is released
    /// once the accept loop observes the close and drops its handle.
    ///
    /// A second close fails with [`io::ErrorKind::InvalidInput`].
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(closed_error());
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Duplicates the listening descriptor for inheritance by a replacement
    /// process. The duplicate is numbered at or above `min_fd` and has the
    /// close-on-exec flag clear.
    pub fn file(&self, min_fd: RawFd) -> io::Result<OwnedFd> {
        let fd = self.inner.as_raw_fd();
        // F_DUPFD (as opposed to F_DUPFD_CLOEXEC) leaves the duplicate
        // inheritable across exec.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD, min_fd) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(dup) })
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "listener closed")
}

/// Backs off on accept errors that are not attributable to the remote end.
///
/// A process that has hit its open-file limit will fail every accept with
/// `EMFILE`; sleeping gives the application a chance to close connections
/// before the loop retries.
pub(crate) async fn handle_accept_error(e: io::Error) {
    if is_connection_error(&e) {
        return;
    }
    tracing::error!("accept error: {e}");
    tokio::time::sleep(Duration::from_secs(1)).await;
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;

    use super::*;

    async fn bound_listener() -> TrackingListener {
        let inner = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        TrackingListener::new(inner, ConnCounter::new())
    }

    #[tokio::test]
    async fn accept_increments_and_drop_decrements() {
        let listener = bound_listener().await;
        let addr = listener.local_addr().unwrap();
        let counter = Arc::clone(&listener.counter);

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        assert_eq!(counter.outstanding(), 1);

        drop(stream);
        assert_eq!(counter.outstanding(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn second_close_is_invalid() {
        let listener = bound_listener().await;
        listener.close().expect("first close succeeds");
        let err = listener.close().expect_err("second close fails");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = listener.accept().await.expect_err("accept after close fails");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn duplicated_descriptor_accepts_connections() {
        let listener = bound_listener().await;
        let addr = listener.local_addr().unwrap();

        // Adopt the duplicate the way a restart child adopts an inherited fd.
        let dup = listener.file(3).unwrap();
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(dup.into_raw_fd()) };
        std_listener.set_nonblocking(true).unwrap();
        let adopted = TcpListener::from_std(std_listener).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_conn, _) = adopted.accept().await.expect("adopted listener accepts");
        client.await.unwrap().expect("client connects");
    }

    #[tokio::test]
    async fn wait_drained_returns_when_count_hits_zero() {
        let counter = ConnCounter::new();
        let guard = counter.acquire();

        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.wait_drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain wait completes")
            .unwrap();
    }

    #[tokio::test]
    async fn force_release_unblocks_waiter_with_outstanding_connections() {
        let counter = ConnCounter::new();
        let _held = counter.acquire();

        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.wait_drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        counter.force_release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("forced drain wait completes")
            .unwrap();
        assert_eq!(counter.outstanding(), 1);
    }
}
