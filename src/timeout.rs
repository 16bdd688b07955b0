/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Read/write deadlines for connection I/O.
//!
//! [`TimeoutStream`] enforces the process-wide read and write timeouts on a
//! per-operation basis: a deadline is armed when an operation would block and
//! cleared as soon as the operation makes progress. A connection whose peer
//! stops reading or writing fails with [`io::ErrorKind::TimedOut`] instead of
//! pinning the drain forever.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

pin_project! {
    /// I/O wrapper applying optional per-operation deadlines.
    #[derive(Debug)]
    pub struct TimeoutStream<T> {
        #[pin]
        io: T,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        read_deadline: Option<Pin<Box<Sleep>>>,
        write_deadline: Option<Pin<Box<Sleep>>>,
    }
}

impl<T> TimeoutStream<T> {
    pub(crate) fn new(io: T, read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
        Self {
            io,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

/// Arms the deadline on first pending poll, then fails the operation once it
/// fires. Progress on the operation clears the deadline at the call sites.
fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
    what: &'static str,
) -> Poll<io::Result<()>> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *deadline = None;
            Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, what)))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<T: AsyncRead> AsyncRead for TimeoutStream<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.io.poll_read(cx, buf) {
            Poll::Ready(result) => {
                *this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(this.read_deadline, *this.read_timeout, cx, "read timed out") {
                Poll::Ready(err) => Poll::Ready(err),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for TimeoutStream<T> {
    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.io.poll_write(cx, buf) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(this.write_deadline, *this.write_timeout, cx, "write timed out") {
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                _ => Poll::Pending,
            },
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.io.poll_write_vectored(cx, bufs) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(this.write_deadline, *this.write_timeout, cx, "write timed out") {
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                _ => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.io.poll_flush(cx) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(this.write_deadline, *this.write_timeout, cx, "write timed out") {
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                _ => Poll::Pending,
            },
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }
}
