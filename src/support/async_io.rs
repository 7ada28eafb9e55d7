//-
// Copyright (c) 2025, 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::SslStream;
use tokio::io::{
    unix::{AsyncFd, AsyncFdReadyGuard},
    AsyncRead, AsyncWrite, ReadBuf,
};

use crate::support::error::Error;

/// The byte-stream transport under one server connection.
///
/// This fulfils two roles:
/// - Supporting the switch from cleartext to TLS mid-stream, keeping the
///   same object (and thus the same peer) on both sides of the switch.
/// - Enabling simultaneous read and write even in TLS mode (which contends
///   for the shared SSL stream).
///
/// Clones of a `ServerIo` track the same underlying state. This allows what
/// is initially an `AsyncRead + AsyncWrite` to be split into separate
/// `AsyncRead` and `AsyncWrite` objects which can be used simultaneously,
/// and lets the connection engine re-wrap the transport in a fresh buffered
/// stream after a TLS upgrade.
#[derive(Clone)]
pub struct ServerIo {
    fd: Rc<AsyncFd<RawFd>>,
    mode: Rc<RefCell<Mode>>,
    _owned: Rc<dyn Any>,
}

enum Mode {
    Cleartext(SocketRw),
    Tls(SslStream<SocketRw>),
}

impl ServerIo {
    /// Sets up a `ServerIo` over the given connected socket.
    ///
    /// The `ServerIo` owns the socket; it is closed when the last clone is
    /// dropped. This only fails if making the socket non-blocking fails.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Any,
    ) -> Result<Self, nix::Error> {
        let raw = sock.as_raw_fd();
        nix::fcntl::fcntl(
            raw,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Rc::new(
            AsyncFd::with_interest(
                raw,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )
            .unwrap(),
        );

        Ok(Self {
            fd: Rc::clone(&fd),
            mode: Rc::new(RefCell::new(Mode::Cleartext(SocketRw(fd)))),
            _owned: Rc::new(sock),
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::Tls(_))
    }

    /// Describes the negotiated TLS parameters, or `None` in cleartext mode.
    pub fn tls_string(&self) -> Option<String> {
        match *self.mode.borrow() {
            Mode::Cleartext(..) => None,
            Mode::Tls(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{tls_version}:{cipher}:{strength}",
                    tls_version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    strength = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs the server side of a TLS handshake with the given acceptor,
    /// switching the transport into TLS mode on success.
    ///
    /// During the accept flow, concurrent calls to other methods will panic.
    #[allow(clippy::await_holding_refcell_ref)] // intentional
    pub async fn ssl_accept(
        &self,
        acceptor: &openssl::ssl::SslAcceptor,
    ) -> Result<(), Error> {
        // Borrow mode immediately so that concurrent access panics.
        let mut mode = self.mode.borrow_mut();
        let mut result = acceptor.accept(SocketRw(Rc::clone(&self.fd)));

        // There's no way to tell Tokio "I just saw that the fd is not ready,
        // block until it's ready again"; we can only fetch a ready guard when
        // Tokio already believes the operation is ready. So on WANT_READ /
        // WANT_WRITE we take the guard (the fd may have become ready again
        // across the await), retry the handshake, and only once OpenSSL
        // blocks again *while* we hold a guard can we clear its readiness
        // and park.
        let mut read_guard = None::<AsyncFdReadyGuard<'_, _>>;
        let mut write_guard = None::<AsyncFdReadyGuard<'_, _>>;

        loop {
            match result {
                Ok(stream) => {
                    *mode = Mode::Tls(stream);
                    return Ok(());
                },

                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(openssl::ssl::HandshakeError::Failure(mhss)) => {
                    return Err(mid_handshake_to_error(mhss));
                },

                Err(openssl::ssl::HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            if let Some(mut guard) = read_guard.take() {
                                guard.clear_ready();
                            }

                            read_guard = Some(self.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            if let Some(mut guard) = write_guard.take() {
                                guard.clear_ready();
                            }

                            write_guard = Some(self.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mid_handshake_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Called when an error is returned from `ssl_read` or `ssl_write`.
    ///
    /// Arranges a readiness check for the socket when OpenSSL reports
    /// `WANT_READ` or `WANT_WRITE` and clears its readiness status if
    /// currently set. It is critical that this *only* be called immediately
    /// after `ssl_read` or `ssl_write`, with no await points in between, so
    /// that the `WANT_READ`/`WANT_WRITE` is known to describe the current
    /// socket state.
    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                // Poll again to get tokio to actually watch for changes.
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                // If we get here, the fd has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                // Poll again to get tokio to actually watch for changes.
                futures::ready!(self.fd.poll_write_ready(ctx))?.retain_ready();
                // If we get here, the fd has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            // As can be seen in the `fmt::Display` implementation of
            // `openssl::ssl::Error`, EOF is represented by the SYSCALL error
            // code with no associated IO error, and into_io_error() doesn't
            // bother to translate that.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Mode::Tls(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Mode::Tls(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer anything itself (SslStream::flush() just
        // delegates to the underlying writer) and the raw socket has no
        // buffer either, so there is nothing to do.
        task::Poll::Ready(Ok(()))
    }

    /// If there is a TLS session, it is shut down, returning the socket to
    /// cleartext.
    ///
    /// During the shutdown process, other reads and writes are not
    /// well-defined.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        let done = if let Mode::Tls(ref mut ssl) = *mode {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            }

            true
        } else {
            false
        };

        if done {
            *mode = Mode::Cleartext(SocketRw(Rc::clone(&self.fd)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the raw socket.
///
/// The synchronous implementations exist for OpenSSL, which drives the
/// socket itself; the fd is non-blocking, so they surface `EWOULDBLOCK` and
/// the TLS layer above translates that into readiness waits.
struct SocketRw(Rc<AsyncFd<RawFd>>);

impl SocketRw {
    fn raw(&self) -> RawFd {
        *self.0.get_ref()
    }
}

impl io::Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.raw(), dst).map_err(nix_to_io)
    }
}

impl io::Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(self.raw(), src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for SocketRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SocketRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mid_handshake_to_error<S>(
    mhss: openssl::ssl::MidHandshakeSslStream<S>,
) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
