//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Sievemap.
//
// Sievemap is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Sievemap is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Sievemap. If not, see <http://www.gnu.org/licenses/>.

use std::any::Any;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, SslAcceptor, SslStream,
};
use tokio::io::{
    unix::{AsyncFd, AsyncFdReadyGuard},
    AsyncRead, AsyncWrite, Interest, ReadBuf,
};

use crate::support::error::Error;

/// Async I/O over a client socket which can switch from cleartext to TLS
/// mid-stream.
///
/// Tokio's own socket types cannot be handed to OpenSSL's synchronous
/// `SslStream` and then resumed, so this drives the raw file descriptor
/// through an `AsyncFd` and lets OpenSSL do blocking-style reads and writes
/// against it, translating `WANT_READ`/`WANT_WRITE` into readiness waits.
///
/// `ServerIo` is not `Send`; sessions using it run on a `LocalSet`.
pub struct ServerIo {
    sock: Rc<AsyncFd<RawFd>>,
    mode: Mode,
    // Declared last so the fd is deregistered before it is closed.
    _owned: Box<dyn Any>,
}

enum Mode {
    Cleartext(SocketRw),
    Ssl(SslStream<SocketRw>),
    // Only observable if a handshake future is dropped midway.
    Broken,
}

impl ServerIo {
    /// Sets up a `ServerIo` which runs over the given socket.
    ///
    /// The `ServerIo` owns the socket, which is closed when it is dropped.
    ///
    /// This only fails if making the socket non-blocking or registering it
    /// with the reactor fails.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Any,
    ) -> Result<Self, Error> {
        let fd = sock.as_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let sock_fd = Rc::new(AsyncFd::with_interest(
            fd,
            Interest::READABLE | Interest::WRITABLE,
        )?);

        Ok(Self {
            sock: Rc::clone(&sock_fd),
            mode: Mode::Cleartext(SocketRw(sock_fd)),
            _owned: Box::new(sock),
        })
    }

    /// Describe the negotiated TLS parameters, for logging.
    pub fn ssl_string(&self) -> Option<String> {
        match self.mode {
            Mode::Cleartext(..) | Mode::Broken => None,
            Mode::Ssl(ref stream) => {
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

    /// Performs the server side of a TLS handshake with the given acceptor.
    ///
    /// Any cleartext the caller has buffered but not yet consumed must be
    /// discarded before calling this.
    pub async fn ssl_accept(
        &mut self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let rw = match std::mem::replace(&mut self.mode, Mode::Broken) {
            Mode::Cleartext(rw) => rw,
            mode @ Mode::Ssl(_) => {
                self.mode = mode;
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "TLS already active",
                )));
            },
            Mode::Broken => {
                return Err(Error::Io(io::ErrorKind::NotConnected.into()))
            },
        };

        let stream = handshake(&self.sock, acceptor.accept(rw)).await?;
        self.mode = Mode::Ssl(stream);
        Ok(())
    }
}

async fn handshake(
    sock: &AsyncFd<RawFd>,
    mut result: Result<SslStream<SocketRw>, HandshakeError<SocketRw>>,
) -> Result<SslStream<SocketRw>, Error> {
    // Tokio cannot be told "I just saw this isn't ready". So we take a guard
    // once Tokio believes the fd is ready, retry, and only if OpenSSL blocks
    // again while we hold that guard do we clear its readiness.
    let mut read_guard = None::<AsyncFdReadyGuard<'_, RawFd>>;
    let mut write_guard = None::<AsyncFdReadyGuard<'_, RawFd>>;

    loop {
        match result {
            Ok(stream) => return Ok(stream),

            Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),

            Err(HandshakeError::Failure(mhss)) => {
                return Err(mhss_to_error(mhss))
            },

            Err(HandshakeError::WouldBlock(mhss)) => match mhss.error().code()
            {
                ErrorCode::WANT_READ => {
                    if let Some(mut guard) = read_guard.take() {
                        guard.clear_ready();
                    }
                    read_guard = Some(sock.readable().await?);
                    result = mhss.handshake();
                },

                ErrorCode::WANT_WRITE => {
                    if let Some(mut guard) = write_guard.take() {
                        guard.clear_ready();
                    }
                    write_guard = Some(sock.writable().await?);
                    result = mhss.handshake();
                },

                _ => return Err(mhss_to_error(mhss)),
            },
        }
    }
}

/// Called when an error is returned from `ssl_read` or `ssl_write`.
///
/// For `WANT_READ`/`WANT_WRITE`, clears the readiness of the fd and arranges
/// a wakeup. This must only be called immediately after the failed OpenSSL
/// call, with no await point in between, so the want really does mean the
/// socket has nothing for us.
fn on_rw_ssl_error(
    sock: &AsyncFd<RawFd>,
    ctx: &mut task::Context<'_>,
    e: openssl::ssl::Error,
) -> task::Poll<io::Result<()>> {
    match e.code() {
        ErrorCode::WANT_READ => {
            futures::ready!(sock.poll_read_ready(ctx))?.clear_ready();
            futures::ready!(sock.poll_read_ready(ctx))?.retain_ready();
            task::Poll::Ready(Ok(()))
        },

        ErrorCode::WANT_WRITE => {
            futures::ready!(sock.poll_write_ready(ctx))?.clear_ready();
            futures::ready!(sock.poll_write_ready(ctx))?.retain_ready();
            task::Poll::Ready(Ok(()))
        },

        // A clean close by the peer shows up as ZERO_RETURN; an unclean one
        // as SYSCALL without an underlying IO error.
        ErrorCode::ZERO_RETURN => task::Poll::Ready(Err(
            io::ErrorKind::UnexpectedEof.into(),
        )),

        ErrorCode::SYSCALL => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

        _ => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
    }
}

fn broken() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake abandoned")
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut rw) => Pin::new(rw).poll_read(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },
                    // EOF is reported to the caller as a zero-length read.
                    Err(e) if ErrorCode::ZERO_RETURN == e.code() => {
                        return task::Poll::Ready(Ok(()));
                    },
                    Err(e) => {
                        futures::ready!(on_rw_ssl_error(&this.sock, ctx, e))?
                    },
                }
            },
            Mode::Broken => task::Poll::Ready(Err(broken())),
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut rw) => Pin::new(rw).poll_write(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => {
                        futures::ready!(on_rw_ssl_error(&this.sock, ctx, e))?
                    },
                }
            },
            Mode::Broken => task::Poll::Ready(Err(broken())),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // Neither OpenSSL nor we buffer anything.
        task::Poll::Ready(Ok(()))
    }

    /// Sends the TLS close notification, if there is a TLS session, then
    /// half-closes the socket.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Mode::Ssl(ref mut ssl) = this.mode {
            loop {
                match ssl.shutdown() {
                    // We don't wait for the peer's reply.
                    Ok(_) => break,
                    Err(e) if ErrorCode::ZERO_RETURN == e.code() => break,
                    Err(e) => {
                        futures::ready!(on_rw_ssl_error(&this.sock, ctx, e))?
                    },
                }
            }
        }

        let _ = nix::sys::socket::shutdown(
            *this.sock.get_ref(),
            nix::sys::socket::Shutdown::Write,
        );
        task::Poll::Ready(Ok(()))
    }
}

/// Implements both the synchronous and asynchronous read and write traits atop
/// the raw socket.
///
/// OpenSSL uses the synchronous side; cleartext mode uses the asynchronous
/// side directly.
struct SocketRw(Rc<AsyncFd<RawFd>>);

impl io::Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(*self.0.get_ref(), dst).map_err(nix_to_io)
    }
}

impl io::Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(*self.0.get_ref(), src).map_err(nix_to_io)
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

fn mhss_to_error<S>(mhss: MidHandshakeSslStream<S>) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
