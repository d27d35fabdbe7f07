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

//! The per-connection loop: read a frame, decide what to do about it, write
//! the answer.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::dispatch::{Action, Dispatcher};
use super::frame::{Frame, FrameReader, FrameWriter};
use super::response::Response;
use super::syntax::{self, ParseError, SaslResponse};
use crate::support::{async_io::ServerIo, error::Error, log_prefix::LogPrefix};

/// Per-connection limits, taken from `[server]` in the configuration.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub max_line: usize,
    pub max_literal: u64,
    /// Whether the TLS handshake happens before the greeting.
    pub implicit_tls: bool,
}

pub struct Session {
    reader: FrameReader<ServerIo>,
    writer: FrameWriter,
    dispatcher: Dispatcher,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Arc<SslAcceptor>>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
}

enum Wait {
    Frame(Frame),
    Idle,
    Shutdown,
}

impl Session {
    pub fn new(
        io: ServerIo,
        dispatcher: Dispatcher,
        log_prefix: LogPrefix,
        ssl_acceptor: Option<Arc<SslAcceptor>>,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reader: FrameReader::new(io, config.max_line, config.max_literal),
            writer: FrameWriter::new(),
            dispatcher,
            log_prefix,
            ssl_acceptor,
            config,
            shutdown,
        }
    }

    /// Run the session to completion and close the connection.
    pub async fn run(mut self) {
        match self.serve().await {
            Ok(()) => info!("{} Normal client disconnect", self.log_prefix),
            Err(e) => {
                warn!("{} Abnormal client disconnect: {}", self.log_prefix, e)
            },
        }

        let _ = self.reader.get_mut().shutdown().await;
    }

    async fn serve(&mut self) -> Result<(), Error> {
        if self.config.implicit_tls {
            self.start_tls().await?;
            // The greeting is the same block that follows STARTTLS.
            self.dispatcher.tls_started(&mut self.writer);
        } else {
            self.dispatcher.write_capabilities(&mut self.writer);
            Response::ok().write_to(&mut self.writer);
        }
        self.flush().await?;

        loop {
            let frame = match self.wait(true).await? {
                Wait::Frame(frame) => frame,
                Wait::Idle => return Ok(()),
                Wait::Shutdown => {
                    info!("{} Closing for server shutdown", self.log_prefix);
                    Response::bye("Server shutting down")
                        .write_to(&mut self.writer);
                    return self.flush().await;
                },
            };

            let mut action = self.on_frame(frame).await?;
            self.flush().await?;

            if Action::SaslChallenge == action {
                action = self.sasl_exchange().await?;
                self.flush().await?;
            }

            match action {
                Action::Continue | Action::SaslChallenge => (),
                Action::Close => return Ok(()),
                Action::StartTls => {
                    Response::ok().write_to(&mut self.writer);
                    self.flush().await?;
                    self.start_tls().await?;
                    self.dispatcher.tls_started(&mut self.writer);
                    self.flush().await?;
                },
            }
        }
    }

    /// Wait for the next frame from the client.
    ///
    /// Shutdown is only noticed between commands, and only if
    /// `allow_shutdown`.
    async fn wait(&mut self, allow_shutdown: bool) -> Result<Wait, Error> {
        let between_commands =
            allow_shutdown && self.reader.pending().is_empty();
        let read = tokio::time::timeout(
            self.config.idle_timeout,
            self.reader.next_frame(),
        );

        let result = if between_commands {
            tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => {
                    return Ok(Wait::Shutdown);
                },
                r = read => r,
            }
        } else {
            read.await
        };

        match result {
            Ok(frame) => Ok(Wait::Frame(frame?)),
            Err(_) => {
                info!("{} Idle timeout", self.log_prefix);
                Ok(Wait::Idle)
            },
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Action, Error> {
        match frame {
            Frame::Closed => Ok(Action::Close),
            Frame::TooLong => {
                warn!("{} Command line too long", self.log_prefix);
                Response::no("Line too long").write_to(&mut self.writer);
                Ok(Action::Continue)
            },
            Frame::LiteralAnnounced {
                size,
                synchronizing,
            } => Ok(self
                .on_literal(size, synchronizing, true)
                .await?
                .unwrap_or(Action::Continue)),
            Frame::Line(line) => match syntax::parse(&line) {
                Ok(request) => Ok(self
                    .dispatcher
                    .dispatch(request, &mut self.writer)
                    .await),
                Err(ParseError::Unknown(mut verb)) => {
                    if let Some((truncate_len, _)) = verb.char_indices().nth(64)
                    {
                        verb.truncate(truncate_len);
                    }
                    warn!("{} Unknown command {:?}", self.log_prefix, verb);
                    Response::no("Unknown command").write_to(&mut self.writer);
                    Ok(Action::Continue)
                },
                Err(ParseError::Syntax { offset }) => {
                    warn!(
                        "{} Syntax error at offset {}",
                        self.log_prefix, offset
                    );
                    Response::no("Syntax error").write_to(&mut self.writer);
                    Ok(Action::Continue)
                },
            },
        }
    }

    /// Decide the fate of an announced literal.
    ///
    /// Returns `None` if the literal was read into the current line, or the
    /// action to take if the command was answered without reading it.
    /// `check_quota` enables the early quota check for PUTSCRIPT.
    async fn on_literal(
        &mut self,
        size: u64,
        synchronizing: bool,
        check_quota: bool,
    ) -> Result<Option<Action>, Error> {
        if size > self.config.max_literal {
            warn!("{} Rejected {} byte literal", self.log_prefix, size);

            if synchronizing {
                if !self.finish_literal(false).await? {
                    return Ok(Some(Action::Close));
                }
                Response::no("Literal too large").write_to(&mut self.writer);
                return Ok(Some(Action::Continue));
            }

            // The client is already sending it and we won't read it.
            Response::bye("Literal too large").write_to(&mut self.writer);
            return Ok(Some(Action::Close));
        }

        if check_quota {
            if let Some(name) = syntax::putscript_target(self.reader.pending())
            {
                if !self.dispatcher.putscript_fits(name, size).await {
                    if !self.finish_literal(false).await? {
                        return Ok(Some(Action::Close));
                    }
                    Response::quota().write_to(&mut self.writer);
                    return Ok(Some(Action::Continue));
                }
            }
        }

        if synchronizing {
            Response::Ok(Some(format!("Ready for {} bytes", size)))
                .write_to(&mut self.writer);
            self.flush().await?;
        }

        if !self.finish_literal(true).await? {
            return Ok(Some(Action::Close));
        }
        Ok(None)
    }

    /// Read (`accept`) or skip the announced literal within the idle
    /// timeout.
    ///
    /// Returns `false` if the client stalled, in which case the connection
    /// is to be closed without a response.
    async fn finish_literal(&mut self, accept: bool) -> Result<bool, Error> {
        let idle_timeout = self.config.idle_timeout;
        let result = if accept {
            tokio::time::timeout(idle_timeout, self.reader.accept_literal())
                .await
        } else {
            tokio::time::timeout(idle_timeout, self.reader.reject_literal())
                .await
        };

        match result {
            Ok(r) => {
                r?;
                Ok(true)
            },
            Err(_) => {
                info!("{} Idle timeout inside literal", self.log_prefix);
                Ok(false)
            },
        }
    }

    /// Send the empty challenge and feed the client's answer to the
    /// dispatcher.
    async fn sasl_exchange(&mut self) -> Result<Action, Error> {
        self.writer.write_line(b"\"\"");
        self.flush().await?;

        let line = loop {
            match self.wait(false).await? {
                Wait::Frame(Frame::Line(line)) => break line,
                Wait::Frame(Frame::LiteralAnnounced {
                    size,
                    synchronizing,
                }) => {
                    if let Some(action) =
                        self.on_literal(size, synchronizing, false).await?
                    {
                        return Ok(action);
                    }
                },
                Wait::Frame(Frame::TooLong) => {
                    Response::no("Line too long").write_to(&mut self.writer);
                    return Ok(Action::Continue);
                },
                Wait::Frame(Frame::Closed) | Wait::Idle | Wait::Shutdown => {
                    return Ok(Action::Close)
                },
            }
        };

        match syntax::parse_sasl_response(&line) {
            Ok(SaslResponse::Data(data)) => Ok(self
                .dispatcher
                .authenticate_finish(&data, &mut self.writer)
                .await),
            Ok(SaslResponse::Abort) => {
                Response::no("Authentication aborted")
                    .write_to(&mut self.writer);
                Ok(Action::Continue)
            },
            Err(_) => {
                warn!("{} Malformed SASL response", self.log_prefix);
                Response::no("Bad username or password")
                    .write_to(&mut self.writer);
                Ok(Action::Continue)
            },
        }
    }

    async fn start_tls(&mut self) -> Result<(), Error> {
        let acceptor = self.ssl_acceptor.clone().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "TLS is not configured",
            ))
        })?;

        let discarded = self.reader.discard_buffered();
        if discarded > 0 {
            warn!(
                "{} Discarded {} bytes pipelined ahead of the TLS handshake",
                self.log_prefix, discarded
            );
        }

        match tokio::time::timeout(
            self.config.idle_timeout,
            self.reader.get_mut().ssl_accept(&acceptor),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                warn!("{} TLS handshake failed: {}", self.log_prefix, e);
                return Err(e);
            },
            Err(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                )))
            },
        }

        info!(
            "{} TLS handshake succeeded: {}",
            self.log_prefix,
            self.reader.get_ref().ssl_string().unwrap_or_default(),
        );
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush(self.reader.get_mut()).await?;
        Ok(())
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the sender is
/// gone without having set it.
pub(super) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }

        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
