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

//! Connection acceptance and the lifetime of sessions.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use super::capability::Capabilities;
use super::dispatch::Dispatcher;
use super::session::{shutdown_signalled, Session, SessionConfig};
use crate::backend::registry::Backends;
use crate::support::{
    async_io::ServerIo, log_prefix::LogPrefix, system_config::SystemConfig,
};

/// Everything sessions share. Read-only once built.
pub struct Server {
    caps: Arc<Capabilities>,
    backends: Backends,
    ssl_acceptor: Option<Arc<SslAcceptor>>,
    session_config: SessionConfig,
}

impl Server {
    pub fn new(
        config: &SystemConfig,
        backends: Backends,
        ssl_acceptor: Option<SslAcceptor>,
    ) -> Self {
        Self {
            caps: Arc::new(Capabilities::new(config)),
            backends,
            ssl_acceptor: ssl_acceptor.map(Arc::new),
            session_config: SessionConfig {
                idle_timeout: Duration::from_secs(
                    config.server.idle_timeout_secs,
                ),
                max_line: config.server.max_line,
                max_literal: config.server.max_literal,
                implicit_tls: config.server.implicit_tls,
            },
        }
    }

    /// Accept connections until `shutdown` is set, then wait for every
    /// session to end.
    ///
    /// Must be run within a `LocalSet`.
    pub async fn run(
        self: Rc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Each session holds a sender; `recv()` returns `None` once they are
        // all gone.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        loop {
            let (sock, peer) = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                r = listener.accept() => match r {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        // Typically out of file descriptors; don't spin.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    },
                },
            };

            let _ = sock.set_nodelay(true);
            // ServerIo registers the descriptor with the reactor itself.
            let io = match sock
                .into_std()
                .map_err(Into::into)
                .and_then(ServerIo::new_owned_socket)
            {
                Ok(io) => io,
                Err(e) => {
                    error!("{} Unable to set up connection: {}", peer, e);
                    continue;
                },
            };

            let server = Rc::clone(&self);
            let shutdown = shutdown.clone();
            let done = done_tx.clone();
            tokio::task::spawn_local(async move {
                server
                    .serve_connection(io, peer.to_string(), shutdown)
                    .await;
                drop(done);
            });
        }

        info!("No longer accepting connections");
        drop(done_tx);
        let _ = done_rx.recv().await;
        info!("All sessions finished");
    }

    /// Run a session over an already-established connection.
    pub async fn serve_connection(
        &self,
        io: ServerIo,
        peer: String,
        shutdown: watch::Receiver<bool>,
    ) {
        let log_prefix = LogPrefix::new(peer);
        info!("{} Connection established", log_prefix);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.caps),
            self.backends.clone(),
            log_prefix.clone(),
            self.ssl_acceptor.is_some(),
        );

        Session::new(
            io,
            dispatcher,
            log_prefix,
            self.ssl_acceptor.clone(),
            self.session_config,
            shutdown,
        )
        .run()
        .await;
    }
}
