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

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::rc::Rc;

use log::{error, info};
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::backend::registry;
use crate::managesieve::server::Server;
use crate::support::system_config::{SystemConfig, TlsConfig};
use crate::support::unix_privileges;

// Logging is already set up, so failures go there rather than to stderr as
// with die!
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

pub(super) fn serve(system_config: SystemConfig, system_root: &Path) {
    let backends = match registry::build(&system_config, system_root) {
        Ok(backends) => backends,
        Err(e) => fatal!(EX_CONFIG, "{}", e),
    };

    let ssl_acceptor = system_config
        .tls
        .as_ref()
        .map(|tls| create_ssl_acceptor(tls, system_root));

    let bind_addr = format!(
        "{}:{}",
        bracket_ipv6(&system_config.server.bind),
        system_config.server.port
    );
    let listener = match TcpListener::bind(&bind_addr) {
        Ok(listener) => listener,
        Err(e) => fatal!(EX_OSERR, "Unable to listen on {}: {}", bind_addr, e),
    };
    if let Err(e) = listener.set_nonblocking(true) {
        fatal!(EX_OSERR, "Unable to configure listener: {}", e);
    }

    // We've opened everything on the main system we need; now we can drop
    // privileges.
    if let Err(exit) = unix_privileges::assume_system(&system_config.security)
    {
        exit.exit();
    }

    let server = Rc::new(Server::new(&system_config, backends, ssl_acceptor));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => fatal!(EX_OSERR, "Failed to start Tokio runtime: {}", e),
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => fatal!(EX_OSERR, "Unable to register listener: {}", e),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut sigint, mut sigterm) = match signal(SignalKind::interrupt())
            .and_then(|int| signal(SignalKind::terminate()).map(|t| (int, t)))
        {
            Ok(signals) => signals,
            Err(e) => fatal!(EX_OSERR, "Unable to handle signals: {}", e),
        };

        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
            let _ = shutdown_tx.send(true);
        });

        info!("Listening on {}", bind_addr);
        server.run(listener, shutdown_rx).await;
    });

    info!("Shut down");
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_owned()
    }
}

fn create_ssl_acceptor(tls: &TlsConfig, system_root: &Path) -> SslAcceptor {
    let mut acceptor =
        match SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()) {
            Ok(a) => a,
            Err(e) => fatal!(
                EX_SOFTWARE,
                "Failed to initialise OpenSSL acceptor: {}",
                e
            ),
        };

    let private_key_path = system_root.join(&tls.private_key);
    let key_result = if tls.passphrase.is_empty() {
        acceptor.set_private_key_file(&private_key_path, SslFiletype::PEM)
    } else {
        let pem = match fs::read(&private_key_path) {
            Ok(pem) => pem,
            Err(e) => fatal!(
                EX_CONFIG,
                "Unable to read TLS private key from '{}': {}",
                private_key_path.display(),
                e
            ),
        };
        PKey::private_key_from_pem_passphrase(&pem, tls.passphrase.as_bytes())
            .and_then(|key| acceptor.set_private_key(&key))
    };
    if let Err(e) = key_result {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS private key from '{}': {}",
            private_key_path.display(),
            e
        );
    }

    let certificate_path = system_root.join(&tls.certificate_chain);
    if let Err(e) = acceptor.set_certificate_chain_file(&certificate_path) {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS certificate chain from '{}': {}",
            certificate_path.display(),
            e
        );
    }

    if let Err(e) = acceptor.check_private_key() {
        fatal!(EX_CONFIG, "TLS key seems to be invalid: {}", e);
    }

    acceptor.build()
}
