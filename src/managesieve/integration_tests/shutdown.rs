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

use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc;

use tokio::sync::watch;

use super::defs::*;
use crate::backend::registry;
use crate::managesieve::server::Server;
use crate::support::system_config::SystemConfig;

#[test]
fn session_says_goodbye() {
    let setup = set_up();
    let (tx, rx) = watch::channel(false);
    let mut client =
        setup.connect_with_shutdown("shutdown", setup.config(), rx);
    client.quick_log_in("yellow");

    tx.send(true).unwrap();
    assert_eq!(vec!["BYE \"Server shutting down\""], client.read_response());
    client.expect_eof();
}

#[test]
fn command_in_progress_completes_first() {
    let setup = set_up();
    let (tx, rx) = watch::channel(false);
    let mut client =
        setup.connect_with_shutdown("shutdownlate", setup.config(), rx);
    client.quick_log_in("zaffre");

    client.write_line("PUTSCRIPT \"late\" {5}");
    assert_eq!("OK \"Ready for 5 bytes\"", client.read_line());
    tx.send(true).unwrap();
    client.write_raw(b"keep;\r\n");

    assert_eq!(vec!["OK"], client.read_response());
    assert_eq!(vec!["BYE \"Server shutting down\""], client.read_response());
    client.expect_eof();

    assert!(setup.home("zaffre").join("sieve/late").is_file());
}

#[tokio::main(flavor = "current_thread")]
async fn run_listener(
    config: SystemConfig,
    addr_tx: mpsc::Sender<SocketAddr>,
    shutdown: watch::Receiver<bool>,
) {
    let backends = registry::build(&config, Path::new("/")).unwrap();
    let server = Rc::new(Server::new(&config, backends, None));
    let listener =
        tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    addr_tx.send(listener.local_addr().unwrap()).unwrap();

    let local = tokio::task::LocalSet::new();
    local.run_until(server.run(listener, shutdown)).await;
}

#[test]
fn listener_stops_and_drains() {
    let setup = set_up();
    let config = setup.config();
    let (tx, rx) = watch::channel(false);
    let (addr_tx, addr_rx) = mpsc::channel();
    let server_thread =
        std::thread::spawn(move || run_listener(config, addr_tx, rx));
    let addr = addr_rx.recv().unwrap();

    let mut first =
        SieveClient::new("listen1", TcpStream::connect(addr).unwrap());
    let mut second =
        SieveClient::new("listen2", TcpStream::connect(addr).unwrap());
    first.quick_log_in("azure");
    second.skip_greeting();

    tx.send(true).unwrap();
    for client in [&mut first, &mut second] {
        assert_eq!(
            vec!["BYE \"Server shutting down\""],
            client.read_response()
        );
        client.expect_eof();
    }

    server_thread.join().unwrap();
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn stalled_literal_does_not_block_shutdown() {
    let setup = set_up();
    let mut config = setup.config();
    config.server.idle_timeout_secs = 1;
    let (tx, rx) = watch::channel(false);
    let (addr_tx, addr_rx) = mpsc::channel();
    let server_thread =
        std::thread::spawn(move || run_listener(config, addr_tx, rx));
    let addr = addr_rx.recv().unwrap();

    let mut client =
        SieveClient::new("stalledshutdown", TcpStream::connect(addr).unwrap());
    client.quick_log_in("celadon");
    client.write_line("PUTSCRIPT \"x\" {100}");
    assert_eq!("OK \"Ready for 100 bytes\"", client.read_line());
    client.write_raw(b"ab");
    tx.send(true).unwrap();

    // Never answered; the idle timeout ends the session and the server with
    // it.
    client.expect_eof();
    server_thread.join().unwrap();
    assert!(!setup.home("celadon").join("sieve/x").exists());
}
