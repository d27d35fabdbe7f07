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

use super::defs::*;
use crate::support::system_config::{SystemConfig, TlsConfig};

fn tls_config(setup: &Setup, required: bool) -> SystemConfig {
    let mut config = setup.config();
    config.tls = Some(TlsConfig {
        required,
        ..TlsConfig::default()
    });
    config
}

#[test]
fn start_tls() {
    let setup = set_up();
    let mut client = setup.connect_with("starttls", tls_config(&setup, false));

    let greeting = client.skip_greeting();
    assert_eq!("\"STARTTLS\"", greeting[greeting.len() - 2]);

    assert_eq!("OK", client.simple_command("STARTTLS"));
    client.start_tls();

    // The capabilities are sent again without being asked for
    let caps = client.read_response();
    assert_eq!(greeting.len() - 1, caps.len());
    assert!(!caps.contains(&"\"STARTTLS\"".to_owned()));
    assert_eq!("OK", caps.last().unwrap());
    assert_eq!(caps, client.command("CAPABILITY"));

    assert_eq!(
        "NO \"Already in TLS mode\"",
        client.simple_command("STARTTLS")
    );

    assert_eq!("OK", client.authenticate("taupe", PASSWORD));
    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn start_tls_after_authentication() {
    let setup = set_up();
    let mut client =
        setup.connect_with("starttlsauth", tls_config(&setup, false));
    client.quick_log_in("umber");

    assert_eq!(
        "NO \"Already authenticated\"",
        client.simple_command("STARTTLS")
    );
    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn start_tls_unavailable() {
    let setup = set_up();
    let mut client = setup.connect("notls");
    client.skip_greeting();

    assert_eq!(
        "NO \"TLS not available\"",
        client.simple_command("STARTTLS")
    );
    assert_eq!("OK", client.authenticate("wenge", PASSWORD));
}

#[test]
fn tls_required() {
    let setup = set_up();
    let mut client = setup.connect_with("tlsreq", tls_config(&setup, true));
    client.skip_greeting();

    let refused = "NO \"TLS required\"";
    assert_eq!(refused, client.authenticate("vermilion", PASSWORD));
    assert_eq!(refused, client.simple_command("LISTSCRIPTS"));
    assert_eq!(refused, client.put_script("x", "keep;"));
    assert_eq!("OK", client.command("CAPABILITY").last().unwrap());

    assert_eq!("OK", client.simple_command("STARTTLS"));
    client.start_tls();
    client.skip_greeting();

    assert_eq!("OK", client.authenticate("vermilion", PASSWORD));
    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn implicit_tls() {
    let setup = set_up();
    let mut config = tls_config(&setup, true);
    config.server.implicit_tls = true;
    let mut client = setup.connect_with("implicittls", config);

    client.start_tls();
    let greeting = client.skip_greeting();
    assert!(greeting[0].starts_with("\"IMPLEMENTATION\""));
    assert!(!greeting.contains(&"\"STARTTLS\"".to_owned()));

    assert_eq!(
        "NO \"Already in TLS mode\"",
        client.simple_command("STARTTLS")
    );
    assert_eq!("OK", client.authenticate("xanadu", PASSWORD));
    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}
