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

use std::time::{Duration, Instant};

use super::defs::*;

#[test]
fn synchronizing_literal() {
    let setup = set_up();
    let mut client = setup.connect("synclit");
    client.quick_log_in("lava");

    client.write_line("PUTSCRIPT \"s\" {5}");
    assert_eq!("OK \"Ready for 5 bytes\"", client.read_line());
    client.write_raw(b"keep;\r\n");
    assert_eq!(vec!["OK"], client.read_response());

    // Literals work for any string argument
    client.write_line("GETSCRIPT {1}");
    assert_eq!("OK \"Ready for 1 bytes\"", client.read_line());
    client.write_raw(b"s\r\n");
    assert_eq!(vec!["{5}", "keep;", "", "OK"], client.read_response());
}

#[test]
fn pipelined_commands() {
    let setup = set_up();
    let mut client = setup.connect("pipeline");
    client.quick_log_in("mauve");

    client.write_raw(
        b"PUTSCRIPT \"a\" {5+}\r\nkeep;\r\n\
          PUTSCRIPT {1+}\r\nb {8+}\r\ndiscard;\r\n\
          SETACTIVE \"b\"\r\n\
          LISTSCRIPTS\r\n",
    );
    assert_eq!(vec!["OK"], client.read_response());
    assert_eq!(vec!["OK"], client.read_response());
    assert_eq!(vec!["OK"], client.read_response());
    assert_eq!(
        vec!["\"a\"", "\"b\" ACTIVE", "OK"],
        client.read_response()
    );
}

#[test]
fn oversize_synchronizing_literal() {
    let setup = set_up();
    let mut client = setup.connect("bigsync");
    client.quick_log_in("navy");

    client.write_line("PUTSCRIPT \"x\" {9000}");
    assert_eq!(vec!["NO \"Literal too large\""], client.read_response());
    client.write_line("PUTSCRIPT \"x\" {99999999999999999999999}");
    assert_eq!(vec!["NO \"Literal too large\""], client.read_response());

    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn oversize_non_synchronizing_literal() {
    let setup = set_up();
    let mut client = setup.connect("bignonsync");
    client.quick_log_in("ochre");

    client.write_line("PUTSCRIPT \"x\" {9000+}");
    assert_eq!(vec!["BYE \"Literal too large\""], client.read_response());
    client.expect_eof();
}

#[test]
fn overlong_line() {
    let setup = set_up();
    let mut client = setup.connect("longline");
    client.quick_log_in("puce");

    assert_eq!(
        "NO \"Line too long\"",
        client.simple_command(&format!("GETSCRIPT \"{}\"", "x".repeat(2000)))
    );
    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));

    // The rest of the command, including its literal, is skipped.
    client.write_raw(
        format!(
            "PUTSCRIPT \"{}\" {{10+}}\r\n0123456789\r\n",
            "x".repeat(2000)
        )
        .as_bytes(),
    );
    assert_eq!(vec!["NO \"Line too long\""], client.read_response());
    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn malformed_commands() {
    let setup = set_up();
    let mut client = setup.connect("malformed");
    client.quick_log_in("quartz");

    assert_eq!("NO \"Unknown command\"", client.simple_command("FROB"));
    assert_eq!(
        "NO \"Unknown command\"",
        client.simple_command("NOOP \"tag\"")
    );
    assert_eq!(
        "NO \"Syntax error\"",
        client.simple_command("LISTSCRIPTS \"extra\"")
    );
    assert_eq!(
        "NO \"Syntax error\"",
        client.simple_command("\"LISTSCRIPTS\"")
    );
    assert_eq!(
        "NO \"Syntax error\"",
        client.simple_command("GETSCRIPT \"unterminated")
    );
    assert_eq!("NO \"Syntax error\"", client.simple_command(""));

    // A bare line feed ends a line too
    client.write_raw(b"LISTSCRIPTS\n");
    assert_eq!(vec!["OK"], client.read_response());
}

#[test]
fn script_content_is_opaque() {
    let setup = set_up();
    let mut client = setup.connect("opaque");
    client.quick_log_in("russet");

    let content = "# {5}\r\nLOGOUT\r\n\"unbalanced\\\r\n\r\n";
    assert_eq!("OK", client.put_script("odd", content));
    assert_eq!(
        vec![
            format!("{{{}}}", content.len()),
            content.to_owned(),
            String::new(),
            "OK".to_owned(),
        ],
        client.command("GETSCRIPT \"odd\"")
    );

    assert_eq!("OK", client.put_script("empty", ""));
    assert_eq!(
        vec!["{0}", "", "", "OK"],
        client.command("GETSCRIPT \"empty\"")
    );
}

#[test]
fn idle_timeout() {
    let setup = set_up();
    let mut config = setup.config();
    config.server.idle_timeout_secs = 1;
    let mut client = setup.connect_with("idle", config);
    client.quick_log_in("sepia");

    let start = Instant::now();
    client.expect_eof();
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[test]
fn stalled_literal_times_out() {
    let setup = set_up();
    let mut config = setup.config();
    config.server.idle_timeout_secs = 1;

    let mut client = setup.connect_with("stallednonsync", config.clone());
    client.quick_log_in("amber");
    client.write_raw(b"PUTSCRIPT \"x\" {100+}\r\nab");
    let start = Instant::now();
    client.expect_eof();
    assert!(start.elapsed() >= Duration::from_millis(900));
    assert!(!setup.home("amber").join("sieve/x").exists());

    let mut client = setup.connect_with("stalledsync", config);
    client.quick_log_in("bistre");
    client.write_line("PUTSCRIPT \"y\" {100}");
    assert_eq!("OK \"Ready for 100 bytes\"", client.read_line());
    client.write_raw(b"ab");
    let start = Instant::now();
    client.expect_eof();
    assert!(start.elapsed() >= Duration::from_millis(900));
    assert!(!setup.home("bistre").join("sieve/y").exists());
}
