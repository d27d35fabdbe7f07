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

use super::defs::*;
use crate::support::file_ops;

#[test]
fn put_and_get() {
    let setup = set_up();
    let mut client = setup.connect("putget");
    client.quick_log_in("beryl");

    let content = "require \"fileinto\";\r\nfileinto \"Junk\";\r\n";
    assert_eq!("OK", client.put_script("junk", content));
    assert_eq!(
        vec![
            format!("{{{}}}", content.len()),
            content.to_owned(),
            String::new(),
            "OK".to_owned(),
        ],
        client.command("GETSCRIPT \"junk\"")
    );
    assert_eq!(
        content.as_bytes(),
        &fs::read(setup.home("beryl").join("sieve/junk")).unwrap()[..]
    );

    // Replacing
    assert_eq!("OK", client.put_script("junk", "discard;"));
    assert_eq!(
        vec!["{8}", "discard;", "", "OK"],
        client.command("GETSCRIPT \"junk\"")
    );

    assert_eq!(
        "NO \"No script by that name\"",
        client.simple_command("GETSCRIPT \"nothing\"")
    );
}

#[test]
fn list_and_activate() {
    let setup = set_up();
    let mut client = setup.connect("listact");
    client.quick_log_in("cobalt");

    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));

    assert_eq!("OK", client.put_script("vacation", "keep;"));
    assert_eq!("OK", client.put_script("spam", "discard;"));
    assert_eq!(
        vec!["\"spam\"", "\"vacation\"", "OK"],
        client.command("LISTSCRIPTS")
    );

    assert_eq!("OK", client.simple_command("SETACTIVE \"vacation\""));
    assert_eq!(
        vec!["\"spam\"", "\"vacation\" ACTIVE", "OK"],
        client.command("LISTSCRIPTS")
    );
    assert_eq!(
        b"keep;",
        &fs::read(setup.home("cobalt").join("active.sieve")).unwrap()[..]
    );

    assert_eq!("OK", client.simple_command("SETACTIVE \"spam\""));
    assert_eq!(
        vec!["\"spam\" ACTIVE", "\"vacation\"", "OK"],
        client.command("LISTSCRIPTS")
    );

    assert_eq!(
        "NO \"No script by that name\"",
        client.simple_command("SETACTIVE \"nothing\"")
    );
    // The failed activation changed nothing
    assert_eq!(
        vec!["\"spam\" ACTIVE", "\"vacation\"", "OK"],
        client.command("LISTSCRIPTS")
    );

    assert_eq!("OK", client.simple_command("SETACTIVE \"\""));
    assert_eq!(
        vec!["\"spam\"", "\"vacation\"", "OK"],
        client.command("LISTSCRIPTS")
    );
    assert!(!setup.home("cobalt").join("active.sieve").exists());
    // Deactivating with nothing active is fine
    assert_eq!("OK", client.simple_command("SETACTIVE \"\""));
}

#[test]
fn delete() {
    let setup = set_up();
    let mut client = setup.connect("delete");
    client.quick_log_in("dun");

    assert_eq!("OK", client.put_script("a", "keep;"));
    assert_eq!("OK", client.put_script("b", "keep;"));
    assert_eq!("OK", client.simple_command("SETACTIVE \"a\""));

    assert_eq!(
        "NO \"Script is active\"",
        client.simple_command("DELETESCRIPT \"a\"")
    );
    assert_eq!("OK", client.simple_command("DELETESCRIPT \"b\""));
    assert_eq!(
        "NO \"No script by that name\"",
        client.simple_command("DELETESCRIPT \"b\"")
    );
    assert_eq!(
        vec!["\"a\" ACTIVE", "OK"],
        client.command("LISTSCRIPTS")
    );

    assert_eq!("OK", client.simple_command("SETACTIVE \"\""));
    assert_eq!("OK", client.simple_command("DELETESCRIPT \"a\""));
    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn have_space() {
    let setup = set_up();
    let mut client = setup.connect("havespace");
    client.quick_log_in("ecru");

    assert_eq!("OK", client.simple_command("HAVESPACE \"foo\" 100"));
    assert_eq!("OK", client.simple_command("HAVESPACE \"foo\" 4096"));
    assert_eq!(
        "NO (QUOTA) \"Quota exceeded\"",
        client.simple_command("HAVESPACE \"foo\" 4097")
    );
    assert_eq!(
        "NO (QUOTA) \"Quota exceeded\"",
        client.simple_command("HAVESPACE \"foo\" 999999999999")
    );
    assert_eq!(
        "NO \"Not a number\"",
        client.simple_command("HAVESPACE \"foo\" \"lots\"")
    );
    assert_eq!(
        "NO \"Not a number\"",
        client.simple_command("HAVESPACE \"foo\" -1")
    );
    assert_eq!(
        "NO \"Not a number\"",
        client.simple_command("HAVESPACE \"foo\" +5")
    );
    assert_eq!(
        "NO \"Invalid script name\"",
        client.simple_command("HAVESPACE \"../foo\" 1")
    );
    assert_eq!(
        "NO \"Syntax error\"",
        client.simple_command("HAVESPACE \"foo\"")
    );
}

#[test]
fn have_space_ignores_replacement() {
    let setup = set_up();
    let mut client = setup.connect("havespacerepl");
    client.quick_log_in("fulvous");

    assert_eq!("OK", client.put_script("big", &"#".repeat(4000)));
    assert_eq!("OK", client.simple_command("HAVESPACE \"other\" 96"));
    assert_eq!(
        "NO (QUOTA) \"Quota exceeded\"",
        client.simple_command("HAVESPACE \"other\" 100")
    );
    // Only the remaining quota counts, even for the name already stored
    assert_eq!(
        "NO (QUOTA) \"Quota exceeded\"",
        client.simple_command("HAVESPACE \"big\" 4000")
    );

    // Storing does get the old script's bytes back
    assert_eq!(
        "NO (QUOTA) \"Quota exceeded\"",
        client.put_script("other", &"#".repeat(100))
    );
    assert_eq!("OK", client.put_script("big", &"#".repeat(4096)));
}

#[test]
fn oversize_upload_refused_before_reading() {
    let setup = set_up();
    let mut client = setup.connect("putquota");
    client.quick_log_in("gamboge");

    // No continuation for a synchronizing literal that can't fit; the client
    // must not send it.
    client.write_line("PUTSCRIPT \"big\" {5000}");
    assert_eq!(
        vec!["NO (QUOTA) \"Quota exceeded\""],
        client.read_response()
    );

    // A non-synchronizing literal arrives anyway and is skipped.
    assert_eq!(
        "NO (QUOTA) \"Quota exceeded\"",
        client.put_script("big", &"#".repeat(5000))
    );

    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
    assert_eq!("OK", client.put_script("small", "keep;"));
    assert_eq!(vec!["\"small\"", "OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn invalid_names() {
    let setup = set_up();
    let mut client = setup.connect("badnames");
    client.quick_log_in("jasper");

    let invalid = "NO \"Invalid script name\"";
    assert_eq!(invalid, client.put_script(".hidden", "keep;"));
    assert_eq!(invalid, client.put_script("a/b", "keep;"));
    assert_eq!(invalid, client.put_script("", "keep;"));
    assert_eq!(invalid, client.simple_command("GETSCRIPT \"../passwd\""));
    assert_eq!(invalid, client.simple_command("DELETESCRIPT \".lock\""));
    assert_eq!(invalid, client.simple_command("SETACTIVE \"..\""));

    assert_eq!(vec!["OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn validator_rejection() {
    let setup = set_up();
    let validator = setup.root().join("khaki-validator.sh");
    fs::write(
        &validator,
        r#"#!/bin/sh
if grep -q reject "$1"; then
    echo 'line 1: unknown command "reject"' >&2
    exit 1
fi
exit 0
"#,
    )
    .unwrap();
    file_ops::chmod(&validator, 0o755).unwrap();

    let mut config = setup.config();
    config.file.validator = validator.to_str().unwrap().to_owned();
    let mut client = setup.connect_with("validator", config);
    client.quick_log_in("khaki");

    assert_eq!("OK", client.put_script("fine", "keep;"));
    assert_eq!(
        "NO \"line 1: unknown command \\\"reject\\\"\"",
        client.put_script("bad", "reject \"no\";")
    );
    assert_eq!(vec!["\"fine\"", "OK"], client.command("LISTSCRIPTS"));
}

#[test]
fn exim_header_added() {
    let setup = set_up();
    let mut config = setup.config();
    config.backend.storage = "exim".to_owned();
    let mut client = setup.connect_with("eximheader", config);
    client.quick_log_in("heliotrope");

    assert_eq!("OK", client.put_script("test", "# This is a test"));
    let stored = "# Sieve filter\n# This is a test\n";
    assert_eq!(
        vec![
            format!("{{{}}}", stored.len()),
            stored.to_owned(),
            String::new(),
            "OK".to_owned(),
        ],
        client.command("GETSCRIPT \"test\"")
    );

    // A script which already has the header is stored as it is, apart from
    // line endings.
    assert_eq!(
        "OK",
        client.put_script("other", "# Sieve filter\r\nkeep;\r\n")
    );
    assert_eq!(
        vec!["{21}", "# Sieve filter\nkeep;\n", "", "OK"],
        client.command("GETSCRIPT \"other\"")
    );

    assert_eq!("OK", client.simple_command("SETACTIVE \"test\""));
    assert_eq!(
        stored.as_bytes(),
        &fs::read(setup.home("heliotrope").join(".forward")).unwrap()[..]
    );
}

#[test]
fn exim_existing_filter_migrated() {
    let setup = set_up();
    let home = setup.home("indigo");
    fs::create_dir_all(&home).unwrap();
    let filter = "# Sieve filter\nkeep;\ndiscard;\n";
    fs::write(home.join(".forward"), filter).unwrap();

    let mut config = setup.config();
    config.backend.storage = "exim".to_owned();
    let mut client = setup.connect_with("eximmigrate", config);
    client.quick_log_in("indigo");

    assert_eq!(
        vec!["\"exim\" ACTIVE", "OK"],
        client.command("LISTSCRIPTS")
    );
    assert_eq!(
        vec![
            format!("{{{}}}", filter.len()),
            filter.to_owned(),
            String::new(),
            "OK".to_owned(),
        ],
        client.command("GETSCRIPT \"exim\"")
    );
    assert!(fs::symlink_metadata(home.join(".forward"))
        .unwrap()
        .file_type()
        .is_symlink());
}
