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

//! Script storage for Exim's Sieve filter support.
//!
//! Exim only treats a `.forward` file as a Sieve filter if it starts with
//! `# Sieve filter`, so this is the file store with that header added to
//! every upload, validated by `sendmail -bf` before it is committed. A user
//! who already had a Sieve `.forward` gets it moved into the scripts
//! directory as `exim` and activated the first time their store is opened.

use std::fs;

use log::{info, warn};

use super::file_store::{FileStore, Layout, Validator};
use super::{ScriptStore, StorageHandle, StoreFactory};
use crate::support::error::Error;
use crate::support::system_config::EximConfig;

pub const SIEVE_HEADER: &[u8] = b"# Sieve filter";
/// The name given to a pre-existing filter when it is migrated.
pub const MIGRATED_NAME: &str = "exim";

/// Normalise line endings to LF, add the header unless it is already there,
/// and make sure the script ends with a newline.
pub fn with_header(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + SIEVE_HEADER.len() + 2);
    if !content.starts_with(SIEVE_HEADER) {
        out.extend_from_slice(SIEVE_HEADER);
        out.push(b'\n');
    }

    let mut bytes = content.iter().copied().peekable();
    while let Some(b) = bytes.next() {
        if b'\r' == b && Some(&b'\n') == bytes.peek() {
            continue;
        }
        out.push(b);
    }

    if Some(&b'\n') != out.last() {
        out.push(b'\n');
    }
    out
}

pub struct EximStoreFactory {
    layout: Layout,
    validator: Option<Validator>,
}

impl EximStoreFactory {
    pub fn new(config: &EximConfig) -> Self {
        Self {
            layout: Layout {
                scripts: config.scripts.clone(),
                active: config.active.clone(),
                quota: config.quota,
            },
            validator: if config.sendmail.is_empty() {
                None
            } else {
                Some(Validator {
                    program: config.sendmail.clone(),
                    args: vec!["-bf".to_owned()],
                })
            },
        }
    }
}

impl StoreFactory for EximStoreFactory {
    fn open(
        &self,
        handle: &StorageHandle,
    ) -> Result<Box<dyn ScriptStore>, Error> {
        let store = FileStore::open(
            &handle.home,
            &self.layout,
            self.validator.clone(),
            with_header,
        )?;

        if let Err(e) = migrate(&store) {
            warn!(
                "Failed to migrate existing filter for {}: {}",
                handle.username, e
            );
        }

        Ok(Box::new(store))
    }
}

/// If the active file is a real file holding a Sieve filter, move it into the
/// scripts directory and activate it there.
fn migrate(store: &FileStore) -> Result<(), Error> {
    let active = store.active_link();
    match fs::symlink_metadata(active) {
        Ok(md) if md.file_type().is_file() => (),
        _ => return Ok(()),
    }

    let _lock = store.lock()?;
    // Re-check under the lock in case another session got here first.
    match fs::symlink_metadata(active) {
        Ok(md) if md.file_type().is_file() => (),
        _ => return Ok(()),
    }

    let content = fs::read(active)?;
    if !content.starts_with(SIEVE_HEADER) {
        return Ok(());
    }

    fs::rename(active, store.scripts_dir().join(MIGRATED_NAME))?;
    store.activate_locked(MIGRATED_NAME)?;
    info!("Migrated {} into scripts as '{}'", active.display(), MIGRATED_NAME);
    Ok(())
}
