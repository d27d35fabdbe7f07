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

//! Authentication against a file of `user:hash` lines.
//!
//! Hashes are Argon2 encoded strings as written by `sievemap passwd`. Blank
//! lines and lines starting with `#` are ignored. The file is re-read on every
//! attempt, so edits take effect without a restart.

use std::fs;
use std::path::PathBuf;

use lazy_static::lazy_static;

use super::Authenticator;
use crate::support::error::Error;

lazy_static! {
    /// Verified against when the user does not exist, so that an unknown
    /// user costs the same time as a wrong password.
    static ref DUMMY_HASH: Result<String, argon2::Error> =
        argon2::hash_encoded(b"dummy", b"0123456789abcdef", &config());
}

fn config() -> argon2::Config<'static> {
    argon2::Config {
        hash_length: 32,
        lanes: 1,
        mem_cost: 4096,
        thread_mode: argon2::ThreadMode::Sequential,
        time_cost: 10,
        variant: argon2::Variant::Argon2i,
        version: argon2::Version::Version13,
        ..argon2::Config::default()
    }
}

/// Produce the hash half of a passwd line for `password`.
///
/// The salt is randomly generated each call.
pub fn hash_password(password: &str) -> Result<String, Error> {
    let mut salt = [0u8; 16];
    openssl::rand::rand_bytes(&mut salt)?;
    Ok(argon2::hash_encoded(password.as_bytes(), &salt, &config())?)
}

pub struct PasswdAuthenticator {
    path: PathBuf,
}

impl PasswdAuthenticator {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn find_hash(&self, username: &str) -> Result<Option<String>, Error> {
        let data = fs::read_to_string(&self.path)?;
        Ok(data
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .find(|&(user, _)| user == username)
            .map(|(_, hash)| hash.to_owned()))
    }
}

impl Authenticator for PasswdAuthenticator {
    fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, Error> {
        match self.find_hash(username)? {
            Some(hash) => {
                // A malformed hash can never match.
                Ok(argon2::verify_encoded(&hash, password.as_bytes())
                    .unwrap_or(false))
            },
            None => {
                if let Ok(ref dummy) = *DUMMY_HASH {
                    let _ = argon2::verify_encoded(dummy, password.as_bytes());
                }
                Ok(false)
            },
        }
    }
}
