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

//! Resolution of virtual users to storage directories by path template.

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::{StorageHandle, UserResolver};
use crate::support::error::Error;
use crate::support::system_config::VirtualConfig;

lazy_static! {
    static ref PATH_PATTERN: Regex =
        Regex::new(r"%(?:([0-9]+)(?:\.([0-9]+))?)?([ud%])").unwrap();
}

pub struct VirtualResolver {
    template: String,
    default_domain: String,
}

impl VirtualResolver {
    pub fn new(config: &VirtualConfig) -> Self {
        Self {
            template: config.path.clone(),
            default_domain: config.default_domain.clone(),
        }
    }

    /// Substitute `username` into the template.
    pub fn expand(&self, username: &str) -> String {
        let (user, domain) = username
            .split_once('@')
            .unwrap_or((username, self.default_domain.as_str()));

        PATH_PATTERN
            .replace_all(&self.template, |c: &Captures| {
                let s = match c.get(3).map(|m| m.as_str()) {
                    Some("u") => user,
                    Some("d") => domain,
                    _ => return "%".to_owned(),
                };

                let number = |ix| {
                    c.get(ix).and_then(|m| m.as_str().parse::<usize>().ok())
                };
                match (number(1), number(2)) {
                    (None, _) => s.to_owned(),
                    (Some(n), None) => s.chars().take(n).collect(),
                    (Some(n), Some(m)) => s.chars().skip(n).take(m).collect(),
                }
            })
            .into_owned()
    }
}

impl UserResolver for VirtualResolver {
    fn resolve(&self, username: &str) -> Result<StorageHandle, Error> {
        // Slashes or dot segments in the identity would let one user's
        // directory be chosen by another.
        if username.is_empty()
            || username.contains(|c: char| '/' == c || c.is_control())
            || username.split('@').any(|part| part.starts_with('.'))
        {
            return Err(Error::NoSuchUser);
        }

        Ok(StorageHandle {
            username: username.to_owned(),
            home: PathBuf::from(self.expand(username)),
        })
    }
}
