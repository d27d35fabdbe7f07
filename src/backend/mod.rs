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

//! The contracts through which the protocol engine reaches authentication,
//! user lookup and script storage, and the implementations shipped with
//! Sievemap.
//!
//! Every method here is blocking. The session runs them on Tokio's blocking
//! pool, which is why everything must be `Send + Sync`.

use std::path::PathBuf;

use crate::support::error::Error;

pub mod exim;
pub mod file_store;
pub mod passwd;
pub mod registry;
pub mod virtual_user;

/// Decides whether a user name and password are valid.
pub trait Authenticator: Send + Sync {
    /// Returns `Ok(false)` for any unknown user or wrong password.
    ///
    /// Must have no side effects.
    fn authenticate(&self, username: &str, password: &str)
        -> Result<bool, Error>;
}

/// Maps an authenticated identity to where its scripts live.
pub trait UserResolver: Send + Sync {
    fn resolve(&self, username: &str) -> Result<StorageHandle, Error>;
}

/// An opaque pointer to a user's script storage, produced by a
/// `UserResolver` and consumed by a `StoreFactory`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageHandle {
    pub username: String,
    pub home: PathBuf,
}

/// Binds a `ScriptStore` to a resolved user.
pub trait StoreFactory: Send + Sync {
    fn open(&self, handle: &StorageHandle)
        -> Result<Box<dyn ScriptStore>, Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptInfo {
    pub name: String,
    pub active: bool,
}

/// One user's scripts.
///
/// Implementations must make `put`, `delete` and `set_active` linearizable
/// for a given user, including across processes sharing the same storage:
/// at no point may two scripts be observably active.
///
/// Names passed in are not pre-validated; implementations reject unsafe ones
/// with `Error::UnsafeName`.
pub trait ScriptStore: Send + Sync {
    /// All scripts, ordered by name.
    fn list(&self) -> Result<Vec<ScriptInfo>, Error>;

    /// Fails with `NxScript` if there is no such script.
    fn get(&self, name: &str) -> Result<Vec<u8>, Error>;

    /// Create or replace a script.
    ///
    /// Validation happens before anything is committed; on any failure the
    /// stored state is unchanged. Fails with `QuotaExceeded` if the result
    /// would not fit, or `ValidationFailed` if the script is rejected.
    fn put(&self, name: &str, content: &[u8]) -> Result<(), Error>;

    /// Fails with `NxScript` or `ScriptActive`.
    fn delete(&self, name: &str) -> Result<(), Error>;

    /// Make `name` the only active script, or deactivate everything if
    /// `None`. Fails with `NxScript` if `name` does not exist.
    fn set_active(&self, name: Option<&str>) -> Result<(), Error>;

    /// The number of bytes still available under the quota.
    fn quota_remaining(&self) -> Result<u64, Error>;

    /// The stored size of `name`, or `None` if it does not exist.
    fn size_of(&self, name: &str) -> Result<Option<u64>, Error> {
        match self.get(name) {
            Ok(data) => Ok(Some(data.len() as u64)),
            Err(Error::NxScript) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
