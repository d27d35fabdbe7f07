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

//! Mapping of backend names in `sievemap.toml` to implementations.

use std::path::Path;
use std::sync::Arc;

use super::exim::EximStoreFactory;
use super::file_store::FileStoreFactory;
use super::passwd::PasswdAuthenticator;
use super::virtual_user::VirtualResolver;
use super::{Authenticator, StoreFactory, UserResolver};
use crate::support::error::Error;
use crate::support::system_config::SystemConfig;

type Constructor<T> = fn(&SystemConfig, &Path) -> Arc<T>;

static AUTHENTICATORS: &[(&str, Constructor<dyn Authenticator>)] =
    &[("passwd", |config, root| {
        Arc::new(PasswdAuthenticator::new(root.join(&config.passwd.file)))
    })];

static USER_RESOLVERS: &[(&str, Constructor<dyn UserResolver>)] =
    &[("virtual", |config, _| {
        Arc::new(VirtualResolver::new(&config.virtual_user))
    })];

static STORE_FACTORIES: &[(&str, Constructor<dyn StoreFactory>)] = &[
    ("file", |config, _| Arc::new(FileStoreFactory::new(&config.file))),
    ("exim", |config, _| Arc::new(EximStoreFactory::new(&config.exim))),
];

/// The backends chosen by the configuration, shared by all sessions.
#[derive(Clone)]
pub struct Backends {
    pub auth: Arc<dyn Authenticator>,
    pub userdb: Arc<dyn UserResolver>,
    pub storage: Arc<dyn StoreFactory>,
}

fn lookup<T: ?Sized>(
    table: &[(&str, Constructor<T>)],
    kind: &str,
    name: &str,
    config: &SystemConfig,
    root: &Path,
) -> Result<Arc<T>, Error> {
    table
        .iter()
        .find(|&&(n, _)| n == name)
        .map(|&(_, constructor)| constructor(config, root))
        .ok_or_else(|| {
            Error::BackendConfig(format!(
                "unknown {} backend '{}' (available: {})",
                kind,
                name,
                table
                    .iter()
                    .map(|&(n, _)| n)
                    .collect::<Vec<_>>()
                    .join(", "),
            ))
        })
}

/// Instantiate the backends named in `config.backend`.
///
/// Relative paths in backend options are resolved against `root`, the
/// directory holding `sievemap.toml`.
pub fn build(config: &SystemConfig, root: &Path) -> Result<Backends, Error> {
    Ok(Backends {
        auth: lookup(
            AUTHENTICATORS,
            "auth",
            &config.backend.auth,
            config,
            root,
        )?,
        userdb: lookup(
            USER_RESOLVERS,
            "userdb",
            &config.backend.userdb,
            config,
            root,
        )?,
        storage: lookup(
            STORE_FACTORIES,
            "storage",
            &config.backend.storage,
            config,
            root,
        )?,
    })
}
