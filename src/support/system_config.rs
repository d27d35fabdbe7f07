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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Sievemap.
///
/// This is stored in a file named `sievemap.toml` under the Sievemap system
/// root, which is typically `/usr/local/etc/sievemap` or `/etc/sievemap`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Listener and protocol limits.
    #[serde(default)]
    pub server: ServerConfig,

    /// Configuration for TLS. If absent, neither STARTTLS nor implicit TLS
    /// is available.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// What to advertise in the capability block.
    #[serde(default)]
    pub capability: CapabilityConfig,

    /// Options relating to operational security of Sievemap.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Which backends to use for authentication, user lookup and script
    /// storage.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Options for the `passwd` authenticator.
    #[serde(default)]
    pub passwd: PasswdConfig,

    /// Options for the `virtual` user resolver.
    #[serde(default, rename = "virtual")]
    pub virtual_user: VirtualConfig,

    /// Options for the `file` script store.
    #[serde(default)]
    pub file: FileStoreConfig,

    /// Options for the `exim` script store.
    #[serde(default)]
    pub exim: EximConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to listen on.
    pub bind: String,
    /// The TCP port to listen on.
    pub port: u16,
    /// If true, every connection starts with a TLS handshake and STARTTLS is
    /// never offered.
    pub implicit_tls: bool,
    /// Connections which send nothing for this long are dropped silently.
    pub idle_timeout_secs: u64,
    /// The maximum number of non-literal bytes in one command line.
    pub max_line: usize,
    /// The maximum size of any single literal.
    pub max_literal: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "::".to_owned(),
            port: 4190,
            implicit_tls: false,
            idle_timeout_secs: 30 * 60,
            max_line: 65536,
            max_literal: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    ///
    /// Relative paths are relative to the system root.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
    /// If non-empty, the passphrase protecting `private_key`.
    #[serde(default)]
    pub passphrase: String,
    /// If true, clients must issue STARTTLS before anything but CAPABILITY
    /// and LOGOUT.
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Reported as `IMPLEMENTATION`.
    pub implementation: String,
    /// Space-separated SASL mechanisms. Only `PLAIN` is implemented.
    pub sasl: String,
    /// Space-separated Sieve extensions supported by whatever finally
    /// executes the scripts.
    pub sieve: String,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            implementation: format!("sievemap {}", env!("CARGO_PKG_VERSION")),
            sasl: "PLAIN".to_owned(),
            sieve: "envelope fileinto encoded-character enotify subaddress \
                    vacation copy comparator-i;ascii-casemap \
                    comparator-en;ascii-casemap comparator-i;octet \
                    comparator-i;ascii-numeric"
                .to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// If non-empty, set the process UID and GID to those of this user after
    /// binding the listener and loading the TLS keys, but before accepting any
    /// connection. The name must refer to a non-root user.
    ///
    /// All script storage is accessed as this user. If unset and Sievemap is
    /// started as root, it keeps running as root.
    #[serde(default)]
    pub system_user: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// The authenticator; see `backend::registry`.
    pub auth: String,
    /// The user resolver.
    pub userdb: String,
    /// The script store.
    pub storage: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            auth: "passwd".to_owned(),
            userdb: "virtual".to_owned(),
            storage: "file".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PasswdConfig {
    /// File of `user:hash` lines, as produced by `sievemap passwd`.
    pub file: PathBuf,
}

impl Default for PasswdConfig {
    fn default() -> Self {
        Self {
            file: "passwd".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VirtualConfig {
    /// Template for the storage directory of each user.
    ///
    /// `%u` is the local part of the user name, `%d` the domain, `%%` a
    /// literal percent sign. `%N.Mu` takes `M` characters starting at
    /// character `N` of the local part, and `%Nu` the first `N` characters.
    /// Both forms work with `d` as well.
    pub path: String,
    /// Domain used when the user name has no `@`.
    pub default_domain: String,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            path: "/var/mail/%d/%u".to_owned(),
            default_domain: "localhost".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Directory holding the scripts, relative to the user's storage
    /// directory.
    pub scripts: PathBuf,
    /// Name of the symlink to the active script, relative to the user's
    /// storage directory.
    pub active: PathBuf,
    /// Total byte budget for one user's scripts.
    pub quota: u64,
    /// If non-empty, a command run with the path of each uploaded script as
    /// its only argument. A non-zero exit rejects the script, and whatever
    /// the command wrote to standard error becomes the message.
    pub validator: String,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            scripts: "sieve".into(),
            active: "active.sieve".into(),
            quota: 1024 * 1024,
            validator: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EximConfig {
    /// Path to the Exim `sendmail` binary used to validate filters with
    /// `-bf`. Empty disables validation.
    pub sendmail: String,
    /// Directory holding the scripts, relative to the user's storage
    /// directory.
    pub scripts: PathBuf,
    /// The file Exim reads the active filter from.
    pub active: PathBuf,
    /// Total byte budget for one user's scripts.
    pub quota: u64,
}

impl Default for EximConfig {
    fn default() -> Self {
        Self {
            sendmail: "/usr/sbin/sendmail".to_owned(),
            scripts: ".sieve".into(),
            active: ".forward".into(),
            quota: 1024 * 1024,
        }
    }
}
