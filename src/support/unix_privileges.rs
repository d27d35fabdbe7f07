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

use std::ffi::CString;

use log::{error, info};

use super::sysexits::*;
use super::system_config::SecurityConfig;

/// If a system user is configured, switch to it if not already that user.
///
/// This is done exactly once, after the listener is bound and the TLS keys are
/// loaded, and before any client is served. Every session then shares the
/// same credentials, which is the only arrangement compatible with sessions
/// running concurrently in one process.
///
/// On failure, an error message has already been logged, and the appropriate
/// exit code is returned.
pub fn assume_system(security: &SecurityConfig) -> Result<(), Sysexit> {
    macro_rules! fatal {
        ($sysexit:expr, $($stuff:tt)*) => {{
            error!($($stuff)*);
            return Err($sysexit)
        }}
    }

    if security.system_user.is_empty() {
        if nix::unistd::ROOT == nix::unistd::geteuid() {
            info!(
                "Running as root; set [security].system_user in \
                 sievemap.toml to run as something else"
            );
        }
        return Ok(());
    }

    let system_user = match nix::unistd::User::from_name(&security.system_user)
    {
        Ok(Some(user)) => user,
        Ok(None) => fatal!(
            EX_NOUSER,
            "system_user '{}' does not exist!",
            security.system_user
        ),
        Err(e) => fatal!(
            EX_OSFILE,
            "Unable to look up system_user '{}': {}",
            security.system_user,
            e
        ),
    };

    if nix::unistd::ROOT == system_user.uid {
        fatal!(EX_USAGE, "system_user must not be root");
    }

    if system_user.uid == nix::unistd::getuid() {
        return Ok(());
    }

    let user_name = match CString::new(system_user.name.clone()) {
        Ok(name) => name,
        Err(_) => fatal!(EX_NOUSER, "system_user name contains NUL"),
    };

    if let Err(e) = nix::unistd::initgroups(&user_name, system_user.gid) {
        fatal!(EX_OSERR, "Unable to set up groups for system user: {}", e);
    }

    if let Err(e) = nix::unistd::setgid(system_user.gid)
        .and_then(|_| nix::unistd::setuid(system_user.uid))
    {
        fatal!(
            EX_OSERR,
            "Failed to set UID:GID to {}:{}: {}",
            system_user.uid,
            system_user.gid,
            e
        );
    }

    info!(
        "Dropped privileges to {} ({}:{})",
        system_user.name, system_user.uid, system_user.gid
    );
    Ok(())
}
