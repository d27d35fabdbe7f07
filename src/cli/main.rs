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
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run the ManageSieve server.
    ///
    /// The server listens on the address and port in `sievemap.toml` until it
    /// receives SIGINT or SIGTERM, at which point it stops accepting
    /// connections, tells idle clients goodbye, and exits once every session
    /// has ended.
    ///
    /// If `[security].system_user` is set, privileges are dropped to that
    /// user after the listener is bound and the TLS key is loaded.
    Serve(ServeSubcommand),
    /// Hash a password for the `passwd` authenticator.
    ///
    /// Prompts for the password twice, then prints a line suitable for
    /// appending to the passwd file.
    Passwd(PasswdSubcommand),
}

#[derive(StructOpt)]
pub(super) struct ServeSubcommand {
    /// The directory containing `sievemap.toml` etc
    /// [default: /etc/sievemap or /usr/local/etc/sievemap]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct PasswdSubcommand {
    /// Name of the user the line is for.
    pub(super) user: String,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    match cmd {
        Command::Serve(cmd) => serve(cmd),
        Command::Passwd(cmd) => super::passwd::passwd(cmd),
    }
}

fn serve(cmd: ServeSubcommand) {
    let root = cmd.root.unwrap_or_else(|| {
        if Path::new("/etc/sievemap/sievemap.toml").is_file() {
            "/etc/sievemap".to_owned().into()
        } else if Path::new("/usr/local/etc/sievemap/sievemap.toml").is_file() {
            "/usr/local/etc/sievemap".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/sievemap nor /usr/local/etc/sievemap looks like\n\
                 the Sievemap root; use --root=/path/to/sievemap if your\n\
                 installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("sievemap.toml");
    let system_config_toml = match fs::read_to_string(&system_config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "Error reading '{}': {}",
                system_config_path.display(),
                e
            );
            EX_CONFIG.exit()
        },
    };

    let system_config: SystemConfig = match toml::from_str(&system_config_toml)
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Error in config file at '{}': {}",
                system_config_path.display(),
                e
            );
            EX_CONFIG.exit()
        },
    };

    init_log(&root);
    super::serve::serve(system_config, &root);
}

fn init_log(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    let result = if log_config_file.is_file() {
        log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        )
        .map_err(|e| e.to_string())
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        syslog::unix(formatter)
            .map_err(|e| e.to_string())
            .and_then(|logger| {
                log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
                    logger,
                )))
                .map_err(|e| e.to_string())
            })
            .map(|()| log::set_max_level(log::LevelFilter::Info))
    };

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
        EX_SOFTWARE.exit();
    }
}
