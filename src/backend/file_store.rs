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

//! Script storage as plain files.
//!
//! Each user has a scripts directory holding one file per script, and the
//! active script is a symlink (elsewhere in the user's directory) into it.
//! Mutations hold an exclusive `flock` on `.lock` in the scripts directory, so
//! that they are linearizable across sessions and processes. Content is
//! replaced by rename and the active link by rename, so unlocked readers never
//! see a partial state.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{info, warn};

use super::{ScriptInfo, ScriptStore, StorageHandle, StoreFactory};
use crate::support::error::Error;
use crate::support::file_ops::{self, ErrorTransforms, IgnoreKinds, LockFile};
use crate::support::safe_name::is_safe_name;
use crate::support::system_config::FileStoreConfig;

const LOCK_FILE: &str = ".lock";
const MAX_MESSAGE: usize = 1024;

/// An external command which accepts or rejects a staged script.
#[derive(Clone, Debug)]
pub struct Validator {
    pub program: String,
    pub args: Vec<String>,
}

impl Validator {
    /// Run the command with `script` appended to the arguments, stdin
    /// connected to `/dev/null`.
    ///
    /// A non-zero exit status rejects the script, with whatever the command
    /// printed to standard error as the reason.
    pub fn run(&self, script: &Path) -> Result<(), Error> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        if output.status.success() {
            return Ok(());
        }

        let mut message = String::from_utf8_lossy(&output.stderr)
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .take(MAX_MESSAGE)
            .collect::<String>();
        message = message.trim().to_owned();
        if message.is_empty() {
            message = format!("Script rejected ({})", output.status);
        }

        Err(Error::ValidationFailed(message))
    }
}

/// Where a user's scripts live, relative to the user's directory.
#[derive(Clone, Debug)]
pub struct Layout {
    pub scripts: PathBuf,
    pub active: PathBuf,
    pub quota: u64,
}

pub struct FileStore {
    home: PathBuf,
    scripts_dir: PathBuf,
    active_link: PathBuf,
    /// What `active_link` points at for a script called `name` is
    /// `link_prefix/name`.
    link_prefix: PathBuf,
    quota: u64,
    validator: Option<Validator>,
    prepare: fn(&[u8]) -> Vec<u8>,
}

impl FileStore {
    /// Bind a store to the user directory `home`, creating the scripts
    /// directory if needed.
    ///
    /// `prepare` transforms uploaded content before it is validated, counted
    /// against the quota and stored.
    pub fn open(
        home: &Path,
        layout: &Layout,
        validator: Option<Validator>,
        prepare: fn(&[u8]) -> Vec<u8>,
    ) -> Result<Self, Error> {
        let scripts_dir = home.join(&layout.scripts);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&scripts_dir)?;

        Ok(Self {
            home: home.to_owned(),
            active_link: home.join(&layout.active),
            link_prefix: layout.scripts.clone(),
            scripts_dir,
            quota: layout.quota,
            validator,
            prepare,
        })
    }

    pub(super) fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub(super) fn active_link(&self) -> &Path {
        &self.active_link
    }

    pub(super) fn lock(&self) -> Result<LockFile, Error> {
        LockFile::acquire(self.scripts_dir.join(LOCK_FILE))
    }

    fn script_path(&self, name: &str) -> Result<PathBuf, Error> {
        if !is_safe_name(name) {
            return Err(Error::UnsafeName);
        }
        Ok(self.scripts_dir.join(name))
    }

    /// The name of the active script, if the active link points into the
    /// scripts directory.
    fn active_name(&self) -> Result<Option<String>, Error> {
        let target = match fs::read_link(&self.active_link) {
            Ok(target) => target,
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                return Ok(None)
            },
            // Exists but is not a symlink
            Err(e) if std::io::ErrorKind::InvalidInput == e.kind() => {
                return Ok(None)
            },
            Err(e) => return Err(e.into()),
        };

        let in_scripts = target.parent().map_or(false, |parent| {
            parent == self.link_prefix || parent == self.scripts_dir
        });
        Ok(target
            .file_name()
            .filter(|_| in_scripts)
            .and_then(|name| name.to_str())
            .filter(|name| is_safe_name(name))
            .map(str::to_owned))
    }

    /// Sizes of all scripts, by name, ordered by name.
    fn sizes(&self) -> Result<Vec<(String, u64)>, Error> {
        let mut scripts = Vec::new();
        for entry in fs::read_dir(&self.scripts_dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned)
            else {
                continue;
            };
            // Skips the lock file and staged uploads as well as strays.
            if !is_safe_name(&name) {
                continue;
            }

            let md = match entry.metadata() {
                Ok(md) => md,
                // Deleted since read_dir saw it
                Err(e) if std::io::ErrorKind::NotFound == e.kind() => continue,
                Err(e) => return Err(e.into()),
            };
            if md.is_file() {
                scripts.push((name, md.len()));
            }
        }

        scripts.sort();
        Ok(scripts)
    }

    /// Make `name` active. The lock must be held.
    pub(super) fn activate_locked(&self, name: &str) -> Result<(), Error> {
        let path = self.script_path(name)?;
        if !fs::metadata(&path).on_not_found(Error::NxScript)?.is_file() {
            return Err(Error::NxScript);
        }

        file_ops::replace_symlink(
            &self.home,
            self.link_prefix.join(name),
            &self.active_link,
        )?;
        Ok(())
    }
}

impl ScriptStore for FileStore {
    fn list(&self) -> Result<Vec<ScriptInfo>, Error> {
        let active = self.active_name()?;
        Ok(self
            .sizes()?
            .into_iter()
            .map(|(name, _)| ScriptInfo {
                active: active.as_deref() == Some(name.as_str()),
                name,
            })
            .collect())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>, Error> {
        fs::read(self.script_path(name)?).on_not_found(Error::NxScript)
    }

    fn put(&self, name: &str, content: &[u8]) -> Result<(), Error> {
        let path = self.script_path(name)?;
        let content = (self.prepare)(content);

        let _lock = self.lock()?;
        let others: u64 = self
            .sizes()?
            .into_iter()
            .filter(|&(ref n, _)| n != name)
            .map(|(_, size)| size)
            .sum();
        if others.saturating_add(content.len() as u64) > self.quota {
            return Err(Error::QuotaExceeded);
        }

        let staged = file_ops::stage(&self.scripts_dir, 0o600, &content)?;
        if let Some(ref validator) = self.validator {
            validator.run(staged.path())?;
        }
        staged.persist(&path).map_err(|e| e.error)?;
        info!("Stored script {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), Error> {
        let path = self.script_path(name)?;

        let _lock = self.lock()?;
        if self.active_name()?.as_deref() == Some(name) {
            return Err(Error::ScriptActive);
        }

        fs::remove_file(&path).on_not_found(Error::NxScript)?;
        info!("Deleted script {}", path.display());
        Ok(())
    }

    fn set_active(&self, name: Option<&str>) -> Result<(), Error> {
        let _lock = self.lock()?;
        match name {
            Some(name) => {
                self.activate_locked(name)?;
                info!(
                    "Activated {} via {}",
                    name,
                    self.active_link.display()
                );
            },
            None => {
                // Only ever remove a link we could have made.
                if fs::symlink_metadata(&self.active_link)
                    .map(|md| md.file_type().is_symlink())
                    .unwrap_or(false)
                {
                    fs::remove_file(&self.active_link).ignore_not_found()?;
                    info!("Deactivated {}", self.active_link.display());
                } else if self.active_link.exists() {
                    warn!(
                        "{} is not a link to a script; leaving it alone",
                        self.active_link.display()
                    );
                }
            },
        }
        Ok(())
    }

    fn quota_remaining(&self) -> Result<u64, Error> {
        let used: u64 = self.sizes()?.into_iter().map(|(_, size)| size).sum();
        Ok(self.quota.saturating_sub(used))
    }

    fn size_of(&self, name: &str) -> Result<Option<u64>, Error> {
        match fs::metadata(self.script_path(name)?) {
            Ok(md) if md.is_file() => Ok(Some(md.len())),
            Ok(_) => Ok(None),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct FileStoreFactory {
    layout: Layout,
    validator: Option<Validator>,
}

impl FileStoreFactory {
    pub fn new(config: &FileStoreConfig) -> Self {
        Self {
            layout: Layout {
                scripts: config.scripts.clone(),
                active: config.active.clone(),
                quota: config.quota,
            },
            validator: if config.validator.is_empty() {
                None
            } else {
                Some(Validator {
                    program: config.validator.clone(),
                    args: Vec::new(),
                })
            },
        }
    }
}

impl StoreFactory for FileStoreFactory {
    fn open(
        &self,
        handle: &StorageHandle,
    ) -> Result<Box<dyn ScriptStore>, Error> {
        Ok(Box::new(FileStore::open(
            &handle.home,
            &self.layout,
            self.validator.clone(),
            <[u8]>::to_vec,
        )?))
    }
}
