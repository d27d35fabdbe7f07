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

//! Miscellaneous functions for working with files.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::fcntl::{flock, FlockArg};

use crate::support::error::Error;

/// Write `data` into a new temporary file within `tmp`, fully synced and
/// with permissions `mode`.
///
/// The caller decides whether to `persist()` it; if the returned value is
/// dropped instead, the file is removed.
pub fn stage(
    tmp: impl AsRef<Path>,
    mode: u32,
    data: &[u8],
) -> io::Result<tempfile::NamedTempFile> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    chmod(tf.path(), mode)?;
    tf.as_file_mut().sync_all()?;
    Ok(tf)
}

/// Atomically make `link` a symlink pointing at `target`, replacing whatever
/// was at `link` before.
///
/// The new link is created under a temporary name in `tmp` and renamed over
/// `link`, so readers see either the old link or the new one.
pub fn replace_symlink(
    tmp: impl AsRef<Path>,
    target: impl AsRef<Path>,
    link: impl AsRef<Path>,
) -> io::Result<()> {
    let tmp = tmp.as_ref();
    // Reserve a unique name, then swap the placeholder for the link.
    let placeholder = tempfile::Builder::new()
        .prefix(".link")
        .tempfile_in(tmp)?
        .into_temp_path();
    let staged = placeholder.to_path_buf();
    placeholder.close()?;

    std::os::unix::fs::symlink(target, &staged)?;
    if let Err(e) = fs::rename(&staged, link) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    Ok(())
}

pub fn chmod(path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// An exclusive `flock` on a file, released when dropped.
pub struct LockFile {
    _file: fs::File,
}

impl LockFile {
    /// Open (creating if needed) the file at `path` and block until an
    /// exclusive lock on it is held.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)?;
        Ok(Self { _file: file })
    }
}

pub trait IgnoreKinds {
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

pub trait ErrorTransforms {
    type Coerced;
    fn on_not_found(self, error: Error) -> Self::Coerced;
}

impl<R, E: Into<Error>> ErrorTransforms for Result<R, E> {
    type Coerced = Result<R, Error>;

    fn on_not_found(self, error: Error) -> Result<R, Error> {
        match self.map_err(|e| e.into()) {
            Err(Error::Io(e)) if io::ErrorKind::NotFound == e.kind() => {
                Err(error)
            },
            Err(Error::Nix(nix::errno::Errno::ENOENT)) => Err(error),
            s => s,
        }
    }
}
