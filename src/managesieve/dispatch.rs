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

//! Command execution.
//!
//! The dispatcher owns the session's protocol state and turns each parsed
//! command into output. Anything which needs to drive the connection itself
//! (the TLS handshake, the SASL challenge) is handed back to the session as
//! an `Action`.

use std::io;
use std::sync::Arc;

use log::{error, info, warn};

use super::capability::Capabilities;
use super::frame::{quoted, FrameWriter};
use super::response::Response;
use super::syntax::{Command, Request};
use crate::backend::registry::Backends;
use crate::backend::ScriptStore;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::safe_name::is_safe_name;

const BAD_CREDENTIALS: &str = "Bad username or password";

/// What the session must do after a command has been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Output (if any) is queued; read the next command.
    Continue,
    /// Flush output and close the connection.
    Close,
    /// Send `OK`, perform the TLS handshake, then call `tls_started()`.
    StartTls,
    /// Send an empty challenge and pass the client's answer to
    /// `authenticate_finish()`.
    SaslChallenge,
}

enum State {
    Unauthenticated,
    Authenticated(Arc<dyn ScriptStore>),
}

pub struct Dispatcher {
    caps: Arc<Capabilities>,
    backends: Backends,
    log_prefix: LogPrefix,
    state: State,
    tls_active: bool,
    tls_available: bool,
}

/// Run a blocking backend call on Tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

/// Parse a HAVESPACE size, which must be nothing but ASCII digits.
fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    s.parse().ok()
}

impl Dispatcher {
    pub fn new(
        caps: Arc<Capabilities>,
        backends: Backends,
        log_prefix: LogPrefix,
        tls_available: bool,
    ) -> Self {
        Self {
            caps,
            backends,
            log_prefix,
            state: State::Unauthenticated,
            tls_active: false,
            tls_available,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Authenticated(_))
    }

    /// Queue the capability block, without the trailing `OK`.
    pub fn write_capabilities(&self, w: &mut FrameWriter) {
        self.caps.write_to(w, self.tls_active);
    }

    /// Record that the TLS handshake completed and queue the capability
    /// block + `OK` that must follow it.
    pub fn tls_started(&mut self, w: &mut FrameWriter) {
        self.tls_active = true;
        self.log_prefix.set_tls();
        self.write_capabilities(w);
        Response::ok().write_to(w);
    }

    fn tls_gate(&self) -> bool {
        self.caps.tls_required && !self.tls_active
    }

    fn store(&self) -> Option<Arc<dyn ScriptStore>> {
        match self.state {
            State::Unauthenticated => None,
            State::Authenticated(ref store) => Some(Arc::clone(store)),
        }
    }

    pub async fn dispatch(
        &mut self,
        request: Request,
        w: &mut FrameWriter,
    ) -> Action {
        let Request {
            command: cmd,
            offsets,
        } = request;
        if self.tls_gate()
            && !matches!(
                cmd,
                Command::Capability | Command::StartTls | Command::Logout
            )
        {
            Response::no("TLS required").write_to(w);
            return Action::Continue;
        }

        let response = match cmd {
            Command::Capability => {
                self.write_capabilities(w);
                Response::ok()
            },
            Command::StartTls => return self.cmd_start_tls(w),
            Command::Logout => {
                Response::ok().write_to(w);
                return Action::Close;
            },
            Command::Authenticate {
                mechanism,
                initial_response,
            } => {
                return self
                    .cmd_authenticate(&mechanism, initial_response, w)
                    .await
            },
            _ if !self.is_authenticated() => Response::no("Not authenticated"),
            Command::ListScripts => self.cmd_list_scripts(w).await,
            Command::HaveSpace { name, size } => {
                let size_offset = offsets.get(2).copied().unwrap_or(0);
                self.cmd_have_space(name, &size, size_offset).await
            },
            Command::PutScript { name, content } => {
                self.cmd_put_script(name, content).await
            },
            Command::GetScript { name } => self.cmd_get_script(name, w).await,
            Command::DeleteScript { name } => {
                self.cmd_delete_script(name).await
            },
            Command::SetActive { name } => self.cmd_set_active(name).await,
        };

        response.write_to(w);
        if response.is_bye() {
            Action::Close
        } else {
            Action::Continue
        }
    }

    fn cmd_start_tls(&self, w: &mut FrameWriter) -> Action {
        let refusal = if self.tls_active {
            "Already in TLS mode"
        } else if !self.tls_available {
            "TLS not available"
        } else if self.is_authenticated() {
            "Already authenticated"
        } else {
            return Action::StartTls;
        };

        Response::no(refusal).write_to(w);
        Action::Continue
    }

    async fn cmd_authenticate(
        &mut self,
        mechanism: &str,
        initial_response: Option<Vec<u8>>,
        w: &mut FrameWriter,
    ) -> Action {
        if self.is_authenticated() {
            Response::no("Already authenticated").write_to(w);
            return Action::Continue;
        }

        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            warn!(
                "{} Rejected attempt to authenticate with mechanism {:?}",
                self.log_prefix, mechanism,
            );
            Response::no("Unsupported mechanism").write_to(w);
            return Action::Continue;
        }

        match initial_response {
            Some(data) => self.authenticate_finish(&data, w).await,
            None => Action::SaslChallenge,
        }
    }

    /// Complete a PLAIN exchange with the base64 payload from the client.
    pub async fn authenticate_finish(
        &mut self,
        data: &[u8],
        w: &mut FrameWriter,
    ) -> Action {
        let response = match self.log_in(data).await {
            Ok(()) => Response::ok(),
            Err(response) => response,
        };

        response.write_to(w);
        if response.is_bye() {
            Action::Close
        } else {
            Action::Continue
        }
    }

    async fn log_in(&mut self, data: &[u8]) -> Result<(), Response> {
        let string = base64::decode(data)
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .ok_or_else(|| Response::no(BAD_CREDENTIALS))?;

        // [authorise-id] NUL authenticate-id NUL password
        let mut parts = string.split('\x00');
        let (user, password) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(authorise), Some(user), Some(password), None)
                    if !user.is_empty()
                        && (authorise.is_empty() || authorise == user) =>
                {
                    (user.to_owned(), password.to_owned())
                },
                _ => {
                    warn!("{} Malformed PLAIN payload", self.log_prefix);
                    return Err(Response::no(BAD_CREDENTIALS));
                },
            };

        let auth = Arc::clone(&self.backends.auth);
        let check_user = user.clone();
        match blocking(move || auth.authenticate(&check_user, &password)).await
        {
            Ok(true) => (),
            Ok(false) => {
                warn!("{} Login failed for {:?}", self.log_prefix, user);
                return Err(Response::no(BAD_CREDENTIALS));
            },
            Err(e) => {
                error!(
                    "{} Authenticator failed for {:?}: {}",
                    self.log_prefix, user, e
                );
                return Err(Response::no(BAD_CREDENTIALS));
            },
        }

        let userdb = Arc::clone(&self.backends.userdb);
        let storage = Arc::clone(&self.backends.storage);
        let resolve_user = user.clone();
        let store = blocking(move || {
            let handle = userdb.resolve(&resolve_user)?;
            storage.open(&handle)
        })
        .await
        .map_err(|e| {
            error!(
                "{} Unable to open script storage for {:?}: {}",
                self.log_prefix, user, e
            );
            Response::bye("Server error")
        })?;

        self.log_prefix.set_user(user);
        info!("{} Login successful", self.log_prefix);
        self.state = State::Authenticated(Arc::from(store));
        Ok(())
    }

    /// Map a store failure to the response for the client.
    fn store_error(&self, e: Error) -> Response {
        match e {
            Error::NxScript => Response::no("No script by that name"),
            Error::ScriptActive => Response::no("Script is active"),
            Error::QuotaExceeded => Response::quota(),
            Error::ValidationFailed(message) => Response::no(message),
            Error::UnsafeName => Response::no("Invalid script name"),
            e => {
                error!("{} Script store failed: {}", self.log_prefix, e);
                Response::no("Server error")
            },
        }
    }

    /// Run `f` against the bound store.
    async fn with_store<T, F>(&self, f: F) -> Result<T, Response>
    where
        F: FnOnce(&dyn ScriptStore) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let store = self
            .store()
            .ok_or_else(|| Response::no("Not authenticated"))?;
        blocking(move || f(&*store))
            .await
            .map_err(|e| self.store_error(e))
    }

    async fn cmd_list_scripts(&self, w: &mut FrameWriter) -> Response {
        match self.with_store(|store| store.list()).await {
            Ok(scripts) => {
                for script in scripts {
                    let mut line = quoted(&script.name);
                    if script.active {
                        line.push_str(" ACTIVE");
                    }
                    w.write_line(line.as_bytes());
                }
                Response::ok()
            },
            Err(response) => response,
        }
    }

    /// Whether a script of `size` bytes would fit if it replaced `name`.
    async fn fits(&self, name: String, size: u64) -> Result<bool, Response> {
        self.with_store(move |store| {
            let remaining = store.quota_remaining()?;
            let existing = store.size_of(&name)?.unwrap_or(0);
            Ok(size <= remaining.saturating_add(existing))
        })
        .await
    }

    async fn cmd_have_space(
        &self,
        name: String,
        size: &str,
        size_offset: usize,
    ) -> Response {
        let Some(size) = parse_number(size) else {
            warn!(
                "{} HAVESPACE size at offset {} is not a number",
                self.log_prefix, size_offset
            );
            return Response::no("Not a number");
        };

        if !is_safe_name(&name) {
            return Response::no("Invalid script name");
        }

        // Unlike PUTSCRIPT, no credit is given for a script being replaced.
        match self.with_store(|store| store.quota_remaining()).await {
            Ok(remaining) if size <= remaining => Response::ok(),
            Ok(_) => Response::quota(),
            Err(response) => response,
        }
    }

    /// Decide whether a PUTSCRIPT for `name` may go on to read a literal of
    /// `size` bytes.
    ///
    /// Only answers `false` when the upload definitely cannot fit; anything
    /// else is left for the command itself to report.
    pub async fn putscript_fits(&self, name: String, size: u64) -> bool {
        if self.tls_gate() || !self.is_authenticated() || !is_safe_name(&name)
        {
            return true;
        }

        self.fits(name, size).await.unwrap_or(true)
    }

    async fn cmd_put_script(&self, name: String, content: Vec<u8>) -> Response {
        let len = content.len();
        let stored_name = name.clone();
        match self
            .with_store(move |store| store.put(&stored_name, &content))
            .await
        {
            Ok(()) => {
                info!("{} Stored {:?} ({} bytes)", self.log_prefix, name, len);
                Response::ok()
            },
            Err(response) => response,
        }
    }

    async fn cmd_get_script(
        &self,
        name: String,
        w: &mut FrameWriter,
    ) -> Response {
        match self.with_store(move |store| store.get(&name)).await {
            Ok(content) => {
                w.write_literal(&content);
                w.write_line(b"");
                Response::ok()
            },
            Err(response) => response,
        }
    }

    async fn cmd_delete_script(&self, name: String) -> Response {
        let deleted_name = name.clone();
        match self
            .with_store(move |store| store.delete(&deleted_name))
            .await
        {
            Ok(()) => {
                info!("{} Deleted {:?}", self.log_prefix, name);
                Response::ok()
            },
            Err(response) => response,
        }
    }

    async fn cmd_set_active(&self, name: String) -> Response {
        let activated_name = name.clone();
        let result = self
            .with_store(move |store| {
                if activated_name.is_empty() {
                    store.set_active(None)
                } else {
                    store.set_active(Some(&activated_name))
                }
            })
            .await;

        match result {
            Ok(()) => {
                if name.is_empty() {
                    info!("{} Deactivated all scripts", self.log_prefix);
                } else {
                    info!("{} Activated {:?}", self.log_prefix, name);
                }
                Response::ok()
            },
            Err(response) => response,
        }
    }
}
