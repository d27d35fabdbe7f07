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

use super::frame::{quoted, FrameWriter};
use crate::support::system_config::SystemConfig;

/// What the server tells clients about itself in the greeting and in answer
/// to CAPABILITY.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub implementation: String,
    pub sasl: String,
    pub sieve: String,
    /// Whether STARTTLS can be offered to plaintext connections.
    pub starttls: bool,
    /// Whether everything but CAPABILITY, STARTTLS and LOGOUT is refused
    /// until TLS is up.
    pub tls_required: bool,
}

impl Capabilities {
    pub fn new(config: &SystemConfig) -> Self {
        let tls = config.tls.as_ref();
        Self {
            implementation: config.capability.implementation.clone(),
            sasl: config.capability.sasl.clone(),
            sieve: config.capability.sieve.clone(),
            starttls: tls.is_some() && !config.server.implicit_tls,
            tls_required: tls.map_or(false, |t| t.required),
        }
    }

    /// Queue the capability lines, not including the final `OK`.
    pub fn write_to(&self, w: &mut FrameWriter, tls_active: bool) {
        for &(name, ref value) in &[
            ("IMPLEMENTATION", &self.implementation),
            ("SASL", &self.sasl),
            ("SIEVE", &self.sieve),
        ] {
            w.write_line(
                format!("{} {}", quoted(name), quoted(value)).as_bytes(),
            );
        }

        if self.starttls && !tls_active {
            w.write_line(b"\"STARTTLS\"");
        }
    }
}
