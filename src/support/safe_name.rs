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

/// Determine whether the given script name is "safe".
///
/// Script names become file names inside the user's script directory, so this
/// excludes empty names and anything that could escape that directory or hide
/// a file there. It does not care whether the name is ultimately a valid file
/// name; for that, we simply rely on the OS rejecting it.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() &&
        name.len() <= 255 &&
        // Block directory traversal through .. and creation of hidden files on
        // UNIX
        !name.starts_with('.') &&
        !name.contains('/') &&
        // Only a path separator on Windows, but always block since it has high
        // potential of causing problems
        !name.contains('\\') &&
        // Don't allow any ASCII control characters
        !name.contains(|c| c < ' ' || c == '\x7F')
}
