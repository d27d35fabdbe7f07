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

use super::main::PasswdSubcommand;
use crate::backend::passwd::hash_password;

pub(super) fn passwd(cmd: PasswdSubcommand) {
    if cmd.user.is_empty()
        || cmd.user.contains(|c: char| ':' == c || c.is_control())
    {
        die!(EX_USAGE, "Invalid user name: {:?}", cmd.user);
    }

    let password = match rpassword::prompt_password("Password: ").and_then(|a| {
        rpassword::prompt_password("Confirm: ").map(|b| (a, b))
    }) {
        Err(e) => die!(EX_NOINPUT, "Failed to read password: {}", e),
        Ok((a, b)) if a != b => die!(EX_DATAERR, "Passwords don't match"),
        Ok((a, _)) if a.is_empty() => die!(EX_NOINPUT, "No password given"),
        Ok((a, _)) => a,
    };

    match hash_password(&password) {
        Ok(hash) => println!("{}:{}", cmd.user, hash),
        Err(e) => die!(EX_SOFTWARE, "Failed to hash password: {}", e),
    }
}
