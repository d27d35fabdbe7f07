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

/// A status line ending the server's answer to a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok(Option<String>),
    No {
        code: Option<&'static str>,
        message: String,
    },
    Bye(String),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(None)
    }

    pub fn no(message: impl Into<String>) -> Self {
        Response::No {
            code: None,
            message: message.into(),
        }
    }

    pub fn quota() -> Self {
        Response::No {
            code: Some("QUOTA"),
            message: "Quota exceeded".to_owned(),
        }
    }

    pub fn bye(message: impl Into<String>) -> Self {
        Response::Bye(message.into())
    }

    pub fn is_bye(&self) -> bool {
        matches!(*self, Response::Bye(_))
    }

    pub fn write_to(&self, w: &mut FrameWriter) {
        let line = match *self {
            Response::Ok(None) => "OK".to_owned(),
            Response::Ok(Some(ref message)) => {
                format!("OK {}", quoted(message))
            },
            Response::No {
                code: None,
                ref message,
            } => format!("NO {}", quoted(message)),
            Response::No {
                code: Some(code),
                ref message,
            } => format!("NO ({}) {}", code, quoted(message)),
            Response::Bye(ref message) => format!("BYE {}", quoted(message)),
        };
        w.write_line(line.as_bytes());
    }
}
