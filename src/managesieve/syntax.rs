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

//! Tokenising and parsing of ManageSieve command lines.
//!
//! ```text
//! command  = verb *(SP argument)
//! argument = quoted / literal / atom
//! quoted   = DQUOTE *(%x01-09 / %x0B-0C / %x0E-21 / %x23-5B / %x5D-FF
//!                     / "\" DQUOTE / "\\") DQUOTE
//! ```
//!
//! Numbers are atoms made of digits. Literals arrive already drained, as
//! separate segments of the logical line.

use std::borrow::Cow;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while, take_while1},
    combinator::map,
    multi::fold_many0,
    sequence::{delimited, preceded},
    IResult,
};

use super::frame::{LogicalLine, Segment};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Capability,
    StartTls,
    Logout,
    ListScripts,
    /// AUTHENTICATE mechanism [initial-response]
    Authenticate {
        mechanism: String,
        initial_response: Option<Vec<u8>>,
    },
    /// HAVESPACE name size
    ///
    /// `size` is kept as the client sent it; whether it is a number is for
    /// the command handler to decide.
    HaveSpace { name: String, size: String },
    /// PUTSCRIPT name content
    PutScript { name: String, content: Vec<u8> },
    GetScript { name: String },
    DeleteScript { name: String },
    /// SETACTIVE name; the empty name deactivates all scripts.
    SetActive { name: String },
}

/// A parsed command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// Where each token, starting with the verb, began in the logical line.
    /// Literals count by their length.
    pub offsets: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The verb is not one we know.
    Unknown(String),
    /// The arguments don't fit the verb. `offset` is the position in the
    /// logical line where things went wrong, counting literals by their
    /// length.
    Syntax { offset: usize },
}

/// A client response during an AUTHENTICATE exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaslResponse {
    Data(Vec<u8>),
    Abort,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Atom(String),
    Quoted(Vec<u8>),
    Literal(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Arg {
    token: Token,
    offset: usize,
}

impl Arg {
    fn syntax_error(&self) -> ParseError {
        ParseError::Syntax {
            offset: self.offset,
        }
    }

    fn string(self) -> Result<Vec<u8>, ParseError> {
        match self.token {
            Token::Atom(s) => Ok(s.into_bytes()),
            Token::Quoted(s) | Token::Literal(s) => Ok(s),
        }
    }

    fn utf8(self) -> Result<String, ParseError> {
        let offset = self.offset;
        String::from_utf8(self.string()?)
            .map_err(|_| ParseError::Syntax { offset })
    }
}

fn atom(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    map(
        take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'\\' | b'"' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

fn quoted_char(i: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(tag("\\"), alt((tag("\\"), tag("\""))))(i)
}

fn quoted_string_content(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((quoted_char, is_not("\r\n\0\"\\")))(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    delimited(
        tag("\""),
        fold_many0(quoted_string_content, Vec::new, |mut accum, piece| {
            accum.extend_from_slice(piece);
            accum
        }),
        tag("\""),
    )(i)
}

fn token(i: &[u8]) -> IResult<&[u8], Token> {
    alt((
        map(quoted, Token::Quoted),
        map(atom, |a| Token::Atom(a.into_owned())),
    ))(i)
}

/// Split the segments of a (possibly partial) logical line into arguments.
///
/// Arguments, literal or not, are separated by at least one SP.
fn tokenise(segments: &[Segment]) -> Result<Vec<Arg>, ParseError> {
    let mut args = Vec::new();
    let mut base = 0;
    // Whether the last argument has not yet been followed by a space.
    let mut need_space = false;

    for segment in segments {
        match *segment {
            Segment::Literal(ref data) => {
                if need_space {
                    return Err(ParseError::Syntax { offset: base });
                }

                args.push(Arg {
                    token: Token::Literal(data.clone()),
                    offset: base,
                });
                base += data.len();
                need_space = true;
            },

            Segment::Text(ref text) => {
                let mut rest = &text[..];
                loop {
                    let after_space = skip_space(rest);
                    let spaced = after_space.len() != rest.len();
                    rest = after_space;
                    need_space &= !spaced;

                    if rest.is_empty() {
                        break;
                    }

                    let offset = base + text.len() - rest.len();
                    if need_space {
                        return Err(ParseError::Syntax { offset });
                    }

                    let (after, token) = token(rest)
                        .map_err(|_| ParseError::Syntax { offset })?;
                    args.push(Arg { token, offset });
                    rest = after;
                    need_space = true;
                }
                base += text.len();
            },
        }
    }

    Ok(args)
}

fn skip_space(i: &[u8]) -> &[u8] {
    match take_while::<_, _, nom::error::Error<&[u8]>>(|b| b' ' == b)(i) {
        Ok((rest, _)) => rest,
        Err(_) => i,
    }
}

/// Parse a complete logical line into a `Request`.
pub fn parse(line: &LogicalLine) -> Result<Request, ParseError> {
    let args = tokenise(&line.segments)?;
    let offsets = args.iter().map(|a| a.offset).collect();
    let mut args = args.into_iter();
    let verb = match args.next() {
        Some(Arg {
            token: Token::Atom(verb),
            ..
        }) => verb,
        Some(arg) => return Err(arg.syntax_error()),
        None => return Err(ParseError::Syntax { offset: 0 }),
    };
    let args: Vec<Arg> = args.collect();
    let end = ParseError::Syntax {
        offset: line_len(&line.segments),
    };

    macro_rules! arity {
        ($min:expr, $max:expr) => {{
            if args.len() < $min {
                return Err(end);
            }
            if let Some(extra) = args.get($max) {
                return Err(extra.syntax_error());
            }
            let mut it = args.into_iter();
            move || it.next()
        }};
    }

    let command = match verb.to_ascii_uppercase().as_str() {
        "CAPABILITY" => {
            arity!(0, 0);
            Command::Capability
        },
        "STARTTLS" => {
            arity!(0, 0);
            Command::StartTls
        },
        "LOGOUT" => {
            arity!(0, 0);
            Command::Logout
        },
        "LISTSCRIPTS" => {
            arity!(0, 0);
            Command::ListScripts
        },
        "AUTHENTICATE" => {
            let mut next = arity!(1, 2);
            let mechanism = next().ok_or(end.clone())?.utf8()?;
            let initial_response = next().map(Arg::string).transpose()?;
            Command::Authenticate {
                mechanism,
                initial_response,
            }
        },
        "HAVESPACE" => {
            let mut next = arity!(2, 2);
            let name = next().ok_or(end.clone())?.utf8()?;
            let size_arg = next().ok_or(end.clone())?;
            let size = match size_arg.token {
                Token::Literal(_) => return Err(size_arg.syntax_error()),
                _ => size_arg.utf8()?,
            };
            Command::HaveSpace { name, size }
        },
        "PUTSCRIPT" => {
            let mut next = arity!(2, 2);
            let name = next().ok_or(end.clone())?.utf8()?;
            let content = next().ok_or(end.clone())?.string()?;
            Command::PutScript { name, content }
        },
        "GETSCRIPT" => {
            let mut next = arity!(1, 1);
            Command::GetScript {
                name: next().ok_or(end.clone())?.utf8()?,
            }
        },
        "DELETESCRIPT" => {
            let mut next = arity!(1, 1);
            Command::DeleteScript {
                name: next().ok_or(end.clone())?.utf8()?,
            }
        },
        "SETACTIVE" => {
            let mut next = arity!(1, 1);
            Command::SetActive {
                name: next().ok_or(end.clone())?.utf8()?,
            }
        },
        _ => return Err(ParseError::Unknown(verb)),
    };

    Ok(Request { command, offsets })
}

/// Parse the client's line in an AUTHENTICATE exchange.
pub fn parse_sasl_response(
    line: &LogicalLine,
) -> Result<SaslResponse, ParseError> {
    let mut args = tokenise(&line.segments)?;
    if 1 != args.len() {
        return Err(ParseError::Syntax {
            offset: args.get(1).map_or(0, |a| a.offset),
        });
    }

    let arg = args.remove(0);
    match arg.token {
        Token::Atom(ref a) if "*" == a => Ok(SaslResponse::Abort),
        Token::Atom(_) => Err(arg.syntax_error()),
        Token::Quoted(data) | Token::Literal(data) => {
            Ok(SaslResponse::Data(data))
        },
    }
}

/// If `pending` (everything before an announced literal) is a PUTSCRIPT
/// whose content is that literal, return the script name.
pub fn putscript_target(pending: &[Segment]) -> Option<String> {
    let args = tokenise(pending).ok()?;
    match args.as_slice() {
        [Arg {
            token: Token::Atom(verb),
            ..
        }, name] if verb.eq_ignore_ascii_case("PUTSCRIPT") => {
            name.clone().utf8().ok()
        },
        _ => None,
    }
}

fn line_len(segments: &[Segment]) -> usize {
    segments
        .iter()
        .map(|s| match *s {
            Segment::Text(ref t) | Segment::Literal(ref t) => t.len(),
        })
        .sum()
}
