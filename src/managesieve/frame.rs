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

//! Line and literal framing for the ManageSieve wire protocol.
//!
//! The reader knows nothing of commands. It assembles "logical lines", which
//! may span any number of `{N}`/`{N+}` literals, and stops at every literal
//! announcement so that the caller can decide whether the literal is wanted
//! before any of its bytes are read.

use std::io;
use std::mem;
use std::ops::Range;

use lazy_static::lazy_static;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

lazy_static! {
    static ref LITERAL_AT_END: Regex =
        Regex::new(r#"\{([0-9]+)(\+?)\}$"#).unwrap();
}

/// Space kept beyond `max_line` for the line ending and a literal marker.
const SLACK: usize = 32;

/// One piece of a logical line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Protocol text, without any line ending or literal marker.
    Text(Vec<u8>),
    /// The exact bytes of a literal.
    Literal(Vec<u8>),
}

/// A complete command line, with any literals already drained.
///
/// A line with `n` literals has `n + 1` text segments, with the literals
/// between them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicalLine {
    pub segments: Vec<Segment>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete logical line was received.
    Line(LogicalLine),
    /// The text read so far ends with a literal marker.
    ///
    /// Nothing of the literal has been read. The caller must call either
    /// `accept_literal()` (after sending the acknowledgement, if
    /// `synchronizing`) or `reject_literal()` before the next `next_frame()`.
    LiteralAnnounced { size: u64, synchronizing: bool },
    /// The line exceeded `max_line`. The rest of the command has been skipped
    /// and the stream is ready for the next command.
    TooLong,
    /// The client closed the stream between commands.
    Closed,
}

/// Reads frames from the client.
pub struct FrameReader<R> {
    io: R,
    /// Used as a fixed-size array; the size in use is given by `text_len`.
    text: Vec<u8>,
    /// The number of initialised bytes in `text`.
    text_len: usize,
    /// The number of bytes in `text` that have been consumed by reading.
    text_consumed: usize,
    max_line: usize,
    max_literal: u64,
    /// The logical line assembled so far.
    segments: Vec<Segment>,
    /// Total text bytes in `segments`.
    line_len: usize,
    /// The literal announced by the last frame, with whether it is
    /// synchronizing.
    announced: Option<(u64, bool)>,
}

#[derive(Clone, Copy)]
enum Overflow {
    /// `text` is full with no line feed in sight.
    Line,
    /// A non-synchronizing literal of this size is next in the stream.
    Literal(u64),
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_line: usize, max_literal: u64) -> Self {
        Self {
            io,
            text: vec![0u8; max_line + SLACK],
            text_len: 0,
            text_consumed: 0,
            max_line,
            max_literal,
            segments: Vec::new(),
            line_len: 0,
            announced: None,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.io
    }

    /// The part of the current logical line read so far.
    ///
    /// After a `LiteralAnnounced`, this is everything before the literal.
    pub fn pending(&self) -> &[Segment] {
        &self.segments
    }

    /// Throw away anything received but not yet consumed.
    ///
    /// Returns the number of bytes discarded. Used when switching to TLS,
    /// since cleartext pipelined past STARTTLS must never be interpreted as
    /// part of the encrypted session.
    pub fn discard_buffered(&mut self) -> usize {
        let discarded = self.text_len - self.text_consumed;
        self.text_len = 0;
        self.text_consumed = 0;
        self.reset_line();
        discarded
    }

    /// Read the next frame.
    pub async fn next_frame(&mut self) -> io::Result<Frame> {
        if self.announced.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "announced literal neither accepted nor rejected",
            ));
        }

        self.drop_consumed();
        if self.segments.is_empty() && 0 == self.text_len {
            if 0 == self.read_more().await? {
                return Ok(Frame::Closed);
            }
        }

        let Some(line) = self.consume_line().await? else {
            self.skip_command(Overflow::Line).await?;
            self.reset_line();
            return Ok(Frame::TooLong);
        };

        let (text_end, literal) = self.check_literal(line.clone());
        self.line_len += text_end - line.start;
        if self.line_len > self.max_line {
            if let Some((size, true)) = literal {
                self.skip_command(Overflow::Literal(size)).await?;
            }
            self.reset_line();
            return Ok(Frame::TooLong);
        }

        self.segments
            .push(Segment::Text(self.text[line.start..text_end].to_vec()));

        match literal {
            None => {
                self.line_len = 0;
                Ok(Frame::Line(LogicalLine {
                    segments: mem::take(&mut self.segments),
                }))
            },
            Some((size, plus)) => {
                self.announced = Some((size, !plus));
                Ok(Frame::LiteralAnnounced {
                    size,
                    synchronizing: !plus,
                })
            },
        }
    }

    /// Read the literal announced by the last frame into the current logical
    /// line.
    pub async fn accept_literal(&mut self) -> io::Result<()> {
        let (size, _) = self.take_announced()?;
        if size > self.max_literal {
            return Err(too_large());
        }

        let data = self.read_literal(size).await?;
        self.segments.push(Segment::Literal(data));
        Ok(())
    }

    /// Abandon the command whose literal was announced by the last frame.
    ///
    /// A non-synchronizing literal (and anything else the client already
    /// committed to as part of the same command) is read and discarded.
    pub async fn reject_literal(&mut self) -> io::Result<()> {
        let (size, synchronizing) = self.take_announced()?;
        if !synchronizing {
            self.skip_command(Overflow::Literal(size)).await?;
        }
        self.reset_line();
        Ok(())
    }

    /// Read exactly `n` bytes, regardless of what they contain.
    pub async fn read_literal(&mut self, n: u64) -> io::Result<Vec<u8>> {
        let buffered = self.take_buffered(n);
        let mut data = Vec::with_capacity(n.min(65536) as usize);
        data.extend_from_slice(&self.text[buffered]);

        let rest = n - data.len() as u64;
        (&mut self.io).take(rest).read_to_end(&mut data).await?;
        if data.len() as u64 != n {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        Ok(data)
    }

    fn take_announced(&mut self) -> io::Result<(u64, bool)> {
        self.announced.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no literal announced")
        })
    }

    fn reset_line(&mut self) {
        self.segments.clear();
        self.line_len = 0;
        self.announced = None;
    }

    /// Mark up to `n` buffered bytes as consumed, returning their range.
    fn take_buffered(&mut self, n: u64) -> Range<usize> {
        let start = self.text_consumed;
        let avail = (self.text_len - start) as u64;
        let len = n.min(avail) as usize;
        self.text_consumed += len;
        start..start + len
    }

    async fn discard(&mut self, n: u64) -> io::Result<()> {
        let buffered = self.take_buffered(n);
        let rest = n - buffered.len() as u64;
        let copied = tokio::io::copy(
            &mut (&mut self.io).take(rest),
            &mut tokio::io::sink(),
        )
        .await?;
        if copied != rest {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Check whether the line in `line` ends with a literal marker.
    ///
    /// Returns the end of the text before the marker, and the literal size and
    /// whether it is non-synchronizing.
    fn check_literal(
        &self,
        line: Range<usize>,
    ) -> (usize, Option<(u64, bool)>) {
        let text = &self.text[line.clone()];
        match LITERAL_AT_END.captures(text) {
            None => (line.end, None),
            Some(c) => {
                let (Some(m0), Some(digits), Some(plus)) =
                    (c.get(0), c.get(1), c.get(2))
                else {
                    return (line.end, None);
                };

                // Anything unrepresentable is certainly too large.
                let size = std::str::from_utf8(digits.as_bytes())
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(u64::MAX);
                let non_sync = !plus.as_bytes().is_empty();
                (line.start + m0.start(), Some((size, non_sync)))
            },
        }
    }

    /// Skip the rest of the current command.
    ///
    /// `text` must either be full to `text_len` (as in an overlong line) or an
    /// unconsumed non-synchronizing literal must be next in the stream.
    async fn skip_command(&mut self, mut state: Overflow) -> io::Result<()> {
        loop {
            match state {
                Overflow::Line => {
                    // Keep the tail, which may hold the start of a literal
                    // marker.
                    self.text_consumed = self.text_len.saturating_sub(SLACK);
                },

                Overflow::Literal(size) => {
                    if size > self.max_literal {
                        return Err(too_large());
                    }
                    self.discard(size).await?;
                },
            }

            self.drop_consumed();
            match self.consume_line().await? {
                None => state = Overflow::Line,
                Some(line) => match self.check_literal(line).1 {
                    Some((size, true)) => state = Overflow::Literal(size),
                    // A synchronizing literal the client is waiting on, or
                    // the end of the command.
                    _ => return Ok(()),
                },
            }
        }
    }

    /// Advances `text_consumed` to one byte past the next line boundary.
    ///
    /// If no IO error occurs, this returns the range of the line (excluding
    /// the line-ending character(s)), or `None` if `text` filled up without a
    /// line feed. In the latter case, `text_consumed` is not advanced.
    async fn consume_line(&mut self) -> io::Result<Option<Range<usize>>> {
        let start = self.text_consumed;
        let mut cursor = start;

        loop {
            if let Some(lf) =
                memchr::memchr(b'\n', &self.text[cursor..self.text_len])
            {
                let end = cursor + lf + 1;
                self.text_consumed = end;

                let mut before_line_end = end - 1;
                if before_line_end > start
                    && b'\r' == self.text[before_line_end - 1]
                {
                    before_line_end -= 1;
                }
                return Ok(Some(start..before_line_end));
            }

            cursor = self.text_len;
            if self.text_len == self.text.len() {
                return Ok(None);
            }

            if 0 == self.read_more().await? {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Removes all text marked as consumed from the text buffer.
    fn drop_consumed(&mut self) {
        if self.text_consumed < self.text_len {
            self.text.copy_within(self.text_consumed..self.text_len, 0);
        }

        self.text_len -= self.text_consumed;
        self.text_consumed = 0;
    }

    /// Read whatever is available into `text`. Returns 0 at EOF.
    async fn read_more(&mut self) -> io::Result<usize> {
        let nread = self.io.read(&mut self.text[self.text_len..]).await?;
        self.text_len += nread;
        Ok(nread)
    }
}

fn too_large() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "literal too large")
}

/// Accumulates output for the client.
///
/// Nothing reaches the client until `flush()`.
#[derive(Default)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `line` followed by CRLF.
    pub fn write_line(&mut self, line: &[u8]) {
        self.buf.extend_from_slice(line);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Queue `{len}` CRLF and then `data`, byte for byte.
    pub fn write_literal(&mut self, data: &[u8]) {
        self.buf
            .extend_from_slice(format!("{{{}}}\r\n", data.len()).as_bytes());
        self.buf.extend_from_slice(data);
    }

    pub async fn flush<W: AsyncWrite + Unpin>(
        &mut self,
        io: &mut W,
    ) -> io::Result<()> {
        io.write_all(&self.buf).await?;
        self.buf.clear();
        io.flush().await
    }
}

/// Format `s` as a quoted string.
pub fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if '"' == c || '\\' == c {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
