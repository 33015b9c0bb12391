//! Parses the first line of every server reply.
use std::fmt;

use crate::error::Error;

/// Bulk replies larger than this are refused rather than buffered.
pub const MAX_BULK_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    Empty,
    UnknownReplyType(u8),
    BadLength,
    BulkTooLarge,
    NotUtf8,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty reply line"),
            Self::UnknownReplyType(c) => {
                write!(f, "unknown reply type {:?}", char::from(*c))
            },
            Self::BadLength => f.write_str("malformed bulk length"),
            Self::BulkTooLarge => {
                write!(f, "bulk reply exceeds {MAX_BULK_LEN} bytes")
            },
            Self::NotUtf8 => f.write_str("reply is not valid UTF-8"),
        }
    }
}

impl From<ParsingError> for Error {
    fn from(value: ParsingError) -> Self {
        Error::Protocol(value.to_string())
    }
}

/// What the first line of a reply announces.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplyHead {
    /// `+<text>`: `+OK`, `+HI {...}`, or a bare token such as a batch id.
    Simple(String),
    /// `-<CODE> <message>`
    Error { code: String, message: String },
    /// `$<n>`: a bulk body of n bytes follows. `$-1` is the nil bulk.
    Bulk(Option<usize>),
}

/// A minimal zero-copy cursor over a reply line.
struct ParseState<'a> {
    from: &'a [u8],
}

impl<'a> ParseState<'a> {
    /// Consumes the type marker.
    fn expect_marker(&mut self) -> Result<u8, ParsingError> {
        let (&marker, rest) =
            self.from.split_first().ok_or(ParsingError::Empty)?;
        self.from = rest;
        Ok(marker)
    }

    /// Consumes the rest of the line as text.
    fn rest_utf8(&mut self) -> Result<&'a str, ParsingError> {
        let rest = std::str::from_utf8(self.from)
            .map_err(|_| ParsingError::NotUtf8)?;
        self.from = &[];
        Ok(rest)
    }

    /// Consumes a bulk length: `-1` or a non-negative decimal.
    fn expect_length(&mut self) -> Result<Option<usize>, ParsingError> {
        if self.from == b"-1" {
            self.from = &[];
            return Ok(None);
        }
        if self.from.is_empty() {
            return Err(ParsingError::BadLength);
        }

        let mut r = 0usize;
        for v in self.from {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .and_then(|r| r.checked_add((*v - b'0') as usize))
                        .ok_or(ParsingError::BadLength)?
                },
                _ => return Err(ParsingError::BadLength),
            }
        }
        self.from = &[];

        if r > MAX_BULK_LEN {
            Err(ParsingError::BulkTooLarge)
        } else {
            Ok(Some(r))
        }
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

impl TryFrom<&[u8]> for ReplyHead {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, ParsingError> {
        let mut ps: ParseState = value.into();

        Ok(match ps.expect_marker()? {
            b'+' => ReplyHead::Simple(ps.rest_utf8()?.to_owned()),
            b'-' => {
                let text = ps.rest_utf8()?;
                let (code, message) =
                    text.split_once(' ').unwrap_or((text, ""));
                ReplyHead::Error {
                    code: code.to_owned(),
                    message: message.to_owned(),
                }
            },
            b'$' => ReplyHead::Bulk(ps.expect_length()?),
            other => return Err(ParsingError::UnknownReplyType(other)),
        })
    }
}
