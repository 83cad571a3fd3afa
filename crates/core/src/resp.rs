//! Wire framing for commands and replies.
//!
//! The same byte format serves three roles: the client protocol, the
//! primary→replica stream, and the on-disk command log. A command is an
//! array of bulk strings:
//!
//! ```text
//! "*" <n> CRLF ( "$" <len> CRLF <bytes> CRLF ){n}
//! ```
//!
//! Replies additionally use `+simple`, `-error`, `:integer`, `$-1` (null
//! bulk) and `*-1` (null array) frames.
//!
//! Decoding is incremental: `decode_command` consumes one complete command
//! array from the front of a buffer and reports how many bytes it used, or
//! `FrameError::Incomplete` when the buffer ends mid-frame. Replication and
//! log recovery both rely on the consumed-length accounting, so the encoder
//! and decoder must agree byte-for-byte.

use crate::bytes::ByteString;
use crate::error::{FrameError, FrameResult};

/// Maximum accepted bulk-string payload: 512 MiB.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum accepted array element count.
pub const MAX_ARRAY_LEN: usize = 1_048_576;

const CRLF: &[u8] = b"\r\n";

/// A reply value produced by command execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+<text>` status line.
    Simple(String),
    /// `-<message>` error line.
    Error(String),
    /// `:<n>` integer.
    Int(i64),
    /// `$<len>` bulk string.
    Bulk(ByteString),
    /// `$-1` null bulk.
    NullBulk,
    /// `*<n>` array of replies.
    Array(Vec<Reply>),
    /// `*-1` null array.
    NullArray,
}

impl Reply {
    /// The canonical `+OK` status.
    pub fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    /// An `-ERR <message>` error reply.
    pub fn err(message: impl Into<String>) -> Reply {
        Reply::Error(format!("ERR {}", message.into()))
    }

    /// Bulk reply from raw bytes.
    pub fn bulk(bytes: &[u8]) -> Reply {
        Reply::Bulk(ByteString::from_bytes(bytes))
    }
}

/// Encode a reply into `out`.
pub fn encode_reply(reply: &Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(CRLF);
        }
        Reply::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(CRLF);
        }
        Reply::Int(n) => {
            out.push(b':');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(CRLF);
        }
        Reply::Bulk(b) => {
            out.push(b'$');
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.extend_from_slice(CRLF);
            out.extend_from_slice(b.as_bytes());
            out.extend_from_slice(CRLF);
        }
        Reply::NullBulk => out.extend_from_slice(b"$-1\r\n"),
        Reply::Array(items) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(CRLF);
            for item in items {
                encode_reply(item, out);
            }
        }
        Reply::NullArray => out.extend_from_slice(b"*-1\r\n"),
    }
}

/// Encode a command array into its canonical wire bytes.
///
/// These are the exact bytes appended to the command log and the replication
/// backlog; offsets are accounted in terms of this encoding.
pub fn encode_command(args: &[ByteString]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(CRLF);
    }
    out
}

/// Decode one command array from the front of `buf`.
///
/// Returns the argument vector and the number of bytes consumed. Errors:
/// - `Incomplete` when `buf` ends before the frame does;
/// - `Malformed` when the bytes cannot start a valid command array (the
///   log-recovery tail condition);
/// - `BulkTooLong` / `ArrayTooLong` on limit violations.
pub fn decode_command(buf: &[u8]) -> FrameResult<(Vec<ByteString>, usize)> {
    let mut pos = 0;
    if buf.is_empty() {
        return Err(FrameError::Incomplete);
    }
    if buf[0] != b'*' {
        return Err(FrameError::malformed("expected array marker"));
    }
    let (count, next) = read_int_line(buf, pos + 1)?;
    pos = next;
    if count < 0 {
        return Err(FrameError::malformed("negative array length"));
    }
    let count = count as usize;
    if count > MAX_ARRAY_LEN {
        return Err(FrameError::ArrayTooLong(count as i64));
    }

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if pos >= buf.len() {
            return Err(FrameError::Incomplete);
        }
        if buf[pos] != b'$' {
            return Err(FrameError::malformed("expected bulk marker"));
        }
        let (len, next) = read_int_line(buf, pos + 1)?;
        pos = next;
        if len < 0 {
            return Err(FrameError::malformed("negative bulk length in command"));
        }
        let len = len as usize;
        if len > MAX_BULK_LEN {
            return Err(FrameError::BulkTooLong(len as i64));
        }
        if buf.len() < pos + len + 2 {
            return Err(FrameError::Incomplete);
        }
        let payload = &buf[pos..pos + len];
        if &buf[pos + len..pos + len + 2] != CRLF {
            return Err(FrameError::malformed("bulk payload not CRLF-terminated"));
        }
        args.push(ByteString::from_bytes(payload));
        pos += len + 2;
    }

    Ok((args, pos))
}

/// Read a decimal integer terminated by CRLF starting at `pos`.
///
/// Returns the value and the position just past the CRLF.
fn read_int_line(buf: &[u8], pos: usize) -> FrameResult<(i64, usize)> {
    let mut end = pos;
    loop {
        if end >= buf.len() {
            return Err(FrameError::Incomplete);
        }
        if buf[end] == b'\r' {
            break;
        }
        end += 1;
        // A length line longer than 32 chars is garbage, not a partial read.
        if end - pos > 32 {
            return Err(FrameError::malformed("integer line too long"));
        }
    }
    if end + 1 >= buf.len() {
        return Err(FrameError::Incomplete);
    }
    if buf[end + 1] != b'\n' {
        return Err(FrameError::malformed("expected CRLF"));
    }
    let digits = &buf[pos..end];
    if digits.is_empty() {
        return Err(FrameError::malformed("empty integer"));
    }
    let s = std::str::from_utf8(digits).map_err(|_| FrameError::malformed("non-ASCII integer"))?;
    let value = s
        .parse::<i64>()
        .map_err(|_| FrameError::malformed("non-parsable integer"))?;
    Ok((value, end + 2))
}
