//! Handshake line formats and buffered socket reading.
//!
//! The PSYNC request travels as an ordinary command array; the primary's
//! replies are status lines (`+FULLRESYNC <runid> <offset>`, `+CONTINUE`)
//! followed by length-prefixed payloads. Everything after the handshake is
//! a plain stream of command arrays in commit order.

use crate::error::{ReplError, ReplResult};
use ember_core::{decode_command, encode_command, ByteString, FrameError};
use std::io::{Read, Write};
use std::net::TcpStream;

/// Run-id placeholder in a first-contact PSYNC.
pub const PSYNC_NO_ID: &str = "?";

/// A primary's answer to PSYNC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReply {
    /// Full resync: snapshot blob follows; `offset` is the new baseline.
    FullResync {
        /// Primary's stable run id.
        run_id: String,
        /// Commit offset the snapshot corresponds to.
        offset: u64,
    },
    /// Partial resync accepted: missed bytes follow as one bulk payload.
    Continue,
}

/// Encode `PSYNC <runid|?> <offset|-1>`.
pub fn psync_command(master_id: Option<&str>, offset: i64) -> Vec<u8> {
    encode_command(&[
        ByteString::from("PSYNC"),
        ByteString::from(master_id.unwrap_or(PSYNC_NO_ID)),
        ByteString::from_string(offset.to_string()),
    ])
}

/// Encode `REPLCONF ACK <offset>`.
pub fn replconf_ack(offset: u64) -> Vec<u8> {
    encode_command(&[
        ByteString::from("REPLCONF"),
        ByteString::from("ACK"),
        ByteString::from_string(offset.to_string()),
    ])
}

/// Encode the heartbeat `PING`.
pub fn ping_command() -> Vec<u8> {
    encode_command(&[ByteString::from("PING")])
}

/// Format the full-resync status line.
pub fn format_fullresync(run_id: &str, offset: u64) -> Vec<u8> {
    format!("+FULLRESYNC {} {}\r\n", run_id, offset).into_bytes()
}

/// The partial-resync status line.
pub fn format_continue() -> Vec<u8> {
    b"+CONTINUE\r\n".to_vec()
}

/// Format a bulk length prefix `$<len>\r\n`.
pub fn bulk_prefix(len: usize) -> Vec<u8> {
    format!("${}\r\n", len).into_bytes()
}

/// Parse a handshake status line (without the trailing CRLF).
pub fn parse_sync_reply(line: &str) -> ReplResult<SyncReply> {
    let Some(body) = line.strip_prefix('+') else {
        return Err(ReplError::protocol(format!(
            "unexpected handshake reply: {}",
            line
        )));
    };
    if body == "CONTINUE" {
        return Ok(SyncReply::Continue);
    }
    if let Some(rest) = body.strip_prefix("FULLRESYNC ") {
        let mut parts = rest.split_whitespace();
        let run_id = parts
            .next()
            .ok_or_else(|| ReplError::protocol("FULLRESYNC missing run id"))?;
        let offset = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| ReplError::protocol("FULLRESYNC missing offset"))?;
        if parts.next().is_some() {
            return Err(ReplError::protocol("FULLRESYNC trailing tokens"));
        }
        return Ok(SyncReply::FullResync {
            run_id: run_id.to_string(),
            offset,
        });
    }
    Err(ReplError::protocol(format!(
        "unexpected handshake reply: +{}",
        body
    )))
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Buffered incremental reader over a socket.
///
/// Keeps a growable buffer so command arrays can be decoded without knowing
/// their length up front, and accounts for exactly how many bytes each
/// decoded frame consumed (the replica's offset arithmetic depends on it).
pub struct StreamBuf {
    stream: TcpStream,
    buf: Vec<u8>,
    pos: usize,
}

impl StreamBuf {
    /// Wrap a connected socket.
    pub fn new(stream: TcpStream) -> Self {
        StreamBuf {
            stream,
            buf: Vec::with_capacity(16 * 1024),
            pos: 0,
        }
    }

    /// The underlying socket (for timeout adjustments).
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Read more bytes from the socket into the buffer.
    ///
    /// Returns `Ok(0)` only on timeout; EOF is an error (the peer vanished
    /// mid-stream).
    fn fill(&mut self) -> ReplResult<usize> {
        self.compact();
        let mut chunk = [0u8; 16 * 1024];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(ReplError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ))),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one CRLF-terminated line, stripping the terminator.
    ///
    /// A read timeout here is a handshake timeout.
    pub fn read_line(&mut self) -> ReplResult<String> {
        loop {
            let window = &self.buf[self.pos..];
            if let Some(at) = window.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&window[..at]).into_owned();
                self.pos += at + 2;
                return Ok(line);
            }
            if self.fill()? == 0 {
                return Err(ReplError::HandshakeTimeout);
            }
        }
    }

    /// Read exactly `n` payload bytes.
    pub fn read_exact_bytes(&mut self, n: usize) -> ReplResult<Vec<u8>> {
        while self.buf.len() - self.pos < n {
            if self.fill()? == 0 {
                return Err(ReplError::HandshakeTimeout);
            }
        }
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// Consume a CRLF pair.
    pub fn expect_crlf(&mut self) -> ReplResult<()> {
        let pair = self.read_exact_bytes(2)?;
        if pair != b"\r\n" {
            return Err(ReplError::protocol("expected CRLF after payload"));
        }
        Ok(())
    }

    /// Read a `$<len>\r\n` bulk header.
    pub fn read_bulk_len(&mut self) -> ReplResult<usize> {
        let line = self.read_line()?;
        let Some(digits) = line.strip_prefix('$') else {
            return Err(ReplError::protocol(format!(
                "expected bulk header, got {:?}",
                line
            )));
        };
        digits
            .parse::<usize>()
            .map_err(|_| ReplError::protocol("bad bulk length"))
    }

    /// Decode the next command array from the stream.
    ///
    /// Returns `Ok(None)` on a read timeout so the caller can poll its
    /// shutdown flags; the raw frame bytes are returned alongside the
    /// arguments for offset accounting.
    pub fn next_command(&mut self) -> ReplResult<Option<(Vec<ByteString>, Vec<u8>)>> {
        loop {
            match decode_command(&self.buf[self.pos..]) {
                Ok((args, consumed)) => {
                    let raw = self.buf[self.pos..self.pos + consumed].to_vec();
                    self.pos += consumed;
                    return Ok(Some((args, raw)));
                }
                Err(FrameError::Incomplete) => {
                    if self.fill()? == 0 {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(ReplError::protocol(format!("bad stream frame: {}", e)));
                }
            }
        }
    }
}

/// Write a whole buffer to a socket.
pub fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> ReplResult<()> {
    stream.write_all(bytes)?;
    Ok(())
}
