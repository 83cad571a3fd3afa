//! Per-connection command loop.
//!
//! Reads command arrays off the socket, dispatches them through the server,
//! and writes replies back. A `PSYNC` command upgrades the connection into
//! a replica feed: the socket is handed to the replication coordinator and
//! this thread exits.

use crate::server::Server;
use ember_core::{decode_command, encode_reply, ByteString, FrameError, Reply};
use ember_store::ConnState;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use tracing::debug;

/// Serve one client connection until it closes or upgrades to a replica.
pub fn serve_connection(server: Arc<Server>, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!(target: "ember::conn", %peer, "connected");
    stream.set_nodelay(true).ok();

    let mut conn = ConnState::new();
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut pos = 0usize;

    loop {
        while pos < buf.len() {
            match decode_command(&buf[pos..]) {
                Ok((args, consumed)) => {
                    pos += consumed;
                    if is_psync(&args) {
                        // Hand the socket to the coordinator; its sender
                        // and receiver threads own it from here.
                        match stream.try_clone() {
                            Ok(feed) => server.handle_psync(feed, &args),
                            Err(e) => {
                                debug!(target: "ember::conn", %peer, error = %e, "clone failed")
                            }
                        }
                        return;
                    }
                    let reply = server.handle_command(&mut conn, &args);
                    let mut out = Vec::new();
                    encode_reply(&reply, &mut out);
                    if stream.write_all(&out).is_err() {
                        return;
                    }
                }
                Err(FrameError::Incomplete) => break,
                Err(e) => {
                    // Malformed framing is unrecoverable on a byte stream:
                    // report and drop the connection.
                    let mut out = Vec::new();
                    encode_reply(&Reply::err(format!("protocol error: {}", e)), &mut out);
                    let _ = stream.write_all(&out);
                    debug!(target: "ember::conn", %peer, error = %e, "protocol error");
                    return;
                }
            }
        }
        buf.drain(..pos);
        pos = 0;

        let mut chunk = [0u8; 16 * 1024];
        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!(target: "ember::conn", %peer, "disconnected");
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(target: "ember::conn", %peer, error = %e, "read failed");
                return;
            }
        }
    }
}

fn is_psync(args: &[ByteString]) -> bool {
    args.first()
        .map(|name| name.as_bytes().eq_ignore_ascii_case(b"PSYNC"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_psync_case_insensitive() {
        let args = vec![ByteString::from("psync"), ByteString::from("?")];
        assert!(is_psync(&args));
        let args = vec![ByteString::from("GET"), ByteString::from("k")];
        assert!(!is_psync(&args));
        assert!(!is_psync(&[]));
    }
}
