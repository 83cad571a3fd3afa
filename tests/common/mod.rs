//! Shared harness for integration tests: a real server on a loopback
//! socket and a minimal wire client.

#![allow(dead_code)]

use ember::{Server, ServerConfig};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bootstrap a server and serve it on an ephemeral loopback port.
pub fn spawn_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let server = Server::bootstrap(config).expect("bootstrap");
    let listener = server.bind().expect("bind");
    let addr = listener.local_addr().expect("local addr");
    {
        let server = Arc::clone(&server);
        std::thread::spawn(move || server.serve(listener));
    }
    (server, addr)
}

/// Poll `predicate` until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

/// A decoded reply as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum TestReply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Null,
    Array(Vec<TestReply>),
    NullArray,
}

impl TestReply {
    pub fn bulk(text: &str) -> TestReply {
        TestReply::Bulk(text.as_bytes().to_vec())
    }

    pub fn array_of(texts: &[&str]) -> TestReply {
        TestReply::Array(texts.iter().map(|t| TestReply::bulk(t)).collect())
    }

    pub fn ok() -> TestReply {
        TestReply::Simple("OK".to_string())
    }
}

/// Blocking wire client with its own read buffer.
pub struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
    pos: usize,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        TestClient {
            stream,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Send one command and read its reply.
    pub fn command(&mut self, parts: &[&str]) -> TestReply {
        self.send_command(parts);
        self.read_reply()
    }

    /// Send a command without waiting for the reply (pipelining).
    pub fn send_command(&mut self, parts: &[&str]) {
        let mut out = Vec::new();
        out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
        for part in parts {
            out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            out.extend_from_slice(part.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&out).expect("write command");
    }

    /// Send raw bytes (handshake tests).
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write raw");
    }

    /// Read one reply frame.
    pub fn read_reply(&mut self) -> TestReply {
        loop {
            if let Some((reply, consumed)) = parse_reply(&self.buf[self.pos..]) {
                self.pos += consumed;
                self.compact();
                return reply;
            }
            self.fill();
        }
    }

    /// Read one CRLF-terminated line, stripping the terminator.
    pub fn read_line(&mut self) -> String {
        loop {
            let window = &self.buf[self.pos..];
            if let Some(at) = window.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&window[..at]).into_owned();
                self.pos += at + 2;
                self.compact();
                return line;
            }
            self.fill();
        }
    }

    /// Read exactly `n` bytes.
    pub fn read_exact_bytes(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() - self.pos < n {
            self.fill();
        }
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        self.compact();
        out
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    fn fill(&mut self) {
        let mut chunk = [0u8; 8192];
        let n = self.stream.read(&mut chunk).expect("read");
        assert!(n > 0, "server closed the connection");
        self.buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parse one reply frame; `None` when the buffer ends mid-frame.
fn parse_reply(buf: &[u8]) -> Option<(TestReply, usize)> {
    let line_end = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&buf[1..line_end]).ok()?;
    let after_line = line_end + 2;
    match buf.first()? {
        b'+' => Some((TestReply::Simple(line.to_string()), after_line)),
        b'-' => Some((TestReply::Error(line.to_string()), after_line)),
        b':' => Some((TestReply::Int(line.parse().ok()?), after_line)),
        b'$' => {
            let len: i64 = line.parse().ok()?;
            if len < 0 {
                return Some((TestReply::Null, after_line));
            }
            let len = len as usize;
            if buf.len() < after_line + len + 2 {
                return None;
            }
            let payload = buf[after_line..after_line + len].to_vec();
            Some((TestReply::Bulk(payload), after_line + len + 2))
        }
        b'*' => {
            let count: i64 = line.parse().ok()?;
            if count < 0 {
                return Some((TestReply::NullArray, after_line));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut at = after_line;
            for _ in 0..count {
                let (item, consumed) = parse_reply(&buf[at..])?;
                items.push(item);
                at += consumed;
            }
            Some((TestReply::Array(items), at))
        }
        _ => panic!("unparseable reply prefix {:?}", buf[0] as char),
    }
}
