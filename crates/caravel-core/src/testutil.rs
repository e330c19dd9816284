//! Shared test fixtures: a canned-response HTTP peer served from a
//! plain `TcpListener`, and small directory helpers.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::peers::{PeerConfig, PeerDirectory};

pub fn single_peer_directory(name: &str, url: &str) -> PeerDirectory {
    let mut peers = BTreeMap::new();
    peers.insert(
        name.to_string(),
        PeerConfig {
            url: url.to_string(),
            remote_self: None,
        },
    );
    PeerDirectory::new(peers)
}

/// Behaviour of a mock peer.
#[derive(Clone)]
pub struct CannedResponse {
    /// Serve this many HTTP 500 answers before switching to success.
    failures_first: usize,
    /// Status served after the failures (200 on success specs).
    status: u16,
    body: Vec<u8>,
}

impl CannedResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            failures_first: 0,
            status: 200,
            body: body.to_vec(),
        }
    }

    pub fn error(status: u16) -> Self {
        Self {
            failures_first: 0,
            status,
            body: Vec::new(),
        }
    }

    pub fn flaky(failures_first: usize, body: &[u8]) -> Self {
        Self {
            failures_first,
            status: 200,
            body: body.to_vec(),
        }
    }
}

/// Spin up a TCP listener answering at most `max_connections` requests
/// with the canned response, counting the hits. Every answer closes the
/// connection so each request is observable.
pub fn counting_peer(response: CannedResponse, max_connections: usize) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));

    let thread_hits = Arc::clone(&hits);
    std::thread::spawn(move || {
        for _ in 0..max_connections {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let hit = thread_hits.fetch_add(1, Ordering::SeqCst);

            let status = if hit < response.failures_first {
                500
            } else {
                response.status
            };
            let body: &[u8] = if status == 200 { &response.body } else { &[] };

            serve_connection(stream, status, body);
        }
    });

    (url, hits)
}

/// Spin up a TCP listener answering requests with the given responses,
/// in order. Panics in the server thread if more requests arrive than
/// scripted.
pub fn scripted_peer(responses: Vec<(u16, Vec<u8>)>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));

    let thread_hits = Arc::clone(&hits);
    std::thread::spawn(move || {
        for (status, body) in responses {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            thread_hits.fetch_add(1, Ordering::SeqCst);
            serve_connection(stream, status, &body);
        }
    });

    (url, hits)
}

fn serve_connection(mut stream: TcpStream, status: u16, body: &[u8]) {
    // Consume the request: request line, headers, then any body
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut content_length = 0usize;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    if content_length > 0 {
        let mut sink = vec![0u8; content_length];
        let _ = reader.read_exact(&mut sink);
    }

    let reason = if status == 200 { "OK" } else { "Error" };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}
