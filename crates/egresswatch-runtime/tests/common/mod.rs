//! Shared fixtures for runtime integration tests: local upstreams and a
//! bare-bones HTTP client speaking through raw sockets.

#![allow(dead_code)] // Each test binary uses a subset of these helpers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use egresswatch_core::sequencer::EntrySequencer;
use egresswatch_core::signer::Signer;
use egresswatch_core::store::MemoryLogStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Builds a sequencer over a fresh in-memory store and ephemeral key.
pub fn test_sequencer() -> Arc<EntrySequencer> {
    let signer = Arc::new(Signer::generate().expect("keygen"));
    let store = Arc::new(MemoryLogStore::new());
    Arc::new(EntrySequencer::new(store, signer))
}

/// Starts an HTTP upstream that answers every request with
/// `200 OK` and a body echoing the request line. Returns the address, a
/// counter of accepted connections, and the server task.
pub async fn spawn_http_upstream() -> (SocketAddr, Arc<AtomicUsize>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                let mut data = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    data.extend_from_slice(&chunk[..n]);
                    if data.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let head = String::from_utf8_lossy(&data);
                let request_line = head.lines().next().unwrap_or("").to_string();
                let body = format!("echo: {request_line}");
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (addr, connections, handle)
}

/// Starts a raw TCP echo server, for exercising `CONNECT` tunnels.
pub async fn spawn_tcp_echo() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        },
                    }
                }
            });
        }
    });

    (addr, handle)
}

/// Issues a GET through the proxy using the absolute-URI form and returns
/// `(status, body)`.
pub async fn proxy_get(proxy_port: u16, absolute_url: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let request =
        format!("GET {absolute_url} HTTP/1.1\r\nhost: upstream\r\nconnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

/// Issues an HTTP request to `addr` and returns `(status, body)`.
pub async fn http_call(
    addr: SocketAddr,
    method: &str,
    path: &str,
    json_body: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = json_body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nhost: {addr}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

/// Splits a raw HTTP/1.1 response into status code and body.
pub fn parse_response(raw: &[u8]) -> (u16, String) {
    let text = String::from_utf8_lossy(raw);
    let status = text
        .split_ascii_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}
