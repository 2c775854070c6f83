//! The logging forward proxy.
//!
//! Listens on loopback for standard HTTP proxy traffic from sandboxed
//! code. Every outbound request - plain absolute-URI forwards and
//! `CONNECT` tunnels alike - produces a signed egress entry *before* any
//! upstream connection is attempted. The chain therefore attests
//! "attempted to contact", not "contacted": a dead upstream still leaves
//! an entry, and the client sees `502 Bad Gateway`.
//!
//! A failed append is fatal to the request being logged: nothing is
//! forwarded that could not be attested.
//!
//! # Connection model
//!
//! One exchange per connection. The proxy streams the request body up and
//! the response back verbatim and keeps copying until either side closes;
//! `CONNECT` tunnels are spliced blind - the proxy never sees inside the
//! TLS stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use egresswatch_core::entry::{LogEntry, Protocol};
use egresswatch_core::sequencer::{EntrySequencer, SequencerError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod http;

use http::{
    RequestHead, parse_absolute_uri, parse_connect_target, parse_request_head, read_request_head,
};

/// Errors from proxy lifecycle and connection handling.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent something that is not a proxy request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The egress entry could not be appended; the request was not
    /// forwarded.
    #[error(transparent)]
    Audit(#[from] SequencerError),

    /// `start()` was called on a proxy that is already listening.
    #[error("proxy already started")]
    AlreadyStarted,
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port to bind on loopback; 0 selects an ephemeral port.
    pub port: u16,
    /// The function whose egress chain this proxy instance feeds.
    pub function_id: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 0,
            function_id: "default".to_string(),
        }
    }
}

/// State shared by the accept loop and every connection task.
struct ProxyShared {
    sequencer: Arc<EntrySequencer>,
    function_id: String,
    invocation: StdMutex<String>,
    active: AtomicUsize,
}

/// The logging forward proxy.
///
/// One proxy instance serves one sandboxed function at a time; entries
/// logged between invocation-id changes all carry the current id.
pub struct LoggingProxy {
    shared: Arc<ProxyShared>,
    config: ProxyConfig,
    port: u16,
    accept_task: Option<JoinHandle<()>>,
}

impl LoggingProxy {
    /// Creates a proxy that logs through `sequencer`.
    #[must_use]
    pub fn new(sequencer: Arc<EntrySequencer>, config: ProxyConfig) -> Self {
        Self {
            shared: Arc::new(ProxyShared {
                sequencer,
                function_id: config.function_id.clone(),
                invocation: StdMutex::new(Uuid::new_v4().to_string()),
                active: AtomicUsize::new(0),
            }),
            config,
            port: 0,
            accept_task: None,
        }
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound port, which differs from the configured one when
    /// that was 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy is already running or the bind fails.
    pub async fn start(&mut self) -> Result<u16, ProxyError> {
        if self.accept_task.is_some() {
            return Err(ProxyError::AlreadyStarted);
        }

        let listener = TcpListener::bind(("127.0.0.1", self.config.port)).await?;
        self.port = listener.local_addr()?.port();
        info!(port = self.port, function_id = %self.config.function_id, "logging proxy listening");

        let shared = Arc::clone(&self.shared);
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "proxy accept failed");
                        continue;
                    },
                };
                debug!(%peer, "proxy connection accepted");

                shared.active.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(&shared, stream).await {
                        debug!(error = %e, "proxy connection closed with error");
                    }
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }));

        Ok(self.port)
    }

    /// Returns the bound port, or 0 before `start()`.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting and waits for in-flight connections to finish
    /// naturally.
    pub async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            while self.shared.active.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            info!(port = self.port, "logging proxy stopped");
        }
    }

    /// Generates a fresh invocation id and makes it current.
    ///
    /// Mutex poisoning indicates a panic in another thread, which is
    /// unrecoverable.
    #[allow(clippy::missing_panics_doc)]
    #[must_use]
    pub fn new_invocation(&self) -> String {
        let id = Uuid::new_v4().to_string();
        *self.shared.invocation.lock().unwrap() = id.clone();
        id
    }

    /// Adopts an externally generated invocation id, so egress entries
    /// share the id the control plane used for its request entry.
    #[allow(clippy::missing_panics_doc)]
    pub fn set_invocation_id(&self, id: &str) {
        *self.shared.invocation.lock().unwrap() = id.to_string();
    }

    /// Returns the sequencer this proxy logs through.
    #[must_use]
    pub fn sequencer(&self) -> &Arc<EntrySequencer> {
        &self.shared.sequencer
    }
}

impl Drop for LoggingProxy {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn handle_connection(shared: &ProxyShared, mut client: TcpStream) -> Result<(), ProxyError> {
    let (head_bytes, leftover) = read_request_head(&mut client).await?;
    let head = match parse_request_head(&head_bytes) {
        Ok(head) => head,
        Err(e) => {
            let _ = write_simple_response(&mut client, 400, "Bad Request").await;
            return Err(e);
        },
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_tunnel(shared, client, &head, &leftover).await
    } else {
        handle_forward(shared, client, &head, &leftover).await
    }
}

/// Plain HTTP forward: log, connect upstream, replay, stream.
async fn handle_forward(
    shared: &ProxyShared,
    mut client: TcpStream,
    head: &RequestHead,
    leftover: &[u8],
) -> Result<(), ProxyError> {
    let (host, port, path) = match parse_absolute_uri(&head.target) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = write_simple_response(&mut client, 400, "Bad Request").await;
            return Err(e);
        },
    };

    // The entry is committed before any forwarding: the audit claim is
    // "this function attempted contact", which must hold even when the
    // upstream is unreachable.
    if let Err(e) = log_egress(
        shared,
        &head.method,
        &host,
        port,
        &path,
        Protocol::Http,
    )
    .await
    {
        warn!(error = %e, "egress entry append failed; refusing to forward");
        let _ = write_simple_response(&mut client, 502, "Bad Gateway").await;
        return Err(e.into());
    }

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(host = %host, port, error = %e, "upstream unreachable");
            let _ = write_simple_response(&mut client, 502, "Bad Gateway").await;
            return Ok(());
        },
    };

    let mut request_head = format!("{} {} HTTP/1.1\r\n", head.method, path);
    for (name, value) in head.forwarded_headers() {
        request_head.push_str(name);
        request_head.push_str(": ");
        request_head.push_str(value);
        request_head.push_str("\r\n");
    }
    request_head.push_str("\r\n");

    upstream.write_all(request_head.as_bytes()).await?;
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
    }

    // Stream request body up and response back until either side closes.
    // A client abort tears the upstream down; the entry above stands.
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// `CONNECT` tunnel: log, connect, acknowledge, splice blind.
async fn handle_tunnel(
    shared: &ProxyShared,
    mut client: TcpStream,
    head: &RequestHead,
    leftover: &[u8],
) -> Result<(), ProxyError> {
    let (host, port) = match parse_connect_target(&head.target) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = write_simple_response(&mut client, 400, "Bad Request").await;
            return Err(e);
        },
    };

    if let Err(e) = log_egress(shared, "CONNECT", &host, port, "/", Protocol::Https).await {
        warn!(error = %e, "egress entry append failed; refusing to tunnel");
        let _ = write_simple_response(&mut client, 502, "Bad Gateway").await;
        return Err(e.into());
    }

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(host = %host, port, error = %e, "tunnel target unreachable");
            let _ = write_simple_response(&mut client, 502, "Bad Gateway").await;
            return Ok(());
        },
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    // TLS bytes may already sit behind the CONNECT head.
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
    }

    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

async fn log_egress(
    shared: &ProxyShared,
    method: &str,
    host: &str,
    port: u16,
    path: &str,
    protocol: Protocol,
) -> Result<(), SequencerError> {
    let invocation_id = shared.invocation.lock().unwrap().clone();
    let function_id = shared.function_id.clone();

    shared
        .sequencer
        .append_with(&shared.function_id, |sequence, timestamp| {
            LogEntry::Egress {
                sequence,
                function_id,
                invocation_id,
                timestamp,
                method: method.to_string(),
                host: host.to_string(),
                port,
                path: path.to_string(),
                protocol,
            }
        })
        .await?;
    Ok(())
}

async fn write_simple_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
) -> std::io::Result<()> {
    let response =
        format!("HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await
}
