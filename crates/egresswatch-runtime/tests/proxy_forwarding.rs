//! End-to-end proxy tests: forwarding, tunneling, pre-forward logging,
//! and concurrent sequencing.

mod common;

use std::sync::Arc;

use chrono::Utc;
use egresswatch_core::entry::{LogEntry, Protocol, SignedLogEntry};
use egresswatch_core::signer::verify_signature;
use egresswatch_core::store::{BoxFuture, LogStore, StoreError};
use egresswatch_core::verify::verify_log_integrity;
use egresswatch_runtime::proxy::{LoggingProxy, ProxyConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{proxy_get, spawn_http_upstream, test_sequencer};

fn proxy_for(function_id: &str) -> LoggingProxy {
    LoggingProxy::new(
        test_sequencer(),
        ProxyConfig {
            port: 0,
            function_id: function_id.to_string(),
        },
    )
}

#[tokio::test]
async fn single_get_produces_signed_entry() {
    let (upstream, _, _server) = spawn_http_upstream().await;
    let mut proxy = proxy_for("fn-single");
    let port = proxy.start().await.unwrap();

    let before = Utc::now();
    let (status, body) = proxy_get(
        port,
        &format!("http://127.0.0.1:{}/test-path", upstream.port()),
    )
    .await;
    let after = Utc::now();

    assert_eq!(status, 200);
    assert!(body.contains("GET /test-path HTTP/1.1"));

    let entries = proxy.sequencer().store().get_all("fn-single").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].signature.is_empty());

    match &entries[0].entry {
        LogEntry::Egress {
            sequence,
            method,
            host,
            port: logged_port,
            path,
            protocol,
            timestamp,
            ..
        } => {
            assert_eq!(*sequence, 1);
            assert_eq!(method, "GET");
            assert_eq!(host, "127.0.0.1");
            assert_eq!(*logged_port, upstream.port());
            assert_eq!(path, "/test-path");
            assert_eq!(*protocol, Protocol::Http);
            assert!(*timestamp >= before && *timestamp <= after);
        },
        other => panic!("expected egress entry, got {other:?}"),
    }

    let report = verify_log_integrity(
        &entries,
        proxy.sequencer().signer().public_key_pem(),
        &verify_signature,
    );
    assert!(report.valid, "errors: {:?}", report.errors);

    proxy.stop().await;
}

#[tokio::test]
async fn tampered_entry_fails_verification() {
    let (upstream, _, _server) = spawn_http_upstream().await;
    let mut proxy = proxy_for("fn-tamper");
    let port = proxy.start().await.unwrap();

    proxy_get(port, &format!("http://127.0.0.1:{}/x", upstream.port())).await;

    let mut entries = proxy.sequencer().store().get_all("fn-tamper").await.unwrap();
    if let LogEntry::Egress { host, .. } = &mut entries[0].entry {
        *host = "evil.com".to_string();
    }

    let report = verify_log_integrity(
        &entries,
        proxy.sequencer().signer().public_key_pem(),
        &verify_signature,
    );
    assert!(!report.valid);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("Invalid signature")),
        "errors: {:?}",
        report.errors
    );

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_sequences_contiguously() {
    let (upstream, _, _server) = spawn_http_upstream().await;
    let mut proxy = proxy_for("fn-burst");
    let port = proxy.start().await.unwrap();

    let mut clients = Vec::new();
    for i in 0..10 {
        let upstream_port = upstream.port();
        clients.push(tokio::spawn(async move {
            proxy_get(
                port,
                &format!("http://127.0.0.1:{upstream_port}/concurrent-{i}"),
            )
            .await
        }));
    }
    for client in clients {
        let (status, _) = client.await.unwrap();
        assert_eq!(status, 200);
    }

    let entries = proxy.sequencer().store().get_all("fn-burst").await.unwrap();
    assert_eq!(entries.len(), 10);

    let mut sequences: Vec<u64> = entries.iter().map(|e| e.entry.sequence()).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());

    let report = verify_log_integrity(
        &entries,
        proxy.sequencer().signer().public_key_pem(),
        &verify_signature,
    );
    assert!(report.valid, "errors: {:?}", report.errors);

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_returns_502_with_entry_committed() {
    // Grab a port with no listener behind it.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let mut proxy = proxy_for("fn-dead");
    let port = proxy.start().await.unwrap();

    let (status, _) = proxy_get(port, &format!("http://127.0.0.1:{dead_port}/gone")).await;
    assert_eq!(status, 502);

    // Pre-forward logging: the attempt is attested even though contact
    // failed.
    let entries = proxy.sequencer().store().get_all("fn-dead").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry.sequence(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn connect_tunnel_splices_and_logs_https_entry() {
    let (echo, _server) = common::spawn_tcp_echo().await;
    let mut proxy = proxy_for("fn-tunnel");
    let port = proxy.start().await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port()).as_bytes())
        .await
        .unwrap();

    // Read the proxy's acknowledgement head.
    let mut ack = Vec::new();
    let mut byte = [0u8; 1];
    while !ack.windows(4).any(|w| w == b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        ack.push(byte[0]);
    }
    let ack_text = String::from_utf8_lossy(&ack);
    assert!(ack_text.starts_with("HTTP/1.1 200"), "ack: {ack_text}");

    // The tunnel is a blind byte pipe.
    stream.write_all(b"opaque tls bytes").await.unwrap();
    let mut echoed = [0u8; 16];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"opaque tls bytes");
    drop(stream);

    let entries = proxy.sequencer().store().get_all("fn-tunnel").await.unwrap();
    assert_eq!(entries.len(), 1);
    match &entries[0].entry {
        LogEntry::Egress {
            method,
            host,
            port: logged_port,
            path,
            protocol,
            ..
        } => {
            assert_eq!(method, "CONNECT");
            assert_eq!(host, "127.0.0.1");
            assert_eq!(*logged_port, echo.port());
            assert_eq!(path, "/");
            assert_eq!(*protocol, Protocol::Https);
        },
        other => panic!("expected egress entry, got {other:?}"),
    }

    proxy.stop().await;
}

#[tokio::test]
async fn invocation_id_correlates_entries() {
    let (upstream, _, _server) = spawn_http_upstream().await;
    let mut proxy = proxy_for("fn-corr");
    let port = proxy.start().await.unwrap();

    let first = proxy.new_invocation();
    proxy_get(port, &format!("http://127.0.0.1:{}/a", upstream.port())).await;
    proxy_get(port, &format!("http://127.0.0.1:{}/b", upstream.port())).await;

    proxy.set_invocation_id("external-inv-9");
    proxy_get(port, &format!("http://127.0.0.1:{}/c", upstream.port())).await;

    let entries = proxy.sequencer().store().get_all("fn-corr").await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].entry.invocation_id(), first);
    assert_eq!(entries[1].entry.invocation_id(), first);
    assert_eq!(entries[2].entry.invocation_id(), "external-inv-9");

    proxy.stop().await;
}

/// A store whose appends always fail, to exercise the abort path.
struct RejectingStore;

impl LogStore for RejectingStore {
    fn append<'a>(&'a self, entry: &'a SignedLogEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            Err(StoreError::DuplicateSequence {
                function_id: entry.entry.function_id().to_string(),
                sequence: entry.entry.sequence(),
            })
        })
    }

    fn get_all<'a>(
        &'a self,
        _function_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SignedLogEntry>, StoreError>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn latest_sequence<'a>(
        &'a self,
        _function_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move { Ok(0) })
    }
}

#[tokio::test]
async fn append_failure_aborts_forward_with_502() {
    use egresswatch_core::sequencer::EntrySequencer;
    use egresswatch_core::signer::Signer;

    let (upstream, connections, _server) = spawn_http_upstream().await;

    let sequencer = Arc::new(EntrySequencer::new(
        Arc::new(RejectingStore),
        Arc::new(Signer::generate().unwrap()),
    ));
    let mut proxy = LoggingProxy::new(
        sequencer,
        ProxyConfig {
            port: 0,
            function_id: "fn-reject".to_string(),
        },
    );
    let port = proxy.start().await.unwrap();

    let (status, _) = proxy_get(port, &format!("http://127.0.0.1:{}/x", upstream.port())).await;
    assert_eq!(status, 502);

    // The request that could not be attested was never forwarded.
    assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 0);

    proxy.stop().await;
}
