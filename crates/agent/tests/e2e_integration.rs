//! End-to-end integration tests for the fleet agent.
//!
//! These tests run a real listener on loopback and talk to it with the real
//! client, covering:
//! - Round trips through the package management module
//! - Authentication and trust failures
//! - Malformed and oversized requests
//! - Reply signer checks on the client
//! - Timeouts and concurrency

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent::modules::{self, ModuleContext};
use agent::packages::{PackageError, PackageManager, RefreshOutcome};
use agent::{Listener, RequestContext};
use client::{Client, ClientConfig, NodeConfig, QueryEngine, QueryError};
use protocol::{
    ActionResult, Command, EnvelopeCodec, Fingerprint, Keyring, Parameters, TrustLevel,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Package manager that records calls instead of running anything.
#[derive(Debug)]
struct FakePackages {
    outcome: RefreshOutcome,
    refreshes: AtomicUsize,
    updates: Mutex<Vec<bool>>,
}

impl FakePackages {
    fn new(success: bool, needs_update: bool) -> Self {
        Self {
            outcome: RefreshOutcome {
                success,
                needs_update,
            },
            refreshes: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl PackageManager for FakePackages {
    fn name(&self) -> &str {
        "fake"
    }

    fn refresh(&self) -> Result<RefreshOutcome, PackageError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome)
    }

    fn update(&self, upgrade: bool) -> Result<bool, PackageError> {
        self.updates.lock().unwrap().push(upgrade);
        Ok(self.outcome.success)
    }
}

/// A running agent, the operator's codec and the fake package manager.
struct Harness {
    temp_dir: TempDir,
    addr: SocketAddr,
    agent_fp: Fingerprint,
    operator: EnvelopeCodec,
    agent_keyring: Arc<Keyring>,
    packages: Arc<FakePackages>,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(packages: FakePackages) -> Self {
        Self::start_with_timeout(packages, Duration::from_secs(5)).await
    }

    async fn start_with_timeout(packages: FakePackages, timeout: Duration) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let agent_keyring = Arc::new(Keyring::new(temp_dir.path().join("agent")));
        let operator_keyring = Arc::new(Keyring::new(temp_dir.path().join("operator")));

        let agent_fp = agent_keyring.generate("web-01");
        let operator_fp = operator_keyring.generate("ops");
        agent_keyring
            .import(
                &operator_keyring.export(&operator_fp).unwrap(),
                TrustLevel::Trusted,
            )
            .unwrap();
        operator_keyring
            .import(&agent_keyring.export(&agent_fp).unwrap(), TrustLevel::Trusted)
            .unwrap();

        let packages = Arc::new(packages);
        let registry = modules::registry(&ModuleContext {
            packages: packages.clone(),
        })
        .unwrap();
        let context = RequestContext::new(
            EnvelopeCodec::new(agent_keyring.clone(), agent_fp),
            registry,
            timeout,
        );

        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), context)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.run(shutdown.clone()));

        Self {
            temp_dir,
            addr,
            agent_fp,
            operator: EnvelopeCodec::new(operator_keyring, operator_fp),
            agent_keyring,
            packages,
            shutdown,
        }
    }

    fn engine(&self) -> QueryEngine {
        QueryEngine::new(self.operator.clone(), Duration::from_secs(5))
    }

    fn client(&self) -> Client {
        let mut config = ClientConfig::default();
        config.identity.fingerprint = Some(self.operator.local());
        config
            .add_node(
                "web-01",
                NodeConfig {
                    address: self.addr.to_string(),
                    fingerprint: self.agent_fp,
                },
            )
            .unwrap();
        Client::new(config, self.operator.keyring().clone()).unwrap()
    }

    /// A second operator that trusts the agent, imported into the agent's
    /// keyring at `level` (or not at all).
    fn stranger(&self, level: Option<TrustLevel>) -> EnvelopeCodec {
        let keyring = Arc::new(Keyring::new(self.temp_dir.path().join("stranger")));
        let fp = keyring.generate("mallory");
        keyring
            .import(
                &self.agent_keyring.export(&self.agent_fp).unwrap(),
                TrustLevel::Trusted,
            )
            .unwrap();
        if let Some(level) = level {
            self.agent_keyring
                .import(&keyring.export(&fp).unwrap(), level)
                .unwrap();
        }
        EnvelopeCodec::new(keyring, fp)
    }

    async fn query(&self, action: &str, parameters: Parameters) -> Result<ActionResult, QueryError> {
        self.engine()
            .query(
                &self.addr.to_string(),
                &self.agent_fp,
                &Command::new(action, parameters),
            )
            .await
    }

    /// Sends raw bytes, then ends the request stream, and returns
    /// everything the agent writes back.
    async fn raw(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.shutdown().await.unwrap();
        read_all(stream).await
    }
}

/// Reads until the agent closes. A reset after the response still returns
/// what arrived before it.
async fn read_all(mut stream: TcpStream) -> Vec<u8> {
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("agent did not close the connection");
    response
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn http(body: &[u8]) -> Vec<u8> {
    let mut raw =
        format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    raw.extend_from_slice(body);
    raw
}

// =============================================================================
// Round Trips
// =============================================================================

#[tokio::test]
async fn test_refresh_with_empty_parameters() {
    let harness = Harness::start(FakePackages::new(true, true)).await;

    let result = harness
        .query("packagemanagement.refresh", Parameters::new())
        .await
        .unwrap();

    assert_eq!(result.data, json!({"needs_update": true}));
    assert!(result.success);
    assert_eq!(result.status, u16::from(result.success));
    assert_eq!(harness.packages.refreshes(), 1);
}

#[tokio::test]
async fn test_failed_refresh_status_is_zero() {
    let harness = Harness::start(FakePackages::new(false, false)).await;

    let result = harness
        .query("packagemanagement.refresh", Parameters::new())
        .await
        .unwrap();

    assert!(result.data["needs_update"].is_boolean());
    assert!(!result.success);
    assert_eq!(result.status, 0);
}

#[tokio::test]
async fn test_client_request_formats_result() {
    let harness = Harness::start(FakePackages::new(true, true)).await;
    let client = harness.client();

    let formatted = client
        .request("web-01", "packagemanagement.refresh", &[])
        .await
        .unwrap();

    assert_eq!(formatted.exit_code, 0);
    assert_eq!(formatted.display, "Updates are available");
}

#[tokio::test]
async fn test_client_update_passes_upgrade_flag() {
    let harness = Harness::start(FakePackages::new(true, true)).await;
    let client = harness.client();

    let formatted = client
        .request(
            "web-01",
            "packagemanagement.UPDATE",
            &["--upgrade".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(formatted.exit_code, 0);
    assert_eq!(harness.packages.refreshes(), 1);
    assert_eq!(*harness.packages.updates.lock().unwrap(), vec![true]);
}

#[tokio::test]
async fn test_same_command_twice_runs_twice() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let first = harness
        .query("packagemanagement.refresh", Parameters::new())
        .await
        .unwrap();
    let second = harness
        .query("packagemanagement.refresh", Parameters::new())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.packages.refreshes(), 2);
}

#[tokio::test]
async fn test_concurrent_queries() {
    let harness = Arc::new(Harness::start(FakePackages::new(true, false)).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let harness = harness.clone();
        handles.push(tokio::spawn(async move {
            harness
                .query("packagemanagement.refresh", Parameters::new())
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().success);
    }

    assert_eq!(harness.packages.refreshes(), 8);
}

// =============================================================================
// Dispatch Failures
// =============================================================================

#[tokio::test]
async fn test_unknown_module_is_signed_501() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let result = harness.query("nomodule.x", Parameters::new()).await.unwrap();

    assert_eq!(result.status, 501);
    assert!(!result.success);
    assert_eq!(harness.packages.refreshes(), 0);
}

#[tokio::test]
async fn test_unknown_action_is_signed_405() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let result = harness
        .query("packagemanagement.install", Parameters::new())
        .await
        .unwrap();
    assert_eq!(result.status, 405);

    let result = harness.query("refresh", Parameters::new()).await.unwrap();
    assert_eq!(result.status, 405);
}

#[tokio::test]
async fn test_malformed_command_is_signed_400() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let body = harness
        .operator
        .encode(&json!({"parameters": {}}), &harness.agent_fp)
        .unwrap();
    let response = harness.raw(&http(&body)).await;

    assert!(response.starts_with(b"HTTP/1.1 400"));
    let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let (result, signer): (ActionResult, _) =
        harness.operator.decode(&response[split + 4..]).unwrap();
    assert_eq!(signer, harness.agent_fp);
    assert_eq!(result.status, 400);
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_unknown_sender_is_rejected() {
    let harness = Harness::start(FakePackages::new(true, false)).await;
    let stranger = QueryEngine::new(harness.stranger(None), Duration::from_secs(5));

    let err = stranger
        .query(
            &harness.addr.to_string(),
            &harness.agent_fp,
            &Command::new("packagemanagement.refresh", Parameters::new()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, QueryError::Rejected { status: 403 }));
    assert_eq!(harness.packages.refreshes(), 0);
}

#[tokio::test]
async fn test_pending_and_untrusted_senders_are_rejected() {
    for level in [TrustLevel::Unknown, TrustLevel::Untrusted] {
        let harness = Harness::start(FakePackages::new(true, false)).await;
        let stranger = QueryEngine::new(harness.stranger(Some(level)), Duration::from_secs(5));

        let err = stranger
            .query(
                &harness.addr.to_string(),
                &harness.agent_fp,
                &Command::new("packagemanagement.refresh", Parameters::new()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Rejected { status: 403 }), "{}", level);
        assert_eq!(harness.packages.refreshes(), 0);
    }
}

#[tokio::test]
async fn test_empty_plaintext_is_403() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let body = harness
        .operator
        .keyring()
        .sign_and_encrypt(b"", &harness.agent_fp, &harness.operator.local())
        .unwrap();
    let response = harness.raw(&http(&body)).await;

    assert!(response.starts_with(b"HTTP/1.1 403"));
    assert!(response.ends_with(b"\r\n\r\n"));
    assert_eq!(harness.packages.refreshes(), 0);
}

#[tokio::test]
async fn test_garbage_body_is_403() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let response = harness.raw(&http(b"FLTE\x01 definitely not sealed")).await;

    assert!(response.starts_with(b"HTTP/1.1 403"));
    assert_eq!(harness.packages.refreshes(), 0);
}

#[tokio::test]
async fn test_reply_from_unexpected_signer_fails() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    // The agent holds a second key it can decrypt with but does not sign with
    let other_fp = harness.agent_keyring.generate("web-01-old");
    harness
        .operator
        .keyring()
        .import(
            &harness.agent_keyring.export(&other_fp).unwrap(),
            TrustLevel::Trusted,
        )
        .unwrap();

    let err = harness
        .engine()
        .query(
            &harness.addr.to_string(),
            &other_fp,
            &Command::new("packagemanagement.refresh", Parameters::new()),
        )
        .await
        .unwrap_err();

    match err {
        QueryError::UnexpectedSigner { expected, actual } => {
            assert_eq!(expected, other_fp);
            assert_eq!(actual, harness.agent_fp);
        }
        other => panic!("Expected UnexpectedSigner, got {:?}", other),
    }
}

// =============================================================================
// Transport
// =============================================================================

#[tokio::test]
async fn test_missing_content_length_is_400_without_dispatch() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let response = harness
        .raw(b"POST / HTTP/1.1\r\nHost: web-01\r\n\r\n")
        .await;

    assert!(response.starts_with(b"HTTP/1.1 400"));
    assert!(response.ends_with(b"Content-Length: 0\r\nConnection: close\r\n\r\n"));
    assert_eq!(harness.packages.refreshes(), 0);
}

#[tokio::test]
async fn test_oversized_request_line_is_414() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    // One byte over the limit and no newline, so the agent reads all of it
    let mut request = b"POST /".to_vec();
    request.resize(protocol::MAX_REQUEST_LINE + 1, b'x');
    let response = harness.raw(&request).await;

    assert!(response.starts_with(b"HTTP/1.1 414"));
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    let response = harness
        .raw(b"POST / HTTP/1.1\r\nContent-Length: 999999999\r\n\r\n")
        .await;

    assert!(response.starts_with(b"HTTP/1.1 413"));
}

#[tokio::test]
async fn test_stalled_request_closes_without_response() {
    let harness =
        Harness::start_with_timeout(FakePackages::new(true, false), Duration::from_millis(200))
            .await;

    // Keep the connection open so only the timeout can end it
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\npartial")
        .await
        .unwrap();
    let response = read_all(stream).await;

    assert!(response.is_empty());
    assert_eq!(harness.packages.refreshes(), 0);
}

#[tokio::test]
async fn test_agent_keeps_serving_after_bad_requests() {
    let harness = Harness::start(FakePackages::new(true, false)).await;

    harness.raw(b"garbage\r\n\r\n").await;
    harness.raw(b"").await;

    let result = harness
        .query("packagemanagement.refresh", Parameters::new())
        .await
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn test_unreachable_agent_is_undetermined() {
    let harness = Harness::start(FakePackages::new(true, false)).await;
    harness.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = harness
        .query("packagemanagement.refresh", Parameters::new())
        .await
        .unwrap_err();
    assert!(err.is_undetermined());
}
