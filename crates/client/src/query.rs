//! Client query engine.
//!
//! One query is one connection: the command is sealed to the node's key,
//! sent as a single request, and the reply is opened and checked against the
//! fingerprint the node is *expected* to sign with. Any trusted key is not
//! enough; a reply from the wrong trusted key is [`QueryError::UnexpectedSigner`].

use std::time::Duration;

use protocol::{ActionResult, Command, EnvelopeCodec, Fingerprint, Request, Response, WireError};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;

/// Exit status: the node rejected the request or the reply failed checks.
pub const EXIT_REJECTED: i32 = 2;
/// Exit status: the command may or may not have run.
pub const EXIT_UNDETERMINED: i32 = 75;
/// Exit status: local configuration or keys are unusable.
pub const EXIT_CONFIG: i32 = 78;

/// Errors from a single query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The command could not be sealed to the node.
    #[error("cannot encrypt to node: {0}")]
    Crypto(String),

    /// The connection failed before a reply arrived.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No reply within the timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The node answered with a bare status.
    #[error("request rejected by node with status {status}")]
    Rejected { status: u16 },

    /// The reply did not decrypt, or its signer is not trusted.
    #[error("reply failed authentication")]
    AuthenticationFailure,

    /// The reply was signed by a trusted key other than the node's.
    #[error("reply signed by {actual}, expected {expected}")]
    UnexpectedSigner {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    /// The reply decrypted but is not a result.
    #[error("malformed reply: {0}")]
    MalformedPayload(String),
}

impl QueryError {
    /// Whether the command may have run: the client cannot tell.
    pub fn is_undetermined(&self) -> bool {
        matches!(self, QueryError::Transport(_) | QueryError::Timeout(_))
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            QueryError::Crypto(_) => EXIT_CONFIG,
            QueryError::Transport(_) | QueryError::Timeout(_) => EXIT_UNDETERMINED,
            QueryError::Rejected { .. }
            | QueryError::AuthenticationFailure
            | QueryError::UnexpectedSigner { .. }
            | QueryError::MalformedPayload(_) => EXIT_REJECTED,
        }
    }
}

impl From<WireError> for QueryError {
    fn from(error: WireError) -> Self {
        QueryError::Transport(error.to_string())
    }
}

/// Sends commands to nodes.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    codec: EnvelopeCodec,
    timeout: Duration,
}

impl QueryEngine {
    /// Create an engine signing with the codec's local key.
    pub fn new(codec: EnvelopeCodec, timeout: Duration) -> Self {
        Self { codec, timeout }
    }

    /// The per-query timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `command` to the node at `address` and return its result.
    ///
    /// `expected` is both the key the command is sealed to and the only key
    /// the reply may be signed with.
    pub async fn query(
        &self,
        address: &str,
        expected: &Fingerprint,
        command: &Command,
    ) -> Result<ActionResult, QueryError> {
        let body = self
            .codec
            .encode(command, expected)
            .map_err(|e| QueryError::Crypto(e.to_string()))?;

        tracing::debug!(
            "Sending {} ({} bytes) to {} at {}",
            command.action,
            body.len(),
            expected,
            address
        );
        let response = tokio::time::timeout(self.timeout, exchange(address, Request::new(body)))
            .await
            .map_err(|_| QueryError::Timeout(self.timeout))??;
        tracing::debug!(
            "Reply from {}: status {} ({} bytes)",
            address,
            response.status,
            response.body.len()
        );

        self.verify(response, expected)
    }

    /// Checks a reply and extracts its result.
    fn verify(&self, response: Response, expected: &Fingerprint) -> Result<ActionResult, QueryError> {
        if response.body.is_empty() {
            return Err(QueryError::Rejected {
                status: response.status,
            });
        }

        let envelope = self.codec.open(&response.body);
        let signer = envelope
            .authenticated_signer()
            .map_err(|_| QueryError::AuthenticationFailure)?;
        if signer != *expected {
            return Err(QueryError::UnexpectedSigner {
                expected: *expected,
                actual: signer,
            });
        }

        envelope
            .parse()
            .map_err(|e| QueryError::MalformedPayload(e.to_string()))
    }
}

/// Connect, send one request, read one response.
async fn exchange(address: &str, request: Request) -> Result<Response, QueryError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| QueryError::Transport(format!("failed to connect to {}: {}", address, e)))?;
    let (read_half, mut write_half) = tokio::io::split(stream);

    request.write(&mut write_half).await?;
    let mut reader = BufReader::new(read_half);
    Ok(Response::read(&mut reader).await?)
}
