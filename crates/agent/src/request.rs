//! Per-connection request handling.
//!
//! Every connection goes through the same phases, each terminal on failure:
//!
//! ```text
//! Accepted → ReadRequestLine → ReadHeaders → ReadBody → Decode → Dispatch → Encode → Respond → Closed
//! ```
//!
//! Until the sender is authenticated there is nobody to seal a reply to, so
//! the early failures (414, 400 for a missing length, 413, 403) are answered
//! with a bare status. From authentication onwards every reply, success or
//! failure, is a sealed [`ActionResult`] addressed to the sender. A read
//! timeout at any phase closes the connection without a reply.
//!
//! Events from this module go to the request log.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::transport::{self, WireError};
use protocol::{
    ActionResult, Address, Command, EnvelopeCodec, Fingerprint, Registry, Response, StatusCode,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn, Instrument};

use crate::modules::Handler;

/// Tracing target of request-handling events.
pub(crate) const TARGET: &str = module_path!();

/// Everything a connection worker needs, shared by all of them.
#[derive(Clone)]
pub struct RequestContext {
    codec: EnvelopeCodec,
    registry: Arc<Registry<Handler>>,
    timeout: Duration,
}

impl RequestContext {
    /// Create a context.
    pub fn new(codec: EnvelopeCodec, registry: Registry<Handler>, timeout: Duration) -> Self {
        Self {
            codec,
            registry: Arc::new(registry),
            timeout,
        }
    }

    /// The read timeout applied to each phase.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// How a connection ends.
#[derive(Debug)]
enum Reply {
    /// Close without writing anything.
    Close,
    /// A status line with no body.
    Status(StatusCode),
    /// A sealed result for the authenticated sender.
    Sealed {
        recipient: Fingerprint,
        result: ActionResult,
    },
}

impl Reply {
    fn sealed(recipient: Fingerprint, result: ActionResult) -> Self {
        Reply::Sealed { recipient, result }
    }

    fn sealed_error(recipient: Fingerprint, status: StatusCode) -> Self {
        Reply::Sealed {
            recipient,
            result: ActionResult::error(status),
        }
    }
}

/// A phase that did not complete.
enum Interrupted {
    TimedOut,
    Failed(WireError),
}

async fn phase<T, F>(timeout: Duration, future: F) -> Result<T, Interrupted>
where
    F: Future<Output = Result<T, WireError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Interrupted::Failed(e)),
        Err(_) => Err(Interrupted::TimedOut),
    }
}

/// Reply for a wire failure before authentication.
fn rejected(stage: &str, interrupted: Interrupted) -> Reply {
    match interrupted {
        Interrupted::TimedOut => {
            info!("timed out reading {}; closing", stage);
            Reply::Close
        }
        Interrupted::Failed(e) => match e.status() {
            Some(status) => {
                warn!("rejecting request while reading {}: {}", stage, e);
                Reply::Status(status)
            }
            None => {
                debug!("connection lost while reading {}: {}", stage, e);
                Reply::Close
            }
        },
    }
}

/// Serve one connection: read one request, write at most one response.
pub async fn serve_connection<S>(stream: S, peer: SocketAddr, context: RequestContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let span = tracing::info_span!(
        target: TARGET,
        "request",
        peer = %peer,
        id = %uuid::Uuid::new_v4()
    );
    serve(stream, context).instrument(span).await
}

async fn serve<S>(stream: S, context: RequestContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let reply = handle(&mut reader, &context).await;
    let response = match reply {
        Reply::Close => None,
        Reply::Status(status) => Some(Response::status_only(status)),
        Reply::Sealed { recipient, result } => seal(&context, recipient, result).await,
    };

    if let Some(response) = response {
        if let Err(e) = response.write(&mut write_half).await {
            debug!("failed to write response: {}", e);
        }
    }
    let _ = write_half.shutdown().await;
}

async fn handle<R>(reader: &mut R, context: &RequestContext) -> Reply
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let timeout = context.timeout;

    // ReadRequestLine
    let line = match phase(timeout, transport::read_request_line(reader)).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!("peer closed the connection before sending a request");
            return Reply::Close;
        }
        Err(interrupted) => return rejected("request line", interrupted),
    };
    debug!("{} {}", line.method, line.target);

    // ReadHeaders
    let headers = match phase(timeout, transport::read_headers(reader)).await {
        Ok(headers) => headers,
        Err(interrupted) => return rejected("headers", interrupted),
    };
    let length = match headers.body_length() {
        Ok(length) => length,
        Err(e) => return rejected("headers", Interrupted::Failed(e)),
    };

    // ReadBody
    let body = match phase(timeout, transport::read_body(reader, length)).await {
        Ok(body) => body,
        Err(interrupted) => return rejected("body", interrupted),
    };

    // Decode
    let codec = context.codec.clone();
    let envelope = match tokio::task::spawn_blocking(move || codec.open(&body)).await {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("envelope decryption task failed: {}", e);
            return Reply::Status(StatusCode::InternalServerError);
        }
    };
    let signer = match envelope.authenticated_signer() {
        Ok(signer) => signer,
        Err(_) => {
            if envelope.plaintext.is_empty() {
                warn!("decrypted request body was empty; authentication failure");
            } else {
                warn!("request unsigned or signing key not trusted");
            }
            return Reply::Status(StatusCode::Forbidden);
        }
    };
    info!("authenticated request from {}", signer);

    let command: Command = match envelope.parse() {
        Ok(command) => command,
        Err(e) => {
            warn!("failed to interpret request: {}", e);
            return Reply::sealed_error(signer, StatusCode::BadRequest);
        }
    };

    // Dispatch
    let handler = match Address::parse(&command.action)
        .and_then(|address| context.registry.resolve(&address).cloned())
    {
        Ok(handler) => handler,
        Err(e) => {
            warn!("{}", e);
            return Reply::sealed_error(signer, e.status());
        }
    };

    info!("dispatching {}", command.action);
    let parameters = command.parameters;
    match tokio::task::spawn_blocking(move || handler(parameters)).await {
        Ok(Ok(result)) => {
            info!(
                "{} finished: success={} status={}",
                command.action, result.success, result.status
            );
            Reply::sealed(signer, result)
        }
        Ok(Err(e)) => {
            error!("{} failed: {:#}", command.action, e);
            Reply::sealed_error(signer, StatusCode::InternalServerError)
        }
        Err(e) => {
            error!("{} panicked: {}", command.action, e);
            Reply::sealed_error(signer, StatusCode::InternalServerError)
        }
    }
}

/// Encode: seal the result to the authenticated sender.
async fn seal(
    context: &RequestContext,
    recipient: Fingerprint,
    result: ActionResult,
) -> Option<Response> {
    let status = if result.status >= 400 {
        result.status
    } else {
        StatusCode::Ok.as_u16()
    };

    let codec = context.codec.clone();
    match tokio::task::spawn_blocking(move || codec.encode(&result, &recipient)).await {
        Ok(Ok(body)) => Some(Response { status, body }),
        Ok(Err(e)) => {
            error!("failed to seal response to {}: {}", recipient, e);
            Some(Response::status_only(StatusCode::InternalServerError))
        }
        Err(e) => {
            error!("response sealing task failed: {}", e);
            Some(Response::status_only(StatusCode::InternalServerError))
        }
    }
}
