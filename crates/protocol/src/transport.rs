//! HTTP/1.1-shaped request/response framing.
//!
//! One request and one response per connection. The request body is the
//! complete envelope ciphertext and its length must be declared with
//! `Content-Length`. Every response carries `Connection: close`.
//!
//! Reading is split into phases ([`read_request_line`], [`read_headers`],
//! [`read_body`]) so a server can bound each one with its own timeout.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::framing::MAX_ENVELOPE_SIZE;
use crate::messages::StatusCode;

/// Maximum length of the request line, including the line terminator.
pub const MAX_REQUEST_LINE: usize = 65536;

/// Maximum number of header lines.
pub const MAX_HEADERS: usize = 100;

/// Method used by clients.
pub const REQUEST_METHOD: &str = "POST";

/// Target used by clients.
pub const REQUEST_TARGET: &str = "/";

const HTTP_VERSION: &str = "HTTP/1.1";

/// Errors from reading or writing wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The request line exceeds [`MAX_REQUEST_LINE`].
    #[error("request line exceeds {} bytes", MAX_REQUEST_LINE)]
    LineTooLong,

    /// No `Content-Length` header.
    #[error("missing Content-Length header")]
    MissingLength,

    /// The declared body exceeds [`MAX_ENVELOPE_SIZE`].
    #[error("body of {size} bytes exceeds maximum of {} bytes", MAX_ENVELOPE_SIZE)]
    BodyTooLarge {
        /// Declared length.
        size: usize,
    },

    /// The message is not valid framing.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The peer closed the connection mid-message.
    #[error("peer disconnected")]
    Disconnected,

    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Status to answer with, if the connection is still usable.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            WireError::LineTooLong => Some(StatusCode::UriTooLong),
            WireError::MissingLength | WireError::Malformed(_) => Some(StatusCode::BadRequest),
            WireError::BodyTooLarge { .. } => Some(StatusCode::PayloadTooLarge),
            WireError::Disconnected | WireError::Io(_) => None,
        }
    }
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// Request method.
    pub method: String,
    /// Request target.
    pub target: String,
}

/// Request headers relevant to the protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    /// Declared body length, if present.
    pub content_length: Option<usize>,
}

impl Headers {
    /// Returns the declared body length, checked against the size cap.
    pub fn body_length(&self) -> Result<usize, WireError> {
        let length = self.content_length.ok_or(WireError::MissingLength)?;
        if length > MAX_ENVELOPE_SIZE {
            return Err(WireError::BodyTooLarge { size: length });
        }
        Ok(length)
    }
}

/// A complete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The request line.
    pub line: RequestLine,
    /// The body.
    pub body: Vec<u8>,
}

impl Request {
    /// Create a client request carrying `body`.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            line: RequestLine {
                method: REQUEST_METHOD.to_string(),
                target: REQUEST_TARGET.to_string(),
            },
            body,
        }
    }

    /// Writes the request.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WireError> {
        let head = format!(
            "{} {} {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.line.method,
            self.line.target,
            HTTP_VERSION,
            self.body.len()
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads a complete request without per-phase timeouts.
    ///
    /// Returns `None` if the peer closed the connection before sending
    /// anything.
    pub async fn read<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Self>, WireError> {
        let Some(line) = read_request_line(reader).await? else {
            return Ok(None);
        };
        let headers = read_headers(reader).await?;
        let body = read_body(reader, headers.body_length()?).await?;
        Ok(Some(Self { line, body }))
    }
}

/// A response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Numeric status.
    pub status: u16,
    /// The body: an envelope, or empty for status-only responses.
    pub body: Vec<u8>,
}

impl Response {
    /// A response carrying an envelope.
    pub fn envelope(body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::Ok.as_u16(),
            body,
        }
    }

    /// A response with no body.
    pub fn status_only(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            body: Vec::new(),
        }
    }

    /// Writes the response.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WireError> {
        let reason = StatusCode::from_u16(self.status)
            .map(StatusCode::reason)
            .unwrap_or("Unknown");
        let head = format!(
            "{} {} {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            HTTP_VERSION,
            self.status,
            reason,
            self.body.len()
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads a response.
    ///
    /// A response without `Content-Length` has a body running to the end of
    /// the connection.
    pub async fn read<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let line = read_line(reader, MAX_REQUEST_LINE)
            .await?
            .ok_or(WireError::Disconnected)?;
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(WireError::Malformed(format!("bad status line: {:?}", line)));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| WireError::Malformed(format!("bad status line: {:?}", line)))?;

        let headers = read_headers(reader).await?;
        let body = match headers.content_length {
            Some(_) => read_body(reader, headers.body_length()?).await?,
            None => {
                let mut body = Vec::new();
                (&mut *reader)
                    .take(MAX_ENVELOPE_SIZE as u64 + 1)
                    .read_to_end(&mut body)
                    .await?;
                if body.len() > MAX_ENVELOPE_SIZE {
                    return Err(WireError::BodyTooLarge { size: body.len() });
                }
                body
            }
        };

        Ok(Self { status, body })
    }
}

/// Reads one line of at most `cap` bytes including the terminator.
///
/// Returns `None` on a clean end of stream.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> Result<Option<String>, WireError> {
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(cap as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Ok(None);
    }
    if buf.len() > cap {
        return Err(WireError::LineTooLong);
    }

    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| WireError::Malformed("line is not valid UTF-8".to_string()))
}

/// Reads the request line.
///
/// Returns `None` if the peer closed the connection without sending anything.
pub async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<RequestLine>, WireError> {
    let Some(line) = read_line(reader, MAX_REQUEST_LINE).await? else {
        return Ok(None);
    };

    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [method, target, version] if version.starts_with("HTTP/") => Ok(Some(RequestLine {
            method: method.to_string(),
            target: target.to_string(),
        })),
        _ => Err(WireError::Malformed(format!("bad request line: {:?}", line))),
    }
}

/// Reads headers up to the blank line.
pub async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Headers, WireError> {
    let mut headers = Headers::default();

    for _ in 0..=MAX_HEADERS {
        let line = read_line(reader, MAX_REQUEST_LINE)
            .await
            .map_err(|e| match e {
                WireError::LineTooLong => WireError::Malformed("header line too long".to_string()),
                other => other,
            })?
            .ok_or(WireError::Disconnected)?;

        if line.is_empty() {
            return Ok(headers);
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WireError::Malformed(format!("bad header: {:?}", line)))?;

        if name.trim().eq_ignore_ascii_case("content-length") {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| WireError::Malformed(format!("bad Content-Length: {:?}", value)))?;
            headers.content_length = Some(length);
        }
    }

    Err(WireError::Malformed(format!(
        "more than {} header lines",
        MAX_HEADERS
    )))
}

/// Reads exactly `length` body bytes.
pub async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    length: usize,
) -> Result<Vec<u8>, WireError> {
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::Disconnected
        } else {
            WireError::Io(e)
        }
    })?;
    Ok(body)
}
