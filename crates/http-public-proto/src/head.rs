//! Raw HTTP/1.x request heads
//!
//! Upgrade requests are routed before any HTTP machinery owns the socket, so
//! the head is parsed straight off the wire with `httparse` and later replayed
//! onto a tunnel with the original header order and casing.

use crate::{parse_hostname, Prebuffered, MAX_HEADERS};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::trace;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("Request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Connection closed in the middle of a request head")]
    UnexpectedEof,
}

/// A parsed request line plus its raw header pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP version (`0` for HTTP/1.0, `1` for HTTP/1.1)
    pub version: u8,
    /// Header pairs in arrival order with their original casing
    pub headers: Vec<(String, Vec<u8>)>,
    /// Bytes the head occupied on the wire, including the blank line
    pub len: usize,
}

impl RequestHead {
    /// First header with the given name (case-insensitive), if it is valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
            .map(str::trim)
    }

    /// Canonical hostname from the `Host` header
    pub fn hostname(&self) -> Option<String> {
        self.header("host").and_then(parse_hostname)
    }

    /// Whether this is an HTTP upgrade (`Connection: upgrade` plus an `Upgrade` header)
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self
            .headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("connection"))
            .filter_map(|(_, value)| std::str::from_utf8(value).ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

        connection_upgrade && self.upgrade_protocol().is_some()
    }

    pub fn upgrade_protocol(&self) -> Option<&str> {
        self.header("upgrade").filter(|value| !value.is_empty())
    }

    /// Re-encode the head for replay over a raw socket
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize_request_head(&self.method, &self.path, self.version, &self.headers)
    }
}

/// Build `<METHOD> <PATH> HTTP/1.<minor>\r\n`, one `Name: value\r\n` line per
/// header in the given order, and the terminating blank line.
pub fn serialize_request_head(
    method: &str,
    path: &str,
    version: u8,
    headers: &[(String, Vec<u8>)],
) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{} {} HTTP/1.{}\r\n", method, path, version).as_bytes());
    for (name, value) in headers {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Buffer from `stream` until a full request head is available and parse it.
///
/// The head stays in the buffer; callers that take over the raw socket
/// discard `head.len` bytes themselves. Returns `Ok(None)` when the peer
/// closes before sending anything.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut Prebuffered<S>,
) -> Result<Option<RequestHead>, HeadError> {
    loop {
        if !stream.buffer().is_empty() {
            if let Some(head) = parse_request_head(stream.buffer())? {
                trace!("Parsed request head: {} {}", head.method, head.path);
                return Ok(Some(head));
            }
            if stream.is_full() {
                return Err(HeadError::TooLarge(stream.buffer().len()));
            }
        }

        if stream.buffer_more().await? == 0 {
            return if stream.buffer().is_empty() {
                Ok(None)
            } else {
                Err(HeadError::UnexpectedEof)
            };
        }
    }
}

fn parse_request_head(data: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data)? {
        httparse::Status::Complete(len) => Ok(Some(RequestHead {
            method: req.method.unwrap_or("GET").to_string(),
            path: req.path.unwrap_or("/").to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
            len,
        })),
        httparse::Status::Partial => Ok(None),
    }
}
