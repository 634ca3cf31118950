//! HTTP/1.x request head sniffing.
//!
//! The sniffer reads from a [`PeekableConn`] until a complete request head
//! (request line, headers, blank line) is buffered, then parses it. Every
//! byte read stays retained in the connection, so whoever receives the
//! connection afterwards still sees the full request, body included.
//!
//! Bounds:
//! - timeout: 10s default
//! - max head size: 8192 bytes default
//! - max header count: 64 default

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::time::timeout;
use tracing::debug;

use super::peek::{PeekableConn, DEFAULT_FILL_CHUNK};

/// Default time allowed for a complete request head to arrive.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound on the size of a request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 8192;

/// Default upper bound on the number of headers.
pub const DEFAULT_MAX_HEADERS: usize = 64;

/// Why a request head could not be sniffed.
///
/// Every variant is answered with the fixed 400 response.
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("connection closed after {0} bytes, before the request head was complete")]
    Incomplete(usize),

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("timed out waiting for request head")]
    Timeout,

    #[error("Host header is not valid UTF-8")]
    InvalidHost,

    #[error("more than one Host header")]
    DuplicateHost,

    #[error("I/O error while reading request head: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for request head sniffing.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Maximum time to wait for a complete head.
    pub timeout: Duration,
    /// Maximum head size in bytes.
    pub max_head_bytes: usize,
    /// Maximum number of headers.
    pub max_headers: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_headers: DEFAULT_MAX_HEADERS,
        }
    }
}

/// A parsed HTTP/1.x request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as sent (origin-form, absolute-form, ...).
    pub target: String,
    /// Minor HTTP version (`0` or `1`).
    pub version: u8,
    /// Header values are decoded lossily; obs-text bytes become U+FFFD.
    pub headers: Vec<(String, String)>,
    /// Host the request is addressed to, port included if present.
    ///
    /// Taken from an absolute-form target when there is one, otherwise
    /// from the Host header. Empty when neither exists.
    pub host: String,
    /// Length in bytes of the head, blank line included.
    pub head_len: usize,
}

impl RequestHead {
    /// Path component of the target, without query.
    pub fn path(&self) -> &str {
        let target = match self.target.find("://") {
            Some(idx) => {
                let rest = &self.target[idx + 3..];
                match rest.find('/') {
                    Some(slash) => &rest[slash..],
                    None => "/",
                }
            }
            None => self.target.as_str(),
        };
        let end = target.find(['?', '#']).unwrap_or(target.len());
        &target[..end]
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request head sniffer.
#[derive(Debug, Clone, Default)]
pub struct HeadSniffer {
    config: SniffConfig,
}

impl HeadSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SniffConfig {
        &self.config
    }

    /// Sniff the request head from `conn`.
    ///
    /// On success the connection cursor is untouched: the head and any
    /// bytes read past it are still retained for the next reader.
    pub async fn sniff<S: AsyncRead + Unpin>(
        &self,
        conn: &mut PeekableConn<S>,
    ) -> Result<RequestHead, SniffError> {
        match timeout(self.config.timeout, self.read_head(conn)).await {
            Ok(result) => result,
            Err(_) => Err(SniffError::Timeout),
        }
    }

    async fn read_head<S: AsyncRead + Unpin>(
        &self,
        conn: &mut PeekableConn<S>,
    ) -> Result<RequestHead, SniffError> {
        loop {
            if let Some(head) = self.parse(conn.buffered())? {
                debug!(head_len = head.head_len, method = %head.method, "Request head parsed");
                return Ok(head);
            }

            let buffered = conn.buffered().len();
            if buffered >= self.config.max_head_bytes {
                return Err(SniffError::TooLarge(self.config.max_head_bytes));
            }

            let want = (self.config.max_head_bytes - buffered).min(DEFAULT_FILL_CHUNK);
            if conn.fill(want).await? == 0 {
                return Err(SniffError::Incomplete(buffered));
            }
        }
    }

    /// Parse a head out of `data`; `Ok(None)` means more bytes are needed.
    fn parse(&self, data: &[u8]) -> Result<Option<RequestHead>, SniffError> {
        let mut headers = vec![httparse::EMPTY_HEADER; self.config.max_headers];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(data)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };
        if head_len > self.config.max_head_bytes {
            return Err(SniffError::TooLarge(self.config.max_head_bytes));
        }

        // A complete parse always fills method, path and version.
        let method = req.method.unwrap_or_default().to_string();
        let target = req.path.unwrap_or_default().to_string();
        let version = req.version.unwrap_or_default();

        let mut parsed = Vec::with_capacity(req.headers.len());
        let mut host_header = None;
        for h in req.headers.iter() {
            // Only Host feeds routing, so only Host has to be text.
            if h.name.eq_ignore_ascii_case("host") {
                if host_header.is_some() {
                    return Err(SniffError::DuplicateHost);
                }
                let value = std::str::from_utf8(h.value).map_err(|_| SniffError::InvalidHost)?;
                host_header = Some(value.trim().to_string());
            }
            let value = String::from_utf8_lossy(h.value);
            parsed.push((h.name.to_string(), value.trim().to_string()));
        }

        let host = absolute_form_host(&target)
            .or(host_header)
            .unwrap_or_default();

        Ok(Some(RequestHead {
            method,
            target,
            version,
            headers: parsed,
            host,
            head_len,
        }))
    }
}

/// Authority of an absolute-form request target (`http://host:port/path`).
fn absolute_form_host(target: &str) -> Option<String> {
    let (scheme, rest) = target.split_once("://")?;
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return None;
    }
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();
    if authority.is_empty() {
        None
    } else {
        Some(authority.to_string())
    }
}
