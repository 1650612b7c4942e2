//! Plain HTTP forwarding with conditional-GET caching.
//!
//! # Flow
//!
//! ```text
//! GET url
//!   |
//!   +-- cached? --> add If-Modified-Since: <validator>
//!   |
//!   v
//! origin status
//!   |
//!   +-- 304 and cached --> 304 Not Modified + cached body
//!   |
//!   +-- otherwise ------> status line, origin headers, streamed body
//!                           |
//!                           +-- 200 with Last-Modified --> store in cache
//! ```
//!
//! HEAD, OPTIONS and POST take the same response path but never read or
//! write the cache.

use crate::cache::CacheEntry;
use crate::error::{ProxyError, Result};
use crate::request::{Method, RESPONSE_304_HEAD};
use crate::server::ServerContext;
use crate::stats::Stats;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use url::{Host, Position, Url};

const MAX_RESPONSE_HEADERS: usize = 128;
const READ_CHUNK_SIZE: usize = 64 * 1024;
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// How a forwarded request ended once the client started receiving a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The origin response was relayed completely.
    Forwarded { status: u16 },
    /// The origin answered 304 and the cached body was served.
    Revalidated,
    /// The client already had part of the response when the exchange broke.
    Truncated,
}

/// Parsed origin status line and headers, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ResponseHead {
    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn header_str(&self, name: &str) -> Option<String> {
        self.header(name)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
    }

    /// Status line and headers as sent to the client.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    fn body_framing(&self, method: Method) -> BodyFraming {
        let no_body = (100..200).contains(&self.status) || self.status == 204 || self.status == 304;
        if method == Method::Head || no_body {
            return BodyFraming::Empty;
        }
        if self.header("transfer-encoding").is_some() {
            return BodyFraming::UntilClose;
        }
        match self
            .header_str("content-length")
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(u64),
    /// Read until the origin closes; requests are sent with `Connection: close`.
    UntilClose,
}

/// Try to parse a complete response head from `buf`. Returns the head and
/// its length in bytes, or `None` if more input is needed.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::InvalidResponse(e.to_string())),
    };

    let status = response
        .code
        .ok_or_else(|| ProxyError::InvalidResponse("missing status code".into()))?;

    let head = ResponseHead {
        status,
        reason: response.reason.unwrap_or_default().to_string(),
        headers: response
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    };

    Ok(Some((head, len)))
}

/// Read from `origin` until a full response head is buffered. Returns the
/// head and any body bytes that arrived with it.
async fn read_response_head<R>(origin: &mut R, max_head_size: usize) -> Result<(ResponseHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = origin.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::InvalidResponse(
                "origin closed before sending a response head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, len)) = parse_response_head(&buf)? {
            return Ok((head, buf.split_off(len)));
        }
        if buf.len() > max_head_size {
            return Err(ProxyError::InvalidResponse("response head too large".into()));
        }
    }
}

/// Origin coordinates derived from an absolute `http://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OriginTarget {
    connect_host: String,
    port: u16,
    authority: String,
    path_and_query: String,
}

impl OriginTarget {
    fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| ProxyError::malformed_target(raw, e))?;
        if url.scheme() != "http" {
            return Err(ProxyError::UnsupportedScheme(url.scheme().to_string()));
        }

        let connect_host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(a)) => a.to_string(),
            Some(Host::Ipv6(a)) => a.to_string(),
            None => return Err(ProxyError::malformed_target(raw, "URL has no host")),
        };

        Ok(Self {
            connect_host,
            port: url.port_or_known_default().unwrap_or(80),
            authority: url[Position::BeforeHost..Position::AfterPort].to_string(),
            path_and_query: url[Position::BeforePath..Position::AfterQuery].to_string(),
        })
    }

    fn request_head(&self, method: Method, validator: Option<&str>, body_len: Option<usize>) -> String {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: close\r\n",
            method.as_str(),
            self.path_and_query,
            self.authority,
            USER_AGENT
        );
        if let Some(validator) = validator {
            head.push_str(&format!("If-Modified-Since: {}\r\n", validator));
        }
        if let Some(len) = body_len {
            head.push_str(&format!("Content-Length: {}\r\n", len));
        }
        head.push_str("\r\n");
        head
    }
}

/// Execute `method` against the origin of `url` and relay the response to
/// `client`.
///
/// `body` is sent as the request body for POST and ignored otherwise.
///
/// # Errors
/// Returned only while nothing has been written to `client`, so the caller
/// can still answer with a 500. Later failures yield
/// [`ForwardOutcome::Truncated`].
pub async fn forward<W>(
    ctx: &ServerContext,
    method: Method,
    url: &str,
    body: &[u8],
    client: &mut W,
) -> Result<ForwardOutcome>
where
    W: AsyncWrite + Unpin,
{
    let target = OriginTarget::from_url(url)?;

    let cached = if method == Method::Get {
        let entry = ctx.cache.get(url);
        match &entry {
            Some(_) => info!("Cache hit for URL: {}", url),
            None => debug!("Cache miss for URL: {}", url),
        }
        entry
    } else {
        None
    };

    let mut origin = ctx.connect(&target.connect_host, target.port).await?;

    let body_len = (method == Method::Post).then_some(body.len());
    let head = target.request_head(
        method,
        cached.as_ref().map(|e| e.last_modified.as_str()),
        body_len,
    );
    origin.write_all(head.as_bytes()).await?;
    if body_len.is_some() && !body.is_empty() {
        origin.write_all(body).await?;
    }
    origin.flush().await?;

    let (response, leftover) = read_response_head(&mut origin, ctx.config.max_head_size).await?;
    debug!(method = method.as_str(), url, status = response.status, "Origin responded");

    if response.status == 304 {
        if let Some(entry) = cached {
            Stats::incr(&ctx.stats.cache_hits);
            return Ok(serve_cached(client, &entry, url).await);
        }
    }

    if let Err(e) = client.write_all(&response.encode()).await {
        debug!(url, error = %e, "Client went away before response headers");
        return Ok(ForwardOutcome::Truncated);
    }

    let validator = if method == Method::Get && response.status == 200 {
        response.header_str("last-modified")
    } else {
        None
    };

    let framing = response.body_framing(method);
    let streamed = stream_body(
        &mut origin,
        client,
        framing,
        leftover,
        validator.is_some(),
    )
    .await;
    drop(origin);

    let (relayed, buffered) = match streamed {
        Ok(done) => done,
        Err(e) => {
            warn!(method = method.as_str(), url, error = %e, "Response body truncated");
            return Ok(ForwardOutcome::Truncated);
        }
    };
    Stats::add(&ctx.stats.bytes_in, relayed);

    if let (Some(last_modified), Some(body)) = (validator, buffered) {
        let line = format!("Cached URL: {} with Last-Modified: {}", url, last_modified);
        ctx.cache.put(url, CacheEntry::new(body, last_modified));
        Stats::incr(&ctx.stats.cache_stores);
        info!("{}", line);
        ctx.log.record(line);
    }

    Ok(ForwardOutcome::Forwarded {
        status: response.status,
    })
}

async fn serve_cached<W>(client: &mut W, entry: &CacheEntry, url: &str) -> ForwardOutcome
where
    W: AsyncWrite + Unpin,
{
    let written: std::io::Result<()> = async {
        client.write_all(RESPONSE_304_HEAD).await?;
        client.write_all(&entry.body).await?;
        client.flush().await
    }
    .await;

    match written {
        Ok(()) => {
            debug!(url, bytes = entry.body.len(), "Served cached body for 304");
            ForwardOutcome::Revalidated
        }
        Err(e) => {
            debug!(url, error = %e, "Client went away during cached response");
            ForwardOutcome::Truncated
        }
    }
}

/// Relay the origin body to the client, keeping a copy when `keep` is set.
/// Returns the relayed byte count and the copy. A body that ends before its
/// declared length is an error.
async fn stream_body<R, W>(
    origin: &mut R,
    client: &mut W,
    framing: BodyFraming,
    leftover: Vec<u8>,
    keep: bool,
) -> std::io::Result<(u64, Option<Bytes>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = match framing {
        BodyFraming::Empty => {
            client.flush().await?;
            return Ok((0, keep.then(Bytes::new)));
        }
        BodyFraming::Length(len) => Some(len),
        BodyFraming::UntilClose => None,
    };

    let mut kept = Vec::new();
    let mut relayed = 0u64;

    let first = match remaining {
        Some(len) => &leftover[..leftover.len().min(len as usize)],
        None => &leftover[..],
    };
    if !first.is_empty() {
        client.write_all(first).await?;
        if keep {
            kept.extend_from_slice(first);
        }
        relayed += first.len() as u64;
        if let Some(r) = remaining.as_mut() {
            *r -= first.len() as u64;
        }
    }

    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    while remaining != Some(0) {
        let want = match remaining {
            Some(r) => chunk.len().min(r as usize),
            None => chunk.len(),
        };
        let n = origin.read(&mut chunk[..want]).await?;
        if n == 0 {
            if remaining.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "origin closed before the declared content length",
                ));
            }
            break;
        }
        client.write_all(&chunk[..n]).await?;
        if keep {
            kept.extend_from_slice(&chunk[..n]);
        }
        relayed += n as u64;
        if let Some(r) = remaining.as_mut() {
            *r -= n as u64;
        }
    }

    client.flush().await?;
    Ok((relayed, keep.then(|| Bytes::from(kept))))
}
