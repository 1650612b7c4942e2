//! Client request-line parsing and the responses the proxy writes itself.

use crate::error::{ProxyError, Result};
use url::Url;

pub const RESPONSE_401_BLOCKED: &[u8] = b"HTTP/1.1 401 Unauthorized\r\n\r\nBlocked by proxy\r\n";
pub const RESPONSE_405: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
pub const RESPONSE_500: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
pub const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const RESPONSE_304_HEAD: &[u8] = b"HTTP/1.1 304 Not Modified\r\n\r\n";

const DEFAULT_CONNECT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Get,
    Head,
    Options,
    Post,
    /// Anything else; answered with 405.
    Unsupported,
}

impl Method {
    /// Method tokens are case-sensitive.
    pub fn parse(token: &str) -> Self {
        match token {
            "CONNECT" => Method::Connect,
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "POST" => Method::Post,
            _ => Method::Unsupported,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Unsupported => "UNSUPPORTED",
        }
    }
}

/// First line of a client request: `METHOD SP TARGET SP VERSION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// The line as received, without its terminator.
    pub raw: String,
    pub method: Method,
    pub method_token: String,
    pub target: String,
}

impl RequestLine {
    /// Only the first two whitespace-delimited tokens are required.
    pub fn parse(line: &str) -> Result<Self> {
        let raw = line.trim_end_matches(&['\r', '\n'][..]);
        let mut parts = raw.split_whitespace();

        let (Some(method_token), Some(target)) = (parts.next(), parts.next()) else {
            return Err(ProxyError::MalformedRequest(raw.to_string()));
        };

        Ok(Self {
            raw: raw.to_string(),
            method: Method::parse(method_token),
            method_token: method_token.to_string(),
            target: target.to_string(),
        })
    }

    /// Host the blocklist is checked against: the authority's host for
    /// CONNECT, the URL host component otherwise. The host is returned as
    /// sent, without case folding or IDNA conversion.
    pub fn target_host(&self) -> Result<String> {
        let authority = match self.method {
            Method::Connect => self.target.as_str(),
            _ => {
                let url = Url::parse(&self.target)
                    .map_err(|e| ProxyError::malformed_target(&self.target, e))?;
                if !url.has_host() {
                    return Err(ProxyError::malformed_target(&self.target, "URL has no host"));
                }
                url_authority(&self.target)
                    .ok_or_else(|| ProxyError::malformed_target(&self.target, "URL has no authority"))?
            }
        };

        let (host, _) = split_authority(authority);
        if host.is_empty() {
            return Err(ProxyError::malformed_target(&self.target, "empty host"));
        }
        Ok(host.to_string())
    }
}

/// The raw `host[:port]` of an absolute URL, userinfo removed.
fn url_authority(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    let end = rest
        .find(|c| matches!(c, '/' | '?' | '#'))
        .unwrap_or(rest.len());
    let authority = &rest[..end];
    Some(authority.rsplit_once('@').map_or(authority, |(_, host)| host))
}

/// Split `host:port` on the last colon, stripping IPv6 brackets.
fn split_authority(authority: &str) -> (&str, Option<&str>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let port = rest[end + 1..].strip_prefix(':');
            return (&rest[..end], port);
        }
    }

    match authority.rfind(':') {
        Some(idx) => (&authority[..idx], Some(&authority[idx + 1..])),
        None => (authority, None),
    }
}

/// Parse a CONNECT target into host and port. A missing port means 443.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port) = split_authority(authority);
    if host.is_empty() {
        return Err(ProxyError::malformed_target(authority, "empty host"));
    }

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|e| ProxyError::malformed_target(authority, format!("invalid port: {}", e)))?,
        None => DEFAULT_CONNECT_PORT,
    };

    Ok((host.to_string(), port))
}
