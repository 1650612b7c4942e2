//! Per-connection request handling.
//!
//! # Connection Flow
//!
//! ```text
//! read request line ---- empty / EOF --> close silently
//!         |
//!         v
//! parse METHOD TARGET -- malformed ----> close silently
//!         |
//!         v
//! record line (non-CONNECT only)
//!         |
//!         v
//! target host blocked? -- yes --> 401 "Blocked by proxy", drain head
//!         |
//!         v
//! consume request head
//!         |
//!         v
//! CONNECT --> tunnel::relay
//! GET / HEAD / OPTIONS / POST --> forward::forward
//! other --> 405
//! ```
//!
//! Any failure after the request line parsed, other than the blocked path,
//! is answered with a 500 when the client socket still accepts writes.

use crate::error::{ProxyError, Result};
use crate::forward::{self, ForwardOutcome};
use crate::request::{Method, RequestLine, RESPONSE_401_BLOCKED, RESPONSE_405, RESPONSE_500};
use crate::server::ServerContext;
use crate::stats::Stats;
use crate::tunnel;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long a blocked client may keep sending its head after the 401.
const BLOCKED_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Serve a single accepted client connection to completion.
///
/// # Errors
/// * `MalformedRequest` - the request line or head could not be read; no
///   response was written
/// * any error that was answered with a 500
pub async fn handle_connection(ctx: &ServerContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut client = BufReader::new(stream);

    let Some(line) = read_line(&mut client, ctx.config.max_head_size).await? else {
        debug!(%peer, "Connection closed without a request");
        return Ok(());
    };
    info!("Request: {}", line);

    let request = RequestLine::parse(&line)?;

    match serve(ctx, &request, &mut client, peer).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                %peer,
                method = %request.method_token,
                url = %request.target,
                error = %e,
                "Request failed"
            );
            if let Err(write_err) = client.get_mut().write_all(RESPONSE_500).await {
                debug!(%peer, error = %write_err, "Could not deliver 500");
            }
            Err(e)
        }
    }
}

async fn serve(
    ctx: &ServerContext,
    request: &RequestLine,
    client: &mut BufReader<TcpStream>,
    peer: SocketAddr,
) -> Result<()> {
    if request.method != Method::Connect {
        ctx.log.record(request.raw.as_str());
    }

    if is_blocked(ctx, request) {
        Stats::incr(&ctx.stats.blocked);
        warn!(%peer, url = %request.target, "Blocked by proxy");
        reject_blocked(client, ctx.config.max_head_size, peer).await;
        return Ok(());
    }

    skip_request_headers(client, ctx.config.max_head_size).await?;

    match request.method {
        Method::Connect => {
            let relayed = tunnel::relay(ctx, client, &request.target).await?;
            debug!(
                %peer,
                authority = %request.target,
                sent = relayed.client_to_target,
                received = relayed.target_to_client,
                "Tunnel closed"
            );
        }
        Method::Get | Method::Head | Method::Options => {
            let outcome = forward::forward(ctx, request.method, &request.target, &[], client.get_mut()).await?;
            log_outcome(request, outcome);
        }
        Method::Post => {
            let body = read_available_body(client)?;
            let outcome = forward::forward(ctx, request.method, &request.target, &body, client.get_mut()).await?;
            log_outcome(request, outcome);
        }
        Method::Unsupported => {
            debug!(%peer, method = %request.method_token, "Method not allowed");
            client.get_mut().write_all(RESPONSE_405).await?;
        }
    }

    Ok(())
}

/// Unparseable targets are not blocked.
fn is_blocked(ctx: &ServerContext, request: &RequestLine) -> bool {
    match request.target_host() {
        Ok(host) => ctx.blocklist.contains(&host),
        Err(e) => {
            warn!(url = %request.target, error = %e, "Malformed target, skipping blocklist");
            false
        }
    }
}

/// Answer 401 right after the request line, then half-close and drain the
/// rest of the head so closing the socket does not reset the response.
async fn reject_blocked(client: &mut BufReader<TcpStream>, limit: usize, peer: SocketAddr) {
    let stream = client.get_mut();
    if let Err(e) = stream.write_all(RESPONSE_401_BLOCKED).await {
        debug!(%peer, error = %e, "Could not deliver 401");
        return;
    }
    let _ = stream.shutdown().await;
    let _ = timeout(BLOCKED_DRAIN_TIMEOUT, skip_request_headers(client, limit)).await;
}

fn log_outcome(request: &RequestLine, outcome: ForwardOutcome) {
    match outcome {
        ForwardOutcome::Forwarded { status } => {
            debug!(method = %request.method_token, url = %request.target, status, "Forwarded")
        }
        ForwardOutcome::Revalidated => {
            debug!(method = %request.method_token, url = %request.target, "Served from cache")
        }
        ForwardOutcome::Truncated => {
            debug!(method = %request.method_token, url = %request.target, "Response truncated")
        }
    }
}

/// Read one line without its terminator. `None` means the peer sent nothing
/// but a blank line or closed the stream.
async fn read_line(client: &mut BufReader<TcpStream>, limit: usize) -> Result<Option<String>> {
    let mut line = String::new();
    let n = match (&mut *client).take(limit as u64).read_line(&mut line).await {
        Ok(n) => n,
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            return Err(ProxyError::MalformedRequest("request line is not UTF-8".into()));
        }
        Err(e) => return Err(e.into()),
    };

    if n == limit && !line.ends_with('\n') {
        return Err(ProxyError::MalformedRequest("request line too long".into()));
    }

    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(line.to_string()))
}

/// Consume the rest of the request head. Client headers are not forwarded.
async fn skip_request_headers(client: &mut BufReader<TcpStream>, limit: usize) -> Result<()> {
    let mut consumed = 0;
    loop {
        let mut line = Vec::new();
        let n = (&mut *client)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        consumed += n;

        if n == 0 || line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
        if consumed > limit {
            return Err(ProxyError::MalformedRequest("request head too large".into()));
        }
    }
}

/// The request body as far as it has already arrived: whatever is buffered
/// plus what the socket yields without waiting.
fn read_available_body(client: &mut BufReader<TcpStream>) -> Result<Vec<u8>> {
    let mut body = client.buffer().to_vec();
    client.consume(body.len());

    let stream = client.get_ref();
    let mut buf = [0u8; 4096];
    loop {
        match stream.try_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(body)
}
