//! CONNECT tunnelling.
//!
//! After the target accepts, the proxy answers `200 Connection Established`
//! and copies bytes in both directions until each side has reached
//! end-of-stream or failed. Tunnelled bytes are never inspected.

use crate::error::Result;
use crate::request::{parse_authority, RESPONSE_200_CONNECT};
use crate::server::ServerContext;
use crate::stats::Stats;
use std::io::ErrorKind;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Bytes copied in each direction of a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// Open a tunnel to `authority` (`host:port`) and relay until both
/// directions are done.
///
/// # Errors
/// * `MalformedTarget` - unparseable authority
/// * `OriginUnreachable` / `OriginTimeout` - the target refused or never answered
///
/// Failures after the 200 has been written are logged per direction and do
/// not surface as errors.
pub async fn relay(
    ctx: &ServerContext,
    client: &mut BufReader<TcpStream>,
    authority: &str,
) -> Result<RelayStats> {
    let (host, port) = parse_authority(authority)?;
    let mut target = ctx.connect(&host, port).await?;
    let _ = target.set_nodelay(true);

    client.get_mut().write_all(RESPONSE_200_CONNECT).await?;
    client.get_mut().flush().await?;

    // Anything the client pipelined behind the CONNECT head belongs to the target.
    let pending = client.buffer().to_vec();
    client.consume(pending.len());

    let buffer_size = ctx.config.relay_buffer_size;
    let (client_read, client_write) = client.get_mut().split();
    let (target_read, target_write) = target.split();

    let (up, down) = tokio::join!(
        pump(client_read, target_write, pending, buffer_size, "client to target", authority),
        pump(target_read, client_write, Vec::new(), buffer_size, "target to client", authority),
    );

    let relayed = RelayStats {
        client_to_target: up,
        target_to_client: down,
    };

    Stats::incr(&ctx.stats.tunnels);
    Stats::add(&ctx.stats.bytes_out, up);
    Stats::add(&ctx.stats.bytes_in, down);

    Ok(relayed)
}

/// Copy `reader` into `writer` until EOF or the first error, then half-close
/// the writer so the peer sees end-of-stream.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    initial: Vec<u8>,
    buffer_size: usize,
    direction: &'static str,
    authority: &str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;

    if !initial.is_empty() {
        if let Err(e) = writer.write_all(&initial).await {
            log_relay_error(direction, authority, &e);
            return copied;
        }
        copied += initial.len() as u64;
    }

    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_relay_error(direction, authority, &e);
                return copied;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            log_relay_error(direction, authority, &e);
            return copied;
        }
        copied += n as u64;
    }

    let _ = writer.shutdown().await;
    copied
}

fn log_relay_error(direction: &str, authority: &str, e: &std::io::Error) {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
            debug!(authority, direction, error = %e, "Relay direction closed")
        }
        _ => warn!(authority, direction, error = %e, "Relay direction failed"),
    }
}
