//! Socket helpers shared by both clients.

use natter_core::{NatterError, NatterResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Dial the broker within `limit`.
pub async fn connect_broker(addr: &str, limit: Duration) -> NatterResult<TcpStream> {
    let stream = match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(NatterError::Transport(format!(
                "cannot connect to broker {addr}: {e}"
            )))
        }
        Err(_) => {
            return Err(NatterError::Transport(format!(
                "timed out connecting to broker {addr}"
            )))
        }
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Dial a forwarding target within `limit`, mapping failures to `DialFailed`.
pub async fn dial_target(addr: &str, limit: Duration) -> NatterResult<TcpStream> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => {
            let _ = s.set_nodelay(true);
            Ok(s)
        }
        Ok(Err(e)) => Err(NatterError::DialFailed(format!("{addr}: {e}"))),
        Err(_) => Err(NatterError::DialFailed(format!("{addr}: connect timed out"))),
    }
}

/// Split a target address into host and port. An empty host means
/// localhost, so `:22` is `127.0.0.1:22`.
pub fn parse_target(addr: &str) -> Result<(String, u16), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in target address: {addr:?}"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port in target address: {addr:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok((host.to_string(), port))
}

/// `host:port` form suitable for `TcpStream::connect`.
pub fn join_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
