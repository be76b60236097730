//! TCP connect probe for remote management ports.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::ProbeError;

/// Open and close a TCP connection, returning the time to connect.
pub async fn tcp_connect(ip: Ipv4Addr, port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
    let start = Instant::now();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::from((ip, port))))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("connect to {}:{} failed: {}", ip, port, e)))?;
    let elapsed = start.elapsed();
    drop(stream);
    Ok(elapsed)
}
