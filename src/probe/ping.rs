//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! The native path runs a blocking socket in spawn_blocking.

use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier and sequence for one echo request, unique across workers.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn open_icmp_socket() -> std::io::Result<Socket> {
    // RAW needs CAP_NET_RAW, DGRAM works unprivileged where ping_group_range allows it
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .or_else(|_| Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)))
}

fn detect_icmp_capability() -> IcmpCapability {
    if open_icmp_socket().is_ok() {
        tracing::info!("Ping: using native ICMP sockets");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Send one echo request to `ip` and return the round trip time.
pub async fn ping(ip: Ipv4Addr, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let result = tokio::task::spawn_blocking(move || blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Network(msg)) if msg.contains("Permission") || msg.contains("not permitted") => {
                tracing::warn!("Native ping refused for {}, falling back to command: {}", ip, msg);
            }
            other => return other,
        }
    }

    ping_command(ip, timeout).await
}

fn blocking_ping(ip: Ipv4Addr, timeout: Duration) -> Result<Duration, ProbeError> {
    let socket = open_icmp_socket()
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(IpAddr::V4(ip), 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_echo_reply(buf, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Whether `buf` is the reply to our request. RAW sockets include the IP header.
fn is_echo_reply(buf: &[u8], identifier: u16, sequence: u16) -> bool {
    let offset = match buf.first() {
        Some(b) if b >> 4 == 4 => ((b & 0x0f) as usize) * 4,
        Some(_) => 0,
        None => return false,
    };
    let Some(icmp) = buf.get(offset..offset + 8) else {
        return false;
    };
    // DGRAM sockets rewrite the identifier, so only the sequence is reliable there
    let id_ok = offset == 0 || u16::from_be_bytes([icmp[4], icmp[5]]) == identifier;
    icmp[0] == 0 && id_ok && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// ICMP Echo Request (type 8, code 0) with a 56 byte payload.
fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 8;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

async fn ping_command(ip: Ipv4Addr, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), &ip.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        // ping exits 1 when nothing answered
        if output.status.code() == Some(1) || stdout.contains("100% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout)));
    }

    parse_ping_output(&stdout)
}

/// Extract the round trip time from `ping` output.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/(?P<val>[0-9.]+)/").unwrap()
    });

    per_packet
        .captures(output)
        .or_else(|| summary.captures(output))
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verifies() {
        let packet = build_echo_request(0x1234, 7);
        // A packet carrying its checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
    }

    #[test]
    fn test_echo_reply_matching() {
        let mut reply = build_echo_request(0x1234, 9);
        reply[0] = 0;
        assert!(is_echo_reply(&reply, 0x1234, 9));
        assert!(!is_echo_reply(&reply, 0x1234, 10));

        let mut with_ip_header = vec![0x45u8];
        with_ip_header.extend_from_slice(&[0u8; 19]);
        with_ip_header.extend_from_slice(&reply);
        assert!(is_echo_reply(&with_ip_header, 0x1234, 9));
        assert!(!is_echo_reply(&with_ip_header, 0x4321, 9));

        assert!(!is_echo_reply(&[], 0, 0));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=12.345 ms";
        let rtt = parse_ping_output(output).unwrap();
        assert_eq!(rtt.as_micros(), 12_345);
    }

    #[test]
    fn test_parse_ping_output_summary() {
        let output = r#"PING 10.0.0.1 (10.0.0.1): 56 data bytes

--- 10.0.0.1 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let rtt = parse_ping_output(output).unwrap();
        assert_eq!(rtt.as_micros(), 17_906);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(parse_ping_output("no answer"), Err(ProbeError::Command(_))));
    }
}
