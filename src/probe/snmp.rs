//! Minimal SNMP v1/v2c GET over UDP.
//!
//! Only what discovery needs: a single varbind GetRequest and the matching
//! GetResponse, BER encoded by hand.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use super::ProbeError;

/// SNMPv2-MIB::sysDescr.0
pub const SYS_DESCR_OID: &str = "1.3.6.1.2.1.1.1.0";

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_GET_REQUEST: u8 = 0xA0;
const TAG_GET_RESPONSE: u8 = 0xA2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    V1,
    V2c,
}

impl SnmpVersion {
    /// Map a credential version string. Unset means v1.
    pub fn parse(version: Option<&str>) -> Result<Self, ProbeError> {
        match version.map(str::trim).unwrap_or("1") {
            "" | "1" => Ok(SnmpVersion::V1),
            "2" | "2c" => Ok(SnmpVersion::V2c),
            "3" => Err(ProbeError::Config("SNMPv3 is not supported".to_string())),
            other => Err(ProbeError::Config(format!("unknown SNMP version: {}", other))),
        }
    }

    fn wire(&self) -> i64 {
        match self {
            SnmpVersion::V1 => 0,
            SnmpVersion::V2c => 1,
        }
    }
}

/// Parse a dotted OID, leading dot allowed.
pub fn parse_oid(oid: &str) -> Result<Vec<u32>, ProbeError> {
    let arcs = oid
        .trim()
        .trim_start_matches('.')
        .split('.')
        .map(|arc| arc.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ProbeError::Config(format!("invalid OID: {}", oid)))?;
    if arcs.len() < 2 || arcs[0] > 2 {
        return Err(ProbeError::Config(format!("invalid OID: {}", oid)));
    }
    Ok(arcs)
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len.to_be_bytes().into_iter().skip_while(|b| *b == 0).collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend(bytes);
    }
    out.extend_from_slice(content);
    out
}

fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    tlv(TAG_INTEGER, &bytes[start..])
}

fn encode_oid(arcs: &[u32]) -> Vec<u8> {
    let mut content = Vec::new();
    let mut push_arc = |mut arc: u32| {
        let mut chunk = vec![(arc & 0x7F) as u8];
        arc >>= 7;
        while arc > 0 {
            chunk.push(0x80 | (arc & 0x7F) as u8);
            arc >>= 7;
        }
        content.extend(chunk.into_iter().rev());
    };
    push_arc(arcs[0] * 40 + arcs.get(1).copied().unwrap_or(0));
    for arc in arcs.iter().skip(2) {
        push_arc(*arc);
    }
    tlv(TAG_OID, &content)
}

/// Encode a GetRequest for a single OID.
pub fn encode_get_request(version: SnmpVersion, community: &str, request_id: i32, oid: &[u32]) -> Vec<u8> {
    let varbind = tlv(TAG_SEQUENCE, &[encode_oid(oid), tlv(TAG_NULL, &[])].concat());
    let varbinds = tlv(TAG_SEQUENCE, &varbind);
    let pdu = tlv(
        TAG_GET_REQUEST,
        &[
            encode_integer(request_id as i64),
            encode_integer(0),
            encode_integer(0),
            varbinds,
        ]
        .concat(),
    );
    tlv(
        TAG_SEQUENCE,
        &[
            encode_integer(version.wire()),
            tlv(TAG_OCTET_STRING, community.as_bytes()),
            pdu,
        ]
        .concat(),
    )
}

/// Cursor over BER elements.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn next(&mut self) -> Result<(u8, &'a [u8]), ProbeError> {
        let truncated = || ProbeError::Decode("truncated BER element".to_string());

        let (&tag, rest) = self.buf.split_first().ok_or_else(truncated)?;
        let (&first, mut rest) = rest.split_first().ok_or_else(truncated)?;

        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > 4 || rest.len() < count {
                return Err(ProbeError::Decode("bad BER length".to_string()));
            }
            let len = rest[..count].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
            rest = &rest[count..];
            len
        };

        if rest.len() < len {
            return Err(truncated());
        }
        let (content, tail) = rest.split_at(len);
        self.buf = tail;
        Ok((tag, content))
    }

    fn expect(&mut self, tag: u8) -> Result<&'a [u8], ProbeError> {
        let (found, content) = self.next()?;
        if found != tag {
            return Err(ProbeError::Decode(format!("expected tag {:#04x}, got {:#04x}", tag, found)));
        }
        Ok(content)
    }

    fn integer(&mut self) -> Result<i64, ProbeError> {
        Ok(decode_integer(self.expect(TAG_INTEGER)?))
    }
}

fn decode_integer(content: &[u8]) -> i64 {
    let negative = content.first().is_some_and(|b| b & 0x80 != 0);
    let init: i64 = if negative { -1 } else { 0 };
    content.iter().take(8).fold(init, |acc, b| (acc << 8) | *b as i64)
}

fn decode_oid(content: &[u8]) -> String {
    let mut arcs: Vec<u64> = Vec::new();
    let mut current: u64 = 0;
    for b in content {
        current = (current << 7) | (b & 0x7F) as u64;
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (current / 40).min(2);
                arcs.push(first);
                arcs.push(current - first * 40);
            } else {
                arcs.push(current);
            }
            current = 0;
        }
    }
    arcs.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(".")
}

fn decode_value(tag: u8, content: &[u8]) -> Result<String, ProbeError> {
    match tag {
        TAG_OCTET_STRING => Ok(String::from_utf8_lossy(content).trim_end_matches('\0').to_string()),
        TAG_INTEGER => Ok(decode_integer(content).to_string()),
        TAG_OID => Ok(decode_oid(content)),
        TAG_IP_ADDRESS if content.len() == 4 => {
            Ok(Ipv4Addr::new(content[0], content[1], content[2], content[3]).to_string())
        }
        // Counter32, Gauge32, TimeTicks
        0x41..=0x43 => Ok(content.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64).to_string()),
        TAG_NULL => Err(ProbeError::Decode("empty value".to_string())),
        0x80..=0x82 => Err(ProbeError::Decode("no such object".to_string())),
        other => Err(ProbeError::Decode(format!("unsupported value type {:#04x}", other))),
    }
}

/// Decode a GetResponse and return the first varbind as `(oid, value)`.
pub fn decode_get_response(buf: &[u8], request_id: i32) -> Result<(String, String), ProbeError> {
    let mut message = Reader::new(Reader::new(buf).expect(TAG_SEQUENCE)?);
    message.integer()?;
    message.expect(TAG_OCTET_STRING)?;

    let mut pdu = Reader::new(message.expect(TAG_GET_RESPONSE)?);
    let id = pdu.integer()?;
    if id != request_id as i64 {
        return Err(ProbeError::Decode(format!("request id mismatch: got {}, expected {}", id, request_id)));
    }
    let status = pdu.integer()?;
    if status != 0 {
        return Err(ProbeError::Decode(format!("agent returned error status {}", status)));
    }
    pdu.integer()?;

    let mut varbinds = Reader::new(pdu.expect(TAG_SEQUENCE)?);
    let mut varbind = Reader::new(varbinds.expect(TAG_SEQUENCE)?);
    let oid = decode_oid(varbind.expect(TAG_OID)?);
    let (tag, content) = varbind.next()?;

    Ok((oid, decode_value(tag, content)?))
}

/// GET one OID from an agent.
pub async fn snmp_get(
    ip: Ipv4Addr,
    port: u16,
    version: SnmpVersion,
    community: &str,
    oid: &str,
    timeout: Duration,
) -> Result<String, ProbeError> {
    let arcs = parse_oid(oid)?;
    let request_id = rand::random::<i32>() & 0x7FFF_FFFF;
    let packet = encode_get_request(version, community, request_id, &arcs);

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(SocketAddr::from((ip, port)))
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;
    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = vec![0u8; 65535];
    let n = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    let (_, value) = decode_get_response(&response[..n], request_id)?;
    Ok(value)
}
