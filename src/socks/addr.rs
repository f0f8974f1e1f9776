//! SOCKS5 address codec
//!
//! Decodes the `ATYP | ADDR | PORT` block of a request and encodes the
//! IPv4 bound address carried by a CONNECT reply.

use super::consts::*;
use crate::error::Socks5Error;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Length of an encoded IPv4 address plus port
pub const ENCODED_IPV4_LEN: usize = 6;

/// Longest domain name the one-byte length prefix can describe
pub const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

/// Kind of address named in a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// 4-byte IPv4 address
    Ipv4,
    /// Length-prefixed domain name
    Domain,
    /// 16-byte IPv6 address
    Ipv6,
}

impl AddressKind {
    /// Parse an address type tag
    ///
    /// Every tag other than IPv4 and domain is read as a 16-byte IPv6 address.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            SOCKS5_ADDR_TYPE_IPV4 => AddressKind::Ipv4,
            SOCKS5_ADDR_TYPE_DOMAIN => AddressKind::Domain,
            _ => AddressKind::Ipv6,
        }
    }

    /// Address type tag for this kind
    pub fn tag(self) -> u8 {
        match self {
            AddressKind::Ipv4 => SOCKS5_ADDR_TYPE_IPV4,
            AddressKind::Domain => SOCKS5_ADDR_TYPE_DOMAIN,
            AddressKind::Ipv6 => SOCKS5_ADDR_TYPE_IPV6,
        }
    }
}

/// Target address decoded from a request
///
/// Immutable once parsed. The host is kept in its textual form: dotted
/// decimal for IPv4, the name for domains, and eight colon separated
/// groups of two zero-padded hex bytes for IPv6. Domain names also keep
/// the exact bytes the client sent, 1 to 255 of them, which is what gets
/// forwarded on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    kind: AddressKind,
    host: String,
    name: Bytes,
    port: u16,
}

impl ParsedAddress {
    /// Create an IPv4 address
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        ParsedAddress {
            kind: AddressKind::Ipv4,
            host: ip.to_string(),
            name: Bytes::new(),
            port,
        }
    }

    /// Create an IPv6 address
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        ParsedAddress {
            kind: AddressKind::Ipv6,
            host: render_ipv6(&ip.octets()),
            name: Bytes::new(),
            port,
        }
    }

    /// Create a domain address
    ///
    /// Fails for an empty name or one longer than [`MAX_DOMAIN_LEN`] bytes.
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self, Socks5Error> {
        let host = name.into();
        let name = Bytes::copy_from_slice(host.as_bytes());
        if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
            return Err(Socks5Error::MalformedAddress(format!(
                "domain name must be 1 to {} bytes, got {}",
                MAX_DOMAIN_LEN,
                name.len()
            )));
        }
        Ok(ParsedAddress {
            kind: AddressKind::Domain,
            host,
            name,
            port,
        })
    }

    /// Address kind
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Textual host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Domain name exactly as received, empty for IP addresses
    pub fn name_bytes(&self) -> &[u8] {
        &self.name
    }

    /// Serialize back into the `ATYP | ADDR | PORT` wire block
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.kind.tag()];

        match self.kind {
            AddressKind::Ipv4 => {
                let ip: Ipv4Addr = self.host.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
                bytes.extend_from_slice(&ip.octets());
            }
            AddressKind::Ipv6 => {
                let ip: Ipv6Addr = self.host.parse().unwrap_or(Ipv6Addr::UNSPECIFIED);
                bytes.extend_from_slice(&ip.octets());
            }
            AddressKind::Domain => {
                let name = &self.name[..self.name.len().min(MAX_DOMAIN_LEN)];
                bytes.push(name.len() as u8);
                bytes.extend_from_slice(name);
            }
        }

        bytes.extend_from_slice(&self.port.to_be_bytes());
        bytes
    }
}

impl fmt::Display for ParsedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressKind::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Number of bytes the address block starting at `offset` occupies
///
/// Returns `None` while `buf` is too short to tell (tag or domain length
/// byte not yet received).
pub fn address_len(buf: &[u8], offset: usize) -> Option<usize> {
    let tag = *buf.get(offset)?;
    match AddressKind::from_tag(tag) {
        AddressKind::Ipv4 => Some(1 + 4 + 2),
        AddressKind::Ipv6 => Some(1 + 16 + 2),
        AddressKind::Domain => buf.get(offset + 1).map(|len| 1 + 1 + *len as usize + 2),
    }
}

/// Decode an address block starting at `offset`
///
/// Returns the address and the number of bytes consumed, tag included.
pub fn decode(buf: &[u8], offset: usize) -> Result<(ParsedAddress, usize), Socks5Error> {
    let tag = *buf
        .get(offset)
        .ok_or_else(|| Socks5Error::MalformedAddress("missing address type".to_string()))?;
    let kind = AddressKind::from_tag(tag);

    let body = &buf[offset + 1..];
    let (host, name, addr_len) = match kind {
        AddressKind::Ipv4 => {
            let octets = take(body, 4, "IPv4")?;
            let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            (ip.to_string(), Bytes::new(), 4)
        }
        AddressKind::Domain => {
            let len = take(body, 1, "domain length")?[0] as usize;
            if len == 0 {
                return Err(Socks5Error::MalformedAddress(
                    "zero-length domain name".to_string(),
                ));
            }
            let name = take(&body[1..], len, "domain")?;
            (
                String::from_utf8_lossy(name).into_owned(),
                Bytes::copy_from_slice(name),
                1 + len,
            )
        }
        AddressKind::Ipv6 => (render_ipv6(take(body, 16, "IPv6")?), Bytes::new(), 16),
    };

    let port_bytes = take(&body[addr_len..], 2, "port")?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let addr = ParsedAddress {
        kind,
        host,
        name,
        port,
    };
    Ok((addr, 1 + addr_len + 2))
}

/// Encode a dotted-decimal IPv4 address and port for a CONNECT reply
pub fn encode(ip: &str, port: u16) -> Result<[u8; ENCODED_IPV4_LEN], Socks5Error> {
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| Socks5Error::MalformedAddress(format!("not an IPv4 address: {}", ip)))?;
    Ok(encode_ipv4(ip, port))
}

/// Encode a socket address for a CONNECT reply
///
/// Replies always carry an IPv4 address. IPv4-mapped IPv6 addresses are
/// unwrapped, any other IPv6 address becomes `0.0.0.0`.
pub fn encode_bound(addr: SocketAddr) -> [u8; ENCODED_IPV4_LEN] {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    encode_ipv4(ip, addr.port())
}

fn encode_ipv4(ip: Ipv4Addr, port: u16) -> [u8; ENCODED_IPV4_LEN] {
    let mut out = [0u8; ENCODED_IPV4_LEN];
    out[..4].copy_from_slice(&ip.octets());
    out[4..].copy_from_slice(&port.to_be_bytes());
    out
}

fn take<'a>(buf: &'a [u8], n: usize, what: &str) -> Result<&'a [u8], Socks5Error> {
    buf.get(..n).ok_or_else(|| {
        Socks5Error::MalformedAddress(format!(
            "{} truncated: need {} bytes, have {}",
            what,
            n,
            buf.len()
        ))
    })
}

fn render_ipv6(octets: &[u8]) -> String {
    octets
        .chunks(2)
        .map(|pair| pair.iter().map(|b| format!("{:02x}", b)).collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}
