//! SOCKS5 protocol constants
//!
//! Defines the constants used by the CONNECT-only SOCKS5 subset.

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;

// Commands
/// TCP CONNECT command
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
/// TCP BIND command (rejected)
pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
/// UDP ASSOCIATE command (rejected)
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types
/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

// Reply codes
/// Succeeded
pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;

// Reserved byte
/// Reserved byte value (always 0x00)
pub const SOCKS5_RESERVED: u8 = 0x00;

/// Offset of the address type tag inside a request
pub const SOCKS5_REQUEST_ADDR_OFFSET: usize = 3;

// Buffer sizes
/// Default buffer size for data transfer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Human label for a request command byte
pub fn command_label(cmd: u8) -> &'static str {
    match cmd {
        SOCKS5_CMD_TCP_CONNECT => "connect",
        SOCKS5_CMD_TCP_BIND => "bind",
        SOCKS5_CMD_UDP_ASSOCIATE => "udp",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks5_version() {
        assert_eq!(SOCKS5_VERSION, 5);
    }

    #[test]
    fn test_address_types() {
        assert_eq!(SOCKS5_ADDR_TYPE_IPV4, 1);
        assert_eq!(SOCKS5_ADDR_TYPE_DOMAIN, 3);
        assert_eq!(SOCKS5_ADDR_TYPE_IPV6, 4);
    }

    #[test]
    fn test_command_label() {
        assert_eq!(command_label(1), "connect");
        assert_eq!(command_label(2), "bind");
        assert_eq!(command_label(3), "udp");
        assert_eq!(command_label(0x99), "unknown");
        assert_eq!(command_label(0), "unknown");
    }
}
