//! Proxy-protocol v1/v2 pre-peel.
//!
//! Before a client's JSON-RPC stream begins, a load balancer may prefix
//! the connection with a proxy-protocol header carrying the real source
//! address. `peek` inspects buffered bytes without consuming them and
//! reports how many to discard once delivered.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const V2_MAGIC: &[u8; 12] = b"\r\n\r\n\0\r\nQUIT\n";
const V1_MAX_LINE: usize = 107;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyPeek {
    /// A proxy header is (or will be) present.
    pub pending: bool,
    /// The header parsed to a usable source address.
    pub parsed: bool,
    /// Bytes to consume from the stream before JSON-RPC begins.
    pub discard: usize,
    pub source: Option<(IpAddr, u16)>,
}

/// Inspect the first buffered bytes of a connection for a proxy-protocol
/// header. Never consumes; the caller discards `discard` bytes when that
/// many have arrived.
pub fn peek(buf: &[u8]) -> ProxyPeek {
    if buf.len() >= V2_MAGIC.len() && &buf[..V2_MAGIC.len()] == V2_MAGIC {
        return peek_v2(buf);
    }
    if buf.len() >= 6 && &buf[..6] == b"PROXY " {
        return peek_v1(buf);
    }
    // Short prefixes of either signature may still grow into a header.
    if buf.len() < V2_MAGIC.len() && V2_MAGIC.starts_with(buf) && !buf.is_empty() {
        return ProxyPeek {
            pending: true,
            ..Default::default()
        };
    }
    if buf.len() < 6 && b"PROXY ".starts_with(buf) && !buf.is_empty() {
        return ProxyPeek {
            pending: true,
            ..Default::default()
        };
    }
    ProxyPeek::default()
}

fn peek_v2(buf: &[u8]) -> ProxyPeek {
    if buf.len() < 16 {
        return ProxyPeek {
            pending: true,
            ..Default::default()
        };
    }
    let ver_cmd = buf[12];
    let fam_proto = buf[13];
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let total = 16 + len;

    if buf.len() < total {
        return ProxyPeek {
            pending: true,
            discard: total,
            ..Default::default()
        };
    }

    // Only PROXY command (0x21) carries an address; LOCAL (0x20) and
    // unknown families are discarded unparsed.
    let payload = &buf[16..total];
    let source = if ver_cmd == 0x21 {
        match fam_proto >> 4 {
            // AF_INET
            0x1 if payload.len() >= 12 => {
                let src = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
                let port = u16::from_be_bytes([payload[8], payload[9]]);
                Some((IpAddr::V4(src), port))
            }
            // AF_INET6
            0x2 if payload.len() >= 36 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[0..16]);
                let port = u16::from_be_bytes([payload[32], payload[33]]);
                Some((IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        }
    } else {
        None
    };

    ProxyPeek {
        pending: true,
        parsed: source.is_some(),
        discard: total,
        source,
    }
}

fn peek_v1(buf: &[u8]) -> ProxyPeek {
    let search = &buf[..buf.len().min(V1_MAX_LINE)];
    let Some(crlf) = search.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_MAX_LINE {
            // Oversized header without CRLF is not a proxy line at all.
            return ProxyPeek::default();
        }
        return ProxyPeek {
            pending: true,
            ..Default::default()
        };
    };
    let total = crlf + 2;
    let line = match std::str::from_utf8(&buf[..crlf]) {
        Ok(s) => s,
        Err(_) => {
            return ProxyPeek {
                pending: true,
                parsed: false,
                discard: total,
                source: None,
            }
        }
    };

    // "PROXY TCP4 srcip dstip srcport dstport" or "PROXY UNKNOWN ..."
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    let source = if fields.len() >= 6 && (fields[1] == "TCP4" || fields[1] == "TCP6") {
        match (fields[2].parse::<IpAddr>(), fields[4].parse::<u16>()) {
            (Ok(ip), Ok(port)) => Some((ip, port)),
            _ => None,
        }
    } else {
        None
    };

    ProxyPeek {
        pending: true,
        parsed: source.is_some(),
        discard: total,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_tcp4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(V2_MAGIC);
        buf.push(0x21); // v2, PROXY
        buf.push(0x11); // TCP over IPv4
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&dst);
        buf.extend_from_slice(&sport.to_be_bytes());
        buf.extend_from_slice(&dport.to_be_bytes());
        buf
    }

    #[test]
    fn v2_tcp4_parses() {
        let buf = v2_tcp4([203, 0, 113, 10], [127, 0, 0, 1], 40000, 3333);
        let peek = peek(&buf);
        assert!(peek.parsed && peek.pending);
        assert_eq!(peek.discard, 28);
        assert_eq!(
            peek.source,
            Some((IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)), 40000))
        );
    }

    #[test]
    fn v2_underbuffered_reports_pending_with_discard() {
        let buf = v2_tcp4([10, 0, 0, 1], [10, 0, 0, 2], 1, 2);
        let peek = peek(&buf[..20]);
        assert!(peek.pending && !peek.parsed);
        assert_eq!(peek.discard, 28);
        assert!(peek.source.is_none());
    }

    #[test]
    fn v2_local_command_discards_unparsed() {
        let mut buf = v2_tcp4([10, 0, 0, 1], [10, 0, 0, 2], 1, 2);
        buf[12] = 0x20; // LOCAL
        let peek = peek(&buf);
        assert!(peek.pending && !peek.parsed);
        assert_eq!(peek.discard, 28);
    }

    #[test]
    fn v1_tcp4_parses() {
        let buf = b"PROXY TCP4 198.51.100.7 10.0.0.1 5151 3333\r\n{\"id\":1}";
        let peek = peek(&buf[..]);
        assert!(peek.parsed);
        assert_eq!(peek.discard, 44);
        assert_eq!(
            peek.source,
            Some((IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 5151))
        );
    }

    #[test]
    fn v1_without_crlf_is_pending() {
        let buf = b"PROXY TCP4 198.51.100.7";
        let peek = peek(&buf[..]);
        assert!(peek.pending && !peek.parsed);
        assert_eq!(peek.discard, 0);
    }

    #[test]
    fn v1_unknown_family_discards_unparsed() {
        let buf = b"PROXY UNKNOWN\r\n";
        let peek = peek(&buf[..]);
        assert!(peek.pending && !peek.parsed);
        assert_eq!(peek.discard, 15);
    }

    #[test]
    fn v1_invalid_ip_discards_unparsed() {
        let buf = b"PROXY TCP4 999.999.0.1 10.0.0.1 1 2\r\n";
        let peek = peek(&buf[..]);
        assert!(!peek.parsed);
        assert_eq!(peek.discard, 37);
    }

    #[test]
    fn plain_json_is_untouched() {
        let peek = peek(b"{\"id\":1,\"method\":\"mining.subscribe\"}");
        assert_eq!(peek, ProxyPeek::default());
    }
}
