//! Primitive field codecs shared by protocol messages.

use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Encoded length of a length-prefixed string.
#[inline]
pub(crate) fn str_len(s: &str) -> usize {
    2 + s.len()
}

/// Encoded length of a socket address.
#[inline]
pub(crate) fn addr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}

pub(crate) fn put_str(buf: &mut impl BufMut, s: &str) {
    // Names are validated to fit in u16 at configuration time.
    let len = s.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&s.as_bytes()[..len]);
}

pub(crate) fn get_str(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return None;
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).ok()
}

pub(crate) fn put_addr(buf: &mut impl BufMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

pub(crate) fn get_addr(buf: &mut impl Buf) -> Option<SocketAddr> {
    if buf.remaining() < 1 {
        return None;
    }
    let ip = match buf.get_u8() {
        FAMILY_V4 => {
            if buf.remaining() < 4 {
                return None;
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            if buf.remaining() < 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    if buf.remaining() < 2 {
        return None;
    }
    Some(SocketAddr::new(ip, buf.get_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_str_codec() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "node-a");
        assert_eq!(buf.len(), str_len("node-a"));
        let mut rd = buf.freeze();
        assert_eq!(get_str(&mut rd).as_deref(), Some("node-a"));
    }

    #[test]
    fn test_str_truncated() {
        let mut rd: &[u8] = &[0, 10, b'a'];
        assert_eq!(get_str(&mut rd), None);
    }

    #[test]
    fn test_addr_codec_v4_and_v6() {
        for addr in ["10.0.0.1:7946", "[::1]:9000"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut buf = BytesMut::new();
            put_addr(&mut buf, &addr);
            assert_eq!(buf.len(), addr_len(&addr));
            let mut rd = buf.freeze();
            assert_eq!(get_addr(&mut rd), Some(addr));
        }
    }

    #[test]
    fn test_addr_bad_family() {
        let mut rd: &[u8] = &[5, 1, 2, 3, 4, 0, 1];
        assert_eq!(get_addr(&mut rd), None);
    }
}
