use std::fmt::{Debug, Formatter};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use bytes::{Buf, BufMut};

/// Identity of a remote peer: its network address plus an incarnation number that
///  distinguishes a restarted process from the process that previously ran at the same
///  address. Recovery state is never shared across incarnations - a restarted peer starts
///  from a fresh recovery descriptor, and the old descriptor's in-flight messages are
///  failed rather than replayed to the new process.
///
/// NB: Uniqueness of the incarnation is in the restarting node's own interest (so it is
///  not mistaken for its predecessor); it is not a security feature. Seeding it from the
///  wall clock is good enough in typical environments.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeAddr {
    pub incarnation: u32,
    pub addr: SocketAddr,
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{}]", self.addr, self.incarnation)
    }
}

impl NodeAddr {
    /// The handshake payload on a new physical connection carries the sender's identity;
    ///  this is its serialized form.
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.incarnation);
        match &self.addr {
            SocketAddr::V4(a) => {
                buf.put_u8(4);
                buf.put_u32((*a.ip()).into());
                buf.put_u16(a.port());
            }
            SocketAddr::V6(a) => {
                buf.put_u8(6);
                buf.put_u128((*a.ip()).into());
                buf.put_u16(a.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        let incarnation = buf.try_get_u32()?;

        let addr = match buf.try_get_u8()? {
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => {
                return Err(anyhow!("invalid socket address discriminator: {}", n));
            }
        };
        Ok(NodeAddr {
            incarnation,
            addr,
        })
    }
}

impl From<SocketAddr> for NodeAddr {
    fn from(addr: SocketAddr) -> Self {
        let incarnation = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        NodeAddr {
            incarnation,
            addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::v4("1.2.3.4:5678", 17)]
    #[case::v6("[2001:db8::7]:999", 3)]
    fn test_node_addr_ser_deser(#[case] addr: &str, #[case] incarnation: u32) {
        let addr = NodeAddr {
            incarnation,
            addr: SocketAddr::from_str(addr).unwrap(),
        };

        let mut buf = BytesMut::new();
        addr.ser(&mut buf);

        let mut raw = buf.freeze();
        let deserialized = NodeAddr::try_deser(&mut raw).unwrap();
        assert_eq!(deserialized, addr);
        assert!(!raw.has_remaining());
    }

    #[rstest]
    #[case::truncated(b"\0\0\0\x01\x04\x01\x02".as_slice())]
    #[case::bad_discriminator(b"\0\0\0\x01\x09\x01\x02\x03\x04\x05\x06".as_slice())]
    fn test_node_addr_deser_invalid(#[case] mut buf: &[u8]) {
        assert!(NodeAddr::try_deser(&mut buf).is_err());
    }
}
