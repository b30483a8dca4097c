//! Sender address of a message and its wire framing.

use crate::error::{CoreError, CoreResult};
use crate::serialize::{ArchiveReader, ArchiveWriter};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

const AF_NONE: u16 = 0;
const AF_INET: u16 = 2;
const AF_UNIX: u16 = 1;
const AF_INET6: u16 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderAddr {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    /// Local transport; the peer path is not carried across serialization.
    Unix,
}

impl SenderAddr {
    pub fn serialize<W: Write>(
        addr: &Option<SenderAddr>,
        archive: &mut ArchiveWriter<W>,
    ) -> CoreResult<()> {
        match addr {
            None => archive.write_u16(AF_NONE),
            Some(SenderAddr::Inet(sa)) => {
                archive.write_u16(AF_INET)?;
                archive.write_blob(&sa.ip().octets())?;
                archive.write_u16(sa.port())
            }
            Some(SenderAddr::Inet6(sa)) => {
                archive.write_u16(AF_INET6)?;
                archive.write_blob(&sa.ip().octets())?;
                archive.write_u16(sa.port())
            }
            Some(SenderAddr::Unix) => archive.write_u16(AF_UNIX),
        }
    }

    pub fn deserialize<R: Read>(archive: &mut ArchiveReader<R>) -> CoreResult<Option<SenderAddr>> {
        let family = archive.read_u16()?;
        match family {
            AF_NONE => Ok(None),
            AF_INET => {
                let mut octets = [0u8; 4];
                archive.read_blob(&mut octets)?;
                let port = archive.read_u16()?;
                Ok(Some(SenderAddr::Inet(SocketAddrV4::new(
                    Ipv4Addr::from(octets),
                    port,
                ))))
            }
            AF_INET6 => {
                let mut octets = [0u8; 16];
                archive.read_blob(&mut octets)?;
                let port = archive.read_u16()?;
                Ok(Some(SenderAddr::Inet6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                ))))
            }
            AF_UNIX => Ok(Some(SenderAddr::Unix)),
            _ => Err(CoreError::Malformed("unknown address family")),
        }
    }
}
