use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::errors::CoreError;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// The `ATYP(1) || ADDR || PORT(2, be)` address encoding shared by SOCKS5
/// and the proxy protocols in §4.F.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    Ipv4([u8; 4], u16),
    Ipv6([u8; 16], u16),
    Domain(String, u16),
}

impl SocksAddr {
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => SocksAddr::Ipv4(v4.octets(), port),
            Ok(IpAddr::V6(v6)) => SocksAddr::Ipv6(v6.octets(), port),
            Err(_) => SocksAddr::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            SocksAddr::Ipv4(_, p) | SocksAddr::Ipv6(_, p) | SocksAddr::Domain(_, p) => *p,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            SocksAddr::Ipv4(addr, port) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(addr);
                out.extend_from_slice(&port.to_be_bytes());
            }
            SocksAddr::Ipv6(addr, port) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(addr);
                out.extend_from_slice(&port.to_be_bytes());
            }
            SocksAddr::Domain(name, port) => {
                out.push(ATYP_DOMAIN);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
        out
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_all(&self.encode()).await.map_err(|e| CoreError::protocol(format!("write socksaddr: {e}")))
    }

    /// Reads and fully consumes a SocksAddr from `r`; used by the SOCKS5
    /// client to drain the CONNECT reply's BND.ADDR/BND.PORT (P6).
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let mut atyp = [0u8; 1];
        r.read_exact(&mut atyp).await.map_err(|e| CoreError::protocol(format!("read atyp: {e}")))?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                r.read_exact(&mut addr).await.map_err(|e| CoreError::protocol(format!("read ipv4: {e}")))?;
                let port = read_port(r).await?;
                Ok(SocksAddr::Ipv4(addr, port))
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                r.read_exact(&mut addr).await.map_err(|e| CoreError::protocol(format!("read ipv6: {e}")))?;
                let port = read_port(r).await?;
                Ok(SocksAddr::Ipv6(addr, port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                r.read_exact(&mut len).await.map_err(|e| CoreError::protocol(format!("read domain len: {e}")))?;
                let mut name = vec![0u8; len[0] as usize];
                r.read_exact(&mut name).await.map_err(|e| CoreError::protocol(format!("read domain: {e}")))?;
                let port = read_port(r).await?;
                Ok(SocksAddr::Domain(String::from_utf8_lossy(&name).to_string(), port))
            }
            other => Err(CoreError::protocol(format!("unknown ATYP {other:#x}"))),
        }
    }
}

async fn read_port<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, CoreError> {
    let mut port = [0u8; 2];
    r.read_exact(&mut port).await.map_err(|e| CoreError::protocol(format!("read port: {e}")))?;
    Ok(u16::from_be_bytes(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn encodes_ipv4() {
        let addr = SocksAddr::from_host_port("93.184.216.34", 443);
        assert_eq!(addr.encode(), vec![0x01, 93, 184, 216, 34, 0x01, 0xbb]);
    }

    #[test]
    fn encodes_domain() {
        let addr = SocksAddr::from_host_port("example.com", 80);
        let mut expected = vec![0x03, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&80u16.to_be_bytes());
        assert_eq!(addr.encode(), expected);
    }

    #[tokio::test]
    async fn round_trips_through_duplex() {
        let (mut a, mut b) = duplex(128);
        let addr = SocksAddr::from_host_port("example.com", 8443);
        addr.write(&mut a).await.unwrap();
        let decoded = SocksAddr::read(&mut b).await.unwrap();
        assert_eq!(decoded, addr);
    }

    #[tokio::test]
    async fn round_trips_ipv6() {
        let (mut a, mut b) = duplex(128);
        let addr = SocksAddr::from_host_port("::1", 53);
        addr.write(&mut a).await.unwrap();
        let decoded = SocksAddr::read(&mut b).await.unwrap();
        assert_eq!(decoded, addr);
    }
}
