use rand::RngCore;
use tokio::io::AsyncWriteExt;

use crate::core::config::NodeConfig;
use crate::core::dialer::BoxedConn;
use crate::core::errors::CoreError;
use crate::core::proto::SocksAddr;

const SALT_LEN: usize = 16;

/// `16 random bytes || SocksAddr`, written as one payload (§4.F
/// "Shadowsocks"). The 16 bytes stand in for the cipher salt a bare
/// Shadowsocks connection would derive its session key from; this node's
/// outer TLS layer is the actual confidentiality boundary, so the salt is
/// uninterpreted filler rather than fed into a cipher here.
pub async fn handshake(_cfg: &NodeConfig, mut conn: BoxedConn, addr: &SocksAddr) -> Result<BoxedConn, CoreError> {
    let mut header = vec![0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut header);
    header.extend_from_slice(&addr.encode());

    conn.write_all(&header).await.map_err(|e| CoreError::protocol(format!("shadowsocks write: {e}")))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn matches_scenario_3_prologue_length() {
        let cfg = NodeConfig::parse(
            r#"{"type":"shadowsocks","server":"ss.example","server_port":8443,"tls":{"enabled":true,"insecure":true}}"#,
        )
        .unwrap();
        let addr = SocksAddr::from_host_port("1.2.3.4", 80);

        let (client, mut server) = duplex(4096);
        let client: BoxedConn = Box::new(client);
        handshake(&cfg, client, &addr).await.unwrap();

        let mut buf = vec![0u8; 23];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[16..], &[0x01, 1, 2, 3, 4, 0x00, 0x50]);
    }
}
