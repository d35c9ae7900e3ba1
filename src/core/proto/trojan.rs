use tokio::io::AsyncWriteExt;

use crate::core::config::NodeConfig;
use crate::core::dialer::BoxedConn;
use crate::core::errors::CoreError;
use crate::core::proto::SocksAddr;
use crate::core::proto::mandala::sha224_hex;

const CMD_CONNECT: u8 = 0x01;

/// `sha224_hex(password) || CRLF || 0x01 || SocksAddr || CRLF` (§4.F
/// "Trojan" — identical to Mandala minus the noise suffix).
pub async fn handshake(cfg: &NodeConfig, mut conn: BoxedConn, addr: &SocksAddr) -> Result<BoxedConn, CoreError> {
    let mut header = Vec::new();
    header.extend_from_slice(sha224_hex(&cfg.password).as_bytes());
    header.extend_from_slice(b"\r\n");
    header.push(CMD_CONNECT);
    header.extend_from_slice(&addr.encode());
    header.extend_from_slice(b"\r\n");

    conn.write_all(&header).await.map_err(|e| CoreError::protocol(format!("trojan write: {e}")))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn matches_scenario_2_prologue() {
        let cfg = NodeConfig::parse(
            r#"{"type":"trojan","password":"secret","server":"t.example","server_port":443,"tls":{"enabled":true}}"#,
        )
        .unwrap();
        let addr = SocksAddr::from_host_port("example.com", 80);

        let (client, mut server) = duplex(4096);
        let client: BoxedConn = Box::new(client);
        handshake(&cfg, client, &addr).await.unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(sha224_hex("secret").as_bytes());
        expected.extend_from_slice(b"\r\n");
        expected.push(CMD_CONNECT);
        expected.extend_from_slice(&addr.encode());
        expected.extend_from_slice(b"\r\n");

        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }
}
