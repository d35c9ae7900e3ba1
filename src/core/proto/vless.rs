use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::core::config::NodeConfig;
use crate::core::dialer::BoxedConn;
use crate::core::errors::CoreError;
use crate::core::proto::SocksAddr;

const VERSION: u8 = 0x00;
const ADDONS_LEN: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

/// `0x00 || uuid(16) || 0x00 || 0x01 || port(2, be) || ATYP || ADDR` (§4.F
/// "VLESS" — note ATYP/ADDR follow the port, unlike the other four
/// variants). The server's `version(1), addons_len(1), addons(addons_len)`
/// reply is consumed here, immediately after the request is written and
/// before any payload byte is handed to the caller — equivalent to "strip
/// on first read" since nothing intervenes between dial and the first
/// application read in this pipeline, but far simpler than threading a
/// decorator through `poll_read`.
pub async fn handshake(cfg: &NodeConfig, mut conn: BoxedConn, addr: &SocksAddr) -> Result<BoxedConn, CoreError> {
    let uuid = uuid::Uuid::parse_str(&cfg.uuid).map_err(|e| CoreError::config(format!("vless uuid: {e}")))?;
    let encoded_addr = addr.encode();
    let atyp_and_addr = &encoded_addr[..encoded_addr.len() - 2];

    let mut header = Vec::new();
    header.push(VERSION);
    header.extend_from_slice(uuid.as_bytes());
    header.push(ADDONS_LEN);
    header.push(CMD_CONNECT);
    header.extend_from_slice(&addr.port().to_be_bytes());
    header.extend_from_slice(atyp_and_addr);

    conn.write_all(&header).await.map_err(|e| CoreError::protocol(format!("vless write: {e}")))?;

    let mut resp_header = [0u8; 2];
    conn.read_exact(&mut resp_header)
        .await
        .map_err(|e| CoreError::protocol(format!("vless read response: {e}")))?;
    let addons_len = resp_header[1] as usize;
    if addons_len > 0 {
        let mut addons = vec![0u8; addons_len];
        conn.read_exact(&mut addons).await.map_err(|e| CoreError::protocol(format!("vless read addons: {e}")))?;
    }

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn matches_scenario_1_prologue() {
        let cfg = NodeConfig::parse(
            r#"{"type":"vless","server":"s.example","server_port":443,
                "uuid":"11111111-2222-3333-4444-555555555555",
                "tls":{"enabled":true,"server_name":"s.example"},
                "transport":{"type":"ws","path":"/x"}}"#,
        )
        .unwrap();
        let addr = SocksAddr::from_host_port("93.184.216.34", 443);

        let (client, mut server) = duplex(4096);
        let client: BoxedConn = Box::new(client);

        let handshake_fut = handshake(&cfg, client, &addr);
        tokio::pin!(handshake_fut);

        let mut expected = Vec::new();
        expected.push(VERSION);
        expected.extend_from_slice(uuid::Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap().as_bytes());
        expected.push(ADDONS_LEN);
        expected.push(CMD_CONNECT);
        expected.extend_from_slice(&443u16.to_be_bytes());
        expected.push(0x01); // ATYP_IPV4
        expected.extend_from_slice(&[93, 184, 216, 34]);

        let mut buf = vec![0u8; expected.len()];
        server.write_all(&[0x00, 0x00]).await.unwrap(); // no-addons reply
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);

        handshake_fut.await.unwrap();
    }

    #[tokio::test]
    async fn strips_server_response_before_payload() {
        let (client, mut server) = duplex(4096);
        let client: BoxedConn = Box::new(client);

        let cfg = NodeConfig::parse(
            r#"{"type":"vless","server":"s.example","server_port":443,"uuid":"11111111-2222-3333-4444-555555555555"}"#,
        )
        .unwrap();
        let addr = SocksAddr::from_host_port("1.1.1.1", 80);

        server.write_all(&[0x00, 0x02, 0xAA, 0xBB]).await.unwrap();
        server.write_all(b"payload").await.unwrap();

        // Drain the client's request so the server-side buffer doesn't block.
        let mut drain = vec![0u8; 1 + 16 + 1 + 1 + 2 + 1 + 4];
        let mut stripped = handshake(&cfg, client, &addr).await.unwrap();
        server.read_exact(&mut drain).await.unwrap();

        let mut out = vec![0u8; b"payload".len()];
        stripped.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }
}
