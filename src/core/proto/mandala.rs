use rand::Rng;
use sha2::{Digest, Sha224};
use tokio::io::AsyncWriteExt;

use crate::core::config::NodeConfig;
use crate::core::dialer::BoxedConn;
use crate::core::errors::CoreError;
use crate::core::proto::SocksAddr;

const CMD_CONNECT: u8 = 0x01;

/// `sha224_hex(password) || CRLF || 0x01 || SocksAddr || CRLF || noise`,
/// written as a single payload (§4.F "Mandala").
pub async fn handshake(cfg: &NodeConfig, mut conn: BoxedConn, addr: &SocksAddr) -> Result<BoxedConn, CoreError> {
    let mut header = Vec::new();
    header.extend_from_slice(sha224_hex(&cfg.password).as_bytes());
    header.extend_from_slice(b"\r\n");
    header.push(CMD_CONNECT);
    header.extend_from_slice(&addr.encode());
    header.extend_from_slice(b"\r\n");

    if cfg.noise_bytes > 0 {
        let mut noise = vec![0u8; cfg.noise_bytes];
        rand::rng().fill(noise.as_mut_slice());
        header.extend_from_slice(&noise);
    }

    conn.write_all(&header).await.map_err(|e| CoreError::protocol(format!("mandala write: {e}")))?;
    Ok(conn)
}

pub(crate) fn sha224_hex(password: &str) -> String {
    let digest = Sha224::digest(password.as_bytes());
    hex_lower(&digest)
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NodeConfig;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn header_matches_expected_length_and_prefix() {
        let cfg = NodeConfig::parse(
            r#"{"type":"mandala","server":"m.example","server_port":443,"password":"secret","settings":{"noise":4}}"#,
        )
        .unwrap();
        let addr = SocksAddr::from_host_port("1.2.3.4", 80);

        let (client, mut server) = duplex(4096);
        let client: BoxedConn = Box::new(client);
        handshake(&cfg, client, &addr).await.unwrap();

        let digest = sha224_hex("secret");
        assert_eq!(digest.len(), 56);

        let expected_len = 56 + 2 + 1 + addr.encode().len() + 2 + 4;
        let mut buf = vec![0u8; expected_len];
        server.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf[..56], digest.as_bytes());
        assert_eq!(&buf[56..58], b"\r\n");
        assert_eq!(buf[58], CMD_CONNECT);
    }
}
