use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::core::config::NodeConfig;
use crate::core::dialer::BoxedConn;
use crate::core::errors::CoreError;
use crate::core::proto::SocksAddr;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const RSV: u8 = 0x00;
const AUTH_VERSION: u8 = 0x01;

/// Full client-side SOCKS5 handshake against the outbound (§4.F "SOCKS5"):
/// method negotiation, optional RFC 1929 user/pass sub-negotiation, a
/// CONNECT request, and — critically for P6 — reading and discarding every
/// byte of the CONNECT reply (BND.ADDR/BND.PORT included) so the first
/// byte handed back to the caller is the first byte of real payload.
pub async fn handshake(cfg: &NodeConfig, mut conn: BoxedConn, addr: &SocksAddr) -> Result<BoxedConn, CoreError> {
    let username = cfg.effective_username();
    let have_creds = !username.is_empty() || !cfg.password.is_empty();

    let methods: &[u8] = if have_creds { &[METHOD_NO_AUTH, METHOD_USERPASS] } else { &[METHOD_NO_AUTH] };

    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    conn.write_all(&greeting).await.map_err(|e| CoreError::auth(format!("greeting write: {e}")))?;

    let mut selected = [0u8; 2];
    conn.read_exact(&mut selected).await.map_err(|e| CoreError::auth(format!("method select read: {e}")))?;
    if selected[0] != VERSION {
        return Err(CoreError::auth("unexpected SOCKS version in method selection"));
    }

    match selected[1] {
        METHOD_NO_AUTH => {}
        METHOD_USERPASS => {
            let mut sub = vec![AUTH_VERSION, username.len() as u8];
            sub.extend_from_slice(username.as_bytes());
            sub.push(cfg.password.len() as u8);
            sub.extend_from_slice(cfg.password.as_bytes());
            conn.write_all(&sub).await.map_err(|e| CoreError::auth(format!("userpass write: {e}")))?;

            let mut reply = [0u8; 2];
            conn.read_exact(&mut reply).await.map_err(|e| CoreError::auth(format!("userpass read: {e}")))?;
            if reply[1] != 0 {
                return Err(CoreError::auth(format!("userpass auth failed: status {}", reply[1])));
            }
        }
        METHOD_NONE_ACCEPTABLE => {
            return Err(CoreError::auth("server rejected all offered auth methods"));
        }
        other => return Err(CoreError::auth(format!("unsupported auth method {other:#x}"))),
    }

    let mut connect = vec![VERSION, CMD_CONNECT, RSV];
    connect.extend_from_slice(&addr.encode());
    conn.write_all(&connect).await.map_err(|e| CoreError::protocol(format!("connect write: {e}")))?;

    let mut reply_header = [0u8; 4];
    conn.read_exact(&mut reply_header).await.map_err(|e| CoreError::protocol(format!("connect reply read: {e}")))?;
    if reply_header[0] != VERSION {
        return Err(CoreError::protocol("unexpected SOCKS version in connect reply"));
    }
    if reply_header[1] != 0 {
        return Err(CoreError::protocol(format!("SOCKS5 CONNECT failed: REP={}", reply_header[1])));
    }

    // BND.ADDR/BND.PORT: must be fully consumed (P6) regardless of their
    // contents, which callers never use — the outer TLS/WS/fragment
    // layering, not this field, tells us where we actually connected.
    let _bnd = SocksAddr::read(&mut conn).await?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn no_auth_connect_consumes_full_reply_then_payload() {
        let cfg = NodeConfig::parse(
            r#"{"type":"socks5","server":"sx.example","server_port":1080}"#,
        )
        .unwrap();
        let addr = SocksAddr::from_host_port("example.com", 80);

        let (client, mut server) = duplex(4096);
        let client: BoxedConn = Box::new(client);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION, 1, METHOD_NO_AUTH]);
            server.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();

            let mut connect_req = vec![0u8; 3 + addr_len("example.com")];
            server.read_exact(&mut connect_req).await.unwrap();

            // CONNECT reply header + a bogus BND.ADDR/PORT the client
            // must fully drain, followed immediately by "DATA".
            server.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
            server.write_all(b"DATA").await.unwrap();
            server
        });

        let mut stream = handshake(&cfg, client, &addr).await.unwrap();
        let mut server = server_task.await.unwrap();

        let mut out = [0u8; 4];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"DATA");

        // Keep `server` alive until the assertion above runs.
        let _ = server.shutdown().await;
    }

    fn addr_len(domain: &str) -> usize {
        1 + 1 + domain.len() + 2
    }

    #[tokio::test]
    async fn userpass_auth_failure_surfaces_as_autherror() {
        let cfg = NodeConfig::parse(
            r#"{"type":"socks5","server":"sx.example","server_port":1080,"uuid":"alice","password":"pw"}"#,
        )
        .unwrap();
        let addr = SocksAddr::from_host_port("example.com", 80);

        let (client, mut server) = duplex(4096);
        let client: BoxedConn = Box::new(client);

        tokio::spawn(async move {
            let mut greeting = vec![0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[VERSION, METHOD_USERPASS]).await.unwrap();

            let mut sub = vec![0u8; 1 + 1 + 5 + 1 + 2];
            server.read_exact(&mut sub).await.unwrap();
            server.write_all(&[AUTH_VERSION, 0x01]).await.unwrap();
        });

        let err = handshake(&cfg, client, &addr).await.unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));
    }
}
