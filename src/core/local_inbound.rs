//! Local SOCKS5/HTTP inbound (§4.J, ambient): a loopback listener apps on
//! the host can point a SOCKS5 or HTTP proxy client at, reusing the
//! outbound dialer and protocol multiplexer for every accepted
//! connection.
//!
//! The accept-loop shape (per-connection `tokio::spawn`, `tokio::select!`
//! against a shutdown watch) mirrors `serve_tcp_with_shutdown` in
//! `src/prism/proxy.rs`. The server-side SOCKS5 handshake is the mirror
//! image of this crate's client-side one in `core/proto/socks5.rs`,
//! itself grounded on
//! `examples/other_examples/9ae27fb4_shaneutt-ztunnel__src-proxy-socks5.rs.rs`
//! (unauthenticated-only, CONNECT-only, IPv4/IPv6/domain targets, a
//! dummy success reply the client is expected to ignore).

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::core::config::NodeConfig;
use crate::core::dialer;
use crate::core::errors::CoreError;
use crate::core::proto;
use crate::core::session;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const HTTP_CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Binds `127.0.0.1:local_port` and serves accepted connections until
/// `shutdown` reports `true`. Grounded on the teacher's
/// `serve_tcp_with_shutdown`.
pub async fn serve(local_port: u16, cfg: Arc<NodeConfig>, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|e| CoreError::stack(format!("local inbound bind: {e}")))?;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "local inbound: accept error");
                        continue;
                    }
                };
                let cfg = cfg.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, &cfg).await {
                        tracing::debug!(%err, "local inbound: connection ended with error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, cfg: &NodeConfig) -> Result<(), CoreError> {
    let mut first_byte = [0u8; 1];
    stream.read_exact(&mut first_byte).await.map_err(CoreError::Dial)?;

    let (host, port, replay) = if first_byte[0] == SOCKS5_VERSION {
        let (host, port) = socks5_handshake(&mut stream).await?;
        (host, port, None)
    } else {
        http_handshake(&mut stream, first_byte[0]).await?
    };

    let outbound = dialer::dial(cfg).await?;
    let mut outbound = proto::handshake(cfg, outbound, &host, port).await?;
    if let Some(buf) = replay {
        outbound.write_all(&buf).await.map_err(CoreError::Dial)?;
    }
    session::splice(stream, outbound).await.map_err(CoreError::Dial)?;
    Ok(())
}

/// Server-side SOCKS5: advertises the no-auth method only (§4.J — local
/// apps are trusted callers), supports CONNECT with IPv4/IPv6/domain
/// targets, and replies with a dummy `BND.ADDR`/`BND.PORT` the client is
/// expected to ignore, matching the ztunnel reference implementation.
async fn socks5_handshake(stream: &mut TcpStream) -> Result<(String, u16), CoreError> {
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await.map_err(CoreError::Dial)?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await.map_err(CoreError::Dial)?;
    if !methods.contains(&0x00) {
        stream.write_all(&[SOCKS5_VERSION, 0xFF]).await.map_err(CoreError::Dial)?;
        return Err(CoreError::auth("client does not offer no-auth method"));
    }
    stream.write_all(&[SOCKS5_VERSION, 0x00]).await.map_err(CoreError::Dial)?;

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await.map_err(CoreError::Dial)?;
    if header[0] != SOCKS5_VERSION || header[1] != SOCKS5_CMD_CONNECT {
        return Err(CoreError::protocol("only CONNECT is supported"));
    }

    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp).await.map_err(CoreError::Dial)?;
    let host = match atyp[0] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await.map_err(CoreError::Dial)?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await.map_err(CoreError::Dial)?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(CoreError::Dial)?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await.map_err(CoreError::Dial)?;
            String::from_utf8_lossy(&name).to_string()
        }
        other => return Err(CoreError::protocol(format!("unsupported ATYP {other:#x}"))),
    };
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await.map_err(CoreError::Dial)?;
    let port = u16::from_be_bytes(port_buf);

    // Dummy success reply; callers are expected to ignore BND.ADDR/PORT.
    let reply = [SOCKS5_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await.map_err(CoreError::Dial)?;

    Ok((host, port))
}

/// Server-side HTTP: parses the request line with `httparse`. A
/// `CONNECT host:port HTTP/1.1` gets a `200 Connection Established` and
/// the raw TCP splice takes over; any other absolute-form request is
/// treated as a plain HTTP proxy GET — its target is extracted from the
/// request-line URI, and the original request bytes are replayed to the
/// upstream once the outbound pipeline is established.
async fn http_handshake(stream: &mut TcpStream, first_byte: u8) -> Result<(String, u16, Option<Vec<u8>>), CoreError> {
    let mut buf = vec![first_byte];
    read_until_headers_end(stream, &mut buf).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&buf).map_err(|e| CoreError::protocol(format!("http request parse: {e}")))?;

    let method = req.method.ok_or_else(|| CoreError::protocol("missing http method"))?;
    let target = req.path.ok_or_else(|| CoreError::protocol("missing http request-target"))?;

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, 443)?;
        stream.write_all(HTTP_CONNECT_OK).await.map_err(CoreError::Dial)?;
        Ok((host, port, None))
    } else {
        let uri = target
            .strip_prefix("http://")
            .ok_or_else(|| CoreError::protocol("only absolute-form http proxy requests are supported"))?;
        let (authority, _path) = uri.split_once('/').unwrap_or((uri, ""));
        let (host, port) = split_host_port(authority, 80)?;
        // Plain (non-CONNECT) proxying has no upgrade handshake of its
        // own: the request line/headers already buffered from the client
        // are the first bytes the upstream must see, replayed once the
        // outbound pipeline is up.
        Ok((host, port, Some(buf)))
    }
}

async fn read_until_headers_end(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<(), CoreError> {
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.map_err(CoreError::Dial)?;
        buf.push(byte[0]);
        if buf.len() > 16 * 1024 {
            return Err(CoreError::protocol("http request line/headers too large"));
        }
    }
    Ok(())
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), CoreError> {
    if let Some(rest) = authority.strip_prefix('[') {
        // IPv6 literal: `[::1]:443`
        let (host, rest) = rest.split_once(']').ok_or_else(|| CoreError::protocol("unterminated ipv6 literal"))?;
        let port = rest.strip_prefix(':').map(|p| p.parse().unwrap_or(default_port)).unwrap_or(default_port);
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| CoreError::protocol("invalid port in authority"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("example.com:8080", 80).unwrap(), ("example.com".to_string(), 8080));
    }

    #[test]
    fn defaults_port_when_absent() {
        assert_eq!(split_host_port("example.com", 443).unwrap(), ("example.com".to_string(), 443));
    }

    #[test]
    fn parses_ipv6_literal_with_port() {
        assert_eq!(split_host_port("[::1]:53", 80).unwrap(), ("::1".to_string(), 53));
    }
}
