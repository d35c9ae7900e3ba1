pub mod fragment;
pub mod tls;
pub mod ws;

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;

use crate::core::config::NodeConfig;
use crate::core::errors::CoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// Marker trait for the boxed byte-stream `Conn` abstraction threaded
/// through the dialer's decorator layers (fragment shim, TLS, WebSocket)
/// and into the protocol multiplexer. Mirrors the teacher's
/// `tunnel::transport::AsyncStream`/`BoxedStream` pattern.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> AsyncStream for T {}

pub type BoxedConn = Box<dyn AsyncStream>;

/// Runs the full outbound pipeline of §4.D: TCP dial, optional fragment
/// shim, optional fingerprinted TLS (with optional ECH), optional
/// WebSocket upgrade. Returns an opaque `Conn` ready for the protocol
/// multiplexer to write its handshake header on.
pub async fn dial(cfg: &NodeConfig) -> Result<BoxedConn, CoreError> {
    let tcp = dial_tcp(&cfg.server, cfg.server_port).await?;
    let mut conn: BoxedConn = Box::new(tcp);

    if cfg.fragment {
        conn = Box::new(fragment::FragmentShim::new(conn));
    }

    if cfg.tls.enabled {
        conn = tls::wrap(cfg, conn).await?;
    }

    if cfg.transport.is_websocket() {
        conn = ws::upgrade(cfg, conn).await?;
    }

    Ok(conn)
}

async fn dial_tcp(host: &str, port: u16) -> Result<TcpStream, CoreError> {
    let addr = format!("{host}:{port}");
    let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| CoreError::Dial(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout")))?
        .map_err(CoreError::Dial)?;

    stream.set_nodelay(true).ok();

    // §4.D.1: TCP keepalive on, 15-second period.
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD).with_interval(KEEPALIVE_PERIOD);
    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

    Ok(stream)
}
