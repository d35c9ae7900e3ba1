pub mod mandala;
pub mod shadowsocks;
pub mod socks5;
pub mod socksaddr;
pub mod trojan;
pub mod vless;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::config::{NodeConfig, ProtocolType};
use crate::core::dialer::BoxedConn;
use crate::core::errors::CoreError;

pub use socksaddr::SocksAddr;

/// Emits the per-flow proxy-protocol header on a freshly dialed `conn` and
/// returns the stream callers should read/write application bytes on
/// (identical to `conn` for every variant except VLESS, which must strip a
/// short server response before the first payload byte).
pub async fn handshake(
    cfg: &NodeConfig,
    conn: BoxedConn,
    target_host: &str,
    target_port: u16,
) -> Result<BoxedConn, CoreError> {
    let addr = SocksAddr::from_host_port(target_host, target_port);
    match cfg.kind {
        ProtocolType::Mandala => mandala::handshake(cfg, conn, &addr).await,
        ProtocolType::Trojan => trojan::handshake(cfg, conn, &addr).await,
        ProtocolType::Vless => vless::handshake(cfg, conn, &addr).await,
        ProtocolType::Shadowsocks => shadowsocks::handshake(cfg, conn, &addr).await,
        ProtocolType::Socks5 => socks5::handshake(cfg, conn, &addr).await,
    }
}

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncStream for T {}
