//! DNS tunnel (§4.I): forwards UDP/53 flows over a cached outbound TCP
//! stream to `8.8.8.8:53`, framed with a 16-bit big-endian length prefix.
//!
//! Grounded on `src/prism/tunnel/datagram.rs`'s `DatagramConn`, which
//! frames each datagram with a 32-bit length prefix read/written via
//! `read_u32`/`write_u32`; this tunnel carries DNS messages instead of
//! arbitrary datagrams, so it follows RFC 1035 §4.2.2's TCP framing (a
//! 16-bit length prefix) rather than the teacher's 32-bit one.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};

use crate::core::config::NodeConfig;
use crate::core::dialer::{self, BoxedConn};
use crate::core::errors::CoreError;
use crate::core::netstack::NetUdpStream;
use crate::core::proto;

const DNS_SERVER_HOST: &str = "8.8.8.8";
const DNS_SERVER_PORT: u16 = 53;
const READ_DEADLINE: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 2;

/// Caches one outbound DNS connection, serialized by a mutex so the
/// 16-bit length prefix can never be interleaved between concurrent
/// queries (§5 "Shared resources").
pub struct DnsTunnel {
    cached: Mutex<Option<BoxedConn>>,
}

impl DnsTunnel {
    pub fn new() -> Self {
        Self { cached: Mutex::new(None) }
    }

    /// Drives one UDP/53 flow end-to-end: read a query, forward it,
    /// write the response back, repeat until the inbound endpoint closes
    /// or a read deadline elapses.
    pub async fn serve(&self, cfg: &NodeConfig, mut inbound: NetUdpStream) {
        loop {
            let query = match timeout(READ_DEADLINE, inbound.recv()).await {
                Ok(Some(q)) => q,
                Ok(None) | Err(_) => return,
            };

            match self.query(cfg, &query).await {
                Some(response) => {
                    if !inbound.send(response).await {
                        return;
                    }
                }
                None => {
                    // Fails soft (§4.I): the client will retry the query.
                }
            }
        }
    }

    async fn query(&self, cfg: &NodeConfig, payload: &[u8]) -> Option<Vec<u8>> {
        for _attempt in 0..MAX_ATTEMPTS {
            let mut guard = self.cached.lock().await;

            if guard.is_none() {
                match dial_and_handshake(cfg).await {
                    Ok(conn) => *guard = Some(conn),
                    Err(err) => {
                        tracing::warn!(%err, "dns tunnel: dial failed");
                        return None;
                    }
                }
            }

            let result = send_and_receive(guard.as_mut().expect("just populated"), payload).await;
            match result {
                Ok(response) => return Some(response),
                Err(err) => {
                    tracing::warn!(%err, "dns tunnel: io error, resetting cached connection");
                    *guard = None;
                }
            }
        }
        None
    }
}

impl Default for DnsTunnel {
    fn default() -> Self {
        Self::new()
    }
}

async fn dial_and_handshake(cfg: &NodeConfig) -> Result<BoxedConn, CoreError> {
    let conn = dialer::dial(cfg).await?;
    proto::handshake(cfg, conn, DNS_SERVER_HOST, DNS_SERVER_PORT).await
}

async fn send_and_receive(conn: &mut BoxedConn, query: &[u8]) -> std::io::Result<Vec<u8>> {
    let len = u16::try_from(query.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "dns query too large for 16-bit prefix"))?;

    conn.write_all(&len.to_be_bytes()).await?;
    conn.write_all(query).await?;

    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf).await?;
    let resp_len = u16::from_be_bytes(len_buf) as usize;

    let mut response = vec![0u8; resp_len];
    conn.read_exact(&mut response).await?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_query_and_response_with_16_bit_prefix() {
        let (client, mut server) = duplex(4096);
        let mut client: BoxedConn = Box::new(client);

        let server_task = tokio::spawn(async move {
            let mut len_buf = [0u8; 2];
            server.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut query = vec![0u8; len];
            server.read_exact(&mut query).await.unwrap();
            assert_eq!(query, b"QUERY");

            server.write_all(&8u16.to_be_bytes()).await.unwrap();
            server.write_all(b"RESPONSE").await.unwrap();
        });

        let response = send_and_receive(&mut client, b"QUERY").await.unwrap();
        assert_eq!(response, b"RESPONSE");
        server_task.await.unwrap();
    }
}
