//! Flow dispatcher (§4.C): routes flows accepted off the network stack
//! to the session forwarder, the DNS tunnel, or the UDP NAT manager.
//!
//! Grounded on the teacher's `serve_tcp_with_shutdown`/
//! `serve_udp_with_shutdown` accept-loop shape in `src/prism/proxy.rs`
//! (watch-driven `tokio::select!` loop, one spawned task per accepted
//! flow) and its `UdpSession` keying-by-5-tuple convention, reused here
//! against `netstack::NetStack` instead of a real OS socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::core::config::NodeConfig;
use crate::core::dialer;
use crate::core::dns_tunnel::DnsTunnel;
use crate::core::netstack::NetStack;
use crate::core::proto;
use crate::core::session;
use crate::core::udpnat::UdpNatManager;

const DNS_PORT: u16 = 53;

/// Runs until `shutdown.changed()` observes `true`, pulling new flows off
/// `stack` and routing each to its handler. Panics inside a per-flow task
/// are caught by `tokio::spawn`'s own unwind boundary and only fail that
/// flow (§4.C "must not poison other flows").
pub async fn run(mut stack: NetStack, cfg: Arc<NodeConfig>, udp_nat: Arc<UdpNatManager>, mut shutdown: watch::Receiver<bool>) {
    let dns_tunnel = Arc::new(DnsTunnel::new());

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            tcp = stack.accept_tcp() => {
                let Some(incoming) = tcp else { return };
                let cfg = cfg.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_tcp(incoming.local_addr, incoming.stream, &cfg).await {
                        tracing::debug!(%err, "tcp session ended with error");
                    }
                });
            }
            udp = stack.accept_udp() => {
                let Some(incoming) = udp else { return };
                if incoming.local_addr.port() == DNS_PORT {
                    let cfg = cfg.clone();
                    let dns_tunnel = dns_tunnel.clone();
                    tokio::spawn(async move {
                        dns_tunnel.serve(&cfg, incoming.stream).await;
                    });
                } else {
                    let cfg = cfg.clone();
                    let udp_nat = udp_nat.clone();
                    tokio::spawn(async move {
                        handle_udp(incoming.local_addr, incoming.peer_addr, incoming.stream, cfg, udp_nat).await;
                    });
                }
            }
        }
    }
}

async fn handle_tcp(
    dst: SocketAddr,
    inbound: crate::core::netstack::NetTcpStream,
    cfg: &NodeConfig,
) -> Result<(), crate::core::errors::CoreError> {
    let outbound = dialer::dial(cfg).await?;
    let outbound = proto::handshake(cfg, outbound, &dst.ip().to_string(), dst.port()).await?;
    session::splice(inbound, outbound).await.map_err(crate::core::errors::CoreError::Dial)?;
    Ok(())
}

async fn handle_udp(
    dst: SocketAddr,
    src: SocketAddr,
    inbound: crate::core::netstack::NetUdpStream,
    cfg: Arc<NodeConfig>,
    udp_nat: Arc<UdpNatManager>,
) {
    let dst_host = dst.ip().to_string();
    let dst_port = dst.port();
    // §3: the NAT key is the full 5-tuple (source and destination both
    // included) so that different app sockets get independent tunnels.
    let key = format!("{src}->{dst}");

    let session = match udp_nat.get_or_create(&key, &cfg, &dst_host, dst_port).await {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(%err, "udp nat: session construction failed");
            return;
        }
    };

    let (mut inbound_rx, inbound_tx) = inbound.split();
    udp_nat.spawn_fanout(key, session.clone(), inbound_tx);

    // Fan-in: every datagram the netstack hands us for this 5-tuple goes
    // straight to the outbound connection; fan-out runs independently on
    // the task `spawn_fanout` just started.
    while let Some(datagram) = inbound_rx.recv().await {
        if session.send(&datagram).await.is_err() {
            return;
        }
    }
}
