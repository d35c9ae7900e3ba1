//! User-space TCP/IP stack bridging the TUN device to per-flow byte
//! streams (§4.B).
//!
//! Grounded on the packet-dispatch-loop shape of
//! `examples/other_examples/cbf41bbd_roseforljh-openworld__src-proxy-inbound-tun_stack.rs.rs`'s
//! `TunTcpStream` (a channel-fed `AsyncRead`/`AsyncWrite` endpoint), but the
//! actual TCP/UDP state machine is the real `smoltcp` crate rather than
//! that file's hand-rolled one — "any byte-stream-accurate in-process
//! TCP/UDP implementation will do" per this component's contract, and
//! smoltcp is the ecosystem's answer to "small, embeddable netstack" the
//! way `rustls` is the answer to "TLS".

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant as StdInstant;

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, IpProtocol, Ipv4Packet, Ipv6Packet};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::core::device::TunDevice;
use crate::core::errors::CoreError;

const TCP_BACKLOG_HINT: usize = 2048;
const TCP_RX_BUF: usize = 256 * 1024;
const TCP_TX_BUF: usize = 256 * 1024;
const UDP_RX_BUF: usize = 64 * 1024;
const UDP_TX_BUF: usize = 64 * 1024;
const FLOW_CHANNEL_DEPTH: usize = 256;
const NEW_FLOW_BACKLOG: usize = 512;
const POLL_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_millis(20);

/// A newly observed TCP flow, handed to the dispatcher (§4.C) with its
/// original (pre-NAT) destination preserved so routing decisions see the
/// address the client actually dialed.
pub struct IncomingTcp {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub stream: NetTcpStream,
}

/// A newly observed UDP flow. Unlike TCP, "new" here means "first
/// datagram from a (src, dst) pair we have not seen" — the dispatcher
/// decides whether it is a DNS-tunnel candidate (dst port 53) or goes to
/// the UDP NAT manager.
pub struct IncomingUdp {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub stream: NetUdpStream,
}

/// Channel-backed virtual device feeding `smoltcp::iface::Interface`.
/// Frames from the TUN device's read loop arrive via `rx`; frames the
/// stack wants to transmit are sent out over `tx`.
struct ChannelDevice {
    mtu: usize,
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    rx_buf: VecDeque<Vec<u8>>,
}

impl ChannelDevice {
    fn new(mtu: usize, rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { mtu, rx, tx, rx_buf: VecDeque::new() }
    }

    fn drain_ready(&mut self) {
        while let Ok(pkt) = self.rx.try_recv() {
            self.rx_buf.push_back(pkt);
        }
    }
}

impl Device for ChannelDevice {
    type RxToken<'a> = ChannelRxToken;
    type TxToken<'a> = ChannelTxToken;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let pkt = self.rx_buf.pop_front()?;
        Some((ChannelRxToken { buf: pkt }, ChannelTxToken { tx: self.tx.clone() }))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(ChannelTxToken { tx: self.tx.clone() })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        // No Ethernet header; the TUN host already validates checksums,
        // so software checksumming stays on and offload stays off (§4.A).
        caps
    }
}

struct ChannelRxToken {
    buf: Vec<u8>,
}

impl RxToken for ChannelRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buf)
    }
}

struct ChannelTxToken {
    tx: mpsc::Sender<Vec<u8>>,
}

impl TxToken for ChannelTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        // Best-effort: a full channel means the TUN writer is behind;
        // dropping here is equivalent to a physical link dropping a frame
        // under backpressure, which TCP/UDP above already tolerate.
        let _ = self.tx.try_send(buf);
        result
    }
}

fn sock_addr(ip: IpAddress, port: u16) -> SocketAddr {
    match ip {
        IpAddress::Ipv4(v4) => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(v4.0)), port),
        IpAddress::Ipv6(v6) => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(v6.0)), port),
    }
}

fn to_ip_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(smoltcp::wire::Ipv4Address::from_bytes(&v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(smoltcp::wire::Ipv6Address::from_bytes(&v6.octets())),
    }
}

enum Cmd {
    Write(Vec<u8>),
    Shutdown,
}

/// A single TCP flow's endpoint, presented as `AsyncRead`/`AsyncWrite`.
/// Data crosses between this struct and the stack's poll loop through a
/// pair of channels, the same shape as the teacher-adjacent
/// `TunTcpStream` this is grounded on.
pub struct NetTcpStream {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Cmd>,
    read_buf: Vec<u8>,
    read_pos: usize,
    eof: bool,
}

impl AsyncRead for NetTcpStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.read_pos < self.read_buf.len() {
            let remaining = self.read_buf.len() - self.read_pos;
            let n = remaining.min(buf.remaining());
            let start = self.read_pos;
            buf.put_slice(&self.read_buf[start..start + n]);
            self.read_pos += n;
            if self.read_pos == self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                if data.is_empty() {
                    self.eof = true;
                    return Poll::Ready(Ok(()));
                }
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data;
                    self.read_pos = n;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for NetTcpStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let len = buf.len();
        match self.tx.try_send(Cmd::Write(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(mpsc::error::TrySendError::Full(_)) => Poll::Ready(Ok(0)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "netstack flow closed")))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let _ = self.tx.try_send(Cmd::Shutdown);
        Poll::Ready(Ok(()))
    }
}

/// A UDP flow's endpoint. One `NetUdpStream` corresponds to one (src,
/// dst) datagram pair as seen from the TUN side; the dispatcher or NAT
/// manager reads/writes whole datagrams through `recv`/`send`.
pub struct NetUdpStream {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Cmd>,
}

impl NetUdpStream {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub async fn send(&self, datagram: Vec<u8>) -> bool {
        self.tx.send(Cmd::Write(datagram)).await.is_ok()
    }

    /// Splits into an independent read half (fan-in: client datagrams
    /// arriving for this flow) and write half (fan-out: datagrams to
    /// deliver back to the client), so the two directions can be driven
    /// by different tasks without sharing `&mut self`.
    pub fn split(self) -> (NetUdpRx, NetUdpTx) {
        (NetUdpRx { rx: self.rx }, NetUdpTx { tx: self.tx })
    }
}

pub struct NetUdpRx {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl NetUdpRx {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

#[derive(Clone)]
pub struct NetUdpTx {
    tx: mpsc::Sender<Cmd>,
}

impl NetUdpTx {
    pub async fn send(&self, datagram: Vec<u8>) -> bool {
        self.tx.send(Cmd::Write(datagram)).await.is_ok()
    }
}

/// Server-side half of a flow's channel pair; lives in the driver task
/// and is pumped against the matching smoltcp socket each tick.
struct TcpFlowState {
    app_tx: mpsc::Sender<Vec<u8>>,
    app_rx: mpsc::Receiver<Cmd>,
    announced: bool,
    tuple: (SocketAddr, SocketAddr),
}

struct UdpFlowState {
    peer: SocketAddr,
    local: SocketAddr,
    app_tx: mpsc::Sender<Vec<u8>>,
    app_rx: mpsc::Receiver<Cmd>,
}

/// Owns the smoltcp interface and socket set via the background driver
/// task. Dropping `NetStack` drops the new-flow receivers, which the
/// driver notices via `is_closed()` and uses as its shutdown signal.
pub struct NetStack {
    new_tcp: mpsc::Receiver<IncomingTcp>,
    new_udp: mpsc::Receiver<IncomingUdp>,
    _driver: tokio::task::JoinHandle<()>,
}

impl NetStack {
    pub async fn accept_tcp(&mut self) -> Option<IncomingTcp> {
        self.new_tcp.recv().await
    }

    pub async fn accept_udp(&mut self) -> Option<IncomingUdp> {
        self.new_udp.recv().await
    }
}

/// Builds the stack over `device` and spawns its driving task.
/// Installs default IPv4 `0.0.0.0/0` and IPv6 `::/0` routes (§4.B) so
/// every in-TUN flow, regardless of which address the client targeted,
/// reaches the dispatcher.
pub fn spawn(device: Arc<TunDevice>) -> Result<NetStack, CoreError> {
    let mtu = device.mtu();
    let (dev_rx_tx, dev_rx_rx) = mpsc::channel::<Vec<u8>>(1024);
    let (dev_tx_tx, mut dev_tx_rx) = mpsc::channel::<Vec<u8>>(1024);
    device.spawn_read_loop(dev_rx_tx);

    {
        let device = device.clone();
        tokio::spawn(async move {
            while let Some(pkt) = dev_tx_rx.recv().await {
                if let Err(err) = device.write_packet(&pkt).await {
                    tracing::warn!(%err, "tun: write error");
                }
            }
        });
    }

    let mut virt = ChannelDevice::new(mtu, dev_rx_rx, dev_tx_tx);

    let config = Config::new(smoltcp::wire::HardwareAddress::Ip);
    let mut iface = Interface::new(config, &mut virt, SmolInstant::from(StdInstant::now()));
    iface.update_ip_addrs(|addrs| {
        let _ = addrs.push(IpCidr::new(IpAddress::v4(0, 0, 0, 0), 0));
        let _ = addrs.push(IpCidr::new(IpAddress::v6(0, 0, 0, 0, 0, 0, 0, 0), 0));
    });
    iface.routes_mut().add_default_ipv4_route(smoltcp::wire::Ipv4Address::UNSPECIFIED).ok();
    iface.routes_mut().add_default_ipv6_route(smoltcp::wire::Ipv6Address::UNSPECIFIED).ok();

    let sockets = SocketSet::new(Vec::new());

    let (new_tcp_tx, new_tcp_rx) = mpsc::channel(NEW_FLOW_BACKLOG);
    let (new_udp_tx, new_udp_rx) = mpsc::channel(NEW_FLOW_BACKLOG);

    let driver = tokio::spawn(drive(virt, iface, sockets, new_tcp_tx, new_udp_tx));

    Ok(NetStack { new_tcp: new_tcp_rx, new_udp: new_udp_rx, _driver: driver })
}

/// The single task owning the interface/socket-set and every per-flow
/// channel endpoint. All smoltcp calls happen on this task; app-facing
/// streams only ever touch channels, so there is no shared-mutable-state
/// synchronization to get wrong.
async fn drive(
    mut device: ChannelDevice,
    mut iface: Interface,
    mut sockets: SocketSet<'static>,
    new_tcp_tx: mpsc::Sender<IncomingTcp>,
    new_udp_tx: mpsc::Sender<IncomingUdp>,
) {
    let mut tcp_flows: HashMap<SocketHandle, TcpFlowState> = HashMap::new();
    let mut udp_flows: HashMap<SocketHandle, UdpFlowState> = HashMap::new();
    let mut known_tcp: HashMap<(SocketAddr, SocketAddr), SocketHandle> = HashMap::new();
    let mut known_udp: HashMap<(SocketAddr, SocketAddr), SocketHandle> = HashMap::new();

    let mut tick = tokio::time::interval(POLL_INTERVAL);

    loop {
        tick.tick().await;

        device.drain_ready();
        open_listeners_for_new_syns(&device, &mut sockets, &mut tcp_flows, &mut known_tcp);
        open_sockets_for_new_datagrams(&device, &mut iface, &mut sockets, &mut udp_flows, &mut known_udp, &new_udp_tx)
            .await;

        let now = SmolInstant::from(StdInstant::now());
        iface.poll(now, &mut device, &mut sockets);

        pump_tcp_flows(&mut sockets, &mut tcp_flows, &mut known_tcp, &new_tcp_tx).await;
        pump_udp_flows(&mut sockets, &mut udp_flows, &mut known_udp).await;

        if new_tcp_tx.is_closed() && new_udp_tx.is_closed() {
            return;
        }
    }
}

/// Before each poll, peek at queued raw IP packets for a TCP SYN whose
/// (src, dst) we have not seen, and if so, register a listening socket
/// for that exact destination so smoltcp's handshake state machine picks
/// the connection up on the next `poll()`. This is the standard technique
/// for terminating arbitrary TUN destinations with smoltcp, which only
/// matches incoming SYNs against sockets already listening on that exact
/// local endpoint.
fn open_listeners_for_new_syns(
    device: &ChannelDevice,
    sockets: &mut SocketSet<'static>,
    tcp_flows: &mut HashMap<SocketHandle, TcpFlowState>,
    known_tcp: &mut HashMap<(SocketAddr, SocketAddr), SocketHandle>,
) {
    for pkt in device.rx_buf.iter() {
        let Some((src, dst, is_syn)) = peek_tcp_syn(pkt) else { continue };
        if !is_syn || known_tcp.contains_key(&(src, dst)) {
            continue;
        }
        if tcp_flows.len() >= TCP_BACKLOG_HINT {
            tracing::warn!("netstack: tcp backlog full, dropping new SYN from {src}");
            continue;
        }

        let socket = tcp::Socket::new(tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUF]), tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUF]));
        let mut socket = socket;
        let listen_ep = IpListenEndpoint { addr: Some(to_ip_address(dst.ip())), port: dst.port() };
        if socket.listen(listen_ep).is_err() {
            continue;
        }

        let handle = sockets.add(socket);
        known_tcp.insert((src, dst), handle);

        let (app_tx, _app_rx_unused) = mpsc::channel::<Vec<u8>>(FLOW_CHANNEL_DEPTH);
        let (_cmd_tx_unused, app_rx) = mpsc::channel::<Cmd>(FLOW_CHANNEL_DEPTH);
        tcp_flows.insert(handle, TcpFlowState { app_tx, app_rx, announced: false, tuple: (src, dst) });
    }
}

/// Parses just enough of a raw IP frame to learn `(src, dst, is_syn)` for
/// TCP packets; returns `None` for anything else (UDP, ICMP, non-IP).
fn peek_tcp_syn(pkt: &[u8]) -> Option<(SocketAddr, SocketAddr, bool)> {
    if pkt.is_empty() {
        return None;
    }
    match pkt[0] >> 4 {
        4 => {
            let ipv4 = Ipv4Packet::new_checked(pkt).ok()?;
            if ipv4.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = smoltcp::wire::TcpPacket::new_checked(ipv4.payload()).ok()?;
            let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ipv4.src_addr().0)), tcp.src_port());
            let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ipv4.dst_addr().0)), tcp.dst_port());
            Some((src, dst, tcp.syn() && !tcp.ack()))
        }
        6 => {
            let ipv6 = Ipv6Packet::new_checked(pkt).ok()?;
            if ipv6.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = smoltcp::wire::TcpPacket::new_checked(ipv6.payload()).ok()?;
            let src = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ipv6.src_addr().0)), tcp.src_port());
            let dst = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ipv6.dst_addr().0)), tcp.dst_port());
            Some((src, dst, tcp.syn() && !tcp.ack()))
        }
        _ => None,
    }
}

/// Peeks queued raw UDP packets for a (src, dst) pair without an open
/// smoltcp UDP socket, and if found, opens one bound to the exact
/// destination so the reply path can reach it.
async fn open_sockets_for_new_datagrams(
    device: &ChannelDevice,
    _iface: &mut Interface,
    sockets: &mut SocketSet<'static>,
    udp_flows: &mut HashMap<SocketHandle, UdpFlowState>,
    known_udp: &mut HashMap<(SocketAddr, SocketAddr), SocketHandle>,
    new_udp_tx: &mpsc::Sender<IncomingUdp>,
) {
    for pkt in device.rx_buf.iter() {
        let Some((src, dst)) = peek_udp(pkt) else { continue };
        if known_udp.contains_key(&(src, dst)) {
            continue;
        }

        let socket = udp::Socket::new(
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 64], vec![0u8; UDP_RX_BUF]),
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 64], vec![0u8; UDP_TX_BUF]),
        );
        let mut socket = socket;
        let bind_ep = IpListenEndpoint { addr: Some(to_ip_address(dst.ip())), port: dst.port() };
        if socket.bind(bind_ep).is_err() {
            continue;
        }

        let handle = sockets.add(socket);
        known_udp.insert((src, dst), handle);

        let (stack_to_app_tx, stack_to_app_rx) = mpsc::channel::<Vec<u8>>(FLOW_CHANNEL_DEPTH);
        let (app_to_stack_tx, app_to_stack_rx) = mpsc::channel::<Cmd>(FLOW_CHANNEL_DEPTH);
        udp_flows.insert(handle, UdpFlowState { peer: src, local: dst, app_tx: stack_to_app_tx, app_rx: app_to_stack_rx });

        let incoming = IncomingUdp {
            local_addr: dst,
            peer_addr: src,
            stream: NetUdpStream { rx: stack_to_app_rx, tx: app_to_stack_tx },
        };
        if new_udp_tx.try_send(incoming).is_err() {
            udp_flows.remove(&handle);
            known_udp.remove(&(src, dst));
            sockets.remove(handle);
        }
    }
}

fn peek_udp(pkt: &[u8]) -> Option<(SocketAddr, SocketAddr)> {
    if pkt.is_empty() {
        return None;
    }
    match pkt[0] >> 4 {
        4 => {
            let ipv4 = Ipv4Packet::new_checked(pkt).ok()?;
            if ipv4.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = smoltcp::wire::UdpPacket::new_checked(ipv4.payload()).ok()?;
            let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ipv4.src_addr().0)), udp.src_port());
            let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ipv4.dst_addr().0)), udp.dst_port());
            Some((src, dst))
        }
        6 => {
            let ipv6 = Ipv6Packet::new_checked(pkt).ok()?;
            if ipv6.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = smoltcp::wire::UdpPacket::new_checked(ipv6.payload()).ok()?;
            let src = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ipv6.src_addr().0)), udp.src_port());
            let dst = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ipv6.dst_addr().0)), udp.dst_port());
            Some((src, dst))
        }
        _ => None,
    }
}

async fn pump_tcp_flows(
    sockets: &mut SocketSet<'static>,
    tcp_flows: &mut HashMap<SocketHandle, TcpFlowState>,
    known_tcp: &mut HashMap<(SocketAddr, SocketAddr), SocketHandle>,
    new_tcp_tx: &mpsc::Sender<IncomingTcp>,
) {
    let mut to_remove = Vec::new();
    for (&handle, state) in tcp_flows.iter_mut() {
        let socket = sockets.get_mut::<tcp::Socket>(handle);

        if !state.announced && socket.state() == tcp::State::Established {
            state.announced = true;
            let (src, dst) = state.tuple;
            let (stack_to_app_tx, stack_to_app_rx) = mpsc::channel::<Vec<u8>>(FLOW_CHANNEL_DEPTH);
            let (app_to_stack_tx, app_to_stack_rx) = mpsc::channel::<Cmd>(FLOW_CHANNEL_DEPTH);
            state.app_tx = stack_to_app_tx;
            state.app_rx = app_to_stack_rx;

            let incoming = IncomingTcp {
                local_addr: dst,
                peer_addr: src,
                stream: NetTcpStream { rx: stack_to_app_rx, tx: app_to_stack_tx, read_buf: Vec::new(), read_pos: 0, eof: false },
            };
            if new_tcp_tx.try_send(incoming).is_err() {
                socket.abort();
                to_remove.push(handle);
                continue;
            }
        }

        if socket.may_send() {
            while let Ok(cmd) = state.app_rx.try_recv() {
                match cmd {
                    Cmd::Write(data) => {
                        let _ = socket.send_slice(&data);
                    }
                    Cmd::Shutdown => socket.close(),
                }
            }
        }

        if socket.can_recv() {
            let mut buf = vec![0u8; 16 * 1024];
            if let Ok(n) = socket.recv_slice(&mut buf) {
                if n > 0 {
                    let _ = state.app_tx.try_send(buf[..n].to_vec());
                }
            }
        }

        if socket.state() == tcp::State::CloseWait && !socket.may_send() {
            socket.close();
        }

        if !socket.is_open() {
            let _ = state.app_tx.try_send(Vec::new());
            to_remove.push(handle);
        }
    }
    for handle in to_remove {
        if let Some(state) = tcp_flows.remove(&handle) {
            known_tcp.remove(&state.tuple);
        }
        sockets.remove(handle);
    }
}

async fn pump_udp_flows(
    sockets: &mut SocketSet<'static>,
    udp_flows: &mut HashMap<SocketHandle, UdpFlowState>,
    known_udp: &mut HashMap<(SocketAddr, SocketAddr), SocketHandle>,
) {
    let mut to_remove = Vec::new();
    for (&handle, state) in udp_flows.iter_mut() {
        let socket = sockets.get_mut::<udp::Socket>(handle);

        while let Ok(cmd) = state.app_rx.try_recv() {
            match cmd {
                Cmd::Write(data) => {
                    let endpoint = IpEndpoint::new(to_ip_address(state.peer.ip()), state.peer.port());
                    let _ = socket.send_slice(&data, endpoint);
                }
                Cmd::Shutdown => to_remove.push(handle),
            }
        }

        while socket.can_recv() {
            match socket.recv() {
                Ok((data, _meta)) => {
                    if state.app_tx.try_send(data.to_vec()).is_err() {
                        to_remove.push(handle);
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        if state.app_tx.is_closed() {
            to_remove.push(handle);
        }
    }
    for handle in to_remove {
        if let Some(state) = udp_flows.remove(&handle) {
            known_udp.remove(&(state.peer, state.local));
        }
        sockets.remove(handle);
    }
}
