//! UDP NAT manager (§4.H, P4): single-flight session creation keyed by
//! the inbound 5-tuple, fan-in/fan-out pumping, and idle GC.
//!
//! Grounded on two patterns from `src/prism/proxy.rs`: the
//! `InFlight`/`StatusCache::get_or_load` single-flight-with-cache shape
//! (already reused verbatim in `ech.rs`) for `get_or_create`, and
//! `UdpSession`/`udp_session_loop`/`udp_sweep_loop` for the per-key
//! session record, its fan-out reader task, and the periodic idle sweep.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};

use crate::core::config::NodeConfig;
use crate::core::dialer::{self, BoxedConn};
use crate::core::errors::CoreError;
use crate::core::netstack::NetUdpTx;
use crate::core::proto;

const SINGLE_FLIGHT_WAIT: Duration = Duration::from_secs(5);
const FANOUT_READ_DEADLINE: Duration = Duration::from_secs(60);
const IDLE_THRESHOLD: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(20);
const DATAGRAM_BUF: usize = 64 * 1024;

struct InFlight {
    done: AtomicBool,
    notify: Notify,
    result: Mutex<Option<Result<Arc<UdpSession>, String>>>,
}

impl InFlight {
    fn new() -> Self {
        Self { done: AtomicBool::new(false), notify: Notify::new(), result: Mutex::new(None) }
    }

    fn finish(&self, result: Result<Arc<UdpSession>, String>) {
        *self.result.lock().expect("udpnat inflight lock poisoned") = Some(result);
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> Result<Arc<UdpSession>, String> {
        loop {
            if self.done.load(Ordering::Acquire) {
                return self.result.lock().expect("udpnat inflight lock poisoned").clone().expect("result set");
            }
            self.notify.notified().await;
        }
    }
}

/// One established UDP flow's outbound half. `last_active` is updated on
/// every fan-in/fan-out datagram and read by the sweeper.
///
/// The read and write halves are split via `tokio::io::split` and kept
/// behind *independent* `tokio::sync::Mutex`es (not one shared mutex over
/// the whole `BoxedConn`): the fan-out reader parks on a read behind its
/// lock for up to `FANOUT_READ_DEADLINE` (60s), and if fan-in (`send`)
/// shared that same lock, every inbound datagram would block for as long
/// as the reader is waiting on the server — serializing the two
/// directions against §5's "no task may block a peer's progress". A
/// `tokio::sync::Mutex` rather than `std::sync::Mutex` is still needed on
/// each half individually, since both guards are held across an `.await`.
pub struct UdpSession {
    read_half: tokio::sync::Mutex<ReadHalf<BoxedConn>>,
    write_half: tokio::sync::Mutex<WriteHalf<BoxedConn>>,
    last_active_epoch_ms: AtomicI64,
}

impl UdpSession {
    fn touch(&self, now_epoch_ms: i64) {
        self.last_active_epoch_ms.store(now_epoch_ms, Ordering::Relaxed);
    }

    /// Writes one inbound datagram to the outbound stream (§4.H
    /// "Fan-in"). No length prefix: the proxy protocols in use either
    /// carry their own framing or are used best-effort.
    pub async fn send(&self, datagram: &[u8]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.write_half.lock().await;
        guard.write_all(datagram).await?;
        self.touch(now_epoch_ms());
        Ok(())
    }
}

struct Entry {
    session: Option<Arc<InFlight>>,
    ready: Option<Arc<UdpSession>>,
}

/// Concurrent-map keyed by the inbound 5-tuple. `dashmap` gives
/// independent per-key locking so one flow's construction never blocks
/// another's, mirroring the teacher's `DashMap`-backed session table.
pub struct UdpNatManager {
    table: dashmap::DashMap<String, Entry>,
    _sweeper: tokio::task::JoinHandle<()>,
}

impl UdpNatManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let weak = weak.clone();
            let sweeper = tokio::spawn(async move {
                let mut tick = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tick.tick().await;
                    let Some(manager) = weak.upgrade() else { return };
                    manager.sweep(now_epoch_ms());
                }
            });
            Self { table: dashmap::DashMap::new(), _sweeper: sweeper }
        })
    }

    /// `get_or_create` (§4.H): single-flight by `key`, bounded wait for
    /// non-owning callers, construction = dial + multiplexer handshake
    /// for `(dst_host, dst_port)`.
    pub async fn get_or_create(
        self: &Arc<Self>,
        key: &str,
        cfg: &NodeConfig,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Arc<UdpSession>, CoreError> {
        if let Some(entry) = self.table.get(key) {
            if let Some(ready) = &entry.ready {
                return Ok(ready.clone());
            }
        }

        let (inflight, is_owner) = {
            let mut entry = self.table.entry(key.to_string()).or_insert_with(|| Entry { session: None, ready: None });
            if let Some(ready) = &entry.ready {
                return Ok(ready.clone());
            }
            if let Some(existing) = &entry.session {
                (existing.clone(), false)
            } else {
                let fresh = Arc::new(InFlight::new());
                entry.session = Some(fresh.clone());
                (fresh, true)
            }
        };

        if is_owner {
            let outcome = construct(cfg, dst_host, dst_port).await;
            let broadcast = match &outcome {
                Ok(session) => {
                    if let Some(mut entry) = self.table.get_mut(key) {
                        entry.ready = Some(session.clone());
                        entry.session = None;
                    }
                    Ok(session.clone())
                }
                Err(err) => {
                    self.table.remove(key);
                    Err(err.to_string())
                }
            };
            inflight.finish(broadcast);
            outcome
        } else {
            match timeout(SINGLE_FLIGHT_WAIT, inflight.wait()).await {
                Ok(Ok(session)) => Ok(session),
                Ok(Err(msg)) => Err(CoreError::transport(msg)),
                Err(_) => Err(CoreError::timeout("udp nat single-flight wait")),
            }
        }
    }

    /// Spawns the fan-out reader (§4.H "Fan-out"): reads from the
    /// session's `read_half` and writes each chunk back to the client via
    /// `inbound_tx`, until a 60s read deadline elapses or the outbound
    /// closes, at which point the entry is destroyed. Fan-in (client →
    /// outbound) is driven by the caller directly against
    /// `session.send()` against the independent `write_half`, so neither
    /// direction ever waits on the other's lock.
    pub fn spawn_fanout(self: &Arc<Self>, key: String, session: Arc<UdpSession>, inbound_tx: NetUdpTx) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let mut buf = vec![0u8; DATAGRAM_BUF];
                let read = {
                    use tokio::io::AsyncReadExt;
                    let mut guard = session.read_half.lock().await;
                    timeout(FANOUT_READ_DEADLINE, guard.read(&mut buf)).await
                };
                match read {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => {
                        session.touch(now_epoch_ms());
                        if !inbound_tx.send(buf[..n].to_vec()).await {
                            break;
                        }
                    }
                    Ok(Err(_)) => break,
                }
            }
            manager.table.remove(&key);
        });
    }

    fn sweep(&self, now_epoch_ms: i64) {
        let threshold_ms = IDLE_THRESHOLD.as_millis() as i64;
        self.table.retain(|_key, entry| match &entry.ready {
            None => true, // still initializing; will GC itself
            Some(session) => now_epoch_ms - session.last_active_epoch_ms.load(Ordering::Relaxed) < threshold_ms,
        });
    }
}

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn construct(cfg: &NodeConfig, dst_host: &str, dst_port: u16) -> Result<Arc<UdpSession>, CoreError> {
    let conn = dialer::dial(cfg).await?;
    let conn = proto::handshake(cfg, conn, dst_host, dst_port).await?;
    let (read_half, write_half) = tokio::io::split(conn);
    Ok(Arc::new(UdpSession {
        read_half: tokio::sync::Mutex::new(read_half),
        write_half: tokio::sync::Mutex::new(write_half),
        last_active_epoch_ms: AtomicI64::new(now_epoch_ms()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_get_or_create_calls_share_one_construction_error() {
        let manager = UdpNatManager::new();
        let cfg = NodeConfig::parse(
            r#"{"type":"trojan","server":"127.0.0.1","server_port":1,"password":"p"}"#,
        )
        .unwrap();

        let m1 = manager.clone();
        let cfg1 = cfg.clone();
        let t1 = tokio::spawn(async move { m1.get_or_create("k", &cfg1, "example.com", 80).await });
        let m2 = manager.clone();
        let cfg2 = cfg.clone();
        let t2 = tokio::spawn(async move { m2.get_or_create("k", &cfg2, "example.com", 80).await });

        let (r1, r2) = tokio::join!(t1, t2);
        assert!(r1.unwrap().is_err());
        assert!(r2.unwrap().is_err());
        assert!(!manager.table.contains_key("k"));
    }
}
