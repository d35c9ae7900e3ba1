use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::core::errors::CoreError;

/// Wraps a host-provided, already-open, non-blocking TUN file descriptor
/// (§4.A). The fd is owned by the host platform (JNI on Android, a
/// `NEPacketTunnelProvider` on iOS); this adapter never creates or
/// configures the interface itself, only reads and writes whole IP
/// frames on it.
///
/// Grounded on
/// `examples/other_examples/a712f22a_AyaanArshad0-ghost_tunnel__src-main.rs.rs`'s
/// split reader/writer loop shape, adapted from `tun::create_as_async`
/// (which creates its own device) to `std::os::fd::{FromRawFd, OwnedFd}` +
/// `tokio::io::unix::AsyncFd` (which wraps a foreign fd without attempting
/// to configure it).
pub struct TunDevice {
    mtu: usize,
    fd: Arc<AsyncFd<OwnedFd>>,
}

impl TunDevice {
    /// # Safety-relevant precondition
    /// `raw_fd` must be a valid, currently-open file descriptor the host
    /// has already put in non-blocking mode and will not close itself
    /// until after `stop()`/`Drop` — ownership transfers here for the
    /// adapter's lifetime but the host retains the right to close its own
    /// copy once (P1: the core must not double-close).
    pub fn from_raw_fd(raw_fd: RawFd, mtu: usize) -> Result<Self, CoreError> {
        if !(576..=65535).contains(&mtu) {
            return Err(CoreError::device(format!("mtu {mtu} out of range [576, 65535]")));
        }

        // SAFETY: caller contract above; `raw_fd` is host-owned and valid.
        let owned = unsafe { OwnedFd::from_raw_fd(raw_fd) };
        set_nonblocking(&owned).map_err(|e| CoreError::device(format!("set nonblocking: {e}")))?;

        let fd = AsyncFd::new(owned).map_err(|e| CoreError::device(format!("register fd: {e}")))?;

        Ok(Self { mtu, fd: Arc::new(fd) })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Reads exactly one IP packet. No framing is added or expected; each
    /// successful `read(2)` on a TUN fd is already one complete packet.
    pub async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| read_raw(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Writes the exact byte slice back to the fd (§4.A: "delivers the
    /// exact byte slice to the fd").
    pub async fn write_packet(&self, buf: &[u8]) -> std::io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| write_raw(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Spawns the background read loop, forwarding each packet to `tx`.
    /// The loop exits when `tx` has no more receivers (the stack shut
    /// down) or the fd reports a hard error.
    pub fn spawn_read_loop(self: &Arc<Self>, tx: mpsc::Sender<Vec<u8>>) -> tokio::task::JoinHandle<()> {
        let dev = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; dev.mtu];
            loop {
                match dev.read_packet(&mut buf).await {
                    Ok(0) => continue,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "tun: read error, stopping read loop");
                        return;
                    }
                }
            }
        })
    }

    /// Closes the adapter's copy of the fd exactly once (P1). The
    /// underlying `OwnedFd`'s `Drop` impl performs the actual `close(2)`;
    /// calling this (rather than relying solely on `Drop`) makes the
    /// single-close guarantee observable at the call site during `stop()`.
    pub fn close(self) {
        // `Arc<AsyncFd<OwnedFd>>` drops here; if other clones are still
        // held (e.g. a lingering read-loop task), the fd closes only once
        // the last one is dropped — never twice, and never before every
        // consumer is done with it.
        drop(self.fd);
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid fd for the lifetime of this call.
    unsafe {
        let flags = libc_fcntl(raw, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc_fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

unsafe fn libc_fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> libc::c_int {
    unsafe { libc::fcntl(fd, cmd, arg) }
}

fn read_raw(raw_fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(raw_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_raw(raw_fd: RawFd, buf: &[u8]) -> std::io::Result<()> {
    let n = unsafe { libc::write(raw_fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if n as usize != buf.len() {
        return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "short write to tun fd"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mtu_below_minimum() {
        let err = TunDevice::from_raw_fd(-1, 100);
        assert!(matches!(err, Err(CoreError::Device(_))));
    }

    #[test]
    fn rejects_mtu_above_maximum() {
        let err = TunDevice::from_raw_fd(-1, 70000);
        assert!(matches!(err, Err(CoreError::Device(_))));
    }
}
