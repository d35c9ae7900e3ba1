//! Crate root: the four/five FFI entry points a mobile host (Android JNI,
//! iOS `NEPacketTunnelProvider`) calls into (§6). Everything else lives
//! under `core`.

pub mod core;

use std::os::fd::RawFd;

use crate::core::logging::LogCallback;

/// Starts a TUN-backed VPN core over `tun_fd` (a platform-owned,
/// non-blocking file descriptor) with the given `mtu` and node
/// configuration JSON. Stops any already-running instance first.
/// Returns `""` on success, an error string otherwise.
pub fn start_vpn(tun_fd: RawFd, mtu: i32, config_json: &str) -> String {
    core::instance::start_vpn(tun_fd, mtu, config_json)
}

/// Starts a standalone local SOCKS/HTTP inbound on `127.0.0.1:local_port`
/// with no TUN device. Stops any already-running instance first. Returns
/// `""` on success, an error string otherwise.
pub fn start(local_port: u16, config_json: &str) -> String {
    core::instance::start(local_port, config_json)
}

/// Stops the running instance, if any. Idempotent.
pub fn stop() {
    core::instance::stop()
}

/// Reports whether a core instance is currently running.
pub fn is_running() -> bool {
    core::instance::is_running()
}

/// Registers (or clears, with `None`) the host log callback invoked with
/// each formatted log line.
pub fn set_log_callback(cb: Option<LogCallback>) {
    core::logging::set_log_callback(cb)
}
