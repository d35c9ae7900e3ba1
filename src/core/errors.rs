use std::fmt;

/// Crate-wide error taxonomy.
///
/// Unlike most modules in this crate, which keep their own small
/// `thiserror` enum, this one spans every component: `start_vpn`'s return
/// string is itself a cross-cutting contract the host observes, so the
/// taxonomy has to be a single closed set.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("config: {0}")]
    Config(String),

    #[error("device: {0}")]
    Device(String),

    #[error("stack: {0}")]
    Stack(String),

    #[error("dial: {0}")]
    Dial(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("dns: {0}")]
    Dns(String),

    #[error("timeout: {0}")]
    SessionTimeout(String),
}

impl CoreError {
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn device(msg: impl fmt::Display) -> Self {
        Self::Device(msg.to_string())
    }

    pub fn stack(msg: impl fmt::Display) -> Self {
        Self::Stack(msg.to_string())
    }

    pub fn tls(msg: impl fmt::Display) -> Self {
        Self::Tls(msg.to_string())
    }

    pub fn transport(msg: impl fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    pub fn auth(msg: impl fmt::Display) -> Self {
        Self::Auth(msg.to_string())
    }

    pub fn dns(msg: impl fmt::Display) -> Self {
        Self::Dns(msg.to_string())
    }

    pub fn timeout(msg: impl fmt::Display) -> Self {
        Self::SessionTimeout(msg.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
