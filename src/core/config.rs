use serde::Deserialize;

use crate::core::errors::CoreError;

/// Default noise length used when `settings.noise` is `true` rather than
/// an explicit byte count.
const DEFAULT_NOISE_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Mandala,
    Trojan,
    Vless,
    Shadowsocks,
    Socks5,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub server_name: String,
    pub insecure: bool,
    pub enable_ech: bool,
    pub ech_doh_url: String,
    pub ech_public_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub headers: std::collections::HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: "tcp".to_string(),
            path: "/".to_string(),
            headers: Default::default(),
        }
    }
}

impl TransportConfig {
    pub fn is_websocket(&self) -> bool {
        self.kind.eq_ignore_ascii_case("ws")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SettingsConfig {
    fragment: bool,
    noise: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawNodeConfig {
    #[serde(default)]
    tag: String,
    #[serde(rename = "type")]
    kind: ProtocolType,
    server: String,
    server_port: u16,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default)]
    settings: SettingsConfig,
    #[serde(default)]
    local_port: u16,
}

/// Fully resolved node configuration. Built once at parse time so every
/// call site sees consistent, already-normalized fields instead of
/// re-deriving the uuid/username alias or the noise byte count each time.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub tag: String,
    pub kind: ProtocolType,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub password: String,
    username: String,
    pub tls: TlsConfig,
    pub transport: TransportConfig,
    pub fragment: bool,
    pub noise_bytes: usize,
    pub local_port: u16,
}

impl NodeConfig {
    pub fn parse(config_json: &str) -> Result<Self, CoreError> {
        let raw: RawNodeConfig =
            serde_json::from_str(config_json).map_err(|e| CoreError::config(format!("parse: {e}")))?;

        if raw.server.trim().is_empty() {
            return Err(CoreError::config("server must not be empty"));
        }
        if raw.server_port == 0 {
            return Err(CoreError::config("server_port must not be zero"));
        }

        let mut tls = raw.tls;
        if tls.server_name.trim().is_empty() {
            tls.server_name = raw.server.clone();
        }
        if tls.ech_public_name.trim().is_empty() {
            tls.ech_public_name = tls.server_name.clone();
        }

        // §3 invariant: for shadowsocks/socks5, an empty `username` aliases `uuid`.
        let username = if raw.username.trim().is_empty()
            && matches!(raw.kind, ProtocolType::Shadowsocks | ProtocolType::Socks5)
            && !raw.uuid.trim().is_empty()
        {
            raw.uuid.clone()
        } else {
            raw.username
        };

        let noise_bytes = match raw.settings.noise {
            None => 0,
            Some(serde_json::Value::Bool(b)) => {
                if b {
                    DEFAULT_NOISE_BYTES
                } else {
                    0
                }
            }
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| CoreError::config("settings.noise: not a valid byte count"))?
                as usize,
            Some(_) => return Err(CoreError::config("settings.noise: must be a bool or integer")),
        };

        Ok(Self {
            tag: raw.tag,
            kind: raw.kind,
            server: raw.server,
            server_port: raw.server_port,
            uuid: raw.uuid,
            password: raw.password,
            username,
            tls,
            transport: raw.transport,
            fragment: raw.settings.fragment,
            noise_bytes,
            local_port: raw.local_port,
        })
    }

    /// The username to present for protocols that need one (SOCKS5,
    /// Shadowsocks), after the uuid alias has been applied.
    pub fn effective_username(&self) -> &str {
        &self.username
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_uuid_to_username_for_socks5() {
        let cfg = NodeConfig::parse(
            r#"{"type":"socks5","server":"sx.example","server_port":1080,"uuid":"alice","password":"pw"}"#,
        )
        .unwrap();
        assert_eq!(cfg.effective_username(), "alice");
    }

    #[test]
    fn does_not_alias_for_vless() {
        let cfg = NodeConfig::parse(
            r#"{"type":"vless","server":"s.example","server_port":443,"uuid":"11111111-2222-3333-4444-555555555555"}"#,
        )
        .unwrap();
        assert_eq!(cfg.effective_username(), "");
    }

    #[test]
    fn tls_server_name_defaults_to_server() {
        let cfg = NodeConfig::parse(
            r#"{"type":"trojan","server":"t.example","server_port":443,"password":"secret","tls":{"enabled":true}}"#,
        )
        .unwrap();
        assert_eq!(cfg.tls.server_name, "t.example");
    }

    #[test]
    fn noise_bool_true_uses_default_count() {
        let cfg = NodeConfig::parse(
            r#"{"type":"mandala","server":"m.example","server_port":443,"password":"p","settings":{"noise":true}}"#,
        )
        .unwrap();
        assert_eq!(cfg.noise_bytes, DEFAULT_NOISE_BYTES);
    }

    #[test]
    fn noise_integer_is_exact_count() {
        let cfg = NodeConfig::parse(
            r#"{"type":"mandala","server":"m.example","server_port":443,"password":"p","settings":{"noise":12}}"#,
        )
        .unwrap();
        assert_eq!(cfg.noise_bytes, 12);
    }

    #[test]
    fn rejects_unknown_type() {
        let err = NodeConfig::parse(r#"{"type":"bogus","server":"s","server_port":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let err = NodeConfig::parse(r#"{"type":"trojan","server":"s","server_port":0,"password":"p"}"#);
        assert!(err.is_err());
    }
}
