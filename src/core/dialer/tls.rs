use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::core::config::NodeConfig;
use crate::core::dialer::BoxedConn;
use crate::core::ech;
use crate::core::errors::CoreError;

/// Cipher suites in the order Chrome/BoringSSL advertises them, to the
/// extent `rustls`'s own supported-suite set overlaps. This is the
/// fidelity tradeoff recorded in DESIGN.md: true uTLS mimicry (exact
/// extension order, GREASE values) would require a BoringSSL-backed stack
/// (`wreq`/`tokio_boring2`); staying on `rustls` keeps the crate's
/// dependency stack aligned with the teacher at the cost of byte-exact
/// ClientHello equivalence.
fn browser_like_suites() -> Vec<rustls::SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite::*;
    vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Resolves and validates the ECH config list for `cfg` (§4.D.4), or
/// `None` if ECH is disabled, resolution failed, or the returned bytes
/// do not parse as a config the provider accepts. A `None` here always
/// means "proceed without ECH", never a hard failure (§4.D: "On failure,
/// log a warning and proceed without ECH").
async fn resolve_ech(cfg: &NodeConfig) -> Option<rustls::client::EchConfig> {
    if !cfg.tls.enable_ech {
        return None;
    }

    let config_list = match ech::resolve(&cfg.tls.ech_doh_url, &cfg.tls.ech_public_name).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(%err, "ech: resolution failed, proceeding without ECH");
            return None;
        }
    };

    match rustls::client::EchConfig::new((*config_list).clone().into(), rustls::crypto::aws_lc_rs::hpke::ALL_SUITES) {
        Ok(ech) => Some(ech),
        Err(err) => {
            tracing::warn!(%err, "ech: config list rejected, proceeding without ECH");
            None
        }
    }
}

/// Wraps `conn` in a fingerprinted TLS client connection (§4.D.3/4.D.4),
/// resolving ECH via (E) first when requested.
pub async fn wrap(cfg: &NodeConfig, conn: BoxedConn) -> Result<BoxedConn, CoreError> {
    let ech_config = resolve_ech(cfg).await;

    // ECH needs an HPKE-capable `CryptoProvider`; `ring` (used for the
    // plain path below) does not implement HPKE, so the injected path
    // switches to `aws-lc-rs`, which does. `ClientConfig::with_ech`
    // also forces TLS 1.3-only, matching §4.D.4's "force min_version =
    // TLS 1.3" on successful injection.
    let builder = if let Some(ech_config) = ech_config {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        ClientConfig::builder_with_provider(provider)
            .with_ech(rustls::client::EchMode::Enable(ech_config))
            .map_err(|e| CoreError::tls(format!("ech: {e}")))?
    } else {
        let provider = Arc::new(rustls::crypto::CryptoProvider {
            cipher_suites: browser_like_suites(),
            ..rustls::crypto::ring::default_provider()
        });
        ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| CoreError::tls(format!("protocol versions: {e}")))?
    };

    let mut client_config = if cfg.tls.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    let alpn = if cfg.transport.is_websocket() {
        vec![b"http/1.1".to_vec()]
    } else {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    };
    client_config.alpn_protocols = alpn;

    let server_name = ServerName::try_from(cfg.tls.server_name.clone())
        .map_err(|e| CoreError::tls(format!("invalid server name: {e}")))?;

    let connector = TlsConnector::from(Arc::new(client_config));
    let stream = connector
        .connect(server_name, conn)
        .await
        .map_err(|e| CoreError::tls(format!("handshake: {e}")))?;

    Ok(Box::new(stream))
}
