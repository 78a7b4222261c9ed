use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::config::types::TlsLayerConfig;

use super::TunnelLayer;

/// allow_insecure 时使用：不校验证书链和主机名，握手签名照常校验
#[derive(Debug)]
struct SkipChainVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for SkipChainVerifier {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn client_config(cfg: &TlsLayerConfig) -> Result<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("TLS config error: {}", e))?;

    let mut config = if cfg.allow_insecure {
        let verifier = SkipChainVerifier {
            algorithms: provider.signature_verification_algorithms,
        };
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = cfg
        .alpn
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.as_bytes().to_vec())
        .collect();
    Ok(config)
}

/// TLS 隧道层
///
/// SNI 取值顺序：front_domain（域前置）> server_name > 目标主机名。
pub struct TlsLayer {
    tls_config: Arc<ClientConfig>,
    server_name: Option<String>,
    front_domain: Option<String>,
}

impl TlsLayer {
    pub fn from_config(cfg: &TlsLayerConfig) -> Result<Self> {
        Ok(Self {
            tls_config: Arc::new(client_config(cfg)?),
            server_name: cfg.server_name.clone().filter(|s| !s.is_empty()),
            front_domain: cfg.front_domain.clone().filter(|s| !s.is_empty()),
        })
    }

    pub fn sni_for(&self, target: &Address) -> String {
        self.front_domain
            .clone()
            .or_else(|| self.server_name.clone())
            .unwrap_or_else(|| target.host())
    }
}

#[async_trait]
impl TunnelLayer for TlsLayer {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn wrap(&self, stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        let sni = self.sni_for(target);
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|e| anyhow!("invalid SNI '{}': {}", sni, e))?;
        let connector = tokio_rustls::TlsConnector::from(self.tls_config.clone());
        let tls_stream = connector.connect(server_name, stream).await?;

        debug!(sni = %sni, fronted = self.front_domain.is_some(), "TLS handshake completed");
        Ok(Box::new(tls_stream))
    }
}
