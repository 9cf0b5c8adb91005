//! TLS contexts and peer certificate classification.
//!
//! Both directions complete the handshake with any certificate the peer
//! presents (or none) as long as the handshake signatures check out. Trust
//! is decided afterwards by [`TlsContext::classify`], which feeds the
//! authentication stages: a self-signed or untrusted certificate is still
//! good enough for SASL EXTERNAL, but only a chain to our anchors lets a
//! peer skip dialback.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::connection::CertCheckResult;
use crate::error::S2sError;

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    install_crypto_provider();
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Accepts any presented chain; signatures are still verified.
#[derive(Debug)]
struct AnyPeerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl AnyPeerCert {
    fn tls12(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algs = &self.provider.signature_verification_algorithms;
        rustls::crypto::verify_tls12_signature(message, cert, dss, algs)
    }

    fn tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algs = &self.provider.signature_verification_algorithms;
        rustls::crypto::verify_tls13_signature(message, cert, dss, algs)
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl ServerCertVerifier for AnyPeerCert {
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
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

impl ClientCertVerifier for AnyPeerCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

/// Acceptor, connector and trust anchors for one server identity.
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    verifier: Arc<WebPkiServerVerifier>,
}

impl TlsContext {
    pub fn load(cert_path: &str, key_path: &str, ca_path: Option<&str>) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("Failed to read TLS key: {key_path}"))?;
        let ca_pem = ca_path
            .map(|p| std::fs::read(p).with_context(|| format!("Failed to read TLS CA: {p}")))
            .transpose()?;
        Self::from_pem(&cert_pem, &key_pem, ca_pem.as_deref())
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: Option<&[u8]>) -> Result<Self> {
        let provider = provider();
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse TLS certificates")?;
        anyhow::ensure!(!certs.is_empty(), "No certificate found in PEM file");
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("Failed to parse TLS private key")?
            .context("No private key found in PEM file")?;

        let mut roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_pem) = ca_pem {
            for ca in rustls_pemfile::certs(&mut &ca_pem[..]) {
                roots
                    .add(ca.context("Failed to parse TLS CA certificate")?)
                    .context("Unusable TLS CA certificate")?;
            }
        }
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .context("Failed to build certificate verifier")?;

        let any = Arc::new(AnyPeerCert {
            provider: provider.clone(),
        });
        let server = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("Invalid TLS protocol configuration")?
            .with_client_cert_verifier(any.clone())
            .with_single_cert(certs.clone(), key.clone_key())
            .context("Invalid TLS configuration")?;
        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("Invalid TLS protocol configuration")?
            .dangerous()
            .with_custom_certificate_verifier(any)
            .with_client_auth_cert(certs, key)
            .context("Invalid TLS client configuration")?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
            verifier,
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    /// Trust classification of a peer chain claimed for `domain`.
    pub fn classify(&self, chain: &[CertificateDer<'_>], domain: Option<&str>) -> CertCheckResult {
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return CertCheckResult::Missing;
        };
        let Ok((_, cert)) = X509Certificate::from_der(end_entity.as_ref()) else {
            return CertCheckResult::Invalid;
        };
        if !cert.validity().is_valid() {
            return CertCheckResult::Invalid;
        }
        let self_signed = cert.issuer().as_raw() == cert.subject().as_raw();

        let Some(name) = domain.and_then(|d| ServerName::try_from(d.to_string()).ok()) else {
            return CertCheckResult::Untrusted;
        };
        match self
            .verifier
            .verify_server_cert(end_entity, intermediates, &name, &[], UnixTime::now())
        {
            Ok(_) => CertCheckResult::Trusted,
            Err(rustls::Error::InvalidCertificate(
                CertificateError::Expired | CertificateError::NotValidYet | CertificateError::BadEncoding,
            )) => CertCheckResult::Invalid,
            Err(_) if self_signed => CertCheckResult::SelfSigned,
            Err(e) => {
                tracing::debug!(domain = ?domain, error = %e, "Peer certificate not trusted");
                CertCheckResult::Untrusted
            }
        }
    }
}

fn name_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => domain
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == domain,
    }
}

/// Whether the DER certificate names `domain`: any SAN DNS entry, or the
/// subject CN when the certificate has no DNS SANs.
pub fn certificate_matches_domain(der: &[u8], domain: &str) -> Result<bool, S2sError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| S2sError::Certificate(e.to_string()))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| S2sError::Certificate(e.to_string()))?;
    let dns_names: Vec<&str> = san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|n| match n {
                    GeneralName::DNSName(name) => Some(*name),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    if !dns_names.is_empty() {
        return Ok(dns_names.iter().any(|n| name_matches(n, domain)));
    }
    Ok(cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| name_matches(cn, domain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn self_signed(domain: &str) -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap()
    }

    fn context_with_ca(ca_pem: Option<&str>) -> TlsContext {
        let own = self_signed("local.test");
        TlsContext::from_pem(
            own.cert.pem().as_bytes(),
            own.key_pair.serialize_pem().as_bytes(),
            ca_pem.map(str::as_bytes),
        )
        .unwrap()
    }

    fn der(cert: &rcgen::Certificate) -> CertificateDer<'static> {
        CertificateDer::from(cert.der().to_vec())
    }

    #[test]
    fn missing_chain() {
        assert_eq!(context_with_ca(None).classify(&[], Some("remote.test")), CertCheckResult::Missing);
    }

    #[test]
    fn self_signed_peer() {
        let peer = self_signed("remote.test");
        assert_eq!(
            context_with_ca(None).classify(&[der(&peer.cert)], Some("remote.test")),
            CertCheckResult::SelfSigned
        );
    }

    #[test]
    fn garbage_is_invalid() {
        let junk = CertificateDer::from(vec![1u8, 2, 3]);
        assert_eq!(context_with_ca(None).classify(&[junk], Some("remote.test")), CertCheckResult::Invalid);
    }

    #[test]
    fn expired_is_invalid() {
        let mut params = CertificateParams::new(vec!["remote.test".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        assert_eq!(
            context_with_ca(None).classify(&[der(&cert)], Some("remote.test")),
            CertCheckResult::Invalid
        );
    }

    #[test]
    fn chain_to_configured_anchor_is_trusted() {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "Federation Test CA");
        let ca_key = KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["remote.test".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();

        let ctx = context_with_ca(Some(&ca.pem()));
        assert_eq!(ctx.classify(&[der(&leaf)], Some("remote.test")), CertCheckResult::Trusted);
        // Right chain, wrong name.
        assert_eq!(ctx.classify(&[der(&leaf)], Some("other.test")), CertCheckResult::Untrusted);
        // Without the anchor the chain is unknown and not self-issued.
        assert_eq!(
            context_with_ca(None).classify(&[der(&leaf)], Some("remote.test")),
            CertCheckResult::Untrusted
        );
    }

    #[test]
    fn san_and_wildcard_matching() {
        let exact = self_signed("remote.test");
        assert!(certificate_matches_domain(exact.cert.der(), "REMOTE.test").unwrap());
        assert!(!certificate_matches_domain(exact.cert.der(), "other.test").unwrap());

        let wild = self_signed("*.remote.test");
        assert!(certificate_matches_domain(wild.cert.der(), "muc.remote.test").unwrap());
        assert!(!certificate_matches_domain(wild.cert.der(), "remote.test").unwrap());
        assert!(!certificate_matches_domain(wild.cert.der(), "a.b.remote.test").unwrap());
    }

    #[test]
    fn common_name_fallback() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "cn.test");
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        assert!(certificate_matches_domain(cert.der(), "cn.test").unwrap());
    }

    #[test]
    fn malformed_der_is_an_error() {
        assert!(certificate_matches_domain(&[0u8; 4], "x.test").is_err());
    }
}
