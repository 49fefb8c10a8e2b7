//! TLS materials for both legs of a session
//!
//! Built once at start-up and shared read-only by every session:
//! - a `rustls::ServerConfig` presented to clients that send an SSL request
//! - a `rustls::ClientConfig` used when upgrading backend connections

mod error;

pub use error::TlsError;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::config::{BackendTlsConfig, ServerTlsConfig};

/// Client-facing config, `None` when TLS is not offered to clients
pub fn build_server_config(config: &ServerTlsConfig) -> Result<Option<Arc<ServerConfig>>, TlsError> {
    if !config.enabled {
        return Ok(None);
    }

    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| TlsError::config("cert_path is required"))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| TlsError::config("key_path is required"))?;

    let certs = load_certificates(cert_path)?;
    if certs.is_empty() {
        return Err(TlsError::cert_load(cert_path, "no certificates found in file"));
    }
    let key = load_private_key(key_path)?;

    let provider = rustls::crypto::ring::default_provider();
    let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::config(format!("Failed to build TLS config: {}", e)))?;

    Ok(Some(Arc::new(server_config)))
}

/// Backend-facing config, `None` when backends are reached in plain text
pub fn build_client_config(config: &BackendTlsConfig) -> Result<Option<Arc<ClientConfig>>, TlsError> {
    if !config.enabled {
        return Ok(None);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?;

    let client_config = if config.skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification { provider }))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(build_root_store(config)?)
            .with_no_client_auth()
    };

    Ok(Some(Arc::new(client_config)))
}

fn build_root_store(config: &BackendTlsConfig) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    match &config.ca_path {
        Some(ca_path) => {
            for cert in load_certificates(ca_path)? {
                root_store
                    .add(cert)
                    .map_err(|e| TlsError::cert_load(ca_path, e.to_string()))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(root_store)
}

/// Load every certificate of a PEM file (chains included)
fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))
}

/// Load the first RSA, PKCS8 or EC private key of a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

/// Accepts any backend certificate (`skip_verify = true`)
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for NoCertificateVerification {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
