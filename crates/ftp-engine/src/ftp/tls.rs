//! TLS helpers for Explicit and Implicit FTPS (RFC 4217).
//!
//! - Builds a rustls `TlsConnector` from the platform trust store, with
//!   optional acceptance of self-signed certificates.
//! - Provides `upgrade_to_tls` for wrapping an existing plain codec.
//!
//! One connector is built per session and shared by the control and data
//! connections, so the data channel can resume the control channel's TLS
//! session (servers such as vsftpd require it).

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::probe::SocketProbe;
use crate::ftp::protocol::FtpCodec;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Build a `TlsConnector` according to our configuration.
pub fn build_tls_connector(accept_invalid_certs: bool) -> FtpResult<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        log::warn!("Skipping unreadable platform certificate: {}", err);
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    log::debug!("Loaded {} trust roots ({} ignored)", added, ignored);

    if root_store.is_empty() && !accept_invalid_certs {
        return Err(FtpError::tls_failed(
            "No trust roots available on this system",
        ));
    }

    let mut tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        log::warn!("TLS certificate verification disabled – insecure!");
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier));
    }

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

fn server_name(host: &str) -> FtpResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| FtpError::tls_failed(format!("Invalid server name '{}': {}", host, e)))
}

/// Handshake over a freshly connected socket (implicit FTPS).
pub async fn connect_tls(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
) -> FtpResult<TlsStream<TcpStream>> {
    connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| FtpError::tls_failed(format!("TLS handshake: {}", e)))
}

/// Upgrade an existing **plain** control connection to TLS.
///
/// Called after a successful `AUTH TLS` + 234 reply. Consumes the plain
/// codec, performs the handshake, returns a new codec.
pub async fn upgrade_to_tls(
    codec: FtpCodec,
    connector: &TlsConnector,
    host: &str,
) -> FtpResult<FtpCodec> {
    let (tcp, probe): (TcpStream, SocketProbe) = codec.into_plain_parts()?;
    let tls = connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| FtpError::tls_failed(format!("Explicit TLS handshake: {}", e)))?;
    FtpCodec::from_tls(tls, probe)
}

/// Create a TLS-wrapped data channel for FTPS (PROT P).
pub async fn wrap_data_stream(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
) -> FtpResult<TlsStream<TcpStream>> {
    connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| FtpError::tls_failed(format!("Data channel TLS: {}", e)))
}

// ─── NoCertVerifier (for self-signed certs) ─────────────────────────

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
