//! TLS material loading for HTTPS environments.

use crate::environment::{TlsKind, TlsOptions};
use crate::error::EngineError;
use rustls::pki_types::CertificateDer;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Create TLS acceptor from certificate and key files.
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, anyhow::Error> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        anyhow::anyhow!("Failed to open certificate file '{}': {e}", cert_path.display())
    })?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate file: {e}"))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in certificate file: {}", cert_path.display());
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        anyhow::anyhow!("Failed to open private key file '{}': {e}", key_path.display())
    })?;
    let mut key_reader = std::io::BufReader::new(key_file);

    // PKCS8, RSA or EC keys
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key file: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in key file: {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS configuration: {e}"))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Acceptor for an environment, or `None` when TLS is off. Relative paths are
/// resolved against the environment directory.
pub fn acceptor_for(options: &TlsOptions, base_dir: &Path) -> Result<Option<TlsAcceptor>, EngineError> {
    if !options.enabled {
        return Ok(None);
    }
    if options.kind == TlsKind::Pfx {
        return Err(EngineError::TlsMaterial(
            "PFX certificates are not supported, use CERT with PEM files".to_string(),
        ));
    }
    if options.cert_path.trim().is_empty() || options.key_path.trim().is_empty() {
        return Err(EngineError::TlsMaterial(
            "certificate and key paths are required".to_string(),
        ));
    }

    let cert = base_dir.join(options.cert_path.trim());
    let key = base_dir.join(options.key_path.trim());
    create_tls_acceptor(&cert, &key)
        .map(Some)
        .map_err(|e| EngineError::TlsMaterial(format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_disabled() {
        let options = TlsOptions::default();
        assert!(acceptor_for(&options, Path::new(".")).unwrap().is_none());
    }

    #[test]
    fn test_missing_material_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let options = TlsOptions {
            enabled: true,
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
            ..Default::default()
        };
        let err = acceptor_for(&options, dir.path()).err().unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("certificate"));
    }

    #[test]
    fn test_pfx_is_rejected() {
        let options = TlsOptions {
            enabled: true,
            kind: TlsKind::Pfx,
            pfx_path: "bundle.pfx".into(),
            ..Default::default()
        };
        assert!(matches!(
            acceptor_for(&options, Path::new(".")),
            Err(EngineError::TlsMaterial(_))
        ));
    }

    #[test]
    fn test_empty_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cert.pem"), "").unwrap();
        std::fs::write(dir.path().join("key.pem"), "").unwrap();
        let err = create_tls_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }
}
