//! Acceptation TLS optionnelle (feature `tls`).
//!
//! La pile TLS elle-même (rustls) est un collaborateur externe : on se
//! contente de charger certificat et clé PEM et de construire l'accepteur
//! que le miniserver enveloppe autour des connexions HTTP acceptées.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsFiles;
use crate::errors::ServerError;

/// Construit un accepteur TLS depuis des fichiers PEM.
pub fn build_acceptor(files: &TlsFiles) -> Result<TlsAcceptor, ServerError> {
    let cert_pem = read(&files.cert_pem)?;
    let key_pem = read(&files.key_pem)?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("cannot parse {}: {e}", files.cert_pem.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificate found in {}",
            files.cert_pem.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Tls(format!("cannot parse {}: {e}", files.key_pem.display())))?
        .ok_or_else(|| {
            ServerError::Tls(format!(
                "no private key found in {}",
                files.key_pem.display()
            ))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    info!("🔐 TLS acceptor ready ({})", files.cert_pem.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read(path: &Path) -> Result<Vec<u8>, ServerError> {
    std::fs::read(path).map_err(|e| ServerError::Tls(format!("cannot read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_files_are_reported() {
        let files = TlsFiles {
            cert_pem: PathBuf::from("/nonexistent/cert.pem"),
            key_pem: PathBuf::from("/nonexistent/key.pem"),
        };
        assert!(matches!(build_acceptor(&files), Err(ServerError::Tls(_))));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = std::env::temp_dir().join(format!("pnp-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty-cert.pem");
        let key = dir.join("empty-key.pem");
        std::fs::write(&cert, b"").unwrap();
        std::fs::write(&key, b"").unwrap();

        let files = TlsFiles {
            cert_pem: cert,
            key_pem: key,
        };
        assert!(matches!(build_acceptor(&files), Err(ServerError::Tls(_))));
    }
}
