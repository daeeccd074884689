//! TLS client configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, CertificateError, ClientConfig, PrivateKey, RootCertStore, ServerName};
use tracing::{debug, warn};

use qdmetrics_config::ConnectOptions;

use crate::{AmqpError, AmqpResult};

/// Builds the rustls client configuration for `options`.
pub fn client_config(options: &ConnectOptions) -> AmqpResult<Arc<ClientConfig>> {
    let roots = root_store(options.ssl_trustfile.as_deref())?;

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots.clone());

    let mut config = match (&options.ssl_certificate, &options.ssl_key) {
        (Some(cert), Some(key)) => {
            let chain = load_certs(cert)?;
            let key = load_key(key)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| AmqpError::tls(format!("invalid client certificate: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    if options.ssl_disable_peer_name_verify {
        debug!("peer name verification disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(ChainOnlyVerifier::new(roots)));
    }

    Ok(Arc::new(config))
}

/// Name presented for SNI and checked against the certificate.
pub fn server_name(options: &ConnectOptions) -> AmqpResult<ServerName> {
    let host = options.hostname.as_deref().unwrap_or(&options.address);
    ServerName::try_from(host).map_err(|e| AmqpError::tls(format!("invalid server name {host}: {e}")))
}

fn root_store(trustfile: Option<&Path>) -> AmqpResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match trustfile {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(&cert)
                    .map_err(|e| AmqpError::tls(format!("bad CA in {}: {e}", path.display())))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| AmqpError::tls(format!("failed to load native roots: {e}")))?;
            for cert in native {
                if let Err(e) = roots.add(&Certificate(cert.0)) {
                    warn!(error = %e, "skipping unusable native root certificate");
                }
            }
        }
    }
    Ok(roots)
}

fn open(path: &Path) -> AmqpResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| AmqpError::tls(format!("cannot open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> AmqpResult<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .map_err(|e| AmqpError::tls(format!("cannot read {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(AmqpError::tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> AmqpResult<PrivateKey> {
    let items = rustls_pemfile::read_all(&mut open(path)?)
        .map_err(|e| AmqpError::tls(format!("cannot read {}: {e}", path.display())))?;
    items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| AmqpError::tls(format!("no private key in {}", path.display())))
}

/// Validates the certificate chain but accepts any host name.
struct ChainOnlyVerifier {
    inner: WebPkiVerifier,
}

impl ChainOnlyVerifier {
    fn new(roots: RootCertStore) -> Self {
        Self {
            inner: WebPkiVerifier::new(roots, None),
        }
    }
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_prefers_hostname() {
        let mut options = ConnectOptions::new("10.0.0.5", 5671);
        assert!(server_name(&options).is_ok());

        options.hostname = Some("router.example.com".to_string());
        match server_name(&options).unwrap() {
            ServerName::DnsName(name) => assert_eq!(name.as_ref(), "router.example.com"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_trustfile_is_tls_error() {
        let options = ConnectOptions {
            ssl_trustfile: Some("/nonexistent/ca.pem".into()),
            ..ConnectOptions::default()
        };
        assert!(matches!(client_config(&options), Err(AmqpError::Tls { .. })));
    }

    #[test]
    fn test_empty_trustfile_is_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, "not a certificate\n").unwrap();
        let options = ConnectOptions {
            ssl_trustfile: Some(path),
            ..ConnectOptions::default()
        };
        assert!(matches!(client_config(&options), Err(AmqpError::Tls { .. })));
    }
}
