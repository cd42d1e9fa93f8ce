use std::sync::Arc;

use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::error::{Error, Result};

/// TLS 1.2 is restricted to the ECDHE+AEAD suites the deployment's client
/// certificates are issued for; TLS 1.3 keeps its standard suites.
static CIPHER_SUITES: &[rustls::SupportedCipherSuite] = &[
    ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Builds the mTLS acceptor shared by the control and push listeners:
/// client certificates are required and verified against the `ClientCA`
/// bundle, minimum protocol version TLS 1.2.
pub fn make_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let ca_certs = load_certs(&config.client_ca)?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert)?;
    }
    if roots.is_empty() {
        return Err(Error::bad_config(format!(
            "no CA certificates in '{}'",
            config.client_ca
        )));
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| Error::bad_config(format!("client CA: {err}")))?;

    let provider = CryptoProvider {
        cipher_suites: CIPHER_SUITES.to_vec(),
        ..ring::default_provider()
    };
    let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&config.cert)?, load_key(&config.cert_key)?)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|err| Error::bad_config(format!("read '{path}': {err}")))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::io::Result<_>>()
        .map_err(|err| Error::bad_config(format!("parse '{path}': {err}")))?;
    if certs.is_empty() {
        return Err(Error::bad_config(format!("no certificates in '{path}'")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|err| Error::bad_config(format!("read '{path}': {err}")))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|err| Error::bad_config(format!("parse '{path}': {err}")))?
        .ok_or_else(|| Error::bad_config(format!("no private key in '{path}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            client_ca: dir.path().join("absent.pem").display().to_string(),
            ..Config::default()
        };
        match make_acceptor(&config) {
            Err(err) => assert!(matches!(err, Error::BadConfig(_))),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn empty_ca_bundle_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, "not a pem\n").unwrap();
        let config = Config {
            client_ca: ca.display().to_string(),
            ..Config::default()
        };
        match make_acceptor(&config) {
            Err(err) => assert!(matches!(err, Error::BadConfig(_))),
            Ok(_) => panic!("expected an error"),
        }
    }
}
