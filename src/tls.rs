//! TLS configuration for both endpoints. Both sides pin a TLS 1.3-only `rustls` config.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Builds the client side's TLS config: trust the platform root store, plus an optional extra
/// PEM bundle of trusted issuers (for servers using a private CA).
pub fn client_connector(extra_ca_pem: Option<&Path>) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();

    for cert in rustls_native_certs::load_native_certs().certs {
        roots.add(cert).context("failed to add a native root certificate")?;
    }

    if let Some(path) = extra_ca_pem {
        let pem = std::fs::read(path).with_context(|| format!("failed to read CA bundle {path:?}"))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots.add(cert.context("failed to parse a certificate in the CA bundle")?)?;
        }
    }

    let mut config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols.clear();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Builds the server side's TLS config from a PEM certificate chain and private key.
pub fn server_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_chain = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("failed to build server TLS config from the given cert/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("failed to read certificate {path:?}"))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificate {path:?}"))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("failed to read private key {path:?}"))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("failed to parse private key {path:?}"))?
        .context("no private key found in the given file")
}
