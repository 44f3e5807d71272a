//! Mutual-TLS configuration from PEM files.
//!
//! Both ends authenticate: the server requires a client certificate chaining
//! to its trusted roots, and the client presents one. All configs use the
//! `ring` crypto provider with the safe default protocol versions.

use crate::{Error, Result};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};
use std::{fs::File, io::BufReader, net::SocketAddr, path::Path, sync::Arc};
use tracing::debug;

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| Error::Tls {
        context: format!("{}: {e}", path.display()),
    })
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Loads every certificate in a PEM file.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the file cannot be read or holds no
/// certificate.
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<core::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls {
            context: format!("{}: {e}", path.display()),
        })?;
    if certs.is_empty() {
        return Err(Error::Tls {
            context: format!("{}: no certificates found", path.display()),
        });
    }
    Ok(certs)
}

/// Loads the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM file.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the file cannot be read or holds no key.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| Error::Tls {
            context: format!("{}: {e}", path.display()),
        })?
        .ok_or_else(|| Error::Tls {
            context: format!("{}: no private key found", path.display()),
        })
}

/// Builds a trust store from a PEM bundle.
pub fn load_roots(path: impl AsRef<Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server config that requires and verifies client certificates.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| Error::Tls {
            context: format!("client verifier: {e}"),
        })?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client config presenting `certs`/`key` and trusting `roots`.
pub fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Display label for a connected peer: `CN [serial] addr`, with the common
/// name and decimal serial number of the leaf certificate.
///
/// Without a certificate the label is just the address. A subject without a
/// common name is shown in full.
pub fn peer_label(addr: SocketAddr, certs: Option<&[CertificateDer<'_>]>) -> String {
    let Some(leaf) = certs.and_then(|c| c.first()) else {
        return addr.to_string();
    };
    match x509_parser::parse_x509_certificate(leaf.as_ref()) {
        Ok((_, cert)) => {
            let subject = cert.subject();
            let name = subject
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map_or_else(|| subject.to_string(), str::to_owned);
            format!("{name} [{}] {addr}", cert.tbs_certificate.serial)
        }
        Err(e) => {
            debug!(%addr, error = %e, "unreadable peer certificate");
            addr.to_string()
        }
    }
}
