use std::fs::File;
use std::io::{BufReader, Error, ErrorKind, Result};
use std::path::Path;
use std::sync::Arc;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};

pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: Vec<Certificate> = certs(&mut reader)?.into_iter().map(Certificate).collect();
    if certs.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("no certificates in {}", path.display()),
        ));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut keys = pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("no PKCS#8 private key in {}", path.display()),
        ));
    }
    Ok(PrivateKey(keys.swap_remove(0)))
}

/// A server config presenting `cert_path` with `key_path`. Clients are not
/// asked for certificates.
pub fn make_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))?;

    Ok(Arc::new(config))
}
