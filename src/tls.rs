use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::errors::WsError;

/// client certificate policy for secure servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// no client certificate requested
    #[default]
    None,
    /// client certificate requested, anonymous clients still accepted
    Want,
    /// client certificate required
    Need,
}

/// tls material provider shared by secure servers and wss clients
///
/// paths are held until the first acceptor/connector is needed, the
/// built configs are cached and shared read only afterwards
#[derive(Default)]
pub struct SecureContext {
    key_file: Option<(PathBuf, Option<String>)>,
    trust_file: Option<(PathBuf, Option<String>)>,
    client_auth: ClientAuth,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
}

impl std::fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureContext")
            .field("key_file", &self.key_file)
            .field("trust_file", &self.trust_file)
            .field("client_auth", &self.client_auth)
            .field("acceptor", &self.acceptor.is_some())
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

impl SecureContext {
    /// empty context, platform default trust anchors, no server key
    pub fn new() -> Self {
        Default::default()
    }

    /// set certificate chain + private key file (pem) for secure servers
    ///
    /// the passphrase is kept for keystore formats that need one; the
    /// pem loader only reads unencrypted keys
    pub fn set_key_file(&mut self, path: impl AsRef<Path>, passphrase: Option<&str>) {
        self.key_file = Some((path.as_ref().to_path_buf(), passphrase.map(Into::into)));
        self.acceptor = None;
    }

    /// set trust anchors file (pem) used to verify peers
    pub fn set_trust_store(&mut self, path: impl AsRef<Path>, passphrase: Option<&str>) {
        self.trust_file = Some((path.as_ref().to_path_buf(), passphrase.map(Into::into)));
        self.connector = None;
        self.acceptor = None;
    }

    /// configure the client certificate policy of secure servers
    pub fn set_client_auth(&mut self, client_auth: ClientAuth) {
        self.client_auth = client_auth;
        self.acceptor = None;
    }

    fn read_pem(path: &Path) -> Result<BufReader<File>, WsError> {
        let file = File::open(path)
            .map_err(|e| WsError::Tls(format!("open {}: {e}", path.display())))?;
        Ok(BufReader::new(file))
    }

    fn load_roots(&self, path: &Path) -> Result<RootCertStore, WsError> {
        let mut reader = Self::read_pem(path)?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| WsError::Tls(format!("read {}: {e}", path.display())))?;
            roots
                .add(cert)
                .map_err(|e| WsError::Tls(format!("bad trust anchor in {}: {e}", path.display())))?;
        }
        if roots.is_empty() {
            return Err(WsError::Tls(format!(
                "no trust anchors in {}",
                path.display()
            )));
        }
        Ok(roots)
    }

    /// acceptor for secure servers, built lazily from the key file
    pub(crate) fn acceptor(&mut self) -> Result<TlsAcceptor, WsError> {
        if let Some(acceptor) = &self.acceptor {
            return Ok(acceptor.clone());
        }
        let (path, _passphrase) = self
            .key_file
            .as_ref()
            .ok_or_else(|| WsError::Tls("no key file configured".into()))?;
        let mut certs: Vec<CertificateDer<'static>> = Vec::new();
        let mut key: Option<PrivateKeyDer<'static>> = None;
        let mut reader = Self::read_pem(path)?;
        for item in rustls_pemfile::read_all(&mut reader) {
            let item = item.map_err(|e| WsError::Tls(format!("read {}: {e}", path.display())))?;
            match item {
                rustls_pemfile::Item::X509Certificate(cert) => certs.push(cert),
                rustls_pemfile::Item::Pkcs8Key(k) => key = Some(PrivateKeyDer::Pkcs8(k)),
                rustls_pemfile::Item::Pkcs1Key(k) => key = Some(PrivateKeyDer::Pkcs1(k)),
                rustls_pemfile::Item::Sec1Key(k) => key = Some(PrivateKeyDer::Sec1(k)),
                _ => {}
            }
        }
        let key = key.ok_or_else(|| {
            WsError::Tls(format!("no private key in {}", path.display()))
        })?;
        if certs.is_empty() {
            return Err(WsError::Tls(format!(
                "no certificate chain in {}",
                path.display()
            )));
        }
        let builder = ServerConfig::builder();
        let config = match self.client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            policy => {
                let (trust_path, _) = self.trust_file.as_ref().ok_or_else(|| {
                    WsError::Tls("client auth requires a trust store".into())
                })?;
                let roots = Arc::new(self.load_roots(trust_path)?);
                let verifier_builder = WebPkiClientVerifier::builder(roots);
                let verifier_builder = if policy == ClientAuth::Want {
                    verifier_builder.allow_unauthenticated()
                } else {
                    verifier_builder
                };
                let verifier = verifier_builder
                    .build()
                    .map_err(|e| WsError::Tls(format!("client verifier: {e}")))?;
                builder.with_client_cert_verifier(verifier)
            }
        }
        .with_single_cert(certs, key)
        .map_err(|e| WsError::Tls(format!("key/cert mismatch: {e}")))?;
        debug!("secure context acceptor built from {}", path.display());
        let acceptor = TlsAcceptor::from(Arc::new(config));
        self.acceptor = Some(acceptor.clone());
        Ok(acceptor)
    }

    /// connector for wss clients; falls back to the bundled web roots
    /// when no trust store is configured
    pub(crate) fn connector(&mut self) -> Result<TlsConnector, WsError> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }
        let roots = match &self.trust_file {
            Some((path, _)) => self.load_roots(path)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        self.connector = Some(connector.clone());
        Ok(connector)
    }
}
