//! TLS context consumed by the `sslsocket`, `https` and `sslbisocket` transports.
//!
//! How certificates are obtained is up to the embedding application: it
//! builds `rustls` configs and hands them over in a [`TlsContext`].

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::protocol::error::{Result, RinvokeError};

#[derive(Clone, Default)]
pub struct TlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: Option<String>,
}

impl TlsContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// Overrides the name verified against the server certificate; the
    /// locator host is used otherwise.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// A context whose server presents a fresh self-signed certificate for
    /// `names` and whose client trusts exactly that certificate.
    pub fn self_signed(names: Vec<String>) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let cert = rcgen::generate_simple_self_signed(names)
            .map_err(|e| RinvokeError::Tls(format!("Failed to generate certificate: {}", e)))?;
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());

        let mut roots = RootCertStore::empty();
        roots.add(cert_der.clone())?;

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)?;
        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self::new()
            .with_server_config(Arc::new(server))
            .with_client_config(Arc::new(client)))
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        self.client
            .clone()
            .map(TlsConnector::from)
            .ok_or_else(|| RinvokeError::Tls("TLS context has no client configuration".to_string()))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        self.server
            .clone()
            .map(TlsAcceptor::from)
            .ok_or_else(|| RinvokeError::Tls("TLS context has no server configuration".to_string()))
    }

    pub fn server_name(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        ServerName::try_from(name.clone())
            .map_err(|e| RinvokeError::Tls(format!("Invalid server name '{}': {}", name, e)))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}
