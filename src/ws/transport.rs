//! Byte-stream connectors. The session layer only sees [`Connector`], so
//! tests can substitute in-memory streams for TLS sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::error::TransportError;

/// Opens a reliable byte stream to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Self::Stream, TransportError>;
}

/// TCP + TLS with the webpki root set.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    connect_timeout: Duration,
}

impl TlsConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Self::Stream, TransportError> {
        info!("Connecting to {}:{}", endpoint.host, endpoint.port);

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout { what: "TCP connect" })?
        .map_err(|source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;

        // Audio batches are small and latency sensitive
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {}", e)))?;

        let tls = tokio::time::timeout(self.connect_timeout, self.inner.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Timeout { what: "TLS handshake" })?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        debug!("TLS established with {}", endpoint.host);
        Ok(tls)
    }
}

/// Plain TCP, for local test servers and plaintext proxies.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Self::Stream, TransportError> {
        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout { what: "TCP connect" })?
        .map_err(|source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
        tcp.set_nodelay(true)?;
        Ok(tcp)
    }
}
