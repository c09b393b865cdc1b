use super::{connect_tcp, BoxedTransport, TransportClient, TransportType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// TLS 传输客户端
pub struct TlsTransportClient {
    addr: String,
    server_name: String,
    dial_timeout: Duration,
    keepalive: Option<Duration>,
    connector: TlsConnector,
}

impl TlsTransportClient {
    pub fn new(
        addr: impl Into<String>,
        server_name: impl Into<String>,
        dial_timeout: Duration,
        keepalive: Option<Duration>,
        connector: TlsConnector,
    ) -> Self {
        Self {
            addr: addr.into(),
            server_name: server_name.into(),
            dial_timeout,
            keepalive,
            connector,
        }
    }
}

#[async_trait]
impl TransportClient for TlsTransportClient {
    async fn dial(&self) -> Result<BoxedTransport> {
        let tcp_stream = connect_tcp(&self.addr, self.dial_timeout, self.keepalive).await?;

        let server_name = ServerName::try_from(self.server_name.clone())
            .with_context(|| format!("Invalid TLS server name '{}'", self.server_name))?;

        let tls_stream = tokio::time::timeout(
            self.dial_timeout,
            self.connector.connect(server_name, tcp_stream),
        )
        .await
        .with_context(|| format!("TLS handshake with {} timed out", self.addr))?
        .context("TLS handshake failed")?;

        debug!("TLS connection established to {}", self.addr);
        Ok(Box::pin(tls_stream))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tls
    }
}
