use super::{BoxedTransport, TransportClient, TransportType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 建立 TCP 连接并设置 TCP_NODELAY 与 keepalive
pub async fn connect_tcp(
    addr: &str,
    dial_timeout: Duration,
    keepalive: Option<Duration>,
) -> Result<TcpStream> {
    let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("Timed out connecting to {} after {:?}", addr, dial_timeout))?
        .with_context(|| format!("Failed to connect to {}", addr))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
    }

    if let Some(time) = keepalive {
        let sock_ref = SockRef::from(&stream);
        if let Err(e) = sock_ref.set_tcp_keepalive(&TcpKeepalive::new().with_time(time)) {
            warn!("Failed to set TCP keepalive on {}: {}", addr, e);
        }
    }

    Ok(stream)
}

/// 明文 TCP 传输客户端
pub struct TcpTransportClient {
    addr: String,
    dial_timeout: Duration,
    keepalive: Option<Duration>,
}

impl TcpTransportClient {
    pub fn new(addr: impl Into<String>, dial_timeout: Duration, keepalive: Option<Duration>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout,
            keepalive,
        }
    }
}

#[async_trait]
impl TransportClient for TcpTransportClient {
    async fn dial(&self) -> Result<BoxedTransport> {
        let stream = connect_tcp(&self.addr, self.dial_timeout, self.keepalive).await?;
        debug!("TCP connection established to {}", self.addr);
        Ok(Box::pin(stream))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }
}
