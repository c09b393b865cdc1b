// 传输层工厂 - 根据配置创建传输实例

use crate::client::config::get_tcp_keepalive;
use crate::config::ClientConfig;
use crate::tls::load_client_config;
use crate::transport::{
    MuxTransportClient, TcpTransportClient, TlsTransportClient, TransportClient, TransportType,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// 创建传输层客户端
///
/// 启用 `tcp_mux` 时在基础传输之上包裹 yamux 复用
pub fn create_transport_client(config: &ClientConfig) -> Result<Arc<dyn TransportClient>> {
    let addr = config.server_address();
    let keepalive = get_tcp_keepalive();

    let base: Arc<dyn TransportClient> = match config.transport {
        TransportType::Tcp => Arc::new(TcpTransportClient::new(
            addr,
            config.dial_timeout(),
            keepalive,
        )),
        TransportType::Tls => {
            let tls_config =
                load_client_config(config.ca_cert_path.as_deref(), config.skip_verify)
                    .context("Failed to load TLS client configuration")?;
            let server_name = config
                .tls_server_name
                .clone()
                .unwrap_or_else(|| config.server_addr.clone());
            Arc::new(TlsTransportClient::new(
                addr,
                server_name,
                config.dial_timeout(),
                keepalive,
                TlsConnector::from(tls_config),
            ))
        }
    };

    if config.tcp_mux {
        Ok(Arc::new(MuxTransportClient::new(base)))
    } else {
        Ok(base)
    }
}
