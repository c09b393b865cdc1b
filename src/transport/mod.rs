mod factory;
mod mux;
mod tcp;
mod tls;

pub use factory::create_transport_client;
pub use mux::MuxTransportClient;
pub use tcp::{connect_tcp, TcpTransportClient};
pub use tls::TlsTransportClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// 明文 TCP
    #[default]
    Tcp,
    /// TCP + TLS
    Tls,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::Tls => write!(f, "tls"),
        }
    }
}

impl std::str::FromStr for TransportType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tls" => Ok(Self::Tls),
            _ => anyhow::bail!("Unknown transport type: {}", s),
        }
    }
}

/// 传输层连接抽象
///
/// 可靠、有序的字节流；关闭即 `shutdown` 或丢弃，超时由调用方用 `tokio::time::timeout` 表达
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 装箱后的传输层连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 传输层客户端接口
///
/// 控制连接、工作连接和 visitor 连接都通过它拨号到服务器
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// 连接到服务器并返回传输层连接
    async fn dial(&self) -> Result<BoxedTransport>;

    /// 获取传输类型
    fn transport_type(&self) -> TransportType;

    /// 释放共享的底层资源（例如复用的物理连接）
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_parse() {
        assert_eq!("TLS".parse::<TransportType>().unwrap(), TransportType::Tls);
        assert_eq!("tcp".parse::<TransportType>().unwrap(), TransportType::Tcp);
        assert!("kcp".parse::<TransportType>().is_err());
        assert_eq!(TransportType::default(), TransportType::Tcp);
    }
}
