/// revtun 库入口
///
/// 将核心模块导出为库，方便测试和嵌入到其他程序中
pub mod api;
pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod io_util;
pub mod net;
pub mod protocol;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use client::{
    ControlState, ProxyManager, ProxyState, ProxyStatus, Service, ServiceEvent, ServiceHandle,
    ServiceStatus,
};
pub use config::{ClientConfig, ClientFullConfig, ConfigSource, ProxyConfig, ProxyType, VisitorConfig};
pub use error::{Result, TunnelError};
pub use protocol::{Message, MessageCodec};
pub use transport::{create_transport_client, TransportClient, TransportType};
