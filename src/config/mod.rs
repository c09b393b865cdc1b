// 配置管理模块 - 使用模块化设计

mod builder;
mod source;
mod validator;

// 重新导出 builder、source 和 validator
pub use builder::{ClientConfigBuilder, ClientFullConfigBuilder, ProxyConfigBuilder};
pub use source::ConfigSource;
pub use validator::ConfigValidator;

use crate::protocol::NewProxy;
use crate::transport::TransportType;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// 代理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// 原始 TCP 端口映射
    #[default]
    Tcp,
    /// UDP 端口映射（数据报封装在工作连接上）
    Udp,
    /// HTTP 虚拟主机
    Http,
    /// HTTPS 虚拟主机（SNI 路由）
    Https,
    /// 需要密钥的 TCP（由服务器中继）
    Stcp,
    /// 需要密钥的 P2P TCP（NAT 打洞）
    Xtcp,
}

impl ProxyType {
    /// 是否需要共享密钥（visitor 类型）
    pub fn requires_secret_key(self) -> bool {
        matches!(self, ProxyType::Stcp | ProxyType::Xtcp)
    }

    /// 是否按域名路由
    pub fn is_http(self) -> bool {
        matches!(self, ProxyType::Http | ProxyType::Https)
    }

    /// 工作连接是否承载 UDP 数据报
    pub fn is_udp(self) -> bool {
        matches!(self, ProxyType::Udp)
    }

    /// 需要低延迟的类型启用 TCP_NODELAY
    pub fn needs_nodelay(self) -> bool {
        !self.is_udp()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Udp => "udp",
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Stcp => "stcp",
            ProxyType::Xtcp => "xtcp",
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProxyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "stcp" => Ok(Self::Stcp),
            "xtcp" => Ok(Self::Xtcp),
            _ => anyhow::bail!("Unknown proxy type: {}", s),
        }
    }
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

/// 代理配置
///
/// 由配置文件解析得到，注册后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 代理名称（一个客户端内唯一）
    pub name: String,
    /// 代理类型
    #[serde(rename = "type", default)]
    pub proxy_type: ProxyType,
    /// 本地服务地址
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    /// 本地服务端口
    pub local_port: u16,
    /// 服务器端口（tcp/udp，0 表示由服务器分配）
    #[serde(default)]
    pub remote_port: u16,
    /// 子域名（http/https）
    #[serde(default)]
    pub subdomain: String,
    /// 自定义域名（http/https）
    #[serde(default)]
    pub custom_domains: Vec<String>,
    /// URL 路由前缀（http）
    #[serde(default)]
    pub locations: Vec<String>,
    /// HTTP Basic 认证用户名
    #[serde(default)]
    pub http_user: String,
    /// HTTP Basic 认证密码
    #[serde(default)]
    pub http_pwd: String,
    /// 重写 Host 头
    #[serde(default)]
    pub host_header_rewrite: String,
    /// 负载均衡分组
    #[serde(default)]
    pub group: String,
    /// 负载均衡分组密钥
    #[serde(default)]
    pub group_key: String,
    /// stcp/xtcp 共享密钥
    #[serde(default)]
    pub sk: String,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    /// 附加元数据
    #[serde(default)]
    pub metas: HashMap<String, String>,
}

impl ProxyConfig {
    /// 创建 Builder
    pub fn builder(name: impl Into<String>, proxy_type: ProxyType) -> ProxyConfigBuilder {
        ProxyConfigBuilder::new(name, proxy_type)
    }

    /// 本地目标地址
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    /// 构建 NewProxy 消息（本地目标不会发送给服务器）
    pub fn to_new_proxy(&self) -> NewProxy {
        NewProxy {
            proxy_name: self.name.clone(),
            proxy_type: self.proxy_type,
            use_encryption: self.use_encryption,
            use_compression: self.use_compression,
            group: self.group.clone(),
            group_key: self.group_key.clone(),
            metas: self.metas.clone(),
            remote_port: self.remote_port,
            custom_domains: self.custom_domains.clone(),
            subdomain: self.subdomain.clone(),
            locations: self.locations.clone(),
            http_user: self.http_user.clone(),
            http_pwd: self.http_pwd.clone(),
            host_header_rewrite: self.host_header_rewrite.clone(),
            sk: self.sk.clone(),
        }
    }
}

/// Visitor 配置（访问另一个客户端的 stcp/xtcp 代理）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorConfig {
    /// Visitor 名称
    pub name: String,
    /// 代理类型（stcp 或 xtcp）
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    /// 目标代理名称（对端客户端注册的 proxy name）
    pub server_name: String,
    /// 共享密钥
    pub sk: String,
    /// 本地绑定地址（默认 127.0.0.1）
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 本地绑定端口（本地应用连接此端口）
    pub bind_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

impl VisitorConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}

/// 重连退避配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 首次重连延迟（毫秒）
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// 最大重连延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 抖动比例（0.0 ~ 1.0）
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_server_port() -> u16 {
    7000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_multiplier() -> u32 {
    3
}

fn default_login_timeout_secs() -> u64 {
    10
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_work_conn_ready_timeout_secs() -> u64 {
    10
}

fn default_nat_hole_timeout_secs() -> u64 {
    10
}

fn default_max_message_size() -> u64 {
    crate::protocol::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 客户端配置（`[client]` 段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 服务器地址
    pub server_addr: String,
    /// 服务器端口
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// 传输类型（tcp, tls）
    #[serde(default)]
    pub transport: TransportType,
    /// 是否在单条物理连接上复用控制连接与工作连接（yamux）
    #[serde(default)]
    pub tcp_mux: bool,
    /// 用户名（会作为代理名前缀由服务器处理）
    #[serde(default)]
    pub user: String,
    /// 认证令牌
    #[serde(default)]
    pub token: String,
    /// 心跳间隔（秒）
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// 心跳超时倍数（interval * multiplier 内无响应视为断线）
    #[serde(default = "default_heartbeat_timeout_multiplier")]
    pub heartbeat_timeout_multiplier: u32,
    /// 等待登录响应超时（秒）
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    /// 建立传输连接超时（秒）
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// 工作连接等待 StartWorkConn 超时（秒）
    #[serde(default = "default_work_conn_ready_timeout_secs")]
    pub work_conn_ready_timeout_secs: u64,
    /// NAT 打洞握手超时（秒）
    #[serde(default = "default_nat_hole_timeout_secs")]
    pub nat_hole_timeout_secs: u64,
    /// 单条消息负载上限（字节）
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
    /// 登录失败后是否退出（否则按退避策略重连）
    #[serde(default)]
    pub login_fail_exit: bool,
    /// 心跳消息是否携带认证签名
    #[serde(default)]
    pub authenticate_heartbeats: bool,
    /// 工作连接是否携带认证签名
    #[serde(default)]
    pub authenticate_new_work_conns: bool,
    /// TLS SNI 名称（默认使用 server_addr）
    #[serde(default)]
    pub tls_server_name: Option<String>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 重连退避策略
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// 控制面 API 地址（可选，启用后注册前校验代理）
    #[serde(default)]
    pub api_url: Option<String>,
    /// 控制面 API 令牌
    #[serde(default)]
    pub api_token: Option<String>,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ClientConfig {
    /// 创建 Builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// 服务器地址（host:port）
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// 心跳超时：interval × multiplier
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_timeout_multiplier
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn work_conn_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.work_conn_ready_timeout_secs)
    }

    pub fn nat_hole_timeout(&self) -> Duration {
        Duration::from_secs(self.nat_hole_timeout_secs)
    }
}

/// 客户端完整配置（包含代理和 visitor 列表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFullConfig {
    pub client: ClientConfig,
    /// 代理配置列表（提供给外部访问的服务）
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    /// Visitor 配置列表（访问其他客户端的 stcp/xtcp 服务）
    #[serde(default)]
    pub visitors: Vec<VisitorConfig>,
}

impl ClientFullConfig {
    /// 创建 Builder
    pub fn builder() -> ClientFullConfigBuilder {
        ClientFullConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_full_config(self)
    }

    /// 从 TOML 文本解析并验证配置（纯函数，不做任何 I/O）
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ClientFullConfig =
            toml::from_str(content).context("Failed to parse client configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从配置来源获取内容并解析
    pub async fn load(source: &ConfigSource) -> anyhow::Result<Self> {
        let content = source.fetch().await?;
        Self::parse(&content).with_context(|| format!("Invalid configuration from {}", source))
    }
}
