/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用者可以据此区分
/// 传输层故障、协议故障、认证失败和配置错误，并决定是否重连
use std::io;
use thiserror::Error;

/// revtun 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 认证失败（登录被拒绝）
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 代理名称重复
    #[error("Duplicate proxy name '{0}'")]
    DuplicateProxy(String),

    /// 传输层错误
    #[error("Transport error: {0}")]
    TransportError(String),

    /// 帧格式错误（超长、无法解析的负载）
    #[error("Framing error: {0}")]
    Framing(String),

    /// 协议错误（收到了不符合状态的消息）
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 代理未找到
    #[error("Proxy '{name}' not found")]
    ProxyNotFound { name: String },

    /// 服务器拒绝代理注册
    #[error("Proxy '{name}' registration failed: {reason}")]
    RegistrationFailed { name: String, reason: String },

    /// NAT 穿透握手失败
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// 安全错误（密钥不匹配等）
    #[error("Security error: {0}")]
    SecurityError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建帧格式错误
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建代理未找到错误
    pub fn proxy_not_found(name: impl Into<String>) -> Self {
        Self::ProxyNotFound { name: name.into() }
    }

    /// 创建注册失败错误
    pub fn registration_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// 创建握手失败错误
    pub fn handshake_failed(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// 创建安全错误
    pub fn security_error(msg: impl Into<String>) -> Self {
        Self::SecurityError(msg.into())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为认证失败
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_) | Self::DuplicateProxy(_))
    }

    /// 检查是否为帧格式错误
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::Framing(_))
    }

    /// 控制连接因该错误断开后是否应该重连
    ///
    /// 配置错误不重连；认证失败默认重连（凭据可能稍后生效），
    /// 是否对认证失败放弃由 `login_fail_exit` 配置决定
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ConfigError(_) | Self::DuplicateProxy(_))
    }
}
