use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::transport::TransportType;

use super::{
    validator::ConfigValidator, ClientConfig, ClientFullConfig, ProxyConfig, ProxyType,
    ReconnectConfig, VisitorConfig,
};

/// ClientConfig Builder
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    server_addr: Option<String>,
    server_port: Option<u16>,
    transport: Option<TransportType>,
    tcp_mux: bool,
    user: String,
    token: String,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_timeout_multiplier: Option<u32>,
    login_timeout_secs: Option<u64>,
    work_conn_ready_timeout_secs: Option<u64>,
    nat_hole_timeout_secs: Option<u64>,
    max_message_size: Option<u64>,
    login_fail_exit: bool,
    skip_verify: bool,
    ca_cert_path: Option<PathBuf>,
    tls_server_name: Option<String>,
    reconnect: Option<ReconnectConfig>,
    api_url: Option<String>,
    api_token: Option<String>,
}

impl ClientConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置服务器地址
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = Some(addr.into());
        self
    }

    /// 设置服务器端口
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = Some(port);
        self
    }

    /// 设置传输类型
    pub fn transport(mut self, transport: TransportType) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 设置是否启用连接复用
    pub fn tcp_mux(mut self, enabled: bool) -> Self {
        self.tcp_mux = enabled;
        self
    }

    /// 设置用户名
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// 设置认证令牌
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// 设置心跳间隔（秒）与超时倍数
    pub fn heartbeat(mut self, interval_secs: u64, timeout_multiplier: u32) -> Self {
        self.heartbeat_interval_secs = Some(interval_secs);
        self.heartbeat_timeout_multiplier = Some(timeout_multiplier);
        self
    }

    /// 设置登录超时（秒）
    pub fn login_timeout_secs(mut self, secs: u64) -> Self {
        self.login_timeout_secs = Some(secs);
        self
    }

    /// 设置工作连接等待就绪超时（秒）
    pub fn work_conn_ready_timeout_secs(mut self, secs: u64) -> Self {
        self.work_conn_ready_timeout_secs = Some(secs);
        self
    }

    /// 设置 NAT 打洞超时（秒）
    pub fn nat_hole_timeout_secs(mut self, secs: u64) -> Self {
        self.nat_hole_timeout_secs = Some(secs);
        self
    }

    /// 设置单条消息负载上限
    pub fn max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// 设置登录失败时是否退出
    pub fn login_fail_exit(mut self, exit: bool) -> Self {
        self.login_fail_exit = exit;
        self
    }

    /// 设置是否跳过证书验证
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// 设置 CA 证书路径
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// 设置 TLS SNI 名称
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    /// 设置重连退避策略
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// 启用控制面 API
    pub fn api(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self.api_token = Some(token.into());
        self
    }

    /// 构建 ClientConfig 并验证
    pub fn build(self) -> Result<ClientConfig> {
        let config = ClientConfig {
            server_addr: self.server_addr.context("server_addr is required")?,
            server_port: self.server_port.unwrap_or_else(super::default_server_port),
            transport: self.transport.unwrap_or_default(),
            tcp_mux: self.tcp_mux,
            user: self.user,
            token: self.token,
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or_else(super::default_heartbeat_interval_secs),
            heartbeat_timeout_multiplier: self
                .heartbeat_timeout_multiplier
                .unwrap_or_else(super::default_heartbeat_timeout_multiplier),
            login_timeout_secs: self
                .login_timeout_secs
                .unwrap_or_else(super::default_login_timeout_secs),
            dial_timeout_secs: super::default_dial_timeout_secs(),
            work_conn_ready_timeout_secs: self
                .work_conn_ready_timeout_secs
                .unwrap_or_else(super::default_work_conn_ready_timeout_secs),
            nat_hole_timeout_secs: self
                .nat_hole_timeout_secs
                .unwrap_or_else(super::default_nat_hole_timeout_secs),
            max_message_size: self
                .max_message_size
                .unwrap_or_else(super::default_max_message_size),
            login_fail_exit: self.login_fail_exit,
            authenticate_heartbeats: false,
            authenticate_new_work_conns: false,
            tls_server_name: self.tls_server_name,
            skip_verify: self.skip_verify,
            ca_cert_path: self.ca_cert_path,
            reconnect: self.reconnect.unwrap_or_default(),
            api_url: self.api_url,
            api_token: self.api_token,
            log_level: super::default_log_level(),
        };

        ConfigValidator::validate_client_config(&config)?;

        Ok(config)
    }
}

/// ProxyConfig Builder
#[derive(Debug)]
pub struct ProxyConfigBuilder {
    proxy: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// 创建新的 Builder
    pub fn new(name: impl Into<String>, proxy_type: ProxyType) -> Self {
        Self {
            proxy: ProxyConfig {
                name: name.into(),
                proxy_type,
                local_ip: super::default_local_ip(),
                local_port: 0,
                remote_port: 0,
                subdomain: String::new(),
                custom_domains: Vec::new(),
                locations: Vec::new(),
                http_user: String::new(),
                http_pwd: String::new(),
                host_header_rewrite: String::new(),
                group: String::new(),
                group_key: String::new(),
                sk: String::new(),
                use_encryption: false,
                use_compression: false,
                metas: HashMap::new(),
            },
        }
    }

    /// 设置本地服务地址
    pub fn local_ip(mut self, ip: impl Into<String>) -> Self {
        self.proxy.local_ip = ip.into();
        self
    }

    /// 设置本地服务端口
    pub fn local_port(mut self, port: u16) -> Self {
        self.proxy.local_port = port;
        self
    }

    /// 设置服务器端口
    pub fn remote_port(mut self, port: u16) -> Self {
        self.proxy.remote_port = port;
        self
    }

    /// 设置子域名
    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.proxy.subdomain = subdomain.into();
        self
    }

    /// 设置自定义域名
    pub fn custom_domains(mut self, domains: Vec<String>) -> Self {
        self.proxy.custom_domains = domains;
        self
    }

    /// 设置 HTTP Basic 认证
    pub fn http_auth(mut self, user: impl Into<String>, pwd: impl Into<String>) -> Self {
        self.proxy.http_user = user.into();
        self.proxy.http_pwd = pwd.into();
        self
    }

    /// 设置 Host 头重写
    pub fn host_header_rewrite(mut self, host: impl Into<String>) -> Self {
        self.proxy.host_header_rewrite = host.into();
        self
    }

    /// 设置负载均衡分组
    pub fn group(mut self, group: impl Into<String>, group_key: impl Into<String>) -> Self {
        self.proxy.group = group.into();
        self.proxy.group_key = group_key.into();
        self
    }

    /// 设置共享密钥
    pub fn sk(mut self, sk: impl Into<String>) -> Self {
        self.proxy.sk = sk.into();
        self
    }

    /// 构建 ProxyConfig 并验证
    pub fn build(self) -> Result<ProxyConfig> {
        ConfigValidator::validate_proxy(&self.proxy)?;
        Ok(self.proxy)
    }
}

/// ClientFullConfig Builder
#[derive(Debug, Default)]
pub struct ClientFullConfigBuilder {
    client: Option<ClientConfig>,
    proxies: Vec<ProxyConfig>,
    visitors: Vec<VisitorConfig>,
}

impl ClientFullConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置客户端配置
    pub fn client(mut self, client: ClientConfig) -> Self {
        self.client = Some(client);
        self
    }

    /// 添加 proxy 配置
    pub fn add_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxies.push(proxy);
        self
    }

    /// 批量添加 proxy 配置
    pub fn proxies(mut self, proxies: Vec<ProxyConfig>) -> Self {
        self.proxies = proxies;
        self
    }

    /// 添加 visitor 配置
    pub fn add_visitor(mut self, visitor: VisitorConfig) -> Self {
        self.visitors.push(visitor);
        self
    }

    /// 构建 ClientFullConfig 并验证
    pub fn build(self) -> Result<ClientFullConfig> {
        let config = ClientFullConfig {
            client: self.client.context("client config is required")?,
            proxies: self.proxies,
            visitors: self.visitors,
        };

        ConfigValidator::validate_client_full_config(&config)?;

        Ok(config)
    }
}
