use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{ClientConfig, ClientFullConfig, ProxyConfig, ProxyType, VisitorConfig};

/// 单条消息负载上限的最小值，低于该值无法容纳登录消息
const MIN_MESSAGE_SIZE: u64 = 512;

/// 配置验证器 - 负责所有配置验证逻辑，在任何网络 I/O 之前执行
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证客户端公共配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        Self::validate_address(&config.server_addr, "Client server_addr")?;
        Self::validate_port(config.server_port, "Client server_port")?;

        if config.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than 0");
        }
        if config.heartbeat_timeout_multiplier == 0 {
            bail!("heartbeat_timeout_multiplier must be at least 1");
        }
        for (name, secs) in [
            ("login_timeout_secs", config.login_timeout_secs),
            ("dial_timeout_secs", config.dial_timeout_secs),
            ("work_conn_ready_timeout_secs", config.work_conn_ready_timeout_secs),
            ("nat_hole_timeout_secs", config.nat_hole_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{} must be greater than 0", name);
            }
        }
        if config.max_message_size < MIN_MESSAGE_SIZE {
            bail!(
                "max_message_size must be at least {} bytes (current: {})",
                MIN_MESSAGE_SIZE,
                config.max_message_size
            );
        }

        let reconnect = &config.reconnect;
        if reconnect.initial_delay_ms == 0 {
            bail!("reconnect.initial_delay_ms must be greater than 0");
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            bail!(
                "reconnect.max_delay_ms ({}) cannot be less than initial_delay_ms ({})",
                reconnect.max_delay_ms,
                reconnect.initial_delay_ms
            );
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            bail!("reconnect.jitter must be within 0.0 ~ 1.0");
        }

        if config.token.is_empty() {
            warn!("Client token is empty, the server must allow anonymous login");
        }

        if config.api_url.is_some() && config.api_token.is_none() {
            bail!("api_token is required when api_url is set");
        }

        Ok(())
    }

    /// 验证单个代理配置（类型相关字段）
    pub fn validate_proxy(proxy: &ProxyConfig) -> Result<()> {
        Self::validate_name(&proxy.name, "Proxy")?;
        Self::validate_address(&proxy.local_ip, &format!("Proxy '{}' local_ip", proxy.name))?;
        Self::validate_port(proxy.local_port, &format!("Proxy '{}' local_port", proxy.name))?;

        match proxy.proxy_type {
            ProxyType::Http | ProxyType::Https => {
                if proxy.custom_domains.is_empty() && proxy.subdomain.trim().is_empty() {
                    bail!(
                        "Proxy '{}': custom_domains or subdomain is required for {} proxies",
                        proxy.name,
                        proxy.proxy_type
                    );
                }
                if proxy.custom_domains.iter().any(|d| d.trim().is_empty()) {
                    bail!("Proxy '{}': custom domain cannot be empty", proxy.name);
                }
            }
            ProxyType::Stcp | ProxyType::Xtcp => {
                if proxy.sk.is_empty() {
                    bail!(
                        "Proxy '{}': sk is required for {} proxies",
                        proxy.name,
                        proxy.proxy_type
                    );
                }
            }
            ProxyType::Tcp | ProxyType::Udp => {}
        }

        if proxy.proxy_type == ProxyType::Https && !proxy.locations.is_empty() {
            bail!("Proxy '{}': locations are only supported by http proxies", proxy.name);
        }

        if !proxy.group.is_empty() && proxy.group_key.is_empty() {
            warn!(
                "Proxy '{}' joins group '{}' without group_key",
                proxy.name, proxy.group
            );
        }

        Ok(())
    }

    /// 验证 visitor 配置
    pub fn validate_visitor(visitor: &VisitorConfig) -> Result<()> {
        Self::validate_name(&visitor.name, "Visitor")?;
        Self::validate_name(
            &visitor.server_name,
            &format!("Visitor '{}' server_name", visitor.name),
        )?;
        Self::validate_address(
            &visitor.bind_addr,
            &format!("Visitor '{}' bind_addr", visitor.name),
        )?;
        Self::validate_port(
            visitor.bind_port,
            &format!("Visitor '{}' bind_port", visitor.name),
        )?;

        if !visitor.proxy_type.requires_secret_key() {
            bail!(
                "Visitor '{}': type must be stcp or xtcp, got {}",
                visitor.name,
                visitor.proxy_type
            );
        }
        if visitor.sk.is_empty() {
            bail!("Visitor '{}': sk cannot be empty", visitor.name);
        }

        Ok(())
    }

    /// 验证客户端完整配置
    pub fn validate_client_full_config(config: &ClientFullConfig) -> Result<()> {
        Self::validate_client_config(&config.client)?;

        if config.proxies.is_empty() && config.visitors.is_empty() {
            bail!("No proxy or visitor configurations defined");
        }

        let mut seen_names = HashSet::new();
        let mut seen_remote_ports = HashSet::new();

        for proxy in &config.proxies {
            Self::validate_proxy(proxy)?;

            if !seen_names.insert(proxy.name.as_str()) {
                bail!(
                    "Duplicate proxy name '{}': each proxy must have a unique name",
                    proxy.name
                );
            }

            // 同一协议下的固定远程端口不能重复
            if proxy.remote_port != 0
                && matches!(proxy.proxy_type, ProxyType::Tcp | ProxyType::Udp)
                && !seen_remote_ports.insert((proxy.proxy_type, proxy.remote_port))
            {
                bail!(
                    "Duplicate {} remote_port {}: proxy '{}' conflicts with another proxy",
                    proxy.proxy_type,
                    proxy.remote_port,
                    proxy.name
                );
            }
        }

        let mut seen_visitor_names = HashSet::new();
        let mut seen_bind = HashSet::new();

        for visitor in &config.visitors {
            Self::validate_visitor(visitor)?;

            if !seen_visitor_names.insert(visitor.name.as_str()) {
                bail!(
                    "Duplicate visitor name '{}': each visitor must have a unique name",
                    visitor.name
                );
            }

            if !seen_bind.insert((visitor.bind_addr.as_str(), visitor.bind_port)) {
                bail!(
                    "Duplicate visitor binding {}: each visitor must listen on a different address/port",
                    visitor.bind_address()
                );
            }
        }

        Ok(())
    }
}
