use crate::config::ReconnectConfig;
use std::time::Duration;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "REVTUN_";

/// 本地服务连接重试次数 - 可通过环境变量 REVTUN_LOCAL_CONNECT_RETRIES 覆盖
pub const LOCAL_CONNECT_RETRIES: u32 = 1;
/// 本地服务连接重试延迟（毫秒）- 可通过环境变量 REVTUN_LOCAL_RETRY_DELAY_MS 覆盖
pub const LOCAL_RETRY_DELAY_MS: u64 = 200;
/// TCP keepalive 空闲时间（秒），0 表示关闭 - 可通过环境变量 REVTUN_TCP_KEEPALIVE_SECS 覆盖
pub const TCP_KEEPALIVE_SECS: u64 = 60;
/// 连续本地拨号失败多少次后代理进入 Error - 可通过环境变量 REVTUN_LOCAL_DIAL_FAILURE_LIMIT 覆盖
pub const LOCAL_DIAL_FAILURE_LIMIT: u32 = 3;
/// 签名时间戳允许的最大偏差（秒）- 可通过环境变量 REVTUN_SIGN_MAX_SKEW_SECS 覆盖
pub const SIGN_MAX_SKEW_SECS: u64 = 300;
/// 控制面 API 请求超时（秒）- 可通过环境变量 REVTUN_API_TIMEOUT_SECS 覆盖
pub const API_TIMEOUT_SECS: u64 = 10;
/// 控制连接写队列容量 - 可通过环境变量 REVTUN_CONTROL_QUEUE_SIZE 覆盖
pub const CONTROL_QUEUE_SIZE: usize = 256;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn get_local_retries() -> u32 {
    env_or("LOCAL_CONNECT_RETRIES", LOCAL_CONNECT_RETRIES).max(1)
}

pub fn get_local_retry_delay() -> Duration {
    Duration::from_millis(env_or("LOCAL_RETRY_DELAY_MS", LOCAL_RETRY_DELAY_MS))
}

pub fn get_tcp_keepalive() -> Option<Duration> {
    match env_or("TCP_KEEPALIVE_SECS", TCP_KEEPALIVE_SECS) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

pub fn get_local_dial_failure_limit() -> u32 {
    env_or("LOCAL_DIAL_FAILURE_LIMIT", LOCAL_DIAL_FAILURE_LIMIT).max(1)
}

pub fn get_sign_max_skew() -> Duration {
    Duration::from_secs(env_or("SIGN_MAX_SKEW_SECS", SIGN_MAX_SKEW_SECS))
}

pub fn get_api_timeout() -> Duration {
    Duration::from_secs(env_or("API_TIMEOUT_SECS", API_TIMEOUT_SECS).max(1))
}

pub fn get_control_queue_size() -> usize {
    env_or("CONTROL_QUEUE_SIZE", CONTROL_QUEUE_SIZE).max(1)
}

/// 重连退避参数 - 可通过环境变量 REVTUN_RECONNECT_INITIAL_DELAY_MS / REVTUN_RECONNECT_MAX_DELAY_MS 覆盖
pub fn get_reconnect_config(base: &ReconnectConfig) -> ReconnectConfig {
    let initial_delay_ms = env_or("RECONNECT_INITIAL_DELAY_MS", base.initial_delay_ms).max(1);
    let max_delay_ms = env_or("RECONNECT_MAX_DELAY_MS", base.max_delay_ms).max(initial_delay_ms);
    ReconnectConfig {
        initial_delay_ms,
        max_delay_ms,
        jitter: base.jitter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_override() {
        std::env::set_var("REVTUN_LOCAL_RETRY_DELAY_MS", "15");
        assert_eq!(get_local_retry_delay(), Duration::from_millis(15));
        std::env::remove_var("REVTUN_LOCAL_RETRY_DELAY_MS");
        assert_eq!(
            get_local_retry_delay(),
            Duration::from_millis(LOCAL_RETRY_DELAY_MS)
        );
    }

    #[test]
    fn test_reconnect_override_keeps_order() {
        let base = ReconnectConfig::default();
        std::env::set_var("REVTUN_RECONNECT_INITIAL_DELAY_MS", "60000");
        let config = get_reconnect_config(&base);
        std::env::remove_var("REVTUN_RECONNECT_INITIAL_DELAY_MS");
        assert_eq!(config.initial_delay_ms, 60_000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.jitter, base.jitter);
    }

    #[test]
    fn test_invalid_env_falls_back() {
        std::env::set_var("REVTUN_CONTROL_QUEUE_SIZE", "many");
        assert_eq!(get_control_queue_size(), CONTROL_QUEUE_SIZE);
        std::env::remove_var("REVTUN_CONTROL_QUEUE_SIZE");
    }
}
