/// 配置来源
///
/// 本地文件和远程 API 两种来源都只负责返回配置文本，
/// 解析统一交给 `ClientFullConfig::parse`，两者之间不共享任何可变状态
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// 本地配置文件
    File(PathBuf),
    /// 通过控制面 API 获取的隧道配置
    Remote {
        /// API 根地址，例如 `https://api.example.com/api/v2`
        api_base: String,
        /// 用户令牌（Bearer）
        token: String,
        /// 隧道 ID
        tunnel_id: String,
    },
}

impl ConfigSource {
    /// 本地文件来源（支持 `~` 展开）
    pub fn file(path: &str) -> Self {
        let expanded = shellexpand::tilde(path);
        ConfigSource::File(PathBuf::from(expanded.as_ref()))
    }

    /// 远程来源
    pub fn remote(
        api_base: impl Into<String>,
        token: impl Into<String>,
        tunnel_id: impl Into<String>,
    ) -> Self {
        ConfigSource::Remote {
            api_base: api_base.into(),
            token: token.into(),
            tunnel_id: tunnel_id.into(),
        }
    }

    /// 读取配置文本
    pub async fn fetch(&self) -> Result<String> {
        match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file {:?}", path)),
            ConfigSource::Remote {
                api_base,
                token,
                tunnel_id,
            } => {
                let url = format!(
                    "{}/tunnel/conf/id/{}",
                    api_base.trim_end_matches('/'),
                    tunnel_id
                );

                let response = reqwest::Client::new()
                    .get(&url)
                    .bearer_auth(token)
                    .send()
                    .await
                    .with_context(|| format!("Failed to request tunnel config from {}", url))?;

                let status = response.status();
                if !status.is_success() {
                    bail!(
                        "Config API returned status {} for tunnel {}, check the token and tunnel id",
                        status,
                        tunnel_id
                    );
                }

                let content = response
                    .text()
                    .await
                    .context("Failed to read tunnel config body")?;
                info!("Fetched configuration for tunnel {}", tunnel_id);
                Ok(content)
            }
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "file {}", path.display()),
            ConfigSource::Remote { tunnel_id, .. } => write!(f, "remote tunnel {}", tunnel_id),
        }
    }
}
