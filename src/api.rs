/// 控制面 API 客户端
///
/// 通过 HTTP 查询令牌、代理合法性以及限速信息，均为简单的请求/响应调用
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ProxyType;
use crate::protocol::NewProxy;

/// API 调用错误
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API returned HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Token check failed: {0}")]
    CheckTokenFailed(String),

    #[error("Proxy check failed: {0}")]
    CheckProxyFailed(String),

    #[error("Invalid API url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed API response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// 限速信息（字节/秒，0 表示不限）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyLimit {
    #[serde(rename = "max-in", default)]
    pub max_in: u64,
    #[serde(rename = "max-out", default)]
    pub max_out: u64,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    status: Option<u16>,
    #[serde(default)]
    message: String,
}

/// 控制面 API 接口
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    /// 校验用户令牌
    async fn check_token(&self, user: &str, token: &str, timestamp: i64) -> Result<(), ApiError>;

    /// 校验代理描述
    async fn check_proxy(
        &self,
        user: &str,
        proxy: &NewProxy,
        run_id: &str,
        timestamp: i64,
    ) -> Result<(), ApiError>;

    /// 获取限速信息
    async fn get_limit(&self, user: &str, timestamp: i64) -> Result<ProxyLimit, ApiError>;
}

/// 基于 reqwest 的控制面 API 实现
pub struct HttpControlPlaneApi {
    base: Url,
    api_token: String,
    client: reqwest::Client,
}

impl HttpControlPlaneApi {
    /// `timeout` 约束每个请求从发出到读完响应体的总时间
    pub fn new(base: &str, api_token: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: Url::parse(base)?,
            api_token: api_token.into(),
            client,
        })
    }

    fn build_url(&self, action: &str, user: &str, timestamp: i64, extra: &[(&str, String)]) -> Url {
        let mut url = self.base.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("action", action)
                .append_pair("user", user)
                .append_pair("timestamp", &timestamp.to_string())
                .append_pair("apitoken", &self.api_token);
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        url
    }

    async fn get_body(&self, url: Url) -> Result<String, ApiError> {
        debug!("Control plane API request: action={:?}", url.query_pairs().next());
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

/// 代理校验所需的查询参数
fn proxy_query(proxy: &NewProxy, run_id: &str) -> Result<Vec<(&'static str, String)>, ApiError> {
    let mut params = vec![
        ("proxy_name", proxy.proxy_name.clone()),
        ("proxy_type", proxy.proxy_type.to_string()),
        ("run_id", run_id.to_string()),
        ("group", proxy.group.clone()),
        ("group_key", proxy.group_key.clone()),
    ];

    match proxy.proxy_type {
        ProxyType::Http | ProxyType::Https => {
            params.push(("domain", serde_json::to_string(&proxy.custom_domains)?));
        }
        ProxyType::Tcp | ProxyType::Udp => {
            params.push(("remote_port", proxy.remote_port.to_string()));
        }
        ProxyType::Stcp | ProxyType::Xtcp => {
            params.push(("remote_port", proxy.remote_port.to_string()));
            params.push(("sk", proxy.sk.clone()));
        }
    }

    Ok(params)
}

#[async_trait]
impl ControlPlaneApi for HttpControlPlaneApi {
    async fn check_token(&self, user: &str, token: &str, timestamp: i64) -> Result<(), ApiError> {
        let url = self.build_url("checktoken", user, timestamp, &[("token", token.to_string())]);
        let body = self.get_body(url).await?;
        let response: CheckResponse = serde_json::from_str(&body)?;
        if !response.success {
            return Err(ApiError::CheckTokenFailed(response.message));
        }
        Ok(())
    }

    async fn check_proxy(
        &self,
        user: &str,
        proxy: &NewProxy,
        run_id: &str,
        timestamp: i64,
    ) -> Result<(), ApiError> {
        let params = proxy_query(proxy, run_id)?;
        let url = self.build_url("checkproxy", user, timestamp, &params);
        let body = self.get_body(url).await?;
        let response: CheckResponse = serde_json::from_str(&body)?;
        if !response.success {
            return Err(ApiError::CheckProxyFailed(response.message));
        }
        Ok(())
    }

    async fn get_limit(&self, user: &str, timestamp: i64) -> Result<ProxyLimit, ApiError> {
        let url = self.build_url("getlimit", user, timestamp, &[]);
        let body = self.get_body(url).await?;

        // 响应体可能携带自身的状态码
        let envelope: StatusEnvelope = serde_json::from_str(&body)?;
        if let Some(status) = envelope.status {
            if status != 200 {
                return Err(ApiError::HttpStatus {
                    status,
                    message: envelope.message,
                });
            }
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// 启动只应答一次的 HTTP 服务，返回地址和收到的请求行
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let text = String::from_utf8_lossy(&request).to_string();
            let _ = tx.send(text.lines().next().unwrap_or_default().to_string());

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        (format!("http://{}/api", addr), rx)
    }

    #[test]
    fn test_proxy_query_per_type() {
        let http = NewProxy {
            proxy_name: "web".into(),
            proxy_type: ProxyType::Http,
            custom_domains: vec!["a.example.com".into()],
            ..Default::default()
        };
        let params = proxy_query(&http, "r1").unwrap();
        assert!(params.contains(&("domain", "[\"a.example.com\"]".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "remote_port"));

        let stcp = NewProxy {
            proxy_name: "secret".into(),
            proxy_type: ProxyType::Stcp,
            sk: "k1".into(),
            ..Default::default()
        };
        let params = proxy_query(&stcp, "r1").unwrap();
        assert!(params.contains(&("sk", "k1".to_string())));
        assert!(params.contains(&("run_id", "r1".to_string())));
    }

    #[tokio::test]
    async fn test_check_token_success() {
        let (base, request) = serve_once("200 OK", r#"{"success":true,"message":""}"#).await;
        let api = HttpControlPlaneApi::new(&base, "api-secret", Duration::from_secs(5)).unwrap();
        api.check_token("alice", "t0k", 100).await.unwrap();

        let line = request.await.unwrap();
        assert!(line.starts_with("GET /api?action=checktoken"));
        assert!(line.contains("user=alice"));
        assert!(line.contains("apitoken=api-secret"));
    }

    #[tokio::test]
    async fn test_check_proxy_rejected() {
        let (base, _request) =
            serve_once("200 OK", r#"{"success":false,"message":"port in use"}"#).await;
        let api = HttpControlPlaneApi::new(&base, "api-secret", Duration::from_secs(5)).unwrap();
        let proxy = NewProxy {
            proxy_name: "ssh".into(),
            proxy_type: ProxyType::Tcp,
            remote_port: 6000,
            ..Default::default()
        };

        match api.check_proxy("alice", &proxy, "r1", 100).await {
            Err(ApiError::CheckProxyFailed(message)) => assert_eq!(message, "port in use"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let (base, _request) = serve_once("403 Forbidden", "{}").await;
        let api = HttpControlPlaneApi::new(&base, "api-secret", Duration::from_secs(5)).unwrap();
        match api.check_token("alice", "t0k", 100).await {
            Err(ApiError::HttpStatus { status, .. }) => assert_eq!(status, 403),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_api_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        tokio::spawn(async move {
            // 接受连接但从不应答
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let api = HttpControlPlaneApi::new(&base, "api-secret", Duration::from_millis(300)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            api.check_token("alice", "t0k", 100),
        )
        .await
        .expect("API call was not bounded");
        match result {
            Err(ApiError::Request(e)) => assert!(e.is_timeout()),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_limit() {
        let (base, _request) =
            serve_once("200 OK", r#"{"status":200,"max-in":1024,"max-out":2048}"#).await;
        let api = HttpControlPlaneApi::new(&base, "api-secret", Duration::from_secs(5)).unwrap();
        let limit = api.get_limit("alice", 100).await.unwrap();
        assert_eq!(
            limit,
            ProxyLimit {
                max_in: 1024,
                max_out: 2048
            }
        );
    }
}
