mod backoff;
pub mod config;
mod context;
mod control;
mod nat_hole;
mod proxy_manager;
mod udp;
mod visitor;
mod work_conn;

pub use backoff::Backoff;
pub use context::{ClientContext, ServiceEvent};
pub use control::{run_control, ControlSender, ControlState, SessionEnd};
pub use nat_hole::{HandshakePhase, NatHoleBroker, VisitingSession};
pub use proxy_manager::{ProxyManager, ProxyState, ProxyStatus};
pub use work_conn::connect_local;

use crate::api::{ControlPlaneApi, HttpControlPlaneApi, ProxyLimit};
use crate::config::ClientFullConfig;
use crate::error::{Result, TunnelError};
use crate::transport::{create_transport_client, TransportClient};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Instrument};

/// 服务状态快照
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ControlState,
    pub run_id: String,
    pub proxies: Vec<ProxyStatus>,
    pub active_work_conns: usize,
    pub limit: Option<ProxyLimit>,
}

/// 一个客户端实例：一套配置、一个 run id、一条控制连接
pub struct Service {
    ctx: Arc<ClientContext>,
    config: ClientFullConfig,
    shutdown: CancellationToken,
}

impl Service {
    /// 验证配置并按配置创建传输层；不做任何网络 I/O
    pub fn new(config: ClientFullConfig) -> Result<Self> {
        let transport = create_transport_client(&config.client)
            .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?;
        Self::with_transport(config, transport)
    }

    /// 使用指定的传输层创建服务
    pub fn with_transport(
        config: ClientFullConfig,
        transport: Arc<dyn TransportClient>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?;

        let api: Option<Arc<dyn ControlPlaneApi>> = match &config.client.api_url {
            Some(url) => {
                let token = config.client.api_token.clone().unwrap_or_default();
                let api = HttpControlPlaneApi::new(url, token, config::get_api_timeout())
                    .map_err(|e| TunnelError::config_error(e.to_string()))?;
                Some(Arc::new(api))
            }
            None => None,
        };

        let ctx = Arc::new(ClientContext::new(
            Arc::new(config.client.clone()),
            transport,
            api,
        ));

        Ok(Self {
            ctx,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            ctx: self.ctx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// 运行直到 `ServiceHandle::shutdown` 或遇到不可重试的错误
    pub async fn run(self) -> Result<()> {
        let Service {
            ctx,
            config,
            shutdown,
        } = self;

        for proxy in config.proxies {
            ctx.proxies.register(proxy).await?;
        }

        let visitors = TaskTracker::new();
        for visitor_config in config.visitors {
            let listener = match visitor::bind_visitor(&visitor_config).await {
                Ok(listener) => listener,
                Err(e) => {
                    shutdown.cancel();
                    return Err(e);
                }
            };
            visitors.spawn(visitor::serve_visitor(
                ctx.clone(),
                Arc::new(visitor_config),
                listener,
                shutdown.clone(),
            ));
        }
        visitors.close();

        let result = reconnect_loop(&ctx, &shutdown).await;

        shutdown.cancel();
        visitors.wait().await;
        if let Err(e) = &result {
            error!("Service stopped: {}", e);
        } else {
            info!("Service stopped");
        }
        result
    }
}

/// 控制连接的重连循环：退避重试，每次复用 run id
async fn reconnect_loop(ctx: &Arc<ClientContext>, shutdown: &CancellationToken) -> Result<()> {
    let reconnect = config::get_reconnect_config(&ctx.config.reconnect);
    let mut backoff = Backoff::new(&reconnect);
    let login_fail_exit = ctx.config.login_fail_exit;

    loop {
        let span = tracing::info_span!("session", server = %ctx.config.server_address());
        match run_control(ctx.clone(), shutdown.clone()).instrument(span).await {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::Lost(reason)) => {
                // 曾经进入过 Active，退避从头开始
                backoff.reset();
                if reason.is_auth_failed() && login_fail_exit {
                    return Err(reason);
                }
            }
            Err(e) => {
                if !e.is_retryable() || (e.is_auth_failed() && login_fail_exit) {
                    return Err(e);
                }
                warn!("Failed to establish control connection: {}", e);
            }
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }

        let delay = backoff.next_delay();
        info!(
            "Reconnecting in {:?} (attempt {})",
            delay,
            backoff.attempts()
        );
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = sleep(delay) => {}
        }
    }
}

/// 运行中服务的句柄
#[derive(Clone)]
pub struct ServiceHandle {
    ctx: Arc<ClientContext>,
    shutdown: CancellationToken,
}

impl ServiceHandle {
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.ctx.state(),
            run_id: self.ctx.run_id(),
            proxies: self.ctx.proxies.snapshot(),
            active_work_conns: self.ctx.active_work_conns(),
            limit: self.ctx.limit(),
        }
    }

    /// 关闭控制连接（尽量发送 CloseProxy）并停止重连
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.ctx.subscribe()
    }

    pub fn state_watch(&self) -> watch::Receiver<ControlState> {
        self.ctx.watch_state()
    }

    /// 运行期间动态增删代理
    pub fn proxies(&self) -> &ProxyManager {
        &self.ctx.proxies
    }
}
