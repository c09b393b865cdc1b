/// 代理管理
///
/// 持有所有已配置代理的运行状态，控制连接进入 Active 时提交注册，
/// 断开时同步将全部代理置为 Closed
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::context::ServiceEvent;
use super::control::ControlSender;
use crate::api::ControlPlaneApi;
use crate::auth;
use crate::config::ProxyConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::{CloseProxy, Message, NewProxy, NewProxyResp};

/// 代理运行状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ProxyState {
    /// 已提交（或等待提交）注册
    Registering,
    /// 服务器已确认
    Running,
    /// 已停止或控制连接断开
    Closed,
    /// 服务器拒绝，原因原样保留
    Error(String),
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyState::Registering => write!(f, "registering"),
            ProxyState::Running => write!(f, "running"),
            ProxyState::Closed => write!(f, "closed"),
            ProxyState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// 代理状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    pub proxy_type: String,
    pub state: ProxyState,
    /// 服务器分配的远程地址
    pub remote_addr: Option<String>,
}

struct ProxyEntry {
    config: Arc<ProxyConfig>,
    state: ProxyState,
    remote_addr: Option<String>,
    /// 显式停止的代理不会在重连后重新注册
    stopped: bool,
    /// 连续的本地拨号失败次数
    dial_failures: u32,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, ProxyEntry>,
    /// 保持配置顺序
    order: Vec<String>,
    /// 当前 Active 控制连接的发送端
    control: Option<ControlSender>,
    run_id: String,
}

impl Registry {
    fn set_state(&mut self, name: &str, state: ProxyState) -> Option<ProxyState> {
        let entry = self.entries.get_mut(name)?;
        if entry.state == state {
            return None;
        }
        entry.state = state.clone();
        Some(state)
    }
}

/// 代理管理器
pub struct ProxyManager {
    registry: Mutex<Registry>,
    events: broadcast::Sender<ServiceEvent>,
    api: Option<Arc<dyn ControlPlaneApi>>,
    user: String,
}

impl ProxyManager {
    pub fn new(
        events: broadcast::Sender<ServiceEvent>,
        api: Option<Arc<dyn ControlPlaneApi>>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            events,
            api,
            user: user.into(),
        }
    }

    fn emit(&self, name: &str, state: Option<ProxyState>) {
        if let Some(state) = state {
            debug!(proxy = %name, %state, "Proxy state changed");
            let _ = self.events.send(ServiceEvent::ProxyChanged {
                name: name.to_string(),
                state,
            });
        }
    }

    /// 注册代理
    ///
    /// 控制连接 Active 时立即发送 NewProxy，否则等待下一次 Active
    pub async fn register(&self, config: ProxyConfig) -> Result<()> {
        let name = config.name.clone();
        let pending = {
            let mut registry = self.registry.lock();
            if let Some(existing) = registry.entries.get(&name) {
                if !existing.stopped {
                    return Err(TunnelError::DuplicateProxy(name));
                }
            } else {
                registry.order.push(name.clone());
            }

            let config = Arc::new(config);
            registry.entries.insert(
                name.clone(),
                ProxyEntry {
                    config: config.clone(),
                    state: ProxyState::Registering,
                    remote_addr: None,
                    stopped: false,
                    dial_failures: 0,
                },
            );

            registry
                .control
                .clone()
                .map(|control| (control, config.to_new_proxy(), registry.run_id.clone()))
        };
        self.emit(&name, Some(ProxyState::Registering));

        match pending {
            Some((control, msg, run_id)) => self.submit(&control, msg, &run_id).await,
            None => {
                debug!(proxy = %name, "Control connection not active, registration queued");
                Ok(())
            }
        }
    }

    /// 停止代理
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let notify = {
            let mut registry = self.registry.lock();
            let control = registry.control.clone();
            let entry = registry
                .entries
                .get_mut(name)
                .filter(|entry| !entry.stopped)
                .ok_or_else(|| TunnelError::proxy_not_found(name))?;

            entry.stopped = true;
            entry.remote_addr = None;
            let was_live = matches!(entry.state, ProxyState::Running | ProxyState::Registering);
            entry.state = ProxyState::Closed;
            control.filter(|_| was_live)
        };
        self.emit(name, Some(ProxyState::Closed));
        info!(proxy = %name, "Proxy stopped");

        if let Some(control) = notify {
            control
                .send(Message::CloseProxy(CloseProxy {
                    proxy_name: name.to_string(),
                }))
                .await?;
        }
        Ok(())
    }

    /// 处理服务器的注册结果
    pub fn on_response(&self, resp: NewProxyResp) {
        let changed = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.entries.get_mut(&resp.proxy_name) else {
                warn!(proxy = %resp.proxy_name, "NewProxyResp for unknown proxy");
                return;
            };
            if entry.state != ProxyState::Registering || entry.stopped {
                debug!(proxy = %resp.proxy_name, state = %entry.state, "Ignoring stale NewProxyResp");
                return;
            }

            if resp.error.is_empty() {
                entry.remote_addr = Some(resp.remote_addr.clone()).filter(|a| !a.is_empty());
                registry.set_state(&resp.proxy_name, ProxyState::Running)
            } else {
                registry.set_state(&resp.proxy_name, ProxyState::Error(resp.error.clone()))
            }
        };

        if resp.error.is_empty() {
            info!(
                proxy = %resp.proxy_name,
                remote_addr = %resp.remote_addr,
                "Proxy started"
            );
        } else {
            warn!(proxy = %resp.proxy_name, "Proxy registration rejected: {}", resp.error);
        }
        self.emit(&resp.proxy_name, changed);
    }

    /// 服务器主动关闭代理
    pub fn on_remote_close(&self, name: &str, reason: &str) {
        let changed = {
            let mut registry = self.registry.lock();
            registry.set_state(name, ProxyState::Error(reason.to_string()))
        };
        self.emit(name, changed);
    }

    /// 控制连接进入 Active：记录发送端，所有未停止的代理回到 Registering
    ///
    /// 返回待提交的注册消息，由调用方交给 `submit_all` 在后台发送
    pub fn activate(&self, control: ControlSender, run_id: &str) -> Vec<NewProxy> {
        let (submissions, changes) = {
            let mut registry = self.registry.lock();
            registry.control = Some(control.clone());
            registry.run_id = run_id.to_string();

            let names: Vec<String> = registry.order.clone();
            let mut submissions = Vec::new();
            let mut changes = Vec::new();
            for name in names {
                let Some(entry) = registry.entries.get_mut(&name) else {
                    continue;
                };
                if entry.stopped {
                    continue;
                }
                entry.remote_addr = None;
                entry.dial_failures = 0;
                submissions.push(entry.config.to_new_proxy());
                changes.push((name.clone(), registry.set_state(&name, ProxyState::Registering)));
            }
            (submissions, changes)
        };

        for (name, change) in changes {
            self.emit(&name, change);
        }
        submissions
    }

    /// 依次提交注册消息（含可选的控制面校验）
    pub async fn submit_all(&self, control: &ControlSender, run_id: &str, submissions: Vec<NewProxy>) {
        info!("Registering {} proxies", submissions.len());
        for msg in submissions {
            if let Err(e) = self.submit(control, msg, run_id).await {
                warn!("Failed to submit proxy registration: {}", e);
            }
        }
    }

    /// 记录一次本地拨号失败，连续失败达到 `limit` 次时代理进入 Error
    ///
    /// 之后的工作连接请求仍会照常处理
    pub fn record_dial_failure(&self, name: &str, reason: &str, limit: u32) {
        let changed = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.entries.get_mut(name) else {
                return;
            };
            entry.dial_failures += 1;
            let failures = entry.dial_failures;
            if failures < limit || entry.state != ProxyState::Running {
                return;
            }
            warn!(proxy = %name, failures, "Local service unreachable: {}", reason);
            registry.set_state(
                name,
                ProxyState::Error(format!(
                    "local service unreachable after {} attempts: {}",
                    failures, reason
                )),
            )
        };
        self.emit(name, changed);
    }

    /// 本地拨号成功，清零连续失败计数
    pub fn record_dial_success(&self, name: &str) {
        if let Some(entry) = self.registry.lock().entries.get_mut(name) {
            entry.dial_failures = 0;
        }
    }

    /// 控制连接断开：全部置为 Closed
    pub fn on_closed(&self) {
        let changes: Vec<(String, Option<ProxyState>)> = {
            let mut registry = self.registry.lock();
            registry.control = None;
            let names: Vec<String> = registry.order.clone();
            names
                .into_iter()
                .map(|name| {
                    if let Some(entry) = registry.entries.get_mut(&name) {
                        entry.remote_addr = None;
                    }
                    let change = registry.set_state(&name, ProxyState::Closed);
                    (name, change)
                })
                .collect()
        };

        for (name, change) in changes {
            self.emit(&name, change);
        }
    }

    /// 可选的控制面校验，然后发送 NewProxy
    async fn submit(&self, control: &ControlSender, msg: NewProxy, run_id: &str) -> Result<()> {
        if let Some(api) = &self.api {
            if let Err(e) = api
                .check_proxy(&self.user, &msg, run_id, auth::now_timestamp())
                .await
            {
                let reason = e.to_string();
                let changed = {
                    let mut registry = self.registry.lock();
                    // 校验期间控制连接可能已经断开
                    let registering = registry
                        .entries
                        .get(&msg.proxy_name)
                        .is_some_and(|entry| entry.state == ProxyState::Registering);
                    if registering {
                        registry.set_state(&msg.proxy_name, ProxyState::Error(reason.clone()))
                    } else {
                        None
                    }
                };
                self.emit(&msg.proxy_name, changed);
                return Err(TunnelError::registration_failed(&msg.proxy_name, reason));
            }
        }

        debug!(proxy = %msg.proxy_name, proxy_type = %msg.proxy_type, "Sending NewProxy");
        control.send(Message::NewProxy(msg)).await
    }

    /// 查询代理状态
    pub fn status(&self, name: &str) -> Result<ProxyState> {
        self.registry
            .lock()
            .entries
            .get(name)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| TunnelError::proxy_not_found(name))
    }

    /// 所有代理的状态快照（按配置顺序）
    pub fn snapshot(&self) -> Vec<ProxyStatus> {
        let registry = self.registry.lock();
        registry
            .order
            .iter()
            .filter_map(|name| registry.entries.get(name))
            .map(|entry| ProxyStatus {
                name: entry.config.name.clone(),
                proxy_type: entry.config.proxy_type.to_string(),
                state: entry.state.clone(),
                remote_addr: entry.remote_addr.clone(),
            })
            .collect()
    }

    /// 工作连接使用的本地目标（已停止的代理不再提供）
    pub fn local_target(&self, name: &str) -> Option<Arc<ProxyConfig>> {
        self.registry
            .lock()
            .entries
            .get(name)
            .filter(|entry| !entry.stopped)
            .map(|entry| entry.config.clone())
    }

    /// 未停止的代理数量（随 Login 上报）
    pub fn active_count(&self) -> usize {
        self.registry
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.stopped)
            .count()
    }

    /// 正在运行的代理名称
    pub fn running(&self) -> Vec<String> {
        let registry = self.registry.lock();
        registry
            .order
            .iter()
            .filter(|name| {
                registry
                    .entries
                    .get(*name)
                    .is_some_and(|entry| entry.state == ProxyState::Running)
            })
            .cloned()
            .collect()
    }
}
