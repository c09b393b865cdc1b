/// 客户端运行上下文
///
/// 一个 `Service` 实例只有一个上下文，控制连接、工作连接和 visitor 共享它
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::control::{ControlSender, ControlState};
use super::nat_hole::NatHoleBroker;
use super::proxy_manager::{ProxyManager, ProxyState};
use crate::api::{ControlPlaneApi, ProxyLimit};
use crate::config::ClientConfig;
use crate::transport::TransportClient;

/// 服务事件（状态变化通知）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    StateChanged(ControlState),
    LoggedIn { run_id: String },
    ProxyChanged { name: String, state: ProxyState },
}

pub struct ClientContext {
    pub config: Arc<ClientConfig>,
    pub transport: Arc<dyn TransportClient>,
    pub proxies: ProxyManager,
    pub nat_holes: NatHoleBroker,
    pub api: Option<Arc<dyn ControlPlaneApi>>,
    events: broadcast::Sender<ServiceEvent>,
    state: watch::Sender<ControlState>,
    run_id: RwLock<String>,
    control: RwLock<Option<ControlSender>>,
    limit: RwLock<Option<ProxyLimit>>,
    work_conns: AtomicUsize,
}

impl ClientContext {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn TransportClient>,
        api: Option<Arc<dyn ControlPlaneApi>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(ControlState::Disconnected);
        let proxies = ProxyManager::new(events.clone(), api.clone(), config.user.clone());

        Self {
            config,
            transport,
            proxies,
            nat_holes: NatHoleBroker::default(),
            api,
            events,
            state,
            run_id: RwLock::new(String::new()),
            control: RwLock::new(None),
            limit: RwLock::new(None),
            work_conns: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    /// 切换控制连接状态，状态未变化时不发通知
    pub fn set_state(&self, next: ControlState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            let _ = self.events.send(ServiceEvent::StateChanged(next));
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ControlState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    pub fn run_id(&self) -> String {
        self.run_id.read().clone()
    }

    pub fn set_run_id(&self, run_id: impl Into<String>) {
        *self.run_id.write() = run_id.into();
    }

    /// 当前 Active 控制连接的发送端
    pub fn control_sender(&self) -> Option<ControlSender> {
        self.control.read().clone()
    }

    pub fn set_control_sender(&self, sender: Option<ControlSender>) {
        *self.control.write() = sender;
    }

    pub fn limit(&self) -> Option<ProxyLimit> {
        *self.limit.read()
    }

    pub fn set_limit(&self, limit: Option<ProxyLimit>) {
        *self.limit.write() = limit;
    }

    /// 正在进行中的工作连接数量
    pub fn active_work_conns(&self) -> usize {
        self.work_conns.load(Ordering::Relaxed)
    }

    pub(crate) fn work_conn_started(&self) {
        self.work_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn work_conn_finished(&self) {
        self.work_conns.fetch_sub(1, Ordering::Relaxed);
    }
}
