/// 控制连接
///
/// 每次调用 `run_control` 对应一代控制连接：拨号、登录、心跳、消息分发，
/// 最后按固定顺序拆除。该代派生的所有任务都挂在同一个取消令牌上
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::context::{ClientContext, ServiceEvent};
use super::{nat_hole, work_conn};
use crate::auth;
use crate::error::{Result, TunnelError};
use crate::protocol::{
    read_msg, write_msg, CloseProxy, Login, LoginResp, Message, MessageCodec, NewProxy, Ping,
    PROTOCOL_VERSION,
};
use crate::transport::BoxedTransport;

/// 拆除时等待写队列排空的上限
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// 控制连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Disconnected,
    Connecting,
    LoggingIn,
    Active,
    Closing,
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlState::Disconnected => "disconnected",
            ControlState::Connecting => "connecting",
            ControlState::LoggingIn => "logging_in",
            ControlState::Active => "active",
            ControlState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// 控制连接写队列的发送端
///
/// 所有出站控制消息都经过这里，由唯一的写任务串行写出
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Message>,
}

impl ControlSender {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TunnelError::TransportError("control connection is closed".into()))
    }

    /// 不等待队列空位，队列满或已关闭时丢弃
    pub fn try_send(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 一代控制连接的结束方式
#[derive(Debug)]
pub enum SessionEnd {
    /// 收到关闭请求
    Shutdown,
    /// Active 之后断开，携带原因
    Lost(TunnelError),
}

/// 一代控制连接共享的取消令牌和断开原因
struct Generation {
    token: CancellationToken,
    reason: Mutex<Option<TunnelError>>,
}

impl Generation {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// 记录第一个断开原因并取消该代
    fn lose(&self, err: TunnelError) {
        {
            let mut reason = self.reason.lock();
            if reason.is_none() {
                *reason = Some(err);
            }
        }
        self.token.cancel();
    }

    fn take_reason(&self) -> TunnelError {
        self.reason
            .lock()
            .take()
            .unwrap_or_else(|| TunnelError::TransportError("control connection cancelled".into()))
    }
}

/// 运行一代控制连接，直到断开或收到关闭请求
///
/// 进入 Active 之前的失败（拨号、登录）以 `Err` 返回；Active 之后的断开以
/// `SessionEnd::Lost` 返回。无论哪种情况，返回时状态都是 Disconnected
pub async fn run_control(ctx: Arc<ClientContext>, shutdown: CancellationToken) -> Result<SessionEnd> {
    ctx.set_state(ControlState::Connecting);

    let conn = match connect_and_login(&ctx, &shutdown).await {
        Ok(Some(conn)) => conn,
        Ok(None) => {
            ctx.transport.close().await;
            ctx.set_state(ControlState::Disconnected);
            return Ok(SessionEnd::Shutdown);
        }
        Err(e) => {
            ctx.transport.close().await;
            ctx.set_state(ControlState::Disconnected);
            return Err(e);
        }
    };

    let run_id = ctx.run_id();
    let span = tracing::info_span!("control", run_id = %run_id);
    Ok(run_active(ctx, conn, shutdown).instrument(span).await)
}

/// 拨号并完成登录；收到关闭请求时返回 `None`
async fn connect_and_login(
    ctx: &Arc<ClientContext>,
    shutdown: &CancellationToken,
) -> Result<Option<BoxedTransport>> {
    let server = ctx.config.server_address();
    debug!("Dialing {} over {}", server, ctx.transport.transport_type());

    let mut conn = tokio::select! {
        _ = shutdown.cancelled() => return Ok(None),
        dialed = ctx.transport.dial() => dialed.map_err(|e| {
            TunnelError::TransportError(format!("failed to connect to {}: {:#}", server, e))
        })?,
    };

    ctx.set_state(ControlState::LoggingIn);

    // 令牌校验、发送 Login、等待 LoginResp 共用一个超时
    let previous_run_id = ctx.run_id();
    let login_timeout = ctx.config.login_timeout();
    let resp = tokio::select! {
        _ = shutdown.cancelled() => return Ok(None),
        result = tokio::time::timeout(login_timeout, exchange_login(ctx, &mut conn, &previous_run_id)) => {
            match result {
                Ok(resp) => resp?,
                Err(_) => return Err(TunnelError::timeout(login_timeout)),
            }
        }
    };

    accept_login(ctx, &previous_run_id, resp)?;
    Ok(Some(conn))
}

async fn exchange_login(
    ctx: &ClientContext,
    conn: &mut BoxedTransport,
    previous_run_id: &str,
) -> Result<LoginResp> {
    let timestamp = auth::now_timestamp();
    if let Some(api) = &ctx.api {
        api.check_token(&ctx.config.user, &ctx.config.token, timestamp)
            .await
            .map_err(|e| TunnelError::auth_failed(e.to_string()))?;
    }

    let max_payload = ctx.config.max_message_size;
    let login = build_login(ctx, previous_run_id, timestamp);
    write_msg(conn, &Message::Login(login), max_payload).await?;

    match read_msg(conn, max_payload).await? {
        Message::LoginResp(resp) => Ok(resp),
        other => Err(TunnelError::protocol(format!(
            "expected LoginResp, got {}",
            other.name()
        ))),
    }
}

fn build_login(ctx: &ClientContext, run_id: &str, timestamp: i64) -> Login {
    Login {
        version: PROTOCOL_VERSION.to_string(),
        hostname: std::env::var("HOSTNAME").unwrap_or_default(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        user: ctx.config.user.clone(),
        privilege_key: auth::sign(&ctx.config.token, timestamp),
        timestamp,
        run_id: run_id.to_string(),
        proxy_count: ctx.proxies.active_count(),
        metas: Default::default(),
    }
}

fn accept_login(ctx: &ClientContext, previous_run_id: &str, resp: LoginResp) -> Result<()> {
    if !resp.error.is_empty() {
        error!("Login rejected by server: {}", resp.error);
        return Err(TunnelError::auth_failed(resp.error));
    }

    let run_id = if resp.run_id.is_empty() {
        previous_run_id.to_string()
    } else {
        resp.run_id
    };
    if run_id.is_empty() {
        return Err(TunnelError::protocol("server did not assign a run id"));
    }
    if !previous_run_id.is_empty() && previous_run_id != run_id {
        warn!(
            "Server replaced run id {} with {}",
            previous_run_id, run_id
        );
    }

    info!(
        run_id = %run_id,
        server_version = %resp.version,
        "Logged in to server"
    );
    ctx.set_run_id(run_id.clone());
    ctx.emit(ServiceEvent::LoggedIn { run_id });
    Ok(())
}

/// Active 阶段：读循环、写任务、心跳任务，最后拆除
async fn run_active(
    ctx: Arc<ClientContext>,
    conn: BoxedTransport,
    shutdown: CancellationToken,
) -> SessionEnd {
    let max_payload = ctx.config.max_message_size;
    let codec = MessageCodec::new(max_payload);
    let (read_half, write_half) = tokio::io::split(conn);

    let generation = Arc::new(Generation::new());
    let tracker = TaskTracker::new();
    let (tx, rx) = mpsc::channel(super::config::get_control_queue_size());
    let sender = ControlSender::new(tx);

    let writer = tokio::spawn(
        write_loop(FramedWrite::new(write_half, codec), rx, generation.clone())
            .in_current_span(),
    );

    let last_seen = Arc::new(Mutex::new(Instant::now()));
    tracker.spawn(
        heartbeat_loop(ctx.clone(), sender.clone(), last_seen.clone(), generation.clone())
            .in_current_span(),
    );

    ctx.set_control_sender(Some(sender.clone()));
    ctx.set_state(ControlState::Active);

    // 控制面 API 调用放到后台，读循环立即开始分发
    let run_id = ctx.run_id();
    let submissions = ctx.proxies.activate(sender.clone(), &run_id);
    tracker.spawn(
        submit_proxies(ctx.clone(), sender.clone(), run_id, submissions, generation.token.clone())
            .in_current_span(),
    );
    tracker.spawn(refresh_limit(ctx.clone(), generation.token.clone()).in_current_span());

    let mut frames = FramedRead::new(read_half, codec);
    let end = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break SessionEnd::Shutdown,
            _ = generation.token.cancelled() => break SessionEnd::Lost(generation.take_reason()),
            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    *last_seen.lock() = Instant::now();
                    if let Err(e) = dispatch(&ctx, msg, &sender, &generation.token, &tracker) {
                        break SessionEnd::Lost(e);
                    }
                }
                Some(Err(e)) => {
                    warn!("Control connection read failed: {}", e);
                    break SessionEnd::Lost(e);
                }
                None => {
                    break SessionEnd::Lost(TunnelError::TransportError(
                        "control connection closed by server".into(),
                    ));
                }
            }
        }
    };

    teardown(&ctx, &end, sender, &generation, &tracker).await;
    let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
    drop(frames);
    ctx.transport.close().await;
    ctx.set_state(ControlState::Disconnected);

    match &end {
        SessionEnd::Shutdown => info!("Control connection closed"),
        SessionEnd::Lost(reason) => warn!("Control connection lost: {}", reason),
    }
    end
}

/// 拆除顺序：Closing → 取消该代任务 → 代理全部 Closed → 清理挂起的打洞请求
async fn teardown(
    ctx: &ClientContext,
    end: &SessionEnd,
    sender: ControlSender,
    generation: &Generation,
    tracker: &TaskTracker,
) {
    ctx.set_state(ControlState::Closing);

    // 主动关闭时尽量通知服务器
    if matches!(end, SessionEnd::Shutdown) {
        for name in ctx.proxies.running() {
            if !sender.try_send(Message::CloseProxy(CloseProxy { proxy_name: name.clone() })) {
                debug!(proxy = %name, "Control queue full, CloseProxy dropped");
            }
        }
    }

    generation.token.cancel();
    ctx.proxies.on_closed();
    ctx.nat_holes.clear();
    ctx.set_control_sender(None);
    tracker.close();
    drop(sender);
}

/// 按消息类型分发；只有不可恢复的错误才返回 `Err`
fn dispatch(
    ctx: &Arc<ClientContext>,
    msg: Message,
    sender: &ControlSender,
    token: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<()> {
    match msg {
        Message::NewProxyResp(resp) => ctx.proxies.on_response(resp),
        Message::ReqWorkConn(req) => {
            tracker.spawn(
                work_conn::handle_work_conn(ctx.clone(), req.proxy_name, token.clone())
                    .in_current_span(),
            );
        }
        Message::NatHoleClient(req) => {
            let ctx = ctx.clone();
            let sender = sender.clone();
            let token = token.clone();
            let proxy = req.proxy_name.clone();
            tracker.spawn(
                async move {
                    if let Err(e) = nat_hole::serve_nat_hole_client(ctx, req, sender, token).await {
                        warn!(proxy = %proxy, "xtcp session failed: {}", e);
                    }
                }
                .in_current_span(),
            );
        }
        Message::NatHoleResp(resp) => {
            let transaction_id = resp.transaction_id.clone();
            if !ctx.nat_holes.complete(resp) {
                debug!("No pending NAT hole request for transaction {}", transaction_id);
            }
        }
        Message::Pong(pong) => {
            if !pong.error.is_empty() {
                error!("Heartbeat rejected by server: {}", pong.error);
                return Err(TunnelError::auth_failed(pong.error));
            }
            debug!("Received pong");
        }
        Message::CloseProxy(close) => {
            ctx.proxies
                .on_remote_close(&close.proxy_name, "closed by server");
        }
        Message::Unknown { tag } => {
            warn!("Dropping message with unknown tag 0x{:02x}", tag);
        }
        other => {
            warn!("Unexpected {} on control connection, dropped", other.name());
        }
    }
    Ok(())
}

/// 唯一的写任务；该代取消后把队列中剩余的消息写完再关闭
async fn write_loop(
    mut writer: FramedWrite<WriteHalf<BoxedTransport>, MessageCodec>,
    mut rx: mpsc::Receiver<Message>,
    generation: Arc<Generation>,
) {
    loop {
        tokio::select! {
            _ = generation.token.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                debug!("Sending {}", msg.name());
                if let Err(e) = writer.send(msg).await {
                    generation.lose(e);
                    return;
                }
            }
        }
    }

    rx.close();
    while let Some(msg) = rx.recv().await {
        if writer.send(msg).await.is_err() {
            return;
        }
    }
    let _ = writer.close().await;
}

/// 心跳任务：按间隔发送 Ping，超过 interval × multiplier 没有任何入站消息即判定断线
async fn heartbeat_loop(
    ctx: Arc<ClientContext>,
    sender: ControlSender,
    last_seen: Arc<Mutex<Instant>>,
    generation: Arc<Generation>,
) {
    let interval = ctx.config.heartbeat_interval();
    let timeout = ctx.config.heartbeat_timeout();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = generation.token.cancelled() => return,
            _ = ticker.tick() => {
                let silent = last_seen.lock().elapsed();
                if silent >= timeout {
                    warn!("No heartbeat response for {:?}, closing control connection", silent);
                    generation.lose(TunnelError::timeout(timeout));
                    return;
                }

                let timestamp = auth::now_timestamp();
                let privilege_key = if ctx.config.authenticate_heartbeats {
                    auth::sign(&ctx.config.token, timestamp)
                } else {
                    String::new()
                };
                if sender
                    .send(Message::Ping(Ping { privilege_key, timestamp }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn submit_proxies(
    ctx: Arc<ClientContext>,
    sender: ControlSender,
    run_id: String,
    submissions: Vec<NewProxy>,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => debug!("Proxy registration cancelled"),
        _ = ctx.proxies.submit_all(&sender, &run_id, submissions) => {}
    }
}

/// 控制面 API 可用时刷新限速信息；失败只记录日志
async fn refresh_limit(ctx: Arc<ClientContext>, token: CancellationToken) {
    let Some(api) = &ctx.api else { return };
    let result = tokio::select! {
        _ = token.cancelled() => return,
        result = api.get_limit(&ctx.config.user, auth::now_timestamp()) => result,
    };
    match result {
        Ok(limit) => {
            debug!("Bandwidth limit: in={} out={}", limit.max_in, limit.max_out);
            ctx.set_limit(Some(limit));
        }
        Err(e) => warn!("Failed to fetch bandwidth limit: {}", e),
    }
}
