/// 工作连接
///
/// 每个 ReqWorkConn 独立拨号、注册、等待 StartWorkConn，然后与本地服务对接，
/// 不预先建立任何连接
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::config::{get_local_dial_failure_limit, get_local_retries, get_local_retry_delay};
use super::context::ClientContext;
use super::udp;
use crate::auth;
use crate::config::ProxyConfig;
use crate::error::{Result, TunnelError};
use crate::io_util;
use crate::net::{CloseNotifyConn, ContextConn, StatsConn};
use crate::protocol::{read_msg, write_msg, Message, NewWorkConn, StartWorkConn};
use crate::transport::BoxedTransport;

/// 连接本地服务，失败时按环境变量配置的次数重试
pub async fn connect_local(local_addr: &str) -> Result<TcpStream> {
    let max_retries = get_local_retries();
    let retry_delay = get_local_retry_delay();

    let mut attempt = 1;
    loop {
        match TcpStream::connect(local_addr).await {
            Ok(stream) => {
                debug!(
                    "Connected to local service: {} (attempt {})",
                    local_addr, attempt
                );
                return Ok(stream);
            }
            Err(err) if attempt < max_retries => {
                warn!(
                    "Failed to connect to {} (attempt {}): {}, retrying...",
                    local_addr, attempt, err
                );
                attempt += 1;
                sleep(retry_delay).await;
            }
            Err(err) => {
                warn!(
                    "Failed to connect to {} after {} attempts: {}",
                    local_addr, max_retries, err
                );
                return Err(TunnelError::connection_failed(local_addr, err));
            }
        }
    }
}

/// 处理一次 ReqWorkConn；控制连接拆除时随该代令牌一起取消
pub async fn handle_work_conn(ctx: Arc<ClientContext>, proxy_name: String, token: CancellationToken) {
    let span = tracing::info_span!("work_conn", proxy = %proxy_name);
    async move {
        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!("Work connection cancelled");
                Ok(())
            }
            result = serve_work_conn(&ctx, &proxy_name) => result,
        };
        if let Err(e) = result {
            warn!("Work connection failed: {}", e);
        }
    }
    .instrument(span)
    .await
}

async fn serve_work_conn(ctx: &Arc<ClientContext>, proxy_name: &str) -> Result<()> {
    let proxy = ctx
        .proxies
        .local_target(proxy_name)
        .ok_or_else(|| TunnelError::proxy_not_found(proxy_name))?;

    let conn = ctx
        .transport
        .dial()
        .await
        .map_err(|e| TunnelError::TransportError(format!("work connection dial failed: {:#}", e)))?;

    ctx.work_conn_started();
    let counter = ctx.clone();
    let conn = CloseNotifyConn::new(conn, move || counter.work_conn_finished());
    let mut conn = ContextConn::new(conn, Span::current());

    let start = register_work_conn(ctx, &mut conn, proxy_name).await?;
    debug!(
        src = %format!("{}:{}", start.src_addr, start.src_port),
        "Work connection started"
    );

    if proxy.proxy_type.is_udp() {
        return udp::serve_udp_work_conn(conn, &proxy.local_addr(), ctx.config.max_message_size).await;
    }

    splice_local(ctx, conn, &proxy).await
}

/// 连接代理的本地服务，并把结果计入该代理的连续失败次数
pub(crate) async fn dial_proxy_local(ctx: &ClientContext, proxy: &ProxyConfig) -> Result<TcpStream> {
    match connect_local(&proxy.local_addr()).await {
        Ok(stream) => {
            ctx.proxies.record_dial_success(&proxy.name);
            Ok(stream)
        }
        Err(e) => {
            ctx.proxies
                .record_dial_failure(&proxy.name, &e.to_string(), get_local_dial_failure_limit());
            Err(e)
        }
    }
}

/// 发送 NewWorkConn 并等待服务器的就绪信号
async fn register_work_conn<S>(
    ctx: &ClientContext,
    conn: &mut S,
    proxy_name: &str,
) -> Result<StartWorkConn>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let max_payload = ctx.config.max_message_size;
    let timestamp = auth::now_timestamp();
    let privilege_key = if ctx.config.authenticate_new_work_conns {
        auth::sign(&ctx.config.token, timestamp)
    } else {
        String::new()
    };

    let msg = Message::NewWorkConn(NewWorkConn {
        run_id: ctx.run_id(),
        proxy_name: proxy_name.to_string(),
        privilege_key,
        timestamp,
    });
    write_msg(conn, &msg, max_payload).await?;

    let ready_timeout = ctx.config.work_conn_ready_timeout();
    match tokio::time::timeout(ready_timeout, read_msg(conn, max_payload)).await {
        Ok(Ok(Message::StartWorkConn(start))) if start.error.is_empty() => Ok(start),
        Ok(Ok(Message::StartWorkConn(start))) => Err(TunnelError::protocol(format!(
            "server refused work connection: {}",
            start.error
        ))),
        Ok(Ok(other)) => Err(TunnelError::protocol(format!(
            "expected StartWorkConn, got {}",
            other.name()
        ))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TunnelError::timeout(ready_timeout)),
    }
}

async fn splice_local(
    ctx: &ClientContext,
    mut conn: ContextConn<CloseNotifyConn<BoxedTransport>>,
    proxy: &ProxyConfig,
) -> Result<()> {
    let local = dial_proxy_local(ctx, proxy).await?;
    if proxy.proxy_type.needs_nodelay() {
        let _ = local.set_nodelay(true);
    }

    let name = proxy.name.clone();
    let mut local = StatsConn::new(local, move |read, written| {
        info!(proxy = %name, "Local connection closed: read={} written={}", read, written);
    });

    let (to_local, to_server) = io_util::splice(&mut conn, &mut local).await?;
    debug!(
        "Splice finished: server->local={} local->server={}",
        to_local, to_server
    );
    Ok(())
}
