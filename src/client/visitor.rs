/// Visitor：访问其他客户端的 stcp/xtcp 代理
///
/// 本地监听在服务级别，跨越控制连接重连一直存在。stcp 每个本地连接
/// 走一条服务器中继的工作连接；xtcp 通过控制连接交换候选地址后 UDP 打洞，
/// 再在打通的路径上建立 QUIC 连接
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::context::ClientContext;
use super::nat_hole::{self, VisitingSession};
use crate::auth;
use crate::config::{ProxyType, VisitorConfig};
use crate::error::{Result, TunnelError};
use crate::io_util;
use crate::protocol::{read_msg, write_msg, Message, NatHoleVisitor, NewVisitorConn};

/// 绑定 visitor 的本地监听端口
pub async fn bind_visitor(visitor: &VisitorConfig) -> Result<TcpListener> {
    let bind_addr = visitor.bind_address();
    let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
        TunnelError::config_error(format!(
            "Visitor '{}': failed to bind {}: {}",
            visitor.name, bind_addr, e
        ))
    })?;
    info!(
        "Visitor '{}' listening on {} -> {} proxy '{}'",
        visitor.name, bind_addr, visitor.proxy_type, visitor.server_name
    );
    Ok(listener)
}

/// 接受本地连接直到服务关闭，每个连接独立处理
pub async fn serve_visitor(
    ctx: Arc<ClientContext>,
    visitor: Arc<VisitorConfig>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("Visitor '{}' accepted {}", visitor.name, peer_addr);
                let ctx = ctx.clone();
                let visitor = visitor.clone();
                let shutdown = shutdown.clone();
                let span = tracing::info_span!("visitor", name = %visitor.name, peer = %peer_addr);
                tokio::spawn(
                    async move {
                        let result = tokio::select! {
                            _ = shutdown.cancelled() => Ok(()),
                            result = handle_visitor_conn(&ctx, &visitor, stream) => result,
                        };
                        if let Err(e) = result {
                            warn!("Visitor session failed: {}", e);
                        }
                    }
                    .instrument(span),
                );
            }
            Err(e) => {
                error!("Visitor '{}' accept error: {}", visitor.name, e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
    info!("Visitor '{}' stopped", visitor.name);
}

async fn handle_visitor_conn(
    ctx: &ClientContext,
    visitor: &VisitorConfig,
    stream: TcpStream,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    match visitor.proxy_type {
        ProxyType::Stcp => visit_stcp(ctx, visitor, stream).await,
        ProxyType::Xtcp => visit_xtcp(ctx, visitor, stream).await,
        other => Err(TunnelError::config_error(format!(
            "visitor type {} is not supported",
            other
        ))),
    }
}

/// stcp：通过服务器中继
async fn visit_stcp(ctx: &ClientContext, visitor: &VisitorConfig, mut stream: TcpStream) -> Result<()> {
    let max_payload = ctx.config.max_message_size;
    let mut conn = ctx
        .transport
        .dial()
        .await
        .map_err(|e| TunnelError::TransportError(format!("visitor dial failed: {:#}", e)))?;

    let timestamp = auth::now_timestamp();
    let msg = Message::NewVisitorConn(NewVisitorConn {
        proxy_name: visitor.server_name.clone(),
        sign_key: auth::sign(&visitor.sk, timestamp),
        timestamp,
        use_encryption: visitor.use_encryption,
        use_compression: visitor.use_compression,
    });
    write_msg(&mut conn, &msg, max_payload).await?;

    let ready_timeout = ctx.config.work_conn_ready_timeout();
    match tokio::time::timeout(ready_timeout, read_msg(&mut conn, max_payload)).await {
        Ok(Ok(Message::NewVisitorConnResp(resp))) if resp.error.is_empty() => {}
        Ok(Ok(Message::NewVisitorConnResp(resp))) => {
            return Err(TunnelError::security_error(format!(
                "server rejected visitor connection to '{}': {}",
                visitor.server_name, resp.error
            )));
        }
        Ok(Ok(other)) => {
            return Err(TunnelError::protocol(format!(
                "expected NewVisitorConnResp, got {}",
                other.name()
            )));
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(TunnelError::timeout(ready_timeout)),
    }

    let (sent, received) = io_util::splice(&mut stream, &mut conn).await?;
    debug!("stcp visitor session closed: sent={} received={}", sent, received);
    Ok(())
}

/// xtcp：经控制连接交换候选地址，UDP 打洞后经 QUIC 直连
async fn visit_xtcp(ctx: &ClientContext, visitor: &VisitorConfig, mut stream: TcpStream) -> Result<()> {
    let control = ctx
        .control_sender()
        .ok_or_else(|| TunnelError::TransportError("control connection is not active".into()))?;

    let (socket, candidates) = nat_hole::bind_punch_socket(&ctx.config.server_address()).await?;
    let mut session = VisitingSession::new(visitor.sk.clone(), candidates);
    let pending = ctx.nat_holes.register(&session.transaction_id);

    let timestamp = auth::now_timestamp();
    let request = Message::NatHoleVisitor(NatHoleVisitor {
        transaction_id: session.transaction_id.clone(),
        proxy_name: visitor.server_name.clone(),
        sign_key: session.sign(timestamp),
        timestamp,
        candidate_addrs: session.local_candidates.clone(),
    });
    if let Err(e) = control.send(request).await {
        ctx.nat_holes.cancel(&session.transaction_id);
        return Err(e);
    }

    let timeout = ctx.config.nat_hole_timeout();
    let resp = match tokio::time::timeout(timeout, pending).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(_)) => return Err(session.fail("control connection closed during handshake")),
        Err(_) => {
            ctx.nat_holes.cancel(&session.transaction_id);
            return Err(session.fail(format!("no NAT hole response within {:?}", timeout)));
        }
    };
    if !resp.error.is_empty() {
        return Err(session.fail(resp.error));
    }

    session.begin_punching(resp.sid, resp.candidate_addrs)?;
    let peer = match tokio::time::timeout(
        timeout,
        nat_hole::punch(&socket, &session.sid, &session.peer_candidates),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => return Err(session.fail(e.to_string())),
        Err(_) => return Err(session.fail(format!("punching timed out after {:?}", timeout))),
    };
    session.establish(peer)?;
    info!("xtcp visitor '{}' connected to {}", visitor.name, peer);

    let (direct, quic_stream) =
        match tokio::time::timeout(timeout, nat_hole::open_direct(socket, peer, &session.sid)).await {
            Ok(result) => result?,
            Err(_) => return Err(TunnelError::timeout(timeout)),
        };
    let (sent, received) = nat_hole::bridge(direct, quic_stream, &mut stream, timeout).await?;
    debug!("xtcp visitor session closed: sent={} received={}", sent, received);
    Ok(())
}
