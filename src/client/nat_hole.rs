/// NAT 打洞
///
/// xtcp 的两端通过控制通道交换候选地址后，同时向对方发送打洞包；
/// 任意一端收到带有相同 sid 的包即视为打通。打通后在同一个 UDP 套接字
/// 上建立 QUIC 连接，数据经 QUIC 流可靠传输
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ClientContext;
use super::control::ControlSender;
use crate::auth;
use crate::config::ProxyType;
use crate::error::{Result, TunnelError};
use crate::io_util::{self, SpliceTotals};
use crate::net::{QuicSession, QuicStream};
use crate::protocol::{
    read_msg, write_msg, Message, MessageCodec, NatHoleClient, NatHoleClientResp, NatHoleDetect,
    NatHoleResp, DEFAULT_MAX_MESSAGE_SIZE,
};

/// 打洞包发送间隔
const DETECT_INTERVAL: Duration = Duration::from_millis(100);
/// 接收缓冲区
const MAX_DATAGRAM: usize = 16 * 1024;

/// 握手阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakePhase {
    /// 等待对端候选地址
    AwaitingPeer,
    /// 正在向对端发送打洞包
    Punching,
    /// 已打通
    Established,
    /// 失败（超时、密钥不匹配等）
    Failed(String),
}

/// 一次打洞尝试的会话记录
#[derive(Debug)]
pub struct VisitingSession {
    pub transaction_id: String,
    pub sid: String,
    sk: String,
    /// 本端候选地址
    pub local_candidates: Vec<String>,
    /// 对端候选地址
    pub peer_candidates: Vec<String>,
    /// 打通后的对端地址
    pub peer: Option<SocketAddr>,
    phase: HandshakePhase,
}

impl VisitingSession {
    pub fn new(sk: impl Into<String>, local_candidates: Vec<String>) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            sid: String::new(),
            sk: sk.into(),
            local_candidates,
            peer_candidates: Vec::new(),
            peer: None,
            phase: HandshakePhase::AwaitingPeer,
        }
    }

    pub fn phase(&self) -> &HandshakePhase {
        &self.phase
    }

    /// 本端签名
    pub fn sign(&self, timestamp: i64) -> String {
        auth::sign(&self.sk, timestamp)
    }

    /// 收到对端候选地址，开始打洞
    pub fn begin_punching(&mut self, sid: String, peer_candidates: Vec<String>) -> Result<()> {
        if self.phase != HandshakePhase::AwaitingPeer {
            return Err(TunnelError::protocol(format!(
                "cannot start punching in phase {:?}",
                self.phase
            )));
        }
        if peer_candidates.is_empty() {
            return Err(self.fail("peer returned no candidate address"));
        }
        self.sid = sid;
        self.peer_candidates = peer_candidates;
        self.phase = HandshakePhase::Punching;
        Ok(())
    }

    pub fn establish(&mut self, peer: SocketAddr) -> Result<()> {
        if self.phase != HandshakePhase::Punching {
            return Err(TunnelError::protocol(format!(
                "cannot establish in phase {:?}",
                self.phase
            )));
        }
        self.peer = Some(peer);
        self.phase = HandshakePhase::Established;
        Ok(())
    }

    /// 标记失败并返回对应错误
    pub fn fail(&mut self, reason: impl Into<String>) -> TunnelError {
        let reason = reason.into();
        self.phase = HandshakePhase::Failed(reason.clone());
        TunnelError::handshake_failed(reason)
    }
}

/// 将 NatHoleResp 分发给等待中的 visitor 会话
#[derive(Default)]
pub struct NatHoleBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<NatHoleResp>>>,
}

impl NatHoleBroker {
    pub fn register(&self, transaction_id: &str) -> oneshot::Receiver<NatHoleResp> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction_id.to_string(), tx);
        rx
    }

    pub fn cancel(&self, transaction_id: &str) {
        self.pending.lock().remove(transaction_id);
    }

    /// 返回是否有会话在等待该响应
    pub fn complete(&self, resp: NatHoleResp) -> bool {
        match self.pending.lock().remove(&resp.transaction_id) {
            Some(tx) => tx.send(resp).is_ok(),
            None => false,
        }
    }

    /// 控制连接断开时丢弃所有等待者
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn encode_datagram(msg: &Message) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    MessageCodec::default().encode_frame(msg, &mut buf)?;
    Ok(buf)
}

fn decode_datagram(data: &[u8]) -> Result<Message> {
    let mut buf = BytesMut::from(data);
    MessageCodec::default()
        .decode(&mut buf)?
        .ok_or_else(|| TunnelError::framing("truncated datagram"))
}

/// 绑定打洞用的 UDP 套接字，并计算本端候选地址
///
/// 本端 IP 取通往服务器的出口地址
pub async fn bind_punch_socket(server_addr: &str) -> Result<(UdpSocket, Vec<String>)> {
    let server = tokio::net::lookup_host(server_addr)
        .await?
        .next()
        .ok_or_else(|| TunnelError::config_error(format!("cannot resolve {}", server_addr)))?;

    let unspecified = if server.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };

    let socket = UdpSocket::bind(unspecified).await?;
    let port = socket.local_addr()?.port();

    let route = UdpSocket::bind(unspecified).await?;
    route.connect(server).await?;
    let ip = route.local_addr()?.ip();

    Ok((socket, vec![SocketAddr::new(ip, port).to_string()]))
}

/// 向对端候选地址发送打洞包，直到对端的包到达，返回对端地址
///
/// 候选地址发来的其他数据报（对端已经开始 QUIC 握手）同样视为打通，
/// 被吞掉的握手包由 QUIC 重传。超时由调用方控制
pub async fn punch(socket: &UdpSocket, sid: &str, candidates: &[String]) -> Result<SocketAddr> {
    let targets: Vec<SocketAddr> = candidates.iter().filter_map(|c| c.parse().ok()).collect();
    if targets.is_empty() {
        return Err(TunnelError::handshake_failed("no usable candidate address"));
    }

    let detect = encode_datagram(&Message::NatHoleDetect(NatHoleDetect {
        sid: sid.to_string(),
        ack: false,
    }))?;
    let ack = encode_datagram(&Message::NatHoleDetect(NatHoleDetect {
        sid: sid.to_string(),
        ack: true,
    }))?;

    let mut ticker = tokio::time::interval(DETECT_INTERVAL);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for target in &targets {
                    if let Err(e) = socket.send_to(&detect, target).await {
                        debug!("Hole punching to {} failed: {}", target, e);
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;
                match decode_datagram(&buf[..n]) {
                    Ok(Message::NatHoleDetect(msg)) if msg.sid == sid => {
                        if !msg.ack {
                            socket.send_to(&ack, from).await?;
                        }
                        return Ok(from);
                    }
                    Ok(Message::NatHoleDetect(_)) => debug!("Ignoring foreign session from {}", from),
                    _ if targets.contains(&from) => return Ok(from),
                    _ => debug!("Ignoring datagram from {} while punching", from),
                }
            }
        }
    }
}

/// 访问端：在打通的套接字上连接对端，并在新流上发送会话标识
pub async fn open_direct(
    socket: UdpSocket,
    peer: SocketAddr,
    sid: &str,
) -> Result<(QuicSession, QuicStream)> {
    let session = QuicSession::connect(socket, peer).await?;
    let mut stream = session.open_stream().await?;
    // 流在对端只有收到数据后才可见
    let hello = Message::NatHoleDetect(NatHoleDetect {
        sid: sid.to_string(),
        ack: true,
    });
    write_msg(&mut stream, &hello, DEFAULT_MAX_MESSAGE_SIZE).await?;
    Ok((session, stream))
}

/// 被访问端：等待对端的连接，校验第一条流上的会话标识
pub async fn accept_direct(
    socket: UdpSocket,
    peer: SocketAddr,
    sid: &str,
) -> Result<(QuicSession, QuicStream)> {
    let session = QuicSession::accept(socket, peer).await?;
    let mut stream = session.accept_stream().await?;
    match read_msg(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await? {
        Message::NatHoleDetect(hello) if hello.sid == sid => Ok((session, stream)),
        Message::NatHoleDetect(hello) => Err(TunnelError::security_error(format!(
            "direct connection from {} carries session '{}', expected '{}'",
            peer, hello.sid, sid
        ))),
        other => Err(TunnelError::protocol(format!(
            "expected NatHoleDetect on direct connection, got {}",
            other.name()
        ))),
    }
}

/// 拼接直连流与本地流，两端都结束后关闭连接
pub async fn bridge<S>(
    session: QuicSession,
    mut stream: QuicStream,
    local: &mut S,
    linger: Duration,
) -> Result<SpliceTotals>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = io_util::splice(local, &mut stream).await;
    session.finish(linger).await;
    Ok(result?)
}

/// 被访问端：处理服务器转发来的打洞请求
pub async fn serve_nat_hole_client(
    ctx: Arc<ClientContext>,
    msg: NatHoleClient,
    control: ControlSender,
    token: CancellationToken,
) -> Result<()> {
    let reject = |reason: &str| {
        Message::NatHoleClientResp(NatHoleClientResp {
            transaction_id: msg.transaction_id.clone(),
            sid: msg.sid.clone(),
            candidate_addrs: Vec::new(),
            error: reason.to_string(),
        })
    };

    let proxy = match ctx.proxies.local_target(&msg.proxy_name) {
        Some(proxy) if proxy.proxy_type == ProxyType::Xtcp => proxy,
        _ => {
            warn!("NAT hole request for unknown xtcp proxy '{}'", msg.proxy_name);
            control.send(reject("proxy not found")).await?;
            return Err(TunnelError::proxy_not_found(&msg.proxy_name));
        }
    };

    // 密钥不匹配时不转发任何流量
    if !auth::verify(&proxy.sk, msg.timestamp, &msg.sign_key) {
        warn!("NAT hole request for '{}' rejected: invalid sign key", proxy.name);
        control.send(reject("invalid sign key")).await?;
        return Err(TunnelError::security_error(format!(
            "invalid sign key for proxy '{}'",
            proxy.name
        )));
    }
    let max_skew = super::config::get_sign_max_skew();
    if !auth::is_fresh(msg.timestamp, max_skew) {
        warn!(
            "NAT hole request for '{}' rejected: timestamp {} outside {:?}",
            proxy.name, msg.timestamp, max_skew
        );
        control.send(reject("sign key expired")).await?;
        return Err(TunnelError::security_error(format!(
            "expired sign key for proxy '{}'",
            proxy.name
        )));
    }

    let (socket, candidates) = bind_punch_socket(&ctx.config.server_address()).await?;
    let mut session = VisitingSession::new(proxy.sk.clone(), candidates.clone());
    session.transaction_id = msg.transaction_id.clone();

    control
        .send(Message::NatHoleClientResp(NatHoleClientResp {
            transaction_id: msg.transaction_id.clone(),
            sid: msg.sid.clone(),
            candidate_addrs: candidates,
            error: String::new(),
        }))
        .await?;

    session.begin_punching(msg.sid.clone(), msg.candidate_addrs.clone())?;
    let timeout = ctx.config.nat_hole_timeout();
    let peer = tokio::select! {
        _ = token.cancelled() => return Err(session.fail("control connection closed")),
        result = tokio::time::timeout(timeout, punch(&socket, &session.sid, &session.peer_candidates)) => {
            match result {
                Ok(Ok(peer)) => peer,
                Ok(Err(e)) => return Err(session.fail(e.to_string())),
                Err(_) => return Err(session.fail(format!("punching timed out after {:?}", timeout))),
            }
        }
    };
    session.establish(peer)?;
    info!("NAT hole established for '{}' with {}", proxy.name, peer);

    let (direct, stream) = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        result = tokio::time::timeout(timeout, accept_direct(socket, peer, &session.sid)) => {
            match result {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(TunnelError::timeout(timeout)),
            }
        }
    };

    let mut local = super::work_conn::dial_proxy_local(&ctx, &proxy).await?;
    tokio::select! {
        _ = token.cancelled() => Ok(()),
        result = bridge(direct, stream, &mut local, timeout) => {
            let (sent, received) = result?;
            debug!("xtcp session for '{}' closed: sent={} received={}", proxy.name, sent, received);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_session_phases() {
        let mut session = VisitingSession::new("k1", vec!["127.0.0.1:1".into()]);
        assert_eq!(session.phase(), &HandshakePhase::AwaitingPeer);
        assert!(session.establish("127.0.0.1:2".parse().unwrap()).is_err());

        session
            .begin_punching("s1".into(), vec!["127.0.0.1:2".into()])
            .unwrap();
        assert_eq!(session.phase(), &HandshakePhase::Punching);

        session.establish("127.0.0.1:2".parse().unwrap()).unwrap();
        assert_eq!(session.phase(), &HandshakePhase::Established);
        assert!(session.begin_punching("s2".into(), vec![]).is_err());
    }

    #[test]
    fn test_session_without_candidates_fails() {
        let mut session = VisitingSession::new("k1", vec![]);
        let err = session.begin_punching("s1".into(), vec![]).unwrap_err();
        assert!(matches!(err, TunnelError::HandshakeFailed(_)));
        assert!(matches!(session.phase(), HandshakePhase::Failed(_)));
    }

    #[test]
    fn test_signature_matches_peer() {
        let session = VisitingSession::new("k1", vec![]);
        let ts = auth::now_timestamp();
        assert!(auth::verify("k1", ts, &session.sign(ts)));
        assert!(!auth::verify("k2", ts, &session.sign(ts)));
    }

    #[tokio::test]
    async fn test_broker_routes_by_transaction() {
        let broker = NatHoleBroker::default();
        let rx = broker.register("t1");
        assert_eq!(broker.pending_count(), 1);

        assert!(!broker.complete(NatHoleResp {
            transaction_id: "other".into(),
            ..Default::default()
        }));
        assert!(broker.complete(NatHoleResp {
            transaction_id: "t1".into(),
            sid: "s1".into(),
            ..Default::default()
        }));
        assert_eq!(rx.await.unwrap().sid, "s1");
        assert_eq!(broker.pending_count(), 0);

        let rx = broker.register("t2");
        broker.clear();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_punch_between_two_sockets() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_list = [a.local_addr().unwrap().to_string()];
        let b_list = [b.local_addr().unwrap().to_string()];

        let (ra, rb) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(5), punch(&a, "sid-1", &b_list)),
            tokio::time::timeout(Duration::from_secs(5), punch(&b, "sid-1", &a_list)),
        );
        assert_eq!(ra.unwrap().unwrap(), b.local_addr().unwrap());
        assert_eq!(rb.unwrap().unwrap(), a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_punch_ignores_foreign_sid() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_list = [a.local_addr().unwrap().to_string()];
        let b_list = [b.local_addr().unwrap().to_string()];

        let (ra, _rb) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(500), punch(&a, "sid-a", &b_list)),
            tokio::time::timeout(Duration::from_millis(500), punch(&b, "sid-b", &a_list)),
        );
        assert!(ra.is_err());
    }

    #[tokio::test]
    async fn test_direct_path_survives_slow_reader() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let linger = Duration::from_secs(5);

        // 被访问端的本地服务晚启动，每次只读 64 字节
        let (mut service, mut service_side) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut received = Vec::new();
            let mut chunk = [0u8; 64];
            loop {
                match service.read(&mut chunk).await.unwrap() {
                    0 => break,
                    n => received.extend_from_slice(&chunk[..n]),
                }
            }
            received
        });
        let visited = tokio::spawn(async move {
            let (session, stream) = accept_direct(b, a_addr, "sid-1").await.unwrap();
            bridge(session, stream, &mut service_side, linger).await.unwrap()
        });

        let payload: Vec<u8> = (0..1536 * 1024).map(|i| (i % 251) as u8).collect();
        let (app, mut app_side) = tokio::io::duplex(64 * 1024);
        let (mut app_rd, mut app_wr) = tokio::io::split(app);
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                app_wr.write_all(&payload).await.unwrap();
                app_wr.shutdown().await.unwrap();
            })
        };

        let (session, stream) = open_direct(a, b_addr, "sid-1").await.unwrap();
        let visiting = tokio::spawn(async move {
            bridge(session, stream, &mut app_side, linger).await.unwrap()
        });

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(30), app_rd.read_to_end(&mut reply))
            .await
            .expect("Timed out waiting for the direct path to close")
            .unwrap();
        assert!(reply.is_empty());
        writer.await.unwrap();

        let received = reader.await.unwrap();
        assert_eq!(received.len(), payload.len());
        assert!(received == payload);

        let (sent, _) = visiting.await.unwrap();
        assert_eq!(sent, payload.len() as u64);
        let (_, forwarded) = visited.await.unwrap();
        assert_eq!(forwarded, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_direct_path_rejects_other_session() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let (accepted, opened) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(5), accept_direct(b, a_addr, "sid-1")),
            open_direct(a, b_addr, "sid-2"),
        );
        let _opened = opened.unwrap();
        let err = accepted.unwrap().err().expect("session mismatch must fail");
        assert!(matches!(err, TunnelError::SecurityError(_)));
    }
}
