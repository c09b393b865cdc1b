/// UDP 代理的工作连接
///
/// 工作连接上双向传输 UdpPacket 信封。每个服务器侧来源地址对应一个
/// 连接到本地服务的 UDP 套接字，空闲一段时间后回收
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};
use crate::protocol::{Message, MessageCodec, UdpPacket};

/// 来源地址无流量后回收套接字的时间
const UDP_SESSION_IDLE: Duration = Duration::from_secs(60);
/// 单个本地数据报的接收缓冲
const MAX_UDP_DATAGRAM: usize = 64 * 1024;
/// 信封 JSON 的固定开销上限
const ENVELOPE_OVERHEAD: usize = 128;

type Sessions = Arc<Mutex<HashMap<String, Arc<UdpSocket>>>>;

/// 信封能承载的最大数据报（base64 膨胀约 4/3）
fn max_content_len(max_payload: u64) -> usize {
    (max_payload as usize).saturating_sub(ENVELOPE_OVERHEAD) / 4 * 3
}

/// 在工作连接与本地 UDP 服务之间转发，直到工作连接关闭
pub async fn serve_udp_work_conn<S>(conn: S, local_addr: &str, max_payload: u64) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let local = tokio::net::lookup_host(local_addr)
        .await?
        .next()
        .ok_or_else(|| TunnelError::config_error(format!("cannot resolve {}", local_addr)))?;

    let codec = MessageCodec::new(max_payload);
    let (read_half, write_half) = tokio::io::split(conn);
    let mut frames = FramedRead::new(read_half, codec);
    let mut sink = FramedWrite::new(write_half, codec);

    let (tx, mut rx) = mpsc::channel::<UdpPacket>(256);
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
    let mut pumps = JoinSet::new();
    let max_content = max_content_len(max_payload);

    let inbound = async {
        while let Some(frame) = frames.next().await {
            match frame? {
                Message::UdpPacket(packet) => {
                    let socket = match session_socket(&sessions, &packet.remote_addr) {
                        Some(socket) => socket,
                        None => {
                            let socket = Arc::new(open_local_socket(local).await?);
                            sessions
                                .lock()
                                .insert(packet.remote_addr.clone(), socket.clone());
                            pumps.spawn(pump_local(
                                socket.clone(),
                                packet.remote_addr.clone(),
                                tx.clone(),
                                sessions.clone(),
                                max_content,
                            ));
                            socket
                        }
                    };
                    if let Err(e) = socket.send(&packet.content).await {
                        debug!("Failed to deliver datagram to {}: {}", local, e);
                    }
                }
                other => debug!("Ignoring {} on udp work connection", other.name()),
            }
        }
        Ok::<(), TunnelError>(())
    };

    let outbound = async {
        while let Some(packet) = rx.recv().await {
            sink.send(Message::UdpPacket(packet)).await?;
        }
        Ok::<(), TunnelError>(())
    };

    let result = tokio::select! {
        result = inbound => result,
        result = outbound => result,
    };
    pumps.abort_all();
    debug!("UDP work connection closed");
    result
}

fn session_socket(sessions: &Sessions, remote_addr: &str) -> Option<Arc<UdpSocket>> {
    sessions.lock().get(remote_addr).cloned()
}

async fn open_local_socket(local: SocketAddr) -> Result<UdpSocket> {
    let bind = if local.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(local).await?;
    Ok(socket)
}

/// 本地服务 → 工作连接；空闲超时后退出并回收会话
async fn pump_local(
    socket: Arc<UdpSocket>,
    remote_addr: String,
    tx: mpsc::Sender<UdpPacket>,
    sessions: Sessions,
    max_content: usize,
) {
    let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
    loop {
        match tokio::time::timeout(UDP_SESSION_IDLE, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n > max_content => {
                warn!("Dropping {} byte datagram, envelope limit is {}", n, max_content);
            }
            Ok(Ok(n)) => {
                let packet = UdpPacket {
                    content: buf[..n].to_vec(),
                    remote_addr: remote_addr.clone(),
                };
                if tx.send(packet).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("Local UDP receive failed for {}: {}", remote_addr, e);
                break;
            }
            Err(_) => {
                debug!("UDP session for {} idle, releasing", remote_addr);
                break;
            }
        }
    }

    let mut sessions = sessions.lock();
    if sessions
        .get(&remote_addr)
        .is_some_and(|current| Arc::ptr_eq(current, &socket))
    {
        sessions.remove(&remote_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;

    /// 本地 UDP 回显服务
    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[test]
    fn test_max_content_len() {
        let max = max_content_len(DEFAULT_MAX_MESSAGE_SIZE);
        assert!(max > 7000 && max < 7680);
        assert_eq!(max_content_len(64), 0);
    }

    #[tokio::test]
    async fn test_envelopes_routed_per_remote_addr() {
        let echo = udp_echo().await;
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            serve_udp_work_conn(client_side, &echo.to_string(), DEFAULT_MAX_MESSAGE_SIZE).await
        });

        let codec = MessageCodec::default();
        let (rd, wr) = tokio::io::split(server_side);
        let mut server_rx = FramedRead::new(rd, codec);
        let mut server_tx = FramedWrite::new(wr, codec);

        for (content, remote) in [(&b"one"[..], "1.1.1.1:1000"), (&b"two"[..], "2.2.2.2:2000")] {
            server_tx
                .send(Message::UdpPacket(UdpPacket {
                    content: content.to_vec(),
                    remote_addr: remote.into(),
                }))
                .await
                .unwrap();

            match server_rx.next().await.unwrap().unwrap() {
                Message::UdpPacket(reply) => {
                    assert_eq!(reply.content, content);
                    assert_eq!(reply.remote_addr, remote);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        drop(server_tx);
        drop(server_rx);
        assert!(task.await.unwrap().is_ok());
    }
}
