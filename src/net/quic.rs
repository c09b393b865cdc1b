/// 打通的 UDP 路径上的 QUIC 会话
///
/// 访问端是 QUIC 客户端，被访问端是服务端。证书每次临时生成，对端身份
/// 已经在控制通道上用签名确认过，这里只需要可靠有序的字节流
use pin_project_lite::pin_project;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connection, Endpoint, EndpointConfig, TokioRuntime, TransportConfig};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::tls::NoCertificateVerification;

const ALPN: &[u8] = b"revtun-xtcp";
const SERVER_NAME: &str = "localhost";
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

fn quic_error(e: impl std::fmt::Display) -> TunnelError {
    TunnelError::TransportError(format!("quic: {}", e))
}

fn transport_config() -> Result<Arc<TransportConfig>> {
    let mut config = TransportConfig::default();
    config.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into().map_err(quic_error)?));
    config.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    Ok(Arc::new(config))
}

fn server_config() -> Result<quinn::ServerConfig> {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).map_err(quic_error)?;
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    let mut crypto = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .map_err(quic_error)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(crypto).map_err(quic_error)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

fn client_config() -> Result<quinn::ClientConfig> {
    let mut crypto = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(crypto).map_err(quic_error)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

fn endpoint(socket: UdpSocket, server: Option<quinn::ServerConfig>) -> Result<Endpoint> {
    let socket = socket.into_std()?;
    Ok(Endpoint::new(
        EndpointConfig::default(),
        server,
        socket,
        Arc::new(TokioRuntime),
    )?)
}

/// 一条到对端的 QUIC 连接
pub struct QuicSession {
    endpoint: Endpoint,
    conn: Connection,
}

impl QuicSession {
    /// 在已打通的套接字上向对端发起连接
    pub async fn connect(socket: UdpSocket, peer: SocketAddr) -> Result<Self> {
        let endpoint = endpoint(socket, None)?;
        let conn = endpoint
            .connect_with(client_config()?, peer, SERVER_NAME)
            .map_err(quic_error)?
            .await
            .map_err(quic_error)?;
        Ok(Self { endpoint, conn })
    }

    /// 在已打通的套接字上等待对端连接，其他来源的连接一律拒绝
    pub async fn accept(socket: UdpSocket, peer: SocketAddr) -> Result<Self> {
        let endpoint = endpoint(socket, Some(server_config()?))?;
        loop {
            let incoming = endpoint
                .accept()
                .await
                .ok_or_else(|| quic_error("endpoint closed"))?;
            if incoming.remote_address() != peer {
                debug!("Refusing QUIC connection from {}", incoming.remote_address());
                incoming.refuse();
                continue;
            }
            let conn = incoming.await.map_err(quic_error)?;
            return Ok(Self { endpoint, conn });
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub async fn open_stream(&self) -> Result<QuicStream> {
        let (send, recv) = self.conn.open_bi().await.map_err(quic_error)?;
        Ok(QuicStream { send, recv })
    }

    pub async fn accept_stream(&self) -> Result<QuicStream> {
        let (send, recv) = self.conn.accept_bi().await.map_err(quic_error)?;
        Ok(QuicStream { send, recv })
    }

    /// 通知对端本端已结束，等对端的同样通知（最多 `linger`）后关闭
    ///
    /// 两端都确认结束之后才关闭连接，已发送但未确认的数据不会被丢弃
    pub async fn finish(self, linger: Duration) {
        if let Ok(mut done) = self.conn.open_uni().await {
            let _ = done.finish();
        }
        let _ = tokio::time::timeout(linger, self.conn.accept_uni()).await;
        self.conn.close(0u32.into(), b"done");
        let _ = tokio::time::timeout(linger, self.endpoint.wait_idle()).await;
    }
}

pin_project! {
    /// QUIC 双向流
    pub struct QuicStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}
