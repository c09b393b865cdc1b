/// 连接复用传输
///
/// 在一条物理连接上运行 yamux，每次 `dial` 打开一个新的逻辑流
use super::{BoxedTransport, TransportClient, TransportType};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::poll_fn;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

type OpenRequest = oneshot::Sender<Result<yamux::Stream>>;

/// 已建立的复用会话
struct MuxSession {
    open_tx: mpsc::Sender<OpenRequest>,
}

impl MuxSession {
    fn is_alive(&self) -> bool {
        !self.open_tx.is_closed()
    }
}

/// yamux 复用传输客户端
pub struct MuxTransportClient {
    inner: Arc<dyn TransportClient>,
    session: Mutex<Option<MuxSession>>,
}

impl MuxTransportClient {
    pub fn new(inner: Arc<dyn TransportClient>) -> Self {
        Self {
            inner,
            session: Mutex::new(None),
        }
    }

    /// 建立物理连接并启动 yamux 驱动任务
    async fn connect_session(&self) -> Result<MuxSession> {
        let physical = self.inner.dial().await?;
        let mut connection =
            YamuxConnection::new(physical.compat(), YamuxConfig::default(), YamuxMode::Client);

        let (open_tx, mut open_rx) = mpsc::channel::<OpenRequest>(64);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = poll_fn(|cx| connection.poll_next_inbound(cx)) => {
                        match inbound {
                            Some(Ok(_stream)) => {
                                debug!("Ignoring unexpected inbound mux stream");
                            }
                            Some(Err(e)) => {
                                warn!("Mux connection error: {}", e);
                                break;
                            }
                            None => {
                                info!("Mux connection closed by server");
                                break;
                            }
                        }
                    }

                    request = open_rx.recv() => {
                        match request {
                            Some(reply) => {
                                let result = poll_fn(|cx| connection.poll_new_outbound(cx))
                                    .await
                                    .map_err(|e| anyhow!("Failed to open mux stream: {}", e));
                                let _ = reply.send(result);
                            }
                            None => {
                                // 所有句柄均已释放
                                let _ = poll_fn(|cx| connection.poll_close(cx)).await;
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Mux driver stopped");
        });

        info!("Mux session established over {}", self.inner.transport_type());
        Ok(MuxSession { open_tx })
    }

    async fn open_stream(&self) -> Result<yamux::Stream> {
        let open_tx = {
            let mut session = self.session.lock().await;
            match session.as_ref() {
                Some(existing) if existing.is_alive() => existing.open_tx.clone(),
                _ => {
                    let fresh = self.connect_session().await?;
                    let tx = fresh.open_tx.clone();
                    *session = Some(fresh);
                    tx
                }
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        open_tx
            .send(reply_tx)
            .await
            .map_err(|_| anyhow!("Mux session is closed"))?;
        reply_rx.await.context("Mux session closed while opening stream")?
    }
}

#[async_trait]
impl TransportClient for MuxTransportClient {
    async fn dial(&self) -> Result<BoxedTransport> {
        let stream = self.open_stream().await?;
        Ok(Box::pin(stream.compat()))
    }

    fn transport_type(&self) -> TransportType {
        self.inner.transport_type()
    }

    async fn close(&self) {
        // 丢弃发送端后驱动任务会关闭物理连接
        if self.session.lock().await.take().is_some() {
            debug!("Mux session released");
        }
    }
}
