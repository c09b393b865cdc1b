/// 连接装饰器
///
/// 所有装饰器都保持 `AsyncRead + AsyncWrite`，可以任意嵌套
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::Span;

/// 只会执行一次的回调，随连接一起丢弃时触发
///
/// shutdown 只关闭写方向，另一方向可能仍在传输，因此不在 shutdown 时触发
struct OnceCallback(Option<Box<dyn FnOnce() + Send>>);

impl OnceCallback {
    fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }
}

impl Drop for OnceCallback {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

pin_project! {
    /// 关闭通知连接：被丢弃时调用一次回调
    pub struct CloseNotifyConn<T> {
        #[pin]
        inner: T,
        on_close: OnceCallback,
    }
}

impl<T> CloseNotifyConn<T> {
    pub fn new(inner: T, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on_close: OnceCallback::new(on_close),
        }
    }
}

impl<T: AsyncRead> AsyncRead for CloseNotifyConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<T: AsyncWrite> AsyncWrite for CloseNotifyConn<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// 连接的累计收发字节数
#[derive(Debug, Default)]
pub struct ConnStats {
    read: AtomicU64,
    written: AtomicU64,
}

impl ConnStats {
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

pin_project! {
    /// 统计连接：累计读写字节数，丢弃时回调一次总量
    pub struct StatsConn<T> {
        #[pin]
        inner: T,
        stats: Arc<ConnStats>,
        on_close: OnceCallback,
    }
}

impl<T> StatsConn<T> {
    /// `on_close` 的参数为 (总读取字节, 总写入字节)
    pub fn new(inner: T, on_close: impl FnOnce(u64, u64) + Send + 'static) -> Self {
        let stats = Arc::new(ConnStats::default());
        let totals = stats.clone();
        Self {
            inner,
            stats,
            on_close: OnceCallback::new(move || {
                on_close(totals.bytes_read(), totals.bytes_written())
            }),
        }
    }

    pub fn stats(&self) -> Arc<ConnStats> {
        self.stats.clone()
    }
}

impl<T: AsyncRead> AsyncRead for StatsConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = futures::ready!(this.inner.poll_read(cx, buf));
        if result.is_ok() {
            let n = (buf.filled().len() - before) as u64;
            this.stats.read.fetch_add(n, Ordering::Relaxed);
        }
        Poll::Ready(result)
    }
}

impl<T: AsyncWrite> AsyncWrite for StatsConn<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = futures::ready!(this.inner.poll_write(cx, buf));
        if let Ok(n) = result {
            this.stats.written.fetch_add(n as u64, Ordering::Relaxed);
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pin_project! {
    /// 携带上下文的连接：附加一个 tracing span，处理该连接的任务在其中记录日志
    pub struct ContextConn<T> {
        #[pin]
        inner: T,
        span: Span,
    }
}

impl<T> ContextConn<T> {
    pub fn new(inner: T, span: Span) -> Self {
        Self { inner, span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// 替换上下文
    pub fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead> AsyncRead for ContextConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<T: AsyncWrite> AsyncWrite for ContextConn<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
