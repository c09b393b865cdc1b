/// 流拼接工具
///
/// 工作连接与本地服务之间的双向转发
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// 拼接结果：(a→b 字节数, b→a 字节数)
pub type SpliceTotals = (u64, u64);

/// 对端主动断开视为正常结束
fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// 双向拼接两条流，任一方向结束后关闭对端写方向，两侧都结束时返回
pub async fn splice<A, B>(a: &mut A, b: &mut B) -> io::Result<SpliceTotals>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok(totals) => Ok(totals),
        Err(e) if is_peer_close(&e) => Ok((0, 0)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (mut left_outer, mut left_inner) = tokio::io::duplex(1024);
        let (mut right_inner, mut right_outer) = tokio::io::duplex(1024);

        let task =
            tokio::spawn(async move { splice(&mut left_inner, &mut right_inner).await.unwrap() });

        left_outer.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        right_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        right_outer.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        left_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        left_outer.shutdown().await.unwrap();
        right_outer.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap(), (7, 5));
    }

    #[test]
    fn test_peer_close_kinds() {
        assert!(is_peer_close(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_peer_close(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
