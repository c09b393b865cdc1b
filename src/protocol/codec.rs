/// 消息帧编解码
///
/// 帧格式：`[tag: u8][len: u64 大端][JSON 负载]`
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;
use crate::error::{Result, TunnelError};

/// 单条消息负载默认上限（字节）
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 10240;

/// 帧头长度：1 字节类型 + 8 字节长度
pub const HEADER_LEN: usize = 9;

/// 消息编解码器
///
/// 本身不持有缓冲区，可在多个连接间复制使用
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_payload: u64,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageCodec {
    pub fn new(max_payload: u64) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> u64 {
        self.max_payload
    }

    fn check_len(&self, tag: u8, len: u64) -> Result<()> {
        if len > self.max_payload {
            return Err(TunnelError::framing(format!(
                "payload of message '{}' too large: {} > {}",
                tag as char, len, self.max_payload
            )));
        }
        Ok(())
    }

    /// 将消息编码为完整帧
    pub fn encode_frame(&self, msg: &Message, dst: &mut BytesMut) -> Result<()> {
        let payload = msg.encode_payload()?;
        self.check_len(msg.tag(), payload.len() as u64)?;

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(msg.tag());
        dst.put_u64(payload.len() as u64);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = src[0];
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&src[1..HEADER_LEN]);
        let len = u64::from_be_bytes(len_bytes);

        // 超限的声明长度直接拒绝，不为其分配缓冲
        self.check_len(tag, len)?;

        let frame_len = HEADER_LEN + len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len as usize);
        Message::from_parts(tag, &payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TunnelError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_frame(&msg, dst)
    }
}

/// 从流中读取一条消息
///
/// 只读取恰好一帧的字节，之后流可以直接交给拼接使用
pub async fn read_msg<R>(reader: &mut R, max_payload: u64) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = reader.read_u8().await?;
    let len = reader.read_u64().await?;
    MessageCodec::new(max_payload).check_len(tag, len)?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Message::from_parts(tag, &payload)
}

/// 向流中写入一条消息并刷新
pub async fn write_msg<W>(writer: &mut W, msg: &Message, max_payload: u64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    MessageCodec::new(max_payload).encode_frame(msg, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
