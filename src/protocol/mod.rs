/// 控制协议
///
/// 定义客户端与服务器之间交换的消息以及帧编解码
mod codec;
mod message;

pub use codec::{read_msg, write_msg, MessageCodec, DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN};
pub use message::*;

/// 协议版本（随 Login 发送）
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
