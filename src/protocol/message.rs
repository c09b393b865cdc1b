/// 控制协议消息定义
///
/// 每种消息都有一个单字节类型标签，负载为 JSON 结构
use crate::config::ProxyType;
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 消息类型标签
pub mod tag {
    pub const LOGIN: u8 = b'o';
    pub const LOGIN_RESP: u8 = b'1';
    pub const NEW_PROXY: u8 = b'p';
    pub const NEW_PROXY_RESP: u8 = b'2';
    pub const CLOSE_PROXY: u8 = b'c';
    pub const NEW_WORK_CONN: u8 = b'w';
    pub const REQ_WORK_CONN: u8 = b'r';
    pub const START_WORK_CONN: u8 = b's';
    pub const NEW_VISITOR_CONN: u8 = b'v';
    pub const NEW_VISITOR_CONN_RESP: u8 = b'3';
    pub const PING: u8 = b'h';
    pub const PONG: u8 = b'4';
    pub const UDP_PACKET: u8 = b'u';
    pub const NAT_HOLE_VISITOR: u8 = b'i';
    pub const NAT_HOLE_CLIENT: u8 = b'n';
    pub const NAT_HOLE_CLIENT_RESP: u8 = b'm';
    pub const NAT_HOLE_RESP: u8 = b'5';
    pub const NAT_HOLE_DETECT: u8 = b'd';
}

/// 登录请求
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Login {
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub user: String,
    /// 基于令牌和时间戳计算的签名
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
    /// 首次登录为空，重连时携带上次分配的 run id
    #[serde(default)]
    pub run_id: String,
    /// 声明的代理数量
    #[serde(default)]
    pub proxy_count: usize,
    #[serde(default)]
    pub metas: HashMap<String, String>,
}

/// 登录响应，`error` 为空表示成功
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoginResp {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub error: String,
}

/// 注册代理
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_key: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metas: HashMap<String, String>,

    // tcp / udp
    #[serde(default)]
    pub remote_port: u16,

    // http / https
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_pwd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_header_rewrite: String,

    // stcp / xtcp
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sk: String,
}

/// 代理注册结果，`error` 为空表示成功
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewProxyResp {
    pub proxy_name: String,
    /// 服务器分配的远程地址（例如 `:6000` 或域名）
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloseProxy {
    pub proxy_name: String,
}

/// 工作连接上发送的第一条消息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewWorkConn {
    pub run_id: String,
    pub proxy_name: String,
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// 服务器请求为某个代理建立新的工作连接
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReqWorkConn {
    pub proxy_name: String,
}

/// 服务器在工作连接上发出的就绪信号
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartWorkConn {
    pub proxy_name: String,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_addr: String,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub error: String,
}

/// stcp visitor 通过服务器中继访问目标代理
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewVisitorConn {
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default)]
    pub error: String,
}

/// UDP 数据报信封
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UdpPacket {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    /// 服务器侧用户的地址，用于区分会话
    #[serde(default)]
    pub remote_addr: String,
}

/// visitor 发起的打洞请求
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NatHoleVisitor {
    pub transaction_id: String,
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    #[serde(default)]
    pub candidate_addrs: Vec<String>,
}

/// 服务器转发给被访问客户端的打洞请求
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NatHoleClient {
    pub transaction_id: String,
    pub proxy_name: String,
    pub sid: String,
    pub sign_key: String,
    pub timestamp: i64,
    #[serde(default)]
    pub candidate_addrs: Vec<String>,
}

/// 被访问客户端的应答
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NatHoleClientResp {
    pub transaction_id: String,
    pub sid: String,
    #[serde(default)]
    pub candidate_addrs: Vec<String>,
    #[serde(default)]
    pub error: String,
}

/// 服务器返回给 visitor 的打洞结果
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NatHoleResp {
    pub transaction_id: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub candidate_addrs: Vec<String>,
    #[serde(default)]
    pub error: String,
}

/// 打洞探测包（直接在 UDP 上交换）
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NatHoleDetect {
    pub sid: String,
    #[serde(default)]
    pub ack: bool,
}

/// 协议消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
    UdpPacket(UdpPacket),
    NatHoleVisitor(NatHoleVisitor),
    NatHoleClient(NatHoleClient),
    NatHoleClientResp(NatHoleClientResp),
    NatHoleResp(NatHoleResp),
    NatHoleDetect(NatHoleDetect),
    /// 未知类型（负载已丢弃），由调度方记录后忽略
    Unknown { tag: u8 },
}

impl Message {
    /// 消息类型标签
    pub fn tag(&self) -> u8 {
        match self {
            Message::Login(_) => tag::LOGIN,
            Message::LoginResp(_) => tag::LOGIN_RESP,
            Message::NewProxy(_) => tag::NEW_PROXY,
            Message::NewProxyResp(_) => tag::NEW_PROXY_RESP,
            Message::CloseProxy(_) => tag::CLOSE_PROXY,
            Message::NewWorkConn(_) => tag::NEW_WORK_CONN,
            Message::ReqWorkConn(_) => tag::REQ_WORK_CONN,
            Message::StartWorkConn(_) => tag::START_WORK_CONN,
            Message::NewVisitorConn(_) => tag::NEW_VISITOR_CONN,
            Message::NewVisitorConnResp(_) => tag::NEW_VISITOR_CONN_RESP,
            Message::Ping(_) => tag::PING,
            Message::Pong(_) => tag::PONG,
            Message::UdpPacket(_) => tag::UDP_PACKET,
            Message::NatHoleVisitor(_) => tag::NAT_HOLE_VISITOR,
            Message::NatHoleClient(_) => tag::NAT_HOLE_CLIENT,
            Message::NatHoleClientResp(_) => tag::NAT_HOLE_CLIENT_RESP,
            Message::NatHoleResp(_) => tag::NAT_HOLE_RESP,
            Message::NatHoleDetect(_) => tag::NAT_HOLE_DETECT,
            Message::Unknown { tag } => *tag,
        }
    }

    /// 消息名称（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            Message::Login(_) => "Login",
            Message::LoginResp(_) => "LoginResp",
            Message::NewProxy(_) => "NewProxy",
            Message::NewProxyResp(_) => "NewProxyResp",
            Message::CloseProxy(_) => "CloseProxy",
            Message::NewWorkConn(_) => "NewWorkConn",
            Message::ReqWorkConn(_) => "ReqWorkConn",
            Message::StartWorkConn(_) => "StartWorkConn",
            Message::NewVisitorConn(_) => "NewVisitorConn",
            Message::NewVisitorConnResp(_) => "NewVisitorConnResp",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::UdpPacket(_) => "UdpPacket",
            Message::NatHoleVisitor(_) => "NatHoleVisitor",
            Message::NatHoleClient(_) => "NatHoleClient",
            Message::NatHoleClientResp(_) => "NatHoleClientResp",
            Message::NatHoleResp(_) => "NatHoleResp",
            Message::NatHoleDetect(_) => "NatHoleDetect",
            Message::Unknown { .. } => "Unknown",
        }
    }

    /// 序列化负载
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Login(m) => serde_json::to_vec(m),
            Message::LoginResp(m) => serde_json::to_vec(m),
            Message::NewProxy(m) => serde_json::to_vec(m),
            Message::NewProxyResp(m) => serde_json::to_vec(m),
            Message::CloseProxy(m) => serde_json::to_vec(m),
            Message::NewWorkConn(m) => serde_json::to_vec(m),
            Message::ReqWorkConn(m) => serde_json::to_vec(m),
            Message::StartWorkConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConnResp(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
            Message::UdpPacket(m) => serde_json::to_vec(m),
            Message::NatHoleVisitor(m) => serde_json::to_vec(m),
            Message::NatHoleClient(m) => serde_json::to_vec(m),
            Message::NatHoleClientResp(m) => serde_json::to_vec(m),
            Message::NatHoleResp(m) => serde_json::to_vec(m),
            Message::NatHoleDetect(m) => serde_json::to_vec(m),
            Message::Unknown { .. } => Ok(Vec::new()),
        };
        payload.map_err(|e| TunnelError::framing(format!("failed to encode {}: {}", self.name(), e)))
    }

    /// 根据标签和负载还原消息
    pub fn from_parts(tag: u8, payload: &[u8]) -> Result<Message> {
        fn parse<T: serde::de::DeserializeOwned>(payload: &[u8], name: &str) -> Result<T> {
            serde_json::from_slice(payload)
                .map_err(|e| TunnelError::framing(format!("malformed {} payload: {}", name, e)))
        }

        let msg = match tag {
            tag::LOGIN => Message::Login(parse(payload, "Login")?),
            tag::LOGIN_RESP => Message::LoginResp(parse(payload, "LoginResp")?),
            tag::NEW_PROXY => Message::NewProxy(parse(payload, "NewProxy")?),
            tag::NEW_PROXY_RESP => Message::NewProxyResp(parse(payload, "NewProxyResp")?),
            tag::CLOSE_PROXY => Message::CloseProxy(parse(payload, "CloseProxy")?),
            tag::NEW_WORK_CONN => Message::NewWorkConn(parse(payload, "NewWorkConn")?),
            tag::REQ_WORK_CONN => Message::ReqWorkConn(parse(payload, "ReqWorkConn")?),
            tag::START_WORK_CONN => Message::StartWorkConn(parse(payload, "StartWorkConn")?),
            tag::NEW_VISITOR_CONN => Message::NewVisitorConn(parse(payload, "NewVisitorConn")?),
            tag::NEW_VISITOR_CONN_RESP => {
                Message::NewVisitorConnResp(parse(payload, "NewVisitorConnResp")?)
            }
            tag::PING => Message::Ping(parse(payload, "Ping")?),
            tag::PONG => Message::Pong(parse(payload, "Pong")?),
            tag::UDP_PACKET => Message::UdpPacket(parse(payload, "UdpPacket")?),
            tag::NAT_HOLE_VISITOR => Message::NatHoleVisitor(parse(payload, "NatHoleVisitor")?),
            tag::NAT_HOLE_CLIENT => Message::NatHoleClient(parse(payload, "NatHoleClient")?),
            tag::NAT_HOLE_CLIENT_RESP => {
                Message::NatHoleClientResp(parse(payload, "NatHoleClientResp")?)
            }
            tag::NAT_HOLE_RESP => Message::NatHoleResp(parse(payload, "NatHoleResp")?),
            tag::NAT_HOLE_DETECT => Message::NatHoleDetect(parse(payload, "NatHoleDetect")?),
            other => Message::Unknown { tag: other },
        };
        Ok(msg)
    }
}

/// 二进制内容在 JSON 中以 base64 字符串表示
mod base64_bytes {
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique() {
        let tags = [
            tag::LOGIN,
            tag::LOGIN_RESP,
            tag::NEW_PROXY,
            tag::NEW_PROXY_RESP,
            tag::CLOSE_PROXY,
            tag::NEW_WORK_CONN,
            tag::REQ_WORK_CONN,
            tag::START_WORK_CONN,
            tag::NEW_VISITOR_CONN,
            tag::NEW_VISITOR_CONN_RESP,
            tag::PING,
            tag::PONG,
            tag::UDP_PACKET,
            tag::NAT_HOLE_VISITOR,
            tag::NAT_HOLE_CLIENT,
            tag::NAT_HOLE_CLIENT_RESP,
            tag::NAT_HOLE_RESP,
            tag::NAT_HOLE_DETECT,
        ];
        let unique: std::collections::HashSet<_> = tags.iter().collect();
        assert_eq!(unique.len(), tags.len());
    }

    #[test]
    fn test_udp_packet_content_is_base64() {
        let msg = UdpPacket {
            content: vec![0, 1, 2, 255],
            remote_addr: "1.2.3.4:5000".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"AAEC/w==\""));
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let msg = Message::from_parts(b'z', b"{\"anything\":1}").unwrap();
        assert_eq!(msg, Message::Unknown { tag: b'z' });
        assert_eq!(msg.name(), "Unknown");
    }

    #[test]
    fn test_malformed_payload_is_framing_error() {
        let err = Message::from_parts(tag::LOGIN_RESP, b"not json").unwrap_err();
        assert!(err.is_framing());
    }

    #[test]
    fn test_optional_fields_default() {
        let msg = Message::from_parts(tag::NEW_PROXY_RESP, br#"{"proxy_name":"web"}"#).unwrap();
        match msg {
            Message::NewProxyResp(resp) => {
                assert_eq!(resp.proxy_name, "web");
                assert!(resp.error.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
