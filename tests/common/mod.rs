//! Common utilities for integration tests
//!
//! `FakeServer` 在回环地址上讲同一套帧协议，按每条连接的第一条消息
//! 把连接分到控制连接 / 工作连接 / visitor 连接三个队列
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use revtun::client::{ControlState, Service, ServiceHandle};
use revtun::config::{
    ClientConfig, ClientConfigBuilder, ClientFullConfig, ProxyConfig, ReconnectConfig,
    VisitorConfig,
};
use revtun::protocol::{
    read_msg, write_msg, Login, LoginResp, Message, MessageCodec, NewVisitorConn, NewWorkConn,
    Pong, StartWorkConn, DEFAULT_MAX_MESSAGE_SIZE,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// 测试中所有等待的上限
pub const WAIT: Duration = Duration::from_secs(5);

/// Find an available port
pub fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// 假的控制面 API：`stalled` 中列出的 action 接受请求后永不应答，其余一律成功
pub async fn start_api_server(stalled: &'static [&'static str]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind api server");
    let addr = listener.local_addr().expect("Failed to get api addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request).to_string();
                let line = head.lines().next().unwrap_or_default().to_string();

                if stalled
                    .iter()
                    .any(|action| line.contains(&format!("action={}&", action)))
                {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return;
                }

                let body = if line.contains("action=getlimit&") {
                    r#"{"status":200,"max-in":1024,"max-out":2048}"#
                } else {
                    r#"{"success":true,"message":""}"#
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}/api", addr)
}

/// 已登录的控制连接（服务器侧）
pub struct ControlConn {
    pub login: Login,
    framed: Framed<TcpStream, MessageCodec>,
}

impl ControlConn {
    /// 接受登录并分配 run id
    pub async fn accept_login(&mut self, run_id: &str) {
        self.send(Message::LoginResp(LoginResp {
            version: "test".to_string(),
            run_id: run_id.to_string(),
            error: String::new(),
        }))
        .await;
    }

    pub async fn reject_login(&mut self, reason: &str) {
        self.send(Message::LoginResp(LoginResp {
            version: "test".to_string(),
            run_id: String::new(),
            error: reason.to_string(),
        }))
        .await;
    }

    pub async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.expect("Failed to send to client");
    }

    /// 读取下一条非心跳消息，期间自动回复 Pong
    pub async fn recv(&mut self) -> Message {
        timeout(WAIT, self.recv_inner())
            .await
            .expect("Timed out waiting for control message")
            .expect("Control connection closed by client")
    }

    /// 在给定时间内读取下一条非心跳消息
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Message> {
        timeout(wait, self.recv_inner()).await.ok().flatten()
    }

    /// 等待客户端关闭控制连接，期间收到的非心跳消息按顺序返回
    pub async fn drain_until_closed(&mut self) -> Vec<Message> {
        let mut received = Vec::new();
        let _ = timeout(WAIT, async {
            while let Some(msg) = self.recv_inner().await {
                received.push(msg);
            }
        })
        .await;
        received
    }

    async fn recv_inner(&mut self) -> Option<Message> {
        loop {
            match self.framed.next().await {
                Some(Ok(Message::Ping(_))) => {
                    let _ = self
                        .framed
                        .send(Message::Pong(Pong {
                            error: String::new(),
                        }))
                        .await;
                }
                Some(Ok(msg)) => return Some(msg),
                Some(Err(_)) | None => return None,
            }
        }
    }
}

/// 工作连接（服务器侧）
pub struct WorkConn {
    pub request: NewWorkConn,
    pub stream: TcpStream,
}

impl WorkConn {
    /// 发送就绪信号，之后 `stream` 与客户端本地服务直接相连
    pub async fn start(&mut self) {
        self.respond(String::new()).await;
    }

    pub async fn refuse(&mut self, reason: &str) {
        self.respond(reason.to_string()).await;
    }

    async fn respond(&mut self, error: String) {
        let msg = Message::StartWorkConn(StartWorkConn {
            proxy_name: self.request.proxy_name.clone(),
            src_addr: "203.0.113.7".to_string(),
            src_port: 50000,
            dst_addr: String::new(),
            dst_port: 0,
            error,
        });
        write_msg(&mut self.stream, &msg, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .expect("Failed to send StartWorkConn");
    }
}

/// visitor 连接（服务器侧）
pub struct VisitorConn {
    pub request: NewVisitorConn,
    pub stream: TcpStream,
}

/// 回环地址上的假服务器
pub struct FakeServer {
    pub addr: SocketAddr,
    controls: mpsc::UnboundedReceiver<ControlConn>,
    work_conns: mpsc::UnboundedReceiver<WorkConn>,
    visitor_conns: mpsc::UnboundedReceiver<VisitorConn>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake server");
        let addr = listener.local_addr().expect("Failed to get server addr");

        let (control_tx, controls) = mpsc::unbounded_channel();
        let (work_tx, work_conns) = mpsc::unbounded_channel();
        let (visitor_tx, visitor_conns) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let control_tx = control_tx.clone();
                let work_tx = work_tx.clone();
                let visitor_tx = visitor_tx.clone();
                tokio::spawn(async move {
                    let Ok(first) = read_msg(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await else {
                        return;
                    };
                    match first {
                        Message::Login(login) => {
                            let framed = Framed::new(stream, MessageCodec::default());
                            let _ = control_tx.send(ControlConn { login, framed });
                        }
                        Message::NewWorkConn(request) => {
                            let _ = work_tx.send(WorkConn { request, stream });
                        }
                        Message::NewVisitorConn(request) => {
                            let _ = visitor_tx.send(VisitorConn { request, stream });
                        }
                        _ => {}
                    }
                });
            }
        });

        Self {
            addr,
            controls,
            work_conns,
            visitor_conns,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn accept_control(&mut self) -> ControlConn {
        timeout(WAIT, self.controls.recv())
            .await
            .expect("Timed out waiting for control connection")
            .expect("Fake server stopped")
    }

    /// 在给定时间内没有新的控制连接时返回 `None`
    pub async fn accept_control_within(&mut self, wait: Duration) -> Option<ControlConn> {
        timeout(wait, self.controls.recv()).await.ok().flatten()
    }

    pub async fn accept_work_conn(&mut self) -> WorkConn {
        timeout(WAIT, self.work_conns.recv())
            .await
            .expect("Timed out waiting for work connection")
            .expect("Fake server stopped")
    }

    pub async fn accept_visitor_conn(&mut self) -> VisitorConn {
        timeout(WAIT, self.visitor_conns.recv())
            .await
            .expect("Timed out waiting for visitor connection")
            .expect("Fake server stopped")
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 指向假服务器、重连退避很短的客户端配置
pub fn client_config(server_port: u16) -> ClientConfig {
    ClientConfigBuilder::new()
        .server_addr("127.0.0.1")
        .server_port(server_port)
        .token("test-token")
        .login_timeout_secs(5)
        .work_conn_ready_timeout_secs(5)
        .nat_hole_timeout_secs(5)
        .reconnect(ReconnectConfig {
            initial_delay_ms: 50,
            max_delay_ms: 200,
            jitter: 0.0,
        })
        .build()
        .expect("Failed to build client config")
}

pub fn full_config(
    client: ClientConfig,
    proxies: Vec<ProxyConfig>,
    visitors: Vec<VisitorConfig>,
) -> ClientFullConfig {
    ClientFullConfig {
        client,
        proxies,
        visitors,
    }
}

/// 启动服务并返回句柄与运行任务
pub fn spawn_service(
    config: ClientFullConfig,
) -> (ServiceHandle, JoinHandle<revtun::Result<()>>) {
    let service = Service::new(config).expect("Failed to create service");
    let handle = service.handle();
    let task = tokio::spawn(service.run());
    (handle, task)
}

pub async fn wait_for_state(handle: &ServiceHandle, state: ControlState) {
    let mut watch = handle.state_watch();
    timeout(WAIT, watch.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for state {}", state))
        .expect("State channel closed");
}

/// 轮询直到条件成立
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 停止服务并等待运行任务结束
pub async fn stop_service(handle: &ServiceHandle, task: JoinHandle<revtun::Result<()>>) {
    handle.shutdown();
    timeout(WAIT, task)
        .await
        .expect("Service did not stop in time")
        .expect("Service task panicked")
        .expect("Service returned an error");
}
