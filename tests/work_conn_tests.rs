/// 工作连接集成测试：按需拨号、拼接本地服务、失败隔离
mod common;

use common::*;
use revtun::client::{ControlState, ProxyState, ServiceHandle};
use revtun::config::{ProxyConfig, ProxyType};
use revtun::protocol::{
    read_msg, write_msg, Message, NewProxyResp, ReqWorkConn, UdpPacket, DEFAULT_MAX_MESSAGE_SIZE,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

/// 启动服务、完成登录并确认所有代理的注册
async fn start_active(
    server: &mut FakeServer,
    proxies: Vec<ProxyConfig>,
) -> (
    ServiceHandle,
    tokio::task::JoinHandle<revtun::Result<()>>,
    ControlConn,
) {
    let count = proxies.len();
    let (handle, task) = spawn_service(full_config(client_config(server.port()), proxies, vec![]));

    let mut control = server.accept_control().await;
    control.accept_login("abc123").await;
    for _ in 0..count {
        match control.recv().await {
            Message::NewProxy(req) => {
                control
                    .send(Message::NewProxyResp(NewProxyResp {
                        proxy_name: req.proxy_name.clone(),
                        remote_addr: ":6000".to_string(),
                        error: String::new(),
                    }))
                    .await;
            }
            other => panic!("expected NewProxy, got {:?}", other),
        }
    }
    wait_for_state(&handle, ControlState::Active).await;
    (handle, task, control)
}

async fn request_work_conn(control: &mut ControlConn, proxy: &str) {
    control
        .send(Message::ReqWorkConn(ReqWorkConn {
            proxy_name: proxy.to_string(),
        }))
        .await;
}

async fn echo_roundtrip(conn: &mut WorkConn, payload: &[u8]) {
    conn.stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, conn.stream.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for echo")
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_work_conn_splices_to_local_service() {
    let mut server = FakeServer::start().await;
    let echo = start_echo_server().await;
    let web = ProxyConfig::builder("web", ProxyType::Tcp)
        .local_port(echo.port())
        .build()
        .unwrap();
    let (handle, task, mut control) = start_active(&mut server, vec![web]).await;

    request_work_conn(&mut control, "web").await;
    let mut conn = server.accept_work_conn().await;
    assert_eq!(conn.request.run_id, "abc123");
    assert_eq!(conn.request.proxy_name, "web");
    assert!(conn.request.privilege_key.is_empty());

    conn.start().await;
    echo_roundtrip(&mut conn, b"hello through the tunnel").await;

    stop_service(&handle, task).await;
}

#[tokio::test]
async fn test_unreachable_local_target_aborts_only_that_session() {
    let mut server = FakeServer::start().await;
    let echo = start_echo_server().await;
    let web = ProxyConfig::builder("web", ProxyType::Tcp)
        .local_port(echo.port())
        .build()
        .unwrap();
    let dead = ProxyConfig::builder("dead", ProxyType::Tcp)
        .local_port(get_available_port())
        .build()
        .unwrap();
    let (handle, task, mut control) = start_active(&mut server, vec![web, dead]).await;

    request_work_conn(&mut control, "dead").await;
    let mut failed = server.accept_work_conn().await;
    assert_eq!(failed.request.proxy_name, "dead");
    failed.start().await;

    // 本地拨号失败后客户端关闭这条工作连接
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, failed.stream.read(&mut buf))
        .await
        .expect("Timed out waiting for aborted work connection")
        .unwrap_or(0);
    assert_eq!(n, 0);

    // 控制连接与后续请求不受影响
    request_work_conn(&mut control, "web").await;
    let mut conn = server.accept_work_conn().await;
    conn.start().await;
    echo_roundtrip(&mut conn, b"still working").await;
    assert_eq!(handle.status().state, ControlState::Active);

    stop_service(&handle, task).await;
}

/// 等待客户端关闭这条工作连接
async fn expect_closed(conn: &mut WorkConn) {
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, conn.stream.read(&mut buf))
        .await
        .expect("Timed out waiting for aborted work connection")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_repeated_local_dial_failures_mark_proxy_error() {
    let mut server = FakeServer::start().await;
    let dead = ProxyConfig::builder("dead", ProxyType::Tcp)
        .local_port(get_available_port())
        .build()
        .unwrap();
    let (handle, task, mut control) = start_active(&mut server, vec![dead]).await;
    let proxies = handle.proxies();
    wait_until("dead is running", || {
        proxies.status("dead").ok() == Some(ProxyState::Running)
    })
    .await;

    for _ in 0..2 {
        request_work_conn(&mut control, "dead").await;
        let mut conn = server.accept_work_conn().await;
        conn.start().await;
        expect_closed(&mut conn).await;
    }
    assert_eq!(proxies.status("dead").unwrap(), ProxyState::Running);

    request_work_conn(&mut control, "dead").await;
    let mut conn = server.accept_work_conn().await;
    conn.start().await;
    expect_closed(&mut conn).await;
    wait_until("dead is marked as error", || {
        matches!(proxies.status("dead"), Ok(ProxyState::Error(_)))
    })
    .await;

    // 之后的请求仍然会被处理
    request_work_conn(&mut control, "dead").await;
    let conn = server.accept_work_conn().await;
    assert_eq!(conn.request.proxy_name, "dead");
    assert_eq!(handle.status().state, ControlState::Active);

    stop_service(&handle, task).await;
}

#[tokio::test]
async fn test_work_conn_stays_counted_after_half_close() {
    let mut server = FakeServer::start().await;

    // 本地服务读到 EOF 之后才回复
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = local.local_addr().unwrap().port();
    let (replying_tx, replying_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut socket, _) = local.accept().await.unwrap();
        let mut request = Vec::new();
        socket.read_to_end(&mut request).await.unwrap();
        let _ = replying_tx.send(());
        tokio::time::sleep(Duration::from_millis(300)).await;
        socket.write_all(b"late reply").await.unwrap();
    });

    let late = ProxyConfig::builder("late", ProxyType::Tcp)
        .local_port(local_port)
        .build()
        .unwrap();
    let (handle, task, mut control) = start_active(&mut server, vec![late]).await;

    request_work_conn(&mut control, "late").await;
    let mut conn = server.accept_work_conn().await;
    conn.start().await;
    conn.stream.write_all(b"request").await.unwrap();
    conn.stream.shutdown().await.unwrap();

    timeout(WAIT, replying_rx).await.unwrap().unwrap();
    assert_eq!(handle.status().active_work_conns, 1);

    let mut reply = Vec::new();
    timeout(WAIT, conn.stream.read_to_end(&mut reply))
        .await
        .expect("Timed out waiting for late reply")
        .unwrap();
    assert_eq!(reply, b"late reply");

    let status_handle = handle.clone();
    wait_until("work connection is released", || {
        status_handle.status().active_work_conns == 0
    })
    .await;

    stop_service(&handle, task).await;
}

#[tokio::test]
async fn test_concurrent_work_conns_are_independent() {
    let mut server = FakeServer::start().await;
    let echo = start_echo_server().await;
    let web = ProxyConfig::builder("web", ProxyType::Tcp)
        .local_port(echo.port())
        .build()
        .unwrap();
    let (handle, task, mut control) = start_active(&mut server, vec![web]).await;

    request_work_conn(&mut control, "web").await;
    request_work_conn(&mut control, "web").await;
    let mut first = server.accept_work_conn().await;
    let mut second = server.accept_work_conn().await;
    first.start().await;
    second.start().await;

    echo_roundtrip(&mut first, b"first-1").await;
    echo_roundtrip(&mut second, b"second-1").await;
    echo_roundtrip(&mut first, b"first-2").await;

    let status_handle = handle.clone();
    wait_until("two work connections are active", || {
        status_handle.status().active_work_conns == 2
    })
    .await;

    // 关闭其中一条不影响另一条
    drop(first);
    echo_roundtrip(&mut second, b"second-2").await;
    drop(second);

    wait_until("work connections are released", || {
        status_handle.status().active_work_conns == 0
    })
    .await;

    stop_service(&handle, task).await;
}

#[tokio::test]
async fn test_refused_work_conn_is_dropped() {
    let mut server = FakeServer::start().await;
    let echo = start_echo_server().await;
    let web = ProxyConfig::builder("web", ProxyType::Tcp)
        .local_port(echo.port())
        .build()
        .unwrap();
    let (handle, task, mut control) = start_active(&mut server, vec![web]).await;

    request_work_conn(&mut control, "web").await;
    let mut conn = server.accept_work_conn().await;
    conn.refuse("no visitor waiting").await;

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, conn.stream.read(&mut buf))
        .await
        .expect("Timed out waiting for refused work connection")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(handle.status().state, ControlState::Active);

    stop_service(&handle, task).await;
}

#[tokio::test]
async fn test_udp_proxy_carries_envelopes() {
    let mut server = FakeServer::start().await;

    let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local_port = local.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = local.recv_from(&mut buf).await {
            let _ = local.send_to(&buf[..n], from).await;
        }
    });

    let dns = ProxyConfig::builder("dns", ProxyType::Udp)
        .local_port(local_port)
        .build()
        .unwrap();
    let (handle, task, mut control) = start_active(&mut server, vec![dns]).await;

    request_work_conn(&mut control, "dns").await;
    let mut conn = server.accept_work_conn().await;
    conn.start().await;

    let query = Message::UdpPacket(UdpPacket {
        content: b"query".to_vec(),
        remote_addr: "198.51.100.1:5353".to_string(),
    });
    write_msg(&mut conn.stream, &query, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap();

    let reply = timeout(WAIT, read_msg(&mut conn.stream, DEFAULT_MAX_MESSAGE_SIZE))
        .await
        .expect("Timed out waiting for udp reply")
        .unwrap();
    assert_eq!(reply, query);

    drop(conn);
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_service(&handle, task).await;
}
