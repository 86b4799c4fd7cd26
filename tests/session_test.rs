//! 会话集成测试：握手、版本协商、服务端请求与关闭

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{initialize_result, spawn_fake_server, standard_handler, tool, wait_until, Reply};
use hive::core::{HiveError, ProtocolError};
use hive::dispatch::{Dispatcher, ToolRequest, ToolStatus};
use hive::protocol::{methods, Message, Request, RequestId, RpcError};
use hive::server::ToolServer;
use hive::session::{Session, SessionState};
use hive::transport::{ChannelTransport, Transport};

const CONNECT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_handshake_with_tool_server_reaches_ready() {
    let (client, server_end) = ChannelTransport::pair();
    let server = Arc::new(ToolServer::new("builtin", "1.0").with_builtin_tools());
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(Arc::new(server_end), shutdown.clone()));

    let session = Session::new("builtin", Arc::new(client));
    session.connect(CONNECT).await.unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    let negotiated = session.negotiated().unwrap();
    assert_eq!(negotiated.protocol_version, "2025-03-26");
    assert_eq!(negotiated.server_info.unwrap().name, "builtin");
    let names: Vec<String> = session.manifest().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["get_time", "calculate"]);
    assert!(session.manifest().iter().all(|t| t.origin == "builtin"));

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    shutdown.cancel();
}

#[tokio::test]
async fn test_older_supported_version_is_accepted() {
    let (client, fake) = spawn_fake_server(|req: &Request| match req.method.as_str() {
        methods::INITIALIZE => Reply::Result(initialize_result("2024-11-05")),
        methods::TOOLS_LIST => Reply::Result(json!({"tools": []})),
        _ => Reply::Silent,
    });
    let session = Session::new("old", client);
    session.connect(CONNECT).await.unwrap();
    assert_eq!(session.negotiated().unwrap().protocol_version, "2024-11-05");
    assert_eq!(fake.notifications(methods::INITIALIZED).len(), 1);
}

#[tokio::test]
async fn test_version_mismatch_errors_session() {
    let (client, fake) = spawn_fake_server(|req: &Request| match req.method.as_str() {
        methods::INITIALIZE => Reply::Result(initialize_result("1999-01-01")),
        _ => Reply::Result(json!({"tools": [tool("echo")]})),
    });
    let session = Session::new("future", client);

    let err = session.connect(CONNECT).await.unwrap_err();
    assert!(matches!(
        err,
        HiveError::Protocol(ProtocolError::VersionMismatch { .. })
    ));
    assert_eq!(session.state(), SessionState::Errored);
    assert!(fake.notifications(methods::INITIALIZED).is_empty());
    assert!(fake.requests(methods::TOOLS_LIST).is_empty());

    // Errored 会话拒绝派发，且不会发出 tools/call
    let dispatcher = Dispatcher::default();
    let result = dispatcher
        .dispatch(
            &session,
            ToolRequest::new("echo", json!({})),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(result.status, ToolStatus::TransportError);
    assert!(result.error.unwrap().contains("session unavailable"));
    assert!(fake.requests(methods::TOOLS_CALL).is_empty());

    // 终止状态不能重新连接
    assert!(session.connect(CONNECT).await.is_err());
}

#[tokio::test]
async fn test_initialize_rejection_is_protocol_error() {
    let (client, _fake) = spawn_fake_server(|_req: &Request| {
        Reply::Error(RpcError::new(RpcError::INVALID_PARAMS, "unsupported client"))
    });
    let session = Session::new("picky", client);
    let err = session.connect(CONNECT).await.unwrap_err();
    match err {
        HiveError::Protocol(ProtocolError::Rejected { method, code, .. }) => {
            assert_eq!(method, methods::INITIALIZE);
            assert_eq!(code, RpcError::INVALID_PARAMS);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), SessionState::Errored);
}

#[tokio::test]
async fn test_connect_timeout() {
    let (client, _fake) = spawn_fake_server(|_req: &Request| Reply::Silent);
    let session = Session::new("mute", client);
    let err = session
        .connect(Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::ConnectTimeout(_)));
    assert_eq!(session.state(), SessionState::Errored);
    assert!(session.pending().is_empty());
}

#[tokio::test]
async fn test_duplicate_tool_in_manifest_is_rejected() {
    let (client, _fake) = spawn_fake_server(standard_handler(
        vec![tool("echo"), tool("echo")],
        |_req| Reply::Silent,
    ));
    let session = Session::new("dup", client);
    let err = session.connect(CONNECT).await.unwrap_err();
    assert!(matches!(
        err,
        HiveError::Protocol(ProtocolError::MalformedManifest(_))
    ));
}

#[tokio::test]
async fn test_manifest_follows_cursor() {
    let (client, fake) = spawn_fake_server(|req: &Request| match req.method.as_str() {
        methods::INITIALIZE => Reply::Result(initialize_result("2025-03-26")),
        methods::TOOLS_LIST => {
            let cursor = req
                .params
                .as_ref()
                .and_then(|p| p.get("cursor"))
                .and_then(|c| c.as_str())
                .map(str::to_string);
            match cursor.as_deref() {
                None => Reply::Result(json!({"tools": [tool("alpha")], "nextCursor": "page-2"})),
                Some("page-2") => Reply::Result(json!({"tools": [tool("beta")]})),
                Some(_) => Reply::Error(RpcError::invalid_params("bad cursor")),
            }
        }
        _ => Reply::Silent,
    });
    let session = Session::new("paged", client);
    session.connect(CONNECT).await.unwrap();
    let names: Vec<String> = session.manifest().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(fake.requests(methods::TOOLS_LIST).len(), 2);
}

#[tokio::test]
async fn test_server_requests_are_answered() {
    let (client, fake) = spawn_fake_server(standard_handler(vec![tool("echo")], |_req| Reply::Silent));
    let session = Session::new("chatty", client);
    session.connect(CONNECT).await.unwrap();

    fake.send(Message::from(Request::new(RequestId::from(900), methods::PING, None)))
        .await;
    fake.send(Message::from(Request::new(
        RequestId::from(901),
        "sampling/createMessage",
        Some(json!({})),
    )))
    .await;

    assert!(wait_until(Duration::from_secs(2), || fake.responses().len() == 2).await);
    let responses = fake.responses();
    let ping = responses
        .iter()
        .find(|r| r.id == RequestId::from(900))
        .unwrap();
    assert_eq!(ping.result, Some(json!({})));
    let unknown = responses
        .iter()
        .find(|r| r.id == RequestId::from(901))
        .unwrap();
    assert_eq!(unknown.error.as_ref().unwrap().code, RpcError::METHOD_NOT_FOUND);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_peer_close_fails_pending_and_closes_session() {
    let (client, fake) = spawn_fake_server(standard_handler(vec![tool("echo")], |_req| Reply::Silent));
    let session = Session::new("fragile", client);
    session.connect(CONNECT).await.unwrap();

    let dispatcher = Dispatcher::default();
    let call_session = session.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .dispatch(
                &call_session,
                ToolRequest::new("echo", json!({"text": "hi"})),
                &CancellationToken::new(),
            )
            .await
    });
    assert!(wait_until(Duration::from_secs(2), || !fake.requests(methods::TOOLS_CALL).is_empty()).await);

    fake.transport.close().await.unwrap();
    let result = call.await.unwrap();
    assert_eq!(result.status, ToolStatus::TransportError);
    assert!(wait_until(Duration::from_secs(2), || session.state() == SessionState::Closed).await);
    assert!(session.pending().is_empty());
}
