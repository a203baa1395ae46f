//! End-to-end tests for the broker over real TCP and WebSocket
//! connections, driving the full daemon: listeners, endpoints, registry
//! actor, simulated backend and compiler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tdm_core::{
    Capabilities, NodeId, NodeStatus, Value, Variable, VariableMap, VmLanguage,
};
use tdm_protocol::{
    codec, ClientMessage, ErrorType, Node, ServerMessage, WatchFlags, MAX_MESSAGE_SIZE,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use tdmd::backend::SimulatedBackend;
use tdmd::compiler::SimulatedCompiler;
use tdmd::registry::spawn_registry;
use tdmd::server::{
    spawn_endpoint, BrokerServer, FramedSink, FramedSource, OUTBOUND_QUEUE_DEPTH,
};
use tdmd::token::TokenManager;

/// Per-read timeout; a test failing on this means a message never came.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Harness
// ============================================================================

struct TestBroker {
    tcp_addr: SocketAddr,
    ws_addr: SocketAddr,
    backend: SimulatedBackend,
    cancel_token: CancellationToken,
}

impl TestBroker {
    async fn spawn() -> Self {
        let (backend_tx, backend_rx) = tokio::sync::mpsc::channel(256);
        let backend = SimulatedBackend::new(backend_tx);
        let registry = spawn_registry(
            Arc::new(backend.clone()),
            Arc::new(SimulatedCompiler),
            backend_rx,
        );
        let tokens = Arc::new(TokenManager::new());
        let cancel_token = CancellationToken::new();

        let any: SocketAddr = "127.0.0.1:0".parse().expect("loopback addr");
        let server = BrokerServer::bind(any, any, registry, tokens, cancel_token.clone())
            .await
            .expect("bind test server");

        let tcp_addr = server.tcp_addr().expect("tcp addr");
        let ws_addr = server.ws_addr().expect("ws addr");
        tokio::spawn(server.run());

        Self {
            tcp_addr,
            ws_addr,
            backend,
            cancel_token,
        }
    }

    async fn spawn_node(&self, name: &str, renamable: bool) -> NodeId {
        self.backend.spawn_node(name, renamable).await
    }

    async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(self.tcp_addr)
            .await
            .expect("connect to broker");
        TestClient::new(stream)
    }

    fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

struct TestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self { reader, writer }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        use tokio::io::AsyncWriteExt;
        let frame = codec::encode_message(msg).expect("encode frame");
        self.writer.write_all(&frame).await.expect("write frame");
    }

    async fn recv(&mut self) -> ServerMessage {
        let payload = timeout(
            RECV_TIMEOUT,
            codec::read_frame(&mut self.reader, MAX_MESSAGE_SIZE),
        )
        .await
        .expect("timed out waiting for a message")
        .expect("read frame");
        codec::decode_payload(&payload).expect("decode message")
    }

    /// Reads until the connection closes; panics on a timeout.
    async fn recv_closed(&mut self) {
        loop {
            let result = timeout(
                RECV_TIMEOUT,
                codec::read_frame(&mut self.reader, MAX_MESSAGE_SIZE),
            )
            .await
            .expect("timed out waiting for close");
            match result {
                Ok(_) => continue, // drain whatever was still queued
                Err(_) => return,
            }
        }
    }

    /// Receives messages until `pred` matches, skipping the rest
    /// (spontaneous notifications interleave freely with responses).
    async fn recv_until<F>(&mut self, pred: F) -> ServerMessage
    where
        F: Fn(&ServerMessage) -> bool,
    {
        for _ in 0..64 {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
        panic!("expected message did not arrive within 64 messages");
    }

    /// Performs the handshake and returns the initial node list.
    async fn handshake(&mut self) -> Vec<Node> {
        self.send(&ClientMessage::handshake(None)).await;

        match self.recv().await {
            ServerMessage::ConnectionHandshake {
                protocol_version, ..
            } => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("expected handshake reply, got {other:?}"),
        }

        match self.recv().await {
            ServerMessage::NodesChanged { nodes } => nodes,
            other => panic!("expected initial NodesChanged, got {other:?}"),
        }
    }

    async fn lock(&mut self, request_id: u32, node_id: NodeId) {
        self.send(&ClientMessage::LockNode {
            request_id,
            node_id,
        })
        .await;
        let reply = self
            .recv_until(|m| {
                matches!(m,
                    ServerMessage::RequestCompleted { request_id: id }
                    | ServerMessage::Error { request_id: id, .. } if *id == request_id)
            })
            .await;
        assert!(
            matches!(reply, ServerMessage::RequestCompleted { .. }),
            "lock failed: {reply:?}"
        );
    }
}

fn is_response_for(msg: &ServerMessage, request_id: u32) -> bool {
    matches!(msg,
        ServerMessage::RequestCompleted { request_id: id }
        | ServerMessage::Error { request_id: id, .. }
        | ServerMessage::CompilationResultSuccess { request_id: id }
        | ServerMessage::CompilationResultFailure { request_id: id, .. }
        | ServerMessage::SetBreakpointsResponse { request_id: id, .. }
        | ServerMessage::NodeAsebaVmDescription { request_id: id, .. } if *id == request_id)
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_lists_existing_nodes() {
    let broker = TestBroker::spawn().await;
    let id = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    let nodes = client.handshake().await;

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, id);
    assert_eq!(nodes[0].name, "thymio-1");
    assert_eq!(nodes[0].status, NodeStatus::Available);
    // Loopback clients get local capabilities.
    assert!(nodes[0]
        .capabilities
        .contains(Capabilities::FORCE_RESET_AND_STOP));
    assert!(nodes[0].capabilities.contains(Capabilities::RENAME));

    broker.shutdown();
}

#[tokio::test]
async fn test_version_mismatch_closes_without_node_list() {
    let broker = TestBroker::spawn().await;
    broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client
        .send(&ClientMessage::ConnectionHandshake {
            protocol_version: 99,
            min_protocol_version: 99,
            max_message_size: MAX_MESSAGE_SIZE,
            token: None,
        })
        .await;

    match client.recv().await {
        ServerMessage::ConnectionHandshake {
            protocol_version, ..
        } => assert_eq!(protocol_version, 0),
        other => panic!("expected version-0 handshake, got {other:?}"),
    }

    // No NodesChanged follows; the connection just closes.
    use tokio::io::AsyncReadExt;
    let mut byte = [0u8; 1];
    let read = timeout(RECV_TIMEOUT, client.reader.read(&mut byte))
        .await
        .expect("timed out waiting for close")
        .expect("read");
    assert_eq!(read, 0, "connection should be closed after version 0");

    broker.shutdown();
}

#[tokio::test]
async fn test_second_handshake_terminates_connection() {
    let broker = TestBroker::spawn().await;
    let mut client = broker.connect().await;
    client.handshake().await;

    client.send(&ClientMessage::handshake(None)).await;
    client.recv_closed().await;

    broker.shutdown();
}

#[tokio::test]
async fn test_first_message_must_be_handshake() {
    let broker = TestBroker::spawn().await;
    let mut client = broker.connect().await;

    client.send(&ClientMessage::RequestListOfNodes).await;
    client.recv_closed().await;

    broker.shutdown();
}

// ============================================================================
// Locking (S1)
// ============================================================================

#[tokio::test]
async fn test_lock_contention_and_release_on_disconnect() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut a = broker.connect().await;
    a.handshake().await;
    let mut b = broker.connect().await;
    b.handshake().await;

    // A locks the node.
    a.send(&ClientMessage::LockNode {
        request_id: 1,
        node_id: node,
    })
    .await;
    let reply = a.recv_until(|m| is_response_for(m, 1)).await;
    assert!(matches!(reply, ServerMessage::RequestCompleted { .. }));

    // The holder sees the node as Ready, never Busy.
    let changed = a
        .recv_until(|m| matches!(m, ServerMessage::NodesChanged { .. }))
        .await;
    if let ServerMessage::NodesChanged { nodes } = changed {
        assert_eq!(nodes[0].status, NodeStatus::Ready);
    }

    // B sees Busy and cannot lock.
    let changed = b
        .recv_until(|m| matches!(m, ServerMessage::NodesChanged { .. }))
        .await;
    if let ServerMessage::NodesChanged { nodes } = changed {
        assert_eq!(nodes[0].status, NodeStatus::Busy);
    }
    b.send(&ClientMessage::LockNode {
        request_id: 2,
        node_id: node,
    })
    .await;
    let reply = b.recv_until(|m| is_response_for(m, 2)).await;
    assert_eq!(
        reply,
        ServerMessage::error(2, ErrorType::NodeBusy),
        "second lock must fail busy"
    );

    // A disconnects; its lock is released and B can take it.
    drop(a);
    b.recv_until(|m| {
        matches!(m, ServerMessage::NodesChanged { nodes }
            if nodes[0].status == NodeStatus::Available)
    })
    .await;

    b.send(&ClientMessage::LockNode {
        request_id: 3,
        node_id: node,
    })
    .await;
    let reply = b.recv_until(|m| is_response_for(m, 3)).await;
    assert!(matches!(reply, ServerMessage::RequestCompleted { .. }));

    broker.shutdown();
}

#[tokio::test]
async fn test_unlock_unknown_node() {
    let broker = TestBroker::spawn().await;
    let mut client = broker.connect().await;
    client.handshake().await;

    client
        .send(&ClientMessage::UnlockNode {
            request_id: 5,
            node_id: NodeId::generate(),
        })
        .await;
    let reply = client.recv_until(|m| is_response_for(m, 5)).await;
    assert_eq!(reply, ServerMessage::error(5, ErrorType::UnknownNode));

    broker.shutdown();
}

// ============================================================================
// Variables (S2, S4)
// ============================================================================

#[tokio::test]
async fn test_set_variables_requires_lock() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;

    let mut variables = VariableMap::new();
    variables.insert("x".into(), Variable::new(Value::Int(1)));

    // Without the lock: unknown_node.
    client
        .send(&ClientMessage::SetNodeVariables {
            request_id: 1,
            node_id: node,
            variables: variables.clone(),
        })
        .await;
    let reply = client.recv_until(|m| is_response_for(m, 1)).await;
    assert_eq!(reply, ServerMessage::error(1, ErrorType::UnknownNode));

    // Lock, watch, then the same write succeeds. The ack and the
    // variable-change notification may arrive in either order.
    client.lock(2, node).await;
    client
        .send(&ClientMessage::WatchNode {
            request_id: 3,
            node_id: node,
            flags: WatchFlags::from_bits(WatchFlags::VARIABLES),
        })
        .await;
    client.recv_until(|m| is_response_for(m, 3)).await;

    client
        .send(&ClientMessage::SetNodeVariables {
            request_id: 4,
            node_id: node,
            variables,
        })
        .await;

    let mut saw_ack = false;
    let mut saw_change = false;
    for _ in 0..64 {
        match client.recv().await {
            ServerMessage::RequestCompleted { request_id: 4 } => saw_ack = true,
            ServerMessage::NodeVariablesChanged { variables, .. } => {
                if variables.get("x").map(|v| &v.value) == Some(&Value::Int(1)) {
                    saw_change = true;
                }
            }
            ServerMessage::Error { request_id: 4, .. } => panic!("write failed"),
            _ => {}
        }
        if saw_ack && saw_change {
            break;
        }
    }
    assert!(saw_ack, "missing write acknowledgement");
    assert!(saw_change, "missing NodeVariablesChanged");

    broker.shutdown();
}

#[tokio::test]
async fn test_unsupported_variable_type() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    let mut variables = VariableMap::new();
    variables.insert("s".into(), Variable::new(Value::Str("words".into())));
    client
        .send(&ClientMessage::SetNodeVariables {
            request_id: 2,
            node_id: node,
            variables,
        })
        .await;
    let reply = client.recv_until(|m| is_response_for(m, 2)).await;
    assert_eq!(
        reply,
        ServerMessage::error(2, ErrorType::UnsupportedVariableType)
    );

    broker.shutdown();
}

#[tokio::test]
async fn test_watch_sends_snapshot_before_ack() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    // Establish x = 7 before watching.
    let mut variables = VariableMap::new();
    variables.insert("x".into(), Variable::new(Value::Int(7)));
    client
        .send(&ClientMessage::SetNodeVariables {
            request_id: 2,
            node_id: node,
            variables,
        })
        .await;
    client.recv_until(|m| is_response_for(m, 2)).await;

    // Watch: the snapshot must precede the acknowledgement.
    client
        .send(&ClientMessage::WatchNode {
            request_id: 3,
            node_id: node,
            flags: WatchFlags::from_bits(WatchFlags::VARIABLES),
        })
        .await;

    let mut snapshot_seen = false;
    loop {
        match client.recv().await {
            ServerMessage::NodeVariablesChanged { variables, .. } => {
                if variables.get("x").map(|v| &v.value) == Some(&Value::Int(7)) {
                    snapshot_seen = true;
                }
            }
            ServerMessage::RequestCompleted { request_id: 3 } => break,
            _ => {}
        }
    }
    assert!(snapshot_seen, "snapshot did not precede the watch ack");

    // Watching again with the same flag renews without a new snapshot:
    // the ack is the next watch-related message.
    client
        .send(&ClientMessage::WatchNode {
            request_id: 4,
            node_id: node,
            flags: WatchFlags::from_bits(WatchFlags::VARIABLES),
        })
        .await;
    loop {
        match client.recv().await {
            ServerMessage::NodeVariablesChanged { .. } => {
                panic!("renewal must not resend the snapshot")
            }
            ServerMessage::RequestCompleted { request_id: 4 } => break,
            _ => {}
        }
    }

    broker.shutdown();
}

// ============================================================================
// Compilation (S3)
// ============================================================================

#[tokio::test]
async fn test_compile_failure_reports_position() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    client
        .send(&ClientMessage::CompileAndLoadCodeOnVm {
            request_id: 2,
            node_id: node,
            language: VmLanguage::Aseba,
            program: "syntax!".into(),
            options: tdm_core::CompilationOptions::from_bits(
                tdm_core::CompilationOptions::LOAD_ON_TARGET,
            ),
        })
        .await;

    let reply = client.recv_until(|m| is_response_for(m, 2)).await;
    match reply {
        ServerMessage::CompilationResultFailure {
            message,
            line,
            column,
            ..
        } => {
            assert!(!message.is_empty());
            assert_eq!(line, 1);
            assert_eq!(column, 1);
        }
        other => panic!("expected CompilationResultFailure, got {other:?}"),
    }

    broker.shutdown();
}

#[tokio::test]
async fn test_compile_success() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    client
        .send(&ClientMessage::CompileAndLoadCodeOnVm {
            request_id: 2,
            node_id: node,
            language: VmLanguage::Aseba,
            program: "var x = 1".into(),
            options: tdm_core::CompilationOptions::empty(),
        })
        .await;

    let reply = client.recv_until(|m| is_response_for(m, 2)).await;
    assert!(matches!(
        reply,
        ServerMessage::CompilationResultSuccess { .. }
    ));

    broker.shutdown();
}

// ============================================================================
// Rename (S6)
// ============================================================================

#[tokio::test]
async fn test_rename_capable_node() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("before", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    client
        .send(&ClientMessage::RenameNode {
            request_id: 2,
            node_id: node,
            new_name: "after".into(),
        })
        .await;

    let reply = client.recv_until(|m| is_response_for(m, 2)).await;
    assert!(matches!(reply, ServerMessage::RequestCompleted { .. }));

    client
        .recv_until(|m| {
            matches!(m, ServerMessage::NodesChanged { nodes } if nodes[0].name == "after")
        })
        .await;

    broker.shutdown();
}

#[tokio::test]
async fn test_rename_without_capability_rejected() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("fixed", false).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    client
        .send(&ClientMessage::RenameNode {
            request_id: 2,
            node_id: node,
            new_name: "other".into(),
        })
        .await;
    let reply = client.recv_until(|m| is_response_for(m, 2)).await;
    assert_eq!(reply, ServerMessage::error(2, ErrorType::UnknownNode));

    broker.shutdown();
}

// ============================================================================
// Breakpoints and Execution State
// ============================================================================

#[tokio::test]
async fn test_set_breakpoints_returns_device_list() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    client
        .send(&ClientMessage::SetBreakpoints {
            request_id: 2,
            node_id: node,
            breakpoints: vec![3, 0, 9, 3],
        })
        .await;

    let reply = client.recv_until(|m| is_response_for(m, 2)).await;
    match reply {
        ServerMessage::SetBreakpointsResponse {
            error,
            breakpoints,
            ..
        } => {
            assert_eq!(error, ErrorType::NoError);
            // The device drops line 0 and stores the rest ordered.
            assert_eq!(breakpoints, vec![3, 9]);
        }
        other => panic!("expected SetBreakpointsResponse, got {other:?}"),
    }

    broker.shutdown();
}

#[tokio::test]
async fn test_execution_state_watch_stream() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    client
        .send(&ClientMessage::WatchNode {
            request_id: 2,
            node_id: node,
            flags: WatchFlags::from_bits(WatchFlags::VM_EXECUTION_STATE),
        })
        .await;
    // Snapshot (stopped VM) then ack.
    client
        .recv_until(|m| matches!(m, ServerMessage::VmExecutionStateChanged { .. }))
        .await;
    client.recv_until(|m| is_response_for(m, 2)).await;

    client
        .send(&ClientMessage::SetVmExecutionState {
            request_id: 3,
            node_id: node,
            command: tdm_core::VmExecutionStateCommand::Run,
        })
        .await;

    let changed = client
        .recv_until(|m| matches!(m, ServerMessage::VmExecutionStateChanged { .. }))
        .await;
    match changed {
        ServerMessage::VmExecutionStateChanged { state, .. } => {
            assert_eq!(state.state, tdm_core::VmState::Running);
        }
        other => panic!("expected VmExecutionStateChanged, got {other:?}"),
    }

    broker.shutdown();
}

// ============================================================================
// Disconnection
// ============================================================================

#[tokio::test]
async fn test_node_disconnect_reaches_lock_holder() {
    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let mut client = broker.connect().await;
    client.handshake().await;
    client.lock(1, node).await;

    broker.backend.disconnect_node(node).await;

    client
        .recv_until(|m| {
            matches!(m, ServerMessage::NodesChanged { nodes }
                if nodes[0].status == NodeStatus::Disconnected)
        })
        .await;

    // The id is gone; further operations report unknown_node.
    client
        .send(&ClientMessage::LockNode {
            request_id: 2,
            node_id: node,
        })
        .await;
    let reply = client.recv_until(|m| is_response_for(m, 2)).await;
    assert_eq!(reply, ServerMessage::error(2, ErrorType::UnknownNode));

    broker.shutdown();
}

// ============================================================================
// WebSocket Listener
// ============================================================================

#[tokio::test]
async fn test_websocket_client_speaks_same_protocol() {
    use tokio_tungstenite::tungstenite::Message;

    let broker = TestBroker::spawn().await;
    let node = broker.spawn_node("thymio-1", true).await;

    let url = format!("ws://{}", broker.ws_addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket connect");

    let payload = codec::encode_payload(&ClientMessage::handshake(None)).expect("encode");
    ws.send(Message::Binary(payload)).await.expect("send");

    async fn recv_ws(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
    ) -> ServerMessage {
        loop {
            match timeout(RECV_TIMEOUT, ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("ws error")
            {
                Message::Binary(data) => {
                    return codec::decode_payload::<ServerMessage>(&data).expect("decode")
                }
                _ => continue,
            }
        }
    }

    match recv_ws(&mut ws).await {
        ServerMessage::ConnectionHandshake {
            protocol_version, ..
        } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("expected handshake reply, got {other:?}"),
    }
    match recv_ws(&mut ws).await {
        ServerMessage::NodesChanged { nodes } => assert_eq!(nodes[0].id, node),
        other => panic!("expected NodesChanged, got {other:?}"),
    }

    broker.shutdown();
}

// ============================================================================
// Slow Client Backpressure
// ============================================================================

/// A client that stops draining its connection must be disconnected
/// once the outbound queue overflows, not buffered without bound.
#[tokio::test]
async fn test_slow_client_is_disconnected_on_queue_overflow() {
    use tokio::io::AsyncWriteExt;

    let (backend_tx, backend_rx) = tokio::sync::mpsc::channel(256);
    let backend = SimulatedBackend::new(backend_tx);
    let registry = spawn_registry(
        Arc::new(backend.clone()),
        Arc::new(SimulatedCompiler),
        backend_rx,
    );
    let tokens = Arc::new(TokenManager::new());

    // A tiny in-memory pipe stands in for a congested socket: the
    // writer task stalls after a handful of frames, so backpressure
    // lands on the outbound queue almost immediately.
    let (mut client_io, server_io) = tokio::io::duplex(512);
    let (read_half, write_half) = tokio::io::split(server_io);
    spawn_endpoint(
        7,
        true,
        FramedSource::new(read_half, MAX_MESSAGE_SIZE),
        FramedSink::new(write_half),
        registry,
        tokens,
    );

    // Handshake normally, then stop reading.
    let frame = codec::encode_message(&ClientMessage::handshake(None)).expect("encode");
    client_io.write_all(&frame).await.expect("write handshake");
    let payload = timeout(
        RECV_TIMEOUT,
        codec::read_frame(&mut client_io, MAX_MESSAGE_SIZE),
    )
    .await
    .expect("timed out")
    .expect("read handshake reply");
    assert!(matches!(
        codec::decode_payload::<ServerMessage>(&payload).expect("decode"),
        ServerMessage::ConnectionHandshake { .. }
    ));
    let payload = timeout(
        RECV_TIMEOUT,
        codec::read_frame(&mut client_io, MAX_MESSAGE_SIZE),
    )
    .await
    .expect("timed out")
    .expect("read node list");
    assert!(matches!(
        codec::decode_payload::<ServerMessage>(&payload).expect("decode"),
        ServerMessage::NodesChanged { .. }
    ));

    // Every new node is a NodesChanged for the stalled endpoint. Twice
    // the queue depth is far more than the queue plus the pipe can
    // absorb, so the endpoint must hit the overflow and give up.
    let flood = 2 * OUTBOUND_QUEUE_DEPTH;
    for i in 0..flood {
        backend.spawn_node(format!("flood-{i}"), false).await;
    }

    // Resume reading: whatever was queued before the overflow drains,
    // then the stream must end.
    let mut drained = 0usize;
    loop {
        let result = timeout(
            RECV_TIMEOUT,
            codec::read_frame(&mut client_io, MAX_MESSAGE_SIZE),
        )
        .await
        .expect("timed out waiting for the connection to close");
        match result {
            Ok(_) => drained += 1,
            Err(_) => break,
        }
    }
    assert!(
        drained < flood,
        "connection should have closed before all {flood} updates were delivered \
         (drained {drained})"
    );
}

// ============================================================================
// Token Check (non-local endpoint over an in-memory transport)
// ============================================================================

mod remote {
    use super::*;
    use tdmd::registry::RegistryHandle;

    /// Wires a non-local endpoint to an in-memory stream so the token
    /// path can be exercised without a second machine.
    fn spawn_remote_endpoint(
        registry: RegistryHandle,
        tokens: Arc<TokenManager>,
    ) -> tokio::io::DuplexStream {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(server_io);
        spawn_endpoint(
            999,
            false,
            FramedSource::new(read_half, MAX_MESSAGE_SIZE),
            FramedSink::new(write_half),
            registry,
            tokens,
        );
        client_io
    }

    async fn handshake_with_token(
        io: &mut tokio::io::DuplexStream,
        token: Option<Vec<u8>>,
    ) -> ServerMessage {
        use tokio::io::AsyncWriteExt;
        let msg = ClientMessage::ConnectionHandshake {
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            max_message_size: MAX_MESSAGE_SIZE,
            token,
        };
        let frame = codec::encode_message(&msg).expect("encode");
        io.write_all(&frame).await.expect("write");

        let payload = timeout(RECV_TIMEOUT, codec::read_frame(io, MAX_MESSAGE_SIZE))
            .await
            .expect("timed out")
            .expect("read");
        codec::decode_payload(&payload).expect("decode")
    }

    fn test_registry() -> (RegistryHandle, SimulatedBackend) {
        let (backend_tx, backend_rx) = tokio::sync::mpsc::channel(64);
        let backend = SimulatedBackend::new(backend_tx);
        let registry = spawn_registry(
            Arc::new(backend.clone()),
            Arc::new(SimulatedCompiler),
            backend_rx,
        );
        (registry, backend)
    }

    #[tokio::test]
    async fn test_remote_without_token_rejected() {
        let (registry, _backend) = test_registry();
        let tokens = Arc::new(TokenManager::new());
        tokens.insert(b"s3cret".to_vec());

        let mut io = spawn_remote_endpoint(registry, tokens);
        match handshake_with_token(&mut io, None).await {
            ServerMessage::ConnectionHandshake {
                protocol_version, ..
            } => assert_eq!(protocol_version, 0),
            other => panic!("expected version-0 handshake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_with_wrong_token_rejected() {
        let (registry, _backend) = test_registry();
        let tokens = Arc::new(TokenManager::new());
        tokens.insert(b"s3cret".to_vec());

        let mut io = spawn_remote_endpoint(registry, tokens);
        match handshake_with_token(&mut io, Some(b"guess".to_vec())).await {
            ServerMessage::ConnectionHandshake {
                protocol_version, ..
            } => assert_eq!(protocol_version, 0),
            other => panic!("expected version-0 handshake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_with_valid_token_accepted() {
        let (registry, _backend) = test_registry();
        let tokens = Arc::new(TokenManager::new());
        tokens.insert(b"s3cret".to_vec());

        let mut io = spawn_remote_endpoint(registry, tokens);
        match handshake_with_token(&mut io, Some(b"s3cret".to_vec())).await {
            ServerMessage::ConnectionHandshake {
                protocol_version, ..
            } => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("expected handshake reply, got {other:?}"),
        }

        // Remote clients see no capabilities.
        let payload = timeout(RECV_TIMEOUT, codec::read_frame(&mut io, MAX_MESSAGE_SIZE))
            .await
            .expect("timed out")
            .expect("read");
        match codec::decode_payload(&payload).expect("decode") {
            ServerMessage::NodesChanged { nodes } => {
                for node in nodes {
                    assert_eq!(node.capabilities, Capabilities::empty());
                }
            }
            other => panic!("expected NodesChanged, got {other:?}"),
        }
    }
}
