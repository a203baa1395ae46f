//! Per-client endpoint.
//!
//! Each accepted connection gets one `ClientEndpoint` that:
//! - performs the protocol handshake (version negotiation, token check)
//! - decodes and dispatches incoming requests
//! - forwards registry change events through its watch subscriptions
//! - masks `Busy` to `Ready` for nodes it holds the lock on
//! - releases every held lock on teardown
//!
//! Outbound messages go through a bounded FIFO queue drained by a writer
//! task, so exactly one write is outstanding at any time and responses
//! leave in enqueue order. Device-backed requests are relayed by small
//! spawned tasks holding a clone of the queue sender: the endpoint keeps
//! reading while the device works, and a completion arriving after
//! teardown is dropped with the queue.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tdm_core::{Capabilities, NodeId, NodeStatus, NodeView};
use tdm_protocol::{
    decode_payload, encode_payload, negotiate, ClientMessage, ErrorType, Node, ServerMessage,
    WatchFlags, MAX_MESSAGE_SIZE,
};

use crate::registry::{
    CompileOutcome, EndpointId, NodeEvent, RegistryError, RegistryHandle,
};
use crate::token::TokenManager;

use super::transport::{MessageSink, MessageSource};
use super::ConnectionError;

/// Depth of the outbound queue. A client that lets this fill up is
/// considered dead-slow and is disconnected rather than buffered
/// without bound.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Per-client endpoint session.
pub struct ClientEndpoint<S> {
    /// Endpoint identity; lock holder key in the registry.
    id: EndpointId,

    /// Whether the peer is on the local machine (loopback). Gates the
    /// token check and node capabilities.
    local: bool,

    source: S,

    /// Outbound FIFO, drained by the writer task.
    outbound: mpsc::Sender<ServerMessage>,

    registry: RegistryHandle,

    tokens: Arc<TokenManager>,

    /// Registry change events; subscribed before the handshake snapshot
    /// so no change can fall between snapshot and stream.
    events: broadcast::Receiver<NodeEvent>,

    /// Largest payload the peer accepts, from its handshake.
    peer_max_message_size: u32,

    /// Nodes this endpoint holds the write lock on.
    locked_nodes: HashSet<NodeId>,

    /// Active watch subscriptions, one set per stream.
    watch_variables: HashSet<NodeId>,
    watch_events: HashSet<NodeId>,
    watch_execution: HashSet<NodeId>,
}

/// Spawns the endpoint task and its writer task for a new connection.
pub fn spawn_endpoint<S, K>(
    id: EndpointId,
    local: bool,
    source: S,
    sink: K,
    registry: RegistryHandle,
    tokens: Arc<TokenManager>,
) -> JoinHandle<()>
where
    S: MessageSource + 'static,
    K: MessageSink + 'static,
{
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    tokio::spawn(run_writer(sink, outbound_rx));

    let events = registry.subscribe();
    let endpoint = ClientEndpoint {
        id,
        local,
        source,
        outbound,
        registry,
        tokens,
        events,
        peer_max_message_size: MAX_MESSAGE_SIZE,
        locked_nodes: HashSet::new(),
        watch_variables: HashSet::new(),
        watch_events: HashSet::new(),
        watch_execution: HashSet::new(),
    };
    tokio::spawn(endpoint.run())
}

/// Drains the outbound queue into the sink, one message at a time.
async fn run_writer<K: MessageSink>(mut sink: K, mut rx: mpsc::Receiver<ServerMessage>) {
    while let Some(msg) = rx.recv().await {
        let payload = match encode_payload(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "dropping unencodable outbound message");
                continue;
            }
        };
        if let Err(e) = sink.send(payload).await {
            debug!(error = %e, "outbound write failed");
            break;
        }
    }
    // Dropping the receiver makes every pending enqueue fail, which
    // tears the endpoint down.
}

/// What woke the endpoint loop up.
enum Input {
    Message(Vec<u8>),
    PeerClosed,
    Event(NodeEvent),
    EventLagged(u64),
    RegistryGone,
}

impl<S: MessageSource> ClientEndpoint<S> {
    async fn run(mut self) {
        debug!(endpoint = self.id, local = self.local, "client connected");

        match self.handle_handshake().await {
            Ok(true) => {
                if let Err(e) = self.process_messages().await {
                    match e {
                        ConnectionError::Closed => {
                            debug!(endpoint = self.id, "connection closed")
                        }
                        e => warn!(endpoint = self.id, error = %e, "connection terminated"),
                    }
                }
            }
            Ok(false) => {
                // Incompatible version; the version-0 handshake reply is
                // already queued and flushes as the writer drains.
            }
            Err(e) => {
                warn!(endpoint = self.id, error = %e, "handshake failed");
            }
        }

        self.teardown().await;
    }

    /// Handles the initial handshake exchange.
    ///
    /// Returns `Ok(false)` when the version ranges are disjoint: the
    /// reply with version 0 is queued and the connection closes without
    /// processing further traffic.
    async fn handle_handshake(&mut self) -> Result<bool, ConnectionError> {
        let payload = match self.source.recv().await? {
            Some(payload) => payload,
            None => return Err(ConnectionError::Closed),
        };
        let msg: ClientMessage = decode_payload(&payload)?;

        let ClientMessage::ConnectionHandshake {
            protocol_version,
            min_protocol_version,
            max_message_size,
            token,
        } = msg
        else {
            return Err(ConnectionError::Protocol(
                "first message was not a handshake".into(),
            ));
        };

        let negotiated = negotiate(protocol_version, min_protocol_version);

        if negotiated != 0 && !self.local {
            let authorized = token.as_deref().is_some_and(|t| self.tokens.check_token(t));
            if !authorized {
                self.enqueue(ServerMessage::handshake(0, MAX_MESSAGE_SIZE))?;
                return Err(ConnectionError::Unauthorized);
            }
        }

        self.peer_max_message_size = max_message_size;
        debug!(
            endpoint = self.id,
            peer_max_message_size = self.peer_max_message_size,
            "peer frame limit recorded"
        );
        self.enqueue(ServerMessage::handshake(negotiated, MAX_MESSAGE_SIZE))?;

        if negotiated == 0 {
            warn!(
                endpoint = self.id,
                client_version = protocol_version,
                client_min_version = min_protocol_version,
                "client protocol version is not compatible"
            );
            return Ok(false);
        }

        info!(
            endpoint = self.id,
            version = negotiated,
            local = self.local,
            "client handshake completed"
        );

        // The full node list doubles as the post-handshake flush.
        self.send_full_node_list().await?;
        Ok(true)
    }

    /// Main loop: inbound requests and registry events, interleaved.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let input = tokio::select! {
                payload = self.source.recv() => match payload? {
                    Some(payload) => Input::Message(payload),
                    None => Input::PeerClosed,
                },
                event = self.events.recv() => match event {
                    Ok(event) => Input::Event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => Input::EventLagged(n),
                    Err(broadcast::error::RecvError::Closed) => Input::RegistryGone,
                },
            };

            match input {
                Input::Message(payload) => {
                    let msg: ClientMessage = decode_payload(&payload)?;
                    self.dispatch(msg).await?;
                }
                Input::PeerClosed => return Ok(()),
                Input::Event(event) => self.forward_event(event)?,
                Input::EventLagged(skipped) => {
                    warn!(endpoint = self.id, skipped, "event stream lagged");
                }
                Input::RegistryGone => return Err(ConnectionError::RegistryClosed),
            }
        }
    }

    /// Dispatches one decoded client request.
    async fn dispatch(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg {
            ClientMessage::ConnectionHandshake { .. } => {
                Err(ConnectionError::Protocol("duplicate handshake".into()))
            }

            ClientMessage::RequestListOfNodes => self.send_full_node_list().await,

            ClientMessage::RequestNodeAsebaVmDescription {
                request_id,
                node_id,
            } => {
                match self.registry.vm_description(node_id).await {
                    Some(description) => self.enqueue(ServerMessage::NodeAsebaVmDescription {
                        request_id,
                        node_id,
                        description,
                    }),
                    None => {
                        debug!(endpoint = self.id, node = %node_id, "vm description for unknown node");
                        self.enqueue(ServerMessage::error(request_id, ErrorType::UnknownNode))
                    }
                }
            }

            ClientMessage::LockNode {
                request_id,
                node_id,
            } => {
                let reply = match self.registry.lock(node_id, self.id).await {
                    Ok(()) => {
                        self.locked_nodes.insert(node_id);
                        ServerMessage::request_completed(request_id)
                    }
                    Err(e) => ServerMessage::error(request_id, e.wire_code()),
                };
                self.enqueue(reply)
            }

            ClientMessage::UnlockNode {
                request_id,
                node_id,
            } => {
                let result = self.registry.unlock(node_id, self.id).await;
                self.locked_nodes.remove(&node_id);
                let reply = match result {
                    Ok(()) => ServerMessage::request_completed(request_id),
                    Err(e) => ServerMessage::error(request_id, e.wire_code()),
                };
                self.enqueue(reply)
            }

            ClientMessage::RenameNode {
                request_id,
                node_id,
                new_name,
            } => {
                let registry = self.registry.clone();
                let (endpoint, local) = (self.id, self.local);
                self.respond_later(async move {
                    match registry.rename(node_id, endpoint, local, new_name).await {
                        Ok(()) => ServerMessage::request_completed(request_id),
                        Err(e) => ServerMessage::error(request_id, e.wire_code()),
                    }
                });
                Ok(())
            }

            ClientMessage::SetNodeVariables {
                request_id,
                node_id,
                variables,
            } => {
                let registry = self.registry.clone();
                let endpoint = self.id;
                self.respond_later(async move {
                    match registry.set_variables(node_id, endpoint, variables).await {
                        Ok(()) => ServerMessage::request_completed(request_id),
                        Err(e) => ServerMessage::error(request_id, e.wire_code()),
                    }
                });
                Ok(())
            }

            ClientMessage::RegisterEvents {
                request_id,
                node_id,
                events,
            } => {
                let registry = self.registry.clone();
                let endpoint = self.id;
                self.respond_later(async move {
                    match registry.register_events(node_id, endpoint, events).await {
                        Ok(()) => ServerMessage::request_completed(request_id),
                        Err(e) => ServerMessage::error(request_id, e.wire_code()),
                    }
                });
                Ok(())
            }

            ClientMessage::SendEvents {
                request_id,
                node_id,
                events,
            } => {
                let registry = self.registry.clone();
                let endpoint = self.id;
                self.respond_later(async move {
                    match registry.emit_events(node_id, endpoint, events).await {
                        Ok(()) => ServerMessage::request_completed(request_id),
                        Err(e) => ServerMessage::error(request_id, e.wire_code()),
                    }
                });
                Ok(())
            }

            ClientMessage::CompileAndLoadCodeOnVm {
                request_id,
                node_id,
                language,
                program,
                options,
            } => {
                let registry = self.registry.clone();
                let endpoint = self.id;
                self.respond_later(async move {
                    match registry
                        .compile_and_load(node_id, endpoint, language, program, options)
                        .await
                    {
                        Ok(CompileOutcome::Success) => {
                            ServerMessage::CompilationResultSuccess { request_id }
                        }
                        Ok(CompileOutcome::Failure(diagnostic)) => {
                            ServerMessage::CompilationResultFailure {
                                request_id,
                                message: diagnostic.message,
                                line: diagnostic.line,
                                column: diagnostic.column,
                                character: diagnostic.character,
                            }
                        }
                        Err(e) => ServerMessage::error(request_id, e.wire_code()),
                    }
                });
                Ok(())
            }

            ClientMessage::SetVmExecutionState {
                request_id,
                node_id,
                command,
            } => {
                let registry = self.registry.clone();
                let (endpoint, local) = (self.id, self.local);
                self.respond_later(async move {
                    match registry
                        .set_execution_state(node_id, endpoint, local, command)
                        .await
                    {
                        Ok(()) => ServerMessage::request_completed(request_id),
                        Err(e) => ServerMessage::error(request_id, e.wire_code()),
                    }
                });
                Ok(())
            }

            ClientMessage::WatchNode {
                request_id,
                node_id,
                flags,
            } => self.watch_node(request_id, node_id, flags).await,

            ClientMessage::SetBreakpoints {
                request_id,
                node_id,
                breakpoints,
            } => {
                let registry = self.registry.clone();
                let endpoint = self.id;
                self.respond_later(async move {
                    match registry.set_breakpoints(node_id, endpoint, breakpoints).await {
                        Ok(lines) => ServerMessage::SetBreakpointsResponse {
                            request_id,
                            error: ErrorType::NoError,
                            breakpoints: lines,
                        },
                        Err(
                            e @ (RegistryError::UnknownNode(_) | RegistryError::NotLocked(_)),
                        ) => ServerMessage::error(request_id, e.wire_code()),
                        Err(_) => ServerMessage::SetBreakpointsResponse {
                            request_id,
                            error: ErrorType::UnknownError,
                            breakpoints: Vec::new(),
                        },
                    }
                });
                Ok(())
            }
        }
    }

    /// Applies a `WatchNode` request.
    ///
    /// A flag newly set queues the stream's current snapshot before the
    /// acknowledgement (wire-ordered); a flag already set just renews
    /// the subscription; a cleared flag cancels it.
    async fn watch_node(
        &mut self,
        request_id: u32,
        node_id: NodeId,
        flags: WatchFlags,
    ) -> Result<(), ConnectionError> {
        let Some(snapshot) = self.registry.node_snapshot(node_id).await else {
            return self.enqueue(ServerMessage::error(request_id, ErrorType::UnknownNode));
        };

        if flags.contains(WatchFlags::VARIABLES) {
            if self.watch_variables.insert(node_id) {
                self.enqueue(ServerMessage::NodeVariablesChanged {
                    node_id,
                    variables: snapshot.variables,
                })?;
            }
        } else {
            self.watch_variables.remove(&node_id);
        }

        if flags.contains(WatchFlags::EVENTS) {
            if self.watch_events.insert(node_id) {
                self.enqueue(ServerMessage::EventsDescriptionChanged {
                    node_id,
                    events: snapshot.events_table,
                })?;
            }
        } else {
            self.watch_events.remove(&node_id);
        }

        if flags.contains(WatchFlags::VM_EXECUTION_STATE) {
            if self.watch_execution.insert(node_id) {
                self.enqueue(ServerMessage::VmExecutionStateChanged {
                    node_id,
                    state: snapshot.execution_state,
                })?;
            }
        } else {
            self.watch_execution.remove(&node_id);
        }

        self.enqueue(ServerMessage::request_completed(request_id))
    }

    /// Forwards one registry event through the endpoint's subscriptions.
    fn forward_event(&mut self, event: NodeEvent) -> Result<(), ConnectionError> {
        match event {
            NodeEvent::NodeChanged { node } => {
                let disconnected = node.status == NodeStatus::Disconnected;
                let wire = self.wire_node(&node);
                self.enqueue(ServerMessage::NodesChanged { nodes: vec![wire] })?;
                if disconnected {
                    // Terminal: drop every reference to the id.
                    self.locked_nodes.remove(&node.id);
                    self.watch_variables.remove(&node.id);
                    self.watch_events.remove(&node.id);
                    self.watch_execution.remove(&node.id);
                }
                Ok(())
            }

            NodeEvent::VariablesChanged { id, variables } => {
                if self.watch_variables.contains(&id) {
                    self.enqueue(ServerMessage::NodeVariablesChanged {
                        node_id: id,
                        variables,
                    })?;
                }
                Ok(())
            }

            NodeEvent::EventsEmitted { id, events } => {
                if self.watch_events.contains(&id) {
                    self.enqueue(ServerMessage::EventsEmitted {
                        node_id: id,
                        events,
                    })?;
                }
                Ok(())
            }

            NodeEvent::EventsDescriptionChanged { id, events } => {
                if self.watch_events.contains(&id) {
                    self.enqueue(ServerMessage::EventsDescriptionChanged {
                        node_id: id,
                        events,
                    })?;
                }
                Ok(())
            }

            NodeEvent::ExecutionStateChanged { id, state } => {
                if self.watch_execution.contains(&id) {
                    self.enqueue(ServerMessage::VmExecutionStateChanged {
                        node_id: id,
                        state,
                    })?;
                }
                Ok(())
            }
        }
    }

    /// Queues the current full node list.
    async fn send_full_node_list(&mut self) -> Result<(), ConnectionError> {
        let nodes = self
            .registry
            .list_nodes()
            .await
            .iter()
            .map(|view| self.wire_node(view))
            .collect();
        self.enqueue(ServerMessage::NodesChanged { nodes })
    }

    /// Translates a registry view into the wire record for this
    /// endpoint: the lock holder sees `Ready` where everyone else sees
    /// `Busy`, and capabilities depend on locality.
    fn wire_node(&self, view: &NodeView) -> Node {
        let mut status = view.status;
        if status == NodeStatus::Busy && self.locked_nodes.contains(&view.id) {
            status = NodeStatus::Ready;
        }
        Node {
            id: view.id,
            status,
            node_type: view.node_type,
            name: view.name.clone(),
            capabilities: self.capabilities_for(view),
        }
    }

    fn capabilities_for(&self, view: &NodeView) -> Capabilities {
        if !self.local {
            return Capabilities::empty();
        }
        let caps = Capabilities::empty().with(Capabilities::FORCE_RESET_AND_STOP);
        if view.renamable {
            caps.with(Capabilities::RENAME)
        } else {
            caps
        }
    }

    /// Queues an outbound message without blocking the loop.
    fn enqueue(&self, msg: ServerMessage) -> Result<(), ConnectionError> {
        match self.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ConnectionError::SlowClient),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Spawns a relay task that queues the response of a device-backed
    /// request once it completes.
    fn respond_later<F>(&self, response: F)
    where
        F: std::future::Future<Output = ServerMessage> + Send + 'static,
    {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let msg = response.await;
            // The endpoint may be gone by now; the completion is dropped.
            let _ = outbound.send(msg).await;
        });
    }

    /// Tears the session down: detach the event subscription first (no
    /// change events must land in a half-dead endpoint), then release
    /// every held lock, then let the writer drain what is queued.
    async fn teardown(self) {
        let ClientEndpoint {
            id,
            events,
            registry,
            outbound,
            ..
        } = self;
        drop(events);
        registry.release_endpoint(id).await;
        drop(outbound);
        info!(endpoint = id, "client disconnected");
    }
}
