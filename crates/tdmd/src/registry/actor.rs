//! Registry actor - owns all node state and processes commands.
//!
//! The actor is the single owner of the node map. It consumes two
//! channels: backend events (device side) and endpoint commands (client
//! side), draining backend events first so command handlers always see
//! the freshest device state. State is mutated before any event is
//! published, so an observer that queries back into the registry during
//! a notification sees the post-mutation state.
//!
//! Device writes never block the actor loop: the actor validates the
//! command, then hands the prepared write and the requester's response
//! channel to a spawned task that awaits the backend. A requester that
//! disconnects meanwhile just drops its receiver and the completion
//! evaporates.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tdm_core::{validate_events_table, NodeId, NodeStatus, NodeView};

use crate::backend::{BackendEvent, NodeBackend};
use crate::compiler::ProgramCompiler;

use super::commands::{CompileOutcome, EndpointId, NodeEvent, RegistryCommand, RegistryError};
use super::node::Node;

/// The registry actor.
pub struct NodeRegistryActor {
    /// Command receiver (client endpoints).
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Backend event receiver (device side).
    backend_events: mpsc::Receiver<BackendEvent>,

    /// Whether the backend event channel is still open.
    backend_open: bool,

    /// All known nodes.
    nodes: HashMap<NodeId, Node>,

    /// Change fanout to all endpoints.
    event_publisher: broadcast::Sender<NodeEvent>,

    /// Device operations.
    backend: Arc<dyn NodeBackend>,

    /// Program compilation.
    compiler: Arc<dyn ProgramCompiler>,
}

impl NodeRegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        backend_events: mpsc::Receiver<BackendEvent>,
        event_publisher: broadcast::Sender<NodeEvent>,
        backend: Arc<dyn NodeBackend>,
        compiler: Arc<dyn ProgramCompiler>,
    ) -> Self {
        Self {
            receiver,
            backend_events,
            backend_open: true,
            nodes: HashMap::new(),
            event_publisher,
            backend,
            compiler,
        }
    }

    /// Runs the actor event loop until every command sender is gone.
    pub async fn run(mut self) {
        info!("node registry starting");

        loop {
            tokio::select! {
                biased;

                event = self.backend_events.recv(), if self.backend_open => {
                    match event {
                        Some(event) => self.handle_backend_event(event),
                        None => {
                            debug!("backend event channel closed");
                            self.backend_open = false;
                        }
                    }
                }

                cmd = self.receiver.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
            }
        }

        info!(nodes = self.nodes.len(), "node registry stopped");
    }

    fn publish(&self, event: NodeEvent) {
        // No subscribers is fine (e.g. before the first client connects).
        let _ = self.event_publisher.send(event);
    }

    fn publish_node_changed(&self, node: &Node) {
        self.publish(NodeEvent::NodeChanged { node: node.view() });
    }

    // ========================================================================
    // Backend Events
    // ========================================================================

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::NodeConnected {
                id,
                descriptor,
                status,
            } => {
                if self.nodes.contains_key(&id) {
                    warn!(node = %id, "backend announced an already-known node, replacing");
                }
                let node = Node::new(id, descriptor, status);
                info!(node = %id, name = %node.name, status = %status, "node connected");
                self.nodes.insert(id, node);
                if let Some(node) = self.nodes.get(&id) {
                    self.publish_node_changed(node);
                }
            }

            BackendEvent::NodeStatusChanged { id, status } => {
                if status == NodeStatus::Disconnected {
                    self.remove_node(id);
                    return;
                }
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.device_status = status;
                    debug!(node = %id, status = %status, "node status changed");
                    let view = node.view();
                    self.publish(NodeEvent::NodeChanged { node: view });
                }
            }

            BackendEvent::NodeRenamed { id, name } => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.name = name;
                    let view = node.view();
                    self.publish(NodeEvent::NodeChanged { node: view });
                }
            }

            BackendEvent::NodeDisconnected { id } => self.remove_node(id),

            BackendEvent::VariablesChanged { id, variables } => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    for (name, variable) in &variables {
                        node.variables.insert(name.clone(), variable.clone());
                    }
                    self.publish(NodeEvent::VariablesChanged { id, variables });
                }
            }

            BackendEvent::EventsEmitted { id, events } => {
                if self.nodes.contains_key(&id) {
                    self.publish(NodeEvent::EventsEmitted { id, events });
                }
            }

            BackendEvent::EventsDescriptionChanged { id, events } => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.events_table = events.clone();
                    self.publish(NodeEvent::EventsDescriptionChanged { id, events });
                }
            }

            BackendEvent::ExecutionStateChanged { id, state } => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.execution_state = state;
                    self.publish(NodeEvent::ExecutionStateChanged { id, state });
                }
            }
        }
    }

    /// Removes a node. `Disconnected` is terminal: the map entry goes
    /// away and every endpoint (the lock holder included) receives the
    /// final status change.
    fn remove_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            info!(node = %id, name = %node.name, "node disconnected");
            let mut view = node.view();
            view.status = NodeStatus::Disconnected;
            self.publish(NodeEvent::NodeChanged { node: view });
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub(crate) fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::ListNodes { respond_to } => {
                let views: Vec<NodeView> = self.nodes.values().map(Node::view).collect();
                let _ = respond_to.send(views);
            }

            RegistryCommand::NodeSnapshot {
                node_id,
                respond_to,
            } => {
                let snapshot = self.nodes.get(&node_id).map(Node::snapshot);
                let _ = respond_to.send(snapshot);
            }

            RegistryCommand::VmDescription {
                node_id,
                respond_to,
            } => {
                let description = self.nodes.get(&node_id).map(Node::vm_description);
                let _ = respond_to.send(description);
            }

            RegistryCommand::Lock {
                node_id,
                endpoint,
                respond_to,
            } => {
                let result = match self.nodes.get_mut(&node_id) {
                    None => Err(RegistryError::UnknownNode(node_id)),
                    Some(node) => match node.lock(endpoint) {
                        Ok(true) => {
                            debug!(node = %node_id, endpoint, "node locked");
                            let view = node.view();
                            self.publish(NodeEvent::NodeChanged { node: view });
                            Ok(())
                        }
                        Ok(false) => Ok(()),
                        Err(e) => Err(e),
                    },
                };
                let _ = respond_to.send(result);
            }

            RegistryCommand::Unlock {
                node_id,
                endpoint,
                respond_to,
            } => {
                let result = match self.nodes.get_mut(&node_id) {
                    None => Err(RegistryError::UnknownNode(node_id)),
                    Some(node) => match node.unlock(endpoint) {
                        Ok(()) => {
                            debug!(node = %node_id, endpoint, "node unlocked");
                            let view = node.view();
                            self.publish(NodeEvent::NodeChanged { node: view });
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                };
                let _ = respond_to.send(result);
            }

            RegistryCommand::Rename {
                node_id,
                endpoint,
                local,
                new_name,
                respond_to,
            } => {
                match self.locked_node(node_id, endpoint) {
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                    Ok(node) if !(local && node.renamable) => {
                        warn!(node = %node_id, endpoint, "rename refused: capability missing");
                        let _ = respond_to.send(Err(RegistryError::NotPermitted(node_id)));
                    }
                    Ok(_) => {
                        let backend = Arc::clone(&self.backend);
                        tokio::spawn(async move {
                            let result = backend
                                .rename(node_id, new_name)
                                .await
                                .map_err(RegistryError::from_device);
                            let _ = respond_to.send(result);
                        });
                    }
                }
            }

            RegistryCommand::SetVariables {
                node_id,
                endpoint,
                variables,
                respond_to,
            } => {
                let prepared = self
                    .locked_node(node_id, endpoint)
                    .and_then(|_| Node::coerce_variables(&variables).map_err(Into::into));
                match prepared {
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                    Ok(writes) => {
                        let backend = Arc::clone(&self.backend);
                        tokio::spawn(async move {
                            let result = backend
                                .set_variables(node_id, writes)
                                .await
                                .map_err(RegistryError::from_device);
                            let _ = respond_to.send(result);
                        });
                    }
                }
            }

            RegistryCommand::RegisterEvents {
                node_id,
                endpoint,
                events,
                respond_to,
            } => {
                let checked = self
                    .locked_node(node_id, endpoint)
                    .and_then(|_| validate_events_table(&events).map_err(Into::into));
                match checked {
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                    Ok(()) => {
                        let backend = Arc::clone(&self.backend);
                        tokio::spawn(async move {
                            let result = backend
                                .set_events_table(node_id, events)
                                .await
                                .map_err(RegistryError::from_device);
                            let _ = respond_to.send(result);
                        });
                    }
                }
            }

            RegistryCommand::EmitEvents {
                node_id,
                endpoint,
                events,
                respond_to,
            } => {
                let prepared = self
                    .locked_node(node_id, endpoint)
                    .and_then(|node| node.coerce_events(&events).map_err(Into::into));
                match prepared {
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                    Ok(writes) => {
                        let backend = Arc::clone(&self.backend);
                        tokio::spawn(async move {
                            let result = backend
                                .emit_events(node_id, writes)
                                .await
                                .map_err(RegistryError::from_device);
                            let _ = respond_to.send(result);
                        });
                    }
                }
            }

            RegistryCommand::CompileAndLoad {
                node_id,
                endpoint,
                language,
                program,
                options,
                respond_to,
            } => {
                if let Err(e) = self.locked_node(node_id, endpoint) {
                    let _ = respond_to.send(Err(e));
                    return;
                }
                let backend = Arc::clone(&self.backend);
                let compiler = Arc::clone(&self.compiler);
                tokio::spawn(async move {
                    let result = match compiler.compile(language, &program).await {
                        Err(diagnostic) => Ok(CompileOutcome::Failure(diagnostic)),
                        Ok(compiled) => {
                            if options.load_on_target() {
                                match backend.load_bytecode(node_id, compiled.bytecode).await {
                                    Ok(()) => Ok(CompileOutcome::Success),
                                    Err(e) => Err(RegistryError::from_device(e)),
                                }
                            } else {
                                Ok(CompileOutcome::Success)
                            }
                        }
                    };
                    let _ = respond_to.send(result);
                });
            }

            RegistryCommand::SetExecutionState {
                node_id,
                endpoint,
                local,
                command,
                respond_to,
            } => {
                let permitted = match self.locked_node(node_id, endpoint) {
                    Ok(_) => Ok(()),
                    // Force-stop path: Stop without a lock is refused only
                    // when the endpoint holds the rename capability on the
                    // node (local, renamable). Anything else, remote
                    // endpoints included, may stop the node.
                    Err(RegistryError::NotLocked(_))
                        if command == tdm_core::VmExecutionStateCommand::Stop
                            && self
                                .nodes
                                .get(&node_id)
                                .is_some_and(|n| !(local && n.renamable)) =>
                    {
                        debug!(node = %node_id, endpoint, "force-stop without lock");
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                match permitted {
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                    Ok(()) => {
                        let backend = Arc::clone(&self.backend);
                        tokio::spawn(async move {
                            let result = backend
                                .set_execution_state(node_id, command)
                                .await
                                .map_err(RegistryError::from_device);
                            let _ = respond_to.send(result);
                        });
                    }
                }
            }

            RegistryCommand::SetBreakpoints {
                node_id,
                endpoint,
                breakpoints,
                respond_to,
            } => {
                if let Err(e) = self.locked_node(node_id, endpoint) {
                    let _ = respond_to.send(Err(e));
                    return;
                }
                let backend = Arc::clone(&self.backend);
                tokio::spawn(async move {
                    let result = backend
                        .set_breakpoints(node_id, breakpoints)
                        .await
                        .map_err(RegistryError::from_device);
                    let _ = respond_to.send(result);
                });
            }

            RegistryCommand::ReleaseEndpoint { endpoint } => {
                let released: Vec<NodeId> = self
                    .nodes
                    .iter_mut()
                    .filter_map(|(id, node)| node.release_if_held_by(endpoint).then_some(*id))
                    .collect();
                for id in released {
                    debug!(node = %id, endpoint, "lock released on endpoint teardown");
                    if let Some(node) = self.nodes.get(&id) {
                        self.publish_node_changed(node);
                    }
                }
            }
        }
    }

    /// Looks up a node and checks the caller holds its lock.
    ///
    /// The two failure cases share a wire code but are logged apart: an
    /// absent node is routine (it may have just disconnected), a lock
    /// violation is a misbehaving client.
    fn locked_node(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
    ) -> Result<&Node, RegistryError> {
        match self.nodes.get(&node_id) {
            None => {
                debug!(node = %node_id, endpoint, "operation on unknown node");
                Err(RegistryError::UnknownNode(node_id))
            }
            Some(node) if !node.is_locked_by(endpoint) => {
                warn!(node = %node_id, endpoint, "operation requires the node lock");
                Err(RegistryError::NotLocked(node_id))
            }
            Some(node) => Ok(node),
        }
    }

    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
