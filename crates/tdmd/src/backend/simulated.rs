//! In-process simulated node backend.
//!
//! Provides deterministic `DummyNode`s living entirely in memory, used by
//! the integration tests and by `tdmd --simulate`. Every device write is
//! acknowledged immediately and echoed back through the backend event
//! channel, the same way a real device link reports its state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use tdm_core::{
    EventDescription, EventMap, NodeId, NodeStatus, NodeType, Value, Variable, VariableMap,
    VmDescription, VmExecutionState, VmExecutionStateCommand, VmState,
};

use super::{BackendError, BackendEvent, NodeBackend, NodeDescriptor};

/// A simulated node's device-side state.
struct SimNode {
    name: String,
    renamable: bool,
    variables: VariableMap,
    events_table: Vec<EventDescription>,
    execution_state: VmExecutionState,
}

/// Simulated node backend.
///
/// Cheap to clone; all clones share the same simulated device set.
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<Inner>,
}

struct Inner {
    events: mpsc::Sender<BackendEvent>,
    nodes: Mutex<HashMap<NodeId, SimNode>>,
}

impl SimulatedBackend {
    /// Creates a backend delivering its events on `events`.
    pub fn new(events: mpsc::Sender<BackendEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                events,
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawns a simulated node and announces it to the registry.
    ///
    /// The node starts `Available` with an empty variable set and a
    /// stopped VM.
    pub async fn spawn_node(&self, name: impl Into<String>, renamable: bool) -> NodeId {
        let id = NodeId::generate();
        let name = name.into();
        let node = SimNode {
            name: name.clone(),
            renamable,
            variables: VariableMap::new(),
            events_table: Vec::new(),
            execution_state: VmExecutionState::default(),
        };

        self.inner.nodes.lock().await.insert(id, node);

        debug!(node = %id, name = %name, "simulated node spawned");

        self.emit(BackendEvent::NodeConnected {
            id,
            descriptor: NodeDescriptor {
                name,
                node_type: NodeType::DummyNode,
                renamable,
                vm_description: VmDescription {
                    bytecode_size: 1534,
                    data_size: 620,
                    stack_size: 32,
                    variables: Vec::new(),
                },
            },
            status: NodeStatus::Available,
        })
        .await;
        self.emit(BackendEvent::ExecutionStateChanged {
            id,
            state: VmExecutionState::default(),
        })
        .await;

        id
    }

    /// Disconnects a simulated node, as if the device were unplugged.
    pub async fn disconnect_node(&self, id: NodeId) {
        if self.inner.nodes.lock().await.remove(&id).is_some() {
            self.emit(BackendEvent::NodeDisconnected { id }).await;
        }
    }

    async fn emit(&self, event: BackendEvent) {
        // The registry owns the receiving end; if it is gone the daemon
        // is shutting down and the event can be dropped.
        let _ = self.inner.events.send(event).await;
    }

    fn value_from_words(words: &[i16]) -> Value {
        match words {
            [single] => Value::Int(i64::from(*single)),
            many => Value::List(many.iter().map(|w| Value::Int(i64::from(*w))).collect()),
        }
    }
}

#[async_trait]
impl NodeBackend for SimulatedBackend {
    async fn set_variables(
        &self,
        id: NodeId,
        variables: Vec<(String, Vec<i16>)>,
    ) -> Result<(), BackendError> {
        let mut changed = VariableMap::new();
        {
            let mut nodes = self.inner.nodes.lock().await;
            let node = nodes.get_mut(&id).ok_or(BackendError::UnknownNode(id))?;
            for (name, words) in &variables {
                let variable = Variable::new(Self::value_from_words(words));
                node.variables.insert(name.clone(), variable.clone());
                changed.insert(name.clone(), variable);
            }
        }
        self.emit(BackendEvent::VariablesChanged {
            id,
            variables: changed,
        })
        .await;
        Ok(())
    }

    async fn emit_events(
        &self,
        id: NodeId,
        events: Vec<(String, Vec<i16>)>,
    ) -> Result<(), BackendError> {
        if !self.inner.nodes.lock().await.contains_key(&id) {
            return Err(BackendError::UnknownNode(id));
        }
        let events: EventMap = events
            .iter()
            .map(|(name, words)| (name.clone(), Self::value_from_words(words)))
            .collect();
        self.emit(BackendEvent::EventsEmitted { id, events }).await;
        Ok(())
    }

    async fn set_events_table(
        &self,
        id: NodeId,
        events: Vec<EventDescription>,
    ) -> Result<(), BackendError> {
        {
            let mut nodes = self.inner.nodes.lock().await;
            let node = nodes.get_mut(&id).ok_or(BackendError::UnknownNode(id))?;
            node.events_table = events.clone();
        }
        self.emit(BackendEvent::EventsDescriptionChanged { id, events })
            .await;
        Ok(())
    }

    async fn load_bytecode(&self, id: NodeId, bytecode: Vec<u16>) -> Result<(), BackendError> {
        let state = {
            let mut nodes = self.inner.nodes.lock().await;
            let node = nodes.get_mut(&id).ok_or(BackendError::UnknownNode(id))?;
            debug!(node = %id, words = bytecode.len(), "bytecode loaded");
            // Loading a program resets the VM.
            node.execution_state = VmExecutionState::default();
            node.execution_state
        };
        self.emit(BackendEvent::ExecutionStateChanged { id, state })
            .await;
        Ok(())
    }

    async fn set_execution_state(
        &self,
        id: NodeId,
        command: VmExecutionStateCommand,
    ) -> Result<(), BackendError> {
        let state = {
            let mut nodes = self.inner.nodes.lock().await;
            let node = nodes.get_mut(&id).ok_or(BackendError::UnknownNode(id))?;
            let current = node.execution_state;
            node.execution_state = match command {
                VmExecutionStateCommand::Run => VmExecutionState {
                    state: VmState::Running,
                    line: current.line,
                },
                VmExecutionStateCommand::Step => VmExecutionState {
                    state: VmState::Paused,
                    line: current.line + 1,
                },
                VmExecutionStateCommand::Pause => VmExecutionState {
                    state: VmState::Paused,
                    line: current.line,
                },
                VmExecutionStateCommand::Stop | VmExecutionStateCommand::Reset => {
                    VmExecutionState::default()
                }
            };
            node.execution_state
        };
        self.emit(BackendEvent::ExecutionStateChanged { id, state })
            .await;
        Ok(())
    }

    async fn set_breakpoints(
        &self,
        id: NodeId,
        breakpoints: Vec<u32>,
    ) -> Result<Vec<u32>, BackendError> {
        if !self.inner.nodes.lock().await.contains_key(&id) {
            return Err(BackendError::UnknownNode(id));
        }
        // The simulated device cannot break on line 0 and stores the set
        // ordered and deduplicated, like a real VM table.
        let mut set: Vec<u32> = breakpoints.into_iter().filter(|&line| line != 0).collect();
        set.sort_unstable();
        set.dedup();
        Ok(set)
    }

    async fn rename(&self, id: NodeId, name: String) -> Result<(), BackendError> {
        {
            let mut nodes = self.inner.nodes.lock().await;
            let node = nodes.get_mut(&id).ok_or(BackendError::UnknownNode(id))?;
            if !node.renamable {
                return Err(BackendError::WriteFailed("node is not renamable".into()));
            }
            node.name = name.clone();
        }
        self.emit(BackendEvent::NodeRenamed { id, name }).await;
        Ok(())
    }
}
