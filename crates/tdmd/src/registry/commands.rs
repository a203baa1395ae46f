//! Registry actor commands, errors, and events.
//!
//! - `RegistryCommand`: commands sent to the actor by client endpoints
//! - `RegistryError`: typed failures, each mapping onto a wire error code
//! - `NodeEvent`: change events published to every endpoint
//!
//! Commands carrying a `respond_to` channel complete asynchronously: the
//! actor validates them on the spot but device writes finish only when
//! the backend acknowledges, at which point the oneshot fires. A dropped
//! receiver (endpoint gone) simply discards the completion.

use thiserror::Error;
use tokio::sync::oneshot;

use tdm_core::{
    CompilationError, CompilationOptions, EventDescription, EventMap, NodeId, NodeView, ValueError,
    VariableMap, VmDescription, VmExecutionState, VmExecutionStateCommand, VmLanguage,
};
use tdm_protocol::ErrorType;

use crate::backend::BackendError;

/// Identifies one client endpoint for the lifetime of its connection.
pub type EndpointId = u64;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Snapshot of all known nodes.
    ListNodes {
        respond_to: oneshot::Sender<Vec<NodeView>>,
    },

    /// Snapshot of one node's watchable state, used to seed new watch
    /// subscriptions.
    NodeSnapshot {
        node_id: NodeId,
        respond_to: oneshot::Sender<Option<NodeSnapshot>>,
    },

    /// A node's VM description.
    VmDescription {
        node_id: NodeId,
        respond_to: oneshot::Sender<Option<VmDescription>>,
    },

    /// Take the exclusive write lock. Idempotent for the holder.
    Lock {
        node_id: NodeId,
        endpoint: EndpointId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Release the write lock.
    Unlock {
        node_id: NodeId,
        endpoint: EndpointId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Rename the node on the device. Requires the lock and the rename
    /// capability (local endpoint, renamable node).
    Rename {
        node_id: NodeId,
        endpoint: EndpointId,
        local: bool,
        new_name: String,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Coerce and write variables to the device. Acks on completion.
    SetVariables {
        node_id: NodeId,
        endpoint: EndpointId,
        variables: VariableMap,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Replace the node's event table.
    RegisterEvents {
        node_id: NodeId,
        endpoint: EndpointId,
        events: Vec<EventDescription>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Coerce and emit events on the device. Acks on completion.
    EmitEvents {
        node_id: NodeId,
        endpoint: EndpointId,
        events: EventMap,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Compile a program; load the bytecode if the options ask for it.
    CompileAndLoad {
        node_id: NodeId,
        endpoint: EndpointId,
        language: VmLanguage,
        program: String,
        options: CompilationOptions,
        respond_to: oneshot::Sender<Result<CompileOutcome, RegistryError>>,
    },

    /// Drive the VM. `Stop` is also honored without a lock, except for
    /// local endpoints naming a renamable node (the rename capability
    /// protects those from being stopped underneath their owner).
    SetExecutionState {
        node_id: NodeId,
        endpoint: EndpointId,
        local: bool,
        command: VmExecutionStateCommand,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Replace the breakpoint set; responds with the lines the device
    /// actually set.
    SetBreakpoints {
        node_id: NodeId,
        endpoint: EndpointId,
        breakpoints: Vec<u32>,
        respond_to: oneshot::Sender<Result<Vec<u32>, RegistryError>>,
    },

    /// Release every lock held by a disconnecting endpoint.
    ReleaseEndpoint { endpoint: EndpointId },
}

/// Outcome of a compile request; both cases are successful replies on
/// the wire (distinct from transport-level failures).
#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    Success,
    Failure(CompilationError),
}

/// Watchable state of one node, used to seed a new watch subscription.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub variables: VariableMap,
    pub events_table: Vec<EventDescription>,
    pub execution_state: VmExecutionState,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
///
/// `UnknownNode`, `NotLocked` and `NotPermitted` all map to the same
/// wire code (the protocol admits no finer distinction) but are logged
/// differently by the actor.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// No node with this id in the registry.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The node exists but the requesting endpoint does not hold its lock.
    #[error("node {0} is not locked by the requesting endpoint")]
    NotLocked(NodeId),

    /// The node is locked by another endpoint.
    #[error("node {0} is locked by another endpoint")]
    NodeBusy(NodeId),

    /// The endpoint lacks the capability the operation requires.
    #[error("operation on node {0} not permitted for this endpoint")]
    NotPermitted(NodeId),

    /// A client value could not be mapped to the node's VM types.
    #[error("unsupported variable value: {0}")]
    UnsupportedValue(#[from] ValueError),

    /// The device rejected or failed a write.
    #[error("device write failed: {0}")]
    DeviceWrite(String),

    /// The registry actor is gone (daemon shutting down).
    #[error("registry channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// Maps a backend failure onto a registry error.
    pub fn from_device(err: BackendError) -> Self {
        match err {
            BackendError::UnknownNode(id) => Self::UnknownNode(id),
            BackendError::WriteFailed(msg) => Self::DeviceWrite(msg),
        }
    }

    /// The wire error code reported to the client.
    pub fn wire_code(&self) -> ErrorType {
        match self {
            Self::UnknownNode(_) | Self::NotLocked(_) | Self::NotPermitted(_) => {
                ErrorType::UnknownNode
            }
            Self::NodeBusy(_) | Self::DeviceWrite(_) => ErrorType::NodeBusy,
            Self::UnsupportedValue(_) => ErrorType::UnsupportedVariableType,
            Self::ChannelClosed => ErrorType::UnknownError,
        }
    }
}

// ============================================================================
// Node Events
// ============================================================================

/// Change events published by the registry to all endpoints.
///
/// For a given node the publication order matches the backend event
/// order; endpoints filter by their own watch subscriptions.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The node appeared, changed status or name, or disconnected
    /// (`status == Disconnected`, after which the id is gone).
    NodeChanged { node: NodeView },

    /// Variable values changed.
    VariablesChanged {
        id: NodeId,
        variables: VariableMap,
    },

    /// The node emitted events.
    EventsEmitted { id: NodeId, events: EventMap },

    /// The node's event table changed.
    EventsDescriptionChanged {
        id: NodeId,
        events: Vec<EventDescription>,
    },

    /// The node's VM execution state changed.
    ExecutionStateChanged { id: NodeId, state: VmExecutionState },
}
