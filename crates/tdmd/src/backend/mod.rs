//! Node backend contract.
//!
//! A backend owns the device links (serial/USB, USB-to-CAN, simulation)
//! and exposes two faces to the broker:
//!
//! - an event channel delivering every discovery and state change into
//!   the registry actor, in device order
//! - the [`NodeBackend`] trait for device writes, always addressed by
//!   node id and completing when the device acknowledged (or failed) the
//!   write
//!
//! The broker applies no timeout of its own to backend operations; a
//! backend that cannot complete a write must fail it.

mod simulated;

pub use simulated::SimulatedBackend;

use async_trait::async_trait;
use thiserror::Error;

use tdm_core::{
    EventDescription, EventMap, NodeId, NodeStatus, NodeType, VariableMap, VmDescription,
    VmExecutionState, VmExecutionStateCommand,
};

/// Channel depth for backend events into the registry.
pub const BACKEND_EVENT_BUFFER: usize = 256;

/// Static properties of a newly discovered node.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub node_type: NodeType,
    /// Whether the device accepts a rename. Feeds the rename capability.
    pub renamable: bool,
    pub vm_description: VmDescription,
}

/// Events delivered by a backend to the registry, in device order.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A node appeared.
    NodeConnected {
        id: NodeId,
        descriptor: NodeDescriptor,
        status: NodeStatus,
    },

    /// The device-side status of a node changed.
    NodeStatusChanged { id: NodeId, status: NodeStatus },

    /// A rename completed on the device.
    NodeRenamed { id: NodeId, name: String },

    /// A node is gone. Terminal for the id.
    NodeDisconnected { id: NodeId },

    /// Variable values changed on the node.
    VariablesChanged { id: NodeId, variables: VariableMap },

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

/// Errors reported by backend device operations.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend does not know the node (it may have just disconnected).
    #[error("backend does not know node {0}")]
    UnknownNode(NodeId),

    /// The device rejected or failed the write.
    #[error("device write failed: {0}")]
    WriteFailed(String),
}

/// Device operations exposed by a node backend.
///
/// All operations address a node by id and complete when the device has
/// taken (or refused) the write. Variable and event payloads arrive
/// already coerced to VM words; the dynamic-value coercion is the node
/// handle's job, not the backend's.
#[async_trait]
pub trait NodeBackend: Send + Sync + 'static {
    async fn set_variables(
        &self,
        id: NodeId,
        variables: Vec<(String, Vec<i16>)>,
    ) -> Result<(), BackendError>;

    async fn emit_events(
        &self,
        id: NodeId,
        events: Vec<(String, Vec<i16>)>,
    ) -> Result<(), BackendError>;

    async fn set_events_table(
        &self,
        id: NodeId,
        events: Vec<EventDescription>,
    ) -> Result<(), BackendError>;

    async fn load_bytecode(&self, id: NodeId, bytecode: Vec<u16>) -> Result<(), BackendError>;

    async fn set_execution_state(
        &self,
        id: NodeId,
        command: VmExecutionStateCommand,
    ) -> Result<(), BackendError>;

    /// Replaces the breakpoint set. Returns the lines the device actually
    /// set; the device may shift or drop lines it cannot break on.
    async fn set_breakpoints(
        &self,
        id: NodeId,
        breakpoints: Vec<u32>,
    ) -> Result<Vec<u32>, BackendError>;

    async fn rename(&self, id: NodeId, name: String) -> Result<(), BackendError>;
}
