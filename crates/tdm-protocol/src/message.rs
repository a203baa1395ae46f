//! Protocol message types for broker communication.
//!
//! Two tagged unions, one per direction. Requests carry a client-chosen
//! 32-bit `request_id`; responses and typed errors correlate on it.
//! Spontaneous notifications (node list changes, watch streams) carry no
//! request id.

use serde::{Deserialize, Serialize};

use tdm_core::{
    Capabilities, CompilationOptions, EventDescription, EventMap, NodeId, NodeStatus, NodeType,
    VariableMap, VmDescription, VmExecutionState, VmExecutionStateCommand, VmLanguage,
};

// ============================================================================
// Watch Flags
// ============================================================================

/// Which of a node's asynchronous streams an endpoint subscribes to.
///
/// `watch` requests carry the full desired set: flags newly set start a
/// subscription (with an immediate snapshot), flags left out cancel one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchFlags(u32);

impl WatchFlags {
    pub const VARIABLES: u32 = 0x1;
    pub const EVENTS: u32 = 0x2;
    pub const VM_EXECUTION_STATE: u32 = 0x4;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    #[must_use]
    pub const fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }
}

// ============================================================================
// Error Codes
// ============================================================================

/// Wire-level error codes.
///
/// `UnknownNode` deliberately covers both "no such node" and "node not
/// locked by the caller"; the wire protocol admits no finer distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NoError,
    UnknownNode,
    NodeBusy,
    UnsupportedVariableType,
    UnknownError,
}

// ============================================================================
// Node Record
// ============================================================================

/// One entry of a `NodesChanged` message.
///
/// The status is already translated for the receiving endpoint (a node
/// locked by the receiver reports `Ready`, never `Busy`), and the
/// capability mask reflects the endpoint's locality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub status: NodeStatus,
    pub node_type: NodeType,
    pub name: String,
    pub capabilities: Capabilities,
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent by client applications to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Mandatory first message on any connection.
    ConnectionHandshake {
        protocol_version: u16,
        min_protocol_version: u16,
        /// Largest frame payload the client accepts.
        max_message_size: u32,
        /// Access token; mandatory on non-local connections.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<Vec<u8>>,
    },

    /// Request a full `NodesChanged` snapshot.
    RequestListOfNodes,

    /// Request a node's VM description.
    RequestNodeAsebaVmDescription { request_id: u32, node_id: NodeId },

    /// Take the exclusive write lock on a node.
    LockNode { request_id: u32, node_id: NodeId },

    /// Release the write lock on a node.
    UnlockNode { request_id: u32, node_id: NodeId },

    /// Rename a node. Requires the lock and the rename capability.
    RenameNode {
        request_id: u32,
        node_id: NodeId,
        new_name: String,
    },

    /// Write variables on a locked node.
    SetNodeVariables {
        request_id: u32,
        node_id: NodeId,
        variables: VariableMap,
    },

    /// Replace the event table of a locked node.
    RegisterEvents {
        request_id: u32,
        node_id: NodeId,
        events: Vec<EventDescription>,
    },

    /// Emit events on a locked node.
    SendEvents {
        request_id: u32,
        node_id: NodeId,
        events: EventMap,
    },

    /// Compile a program and optionally load it onto the node.
    CompileAndLoadCodeOnVm {
        request_id: u32,
        node_id: NodeId,
        language: VmLanguage,
        program: String,
        options: CompilationOptions,
    },

    /// Drive the node's VM (run/step/pause/stop/reset).
    SetVmExecutionState {
        request_id: u32,
        node_id: NodeId,
        command: VmExecutionStateCommand,
    },

    /// Set the full desired watch set for a node.
    WatchNode {
        request_id: u32,
        node_id: NodeId,
        flags: WatchFlags,
    },

    /// Replace the breakpoints on a locked node.
    SetBreakpoints {
        request_id: u32,
        node_id: NodeId,
        breakpoints: Vec<u32>,
    },
}

impl ClientMessage {
    /// Creates a handshake with the current protocol versions.
    pub fn handshake(token: Option<Vec<u8>>) -> Self {
        Self::ConnectionHandshake {
            protocol_version: crate::version::PROTOCOL_VERSION,
            min_protocol_version: crate::version::MIN_PROTOCOL_VERSION,
            max_message_size: crate::version::MAX_MESSAGE_SIZE,
            token,
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent by the broker to client applications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake reply. `protocol_version` 0 means the version ranges
    /// were disjoint and the connection closes after this message.
    ConnectionHandshake {
        protocol_version: u16,
        /// Largest frame payload the broker accepts.
        max_message_size: u32,
    },

    /// Incremental or full node list update.
    NodesChanged { nodes: Vec<Node> },

    /// Reply to `RequestNodeAsebaVmDescription`.
    NodeAsebaVmDescription {
        request_id: u32,
        node_id: NodeId,
        description: VmDescription,
    },

    /// Generic acknowledgement of a request.
    RequestCompleted { request_id: u32 },

    /// Typed failure of a request.
    Error { request_id: u32, error: ErrorType },

    /// The program compiled (and, if requested, loaded).
    CompilationResultSuccess { request_id: u32 },

    /// The program did not compile.
    CompilationResultFailure {
        request_id: u32,
        message: String,
        line: u32,
        column: u32,
        character: u32,
    },

    /// Reply to `SetBreakpoints` with the lines the device actually set.
    SetBreakpointsResponse {
        request_id: u32,
        error: ErrorType,
        breakpoints: Vec<u32>,
    },

    /// Watch stream: variable values changed.
    NodeVariablesChanged {
        node_id: NodeId,
        variables: VariableMap,
    },

    /// Watch stream: the node emitted events.
    EventsEmitted { node_id: NodeId, events: EventMap },

    /// Watch stream: the node's event table changed.
    EventsDescriptionChanged {
        node_id: NodeId,
        events: Vec<EventDescription>,
    },

    /// Watch stream: the node's VM execution state changed.
    VmExecutionStateChanged {
        node_id: NodeId,
        state: VmExecutionState,
    },
}

impl ServerMessage {
    /// Creates an acknowledgement for a request.
    pub fn request_completed(request_id: u32) -> Self {
        Self::RequestCompleted { request_id }
    }

    /// Creates a typed error response for a request.
    pub fn error(request_id: u32, error: ErrorType) -> Self {
        Self::Error { request_id, error }
    }

    /// Creates a handshake reply.
    pub fn handshake(protocol_version: u16, max_message_size: u32) -> Self {
        Self::ConnectionHandshake {
            protocol_version,
            max_message_size,
        }
    }
}
