//! Node registry using the actor pattern.
//!
//! The registry is the single owner of node state: discovery results,
//! variables, event tables, VM execution state, and the per-node write
//! lock. It receives commands from client endpoints via a tokio mpsc
//! channel, ingests backend events from the device side, and publishes
//! change events on a broadcast channel that every endpoint subscribes
//! to.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  RegistryCommand  ┌───────────────────┐
//! │ ClientEndpoint│ ────────────────▶ │ NodeRegistryActor │
//! └──────────────┘    (mpsc)         │  HashMap<NodeId,  │
//!        ▲                           │       Node>       │
//!        │ NodeEvent (broadcast)     └─────────▲─────────┘
//!        └───────────────────────────┐         │ BackendEvent (mpsc)
//!                                    │         │
//!                              ┌─────┴─────────┴─────┐
//!                              │     NodeBackend     │
//!                              └─────────────────────┘
//! ```
//!
//! Ordering: the actor drains backend events before commands (biased
//! select) and always mutates its map before publishing, so an observer
//! that queries back into the registry sees post-mutation state.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::backend::{BackendEvent, NodeBackend};
use crate::compiler::ProgramCompiler;

mod actor;
mod commands;
mod handle;
mod node;

pub use actor::NodeRegistryActor;
pub use commands::{
    CompileOutcome, EndpointId, NodeEvent, NodeSnapshot, RegistryCommand, RegistryError,
};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 256;

/// Spawns the registry actor and returns a handle for interaction.
///
/// `backend_events` is the receiving end of the channel the backend
/// delivers its notifications on; the actor consumes it for the rest of
/// its life.
pub fn spawn_registry(
    backend: Arc<dyn NodeBackend>,
    compiler: Arc<dyn ProgramCompiler>,
    backend_events: mpsc::Receiver<BackendEvent>,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = NodeRegistryActor::new(cmd_rx, backend_events, event_tx.clone(), backend, compiler);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
