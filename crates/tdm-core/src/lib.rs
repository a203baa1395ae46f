//! TDM Core - Shared types for the Thymio Device Manager
//!
//! This crate provides the domain types shared between the broker
//! daemon (tdmd) and the wire protocol (tdm-protocol):
//!
//! - node identity, status and capabilities
//! - dynamic variable values and their coercion to VM words
//! - event descriptions
//! - VM execution state, compilation results and VM descriptions
//!
//! All production code follows the panic-free policy: no `.unwrap()`,
//! `.expect()`, `panic!()`, `unreachable!()`, `todo!()`.

pub mod error;
pub mod event;
pub mod node;
pub mod value;
pub mod vm;

// Re-exports for convenience
pub use error::ValueError;
pub use event::{validate_events_table, EventDescription, MAX_EVENT_SIZE};
pub use node::{Capabilities, NodeId, NodeStatus, NodeType, NodeView};
pub use value::{EventMap, Value, Variable, VariableMap};
pub use vm::{
    CompilationError, CompilationOptions, CompiledProgram, NamedVariable, VmDescription,
    VmExecutionState, VmExecutionStateCommand, VmLanguage, VmState,
};
