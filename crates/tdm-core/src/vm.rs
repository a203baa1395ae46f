//! VM execution state, programming language, and compilation artifacts.

use serde::{Deserialize, Serialize};

// ============================================================================
// Execution State
// ============================================================================

/// Coarse state of a node's VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Stopped,
    Running,
    Paused,
}

/// Snapshot of a node's VM execution state, as reported to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmExecutionState {
    pub state: VmState,
    /// Source line the VM is stopped or paused on; 0 when not meaningful.
    pub line: u32,
}

impl Default for VmExecutionState {
    fn default() -> Self {
        Self {
            state: VmState::Stopped,
            line: 0,
        }
    }
}

/// Execution-control commands a client can send to a node VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmExecutionStateCommand {
    Run,
    Step,
    Pause,
    Stop,
    Reset,
}

// ============================================================================
// Compilation
// ============================================================================

/// Source language of a program submitted for compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmLanguage {
    Aseba,
}

/// Option mask of a compile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompilationOptions(u32);

impl CompilationOptions {
    /// Load the produced bytecode onto the node after a successful compile.
    pub const LOAD_ON_TARGET: u32 = 0x1;

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
    pub const fn load_on_target(&self) -> bool {
        self.0 & Self::LOAD_ON_TARGET != 0
    }

    #[must_use]
    pub const fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }
}

/// Bytecode produced by a successful compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProgram {
    pub bytecode: Vec<u16>,
}

/// Diagnostic of a failed compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    /// Absolute character offset of the error in the source text.
    pub character: u32,
}

// ============================================================================
// VM Description
// ============================================================================

/// A named variable slot in the node's VM memory layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedVariable {
    pub name: String,
    pub size: u32,
}

/// Static description of a node's VM, served on request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VmDescription {
    pub bytecode_size: u32,
    pub data_size: u32,
    pub stack_size: u32,
    pub variables: Vec<NamedVariable>,
}
