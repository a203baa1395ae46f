//! Program compiler contract.
//!
//! The broker does not compile programs itself; it forwards source text
//! to a [`ProgramCompiler`] and relays the outcome. The simulated
//! compiler below pairs with the simulated backend: it accepts anything
//! that scans as plain program text and reports the first offending
//! character otherwise, which is enough to exercise both result paths.

use async_trait::async_trait;

use tdm_core::{CompilationError, CompiledProgram, VmLanguage};

/// Transforms program text into VM bytecode plus diagnostics.
#[async_trait]
pub trait ProgramCompiler: Send + Sync + 'static {
    async fn compile(
        &self,
        language: VmLanguage,
        source: &str,
    ) -> Result<CompiledProgram, CompilationError>;
}

/// Deterministic stand-in compiler for the simulated backend.
///
/// Rejects any source containing a `!` (never valid in the language),
/// reporting the diagnostic at the start of the token holding it, the
/// way the real compiler anchors its errors; otherwise produces one
/// bytecode word per source byte.
pub struct SimulatedCompiler;

#[async_trait]
impl ProgramCompiler for SimulatedCompiler {
    async fn compile(
        &self,
        _language: VmLanguage,
        source: &str,
    ) -> Result<CompiledProgram, CompilationError> {
        let mut line: u32 = 1;
        let mut column: u32 = 1;
        let mut token_line: u32 = 1;
        let mut token_column: u32 = 1;
        let mut token_offset: u32 = 0;
        for (offset, ch) in source.char_indices() {
            if ch == '!' {
                return Err(CompilationError {
                    message: "syntax error: unexpected `!`".into(),
                    line: token_line,
                    column: token_column,
                    character: token_offset,
                });
            }
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
            if ch.is_whitespace() {
                token_line = line;
                token_column = column;
                token_offset = (offset + ch.len_utf8()) as u32;
            }
        }
        Ok(CompiledProgram {
            bytecode: source.bytes().map(u16::from).collect(),
        })
    }
}
