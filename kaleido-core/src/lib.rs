//! Core of the Kaleido language toolchain.
//!
//! Every top-level form goes through the same pipeline:
//!
//!   source text
//!     -> lexer      (tokens, one at a time)
//!     -> parser     (one AST item per form)
//!     -> codegen    (SSA IR, one module per form)
//!     -> jit        (codegen_wasm + wasmi, one instance per module)
//!
//! `session` ties these together and tracks which unit provides which
//! function; `driver` runs the read-compile-evaluate loop over a reader.
//! The CLI should depend on this crate rather than reimplementing the
//! pipeline.

// ---------------------------------------------------------------------
// Error handling and diagnostics
// ---------------------------------------------------------------------

pub mod span;
pub mod diagnostic;
pub mod error;

// ---------------------------------------------------------------------
// Front-end: lexing and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod parser;
pub mod ast;

// ---------------------------------------------------------------------
// Middle: SSA IR and lowering
// ---------------------------------------------------------------------

pub mod ir;
pub mod codegen;

// ---------------------------------------------------------------------
// Back-end: wasm emission, host runtime and execution
// ---------------------------------------------------------------------

pub mod builtins;
pub mod codegen_wasm;
pub mod jit;

// ---------------------------------------------------------------------
// Sessions and the interactive loop
// ---------------------------------------------------------------------

pub mod session;
pub mod driver;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use driver::{Mode, RunStatus, run};
pub use error::{CoreError, SessionError};
pub use jit::{ExecutionEngine, WasmJit};
pub use session::{Outcome, RedefinitionPolicy, Session, SessionConfig};
