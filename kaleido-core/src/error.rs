use std::io;

use thiserror::Error;

use crate::lexer::Token;

/// Grammatical failure while reading one top-level form.
///
/// Carries the offending token and the text of the form consumed so far,
/// which is enough to render a caret diagnostic.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}, found {token}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub token: Token,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("expected {0}")]
    Expected(&'static str),
    #[error("expected an expression")]
    ExpectedExpression,
    #[error("unknown binary operator")]
    UnknownOperator,
    #[error("invalid numeric literal")]
    InvalidNumericLiteral,
}

/// Structural problem found by the IR verifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("block `{block}` has no terminator")]
    MissingTerminator { block: String },
    #[error("block `{block}` was created but never inserted")]
    DetachedBlock { block: String },
    #[error("branch to a block that is not part of the function")]
    DanglingBranch,
    #[error("phi in block `{block}` is not at the start of the block")]
    MisplacedPhi { block: String },
    #[error("phi in block `{block}` does not match the block's predecessors")]
    PhiPredecessorMismatch { block: String },
    #[error("operand has type {found} where {expected} was expected")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("instruction %{0} is used but never placed in a block")]
    UnplacedValue(u32),
    #[error("parameter #{0} is out of range")]
    ParameterOutOfRange(u32),
    #[error("call to undeclared function `{0}`")]
    UndeclaredCallee(String),
    #[error("call to `{name}` passes {found} argument(s), declaration takes {expected}")]
    CallArity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("function `{0}` is defined more than once in the module")]
    DuplicateFunction(String),
}

/// Semantic failure while lowering an AST into IR.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoweringError {
    #[error("unbound variable `{0}`")]
    UnboundVariable(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{name}` takes {expected} argument(s) but {found} were supplied")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("unsupported binary operator `{0}`")]
    UnsupportedOperator(String),
    #[error("function `{name}` failed verification: {source}")]
    Malformed {
        name: String,
        #[source]
        source: IrError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("module failed verification: {0}")]
    Unverified(#[from] IrError),
    #[error("more than {0} wasm locals required")]
    TooManyLocals(u32),
}

/// Failure reported by the execution collaborator.
///
/// These are fatal to a session: they mean the backend itself is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to compile unit: {0}")]
    Compile(String),
    #[error("unresolved symbol `{0}`")]
    UnresolvedSymbol(String),
    #[error("failed to link `{name}`: {message}")]
    Link { name: String, message: String },
    #[error("failed to instantiate unit: {0}")]
    Instantiate(String),
    #[error("unknown compilation unit #{0}")]
    UnknownUnit(u64),
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),
    #[error("symbol `{name}` has an unexpected signature: {message}")]
    Signature { name: String, message: String },
    #[error("execution trapped: {0}")]
    Trap(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("codegen error: {0}")]
    Lowering(#[from] LoweringError),
    #[error("cannot redefine `{name}`: still called by {}", .dependents.join(", "))]
    RedefinitionRefused {
        name: String,
        dependents: Vec<String>,
    },
    #[error(
        "`{name}` is provided by the host runtime with {expected} parameter(s), \
         but was declared with {found}"
    )]
    HostSignature {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("execution engine failure: {0}")]
    Jit(#[from] JitError),
}

impl SessionError {
    /// Whether the session can keep going after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Jit(_))
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Jit(#[from] JitError),
}
