//! Error types for compilation and embedder-facing execution control.
//!
//! Script-level failures (a `Throw` instruction, an out-of-bounds index) are
//! not errors here: they surface through the thread's status and thrown
//! value. [`CompileError`] reports malformed instruction streams handed to
//! the builder; [`ExecError`] reports misuse of the thread API itself.

use std::fmt;

use crate::instr::{FuncId, GlobalId, LabelId, LiteralId, VarId};
use crate::pos::SourcePos;
use crate::thread::Status;
use crate::types::TypeId;

pub type CompileResult<T> = Result<T, CompileError>;
pub type ExecResult<T> = Result<T, ExecError>;

/// What went wrong while building a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// A label was defined at two different steps.
    DuplicateLabel(LabelId),
    /// A label was jumped to but never defined before `finish`.
    UndefinedLabel(LabelId),
    /// An instruction referenced a label id that was never created.
    UnknownLabel(LabelId),
    /// An operand referenced a variable id outside the declaration table.
    UnknownVar(VarId),
    /// An instruction referenced a type id missing from the registry.
    UnknownType(TypeId),
    /// A call referenced a function id the module never declared.
    UnknownFunction(FuncId),
    /// An operand referenced a global id the module never declared.
    UnknownGlobal(GlobalId),
    /// An operand referenced a literal id outside the function's pool.
    UnknownLiteral(LiteralId),
    /// A literal's byte payload does not match its type's size.
    LiteralSizeMismatch { expected: u32, got: u32 },
    /// An alias points at a variable that is itself an alias.
    AliasOfAlias(VarId),
    /// An alias sub-range does not fit inside its container's storage.
    AliasOutOfRange(VarId),
    /// `pop_scope` with no open scope.
    ScopeUnderflow,
    /// A scope was still open at `finish`.
    UnclosedScope,
    /// `close_catch` with no open catch region.
    RegionUnderflow,
    /// A catch region was still open at `finish`.
    UnclosedRegion,
    /// A catch region has no clauses at all.
    EmptyCatch,
    /// A wildcard catch clause was followed by further clauses.
    WildcardNotLast,
    /// A scoped label name was resolved or popped while not bound.
    UnboundScopedLabel(String),
    /// A function id was defined twice in the module.
    FunctionRedefined(FuncId),
    /// A declared function had no body when the module was finished.
    FunctionUndefined(FuncId),
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateLabel(l) => write!(f, "label {} defined twice", l.0),
            Self::UndefinedLabel(l) => write!(f, "label {} is jumped to but never defined", l.0),
            Self::UnknownLabel(l) => write!(f, "label id {} was never created", l.0),
            Self::UnknownVar(v) => write!(f, "variable id {} was never declared", v.0),
            Self::UnknownType(t) => write!(f, "type id {} is not in the registry", t.0),
            Self::UnknownFunction(func) => write!(f, "function id {} was never declared", func.0),
            Self::UnknownGlobal(g) => write!(f, "global id {} was never declared", g.0),
            Self::UnknownLiteral(l) => write!(f, "literal id {} is out of range", l.0),
            Self::LiteralSizeMismatch { expected, got } => {
                write!(f, "literal holds {got} bytes but its type needs {expected}")
            }
            Self::AliasOfAlias(v) => write!(f, "variable {} aliases another alias", v.0),
            Self::AliasOutOfRange(v) => {
                write!(f, "alias {} does not fit inside its container", v.0)
            }
            Self::ScopeUnderflow => f.write_str("pop_scope without a matching push_scope"),
            Self::UnclosedScope => f.write_str("scope still open at finish"),
            Self::RegionUnderflow => f.write_str("close_catch without a matching open_catch"),
            Self::UnclosedRegion => f.write_str("catch region still open at finish"),
            Self::EmptyCatch => f.write_str("catch region declares no clauses"),
            Self::WildcardNotLast => f.write_str("wildcard catch clause must be the last clause"),
            Self::UnboundScopedLabel(name) => write!(f, "scoped label {name:?} is not bound"),
            Self::FunctionRedefined(func) => write!(f, "function id {} defined twice", func.0),
            Self::FunctionUndefined(func) => {
                write!(f, "function id {} declared but never defined", func.0)
            }
        }
    }
}

/// A rejected compilation, pointing at the source position of the
/// instruction (or builder call) that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    kind: CompileErrorKind,
    pos: SourcePos,
}

impl CompileError {
    #[must_use]
    pub(crate) fn new(kind: CompileErrorKind, pos: SourcePos) -> Self {
        Self { kind, pos }
    }

    #[must_use]
    pub fn kind(&self) -> &CompileErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn pos(&self) -> SourcePos {
        self.pos
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.kind, self.pos)
    }
}

impl std::error::Error for CompileError {}

/// Misuse of the thread API by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// `start` was given a function id the module does not contain.
    UnknownFunction(FuncId),
    /// `start` while a previous execution is still in progress.
    Busy(Status),
    /// `run` on a thread that is neither freshly started nor suspended.
    NotRunnable(Status),
    /// An argument accessor named a parameter the entry function lacks.
    NoSuchParam(u32),
    /// An argument write did not match the parameter's byte size.
    ParamSizeMismatch { param: u32, expected: u32, got: u32 },
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction(func) => {
                write!(f, "module has no function with id {}", func.0)
            }
            Self::Busy(status) => write!(f, "thread is busy (status {status:?})"),
            Self::NotRunnable(status) => {
                write!(f, "thread cannot run from status {status:?}")
            }
            Self::NoSuchParam(i) => write!(f, "entry function has no parameter {i}"),
            Self::ParamSizeMismatch { param, expected, got } => write!(
                f,
                "parameter {param} holds {expected} bytes but {got} were written"
            ),
        }
    }
}

impl std::error::Error for ExecError {}
