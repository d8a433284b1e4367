//! The intermediate instruction stream.
//!
//! Construct compilers emit [`Instr`]s through the [`crate::Builder`]; the
//! fixup pass rewrites the stream, the allocator resolves variables to frame
//! offsets, and the packer serializes everything into the flat opcode blob
//! (see `pack.rs` for the byte-level encoding).
//!
//! Instructions here are index-based: operands name variables by [`VarId`]
//! and jump targets by [`LabelId`]. Neither survives packing - the packer
//! lowers variables to frame offsets and labels to blob addresses.

use crate::pos::SourcePos;
use crate::types::TypeId;

/// Logical variable slot inside one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct VarId(pub u32);

/// Jump target inside one compilation. Resolved to a blob address at pack time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// Index of a packed function within its [`crate::Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FuncId(pub u32);

/// Index of a module-level global storage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GlobalId(pub u32);

/// Index into a function's embedded literal pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LiteralId(pub u32);

/// A value an instruction reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// A frame slot (local, temporary, parameter or the return slot).
    Slot(VarId),
    /// Indirect access: `base` holds a global handle (little-endian u32
    /// [`GlobalId`]); the operand is `offset` bytes into that global's
    /// storage. This is how member access on handle values is expressed
    /// without raw pointers.
    Deref { base: VarId, offset: u32 },
    /// Direct access into a module global at a byte offset.
    Global { global: GlobalId, offset: u32 },
    /// A read-only literal embedded in the function's literal pool.
    Literal(LiteralId),
}

impl Operand {
    /// The variable this operand touches, if any (used by validation).
    #[must_use]
    pub(crate) fn var(&self) -> Option<VarId> {
        match self {
            Operand::Slot(v) | Operand::Deref { base: v, .. } => Some(*v),
            Operand::Global { .. } | Operand::Literal(_) => None,
        }
    }
}

/// One clause of a catch region: which thrown type it handles, where the
/// handler code lives, and which frame slot (if any) receives the value.
#[derive(Debug, Clone)]
pub struct CatchClause {
    /// `None` is the wildcard; the builder enforces it comes last.
    pub ty: Option<TypeId>,
    /// First instruction of the handler.
    pub target: LabelId,
    /// Slot that receives the thrown value, or `None` to discard it.
    pub landing: Option<VarId>,
}

/// Operation performed by one step.
#[derive(Debug, Clone)]
pub enum InstrKind {
    /// `dst = src`, via the type's assign callback.
    Assign {
        dst: Operand,
        src: Operand,
        ty: TypeId,
    },
    /// `dst = base[index]` for elements of type `elem`: reads a u32 element
    /// index from `index`, then copies element bytes out of `base`.
    Index {
        dst: Operand,
        base: Operand,
        index: Operand,
        elem: TypeId,
    },
    /// Constructs a fresh container value of type `ty` in `dst`.
    NewContainer { dst: Operand, ty: TypeId },
    /// Runs the variable's type init callback on its (dead) storage.
    Init { var: VarId },
    /// Runs the variable's type destruct callback; the storage is dead after.
    Destruct { var: VarId },
    /// Calls another function in the module. Arguments are copied into the
    /// callee's parameter slots; on return the callee's return slot is
    /// copied into `ret` (if present).
    Call {
        func: FuncId,
        args: Vec<Operand>,
        ret: Option<Operand>,
    },
    /// Unconditional jump.
    Jump { target: LabelId },
    /// Conditional jump: reads one byte from `cond`; jumps when it is
    /// non-zero, or when zero if `invert` is set.
    JumpIf {
        cond: Operand,
        invert: bool,
        target: LabelId,
    },
    /// Marks entry into catch region `region` (index into the builder's
    /// region table): pushes a runtime catch guard.
    PushCatchGuard { region: u32 },
    /// Marks sequential exit from catch region `region`: pops its guard.
    PopCatchGuard { region: u32 },
    /// Writes a callable handle for `func` into `dst` (4 bytes, LE).
    MakeClosure { dst: Operand, func: FuncId },
    /// Throws the value read from `src` (of type `ty`).
    Throw { src: Operand, ty: TypeId },
    /// Cooperatively suspends the thread; resume continues after this step.
    Yield,
    /// Pops the current frame, delivering the return slot to the caller.
    Return,
}

impl InstrKind {
    /// The label this instruction targets, if it is a jump.
    #[must_use]
    pub(crate) fn jump_target(&self) -> Option<LabelId> {
        match self {
            InstrKind::Jump { target } | InstrKind::JumpIf { target, .. } => Some(*target),
            _ => None,
        }
    }
}

/// One step of the instruction stream: an operation plus its source position.
#[derive(Debug, Clone)]
pub struct Instr {
    pub kind: InstrKind,
    pub pos: SourcePos,
}

impl Instr {
    #[must_use]
    pub fn new(kind: InstrKind, pos: SourcePos) -> Self {
        Self { kind, pos }
    }
}
