#![doc = include_str!("../../../README.md")]

mod alloc;
mod builder;
mod error;
mod fixup;
mod function;
mod instr;
mod pack;
mod pos;
mod thread;
mod types;

pub use crate::{
    builder::{Builder, ModuleBuilder},
    error::{CompileError, CompileErrorKind, CompileResult, ExecError, ExecResult},
    function::{GlobalDef, Module, PackedFunction, ParamSlot},
    instr::{
        CatchClause, FuncId, GlobalId, Instr, InstrKind, LabelId, LiteralId, Operand, VarId,
    },
    pack::disassemble,
    pos::{FileId, SourcePos},
    thread::{Status, Thread, TraceFrame},
    types::{Scalar, TypeId, TypeRegistry, ValueType},
};
