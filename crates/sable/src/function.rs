//! Packed functions and the module that owns them.
//!
//! A [`PackedFunction`] is the durable output of compilation: the opcode
//! blob plus the side tables the executor consults by blob address. A
//! [`Module`] bundles every packed function with the global declarations,
//! the source file-name table, and the [`TypeRegistry`] the instruction
//! streams were compiled against.
//!
//! Modules serialize with `postcard` via [`Module::dump`]. Type callbacks
//! are code, not data, so a dump carries only type *ids*; [`Module::load`]
//! takes a registry the embedder rebuilt in the same registration order.

use crate::instr::FuncId;
use crate::pos::{FileId, SourcePos};
use crate::types::{TypeId, TypeRegistry};

/// A fixed frame slot: a parameter or the return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParamSlot {
    pub offset: u32,
    pub ty: TypeId,
}

/// Liveness of one local with lifecycle callbacks, in blob addresses.
/// The slot is live at `ip` iff `start <= ip < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LiveSlot {
    pub offset: u32,
    pub ty: TypeId,
    pub start: u32,
    pub end: u32,
}

/// One packed catch clause: `None` type is the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PackedClause {
    pub ty: Option<TypeId>,
    /// Handler entry address.
    pub target: u32,
    /// Frame offset receiving the thrown value, or `None` to discard it.
    pub landing: Option<u32>,
}

/// One packed catch region: `[start, end)` in blob addresses.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PackedRegion {
    pub start: u32,
    pub end: u32,
    pub clauses: Vec<PackedClause>,
}

/// Debug table entry: the source position in effect from `addr` until the
/// next entry's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DebugEntry {
    pub addr: u32,
    pub pos: SourcePos,
}

/// A read-only value embedded in a function, referenced by literal operands.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PackedLiteral {
    pub ty: TypeId,
    pub bytes: Vec<u8>,
}

/// A compiled function: opcode blob plus address-keyed side tables.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PackedFunction {
    pub(crate) name: String,
    pub(crate) code: Vec<u8>,
    pub(crate) frame_size: u32,
    pub(crate) params: Vec<ParamSlot>,
    pub(crate) ret: Option<ParamSlot>,
    pub(crate) literals: Vec<PackedLiteral>,
    pub(crate) catches: Vec<PackedRegion>,
    pub(crate) liveness: Vec<LiveSlot>,
    pub(crate) debug: Vec<DebugEntry>,
}

impl PackedFunction {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn params(&self) -> &[ParamSlot] {
        &self.params
    }

    #[must_use]
    pub fn ret(&self) -> Option<ParamSlot> {
        self.ret
    }

    /// Source position in effect at `addr`, via binary search of the debug
    /// table. `None` only for functions packed with no instructions.
    #[must_use]
    pub fn pos_at(&self, addr: u32) -> Option<SourcePos> {
        let i = self.debug.partition_point(|e| e.addr <= addr);
        i.checked_sub(1).map(|i| self.debug[i].pos)
    }
}

/// Declaration of one module-level global storage slot. Storage itself is
/// owned per-thread; the module records only the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GlobalDef {
    pub ty: TypeId,
}

/// A set of compiled functions sharing globals, files and a type registry.
pub struct Module {
    types: TypeRegistry,
    funcs: Vec<PackedFunction>,
    globals: Vec<GlobalDef>,
    files: Vec<String>,
}

impl Module {
    pub(crate) fn assemble(
        types: TypeRegistry,
        funcs: Vec<PackedFunction>,
        globals: Vec<GlobalDef>,
        files: Vec<String>,
    ) -> Self {
        Self {
            types,
            funcs,
            globals,
            files,
        }
    }

    #[must_use]
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    #[must_use]
    pub fn function(&self, id: FuncId) -> Option<&PackedFunction> {
        self.funcs.get(id.0 as usize)
    }

    /// Internal indexed lookup; ids inside packed code were validated at
    /// compile time, so a miss here means a corrupt blob and the caller
    /// handles it as a fault.
    pub(crate) fn func(&self, id: FuncId) -> &PackedFunction {
        &self.funcs[id.0 as usize]
    }

    #[must_use]
    pub fn function_count(&self) -> usize {
        self.funcs.len()
    }

    /// Finds a function by name (linear scan; modules are small).
    #[must_use]
    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.funcs
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    #[must_use]
    pub fn globals(&self) -> &[GlobalDef] {
        &self.globals
    }

    #[must_use]
    pub fn file_name(&self, id: FileId) -> Option<&str> {
        self.files.get(id.0 as usize).map(String::as_str)
    }

    /// Serializes functions, globals and files with `postcard`.
    pub fn dump(&self) -> postcard::Result<Vec<u8>> {
        postcard::to_stdvec(&(&self.funcs, &self.globals, &self.files))
    }

    /// Restores a dumped module. `types` must hold the same types in the
    /// same registration order as the registry the dump was compiled with;
    /// ids in the blob are resolved against it blindly.
    pub fn load(bytes: &[u8], types: TypeRegistry) -> postcard::Result<Self> {
        let (funcs, globals, files): (Vec<PackedFunction>, Vec<GlobalDef>, Vec<String>) =
            postcard::from_bytes(bytes)?;
        Ok(Self {
            types,
            funcs,
            globals,
            files,
        })
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        // Literal values may own resources through their type's destruct
        // callback; the module is their owner.
        for func in &mut self.funcs {
            for lit in &mut func.literals {
                let ty = self.types.get(lit.ty);
                if ty.has_destruct() {
                    ty.destruct(&mut lit.bytes);
                }
            }
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("functions", &self.funcs.len())
            .field("globals", &self.globals.len())
            .field("files", &self.files)
            .finish()
    }
}
