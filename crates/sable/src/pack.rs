//! The instruction packer.
//!
//! Packing lowers the index-based [`Instr`](crate::instr::Instr) stream into
//! the flat byte blob the executor walks: one [`Opcode`] byte per step
//! followed by little-endian operand fields. Variables become frame byte
//! offsets, literals become pool indices, and labels become blob addresses.
//!
//! Records are variable-size, so a forward jump cannot know its target
//! address while it is being written. The packer writes a placeholder,
//! records `(patch position, label)` in a fixup list, and resolves every
//! entry once the whole blob is laid out and each step's address is known.
//!
//! The same pass lowers the side tables that let the executor reason about a
//! raw address: the catch-region table, the liveness table used during
//! unwinding, and the address-to-source debug table.

use strum::FromRepr;

use crate::builder::{RegionSpan, Variable};
use crate::function::{
    DebugEntry, LiveSlot, PackedClause, PackedFunction, PackedLiteral, PackedRegion, ParamSlot,
};
use crate::instr::{InstrKind, LabelId, Operand};
use crate::pos::SourcePos;
use crate::types::TypeRegistry;

/// Opcode discriminant: one byte at the start of each packed record.
///
/// Operand fields follow in the byte stream, little-endian. `operand` below
/// means a tag byte plus the tag's fields (see [`RawOperand`]).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum Opcode {
    /// `dst = src` via the type's assign callback. Fields: u32 type,
    /// operand dst, operand src.
    Assign,
    /// `dst = base[index]`. Fields: u32 element type, operand dst,
    /// operand base, operand index.
    Index,
    /// Construct a fresh container in dst. Fields: u32 type, operand dst.
    NewContainer,
    /// Run the init callback on dead storage. Fields: u32 type, u32 offset.
    Init,
    /// Run the destruct callback; storage is dead after. Fields: u32 type,
    /// u32 offset.
    Destruct,
    /// Call a module function. Fields: u32 function, u8 flags (bit 0: has
    /// return destination), operand ret (if flagged), u32 argc, argc
    /// operands.
    Call,
    /// Unconditional jump. Fields: u32 address.
    Jump,
    /// Conditional jump on one byte read from cond. Fields: operand cond,
    /// u8 invert, u32 address.
    JumpIf,
    /// Push a catch guard for a region. Fields: u32 region.
    PushCatchGuard,
    /// Pop the catch guard of a region. Fields: u32 region.
    PopCatchGuard,
    /// Write a callable handle into dst. Fields: u32 function, operand dst.
    MakeClosure,
    /// Throw the value read from src. Fields: u32 type, operand src.
    Throw,
    /// Cooperatively suspend; resume continues at the next record.
    Yield,
    /// Pop the frame, delivering the return slot to the caller.
    Return,
}

/// Operand tag bytes.
const TAG_SLOT: u8 = 0;
const TAG_DEREF: u8 = 1;
const TAG_GLOBAL: u8 = 2;
const TAG_LITERAL: u8 = 3;

/// A decoded operand in blob terms: offsets instead of variable ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawOperand {
    /// A byte offset into the current frame.
    Slot(u32),
    /// The frame slot at `base` holds a u32 global handle; the operand is
    /// `offset` bytes into that global's storage.
    Deref { base: u32, offset: u32 },
    /// `offset` bytes into a module global's storage.
    Global { global: u32, offset: u32 },
    /// An index into the function's literal pool.
    Literal(u32),
}

/// Placeholder written where a label address belongs until fixups resolve.
const UNRESOLVED_ADDR: u32 = u32::MAX;

#[inline]
pub(crate) fn read_u32(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(code[at..at + 4].try_into().expect("4 bytes"))
}

/// Reads one operand at `*at`, advancing past it. Returns `None` on a
/// corrupt tag byte or a truncated record (only possible with hand-built or
/// damaged blobs).
pub(crate) fn read_operand(code: &[u8], at: &mut usize) -> Option<RawOperand> {
    let tag = *code.get(*at)?;
    *at += 1;
    let mut field = || -> Option<u32> {
        let bytes = code.get(*at..*at + 4)?;
        *at += 4;
        Some(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    };
    match tag {
        TAG_SLOT => Some(RawOperand::Slot(field()?)),
        TAG_DEREF => Some(RawOperand::Deref {
            base: field()?,
            offset: field()?,
        }),
        TAG_GLOBAL => Some(RawOperand::Global {
            global: field()?,
            offset: field()?,
        }),
        TAG_LITERAL => Some(RawOperand::Literal(field()?)),
        _ => None,
    }
}

/// Everything the packer needs from a finished compilation.
pub(crate) struct PackInput<'a> {
    pub name: &'a str,
    pub instrs: &'a [crate::instr::Instr],
    pub vars: &'a [Variable],
    pub labels: &'a [u32],
    pub regions: &'a [RegionSpan],
    pub literals: Vec<PackedLiteral>,
    pub frame_size: u32,
    pub params: Vec<ParamSlot>,
    pub ret: Option<ParamSlot>,
    pub types: &'a TypeRegistry,
}

struct Packer<'a> {
    input: PackInput<'a>,
    code: Vec<u8>,
    /// Blob address of each step; one extra entry for one-past-the-end.
    addr_of: Vec<u32>,
    /// `(patch position, label)` pairs resolved after layout.
    fixups: Vec<(usize, LabelId)>,
    debug: Vec<DebugEntry>,
    last_pos: Option<SourcePos>,
}

/// Packs a validated, fixed-up, allocated instruction stream.
pub(crate) fn pack(input: PackInput<'_>) -> PackedFunction {
    let mut p = Packer {
        code: Vec::with_capacity(input.instrs.len() * 8),
        addr_of: Vec::with_capacity(input.instrs.len() + 1),
        fixups: Vec::new(),
        debug: Vec::new(),
        last_pos: None,
        input,
    };

    for i in 0..p.input.instrs.len() {
        p.addr_of.push(p.code.len() as u32);
        p.record_pos(p.input.instrs[i].pos);
        p.encode(i);
    }
    p.addr_of.push(p.code.len() as u32);

    for (at, label) in std::mem::take(&mut p.fixups) {
        let addr = p.label_addr(label);
        p.code[at..at + 4].copy_from_slice(&addr.to_le_bytes());
    }

    p.finish()
}

impl Packer<'_> {
    fn u8(&mut self, v: u8) {
        self.code.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn operand(&mut self, op: &Operand) {
        match op {
            Operand::Slot(v) => {
                self.u8(TAG_SLOT);
                let offset = self.input.vars[v.0 as usize].offset;
                self.u32(offset);
            }
            Operand::Deref { base, offset } => {
                self.u8(TAG_DEREF);
                let base_offset = self.input.vars[base.0 as usize].offset;
                self.u32(base_offset);
                self.u32(*offset);
            }
            Operand::Global { global, offset } => {
                self.u8(TAG_GLOBAL);
                self.u32(global.0);
                self.u32(*offset);
            }
            Operand::Literal(lit) => {
                self.u8(TAG_LITERAL);
                self.u32(lit.0);
            }
        }
    }

    fn label(&mut self, label: LabelId) {
        self.fixups.push((self.code.len(), label));
        self.u32(UNRESOLVED_ADDR);
    }

    fn label_addr(&self, label: LabelId) -> u32 {
        self.addr_of[self.input.labels[label.0 as usize] as usize]
    }

    fn record_pos(&mut self, pos: SourcePos) {
        if self.last_pos != Some(pos) {
            self.debug.push(DebugEntry {
                addr: self.code.len() as u32,
                pos,
            });
            self.last_pos = Some(pos);
        }
    }

    fn encode(&mut self, i: usize) {
        // Cloned so operand fields can be written while the kind is in scope.
        let kind = self.input.instrs[i].kind.clone();
        match &kind {
            InstrKind::Assign { dst, src, ty } => {
                self.u8(Opcode::Assign as u8);
                self.u32(ty.0);
                self.operand(dst);
                self.operand(src);
            }
            InstrKind::Index {
                dst,
                base,
                index,
                elem,
            } => {
                self.u8(Opcode::Index as u8);
                self.u32(elem.0);
                self.operand(dst);
                self.operand(base);
                self.operand(index);
            }
            InstrKind::NewContainer { dst, ty } => {
                self.u8(Opcode::NewContainer as u8);
                self.u32(ty.0);
                self.operand(dst);
            }
            InstrKind::Init { var } => {
                self.u8(Opcode::Init as u8);
                let v = &self.input.vars[var.0 as usize];
                self.u32(v.ty.0);
                self.u32(v.offset);
            }
            InstrKind::Destruct { var } => {
                self.u8(Opcode::Destruct as u8);
                let v = &self.input.vars[var.0 as usize];
                self.u32(v.ty.0);
                self.u32(v.offset);
            }
            InstrKind::Call { func, args, ret } => {
                self.u8(Opcode::Call as u8);
                self.u32(func.0);
                self.u8(u8::from(ret.is_some()));
                if let Some(ret) = ret {
                    self.operand(ret);
                }
                self.u32(args.len() as u32);
                for arg in args {
                    self.operand(arg);
                }
            }
            InstrKind::Jump { target } => {
                self.u8(Opcode::Jump as u8);
                self.label(*target);
            }
            InstrKind::JumpIf {
                cond,
                invert,
                target,
            } => {
                self.u8(Opcode::JumpIf as u8);
                self.operand(cond);
                self.u8(u8::from(*invert));
                self.label(*target);
            }
            InstrKind::PushCatchGuard { region } => {
                self.u8(Opcode::PushCatchGuard as u8);
                self.u32(*region);
            }
            InstrKind::PopCatchGuard { region } => {
                self.u8(Opcode::PopCatchGuard as u8);
                self.u32(*region);
            }
            InstrKind::MakeClosure { dst, func } => {
                self.u8(Opcode::MakeClosure as u8);
                self.u32(func.0);
                self.operand(dst);
            }
            InstrKind::Throw { src, ty } => {
                self.u8(Opcode::Throw as u8);
                self.u32(ty.0);
                self.operand(src);
            }
            InstrKind::Yield => self.u8(Opcode::Yield as u8),
            InstrKind::Return => self.u8(Opcode::Return as u8),
        }
    }

    fn finish(self) -> PackedFunction {
        let step_addr = |step: u32| self.addr_of[step as usize];

        let liveness = self
            .input
            .vars
            .iter()
            .filter(|v| {
                if v.is_param || v.alias.is_some() {
                    return false;
                }
                let ty = self.input.types.get(v.ty);
                ty.size() > 0 && (ty.has_init() || ty.has_destruct())
            })
            .map(|v| LiveSlot {
                offset: v.offset,
                ty: v.ty,
                start: step_addr(v.start),
                end: step_addr(v.end),
            })
            .collect();

        let catches = self
            .input
            .regions
            .iter()
            .map(|r| PackedRegion {
                start: step_addr(r.start),
                end: step_addr(r.end),
                clauses: r
                    .clauses
                    .iter()
                    .map(|c| PackedClause {
                        ty: c.ty,
                        target: self.addr_of[self.input.labels[c.target.0 as usize] as usize],
                        landing: c.landing.map(|v| self.input.vars[v.0 as usize].offset),
                    })
                    .collect(),
            })
            .collect();

        PackedFunction {
            name: self.input.name.to_owned(),
            code: self.code,
            frame_size: self.input.frame_size,
            params: self.input.params,
            ret: self.input.ret,
            literals: self.input.literals,
            catches,
            liveness,
            debug: self.debug,
        }
    }
}

/// Renders a packed function as human-readable assembly, one record per
/// line with its blob address.
#[must_use]
pub fn disassemble(func: &PackedFunction, types: &TypeRegistry) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "{} (frame {} bytes):", func.name, func.frame_size);
    let code = &func.code;
    let mut at = 0usize;

    let ty_name = |id: u32| -> &str {
        let id = crate::types::TypeId(id);
        if types.contains(id) {
            types.get(id).name()
        } else {
            "<bad type>"
        }
    };

    while at < code.len() {
        let addr = at;
        let Some(op) = Opcode::from_repr(code[at]) else {
            let _ = writeln!(out, "{addr:6}  <bad opcode {:#04x}>", code[at]);
            break;
        };
        at += 1;
        let u32_field = |at: &mut usize| {
            let v = read_u32(code, *at);
            *at += 4;
            v
        };
        let operand_field = |at: &mut usize| match read_operand(code, at) {
            Some(RawOperand::Slot(offset)) => format!("[{offset}]"),
            Some(RawOperand::Deref { base, offset }) => format!("[[{base}]]+{offset}"),
            Some(RawOperand::Global { global, offset }) => format!("g{global}+{offset}"),
            Some(RawOperand::Literal(lit)) => format!("lit{lit}"),
            None => "<bad operand>".to_owned(),
        };

        let _ = write!(out, "{addr:6}  ");
        match op {
            Opcode::Assign => {
                let ty = u32_field(&mut at);
                let dst = operand_field(&mut at);
                let src = operand_field(&mut at);
                let _ = writeln!(out, "assign.{} {dst} <- {src}", ty_name(ty));
            }
            Opcode::Index => {
                let ty = u32_field(&mut at);
                let dst = operand_field(&mut at);
                let base = operand_field(&mut at);
                let index = operand_field(&mut at);
                let _ = writeln!(out, "index.{} {dst} <- {base}@{index}", ty_name(ty));
            }
            Opcode::NewContainer => {
                let ty = u32_field(&mut at);
                let dst = operand_field(&mut at);
                let _ = writeln!(out, "newcontainer.{} {dst}", ty_name(ty));
            }
            Opcode::Init => {
                let ty = u32_field(&mut at);
                let offset = u32_field(&mut at);
                let _ = writeln!(out, "init.{} [{offset}]", ty_name(ty));
            }
            Opcode::Destruct => {
                let ty = u32_field(&mut at);
                let offset = u32_field(&mut at);
                let _ = writeln!(out, "destruct.{} [{offset}]", ty_name(ty));
            }
            Opcode::Call => {
                let func_id = u32_field(&mut at);
                let has_ret = code[at] != 0;
                at += 1;
                let ret = if has_ret {
                    operand_field(&mut at)
                } else {
                    "_".to_owned()
                };
                let argc = u32_field(&mut at);
                let args: Vec<String> = (0..argc).map(|_| operand_field(&mut at)).collect();
                let _ = writeln!(out, "call f{func_id} {ret} <- ({})", args.join(", "));
            }
            Opcode::Jump => {
                let target = u32_field(&mut at);
                let _ = writeln!(out, "jump {target}");
            }
            Opcode::JumpIf => {
                let cond = operand_field(&mut at);
                let invert = code[at] != 0;
                at += 1;
                let target = u32_field(&mut at);
                let word = if invert { "jumpifnot" } else { "jumpif" };
                let _ = writeln!(out, "{word} {cond} {target}");
            }
            Opcode::PushCatchGuard => {
                let region = u32_field(&mut at);
                let _ = writeln!(out, "pushguard r{region}");
            }
            Opcode::PopCatchGuard => {
                let region = u32_field(&mut at);
                let _ = writeln!(out, "popguard r{region}");
            }
            Opcode::MakeClosure => {
                let func_id = u32_field(&mut at);
                let dst = operand_field(&mut at);
                let _ = writeln!(out, "makeclosure {dst} <- f{func_id}");
            }
            Opcode::Throw => {
                let ty = u32_field(&mut at);
                let src = operand_field(&mut at);
                let _ = writeln!(out, "throw.{} {src}", ty_name(ty));
            }
            Opcode::Yield => {
                let _ = writeln!(out, "yield");
            }
            Opcode::Return => {
                let _ = writeln!(out, "ret");
            }
        }
    }
    out
}
