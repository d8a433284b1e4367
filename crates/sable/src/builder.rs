//! The function builder and module assembly.
//!
//! A construct compiler drives one [`Builder`] per function: declare
//! parameters and locals, emit instructions, and let the builder track what
//! the stream itself cannot express - scope nesting, label definitions,
//! catch regions, statement temporaries. [`Builder::finish`] then validates
//! the stream, runs the control-flow fixup pass, allocates the frame and
//! packs the result.
//!
//! [`ModuleBuilder`] owns the cross-function state: the type registry, the
//! global and file tables, and the function declarations that make forward
//! calls possible before their bodies exist.

use ahash::AHashMap;

use crate::alloc::{allocate_frame, UNALLOCATED};
use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::fixup;
use crate::function::{GlobalDef, Module, PackedFunction, PackedLiteral, ParamSlot};
use crate::instr::{
    CatchClause, FuncId, GlobalId, Instr, InstrKind, LabelId, LiteralId, Operand, VarId,
};
use crate::pack::{pack, PackInput};
use crate::pos::{FileId, SourcePos};
use crate::types::{TypeId, TypeRegistry};

/// Label step value meaning "not yet defined".
const UNDEFINED_LABEL: u32 = u32::MAX;

/// One declared variable of a compilation.
///
/// `start`/`end` are step indices into the instruction stream: the variable's
/// storage is live at step `s` iff `start <= s < end`. For locals, `start` is
/// the index of the `Init` instruction and `end` is one past the `Destruct`
/// (or one past the last instruction of its scope for callback-free types).
#[derive(Debug, Clone)]
pub(crate) struct Variable {
    pub ty: TypeId,
    pub start: u32,
    pub end: u32,
    pub is_param: bool,
    /// `Some((container, sub_offset))` for views into another variable's
    /// storage; aliases own no storage of their own.
    pub alias: Option<(VarId, u32)>,
    /// Frame byte offset, assigned by the allocator.
    pub offset: u32,
}

/// One catch region of a compilation: the guarded step span plus its
/// clauses. `[start, end)` covers the `PushCatchGuard` up to one past the
/// `PopCatchGuard`.
#[derive(Debug, Clone)]
pub(crate) struct RegionSpan {
    pub start: u32,
    pub end: u32,
    pub clauses: Vec<CatchClause>,
    pub pos: SourcePos,
}

/// Builds one function's instruction stream.
pub struct Builder<'m> {
    module: &'m ModuleBuilder,
    name: String,
    pos: SourcePos,
    instrs: Vec<Instr>,
    vars: Vec<Variable>,
    labels: Vec<u32>,
    /// Declared-variable lists, innermost scope last. The root scope is
    /// opened by `new` and closed by `finish`.
    scopes: Vec<Vec<VarId>>,
    /// Statement-temporary lists, separate from scopes so a statement can
    /// release its temporaries without disturbing block structure.
    temps: Vec<Vec<VarId>>,
    /// Named label stacks for break/continue-style jumps; each binding
    /// remembers the scope depth it was made at so popping the scope
    /// unbinds it.
    scoped_labels: AHashMap<String, Vec<(usize, LabelId)>>,
    regions: Vec<RegionSpan>,
    open_regions: Vec<u32>,
    literals: Vec<PackedLiteral>,
    ret: Option<VarId>,
}

impl<'m> Builder<'m> {
    #[must_use]
    pub fn new(module: &'m ModuleBuilder, name: impl Into<String>) -> Self {
        Self {
            module,
            name: name.into(),
            pos: SourcePos::synthetic(),
            instrs: Vec::new(),
            vars: Vec::new(),
            labels: Vec::new(),
            scopes: vec![Vec::new()],
            temps: Vec::new(),
            scoped_labels: AHashMap::new(),
            regions: Vec::new(),
            open_regions: Vec::new(),
            literals: Vec::new(),
            ret: None,
        }
    }

    /// Source position attached to subsequently emitted instructions.
    pub fn set_pos(&mut self, pos: SourcePos) {
        self.pos = pos;
    }

    fn err(&self, kind: CompileErrorKind) -> CompileError {
        CompileError::new(kind, self.pos)
    }

    fn check_type(&self, ty: TypeId) -> CompileResult<()> {
        if self.module.types.contains(ty) {
            Ok(())
        } else {
            Err(self.err(CompileErrorKind::UnknownType(ty)))
        }
    }

    fn add_var(&mut self, ty: TypeId, start: u32, is_param: bool, alias: Option<(VarId, u32)>) -> VarId {
        let id = VarId(u32::try_from(self.vars.len()).expect("variable table overflow"));
        self.vars.push(Variable {
            ty,
            start,
            end: u32::MAX,
            is_param,
            alias,
            offset: UNALLOCATED,
        });
        id
    }

    /// Declares the return slot. At most one per function; conventionally
    /// declared before the parameters so it lands at frame offset zero.
    pub fn declare_return(&mut self, ty: TypeId) -> CompileResult<VarId> {
        self.check_type(ty)?;
        debug_assert!(self.ret.is_none(), "return slot declared twice");
        let id = self.add_var(ty, 0, true, None);
        self.ret = Some(id);
        Ok(id)
    }

    /// Declares a parameter. Parameters receive fixed frame offsets in
    /// declaration order; the caller fills them before the frame runs and
    /// the executor destructs them when the frame pops.
    pub fn declare_param(&mut self, ty: TypeId) -> CompileResult<VarId> {
        self.check_type(ty)?;
        Ok(self.add_var(ty, 0, true, None))
    }

    /// Declares a local in the current scope and emits its `Init`.
    /// Its storage dies when the scope pops.
    pub fn declare_local(&mut self, ty: TypeId) -> CompileResult<VarId> {
        self.check_type(ty)?;
        let start = self.instrs.len() as u32;
        let id = self.add_var(ty, start, false, None);
        self.scopes.last_mut().expect("root scope is always open").push(id);
        self.emit(InstrKind::Init { var: id });
        Ok(id)
    }

    /// Declares a temporary in the current temporary set (see
    /// [`Builder::push_temps`]).
    pub fn declare_temp(&mut self, ty: TypeId) -> CompileResult<VarId> {
        self.check_type(ty)?;
        if self.temps.is_empty() {
            return Err(self.err(CompileErrorKind::ScopeUnderflow));
        }
        let start = self.instrs.len() as u32;
        let id = self.add_var(ty, start, false, None);
        self.temps.last_mut().expect("checked above").push(id);
        self.emit(InstrKind::Init { var: id });
        Ok(id)
    }

    /// Declares a typed view into `sub_offset` bytes of `container`'s
    /// storage. The alias shares the container's frame bytes; the allocator
    /// resolves it after placement and the fixup pass never touches either.
    pub fn declare_alias(
        &mut self,
        container: VarId,
        sub_offset: u32,
        ty: TypeId,
    ) -> CompileResult<VarId> {
        self.check_type(ty)?;
        let Some(cont) = self.vars.get(container.0 as usize) else {
            return Err(self.err(CompileErrorKind::UnknownVar(container)));
        };
        if cont.alias.is_some() {
            return Err(self.err(CompileErrorKind::AliasOfAlias(container)));
        }
        let cont_size = self.module.types.get(cont.ty).size();
        let size = self.module.types.get(ty).size();
        match sub_offset.checked_add(size) {
            Some(end) if end <= cont_size => {}
            _ => return Err(self.err(CompileErrorKind::AliasOutOfRange(container))),
        }
        let start = self.instrs.len() as u32;
        let id = self.add_var(ty, start, false, Some((container, sub_offset)));
        self.scopes.last_mut().expect("root scope is always open").push(id);
        Ok(id)
    }

    /// Creates an undefined label to be defined later with
    /// [`Builder::define_label`].
    #[must_use]
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(u32::try_from(self.labels.len()).expect("label table overflow"));
        self.labels.push(UNDEFINED_LABEL);
        id
    }

    /// Pins `label` to the next emitted instruction.
    pub fn define_label(&mut self, label: LabelId) -> CompileResult<()> {
        let Some(slot) = self.labels.get_mut(label.0 as usize) else {
            return Err(self.err(CompileErrorKind::UnknownLabel(label)));
        };
        if *slot != UNDEFINED_LABEL {
            return Err(self.err(CompileErrorKind::DuplicateLabel(label)));
        }
        *slot = self.instrs.len() as u32;
        Ok(())
    }

    /// Binds `label` under `name` for the duration of the current scope.
    /// Inner bindings shadow outer ones; popping the scope unbinds.
    pub fn bind_scoped_label(&mut self, name: &str, label: LabelId) {
        let depth = self.scopes.len();
        self.scoped_labels
            .entry(name.to_owned())
            .or_default()
            .push((depth, label));
    }

    /// Resolves the innermost binding of `name`.
    pub fn scoped_label(&self, name: &str) -> CompileResult<LabelId> {
        self.scoped_labels
            .get(name)
            .and_then(|stack| stack.last())
            .map(|&(_, label)| label)
            .ok_or_else(|| self.err(CompileErrorKind::UnboundScopedLabel(name.to_owned())))
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Closes the current scope: emits destructs for its variables in
    /// reverse declaration order, ends their intervals and drops any scoped
    /// label bindings made inside it.
    pub fn pop_scope(&mut self) -> CompileResult<()> {
        if self.scopes.len() <= 1 {
            return Err(self.err(CompileErrorKind::ScopeUnderflow));
        }
        let closing = self.scopes.pop().expect("checked above");
        self.close_var_set(closing);
        let depth = self.scopes.len();
        for stack in self.scoped_labels.values_mut() {
            stack.retain(|&(level, _)| level <= depth);
        }
        Ok(())
    }

    /// Opens a temporary set; see [`Builder::declare_temp`].
    pub fn push_temps(&mut self) {
        self.temps.push(Vec::new());
    }

    /// Releases the current temporary set in reverse declaration order.
    pub fn pop_temps(&mut self) -> CompileResult<()> {
        let Some(closing) = self.temps.pop() else {
            return Err(self.err(CompileErrorKind::ScopeUnderflow));
        };
        self.close_var_set(closing);
        Ok(())
    }

    fn close_var_set(&mut self, vars: Vec<VarId>) {
        for id in vars.into_iter().rev() {
            let v = &self.vars[id.0 as usize];
            let destruct = v.alias.is_none() && self.module.types.get(v.ty).has_destruct();
            if destruct {
                self.emit(InstrKind::Destruct { var: id });
            }
            self.vars[id.0 as usize].end = self.instrs.len() as u32;
        }
    }

    /// Opens a catch region guarding everything emitted until
    /// [`Builder::close_catch`]. Clause order is match order; a wildcard
    /// (`ty: None`) must come last.
    pub fn open_catch(&mut self, clauses: Vec<CatchClause>) -> CompileResult<u32> {
        if clauses.is_empty() {
            return Err(self.err(CompileErrorKind::EmptyCatch));
        }
        for (i, clause) in clauses.iter().enumerate() {
            match clause.ty {
                Some(ty) => self.check_type(ty)?,
                None if i + 1 != clauses.len() => {
                    return Err(self.err(CompileErrorKind::WildcardNotLast));
                }
                None => {}
            }
            if clause.target.0 as usize >= self.labels.len() {
                return Err(self.err(CompileErrorKind::UnknownLabel(clause.target)));
            }
            if let Some(landing) = clause.landing {
                if landing.0 as usize >= self.vars.len() {
                    return Err(self.err(CompileErrorKind::UnknownVar(landing)));
                }
            }
        }
        let region = self.regions.len() as u32;
        self.regions.push(RegionSpan {
            start: self.instrs.len() as u32,
            end: u32::MAX,
            clauses,
            pos: self.pos,
        });
        self.emit(InstrKind::PushCatchGuard { region });
        self.open_regions.push(region);
        Ok(region)
    }

    /// Closes the innermost open catch region.
    pub fn close_catch(&mut self) -> CompileResult<()> {
        let Some(region) = self.open_regions.pop() else {
            return Err(self.err(CompileErrorKind::RegionUnderflow));
        };
        self.emit(InstrKind::PopCatchGuard { region });
        self.regions[region as usize].end = self.instrs.len() as u32;
        Ok(())
    }

    /// Embeds a read-only value in the function's literal pool.
    pub fn literal(&mut self, ty: TypeId, bytes: &[u8]) -> CompileResult<LiteralId> {
        self.check_type(ty)?;
        let expected = self.module.types.get(ty).size();
        if bytes.len() as u32 != expected {
            return Err(self.err(CompileErrorKind::LiteralSizeMismatch {
                expected,
                got: bytes.len() as u32,
            }));
        }
        let id = LiteralId(self.literals.len() as u32);
        self.literals.push(PackedLiteral {
            ty,
            bytes: bytes.to_vec(),
        });
        Ok(id)
    }

    /// Appends an instruction at the current source position.
    pub fn emit(&mut self, kind: InstrKind) {
        self.instrs.push(Instr::new(kind, self.pos));
    }

    pub fn assign(&mut self, dst: Operand, src: Operand, ty: TypeId) {
        self.emit(InstrKind::Assign { dst, src, ty });
    }

    pub fn jump(&mut self, target: LabelId) {
        self.emit(InstrKind::Jump { target });
    }

    pub fn jump_if(&mut self, cond: Operand, invert: bool, target: LabelId) {
        self.emit(InstrKind::JumpIf {
            cond,
            invert,
            target,
        });
    }

    pub fn call(&mut self, func: FuncId, args: Vec<Operand>, ret: Option<Operand>) {
        self.emit(InstrKind::Call { func, args, ret });
    }

    pub fn throw(&mut self, src: Operand, ty: TypeId) {
        self.emit(InstrKind::Throw { src, ty });
    }

    pub fn ret(&mut self) {
        self.emit(InstrKind::Return);
    }

    /// Validates, fixes up, allocates and packs the function.
    pub fn finish(mut self) -> CompileResult<PackedFunction> {
        if !self.open_regions.is_empty() {
            return Err(self.err(CompileErrorKind::UnclosedRegion));
        }
        if !self.temps.is_empty() || self.scopes.len() != 1 {
            return Err(self.err(CompileErrorKind::UnclosedScope));
        }
        let root = self.scopes.pop().expect("root scope");
        self.close_var_set(root);
        if !matches!(self.instrs.last().map(|i| &i.kind), Some(InstrKind::Return)) {
            self.instrs.push(Instr::new(InstrKind::Return, SourcePos::synthetic()));
        }

        self.validate()?;

        fixup::run(
            &mut self.instrs,
            &mut self.vars,
            &mut self.labels,
            &mut self.regions,
            &self.module.types,
        );
        let frame_size = allocate_frame(&mut self.vars, &self.module.types);

        let ret = self.ret.map(|id| {
            let v = &self.vars[id.0 as usize];
            ParamSlot {
                offset: v.offset,
                ty: v.ty,
            }
        });
        let params = self
            .vars
            .iter()
            .enumerate()
            .filter(|&(i, v)| v.is_param && self.ret != Some(VarId(i as u32)))
            .map(|(_, v)| ParamSlot {
                offset: v.offset,
                ty: v.ty,
            })
            .collect();

        Ok(pack(PackInput {
            name: &self.name,
            instrs: &self.instrs,
            vars: &self.vars,
            labels: &self.labels,
            regions: &self.regions,
            literals: self.literals,
            frame_size,
            params,
            ret,
            types: &self.module.types,
        }))
    }

    fn check_var(&self, var: VarId, pos: SourcePos) -> CompileResult<()> {
        if (var.0 as usize) < self.vars.len() {
            Ok(())
        } else {
            Err(CompileError::new(CompileErrorKind::UnknownVar(var), pos))
        }
    }

    fn check_operand(&self, op: &Operand, pos: SourcePos) -> CompileResult<()> {
        match op {
            Operand::Slot(v) | Operand::Deref { base: v, .. } => self.check_var(*v, pos),
            Operand::Global { global, .. } => {
                if (global.0 as usize) < self.module.globals.len() {
                    Ok(())
                } else {
                    Err(CompileError::new(
                        CompileErrorKind::UnknownGlobal(*global),
                        pos,
                    ))
                }
            }
            Operand::Literal(lit) => {
                if (lit.0 as usize) < self.literals.len() {
                    Ok(())
                } else {
                    Err(CompileError::new(
                        CompileErrorKind::UnknownLiteral(*lit),
                        pos,
                    ))
                }
            }
        }
    }

    fn check_label(&self, label: LabelId, pos: SourcePos) -> CompileResult<()> {
        match self.labels.get(label.0 as usize) {
            None => Err(CompileError::new(CompileErrorKind::UnknownLabel(label), pos)),
            Some(&UNDEFINED_LABEL) => Err(CompileError::new(
                CompileErrorKind::UndefinedLabel(label),
                pos,
            )),
            Some(_) => Ok(()),
        }
    }

    fn check_ty_at(&self, ty: TypeId, pos: SourcePos) -> CompileResult<()> {
        if self.module.types.contains(ty) {
            Ok(())
        } else {
            Err(CompileError::new(CompileErrorKind::UnknownType(ty), pos))
        }
    }

    fn validate(&self) -> CompileResult<()> {
        for instr in &self.instrs {
            let pos = instr.pos;
            match &instr.kind {
                InstrKind::Assign { dst, src, ty } => {
                    self.check_ty_at(*ty, pos)?;
                    self.check_operand(dst, pos)?;
                    self.check_operand(src, pos)?;
                }
                InstrKind::Index {
                    dst,
                    base,
                    index,
                    elem,
                } => {
                    self.check_ty_at(*elem, pos)?;
                    self.check_operand(dst, pos)?;
                    self.check_operand(base, pos)?;
                    self.check_operand(index, pos)?;
                }
                InstrKind::NewContainer { dst, ty } => {
                    self.check_ty_at(*ty, pos)?;
                    self.check_operand(dst, pos)?;
                }
                InstrKind::Init { var } | InstrKind::Destruct { var } => {
                    self.check_var(*var, pos)?;
                }
                InstrKind::Call { func, args, ret } => {
                    if (func.0 as usize) >= self.module.funcs.len() {
                        return Err(CompileError::new(
                            CompileErrorKind::UnknownFunction(*func),
                            pos,
                        ));
                    }
                    for arg in args {
                        self.check_operand(arg, pos)?;
                    }
                    if let Some(ret) = ret {
                        self.check_operand(ret, pos)?;
                    }
                }
                InstrKind::Jump { target } => self.check_label(*target, pos)?,
                InstrKind::JumpIf { cond, target, .. } => {
                    self.check_operand(cond, pos)?;
                    self.check_label(*target, pos)?;
                }
                InstrKind::MakeClosure { dst, func } => {
                    if (func.0 as usize) >= self.module.funcs.len() {
                        return Err(CompileError::new(
                            CompileErrorKind::UnknownFunction(*func),
                            pos,
                        ));
                    }
                    self.check_operand(dst, pos)?;
                }
                InstrKind::Throw { src, ty } => {
                    self.check_ty_at(*ty, pos)?;
                    self.check_operand(src, pos)?;
                }
                InstrKind::PushCatchGuard { .. }
                | InstrKind::PopCatchGuard { .. }
                | InstrKind::Yield
                | InstrKind::Return => {}
            }
        }
        for region in &self.regions {
            for clause in &region.clauses {
                self.check_label(clause.target, region.pos)?;
            }
        }
        // Every created label must be defined, targeted or not; an
        // undefined leftover means the construct compiler lost track of a
        // control-flow edge.
        for (i, &step) in self.labels.iter().enumerate() {
            if step == UNDEFINED_LABEL {
                return Err(self.err(CompileErrorKind::UndefinedLabel(LabelId(i as u32))));
            }
        }
        Ok(())
    }
}

/// Collects declarations and compiled functions into a [`Module`].
pub struct ModuleBuilder {
    types: TypeRegistry,
    files: Vec<String>,
    globals: Vec<GlobalDef>,
    funcs: Vec<Option<PackedFunction>>,
    func_names: Vec<String>,
}

impl ModuleBuilder {
    #[must_use]
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            types,
            files: Vec::new(),
            globals: Vec::new(),
            funcs: Vec::new(),
            func_names: Vec::new(),
        }
    }

    #[must_use]
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Registers a source file name for debug positions.
    pub fn add_file(&mut self, name: impl Into<String>) -> FileId {
        let id = FileId(u16::try_from(self.files.len()).expect("file table overflow"));
        self.files.push(name.into());
        id
    }

    /// Declares a module-level global storage slot.
    pub fn declare_global(&mut self, ty: TypeId) -> CompileResult<GlobalId> {
        if !self.types.contains(ty) {
            return Err(CompileError::new(
                CompileErrorKind::UnknownType(ty),
                SourcePos::synthetic(),
            ));
        }
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalDef { ty });
        Ok(id)
    }

    /// Declares a function slot, making its id callable before the body is
    /// compiled.
    pub fn declare_function(&mut self, name: impl Into<String>) -> FuncId {
        let id = FuncId(u32::try_from(self.funcs.len()).expect("function table overflow"));
        self.funcs.push(None);
        self.func_names.push(name.into());
        id
    }

    /// Name a function slot was declared under.
    #[must_use]
    pub fn function_name(&self, id: FuncId) -> Option<&str> {
        self.func_names.get(id.0 as usize).map(String::as_str)
    }

    /// Installs a compiled body into a declared slot.
    pub fn define_function(&mut self, id: FuncId, func: PackedFunction) -> CompileResult<()> {
        let pos = SourcePos::synthetic();
        let Some(slot) = self.funcs.get_mut(id.0 as usize) else {
            return Err(CompileError::new(CompileErrorKind::UnknownFunction(id), pos));
        };
        if slot.is_some() {
            return Err(CompileError::new(
                CompileErrorKind::FunctionRedefined(id),
                pos,
            ));
        }
        *slot = Some(func);
        Ok(())
    }

    /// Seals the module. Every declared function must have a body.
    pub fn finish(self) -> CompileResult<Module> {
        let mut funcs = Vec::with_capacity(self.funcs.len());
        for (i, slot) in self.funcs.into_iter().enumerate() {
            match slot {
                Some(func) => funcs.push(func),
                None => {
                    return Err(CompileError::new(
                        CompileErrorKind::FunctionUndefined(FuncId(i as u32)),
                        SourcePos::synthetic(),
                    ));
                }
            }
        }
        Ok(Module::assemble(self.types, funcs, self.globals, self.files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{disassemble, Opcode};
    use crate::types::{Scalar, ValueType};

    struct Managed;

    impl ValueType for Managed {
        fn name(&self) -> &str {
            "managed"
        }
        fn size(&self) -> u32 {
            8
        }
        fn has_init(&self) -> bool {
            true
        }
        fn has_destruct(&self) -> bool {
            true
        }
    }

    fn module_builder() -> (ModuleBuilder, TypeId, TypeId) {
        let mut types = TypeRegistry::new();
        let int = types.register(Scalar::new("i64", 8));
        let managed = types.register(Managed);
        (ModuleBuilder::new(types), int, managed)
    }

    #[test]
    fn duplicate_label_definition_is_rejected() {
        let (mb, _, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let l = b.new_label();
        b.define_label(l).unwrap();
        let err = b.define_label(l).unwrap_err();
        assert_eq!(err.kind(), &CompileErrorKind::DuplicateLabel(l));
    }

    #[test]
    fn jump_to_undefined_label_fails_at_finish() {
        let (mb, _, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let l = b.new_label();
        b.jump(l);
        let err = b.finish().unwrap_err();
        assert_eq!(err.kind(), &CompileErrorKind::UndefinedLabel(l));
    }

    #[test]
    fn untargeted_undefined_label_fails_at_finish() {
        let (mb, _, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        // Created, never defined, never jumped to.
        let l = b.new_label();
        let err = b.finish().unwrap_err();
        assert_eq!(err.kind(), &CompileErrorKind::UndefinedLabel(l));
    }

    #[test]
    fn finish_appends_implicit_return() {
        let (mb, int, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let v = b.declare_local(int).unwrap();
        let w = b.declare_local(int).unwrap();
        b.assign(Operand::Slot(v), Operand::Slot(w), int);
        let packed = b.finish().unwrap();
        assert_eq!(*packed.code().last().unwrap(), Opcode::Return as u8);
    }

    #[test]
    fn scope_pop_destructs_in_reverse_order() {
        let (mb, _, managed) = module_builder();
        let mut b = Builder::new(&mb, "f");
        b.push_scope();
        let first = b.declare_local(managed).unwrap();
        let second = b.declare_local(managed).unwrap();
        b.pop_scope().unwrap();
        // Stream: init first, init second, destruct second, destruct first.
        assert!(matches!(b.instrs[2].kind, InstrKind::Destruct { var } if var == second));
        assert!(matches!(b.instrs[3].kind, InstrKind::Destruct { var } if var == first));
        // Intervals follow the convention: end is one past the destruct.
        assert_eq!(b.vars[second.0 as usize].start, 1);
        assert_eq!(b.vars[second.0 as usize].end, 3);
        assert_eq!(b.vars[first.0 as usize].end, 4);
    }

    #[test]
    fn temps_release_independently_of_scopes() {
        let (mb, _, managed) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let outer = b.declare_local(managed).unwrap();
        b.push_temps();
        let tmp = b.declare_temp(managed).unwrap();
        b.pop_temps().unwrap();
        assert!(matches!(b.instrs[2].kind, InstrKind::Destruct { var } if var == tmp));
        assert_eq!(b.vars[outer.0 as usize].end, u32::MAX, "outer still open");
    }

    #[test]
    fn temp_without_open_set_is_rejected() {
        let (mb, int, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let err = b.declare_temp(int).unwrap_err();
        assert_eq!(err.kind(), &CompileErrorKind::ScopeUnderflow);
    }

    #[test]
    fn scoped_labels_shadow_and_unbind_with_scope() {
        let (mb, _, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let outer = b.new_label();
        b.bind_scoped_label("break", outer);
        b.push_scope();
        let inner = b.new_label();
        b.bind_scoped_label("break", inner);
        assert_eq!(b.scoped_label("break").unwrap(), inner);
        b.pop_scope().unwrap();
        assert_eq!(b.scoped_label("break").unwrap(), outer);
        assert!(matches!(
            b.scoped_label("continue").unwrap_err().kind(),
            CompileErrorKind::UnboundScopedLabel(_)
        ));
    }

    #[test]
    fn wildcard_clause_must_be_last() {
        let (mb, int, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let handler = b.new_label();
        let err = b
            .open_catch(vec![
                CatchClause {
                    ty: None,
                    target: handler,
                    landing: None,
                },
                CatchClause {
                    ty: Some(int),
                    target: handler,
                    landing: None,
                },
            ])
            .unwrap_err();
        assert_eq!(err.kind(), &CompileErrorKind::WildcardNotLast);
    }

    #[test]
    fn unclosed_region_fails_at_finish() {
        let (mb, int, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let handler = b.new_label();
        b.open_catch(vec![CatchClause {
            ty: Some(int),
            target: handler,
            landing: None,
        }])
        .unwrap();
        let err = b.finish().unwrap_err();
        assert_eq!(err.kind(), &CompileErrorKind::UnclosedRegion);
    }

    #[test]
    fn literal_size_must_match_type() {
        let (mb, int, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        let err = b.literal(int, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err.kind(),
            &CompileErrorKind::LiteralSizeMismatch {
                expected: 8,
                got: 3
            }
        );
    }

    #[test]
    fn return_and_params_get_front_offsets() {
        let (mb, int, _) = module_builder();
        let mut b = Builder::new(&mb, "f");
        b.declare_return(int).unwrap();
        b.declare_param(int).unwrap();
        b.declare_param(int).unwrap();
        let packed = b.finish().unwrap();
        let ret = packed.ret().unwrap();
        assert_eq!(ret.offset, 0);
        assert_eq!(packed.params().len(), 2);
        assert_eq!(packed.params()[0].offset, 8);
        assert_eq!(packed.params()[1].offset, 16);
        assert_eq!(packed.frame_size(), 24);
    }

    #[test]
    fn module_finish_requires_all_bodies() {
        let (mut mb, _, _) = module_builder();
        let f = mb.declare_function("f");
        let _g = mb.declare_function("g");
        let body = Builder::new(&mb, "f").finish().unwrap();
        mb.define_function(f, body).unwrap();
        let err = mb.finish().unwrap_err();
        assert!(matches!(
            err.kind(),
            CompileErrorKind::FunctionUndefined(id) if id.0 == 1
        ));
    }

    #[test]
    fn disassembly_of_built_function_is_coherent() {
        let (mb, int, managed) = module_builder();
        let mut b = Builder::new(&mb, "demo");
        let v = b.declare_local(managed).unwrap();
        let lit = b.literal(int, &42i64.to_le_bytes()).unwrap();
        let w = b.declare_local(int).unwrap();
        b.assign(Operand::Slot(w), Operand::Literal(lit), int);
        let _ = v;
        let packed = b.finish().unwrap();
        let text = disassemble(&packed, mb.types());
        assert!(text.contains("init.managed"));
        assert!(text.contains("destruct.managed"));
        assert!(text.contains("lit0"));
        assert!(text.contains("ret"));
    }
}
