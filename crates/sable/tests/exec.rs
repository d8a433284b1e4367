//! End-to-end tests: build modules through the public API, execute them on a
//! thread, and audit value lifecycles with a counting type.

use std::cell::Cell;
use std::rc::Rc;

use sable::{
    Builder, CatchClause, ExecError, FuncId, InstrKind, Module, ModuleBuilder, Operand, Scalar,
    Status, Thread, TypeId, TypeRegistry, ValueType,
};

/// A managed 8-byte type that counts live values. Every init/init_assign
/// bumps the counter, every destruct drops it; a balanced program ends at
/// zero no matter how it terminated.
struct Counted {
    live: Rc<Cell<i32>>,
}

impl ValueType for Counted {
    fn name(&self) -> &str {
        "counted"
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
    fn init(&self, mem: &mut [u8]) {
        mem.fill(0);
        self.live.set(self.live.get() + 1);
    }
    fn init_assign(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
        self.live.set(self.live.get() + 1);
    }
    fn destruct(&self, _mem: &mut [u8]) {
        self.live.set(self.live.get() - 1);
    }
}

struct Setup {
    types: TypeRegistry,
    int: TypeId,
    counted: TypeId,
    live: Rc<Cell<i32>>,
}

fn setup() -> Setup {
    let live = Rc::new(Cell::new(0));
    let mut types = TypeRegistry::new();
    let int = types.register(Scalar::new("i64", 8));
    let counted = types.register(Counted { live: live.clone() });
    Setup {
        types,
        int,
        counted,
        live,
    }
}

#[test]
fn managed_values_balance_across_calls() {
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let leaf = mb.declare_function("leaf");
    let main = mb.declare_function("main");

    // leaf(p: counted) -> counted { let l; yield; return l }
    let mut b = Builder::new(&mb, "leaf");
    let ret = b.declare_return(s.counted).unwrap();
    let _p = b.declare_param(s.counted).unwrap();
    let l = b.declare_local(s.counted).unwrap();
    b.emit(InstrKind::Yield);
    b.assign(Operand::Slot(ret), Operand::Slot(l), s.counted);
    mb.define_function(leaf, b.finish().unwrap()).unwrap();

    // main() { let a; let b = leaf(a); }
    let mut b = Builder::new(&mb, "main");
    let a = b.declare_local(s.counted).unwrap();
    let out = b.declare_local(s.counted).unwrap();
    b.call(leaf, vec![Operand::Slot(a)], Some(Operand::Slot(out)));
    mb.define_function(main, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(main).unwrap();
    assert_eq!(t.run().unwrap(), Status::Yielded);
    // Live at the yield: a, out, leaf's param, ret slot and local.
    assert_eq!(s.live.get(), 5);
    assert_eq!(t.run().unwrap(), Status::Done);
    drop(t);
    assert_eq!(s.live.get(), 0);
}

#[test]
fn cancel_unwinds_live_values() {
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let f = mb.declare_function("f");
    let mut b = Builder::new(&mb, "f");
    let _v = b.declare_local(s.counted).unwrap();
    b.emit(InstrKind::Yield);
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run().unwrap(), Status::Yielded);
    assert_eq!(s.live.get(), 1);

    t.cancel();
    assert_eq!(t.status(), Status::Cancelled);
    assert_eq!(s.live.get(), 0);
    t.cancel(); // idempotent
    assert_eq!(t.status(), Status::Cancelled);
    assert!(matches!(
        t.run(),
        Err(ExecError::NotRunnable(Status::Cancelled))
    ));
}

#[test]
fn cancel_mid_call_unwinds_every_frame() {
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let leaf = mb.declare_function("leaf");
    let main = mb.declare_function("main");

    let mut b = Builder::new(&mb, "leaf");
    let ret = b.declare_return(s.counted).unwrap();
    let _p = b.declare_param(s.counted).unwrap();
    let l = b.declare_local(s.counted).unwrap();
    b.emit(InstrKind::Yield);
    b.assign(Operand::Slot(ret), Operand::Slot(l), s.counted);
    mb.define_function(leaf, b.finish().unwrap()).unwrap();

    let mut b = Builder::new(&mb, "main");
    let a = b.declare_local(s.counted).unwrap();
    let out = b.declare_local(s.counted).unwrap();
    b.call(leaf, vec![Operand::Slot(a)], Some(Operand::Slot(out)));
    mb.define_function(main, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(main).unwrap();
    assert_eq!(t.run().unwrap(), Status::Yielded);
    assert_eq!(s.live.get(), 5);

    // Two frames live, suspended inside the callee.
    t.cancel();
    assert_eq!(t.status(), Status::Cancelled);
    assert_eq!(s.live.get(), 0, "both frames' values destructed exactly once");
    t.cancel();
    assert_eq!(s.live.get(), 0);
}

#[test]
fn cancel_paused_after_a_destruct_does_not_destruct_twice() {
    // f: { let v: counted; } yield
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let f = mb.declare_function("f");
    let mut b = Builder::new(&mb, "f");
    b.push_scope();
    let _v = b.declare_local(s.counted).unwrap();
    b.pop_scope().unwrap();
    b.emit(InstrKind::Yield);
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    // Paused with the value's destruct already executed: cancel must not
    // run the destructor again.
    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run_bounded(2).unwrap(), Status::Yielded);
    assert_eq!(s.live.get(), 0);
    t.cancel();
    assert_eq!(t.status(), Status::Cancelled);
    assert_eq!(s.live.get(), 0, "destructor must not run a second time");
    drop(t);
    assert_eq!(s.live.get(), 0);

    // Paused with the destruct still pending: cancel runs it exactly once.
    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run_bounded(1).unwrap(), Status::Yielded);
    assert_eq!(s.live.get(), 1);
    t.cancel();
    assert_eq!(s.live.get(), 0);
}

#[test]
fn uncaught_throw_unwinds_two_frames() {
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let boom = mb.declare_function("boom");
    let main = mb.declare_function("main");

    let mut b = Builder::new(&mb, "boom");
    let v = b.declare_local(s.counted).unwrap();
    b.throw(Operand::Slot(v), s.counted);
    mb.define_function(boom, b.finish().unwrap()).unwrap();

    let mut b = Builder::new(&mb, "main");
    let _w = b.declare_local(s.counted).unwrap();
    b.call(boom, vec![], None);
    mb.define_function(main, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(main).unwrap();
    assert_eq!(t.run().unwrap(), Status::Threw);
    assert_eq!(t.thrown_type(), Some(s.counted));
    // Every frame value is gone; only the thrown value itself survives.
    assert_eq!(s.live.get(), 1);

    let trace = t.backtrace();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].name, "main");
    assert_eq!(trace[1].name, "boom");

    drop(t);
    assert_eq!(s.live.get(), 0);
}

#[test]
fn caller_catches_callee_throw() {
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let boom = mb.declare_function("boom");
    let main = mb.declare_function("main");

    // boom holds a managed local live across the throw site.
    let mut b = Builder::new(&mb, "boom");
    let _v = b.declare_local(s.counted).unwrap();
    let lit = b.literal(s.int, &17i64.to_le_bytes()).unwrap();
    b.throw(Operand::Literal(lit), s.int);
    mb.define_function(boom, b.finish().unwrap()).unwrap();

    let mut b = Builder::new(&mb, "main");
    let ret = b.declare_return(s.int).unwrap();
    let land = b.declare_local(s.int).unwrap();
    let handler = b.new_label();
    let done = b.new_label();
    b.open_catch(vec![CatchClause {
        ty: Some(s.int),
        target: handler,
        landing: Some(land),
    }])
    .unwrap();
    b.call(boom, vec![], None);
    b.close_catch().unwrap();
    b.jump(done);
    b.define_label(handler).unwrap();
    b.assign(Operand::Slot(ret), Operand::Slot(land), s.int);
    b.define_label(done).unwrap();
    mb.define_function(main, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(main).unwrap();
    assert_eq!(t.run().unwrap(), Status::Done);
    assert_eq!(t.take_return().unwrap(), 17i64.to_le_bytes());
    // boom's local was destructed while its frame unwound.
    assert_eq!(s.live.get(), 0);
}

#[test]
fn jump_out_of_region_disarms_its_guard() {
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let f = mb.declare_function("f");
    let mut b = Builder::new(&mb, "f");
    let ret = b.declare_return(s.int).unwrap();
    let handler = b.new_label();
    let after = b.new_label();
    b.open_catch(vec![CatchClause {
        ty: None,
        target: handler,
        landing: None,
    }])
    .unwrap();
    // Break out of the guarded block, skipping its PopCatchGuard.
    b.jump(after);
    b.close_catch().unwrap();
    b.define_label(after).unwrap();
    let lit = b.literal(s.int, &9i64.to_le_bytes()).unwrap();
    b.throw(Operand::Literal(lit), s.int);
    b.define_label(handler).unwrap();
    let one = b.literal(s.int, &1i64.to_le_bytes()).unwrap();
    b.assign(Operand::Slot(ret), Operand::Literal(one), s.int);
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    // The throw happens outside the region, so nothing catches it.
    assert_eq!(t.run().unwrap(), Status::Threw);
    assert_eq!(t.thrown_bytes().unwrap(), 9i64.to_le_bytes());
}

#[test]
fn break_through_nested_loops_pops_the_region_guard() {
    // Two nested loops, each with a managed local; a catch region sits
    // inside the inner body and a break jumps from it past both loops.
    // The break edge must destruct both locals and disarm the guard, so a
    // throw after the loops goes uncaught.
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let f = mb.declare_function("f");
    let mut b = Builder::new(&mb, "f");
    let ret = b.declare_return(s.int).unwrap();
    let flag = b.declare_local(s.int).unwrap();
    let exit = b.new_label();
    let handler = b.new_label();
    let outer_top = b.new_label();
    let inner_top = b.new_label();

    b.define_label(outer_top).unwrap();
    b.push_scope();
    let _o = b.declare_local(s.counted).unwrap();
    b.define_label(inner_top).unwrap();
    b.push_scope();
    let _i = b.declare_local(s.counted).unwrap();
    b.open_catch(vec![CatchClause {
        ty: Some(s.int),
        target: handler,
        landing: None,
    }])
    .unwrap();
    b.jump(exit); // break, taken unconditionally
    b.close_catch().unwrap();
    b.pop_scope().unwrap();
    b.jump_if(Operand::Slot(flag), false, inner_top);
    b.pop_scope().unwrap();
    b.jump_if(Operand::Slot(flag), false, outer_top);

    b.define_label(exit).unwrap();
    let nine = b.literal(s.int, &9i64.to_le_bytes()).unwrap();
    b.throw(Operand::Literal(nine), s.int);
    b.define_label(handler).unwrap();
    let one = b.literal(s.int, &1i64.to_le_bytes()).unwrap();
    b.assign(Operand::Slot(ret), Operand::Literal(one), s.int);
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    // The guard was popped on the break, so the throw finds no handler.
    assert_eq!(t.run().unwrap(), Status::Threw);
    assert_eq!(t.thrown_type(), Some(s.int));
    assert_eq!(t.thrown_bytes().unwrap(), 9i64.to_le_bytes());
    assert_eq!(s.live.get(), 0, "both loop locals destructed on the break");
}

#[test]
fn conditional_loop_counts_down() {
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let f = mb.declare_function("loop");
    // flag: one non-zero byte, flipped to zero by assigning another literal.
    let mut b = Builder::new(&mb, "loop");
    let ret = b.declare_return(s.int).unwrap();
    let flag = b.declare_local(s.int).unwrap();
    let truthy = b.literal(s.int, &1i64.to_le_bytes()).unwrap();
    let falsy = b.literal(s.int, &0i64.to_le_bytes()).unwrap();
    let result = b.literal(s.int, &99i64.to_le_bytes()).unwrap();
    b.assign(Operand::Slot(flag), Operand::Literal(truthy), s.int);
    let top = b.new_label();
    let out = b.new_label();
    b.define_label(top).unwrap();
    // if !flag { goto out }
    b.jump_if(Operand::Slot(flag), true, out);
    b.assign(Operand::Slot(flag), Operand::Literal(falsy), s.int);
    b.jump(top);
    b.define_label(out).unwrap();
    b.assign(Operand::Slot(ret), Operand::Literal(result), s.int);
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run().unwrap(), Status::Done);
    assert_eq!(t.take_return().unwrap(), 99i64.to_le_bytes());
}

#[test]
fn alias_writes_show_through_the_container() {
    let mut types = TypeRegistry::new();
    let wide = types.register(Scalar::new("bytes16", 16));
    let narrow = types.register(Scalar::new("u32", 4));
    let mut mb = ModuleBuilder::new(types);
    let f = mb.declare_function("f");

    let mut b = Builder::new(&mb, "f");
    let ret = b.declare_return(wide).unwrap();
    let container = b.declare_local(wide).unwrap();
    let view = b.declare_alias(container, 8, narrow).unwrap();
    let lit = b.literal(narrow, &0xAABB_CCDDu32.to_le_bytes()).unwrap();
    b.assign(Operand::Slot(view), Operand::Literal(lit), narrow);
    b.assign(Operand::Slot(ret), Operand::Slot(container), wide);
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run().unwrap(), Status::Done);
    let out = t.take_return().unwrap();
    assert_eq!(out[..8], [0u8; 8]);
    assert_eq!(out[8..12], 0xAABB_CCDDu32.to_le_bytes());
    assert_eq!(out[12..], [0u8; 4]);
}

#[test]
fn deref_writes_through_a_global_handle() {
    let mut types = TypeRegistry::new();
    let int = types.register(Scalar::new("i64", 8));
    let handle = types.register(Scalar::new("handle", 4));
    let mut mb = ModuleBuilder::new(types);
    let g = mb.declare_global(int).unwrap();
    let f = mb.declare_function("f");

    let mut b = Builder::new(&mb, "f");
    let h = b.declare_local(handle).unwrap();
    let href = b.literal(handle, &0u32.to_le_bytes()).unwrap();
    let value = b.literal(int, &640i64.to_le_bytes()).unwrap();
    b.assign(Operand::Slot(h), Operand::Literal(href), handle);
    b.assign(
        Operand::Deref { base: h, offset: 0 },
        Operand::Literal(value),
        int,
    );
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run().unwrap(), Status::Done);
    assert_eq!(t.global_bytes(g).unwrap(), 640i64.to_le_bytes());
}

#[test]
fn index_reads_an_element_at_a_runtime_offset() {
    let mut types = TypeRegistry::new();
    let table = types.register(Scalar::new("bytes16", 16));
    let elem = types.register(Scalar::new("u32", 4));
    let mut mb = ModuleBuilder::new(types);
    let f = mb.declare_function("f");

    let mut b = Builder::new(&mb, "f");
    let ret = b.declare_return(elem).unwrap();
    let data: Vec<u8> = [10u32, 11, 12, 13]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let pool = b.literal(table, &data).unwrap();
    let two = b.literal(elem, &2u32.to_le_bytes()).unwrap();
    let idx = b.declare_local(elem).unwrap();
    b.assign(Operand::Slot(idx), Operand::Literal(two), elem);
    b.emit(InstrKind::Index {
        dst: Operand::Slot(ret),
        base: Operand::Literal(pool),
        index: Operand::Slot(idx),
        elem,
    });
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run().unwrap(), Status::Done);
    assert_eq!(t.take_return().unwrap(), 12u32.to_le_bytes());
}

#[test]
fn dumped_module_runs_after_reload() {
    let mut types = TypeRegistry::new();
    let int = types.register(Scalar::new("i64", 8));
    let mut mb = ModuleBuilder::new(types);
    let f = mb.declare_function("answer");
    let mut b = Builder::new(&mb, "answer");
    let ret = b.declare_return(int).unwrap();
    let lit = b.literal(int, &42i64.to_le_bytes()).unwrap();
    b.assign(Operand::Slot(ret), Operand::Literal(lit), int);
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();
    let bytes = module.dump().unwrap();
    drop(module);

    // The loader resolves type ids against a registry rebuilt in the same
    // registration order.
    let mut types = TypeRegistry::new();
    types.register(Scalar::new("i64", 8));
    let loaded = Module::load(&bytes, types).unwrap();
    let id = loaded.find_function("answer").unwrap();
    assert_eq!(id, FuncId(0));

    let mut t = Thread::new(&loaded);
    t.start(id).unwrap();
    assert_eq!(t.run().unwrap(), Status::Done);
    assert_eq!(t.take_return().unwrap(), 42i64.to_le_bytes());
}

#[test]
fn breaking_out_of_a_scope_destructs_its_values() {
    // A conditional break leaves the loop body while its managed local is
    // still live. The fixup pass rewrites that edge, so the value is
    // destructed on the taken branch and stays live otherwise.
    let s = setup();
    let mut mb = ModuleBuilder::new(s.types);
    let f = mb.declare_function("f");
    let mut b = Builder::new(&mb, "f");
    let flag = b.declare_local(s.int).unwrap();
    let truthy = b.literal(s.int, &1i64.to_le_bytes()).unwrap();
    let falsy = b.literal(s.int, &0i64.to_le_bytes()).unwrap();
    b.assign(Operand::Slot(flag), Operand::Literal(truthy), s.int);

    let top = b.new_label();
    let out = b.new_label();
    b.define_label(top).unwrap();
    b.push_scope();
    let _v = b.declare_local(s.counted).unwrap();
    b.emit(InstrKind::Yield);
    // break while _v is live; falls through on the first pass
    b.jump_if(Operand::Slot(flag), true, out);
    b.assign(Operand::Slot(flag), Operand::Literal(falsy), s.int);
    b.pop_scope().unwrap();
    b.jump(top);
    b.define_label(out).unwrap();
    mb.define_function(f, b.finish().unwrap()).unwrap();
    let module = mb.finish().unwrap();

    let mut t = Thread::new(&module);
    t.start(f).unwrap();
    assert_eq!(t.run().unwrap(), Status::Yielded);
    assert_eq!(s.live.get(), 1, "loop-body value live at the yield");
    assert_eq!(t.run().unwrap(), Status::Yielded);
    assert_eq!(s.live.get(), 1, "reinitialized on the second iteration");
    assert_eq!(t.run().unwrap(), Status::Done);
    assert_eq!(s.live.get(), 0, "the break edge destructed the value");
}
