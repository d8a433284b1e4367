//! The execution thread.
//!
//! A [`Thread`] runs packed functions from one [`Module`]: a stack of call
//! frames, the catch-guard stack mirroring the regions execution is inside
//! of, and this thread's own copy of the module's global storage. The
//! module stays immutable and shareable; everything mutable lives here.
//!
//! # Execution model
//!
//! `start` pushes the entry frame, the embedder fills its parameters, and
//! `run`/`run_bounded` steps the dispatch loop until the thread finishes,
//! throws, or suspends. A suspended thread (`Yield` instruction or an
//! exhausted step budget) resumes with another `run` call. `cancel` unwinds
//! every live frame through the same destructor path an uncaught throw
//! takes, so no script value leaks no matter how the thread ends.
//!
//! # Liveness and guards
//!
//! Plain jumps never touch variable lifecycles at run time - the fixup pass
//! already spliced the required `Init`/`Destruct` instructions into the
//! stream. They do resync the catch-guard stack against the packed region
//! table, since a jump out of a region skips its `PopCatchGuard`. Exception
//! redirects are the opposite: the landing ip was never compiled as an edge,
//! so the thread replays the liveness delta from the packed liveness table
//! and resyncs guards before entering the handler.
//!
//! Parameters and the return slot are the thread's responsibility: the
//! caller constructs them when pushing a frame and the thread destructs
//! them when the frame pops, normally or during unwinding.

use std::fmt::Write as _;

use smallvec::SmallVec;

use crate::error::{ExecError, ExecResult};
use crate::fixup::{span_covers, span_entered, span_exited};
use crate::function::{Module, PackedClause, PackedFunction};
use crate::instr::{FuncId, GlobalId};
use crate::pack::{read_operand, Opcode, RawOperand};
use crate::pos::SourcePos;
use crate::types::TypeId;

/// Value scratch buffer; most script values fit inline.
type ValueBuf = SmallVec<[u8; 16]>;

/// Recursion limit; exceeding it faults the thread.
const MAX_CALL_DEPTH: usize = 1024;

/// Externally visible execution state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No execution started yet (or the previous one was fully consumed).
    Idle,
    /// Started and runnable.
    Ready,
    /// Suspended by a `Yield` instruction or an exhausted step budget.
    Yielded,
    /// The entry function returned; the return value is available.
    Done,
    /// An uncaught throw or a fault ended execution.
    Threw,
    /// The embedder cancelled execution; all frames were unwound.
    Cancelled,
}

/// One entry of a thrown-value backtrace, outermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub func: FuncId,
    pub name: String,
    pub pos: Option<SourcePos>,
}

/// What ended a [`Status::Threw`] execution.
enum Thrown {
    /// A script `Throw` nothing caught; the thread owns the value until it
    /// is dropped or the thread restarts.
    Value { ty: TypeId, bytes: Vec<u8> },
    /// A fault: invalid handle, out-of-bounds access, call depth, corrupt
    /// blob. Faults bypass catch guards entirely.
    Fault(String),
}

/// One live call frame.
struct CallFrame {
    func: FuncId,
    /// Blob address of the next record to execute (or, while a callee runs,
    /// of the record after the call).
    ip: u32,
    /// The frame arena, `frame_size` bytes, zeroed at push.
    mem: Box<[u8]>,
    /// Where in the parent frame the return value goes, resolved at call
    /// time. `None` for the entry frame or a discarded return value.
    ret_to: Option<Loc>,
}

/// An active catch guard: region `region` of the function running in frame
/// `frame`. The stack mirrors, innermost last, the regions the thread's
/// current position is inside of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Guard {
    frame: u32,
    region: u32,
}

/// A resolved storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    /// Byte offset into a frame arena.
    Frame(u32),
    /// Byte range inside a global's storage.
    Global { global: u32, offset: u32 },
    /// Byte range inside a function literal (read-only).
    Literal { lit: u32, offset: u32 },
}

impl Loc {
    fn shifted(self, delta: u32) -> Result<Self, String> {
        let bump = |v: u32| {
            v.checked_add(delta)
                .ok_or_else(|| "operand offset overflow".to_owned())
        };
        Ok(match self {
            Loc::Frame(off) => Loc::Frame(bump(off)?),
            Loc::Global { global, offset } => Loc::Global {
                global,
                offset: bump(offset)?,
            },
            Loc::Literal { lit, offset } => Loc::Literal {
                lit,
                offset: bump(offset)?,
            },
        })
    }
}

/// Outcome of one dispatched record (faults travel as `Err(String)`).
enum Flow {
    Continue,
    Yield,
    Throw { ty: TypeId, bytes: ValueBuf },
}

/// Byte-stream cursor over one function's code blob.
struct Cursor<'c> {
    code: &'c [u8],
    at: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Result<u8, String> {
        let b = self
            .code
            .get(self.at)
            .copied()
            .ok_or_else(|| "truncated instruction record".to_owned())?;
        self.at += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, String> {
        let bytes = self
            .code
            .get(self.at..self.at + 4)
            .ok_or_else(|| "truncated instruction record".to_owned())?;
        self.at += 4;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn operand(&mut self) -> Result<RawOperand, String> {
        read_operand(self.code, &mut self.at)
            .ok_or_else(|| "corrupt operand encoding".to_owned())
    }
}

/// An execution thread over one module.
pub struct Thread<'m> {
    module: &'m Module,
    frames: Vec<CallFrame>,
    guards: Vec<Guard>,
    /// This thread's instance of the module globals, initialized at
    /// construction and destructed on drop.
    globals: Vec<Box<[u8]>>,
    status: Status,
    thrown: Option<Thrown>,
    backtrace: Vec<TraceFrame>,
    /// Entry function's return value after [`Status::Done`], until taken.
    result: Option<(TypeId, Vec<u8>)>,
}

impl<'m> Thread<'m> {
    #[must_use]
    pub fn new(module: &'m Module) -> Self {
        let types = module.types();
        let globals = module
            .globals()
            .iter()
            .map(|def| {
                let ty = types.get(def.ty);
                let mut mem = vec![0u8; ty.size() as usize].into_boxed_slice();
                ty.init(&mut mem);
                mem
            })
            .collect();
        Self {
            module,
            frames: Vec::new(),
            guards: Vec::new(),
            globals,
            status: Status::Idle,
            thrown: None,
            backtrace: Vec::new(),
            result: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Prepares execution of `func`. Parameters start zeroed; fill them
    /// with [`Thread::set_arg`] before running. The bytes written become
    /// owned script values: the thread destructs them when the frame pops.
    pub fn start(&mut self, func: FuncId) -> ExecResult<()> {
        if matches!(self.status, Status::Ready | Status::Yielded) {
            return Err(ExecError::Busy(self.status));
        }
        let Some(entry) = self.module.function(func) else {
            return Err(ExecError::UnknownFunction(func));
        };
        debug_assert!(self.frames.is_empty(), "terminal status with live frames");
        self.clear_thrown();
        self.drop_result();
        self.backtrace.clear();

        let mut mem = vec![0u8; entry.frame_size() as usize].into_boxed_slice();
        if let Some(ret) = entry.ret() {
            let ty = self.module.types().get(ret.ty);
            ty.init(&mut mem[ret.offset as usize..][..ty.size() as usize]);
        }
        self.frames.push(CallFrame {
            func,
            ip: 0,
            mem,
            ret_to: None,
        });
        self.status = Status::Ready;
        Ok(())
    }

    /// Writes an entry-function argument. Only valid after `start` and
    /// before the first `run`.
    pub fn set_arg(&mut self, index: u32, bytes: &[u8]) -> ExecResult<()> {
        if self.status != Status::Ready || self.frames.len() != 1 || self.frames[0].ip != 0 {
            return Err(ExecError::NotRunnable(self.status));
        }
        let func = self.module.func(self.frames[0].func);
        let Some(param) = func.params().get(index as usize).copied() else {
            return Err(ExecError::NoSuchParam(index));
        };
        let size = self.module.types().get(param.ty).size();
        if bytes.len() as u32 != size {
            return Err(ExecError::ParamSizeMismatch {
                param: index,
                expected: size,
                got: bytes.len() as u32,
            });
        }
        self.frames[0].mem[param.offset as usize..][..size as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// Runs until the thread finishes, throws, or suspends on a `Yield`.
    pub fn run(&mut self) -> ExecResult<Status> {
        self.run_bounded(u64::MAX)
    }

    /// Runs at most `max_steps` instruction records. An exhausted budget
    /// suspends the thread exactly like a `Yield`.
    pub fn run_bounded(&mut self, mut max_steps: u64) -> ExecResult<Status> {
        match self.status {
            Status::Ready | Status::Yielded => {}
            other => return Err(ExecError::NotRunnable(other)),
        }
        self.status = Status::Ready;
        while !self.frames.is_empty() {
            if max_steps == 0 {
                self.status = Status::Yielded;
                return Ok(Status::Yielded);
            }
            max_steps -= 1;
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield) => {
                    self.status = Status::Yielded;
                    return Ok(Status::Yielded);
                }
                Ok(Flow::Throw { ty, bytes }) => {
                    self.unwind_throw(ty, bytes);
                    if self.status == Status::Threw {
                        return Ok(Status::Threw);
                    }
                }
                Err(msg) => {
                    self.fault(msg);
                    return Ok(Status::Threw);
                }
            }
        }
        self.status = Status::Done;
        Ok(Status::Done)
    }

    /// Unwinds every live frame through the destructor path and marks the
    /// thread cancelled. Idempotent; a finished thread is left as is.
    pub fn cancel(&mut self) {
        match self.status {
            Status::Ready | Status::Yielded => {}
            _ => return,
        }
        self.unwind_all();
        self.status = Status::Cancelled;
    }

    /// Takes the entry function's return value after [`Status::Done`].
    /// Ownership of the value transfers to the caller.
    pub fn take_return(&mut self) -> Option<Vec<u8>> {
        self.result.take().map(|(_, bytes)| bytes)
    }

    /// Type of the uncaught thrown value, if execution ended with one.
    #[must_use]
    pub fn thrown_type(&self) -> Option<TypeId> {
        match &self.thrown {
            Some(Thrown::Value { ty, .. }) => Some(*ty),
            _ => None,
        }
    }

    /// Bytes of the uncaught thrown value.
    #[must_use]
    pub fn thrown_bytes(&self) -> Option<&[u8]> {
        match &self.thrown {
            Some(Thrown::Value { bytes, .. }) => Some(bytes),
            _ => None,
        }
    }

    /// Fault description, if execution ended with a fault rather than a
    /// script-level throw.
    #[must_use]
    pub fn fault_message(&self) -> Option<&str> {
        match &self.thrown {
            Some(Thrown::Fault(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Backtrace captured at the most recent throw or fault, outermost
    /// frame first.
    #[must_use]
    pub fn backtrace(&self) -> &[TraceFrame] {
        &self.backtrace
    }

    /// Renders the backtrace with file names resolved through the module.
    #[must_use]
    pub fn render_backtrace(&self) -> String {
        let mut out = String::from("thread backtrace (innermost last):\n");
        for frame in &self.backtrace {
            match frame.pos {
                Some(pos) => {
                    let file = self.module.file_name(pos.file).unwrap_or("<unknown>");
                    let _ = writeln!(out, "  at {} ({}:{})", frame.name, file, pos.line);
                }
                None => {
                    let _ = writeln!(out, "  at {}", frame.name);
                }
            }
        }
        out
    }

    /// This thread's storage for a global.
    #[must_use]
    pub fn global_bytes(&self, id: GlobalId) -> Option<&[u8]> {
        self.globals.get(id.0 as usize).map(|b| &**b)
    }

    #[must_use]
    pub fn global_bytes_mut(&mut self, id: GlobalId) -> Option<&mut [u8]> {
        self.globals.get_mut(id.0 as usize).map(|b| &mut **b)
    }

    // ---- dispatch ----

    fn step(&mut self) -> Result<Flow, String> {
        let module = self.module;
        let frame_idx = self.frames.len() - 1;
        let func = module.func(self.frames[frame_idx].func);
        let code = func.code();
        let ip = self.frames[frame_idx].ip as usize;
        let Some(&op_byte) = code.get(ip) else {
            return Err(format!("instruction pointer {ip} out of range"));
        };
        let Some(op) = Opcode::from_repr(op_byte) else {
            return Err(format!("invalid opcode {op_byte:#04x} at {ip}"));
        };
        let mut cur = Cursor { code, at: ip + 1 };

        match op {
            Opcode::Assign => {
                let ty = self.known_type(cur.u32()?)?;
                let dst = self.resolve(frame_idx, cur.operand()?)?;
                let src = self.resolve(frame_idx, cur.operand()?)?;
                let vt = module.types().get(ty);
                let buf = self.read_loc(func, frame_idx, src, vt.size())?;
                let mem = self.loc_mut(frame_idx, dst, vt.size())?;
                vt.assign(mem, &buf);
            }
            Opcode::Index => {
                let elem = self.known_type(cur.u32()?)?;
                let dst = self.resolve(frame_idx, cur.operand()?)?;
                let base = self.resolve(frame_idx, cur.operand()?)?;
                let index = self.resolve(frame_idx, cur.operand()?)?;
                let vt = module.types().get(elem);
                let idx_buf = self.read_loc(func, frame_idx, index, 4)?;
                let idx = u32::from_le_bytes(idx_buf[..4].try_into().expect("4 bytes"));
                let delta = idx
                    .checked_mul(vt.size())
                    .ok_or_else(|| "element index overflow".to_owned())?;
                let src = base.shifted(delta)?;
                let buf = self.read_loc(func, frame_idx, src, vt.size())?;
                let mem = self.loc_mut(frame_idx, dst, vt.size())?;
                vt.assign(mem, &buf);
            }
            Opcode::NewContainer => {
                let ty = self.known_type(cur.u32()?)?;
                let dst = self.resolve(frame_idx, cur.operand()?)?;
                let vt = module.types().get(ty);
                let mem = self.loc_mut(frame_idx, dst, vt.size())?;
                // Replace whatever the destination held with a fresh value.
                vt.destruct(mem);
                vt.init(mem);
            }
            Opcode::Init => {
                let ty = self.known_type(cur.u32()?)?;
                let offset = cur.u32()?;
                let vt = module.types().get(ty);
                let mem = self.loc_mut(frame_idx, Loc::Frame(offset), vt.size())?;
                vt.init(mem);
            }
            Opcode::Destruct => {
                let ty = self.known_type(cur.u32()?)?;
                let offset = cur.u32()?;
                let vt = module.types().get(ty);
                let mem = self.loc_mut(frame_idx, Loc::Frame(offset), vt.size())?;
                vt.destruct(mem);
            }
            Opcode::Call => {
                let callee_id = FuncId(cur.u32()?);
                if callee_id.0 as usize >= module.function_count() {
                    return Err(format!("call to unknown function {}", callee_id.0));
                }
                let has_ret = cur.u8()? != 0;
                let ret_to = if has_ret {
                    Some(self.resolve(frame_idx, cur.operand()?)?)
                } else {
                    None
                };
                let argc = cur.u32()? as usize;
                let callee = module.func(callee_id);
                if argc != callee.params().len() {
                    return Err(format!(
                        "{} takes {} arguments but {} were passed",
                        callee.name(),
                        callee.params().len(),
                        argc
                    ));
                }
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err("call depth limit exceeded".to_owned());
                }
                let mut mem = vec![0u8; callee.frame_size() as usize].into_boxed_slice();
                for param in callee.params() {
                    let arg = self.resolve(frame_idx, cur.operand()?)?;
                    let vt = module.types().get(param.ty);
                    let buf = self.read_loc(func, frame_idx, arg, vt.size())?;
                    vt.init_assign(
                        &mut mem[param.offset as usize..][..vt.size() as usize],
                        &buf,
                    );
                }
                if let Some(ret) = callee.ret() {
                    let vt = module.types().get(ret.ty);
                    vt.init(&mut mem[ret.offset as usize..][..vt.size() as usize]);
                }
                // The caller resumes after the call record.
                self.frames[frame_idx].ip = cur.at as u32;
                self.frames.push(CallFrame {
                    func: callee_id,
                    ip: 0,
                    mem,
                    ret_to,
                });
                return Ok(Flow::Continue);
            }
            Opcode::Jump => {
                let target = cur.u32()?;
                self.check_target(func, target)?;
                self.frames[frame_idx].ip = target;
                self.resync_guards(frame_idx, ip as u32, target);
                return Ok(Flow::Continue);
            }
            Opcode::JumpIf => {
                let cond = self.resolve(frame_idx, cur.operand()?)?;
                let invert = cur.u8()? != 0;
                let target = cur.u32()?;
                let byte = self.read_loc(func, frame_idx, cond, 1)?[0];
                if (byte != 0) != invert {
                    self.check_target(func, target)?;
                    self.frames[frame_idx].ip = target;
                    self.resync_guards(frame_idx, ip as u32, target);
                } else {
                    self.frames[frame_idx].ip = cur.at as u32;
                }
                return Ok(Flow::Continue);
            }
            Opcode::PushCatchGuard => {
                let region = cur.u32()?;
                if region as usize >= func.catches.len() {
                    return Err(format!("unknown catch region {region}"));
                }
                self.guards.push(Guard {
                    frame: frame_idx as u32,
                    region,
                });
            }
            Opcode::PopCatchGuard => {
                let region = cur.u32()?;
                let expected = Guard {
                    frame: frame_idx as u32,
                    region,
                };
                if self.guards.pop() != Some(expected) {
                    return Err("catch guard stack out of sync".to_owned());
                }
            }
            Opcode::MakeClosure => {
                let target = cur.u32()?;
                if target as usize >= module.function_count() {
                    return Err(format!("closure over unknown function {target}"));
                }
                let dst = self.resolve(frame_idx, cur.operand()?)?;
                let mem = self.loc_mut(frame_idx, dst, 4)?;
                mem.copy_from_slice(&target.to_le_bytes());
            }
            Opcode::Throw => {
                let ty = self.known_type(cur.u32()?)?;
                let src = self.resolve(frame_idx, cur.operand()?)?;
                let vt = module.types().get(ty);
                let raw = self.read_loc(func, frame_idx, src, vt.size())?;
                let mut bytes: ValueBuf = SmallVec::from_elem(0, vt.size() as usize);
                vt.init_assign(&mut bytes, &raw);
                // The ip stays on the throw record so unwinding sees the
                // exact throw site.
                self.backtrace = self.capture_backtrace();
                return Ok(Flow::Throw { ty, bytes });
            }
            Opcode::Yield => {
                self.frames[frame_idx].ip = cur.at as u32;
                return Ok(Flow::Yield);
            }
            Opcode::Return => {
                self.pop_frame_normal()?;
                return Ok(Flow::Continue);
            }
        }

        self.frames[frame_idx].ip = cur.at as u32;
        Ok(Flow::Continue)
    }

    fn pop_frame_normal(&mut self) -> Result<(), String> {
        let frame = self.frames.pop().expect("step requires a live frame");
        let module = self.module;
        let func = module.func(frame.func);
        let mut mem = frame.mem;

        if self.frames.is_empty() {
            // Entry frame: the return value moves out to the embedder.
            if let Some(ret) = func.ret() {
                let size = module.types().get(ret.ty).size() as usize;
                self.result = Some((ret.ty, mem[ret.offset as usize..][..size].to_vec()));
            }
        } else {
            if let (Some(loc), Some(ret)) = (frame.ret_to, func.ret()) {
                let vt = module.types().get(ret.ty);
                let size = vt.size() as usize;
                let buf: ValueBuf = SmallVec::from_slice(&mem[ret.offset as usize..][..size]);
                let parent = self.frames.len() - 1;
                let dst = self.loc_mut(parent, loc, vt.size())?;
                vt.assign(dst, &buf);
            }
            if let Some(ret) = func.ret() {
                let vt = module.types().get(ret.ty);
                if vt.has_destruct() {
                    vt.destruct(&mut mem[ret.offset as usize..][..vt.size() as usize]);
                }
            }
        }
        Self::drop_params(module, func, &mut mem);

        // Guards of the popped frame vanish with it.
        let depth = self.frames.len() as u32;
        while self.guards.last().map_or(false, |g| g.frame >= depth) {
            self.guards.pop();
        }
        Ok(())
    }

    fn drop_params(module: &Module, func: &PackedFunction, mem: &mut [u8]) {
        let types = module.types();
        for param in func.params() {
            let vt = types.get(param.ty);
            if vt.has_destruct() {
                vt.destruct(&mut mem[param.offset as usize..][..vt.size() as usize]);
            }
        }
    }

    // ---- throw / unwind ----

    fn unwind_throw(&mut self, ty: TypeId, mut bytes: ValueBuf) {
        let module = self.module;

        // Innermost guard whose region has a clause for this type.
        let mut hit: Option<(u32, PackedClause)> = None;
        for guard in self.guards.iter().rev() {
            let func = module.func(self.frames[guard.frame as usize].func);
            let region = &func.catches[guard.region as usize];
            if let Some(clause) = region
                .clauses
                .iter()
                .find(|c| c.ty.map_or(true, |t| t == ty))
            {
                hit = Some((guard.frame, *clause));
                break;
            }
        }

        let Some((target_frame, clause)) = hit else {
            self.unwind_all();
            self.thrown = Some(Thrown::Value {
                ty,
                bytes: bytes.to_vec(),
            });
            self.status = Status::Threw;
            return;
        };

        let thrower = self.frames.len() - 1;
        while self.frames.len() - 1 > target_frame as usize {
            self.unwind_top_frame();
        }
        let depth = self.frames.len() as u32;
        self.guards.retain(|g| g.frame < depth);

        let frame_idx = target_frame as usize;
        let ip = self.frames[frame_idx].ip;
        let from = if frame_idx == thrower { ip } else { ip.saturating_sub(1) };
        let to = clause.target;

        self.apply_liveness_delta(frame_idx, from, to, clause.landing);
        self.resync_guards(frame_idx, from, to);

        let vt = module.types().get(ty);
        if let Some(offset) = clause.landing {
            let func = module.func(self.frames[frame_idx].func);
            // If the landing slot was already live on both sides of the
            // redirect it holds a value to release; otherwise its entry
            // init was skipped above and the thrown value constructs it.
            let live = func.liveness.iter().any(|s| {
                s.offset == offset
                    && span_covers(s.start, s.end, from)
                    && span_covers(s.start, s.end, to)
            });
            let size = vt.size() as usize;
            let mem = &mut self.frames[frame_idx].mem[offset as usize..][..size];
            if live {
                vt.assign(mem, &bytes);
            } else {
                vt.init_assign(mem, &bytes);
            }
        }
        vt.destruct(&mut bytes);
        self.frames[frame_idx].ip = to;
    }

    fn fault(&mut self, msg: String) {
        self.backtrace = self.capture_backtrace();
        self.unwind_all();
        self.thrown = Some(Thrown::Fault(msg));
        self.status = Status::Threw;
    }

    /// Pops and destructs every frame.
    fn unwind_all(&mut self) {
        while !self.frames.is_empty() {
            self.unwind_top_frame();
        }
        self.guards.clear();
    }

    /// Pops the top frame, destructing its params, return slot and every
    /// local still live at its ip.
    ///
    /// A suspended frame's ip names the next unexecuted record (a throw or
    /// fault leaves it on the offending, uncompleted record), so a slot is
    /// live exactly when its init record lies strictly before the ip and
    /// its destruct record at or after it. The strict start comparison
    /// keeps a frame paused on an `Init` from destructing a value that was
    /// never built, and one paused right after a `Destruct` from running
    /// the destructor twice.
    fn unwind_top_frame(&mut self) {
        let frame = self.frames.pop().expect("caller checked");
        let module = self.module;
        let func = module.func(frame.func);
        let types = module.types();
        let mut mem = frame.mem;

        for slot in func.liveness.iter().rev() {
            if slot.start < frame.ip && frame.ip < slot.end {
                let vt = types.get(slot.ty);
                if vt.has_destruct() {
                    vt.destruct(&mut mem[slot.offset as usize..][..vt.size() as usize]);
                }
            }
        }
        if let Some(ret) = func.ret() {
            let vt = types.get(ret.ty);
            if vt.has_destruct() {
                vt.destruct(&mut mem[ret.offset as usize..][..vt.size() as usize]);
            }
        }
        Self::drop_params(module, func, &mut mem);
    }

    /// Replays the liveness delta of the redirect `from -> to` in a frame:
    /// destructs everything exited (reverse table order), then inits
    /// everything entered except the slot about to receive a thrown value.
    fn apply_liveness_delta(&mut self, frame_idx: usize, from: u32, to: u32, skip: Option<u32>) {
        let module = self.module;
        let func = module.func(self.frames[frame_idx].func);
        let types = module.types();
        let mem = &mut self.frames[frame_idx].mem;

        for slot in func.liveness.iter().rev() {
            if span_exited(slot.start, slot.end, from, to) {
                let vt = types.get(slot.ty);
                if vt.has_destruct() {
                    vt.destruct(&mut mem[slot.offset as usize..][..vt.size() as usize]);
                }
            }
        }
        for slot in func.liveness.iter() {
            if span_entered(slot.start, slot.end, from, to) && skip != Some(slot.offset) {
                let vt = types.get(slot.ty);
                vt.init(&mut mem[slot.offset as usize..][..vt.size() as usize]);
            }
        }
    }

    /// Brings the guard stack in line with the catch regions containing the
    /// new position after a jump within `frame_idx`.
    fn resync_guards(&mut self, frame_idx: usize, from: u32, to: u32) {
        let func = self.module.func(self.frames[frame_idx].func);
        let fidx = frame_idx as u32;
        // Innermost regions exit first.
        for (r, region) in func.catches.iter().enumerate().rev() {
            if span_exited(region.start, region.end, from, to) {
                let r = r as u32;
                self.guards.retain(|g| !(g.frame == fidx && g.region == r));
            }
        }
        for (r, region) in func.catches.iter().enumerate() {
            if span_entered(region.start, region.end, from, to) {
                self.guards.push(Guard {
                    frame: fidx,
                    region: r as u32,
                });
            }
        }
    }

    fn capture_backtrace(&self) -> Vec<TraceFrame> {
        let top = self.frames.len().saturating_sub(1);
        self.frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let func = self.module.func(frame.func);
                let addr = if i == top { frame.ip } else { frame.ip.saturating_sub(1) };
                TraceFrame {
                    func: frame.func,
                    name: func.name().to_owned(),
                    pos: func.pos_at(addr),
                }
            })
            .collect()
    }

    // ---- operand plumbing ----

    fn known_type(&self, raw: u32) -> Result<TypeId, String> {
        let id = TypeId(raw);
        if self.module.types().contains(id) {
            Ok(id)
        } else {
            Err(format!("unknown type id {raw}"))
        }
    }

    fn check_target(&self, func: &PackedFunction, target: u32) -> Result<(), String> {
        if (target as usize) < func.code().len() {
            Ok(())
        } else {
            Err(format!("jump target {target} out of range"))
        }
    }

    fn resolve(&self, frame_idx: usize, raw: RawOperand) -> Result<Loc, String> {
        match raw {
            RawOperand::Slot(offset) => Ok(Loc::Frame(offset)),
            RawOperand::Deref { base, offset } => {
                let mem = &self.frames[frame_idx].mem;
                let handle_bytes = mem
                    .get(base as usize..base as usize + 4)
                    .ok_or_else(|| "deref base outside the frame".to_owned())?;
                let handle = u32::from_le_bytes(handle_bytes.try_into().expect("4 bytes"));
                if handle as usize >= self.globals.len() {
                    return Err(format!("invalid global handle {handle}"));
                }
                Ok(Loc::Global {
                    global: handle,
                    offset,
                })
            }
            RawOperand::Global { global, offset } => {
                if global as usize >= self.globals.len() {
                    return Err(format!("unknown global {global}"));
                }
                Ok(Loc::Global { global, offset })
            }
            RawOperand::Literal(lit) => Ok(Loc::Literal { lit, offset: 0 }),
        }
    }

    fn read_loc(
        &self,
        func: &PackedFunction,
        frame_idx: usize,
        loc: Loc,
        size: u32,
    ) -> Result<ValueBuf, String> {
        let size = size as usize;
        let slice = match loc {
            Loc::Frame(offset) => self.frames[frame_idx]
                .mem
                .get(offset as usize..)
                .and_then(|s| s.get(..size)),
            Loc::Global { global, offset } => self
                .globals
                .get(global as usize)
                .and_then(|g| g.get(offset as usize..))
                .and_then(|s| s.get(..size)),
            Loc::Literal { lit, offset } => func
                .literals
                .get(lit as usize)
                .and_then(|l| l.bytes.get(offset as usize..))
                .and_then(|s| s.get(..size)),
        };
        slice
            .map(SmallVec::from_slice)
            .ok_or_else(|| "operand read out of bounds".to_owned())
    }

    fn loc_mut(&mut self, frame_idx: usize, loc: Loc, size: u32) -> Result<&mut [u8], String> {
        let size = size as usize;
        match loc {
            Loc::Frame(offset) => self.frames[frame_idx]
                .mem
                .get_mut(offset as usize..)
                .and_then(|s| s.get_mut(..size))
                .ok_or_else(|| "frame write out of bounds".to_owned()),
            Loc::Global { global, offset } => self
                .globals
                .get_mut(global as usize)
                .and_then(|g| g.get_mut(offset as usize..))
                .and_then(|s| s.get_mut(..size))
                .ok_or_else(|| "global write out of bounds".to_owned()),
            Loc::Literal { .. } => Err("write to a literal operand".to_owned()),
        }
    }

    fn clear_thrown(&mut self) {
        if let Some(Thrown::Value { ty, mut bytes }) = self.thrown.take() {
            let vt = self.module.types().get(ty);
            if vt.has_destruct() {
                vt.destruct(&mut bytes);
            }
        }
    }

    fn drop_result(&mut self) {
        if let Some((ty, mut bytes)) = self.result.take() {
            let vt = self.module.types().get(ty);
            if vt.has_destruct() {
                vt.destruct(&mut bytes);
            }
        }
    }
}

impl Drop for Thread<'_> {
    fn drop(&mut self) {
        self.cancel();
        self.clear_thrown();
        self.drop_result();
        let types = self.module.types();
        for (def, mem) in self.module.globals().iter().zip(self.globals.iter_mut()) {
            let vt = types.get(def.ty);
            if vt.has_destruct() {
                vt.destruct(mem);
            }
        }
    }
}

impl std::fmt::Debug for Thread<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("status", &self.status)
            .field("frames", &self.frames.len())
            .field("guards", &self.guards.len())
            .finish()
    }
}
