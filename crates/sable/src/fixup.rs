//! Control-flow fixup pass.
//!
//! A jump edge can carry execution across variable lifetime boundaries: out
//! of scopes whose destructs it skips, or into scopes whose inits it skips.
//! This pass walks every unconditional jump, conditional jump and return,
//! computes the liveness delta between source and target, and splices in the
//! missing `Destruct` (live at source, not target) then `Init` (live at
//! target, not source) instructions.
//!
//! A conditional jump that needs fixups cannot carry them inline (the
//! fall-through arm must not run them), so it is rewritten: the condition is
//! inverted to hop over a fresh block holding the fixups plus an
//! unconditional jump to the original target. Both arms then have
//! independent fixup sequences without re-evaluating the condition.
//!
//! All insertions are planned in original step-index space and applied in
//! one batch; labels, liveness intervals and catch-region bounds are then
//! remapped through the boundary table built during application.
//!
//! Running the pass on an already-fixed stream is a no-op: each edge's
//! required sequence is compared against the instructions already sitting in
//! front of it and skipped when present.

use crate::builder::{RegionSpan, Variable};
use crate::instr::{Instr, InstrKind, LabelId, VarId};
use crate::types::TypeRegistry;

/// Sentinel target for return edges: no variable is live past function exit.
const EXIT: u32 = u32::MAX;

/// True if position `p` lies inside `[start, end)`.
#[inline]
pub(crate) fn span_covers(start: u32, end: u32, p: u32) -> bool {
    start <= p && p < end
}

/// True if the edge `from -> to` leaves the span: the value is live at the
/// source but its storage is not valid at the target.
#[inline]
pub(crate) fn span_exited(start: u32, end: u32, from: u32, to: u32) -> bool {
    span_covers(start, end, from) && (to == EXIT || !span_covers(start, end, to))
}

/// True if the edge `from -> to` enters the span.
///
/// Entry is strict at `start`: a jump landing exactly on the span's first
/// step lands on the instruction that opens it (the variable's `Init`, or a
/// region's `PushCatchGuard`), which performs the entry itself.
#[inline]
pub(crate) fn span_entered(start: u32, end: u32, from: u32, to: u32) -> bool {
    to != EXIT && start < to && to < end && !span_covers(start, end, from)
}

/// Where an inserted block sits relative to the instruction it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Attach {
    /// Before the instruction: every path reaching it runs the block
    /// (plain jumps and returns).
    Before,
    /// After the instruction: reached only by falling past it (the rewritten
    /// conditional's taken-arm block).
    After,
}

struct Insertion {
    /// Original instruction index the block attaches to.
    at: u32,
    attach: Attach,
    block: Vec<Instr>,
}

/// Runs the pass over one compilation's state.
///
/// `labels` maps `LabelId` index to a step index (growing if conditional
/// rewrites mint new labels); `regions` are the catch-region step spans.
/// All three index spaces are remapped in place.
pub(crate) fn run(
    instrs: &mut Vec<Instr>,
    vars: &mut [Variable],
    labels: &mut Vec<u32>,
    regions: &mut [RegionSpan],
    types: &TypeRegistry,
) {
    // Variables the pass must never touch: parameters (caller-managed),
    // aliases (no storage of their own), and alias containers (their
    // lifetime is pinned by the alias relationship).
    let mut excluded = vec![false; vars.len()];
    for (idx, var) in vars.iter().enumerate() {
        if var.is_param || var.alias.is_some() {
            excluded[idx] = true;
        }
        if let Some((container, _)) = var.alias {
            excluded[container.0 as usize] = true;
        }
    }

    let mut insertions: Vec<Insertion> = Vec::new();

    for i in 0..instrs.len() {
        let step = u32::try_from(i).expect("instruction index overflow");
        let (target, conditional) = match &instrs[i].kind {
            InstrKind::Jump { target } => (labels[target.0 as usize], false),
            InstrKind::JumpIf { target, .. } => (labels[target.0 as usize], true),
            InstrKind::Return => (EXIT, false),
            _ => continue,
        };

        let fixups = edge_fixups(vars, &excluded, types, step, target, instrs[i].pos);
        if fixups.is_empty() {
            continue;
        }

        if conditional {
            // Invert the condition to hop over the fixups; the original
            // target moves onto a fresh unconditional jump at the end of
            // the inserted block.
            let hop = LabelId(u32::try_from(labels.len()).expect("label overflow"));
            labels.push(step + 1);
            let InstrKind::JumpIf { cond, invert, target } = instrs[i].kind else {
                unreachable!("edge classified as conditional above");
            };
            let pos = instrs[i].pos;
            instrs[i].kind = InstrKind::JumpIf {
                cond,
                invert: !invert,
                target: hop,
            };
            let mut block = fixups;
            block.push(Instr::new(InstrKind::Jump { target }, pos));
            insertions.push(Insertion {
                at: step,
                attach: Attach::After,
                block,
            });
        } else {
            if fixups_already_present(instrs, i, &fixups) {
                continue;
            }
            insertions.push(Insertion {
                at: step,
                attach: Attach::Before,
                block: fixups,
            });
        }
    }

    if insertions.is_empty() {
        return;
    }

    apply(instrs, vars, labels, regions, insertions);
}

/// Computes the destruct-then-init sequence required on the edge
/// `from -> to` (`to == EXIT` for returns).
fn edge_fixups(
    vars: &[Variable],
    excluded: &[bool],
    types: &TypeRegistry,
    from: u32,
    to: u32,
    pos: crate::pos::SourcePos,
) -> Vec<Instr> {
    let mut out = Vec::new();
    // Destructs in reverse creation order, mirroring sequential scope exit.
    for idx in (0..vars.len()).rev() {
        let v = &vars[idx];
        if excluded[idx] || !types.get(v.ty).has_destruct() {
            continue;
        }
        if span_exited(v.start, v.end, from, to) {
            out.push(Instr::new(
                InstrKind::Destruct {
                    var: VarId(idx as u32),
                },
                pos,
            ));
        }
    }
    for (idx, v) in vars.iter().enumerate() {
        if excluded[idx] || !types.get(v.ty).has_init() {
            continue;
        }
        if span_entered(v.start, v.end, from, to) {
            out.push(Instr::new(
                InstrKind::Init {
                    var: VarId(idx as u32),
                },
                pos,
            ));
        }
    }
    out
}

/// True if the instructions immediately before `at` already spell out
/// exactly `fixups`. This is what makes the pass idempotent.
fn fixups_already_present(instrs: &[Instr], at: usize, fixups: &[Instr]) -> bool {
    if at < fixups.len() {
        return false;
    }
    instrs[at - fixups.len()..at]
        .iter()
        .zip(fixups)
        .all(|(have, want)| match (&have.kind, &want.kind) {
            (InstrKind::Init { var: a }, InstrKind::Init { var: b })
            | (InstrKind::Destruct { var: a }, InstrKind::Destruct { var: b }) => a == b,
            _ => false,
        })
}

/// Splices the planned blocks into the stream and remaps every step index.
///
/// `boundary[t]` is the new index of the point between original steps `t-1`
/// and `t`, placed after any `After(t-1)` block and before any `Before(t)`
/// block. Labels remap through it so that edges targeting a jump still run
/// that jump's own fixups, while the conditional hop label skips the block
/// it was minted to hop over.
fn apply(
    instrs: &mut Vec<Instr>,
    vars: &mut [Variable],
    labels: &mut [u32],
    regions: &mut [RegionSpan],
    mut insertions: Vec<Insertion>,
) {
    insertions.sort_by_key(|ins| (ins.at, ins.attach));
    let old = std::mem::take(instrs);
    let mut boundary = Vec::with_capacity(old.len() + 1);
    let mut pending = insertions.into_iter().peekable();

    for (i, instr) in old.into_iter().enumerate() {
        let step = i as u32;
        boundary.push(instrs.len() as u32);
        while pending
            .peek()
            .is_some_and(|ins| ins.at == step && ins.attach == Attach::Before)
        {
            instrs.extend(pending.next().expect("peeked").block);
        }
        instrs.push(instr);
        while pending
            .peek()
            .is_some_and(|ins| ins.at == step && ins.attach == Attach::After)
        {
            instrs.extend(pending.next().expect("peeked").block);
        }
    }
    boundary.push(instrs.len() as u32);
    debug_assert!(pending.next().is_none(), "insertion past end of stream");

    let remap = |step: u32| -> u32 {
        if step == EXIT {
            EXIT
        } else {
            boundary[step as usize]
        }
    };
    for label in labels.iter_mut() {
        *label = remap(*label);
    }
    for var in vars.iter_mut() {
        var.start = remap(var.start);
        var.end = remap(var.end);
    }
    for region in regions.iter_mut() {
        region.start = remap(region.start);
        region.end = remap(region.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::Operand;
    use crate::pos::SourcePos;
    use crate::types::{Scalar, TypeId, TypeRegistry, ValueType};

    /// A type with both lifecycle callbacks, so fixups apply to it.
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

    fn managed_var(ty: TypeId, start: u32, end: u32) -> Variable {
        Variable {
            ty,
            start,
            end,
            is_param: false,
            alias: None,
            offset: u32::MAX,
        }
    }

    fn instr(kind: InstrKind) -> Instr {
        Instr::new(kind, SourcePos::synthetic())
    }

    fn nop() -> Instr {
        // Any non-edge instruction works as filler.
        instr(InstrKind::Init { var: VarId(999) })
    }

    fn kinds(instrs: &[Instr]) -> Vec<String> {
        instrs.iter().map(|i| format!("{:?}", i.kind)).collect()
    }

    #[test]
    fn return_edge_gets_destructs_for_live_vars() {
        let mut reg = TypeRegistry::new();
        let m = reg.register(Managed);
        // 0: init v0, 1: return  -- v0 live across the return
        let mut instrs = vec![instr(InstrKind::Init { var: VarId(0) }), instr(InstrKind::Return)];
        let mut vars = vec![managed_var(m, 0, 2)];
        let mut labels = Vec::new();
        let mut regions = Vec::new();

        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);

        assert_eq!(instrs.len(), 3);
        assert!(matches!(instrs[1].kind, InstrKind::Destruct { var: VarId(0) }));
        assert!(matches!(instrs[2].kind, InstrKind::Return));
    }

    #[test]
    fn pass_is_idempotent() {
        let mut reg = TypeRegistry::new();
        let m = reg.register(Managed);
        let mut instrs = vec![instr(InstrKind::Init { var: VarId(0) }), instr(InstrKind::Return)];
        let mut vars = vec![managed_var(m, 0, 2)];
        let mut labels = Vec::new();
        let mut regions = Vec::new();

        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);
        let once = kinds(&instrs);
        let vars_once = vars.clone();
        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);
        assert_eq!(kinds(&instrs), once, "second run must change nothing");
        assert_eq!(vars[0].start, vars_once[0].start);
        assert_eq!(vars[0].end, vars_once[0].end);
    }

    #[test]
    fn jump_out_of_scope_destructs_skipped_vars() {
        let mut reg = TypeRegistry::new();
        let m = reg.register(Managed);
        // 0: init v0
        // 1: jump L (L = 4, past v0's destruct)
        // 2: destruct v0
        // 3: filler
        // 4: return        <- L, v0 dead here
        let mut instrs = vec![
            instr(InstrKind::Init { var: VarId(0) }),
            instr(InstrKind::Jump { target: LabelId(0) }),
            instr(InstrKind::Destruct { var: VarId(0) }),
            nop(),
            instr(InstrKind::Return),
        ];
        let mut vars = vec![managed_var(m, 0, 3)];
        let mut labels = vec![4];
        let mut regions = Vec::new();

        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);

        // A destruct is spliced in front of the jump; the label moves with
        // the insertion.
        assert!(matches!(instrs[1].kind, InstrKind::Destruct { var: VarId(0) }));
        assert!(matches!(instrs[2].kind, InstrKind::Jump { .. }));
        assert_eq!(labels[0], 5);
        assert!(matches!(instrs[5].kind, InstrKind::Return));
    }

    #[test]
    fn jump_into_scope_inits_entered_vars() {
        let mut reg = TypeRegistry::new();
        let m = reg.register(Managed);
        // 0: jump L (L = 3, inside v0's interval but past its init)
        // 1: init v0
        // 2: filler
        // 3: filler        <- L
        // 4: destruct v0
        // 5: return
        let mut instrs = vec![
            instr(InstrKind::Jump { target: LabelId(0) }),
            instr(InstrKind::Init { var: VarId(0) }),
            nop(),
            nop(),
            instr(InstrKind::Destruct { var: VarId(0) }),
            instr(InstrKind::Return),
        ];
        let mut vars = vec![managed_var(m, 1, 5)];
        let mut labels = vec![3];
        let mut regions = Vec::new();

        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);

        assert!(matches!(instrs[0].kind, InstrKind::Init { var: VarId(0) }));
        assert!(matches!(instrs[1].kind, InstrKind::Jump { .. }));
        // Interval shifted by the insertion at step 0.
        assert_eq!(vars[0].start, 2);
        assert_eq!(vars[0].end, 6);
        assert_eq!(labels[0], 4);
    }

    #[test]
    fn jump_landing_on_init_is_not_double_inited() {
        let mut reg = TypeRegistry::new();
        let m = reg.register(Managed);
        // Jump targets the Init instruction itself: entry is strict, so no
        // extra init may be inserted.
        let mut instrs = vec![
            instr(InstrKind::Jump { target: LabelId(0) }),
            instr(InstrKind::Init { var: VarId(0) }),
            instr(InstrKind::Destruct { var: VarId(0) }),
            instr(InstrKind::Return),
        ];
        let mut vars = vec![managed_var(m, 1, 3)];
        let mut labels = vec![1];
        let mut regions = Vec::new();

        let before = kinds(&instrs);
        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);
        assert_eq!(kinds(&instrs), before);
    }

    #[test]
    fn conditional_jump_is_rewritten_with_inverted_hop() {
        let mut reg = TypeRegistry::new();
        let m = reg.register(Managed);
        // 0: init v0
        // 1: jump-if c -> L (L = 5, outside v0's life)
        // 2: filler
        // 3: destruct v0
        // 4: return
        // 5: return        <- L
        let cond = Operand::Slot(VarId(1));
        let mut instrs = vec![
            instr(InstrKind::Init { var: VarId(0) }),
            instr(InstrKind::JumpIf {
                cond,
                invert: false,
                target: LabelId(0),
            }),
            nop(),
            instr(InstrKind::Destruct { var: VarId(0) }),
            instr(InstrKind::Return),
            instr(InstrKind::Return),
        ];
        let mut vars = vec![managed_var(m, 0, 4)];
        let mut labels = vec![5];
        let mut regions = Vec::new();

        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);

        // 1: inverted hop over [destruct v0, jump L]
        let InstrKind::JumpIf { invert, target, .. } = instrs[1].kind else {
            panic!("rewritten instruction must stay conditional");
        };
        assert!(invert, "condition must be inverted");
        assert!(matches!(instrs[2].kind, InstrKind::Destruct { var: VarId(0) }));
        assert!(matches!(instrs[3].kind, InstrKind::Jump { target: LabelId(0) }));
        // The hop label lands just past the inserted block (old step 2).
        assert_eq!(labels[target.0 as usize], 4);

        // Second run is a no-op.
        let once = kinds(&instrs);
        let labels_once = labels.clone();
        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);
        assert_eq!(kinds(&instrs), once);
        assert_eq!(labels, labels_once);
    }

    #[test]
    fn params_and_aliases_are_excluded() {
        let mut reg = TypeRegistry::new();
        let m = reg.register(Managed);
        let _scalar = reg.register(Scalar::new("s", 8));
        let mut instrs = vec![nop(), instr(InstrKind::Return)];
        let mut vars = vec![
            Variable {
                ty: m,
                start: 0,
                end: u32::MAX,
                is_param: true,
                alias: None,
                offset: u32::MAX,
            },
            // Alias of v0, live across the return.
            Variable {
                ty: m,
                start: 0,
                end: 2,
                is_param: false,
                alias: Some((VarId(0), 0)),
                offset: u32::MAX,
            },
        ];
        let mut labels = Vec::new();
        let mut regions = Vec::new();

        let before = kinds(&instrs);
        run(&mut instrs, &mut vars, &mut labels, &mut regions, &reg);
        assert_eq!(kinds(&instrs), before, "params/aliases must not get fixups");
    }
}
