//! Live-range frame allocator.
//!
//! Assigns a byte offset in the call-frame arena to every variable of a
//! compilation. Parameters and the return slot get fixed, ascending,
//! alignment-respecting offsets at the front of the frame; everything else is
//! placed by walking the liveness timeline against a first-fit free list, so
//! variables with disjoint live ranges share storage and the frame stays
//! bounded. Aliases are resolved last to a sub-range of their container.

use crate::builder::Variable;
use crate::types::TypeRegistry;

/// Offset value meaning "not yet allocated".
pub(crate) const UNALLOCATED: u32 = u32::MAX;

/// A free byte range `[offset, offset + size)` in the frame arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: u32,
    size: u32,
}

impl FreeBlock {
    fn end(self) -> u32 {
        self.offset + self.size
    }
}

/// Timeline event kind. Ends sort before starts at the same step, so storage
/// freed at a step is eligible for a variable starting at that same step
/// (the fixup pass guarantees destructs precede inits at every edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    End,
    Start,
}

fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Assigns frame offsets to every variable and returns the total frame size.
///
/// Parameters and the return slot are laid out first in variable-id order;
/// interval-allocated variables follow; aliases are resolved against their
/// container's final offset.
pub(crate) fn allocate_frame(vars: &mut [Variable], types: &TypeRegistry) -> u32 {
    let mut frame_size = 0u32;

    // Fixed slots: return value and parameters, ascending, aligned.
    for var in vars.iter_mut() {
        if !var.is_param {
            continue;
        }
        let ty = types.get(var.ty);
        if ty.size() == 0 {
            var.offset = 0;
            continue;
        }
        frame_size = align_up(frame_size, ty.align());
        var.offset = frame_size;
        frame_size += ty.size();
    }

    // Interval timeline for everything else.
    let mut events: Vec<(u32, EventKind, usize)> = Vec::new();
    for (idx, var) in vars.iter_mut().enumerate() {
        if var.is_param || var.alias.is_some() {
            continue;
        }
        if types.get(var.ty).size() == 0 {
            var.offset = 0;
            continue;
        }
        events.push((var.start, EventKind::Start, idx));
        events.push((var.end, EventKind::End, idx));
    }
    events.sort_unstable();

    let mut free: Vec<FreeBlock> = Vec::new();
    for (_, kind, idx) in events {
        match kind {
            EventKind::Start => {
                let ty = types.get(vars[idx].ty);
                vars[idx].offset = place(&mut free, &mut frame_size, ty.size(), ty.align());
            }
            EventKind::End => {
                let ty = types.get(vars[idx].ty);
                release(&mut free, vars[idx].offset, ty.size());
            }
        }
    }

    // Aliases piggyback on their container's storage.
    for idx in 0..vars.len() {
        if let Some((container, sub_offset)) = vars[idx].alias {
            let base = vars[container.0 as usize].offset;
            debug_assert_ne!(base, UNALLOCATED, "alias container was never allocated");
            vars[idx].offset = base + sub_offset;
        }
    }

    frame_size
}

/// First-fit search of the free list; falls back to extending the frame.
fn place(free: &mut Vec<FreeBlock>, frame_size: &mut u32, size: u32, align: u32) -> u32 {
    for i in 0..free.len() {
        let block = free[i];
        let aligned = align_up(block.offset, align);
        if aligned + size > block.end() {
            continue;
        }
        // Carve [aligned, aligned + size) out of the block. Up to two
        // remainders survive: bytes below the aligned offset and bytes above
        // the carved range.
        let below = aligned - block.offset;
        let above = block.end() - (aligned + size);
        match (below > 0, above > 0) {
            (false, false) => {
                free.remove(i);
            }
            (true, false) => {
                free[i].size = below;
            }
            (false, true) => {
                free[i].offset = aligned + size;
                free[i].size = above;
            }
            (true, true) => {
                free[i].size = below;
                free.insert(
                    i + 1,
                    FreeBlock {
                        offset: aligned + size,
                        size: above,
                    },
                );
            }
        }
        return aligned;
    }

    // No block fits: extend the frame, keeping any alignment gap on the
    // free list so it can still serve smaller variables.
    let aligned = align_up(*frame_size, align);
    if aligned > *frame_size {
        release(free, *frame_size, aligned - *frame_size);
    }
    *frame_size = aligned + size;
    aligned
}

/// Returns a range to the free list, merging with adjacent blocks.
///
/// Four cases: coalesce left, coalesce right, bridge both neighbours, or
/// insert standalone.
fn release(free: &mut Vec<FreeBlock>, offset: u32, size: u32) {
    if size == 0 {
        return;
    }
    let pos = free.partition_point(|b| b.offset < offset);
    let merges_left = pos > 0 && free[pos - 1].end() == offset;
    let merges_right = pos < free.len() && offset + size == free[pos].offset;
    match (merges_left, merges_right) {
        (true, true) => {
            free[pos - 1].size += size + free[pos].size;
            free.remove(pos);
        }
        (true, false) => free[pos - 1].size += size,
        (false, true) => {
            free[pos].offset = offset;
            free[pos].size += size;
        }
        (false, false) => free.insert(pos, FreeBlock { offset, size }),
    }
}
