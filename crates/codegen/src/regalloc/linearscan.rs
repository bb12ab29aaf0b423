//! Interval construction and the linear scan itself.
//!
//! Intervals are dense-id entries in an arena, one coalesced `[start,
//! end)` range per interval, with the sorted use positions needed for
//! split and spill decisions. Fixed registers are not intervals: every
//! position a pre-colored vreg or a call touches a machine register
//! becomes a blocked range on that register, so "a value live across a
//! call cannot sit in a caller-saved register" falls out of the ordinary
//! conflict check.

use std::collections::BinaryHeap;

use log::trace;
use rustc_hash::FxHashMap;

use javelin_environ::VmType;

use crate::cu::{BlockId, CompilationUnit, VReg};
use crate::entity::{entity_impl, EntityRef, PrimaryMap};
use crate::frame::SlotId;
use crate::isa::MachReg;
use crate::regalloc::liveness::{insn_defs, lir_blocks, Liveness};

/// Reference to a live interval.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(u32);
entity_impl!(IntervalId, "int");

/// Where an interval lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Loc {
    /// A machine register.
    Reg(MachReg),
    /// A frame slot.
    Slot(SlotId),
}

/// One live range of a virtual register.
#[derive(Clone, Debug)]
pub struct Interval {
    /// The owning virtual register.
    pub vreg: VReg,
    /// First covered position.
    pub start: u32,
    /// One past the last covered position.
    pub end: u32,
    /// Sorted positions where the register is read or written.
    pub uses: Vec<u32>,
    /// The assigned location, filled by the scan.
    pub loc: Option<Loc>,
}

impl Interval {
    fn next_use_after(&self, pos: u32) -> u32 {
        self.uses
            .iter()
            .copied()
            .find(|&u| u >= pos)
            .unwrap_or(self.end)
    }
}

/// The allocator's result: every vreg's intervals, ordered by start.
pub struct Allocation {
    /// All intervals.
    pub intervals: PrimaryMap<IntervalId, Interval>,
    /// Intervals per vreg, ordered by start position.
    pub vreg_intervals: FxHashMap<VReg, Vec<IntervalId>>,
    /// Position range `[start, end)` of each block's instructions.
    pub block_ranges: FxHashMap<BlockId, (u32, u32)>,
    /// Spill slot per spilled vreg, shared by all its spilled intervals.
    pub spill_slots: FxHashMap<VReg, SlotId>,
}

impl Allocation {
    /// The location of a vreg at a position, if it is live there.
    pub fn location_at(&self, vreg: VReg, pos: u32) -> Option<Loc> {
        let ids = self.vreg_intervals.get(&vreg)?;
        for &id in ids {
            let interval = &self.intervals[id];
            if pos >= interval.start && pos < interval.end {
                return interval.loc;
            }
        }
        None
    }
}

/// Per-register list of `[start, end)` ranges the scan must not allocate
/// over.
pub struct BlockedRanges {
    ranges: Vec<Vec<(u32, u32)>>,
}

impl BlockedRanges {
    fn new() -> Self {
        BlockedRanges {
            ranges: vec![Vec::new(); MachReg::COUNT],
        }
    }

    fn block(&mut self, reg: MachReg, start: u32, end: u32) {
        self.ranges[reg.index()].push((start, end));
    }

    fn finish(&mut self) {
        for list in &mut self.ranges {
            list.sort_unstable();
        }
    }

    /// The first position in `[start, end)` where `reg` is unavailable,
    /// or `None` if it is free for the whole range.
    pub fn first_conflict(&self, reg: MachReg, start: u32, end: u32) -> Option<u32> {
        self.ranges[reg.index()]
            .iter()
            .filter(|&&(s, e)| s < end && e > start)
            .map(|&(s, _)| s.max(start))
            .min()
    }
}

fn is_xmm_vreg(cu: &CompilationUnit, vreg: VReg) -> bool {
    cu.vregs[vreg].ty.is_float()
}

struct IntervalBuilder {
    start: u32,
    end: u32,
    uses: Vec<u32>,
}

/// Build intervals for every allocatable vreg and blocked ranges for
/// every fixed-register touch.
pub fn build_intervals(
    cu: &CompilationUnit,
    liveness: &Liveness,
) -> (PrimaryMap<IntervalId, Interval>, FxHashMap<VReg, Vec<IntervalId>>, BlockedRanges, FxHashMap<BlockId, (u32, u32)>) {
    let mut builders: FxHashMap<VReg, IntervalBuilder> = FxHashMap::default();
    let mut blocked = BlockedRanges::new();
    let mut block_ranges = FxHashMap::default();

    let mut cursor = 0u32;
    for block in lir_blocks(cu) {
        let data = &cu.blocks[block];
        let block_start = data.insns.first().map_or(cursor, |i| i.pos);
        let block_end = data.insns.last().map_or(block_start, |i| i.pos + 2);
        cursor = block_end;
        block_ranges.insert(block, (block_start, block_end));

        // Fixed-register def-to-use clusters, one per block.
        let mut fixed_first: FxHashMap<MachReg, u32> = FxHashMap::default();
        let mut fixed_last: FxHashMap<MachReg, u32> = FxHashMap::default();

        let mut touch = |builders: &mut FxHashMap<VReg, IntervalBuilder>, v: VReg, pos: u32| {
            let b = builders.entry(v).or_insert(IntervalBuilder {
                start: pos,
                end: pos + 2,
                uses: Vec::new(),
            });
            b.start = b.start.min(pos);
            b.end = b.end.max(pos + 2);
            b.uses.push(pos);
        };

        for insn in &data.insns {
            let pos = insn.pos;
            for reg in insn
                .op
                .uses()
                .into_iter()
                .chain(insn_defs(cu, &insn.op).into_iter().map(crate::lir::Reg::Virt))
            {
                let Some(v) = reg.as_virt() else { continue };
                match cu.vregs[v].fixed {
                    Some(mach) => {
                        fixed_first.entry(mach).or_insert(pos);
                        fixed_last.insert(mach, pos);
                    }
                    None => touch(&mut builders, v, pos),
                }
            }
        }

        for (mach, first) in fixed_first {
            let last = fixed_last[&mach];
            blocked.block(mach, first, last + 2);
        }

        // Cross-block liveness widens the hull to the block bounds.
        for &v in &liveness.live_in[&block] {
            if cu.vregs[v].fixed.is_some() {
                continue;
            }
            let b = builders.entry(v).or_insert(IntervalBuilder {
                start: block_start,
                end: block_start,
                uses: Vec::new(),
            });
            b.start = b.start.min(block_start);
        }
        for &v in &liveness.live_out[&block] {
            if cu.vregs[v].fixed.is_some() {
                continue;
            }
            let b = builders.entry(v).or_insert(IntervalBuilder {
                start: block_start,
                end: block_end,
                uses: Vec::new(),
            });
            b.end = b.end.max(block_end);
        }
    }

    blocked.finish();

    let mut intervals = PrimaryMap::new();
    let mut vreg_intervals: FxHashMap<VReg, Vec<IntervalId>> = FxHashMap::default();
    let mut sorted: Vec<(VReg, IntervalBuilder)> = builders.into_iter().collect();
    sorted.sort_by_key(|(v, b)| (b.start, v.index()));
    for (vreg, mut b) in sorted {
        b.uses.sort_unstable();
        b.uses.dedup();
        let id = intervals.push(Interval {
            vreg,
            start: b.start,
            end: b.end,
            uses: b.uses,
            loc: None,
        });
        vreg_intervals.entry(vreg).or_default().push(id);
    }

    (intervals, vreg_intervals, blocked, block_ranges)
}

/// Run the scan. Consumes the interval table and returns the full
/// allocation, with new spill slots taken from the unit's frame.
pub fn run(cu: &mut CompilationUnit, liveness: &Liveness) -> Allocation {
    let (mut intervals, mut vreg_intervals, blocked, block_ranges) =
        build_intervals(cu, liveness);

    // Min-heap of unhandled intervals by start position.
    let mut unhandled: BinaryHeap<std::cmp::Reverse<(u32, IntervalId)>> = intervals
        .keys()
        .map(|id| std::cmp::Reverse((intervals[id].start, id)))
        .collect();

    let mut active: Vec<IntervalId> = Vec::new();
    let mut spill_slots: FxHashMap<VReg, SlotId> = FxHashMap::default();

    let mut spill_slot_for = |cu: &mut CompilationUnit,
                              spill_slots: &mut FxHashMap<VReg, SlotId>,
                              vreg: VReg| {
        if let Some(&slot) = spill_slots.get(&vreg) {
            return slot;
        }
        let wide = match cu.vregs[vreg].ty {
            VmType::Long | VmType::Double => true,
            VmType::Reference => cu.target.has_64bit_gprs(),
            _ => false,
        };
        let slot = if wide {
            cu.frame.alloc_slot_64()
        } else {
            cu.frame.alloc_slot_32()
        };
        spill_slots.insert(vreg, slot);
        slot
    };

    while let Some(std::cmp::Reverse((start, id))) = unhandled.pop() {
        active.retain(|&a| intervals[a].end > start);

        let vreg = intervals[id].vreg;
        let end = intervals[id].end;
        let xmm = is_xmm_vreg(cu, vreg);
        let prefs: &[MachReg] = if xmm {
            cu.target.regs().xmms
        } else {
            cu.target.regs().gprs
        };

        // Find a register free for the whole interval, or the one free
        // for the longest prefix.
        let mut best_partial: Option<(MachReg, u32)> = None;
        let mut chosen: Option<MachReg> = None;
        for &reg in prefs {
            let held = active.iter().any(|&a| intervals[a].loc == Some(Loc::Reg(reg)));
            if held {
                continue;
            }
            match blocked.first_conflict(reg, start, end) {
                None => {
                    chosen = Some(reg);
                    break;
                }
                Some(conflict) if conflict > start => {
                    if best_partial.map_or(true, |(_, until)| conflict > until) {
                        best_partial = Some((reg, conflict));
                    }
                }
                Some(_) => {}
            }
        }

        if let Some(reg) = chosen {
            intervals[id].loc = Some(Loc::Reg(reg));
            active.push(id);
            continue;
        }

        if let Some((reg, free_until)) = best_partial {
            // Register available for a prefix: take it and re-queue the
            // remainder.
            let child = split_interval(&mut intervals, &mut vreg_intervals, id, free_until);
            intervals[id].loc = Some(Loc::Reg(reg));
            active.push(id);
            unhandled.push(std::cmp::Reverse((intervals[child].start, child)));
            continue;
        }

        // Nothing free at all: spill the interval with the farthest next
        // use, which may be the current one.
        let cur_next = intervals[id].next_use_after(start);
        let victim = active
            .iter()
            .copied()
            .filter(|&a| is_xmm_vreg(cu, intervals[a].vreg) == xmm)
            .max_by_key(|&a| intervals[a].next_use_after(start));

        match victim {
            Some(victim_id)
                if intervals[victim_id].next_use_after(start) > cur_next
                    && intervals[victim_id].start < start =>
            {
                let reg = match intervals[victim_id].loc {
                    Some(Loc::Reg(reg)) => reg,
                    _ => unreachable!("active interval without a register"),
                };
                // The victim keeps its register up to here; the rest of
                // it lives in its spill slot.
                let remainder =
                    split_interval(&mut intervals, &mut vreg_intervals, victim_id, start);
                let victim_vreg = intervals[remainder].vreg;
                let slot = spill_slot_for(cu, &mut spill_slots, victim_vreg);
                intervals[remainder].loc = Some(Loc::Slot(slot));
                active.retain(|&a| a != victim_id);

                // The register may still be blocked later in our range.
                match blocked.first_conflict(reg, start, end) {
                    None => {
                        intervals[id].loc = Some(Loc::Reg(reg));
                        active.push(id);
                    }
                    Some(conflict) if conflict > start => {
                        let child =
                            split_interval(&mut intervals, &mut vreg_intervals, id, conflict);
                        intervals[id].loc = Some(Loc::Reg(reg));
                        active.push(id);
                        unhandled.push(std::cmp::Reverse((intervals[child].start, child)));
                    }
                    Some(_) => {
                        let slot = spill_slot_for(cu, &mut spill_slots, vreg);
                        intervals[id].loc = Some(Loc::Slot(slot));
                    }
                }
            }
            _ => {
                let slot = spill_slot_for(cu, &mut spill_slots, vreg);
                intervals[id].loc = Some(Loc::Slot(slot));
            }
        }
    }

    for list in vreg_intervals.values_mut() {
        list.sort_by_key(|&id| intervals[id].start);
    }

    trace!(
        "regalloc: {} intervals, {} spill slots",
        intervals.len(),
        spill_slots.len()
    );

    Allocation {
        intervals,
        vreg_intervals,
        block_ranges,
        spill_slots,
    }
}

/// Split an interval at `pos`, returning the new child covering
/// `[pos, end)`.
fn split_interval(
    intervals: &mut PrimaryMap<IntervalId, Interval>,
    vreg_intervals: &mut FxHashMap<VReg, Vec<IntervalId>>,
    id: IntervalId,
    pos: u32,
) -> IntervalId {
    let (vreg, end, child_uses) = {
        let interval = &intervals[id];
        debug_assert!(pos > interval.start && pos < interval.end);
        let child_uses = interval.uses.iter().copied().filter(|&u| u >= pos).collect();
        (interval.vreg, interval.end, child_uses)
    };
    intervals[id].end = pos;
    intervals[id].uses.retain(|&u| u < pos);
    let child = intervals.push(Interval {
        vreg,
        start: pos,
        end,
        uses: child_uses,
        loc: None,
    });
    vreg_intervals.entry(vreg).or_default().push(child);
    child
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_ranges_report_first_conflict() {
        let mut blocked = BlockedRanges::new();
        blocked.block(MachReg::Ax, 10, 14);
        blocked.block(MachReg::Ax, 30, 32);
        blocked.finish();
        assert_eq!(blocked.first_conflict(MachReg::Ax, 0, 10), None);
        assert_eq!(blocked.first_conflict(MachReg::Ax, 0, 12), Some(10));
        assert_eq!(blocked.first_conflict(MachReg::Ax, 12, 40), Some(12));
        assert_eq!(blocked.first_conflict(MachReg::Ax, 14, 30), None);
        assert_eq!(blocked.first_conflict(MachReg::Cx, 0, 100), None);
    }
}
