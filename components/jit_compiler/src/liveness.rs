//! Live-interval computation over the IR.
//!
//! Blocks are laid out in reachable preorder and instructions numbered
//! linearly; backward dataflow produces per-block live-in/live-out sets,
//! which are then refined into ordered, non-overlapping `[start, end]`
//! ranges per virtual register with a spill-weight heuristic.

use crate::ir::{BlockId, IrFunction, IrOpcode, VirtualReg};
use std::collections::{HashMap, HashSet};

/// The live interval of one virtual register.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveInterval {
    /// The register
    pub reg: VirtualReg,
    /// Ordered, non-overlapping ranges of instruction numbers
    pub ranges: Vec<(u32, u32)>,
    /// Uses per unit of length; higher means more expensive to spill
    pub spill_weight: f32,
}

impl LiveInterval {
    /// First instruction number where the register is live.
    pub fn start(&self) -> u32 {
        self.ranges.first().map(|r| r.0).unwrap_or(0)
    }

    /// Last instruction number where the register is live.
    pub fn end(&self) -> u32 {
        self.ranges.last().map(|r| r.1).unwrap_or(0)
    }

    /// Whether two intervals are simultaneously live anywhere. A range
    /// ending exactly where another starts does not conflict: the old
    /// value's last read happens before the new value's write.
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        let mut a = self.ranges.iter().peekable();
        let mut b = other.ranges.iter().peekable();
        while let (Some(x), Some(y)) = (a.peek(), b.peek()) {
            if x.1 <= y.0 {
                a.next();
            } else if y.1 <= x.0 {
                b.next();
            } else {
                return true;
            }
        }
        false
    }

    fn add_range(&mut self, start: u32, end: u32) {
        self.ranges.push((start, end));
    }

    fn normalize(&mut self) {
        self.ranges.sort();
        let mut merged: Vec<(u32, u32)> = Vec::new();
        for (start, end) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
    }
}

/// The result of liveness analysis.
#[derive(Debug, Clone)]
pub struct Liveness {
    /// Intervals, keyed by register
    pub intervals: HashMap<VirtualReg, LiveInterval>,
    /// Block layout order used for numbering
    pub layout: Vec<BlockId>,
    /// Instruction numbering range per block: `[start, end)`
    pub block_spans: HashMap<BlockId, (u32, u32)>,
}

impl Liveness {
    /// Intervals sorted by start position, the linear-scan work order.
    pub fn sorted_intervals(&self) -> Vec<LiveInterval> {
        let mut out: Vec<LiveInterval> = self.intervals.values().cloned().collect();
        out.sort_by_key(|i| (i.start(), i.reg.0));
        out
    }
}

/// Compute liveness for a function.
pub fn compute_liveness(f: &IrFunction) -> Liveness {
    let layout = f.reachable_blocks();
    let mut block_spans = HashMap::new();
    let mut numbering: HashMap<(BlockId, usize), u32> = HashMap::new();
    let mut next = 0u32;
    for &block in &layout {
        let start = next;
        for (slot, _) in f.block_insts(block).iter().enumerate() {
            numbering.insert((block, slot), next);
            next += 1;
        }
        // Every block occupies at least one position
        if next == start {
            next += 1;
        }
        block_spans.insert(block, (start, next));
    }

    // Per-block use/def sets; phi operands count as uses at the end of
    // the corresponding predecessor
    let mut uses: HashMap<BlockId, HashSet<VirtualReg>> = HashMap::new();
    let mut defs: HashMap<BlockId, HashSet<VirtualReg>> = HashMap::new();
    let mut phi_uses: HashMap<BlockId, HashSet<VirtualReg>> = HashMap::new();
    for &block in &layout {
        let mut use_set = HashSet::new();
        let mut def_set = HashSet::new();
        for &id in &f.block(block).phis {
            if let Some(result) = f.inst(id).result {
                def_set.insert(result);
            }
            for (pred_index, operand) in f.inst(id).operands.iter().enumerate() {
                if let Some(reg) = operand.as_reg() {
                    if let Some(&pred) = f.block(block).predecessors.get(pred_index) {
                        phi_uses.entry(pred).or_default().insert(reg);
                    }
                }
            }
        }
        for &id in &f.block(block).instructions {
            let inst = f.inst(id);
            for reg in inst.uses() {
                if !def_set.contains(&reg) {
                    use_set.insert(reg);
                }
            }
            if let Some(result) = inst.result {
                def_set.insert(result);
            }
        }
        uses.insert(block, use_set);
        defs.insert(block, def_set);
    }

    // Backward dataflow to a fixed point
    let mut live_in: HashMap<BlockId, HashSet<VirtualReg>> = HashMap::new();
    let mut live_out: HashMap<BlockId, HashSet<VirtualReg>> = HashMap::new();
    for &block in &layout {
        live_in.insert(block, HashSet::new());
        live_out.insert(block, HashSet::new());
    }
    let mut changed = true;
    while changed {
        changed = false;
        for &block in layout.iter().rev() {
            let mut out: HashSet<VirtualReg> = phi_uses.get(&block).cloned().unwrap_or_default();
            for &succ in &f.block(block).successors {
                if let Some(succ_in) = live_in.get(&succ) {
                    out.extend(succ_in.iter().copied());
                }
            }
            let mut inn: HashSet<VirtualReg> = out.clone();
            for reg in &defs[&block] {
                inn.remove(reg);
            }
            inn.extend(uses[&block].iter().copied());
            if out != live_out[&block] || inn != live_in[&block] {
                live_out.insert(block, out);
                live_in.insert(block, inn);
                changed = true;
            }
        }
    }

    // Refine to ranges, walking each block backward
    let mut intervals: HashMap<VirtualReg, LiveInterval> = HashMap::new();
    let mut use_counts: HashMap<VirtualReg, u32> = HashMap::new();
    let interval = |map: &mut HashMap<VirtualReg, LiveInterval>, reg: VirtualReg| {
        map.entry(reg).or_insert_with(|| LiveInterval {
            reg,
            ranges: Vec::new(),
            spill_weight: 0.0,
        });
    };
    for &block in &layout {
        let (block_start, block_end) = block_spans[&block];
        let last = block_end.saturating_sub(1);
        let mut live_until: HashMap<VirtualReg, u32> = HashMap::new();
        for &reg in &live_out[&block] {
            live_until.insert(reg, last);
        }
        let insts = f.block_insts(block);
        for slot in (0..insts.len()).rev() {
            let n = numbering[&(block, slot)];
            let inst = f.inst(insts[slot]);
            if let Some(result) = inst.result {
                interval(&mut intervals, result);
                match live_until.remove(&result) {
                    Some(end) => intervals.get_mut(&result).unwrap().add_range(n, end),
                    // A dead definition still occupies its own position
                    None => intervals.get_mut(&result).unwrap().add_range(n, n),
                }
            }
            if inst.opcode != IrOpcode::Phi {
                for reg in inst.uses() {
                    *use_counts.entry(reg).or_insert(0) += 1;
                    live_until.entry(reg).or_insert(n);
                }
            }
        }
        for (reg, end) in live_until {
            interval(&mut intervals, reg);
            intervals.get_mut(&reg).unwrap().add_range(block_start, end);
        }
    }

    for interval in intervals.values_mut() {
        interval.normalize();
        let length = (interval.end() - interval.start() + 1) as f32;
        let count = use_counts.get(&interval.reg).copied().unwrap_or(0) as f32;
        interval.spill_weight = (count + 1.0) / length;
    }

    Liveness {
        intervals,
        layout,
        block_spans,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrInst, Operand, RegClass};

    #[test]
    fn test_straight_line_intervals() {
        let mut f = IrFunction::new(0);
        let a = f.new_reg(RegClass::Int64);
        let b = f.new_reg(RegClass::Int64);
        let c = f.new_reg(RegClass::Int64);
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::LoadConst, Some(a), vec![Operand::ImmI64(1)]),
        );
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::LoadConst, Some(b), vec![Operand::ImmI64(2)]),
        );
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::Add, Some(c), vec![Operand::Reg(a), Operand::Reg(b)]),
        );
        f.emit(f.entry, IrInst::new(IrOpcode::Return, None, vec![Operand::Reg(c)]));

        let liveness = compute_liveness(&f);
        let ia = &liveness.intervals[&a];
        let ic = &liveness.intervals[&c];
        assert_eq!(ia.ranges, vec![(0, 2)]);
        assert_eq!(ic.ranges, vec![(2, 3)]);
        assert!(ia.overlaps(&liveness.intervals[&b]));
        assert!(!ia.overlaps(ic) || ia.end() == ic.start());
    }

    #[test]
    fn test_loop_keeps_value_live_across_back_edge() {
        let mut f = IrFunction::new(0);
        let header = f.new_block();
        let body = f.new_block();
        let done = f.new_block();
        let x = f.new_reg(RegClass::Int64);
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::LoadConst, Some(x), vec![Operand::ImmI64(5)]),
        );
        f.emit(f.entry, IrInst::new(IrOpcode::Jump, None, vec![Operand::Label(header)]));
        f.add_edge(f.entry, header);
        let cond = f.new_reg(RegClass::Int64);
        f.emit(
            header,
            IrInst::new(IrOpcode::Lt, Some(cond), vec![Operand::Reg(x), Operand::ImmI64(10)]),
        );
        f.emit(
            header,
            IrInst::new(
                IrOpcode::Branch,
                None,
                vec![Operand::Reg(cond), Operand::Label(body), Operand::Label(done)],
            ),
        );
        f.add_edge(header, body);
        f.add_edge(header, done);
        f.emit(
            body,
            IrInst::new(
                IrOpcode::StoreEnv,
                None,
                vec![Operand::ImmI64(0), Operand::ImmI64(0), Operand::Reg(x)],
            ),
        );
        f.emit(body, IrInst::new(IrOpcode::Jump, None, vec![Operand::Label(header)]));
        f.add_edge(body, header);
        f.emit(done, IrInst::new(IrOpcode::Return, None, vec![]));

        let liveness = compute_liveness(&f);
        let ix = &liveness.intervals[&x];
        // x stays live through the loop body
        let (body_start, body_end) = liveness.block_spans[&body];
        assert!(ix.start() <= body_start && ix.end() >= body_end - 1);
    }

    #[test]
    fn test_spill_weight_favors_hot_regs() {
        let mut f = IrFunction::new(0);
        let hot = f.new_reg(RegClass::Int64);
        let cold = f.new_reg(RegClass::Int64);
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::LoadConst, Some(hot), vec![Operand::ImmI64(1)]),
        );
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::LoadConst, Some(cold), vec![Operand::ImmI64(2)]),
        );
        let mut last = hot;
        for _ in 0..4 {
            let r = f.new_reg(RegClass::Int64);
            f.emit(
                f.entry,
                IrInst::new(IrOpcode::Add, Some(r), vec![Operand::Reg(hot), Operand::Reg(last)]),
            );
            last = r;
        }
        let sum = f.new_reg(RegClass::Int64);
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::Add, Some(sum), vec![Operand::Reg(last), Operand::Reg(cold)]),
        );
        f.emit(f.entry, IrInst::new(IrOpcode::Return, None, vec![Operand::Reg(sum)]));

        let liveness = compute_liveness(&f);
        assert!(
            liveness.intervals[&hot].spill_weight > liveness.intervals[&cold].spill_weight
        );
    }
}
