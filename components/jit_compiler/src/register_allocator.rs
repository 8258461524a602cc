//! Register allocation over virtual registers.
//!
//! Two strategies over the same inputs: linear scan with the
//! furthest-end spill heuristic, and Chaitin/Briggs graph coloring with
//! degree-based simplification. Both consume completed liveness analysis
//! and produce, for every virtual register, either a physical register of
//! the matching class or a frame spill slot. Reserved (ABI-fixed)
//! registers never appear as candidates. The allocator is deterministic:
//! the same input always produces the same assignment.

use crate::ir::{IrFunction, RegClass, VirtualReg};
use crate::liveness::{LiveInterval, Liveness};
use std::collections::HashMap;

/// A physical register id within its class's encoding space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg(pub u8);

/// Allocation class: register classes that share a physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocClass {
    /// General-purpose registers (int32/int64)
    Gp,
    /// Floating-point registers
    Fp,
    /// Vector registers
    Vec,
}

impl AllocClass {
    /// Map an IR register class to its allocation class.
    pub fn of(class: RegClass) -> Self {
        match class {
            RegClass::Int32 | RegClass::Int64 => AllocClass::Gp,
            RegClass::Float32 | RegClass::Float64 => AllocClass::Fp,
            RegClass::Vector => AllocClass::Vec,
        }
    }

    /// Spill-slot size in bytes.
    pub fn spill_size(self) -> u32 {
        match self {
            AllocClass::Vec => 16,
            _ => 8,
        }
    }
}

/// The usable physical registers per class, reserved ones excluded.
#[derive(Debug, Clone)]
pub struct PhysRegFile {
    /// Allocatable general-purpose registers
    pub gp: Vec<PhysReg>,
    /// Allocatable floating-point registers
    pub fp: Vec<PhysReg>,
    /// Allocatable vector registers
    pub vec: Vec<PhysReg>,
}

impl PhysRegFile {
    fn class(&self, class: AllocClass) -> &[PhysReg] {
        match class {
            AllocClass::Gp => &self.gp,
            AllocClass::Fp => &self.fp,
            AllocClass::Vec => &self.vec,
        }
    }
}

/// Where a virtual register ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// A physical register
    Register(PhysReg),
    /// A frame spill slot at this byte offset
    Spill(u32),
}

/// Allocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// Linear scan over sorted intervals
    LinearScan,
    /// Chaitin/Briggs interference-graph coloring
    GraphColoring,
}

/// The allocator's output.
#[derive(Debug, Clone)]
pub struct RegisterAllocation {
    /// Per-register assignment; complete over all live registers
    pub assignments: HashMap<VirtualReg, Assignment>,
    /// Total spill area in bytes
    pub frame_size: u32,
}

struct SpillSlots {
    next: u32,
}

impl SpillSlots {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn take(&mut self, class: AllocClass) -> u32 {
        let size = class.spill_size();
        // Slots are naturally aligned to their size
        let offset = (self.next + size - 1) / size * size;
        self.next = offset + size;
        offset
    }
}

/// Allocate registers for a function.
pub fn allocate(
    f: &IrFunction,
    liveness: &Liveness,
    file: &PhysRegFile,
    strategy: AllocStrategy,
) -> RegisterAllocation {
    let mut assignments = HashMap::new();
    let mut slots = SpillSlots::new();
    for class in [AllocClass::Gp, AllocClass::Fp, AllocClass::Vec] {
        let intervals: Vec<LiveInterval> = liveness
            .sorted_intervals()
            .into_iter()
            .filter(|i| AllocClass::of(f.reg_class(i.reg)) == class)
            .collect();
        if intervals.is_empty() {
            continue;
        }
        match strategy {
            AllocStrategy::LinearScan => {
                linear_scan(&intervals, file.class(class), class, &mut slots, &mut assignments)
            }
            AllocStrategy::GraphColoring => {
                graph_color(&intervals, file.class(class), class, &mut slots, &mut assignments)
            }
        }
    }
    RegisterAllocation {
        assignments,
        frame_size: slots.next,
    }
}

/// Linear scan. Active intervals are kept ordered by end position; when
/// no register is free, the interval with the furthest end among the
/// current and active ones is spilled.
fn linear_scan(
    intervals: &[LiveInterval],
    regs: &[PhysReg],
    class: AllocClass,
    slots: &mut SpillSlots,
    assignments: &mut HashMap<VirtualReg, Assignment>,
) {
    // (end, reg, phys)
    let mut active: Vec<(u32, VirtualReg, PhysReg)> = Vec::new();
    let mut free: Vec<PhysReg> = regs.to_vec();
    free.reverse(); // pop() hands out low-numbered registers first

    for interval in intervals {
        let start = interval.start();
        // Expire intervals whose last read happens no later than this
        // one's definition
        let mut index = 0;
        while index < active.len() {
            if active[index].0 <= start {
                let (_, _, phys) = active.remove(index);
                free.push(phys);
            } else {
                index += 1;
            }
        }
        free.sort_by(|a, b| b.0.cmp(&a.0));

        if let Some(phys) = free.pop() {
            assignments.insert(interval.reg, Assignment::Register(phys));
            active.push((interval.end(), interval.reg, phys));
            active.sort_by_key(|(end, reg, _)| (*end, reg.0));
            continue;
        }

        // Spill whichever of {current, active} ends furthest out
        let furthest = active
            .iter()
            .enumerate()
            .max_by_key(|(_, (end, reg, _))| (*end, reg.0));
        match furthest {
            Some((index, &(end, _, phys))) if end > interval.end() => {
                let (_, victim, _) = active.remove(index);
                assignments.insert(victim, Assignment::Spill(slots.take(class)));
                assignments.insert(interval.reg, Assignment::Register(phys));
                active.push((interval.end(), interval.reg, phys));
                active.sort_by_key(|(end, reg, _)| (*end, reg.0));
            }
            _ => {
                assignments.insert(interval.reg, Assignment::Spill(slots.take(class)));
            }
        }
    }
}

/// Chaitin/Briggs coloring. Vertices of degree < K are simplified onto a
/// stack; when none remain, the longest live range is chosen as a spill
/// candidate. Popping assigns the lowest-indexed register not used by a
/// neighbor; spill-marked vertices take frame slots.
fn graph_color(
    intervals: &[LiveInterval],
    regs: &[PhysReg],
    class: AllocClass,
    slots: &mut SpillSlots,
    assignments: &mut HashMap<VirtualReg, Assignment>,
) {
    let k = regs.len();
    let by_reg: HashMap<VirtualReg, &LiveInterval> =
        intervals.iter().map(|i| (i.reg, i)).collect();

    // Interference graph: same-class intervals that overlap
    let mut edges: HashMap<VirtualReg, Vec<VirtualReg>> = HashMap::new();
    for interval in intervals {
        edges.entry(interval.reg).or_default();
    }
    for (index, a) in intervals.iter().enumerate() {
        for b in intervals.iter().skip(index + 1) {
            if a.overlaps(b) {
                edges.get_mut(&a.reg).unwrap().push(b.reg);
                edges.get_mut(&b.reg).unwrap().push(a.reg);
            }
        }
    }

    let mut remaining: Vec<VirtualReg> = intervals.iter().map(|i| i.reg).collect();
    let mut removed: HashMap<VirtualReg, bool> = HashMap::new();
    let degree = |reg: VirtualReg, removed: &HashMap<VirtualReg, bool>, edges: &HashMap<VirtualReg, Vec<VirtualReg>>| {
        edges[&reg]
            .iter()
            .filter(|n| !removed.get(n).copied().unwrap_or(false))
            .count()
    };

    // (reg, spill_marked)
    let mut stack: Vec<(VirtualReg, bool)> = Vec::new();
    while stack.len() < remaining.len() {
        let next_simplify = remaining
            .iter()
            .filter(|r| !removed.get(r).copied().unwrap_or(false))
            .find(|r| degree(**r, &removed, &edges) < k);
        match next_simplify {
            Some(&reg) => {
                removed.insert(reg, true);
                stack.push((reg, false));
            }
            None => {
                // Spill candidate: maximum live-range length
                let candidate = remaining
                    .iter()
                    .filter(|r| !removed.get(r).copied().unwrap_or(false))
                    .max_by_key(|r| {
                        let i = by_reg[r];
                        (i.end() - i.start(), r.0)
                    })
                    .copied();
                match candidate {
                    Some(reg) => {
                        removed.insert(reg, true);
                        stack.push((reg, true));
                    }
                    None => break,
                }
            }
        }
    }
    remaining.retain(|r| removed.get(r).copied().unwrap_or(false));

    let mut colors: HashMap<VirtualReg, PhysReg> = HashMap::new();
    while let Some((reg, spill_marked)) = stack.pop() {
        if spill_marked {
            assignments.insert(reg, Assignment::Spill(slots.take(class)));
            continue;
        }
        let taken: Vec<PhysReg> = edges[&reg]
            .iter()
            .filter_map(|n| colors.get(n).copied())
            .collect();
        match regs.iter().find(|r| !taken.contains(r)) {
            Some(&phys) => {
                colors.insert(reg, phys);
                assignments.insert(reg, Assignment::Register(phys));
            }
            None => {
                assignments.insert(reg, Assignment::Spill(slots.take(class)));
            }
        }
    }
}
