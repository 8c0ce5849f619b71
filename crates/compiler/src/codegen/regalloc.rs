//! Chaitin-style register allocation over live-range intervals.
//!
//! Temporaries get one live range each: from their defining instruction to
//! their last use. Ranges that overlap in time interfere and may not share
//! a register. The interference graph is colored by the classic
//! simplify/spill/select loop; node selection always follows registration
//! order, so allocation is deterministic for identical IR.
//!
//! All fourteen general-purpose registers besides the `rsp`/`rbp` frame
//! pair are allocatable. The lowering stage also needs scratch registers
//! for spill reloads and call/division sequences;
//! [`Allocation::unused_registers`] reports the registers no range was
//! colored with so the lowering can pick scratch that cannot alias a live
//! value whenever the function leaves room.

use std::collections::{HashMap, HashSet};

use super::x64::Reg;
use crate::ir::{IrFunction, is_temp};

/// Allocation preference order; "lowest-numbered register" means first
/// here.
pub const ALLOCATABLE: [Reg; 14] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::Rbx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

#[derive(Debug, Clone)]
pub struct LiveRange {
    pub temp: String,
    /// Index of the defining instruction.
    pub start: usize,
    /// Index of the last use.
    pub end: usize,
    pub reg: Option<Reg>,
    pub spilled: bool,
}

impl LiveRange {
    fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Where a temporary lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Reg(Reg),
    /// Index of an 8-byte spill slot; the lowering stage turns it into an
    /// `[rbp - offset]` address behind the function's named locals.
    Spill(usize),
}

#[derive(Debug)]
pub struct Allocation {
    pub locs: HashMap<String, Loc>,
    pub spill_count: usize,
    pub ranges: Vec<LiveRange>,
}

impl Allocation {
    pub fn loc(&self, temp: &str) -> Option<Loc> {
        self.locs.get(temp).copied()
    }

    /// Registers no live range was colored with, in allocation order.
    /// Safe scratch for the lowering stage, when any exist.
    pub fn unused_registers(&self) -> Vec<Reg> {
        ALLOCATABLE
            .iter()
            .copied()
            .filter(|&r| !self.ranges.iter().any(|range| range.reg == Some(r)))
            .collect()
    }
}

/// Allocate every temporary in the function to a register or spill slot.
pub fn allocate(func: &IrFunction) -> Allocation {
    let mut ranges = compute_live_ranges(func);
    let adjacency = build_interference(&ranges);
    let (colors, spills) = color(&ranges, &adjacency);

    let mut locs = HashMap::new();
    let mut spill_count = 0;
    for (i, range) in ranges.iter_mut().enumerate() {
        if spills.contains(&i) {
            range.spilled = true;
            locs.insert(range.temp.clone(), Loc::Spill(spill_count));
            spill_count += 1;
        } else if let Some(&reg) = colors.get(&i) {
            range.reg = Some(reg);
            locs.insert(range.temp.clone(), Loc::Reg(reg));
        }
    }

    Allocation {
        locs,
        spill_count,
        ranges,
    }
}

/// One backward-extending interval per temporary, in registration order.
fn compute_live_ranges(func: &IrFunction) -> Vec<LiveRange> {
    let mut ranges: Vec<LiveRange> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for (i, instr) in func.instructions.iter().enumerate() {
        if let Some(result) = &instr.result {
            if is_temp(result) {
                match by_name.get(result) {
                    Some(&idx) => ranges[idx].end = ranges[idx].end.max(i),
                    None => {
                        by_name.insert(result.clone(), ranges.len());
                        ranges.push(LiveRange {
                            temp: result.clone(),
                            start: i,
                            end: i,
                            reg: None,
                            spilled: false,
                        });
                    }
                }
            }
        }
        for arg in &instr.args {
            if is_temp(arg) {
                match by_name.get(arg) {
                    Some(&idx) => ranges[idx].end = ranges[idx].end.max(i),
                    None => {
                        // Use without a visible definition; give it a point
                        // range so allocation still succeeds.
                        by_name.insert(arg.clone(), ranges.len());
                        ranges.push(LiveRange {
                            temp: arg.clone(),
                            start: i,
                            end: i,
                            reg: None,
                            spilled: false,
                        });
                    }
                }
            }
        }
    }

    ranges
}

fn build_interference(ranges: &[LiveRange]) -> Vec<HashSet<usize>> {
    let mut adjacency = vec![HashSet::new(); ranges.len()];
    for i in 0..ranges.len() {
        for j in i + 1..ranges.len() {
            if ranges[i].overlaps(&ranges[j]) {
                adjacency[i].insert(j);
                adjacency[j].insert(i);
            }
        }
    }
    adjacency
}

/// Simplify/spill/select. Returns the register of each colored node and the
/// set of spilled nodes.
fn color(
    ranges: &[LiveRange],
    adjacency: &[HashSet<usize>],
) -> (HashMap<usize, Reg>, HashSet<usize>) {
    let k = ALLOCATABLE.len();
    let n = ranges.len();
    let mut removed = vec![false; n];
    let mut spilled: HashSet<usize> = HashSet::new();
    let mut stack: Vec<(usize, HashSet<usize>)> = Vec::new();
    let mut remaining = n;

    let degree = |node: usize, removed: &[bool]| -> usize {
        adjacency[node].iter().filter(|&&m| !removed[m]).count()
    };

    while remaining > 0 {
        // First node (registration order) that trivially colors.
        let pick = (0..n).find(|&i| !removed[i] && degree(i, &removed) < k);
        match pick {
            Some(node) => {
                let neighbors: HashSet<usize> = adjacency[node]
                    .iter()
                    .copied()
                    .filter(|&m| !removed[m])
                    .collect();
                stack.push((node, neighbors));
                removed[node] = true;
                remaining -= 1;
            }
            None => {
                // Everything has k or more neighbors: spill the node with
                // the smallest degree, earliest registration on ties.
                let node = (0..n)
                    .filter(|&i| !removed[i])
                    .min_by_key(|&i| (degree(i, &removed), i))
                    .expect("remaining > 0");
                spilled.insert(node);
                removed[node] = true;
                remaining -= 1;
            }
        }
    }

    let mut colors: HashMap<usize, Reg> = HashMap::new();
    while let Some((node, neighbors)) = stack.pop() {
        let used: HashSet<Reg> = neighbors
            .iter()
            .filter_map(|m| colors.get(m).copied())
            .collect();
        match ALLOCATABLE.iter().find(|r| !used.contains(r)) {
            Some(&reg) => {
                colors.insert(node, reg);
            }
            None => {
                spilled.insert(node);
            }
        }
    }

    (colors, spilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::ir::IrGenerator;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn func_ir(source: &str, name: &str) -> IrFunction {
        let mut diags = Diagnostics::new("test.mf");
        let tokens = Lexer::new(source).tokenize(&mut diags);
        let program = Parser::new(tokens).parse(&mut diags);
        assert!(!diags.has_errors(), "{}", diags.render());
        let module = IrGenerator::new().generate(&program).unwrap();
        module.find_function(name).unwrap().clone()
    }

    /// A right-nested product keeping `terms` temporaries alive at once:
    /// every `(a + i)` stays live until the whole nested tail is computed.
    fn pressure_source(terms: usize) -> String {
        let mut expr = format!("(a + {})", terms - 1);
        for i in (0..terms - 1).rev() {
            expr = format!("(a + {}) * ({})", i, expr);
        }
        format!("fn f(a: i64) -> i64 {{ return {}; }}", expr)
    }

    #[test]
    fn test_simple_function_uses_registers_only() {
        let f = func_ir("fn f(a: i32, b: i32) -> i32 { return a + b; }", "f");
        let alloc = allocate(&f);
        assert_eq!(alloc.spill_count, 0);
        for range in &alloc.ranges {
            assert!(range.reg.is_some(), "range {:?} missing a register", range);
        }
    }

    #[test]
    fn test_interfering_ranges_get_distinct_registers() {
        let f = func_ir(&pressure_source(8), "f");
        let alloc = allocate(&f);
        for i in 0..alloc.ranges.len() {
            for j in i + 1..alloc.ranges.len() {
                let (a, b) = (&alloc.ranges[i], &alloc.ranges[j]);
                if a.overlaps(b) && a.reg.is_some() && b.reg.is_some() {
                    assert_ne!(
                        a.reg, b.reg,
                        "{} and {} interfere but share {:?}",
                        a.temp, b.temp, a.reg
                    );
                }
            }
        }
    }

    #[test]
    fn test_pressure_forces_spills() {
        // More simultaneously live temporaries than registers.
        let f = func_ir(&pressure_source(20), "f");
        let alloc = allocate(&f);
        assert!(
            alloc.spill_count >= 6,
            "expected at least 6 spills, got {}",
            alloc.spill_count
        );
        // Every temp has a location.
        for range in &alloc.ranges {
            assert!(alloc.loc(&range.temp).is_some());
        }
    }

    #[test]
    fn test_frame_registers_are_never_allocated() {
        let f = func_ir(&pressure_source(20), "f");
        let alloc = allocate(&f);
        for range in &alloc.ranges {
            assert_ne!(range.reg, Some(Reg::Rsp));
            assert_ne!(range.reg, Some(Reg::Rbp));
        }
    }

    #[test]
    fn test_full_palette_is_used_under_pressure() {
        let f = func_ir(&pressure_source(20), "f");
        let alloc = allocate(&f);
        let regs: HashSet<Reg> = alloc.ranges.iter().filter_map(|r| r.reg).collect();
        assert_eq!(regs.len(), ALLOCATABLE.len(), "all 14 registers in play");
        assert!(regs.contains(&Reg::R10));
        assert!(regs.contains(&Reg::R11));
    }

    #[test]
    fn test_unused_registers_reported_for_light_functions() {
        let f = func_ir("fn f(a: i32, b: i32) -> i32 { return a + b; }", "f");
        let alloc = allocate(&f);
        let unused = alloc.unused_registers();
        assert!(unused.contains(&Reg::R11));
        assert!(unused.contains(&Reg::R15));
        assert!(!unused.contains(&Reg::Rax));
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let f = func_ir(&pressure_source(16), "f");
        let a = allocate(&f);
        let b = allocate(&f);
        for range in &a.ranges {
            assert_eq!(a.loc(&range.temp), b.loc(&range.temp));
        }
    }

    #[test]
    fn test_non_overlapping_ranges_share_registers() {
        // Sequential statements; temporaries die quickly, so the first
        // register gets reused.
        let f = func_ir(
            "fn f() -> i32 { let a: i32 = 1; let b: i32 = 2; let c: i32 = 3; return c; }",
            "f",
        );
        let alloc = allocate(&f);
        let regs: HashSet<Reg> = alloc.ranges.iter().filter_map(|r| r.reg).collect();
        assert_eq!(regs.len(), 1, "expected full reuse, got {:?}", alloc.ranges);
        assert!(regs.contains(&Reg::Rax));
    }

    #[test]
    fn test_spilled_temps_get_consecutive_slots() {
        let f = func_ir(&pressure_source(20), "f");
        let alloc = allocate(&f);
        let mut slots: Vec<usize> = alloc
            .locs
            .values()
            .filter_map(|l| match l {
                Loc::Spill(s) => Some(*s),
                _ => None,
            })
            .collect();
        slots.sort_unstable();
        let expected: Vec<usize> = (0..alloc.spill_count).collect();
        assert_eq!(slots, expected);
    }
}
