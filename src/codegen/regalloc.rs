//! First-fit linear register allocation over the callee-saved pool
//! `{RBX, R12, R13, R14, R15}`, spilling to the stack when the pool is
//! exhausted.
//!
//! Live intervals are computed over the function's already-linearized
//! instruction stream (the order `ir::gen` emitted them in, which already
//! places a loop's body textually between its start and end labels). A
//! vreg's interval is `[first definition, last use]` in that order; this
//! is exactly the classical linear-scan allocator, specialized to a
//! control-flow shape where textual order already matches the loop
//! nesting it needs to respect.

use crate::ir::instr::{IRFunction, OpcodeFormat, VReg, INVALID_VREG};

use super::x86::{Reg, CALLEE_SAVED_POOL};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Register(Reg),
    /// A spill slot, numbered independently of the source-level stack
    /// slots `ir::gen` allocated for stack-resident locals — the two
    /// ranges are combined into one frame by `super::builder::frame_layout`.
    Spill(usize),
}

/// A vreg-indexed location table. `get_location` is a pure lookup —
/// idempotent by construction, since the allocation itself never changes
/// once computed.
pub struct Allocation {
    locations: Vec<Option<Location>>,
    pub spill_count: usize,
}

impl Allocation {
    pub fn get_location(&self, vreg: VReg) -> Location {
        self.locations[vreg].expect("vreg was never assigned a location by regalloc")
    }

    /// `None` when `vreg` has no live interval — e.g. a parameter the
    /// body never reads, which `alloc_vreg` still reserves a slot for
    /// but which this allocator never touched.
    pub fn get_location_opt(&self, vreg: VReg) -> Option<Location> {
        self.locations[vreg]
    }
}

#[derive(Clone, Copy)]
struct Interval {
    start: usize,
    end: usize,
}

pub fn allocate(f: &IRFunction) -> Allocation {
    let mut intervals: Vec<Option<Interval>> = vec![None; f.vreg_count];

    let mut touch = |intervals: &mut Vec<Option<Interval>>, vreg: VReg, idx: usize| {
        if vreg == INVALID_VREG {
            return;
        }
        match &mut intervals[vreg] {
            Some(iv) => iv.end = idx,
            None => intervals[vreg] = Some(Interval { start: idx, end: idx }),
        }
    };

    for (idx, inst) in f.instructions().enumerate() {
        match inst.opcode.format() {
            OpcodeFormat::Bin | OpcodeFormat::Cmp => {
                touch(&mut intervals, inst.dest, idx);
                touch(&mut intervals, inst.src1, idx);
                touch(&mut intervals, inst.src2, idx);
            }
            OpcodeFormat::Unary => {
                touch(&mut intervals, inst.dest, idx);
                touch(&mut intervals, inst.src1, idx);
            }
            OpcodeFormat::Imm => touch(&mut intervals, inst.dest, idx),
            OpcodeFormat::Call => touch(&mut intervals, inst.dest, idx),
            OpcodeFormat::Arg => touch(&mut intervals, inst.src1, idx),
            OpcodeFormat::Memory => {
                touch(&mut intervals, inst.dest, idx);
                touch(&mut intervals, inst.src1, idx);
            }
            OpcodeFormat::Ret => touch(&mut intervals, inst.src1, idx),
            OpcodeFormat::Jump | OpcodeFormat::Branch | OpcodeFormat::Label => {
                touch(&mut intervals, inst.src1, idx);
            }
        }
    }

    let mut locations: Vec<Option<Location>> = vec![None; f.vreg_count];
    let mut free_pool: Vec<bool> = vec![true; CALLEE_SAVED_POOL.len()];
    // active[i] = Some(end) when CALLEE_SAVED_POOL[i] currently holds a live vreg.
    let mut active: Vec<Option<usize>> = vec![None; CALLEE_SAVED_POOL.len()];
    let mut spill_count = 0;

    for vreg in 1..f.vreg_count {
        let Some(interval) = &intervals[vreg] else {
            continue;
        };

        for slot in 0..CALLEE_SAVED_POOL.len() {
            if let Some(end) = active[slot] {
                if end < interval.start {
                    active[slot] = None;
                    free_pool[slot] = true;
                }
            }
        }

        if let Some(slot) = free_pool.iter().position(|&free| free) {
            free_pool[slot] = false;
            active[slot] = Some(interval.end);
            locations[vreg] = Some(Location::Register(CALLEE_SAVED_POOL[slot]));
        } else {
            locations[vreg] = Some(Location::Spill(spill_count));
            spill_count += 1;
        }
    }

    Allocation {
        locations,
        spill_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Sink;
    use crate::front::lex::Lexer;
    use crate::front::parse::parse;
    use crate::ir::gen_function;

    fn alloc_first_function(src: &str) -> (IRFunction, Allocation) {
        let mut sink = Sink::new();
        let tokens = Lexer::new(src, "<test>").tokenize(&mut sink);
        let unit = parse(&tokens, "<test>", &mut sink);
        let f = gen_function(&unit.functions[0], "<test>", &mut sink).unwrap();
        let alloc = allocate(&f);
        (f, alloc)
    }

    #[test]
    fn few_vregs_all_get_registers() {
        let (f, alloc) = alloc_first_function("int add(int a, int b) { return a + b; }");
        assert_eq!(alloc.spill_count, 0);
        for vreg in 1..f.vreg_count {
            assert!(matches!(alloc.get_location(vreg), Location::Register(_)));
        }
    }

    #[test]
    fn exhausting_the_pool_spills() {
        let (_, alloc) = alloc_first_function(
            "int many(int a, int b, int c, int d, int e, int g) { return a + b + c + d + e + g; }",
        );
        assert!(alloc.spill_count > 0);
    }
}
