//! Best-effort block-local register promotion.
//!
//! A vreg whose entire lifetime sits strictly inside one block (live
//! neither at block entry nor at block exit) can stay in a physical
//! register instead of its stack slot. Candidates are assigned greedily in
//! first-use order from a small pool, and a pool register is reused as
//! soon as its occupant's last in-block mention passes. Vregs that cross a
//! block boundary are left alone for lowering to place in memory.
//!
//! Pool choice: rcx, r8, r9. Lowering reserves r10/r11 as expansion
//! scratch and rax/rdx for the division idiom, so those are off limits.
//! The pool registers double as argument channels (vr4/vr5/vr6); a pool
//! register is withheld from any block that mentions its channel, so
//! argument setup ahead of a call is never clobbered.

use crate::common::error::Result;
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::types::Width;
use crate::ir::cfg::{BasicBlock, ControlFlowGraph};
use crate::ir::instruction::{HighOp, Instruction};
use crate::ir::liveness::LiveVregs;
use crate::ir::operand::{Mreg, Operand, VREG_FIRST_LOCAL};
use crate::passes::transform::rewrite_blocks;

const POOL: [Mreg; 3] = [Mreg::Rcx, Mreg::R8, Mreg::R9];

/// Argument-channel vreg corresponding to each pool register.
const POOL_CHANNEL: [u32; 3] = [4, 5, 6];

pub fn run(cfg: &ControlFlowGraph) -> Result<(ControlFlowGraph, usize)> {
    rewrite_blocks(cfg, promote_block)
}

fn promote_block(
    block: &BasicBlock,
    live: &LiveVregs,
) -> Result<(Vec<Instruction<HighOp>>, usize)> {
    let entry = live.before_block(block.id);
    let exit = live.after_block(block.id);

    // Last mention of each vreg, and which pool registers this block may
    // use at all.
    let mut last_mention: FxHashMap<u32, usize> = FxHashMap::default();
    let mut usable = [true; POOL.len()];
    for (idx, ins) in block.instrs.iter().enumerate() {
        for op in &ins.operands {
            if let Some(r) = op.base_vreg() {
                last_mention.insert(r, idx);
                for (slot, &channel) in POOL_CHANNEL.iter().enumerate() {
                    if r == channel {
                        usable[slot] = false;
                    }
                }
            }
        }
    }

    // vreg -> assigned pool register, and per-slot expiry index. A
    // candidate gets its one chance at first use; assigning mid-lifetime
    // would split the vreg between a register and its stack slot.
    let mut assigned: FxHashMap<u32, Mreg> = FxHashMap::default();
    let mut rejected: FxHashSet<u32> = FxHashSet::default();
    let mut occupied_until: [Option<usize>; POOL.len()] = [None; POOL.len()];
    let mut out = Vec::with_capacity(block.len());
    let mut promoted = 0;

    for (idx, ins) in block.instrs.iter().enumerate() {
        for slot in occupied_until.iter_mut() {
            if slot.map_or(false, |end| end < idx) {
                *slot = None;
            }
        }

        let mut ins = ins.clone();
        for op in ins.operands.iter_mut() {
            let r = match op.base_vreg() {
                Some(r) => r,
                None => continue,
            };
            if let Some(&m) = assigned.get(&r) {
                rewrite(op, m);
                continue;
            }
            if r < VREG_FIRST_LOCAL
                || rejected.contains(&r)
                || entry.contains(r)
                || exit.contains(r)
            {
                continue;
            }
            let end = match last_mention.get(&r) {
                Some(&end) => end,
                None => continue,
            };
            match (0..POOL.len()).find(|&s| usable[s] && occupied_until[s].is_none()) {
                Some(slot) => {
                    occupied_until[slot] = Some(end);
                    assigned.insert(r, POOL[slot]);
                    rewrite(op, POOL[slot]);
                    promoted += 1;
                }
                None => {
                    rejected.insert(r);
                }
            }
        }
        out.push(ins);
    }

    Ok((out, promoted))
}

/// Replace a vreg operand with its pool register, preserving the operand's
/// register/memory shape. Lowering sizes register operands by the
/// instruction's own width.
fn rewrite(op: &mut Operand, m: Mreg) {
    match op {
        Operand::Vreg(_) => *op = Operand::Mreg(Width::Q, m),
        Operand::VregMem(_) => *op = Operand::MregMem(m),
        _ => {}
    }
}
