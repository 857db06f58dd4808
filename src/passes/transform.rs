//! Per-block CFG rewriting shared by all local passes.
//!
//! A pass maps each block's instruction vector to a replacement vector;
//! everything else about the graph (block ids, kinds, code order, labels,
//! edges) carries over unchanged. Liveness is computed fresh for the input
//! graph and handed to the block callback, so per-instruction facts line up
//! with the instruction indices the callback sees.

use crate::common::error::Result;
use crate::ir::cfg::{BasicBlock, ControlFlowGraph};
use crate::ir::instruction::{HighOp, Instruction};
use crate::ir::liveness::LiveVregs;

/// Apply `rewrite` to every block of `cfg`, producing a new graph with the
/// same shape. Returns the graph and the total change count reported by the
/// callback.
pub fn rewrite_blocks<F>(cfg: &ControlFlowGraph, mut rewrite: F) -> Result<(ControlFlowGraph, usize)>
where
    F: FnMut(&BasicBlock, &LiveVregs) -> Result<(Vec<Instruction<HighOp>>, usize)>,
{
    let live = LiveVregs::compute(cfg);

    let mut new_instrs: Vec<Vec<Instruction<HighOp>>> = Vec::with_capacity(cfg.num_blocks());
    let mut changes = 0;
    for block in cfg.blocks() {
        let (instrs, n) = rewrite(block, &live)?;
        changes += n;
        new_instrs.push(instrs);
    }

    let mut replacements = new_instrs.into_iter();
    let out = cfg.with_block_instrs(|_| replacements.next().unwrap_or_default());
    Ok((out, changes))
}
