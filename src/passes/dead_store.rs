//! Dead store elimination.
//!
//! Drops any value-defining instruction whose destination vreg is dead
//! immediately after it. Removing a store can make the stores feeding it
//! dead in turn, so the pass repeats (with liveness recomputed) until a
//! sweep removes nothing. Running the pass on its own output therefore
//! removes no further instructions.
//!
//! Stores through memory (`(vrN)` destinations), calls, and control flow
//! define no vreg and are never candidates. Vregs below the local range are
//! caller-visible and never dead.

use crate::common::error::Result;
use crate::ir::cfg::ControlFlowGraph;
use crate::ir::liveness::is_dead_after;
use crate::passes::transform::rewrite_blocks;

/// Safety cap on cascaded sweeps; each sweep removes at least one
/// instruction, so this only binds on pathological input.
const MAX_SWEEPS: usize = 100;

pub fn run(cfg: &ControlFlowGraph) -> Result<(ControlFlowGraph, usize)> {
    let mut current = None;
    let mut total = 0;
    for _ in 0..MAX_SWEEPS {
        let (next, removed) = sweep(current.as_ref().unwrap_or(cfg))?;
        if removed == 0 {
            break;
        }
        total += removed;
        current = Some(next);
    }
    Ok((current.unwrap_or_else(|| cfg.clone()), total))
}

fn sweep(cfg: &ControlFlowGraph) -> Result<(ControlFlowGraph, usize)> {
    rewrite_blocks(cfg, |block, live| {
        let mut out = Vec::with_capacity(block.len());
        let mut removed = 0;
        for (idx, ins) in block.instrs.iter().enumerate() {
            let dead = ins
                .dest_vreg()
                .map(|d| is_dead_after(live.after_instruction(block.id, idx), d))
                .unwrap_or(false);
            if dead {
                removed += 1;
            } else {
                out.push(ins.clone());
            }
        }
        Ok((out, removed))
    })
}
