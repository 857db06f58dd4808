//! Block-local optimization passes over the high-level CFG.
//!
//! The pipeline is:
//! 1. Constant folding / propagation
//! 2. Copy propagation and move elimination
//! 3. Local value numbering
//! 4. Dead store elimination
//!
//! Each pass maps the current graph to a new one and reports a change
//! count; the driver repeats the four-pass round until a round changes
//! nothing, under a safety bound. A final round of register promotion runs
//! once, after the rewrites have settled, so its lifetime analysis sees
//! the code that will actually be lowered.
//!
//! Liveness is recomputed at the start of every pass application (inside
//! the shared block-rewrite helper), so per-instruction facts always
//! describe the graph the pass is looking at.

pub mod constant_fold;
pub mod copy_prop;
pub mod dead_store;
pub mod lvn;
pub mod reg_promote;
pub mod transform;

use crate::common::error::Result;
use crate::ir::cfg::ControlFlowGraph;

/// Safety bound on pipeline rounds. Each productive round strictly reduces
/// or simplifies the instruction stream, so quiescence comes much earlier
/// in practice.
const MAX_ROUNDS: usize = 10;

/// Run the full pipeline on `cfg`, returning the optimized graph. The
/// input graph is never mutated.
///
/// Debug support: set NCC_DISABLE_PASSES=pass1,pass2,... to skip specific
/// passes when bisecting a miscompilation. Pass names: fold, copyprop,
/// lvn, deadstore, promote, all. Set NCC_TIME_PASSES for per-pass change
/// counts and wall time on stderr.
pub fn optimize(cfg: &ControlFlowGraph) -> Result<ControlFlowGraph> {
    let disabled = std::env::var("NCC_DISABLE_PASSES").unwrap_or_default();
    if disabled.contains("all") {
        return Ok(cfg.clone());
    }
    let time_passes = std::env::var("NCC_TIME_PASSES").is_ok();

    let mut current = cfg.clone();
    for round in 0..MAX_ROUNDS {
        let mut round_changes = 0;

        if !disabled.contains("fold") {
            round_changes += apply("fold", constant_fold::run, &mut current, time_passes, round)?;
        }
        if !disabled.contains("copyprop") {
            round_changes += apply("copyprop", copy_prop::run, &mut current, time_passes, round)?;
        }
        if !disabled.contains("lvn") {
            round_changes += apply("lvn", lvn::run, &mut current, time_passes, round)?;
        }
        if !disabled.contains("deadstore") {
            round_changes += apply("deadstore", dead_store::run, &mut current, time_passes, round)?;
        }

        if round_changes == 0 {
            break;
        }
    }

    if !disabled.contains("promote") {
        apply("promote", reg_promote::run, &mut current, time_passes, MAX_ROUNDS)?;
    }

    Ok(current)
}

fn apply(
    name: &str,
    pass: fn(&ControlFlowGraph) -> Result<(ControlFlowGraph, usize)>,
    current: &mut ControlFlowGraph,
    time_passes: bool,
    round: usize,
) -> Result<usize> {
    let t0 = if time_passes {
        Some(std::time::Instant::now())
    } else {
        None
    };
    let (next, changes) = pass(current)?;
    if let Some(t0) = t0 {
        eprintln!(
            "[PASS] round={} {}: {:.4}s ({} changes)",
            round,
            name,
            t0.elapsed().as_secs_f64(),
            changes
        );
    }
    *current = next;
    Ok(changes)
}
