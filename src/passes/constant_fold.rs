//! Block-local constant folding and propagation.
//!
//! Each block carries a vreg-to-constant table, reset at block entry (no
//! cross-block propagation). Constant bindings are substituted into source
//! reads when the source vreg is dead after the instruction (its binding is
//! being consumed, not bypassed), arithmetic whose value operands are all
//! immediates is evaluated at compile time, and a folded result whose
//! destination is still live is kept as a plain move of the immediate.
//!
//! Division or modulo by a constant zero surfaces as a fatal diagnostic
//! here rather than folding to an arbitrary value.

use crate::common::error::Result;
use crate::common::fx_hash::FxHashMap;
use crate::common::types::Width;
use crate::ir::cfg::{BasicBlock, ControlFlowGraph};
use crate::ir::instruction::{HighOp, Instruction};
use crate::ir::liveness::{is_dead_after, BitSet, LiveVregs};
use crate::ir::operand::Operand;
use crate::passes::transform::rewrite_blocks;

pub fn run(cfg: &ControlFlowGraph) -> Result<(ControlFlowGraph, usize)> {
    rewrite_blocks(cfg, fold_block)
}

fn fold_block(
    block: &BasicBlock,
    live: &LiveVregs,
) -> Result<(Vec<Instruction<HighOp>>, usize)> {
    // Constant table owned by this block's walk; dropped at scope exit.
    let mut consts: FxHashMap<u32, i64> = FxHashMap::default();
    let mut out = Vec::with_capacity(block.len());
    let mut changes = 0;

    for (idx, ins) in block.instrs.iter().enumerate() {
        let after = live.after_instruction(block.id, idx);
        let mut ins = ins.clone();

        changes += substitute_sources(&mut ins, &consts, after);

        // Write invalidates the destination's prior binding before the new
        // one (if any) is recorded.
        if let Some(d) = ins.dest_vreg() {
            consts.remove(&d);
        }

        match folded_value(&ins)? {
            Some(val) => {
                changes += 1;
                let dest = match ins.dest() {
                    Some(d) => d.clone(),
                    None => continue,
                };
                if let Some(d) = dest.vreg() {
                    consts.insert(d, val);
                    if is_dead_after(after, d) {
                        continue;
                    }
                }
                let width = ins.opcode.source_width().unwrap_or(Width::Q);
                out.push(Instruction::new(
                    HighOp::Mov(width),
                    vec![dest, Operand::Imm(val)],
                ));
            }
            None => {
                if let (HighOp::Mov(_), Some(d)) = (ins.opcode, ins.dest_vreg()) {
                    if let Operand::Imm(v) = ins.operand(1) {
                        consts.insert(d, *v);
                    }
                }
                out.push(ins);
            }
        }
    }

    Ok((out, changes))
}

/// Replace constant-bound source vregs with immediates. Only value operands
/// of defining instructions participate; memory-reference bases and
/// control-flow operands never do. A binding is consumed only when its vreg
/// is dead after this instruction, so uses that outlive the binding keep
/// reading the register.
fn substitute_sources(
    ins: &mut Instruction<HighOp>,
    consts: &FxHashMap<u32, i64>,
    after: &BitSet,
) -> usize {
    if !ins.opcode.defines_dest() {
        return 0;
    }
    let mut n = 0;
    for op in ins.operands.iter_mut().skip(1) {
        if let Operand::Vreg(r) = op {
            if let Some(&v) = consts.get(r) {
                if is_dead_after(after, *r) {
                    *op = Operand::Imm(v);
                    n += 1;
                }
            }
        }
    }
    n
}

/// Compile-time value of `ins` when every value operand is an immediate.
fn folded_value(ins: &Instruction<HighOp>) -> Result<Option<i64>> {
    if ins.opcode.is_binary_arith() {
        if let (Operand::Imm(a), Operand::Imm(b)) = (ins.operand(1), ins.operand(2)) {
            return ins.opcode.eval(*a, *b).map(Some);
        }
    }
    if let HighOp::Neg(w) = ins.opcode {
        if let Operand::Imm(v) = ins.operand(1) {
            return Ok(Some(w.wrap(v.wrapping_neg())));
        }
    }
    Ok(None)
}
