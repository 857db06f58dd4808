//! Local value numbering.
//!
//! Each block carries two tables, both reset at block entry and owned by
//! the block walk: a vreg-to-canonical-operand map (registers and integer
//! constants only; memory contents never participate) and a table of
//! already-seen defining instructions keyed on opcode plus canonicalized
//! source operands. Source reads resolve through the canonical map
//! transitively with a cycle guard. A second structurally identical
//! computation becomes a move from the first result; moves whose source
//! and destination canonicalize to the same value are dropped; conversions
//! of known constants fold to immediate moves.
//!
//! A destination write erases the destination's binding, every binding
//! reaching it (directly or transitively), and every seen entry that
//! mentions or produced it.

use crate::common::error::Result;
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::types::Width;
use crate::ir::cfg::{BasicBlock, ControlFlowGraph};
use crate::ir::instruction::{HighOp, Instruction};
use crate::ir::liveness::{is_dead_after, LiveVregs};
use crate::ir::operand::Operand;
use crate::passes::transform::rewrite_blocks;

type SeenKey = (HighOp, Vec<Operand>);

pub fn run(cfg: &ControlFlowGraph) -> Result<(ControlFlowGraph, usize)> {
    rewrite_blocks(cfg, number_block)
}

fn number_block(
    block: &BasicBlock,
    live: &LiveVregs,
) -> Result<(Vec<Instruction<HighOp>>, usize)> {
    let mut canon: FxHashMap<u32, Operand> = FxHashMap::default();
    let mut seen: FxHashMap<SeenKey, u32> = FxHashMap::default();
    let mut out = Vec::with_capacity(block.len());
    let mut changes = 0;

    for (idx, ins) in block.instrs.iter().enumerate() {
        let after = live.after_instruction(block.id, idx);
        let mut ins = ins.clone();

        // Only plain-vreg destinations participate; stores through memory
        // and control flow pass through untouched.
        let dest = match (ins.opcode.defines_dest(), ins.dest_vreg()) {
            (true, Some(d)) => d,
            _ => {
                out.push(ins);
                continue;
            }
        };

        // Canonicalize source reads.
        for op in ins.operands.iter_mut().skip(1) {
            if let Operand::Vreg(_) = op {
                let resolved = resolve(op, &canon);
                if resolved != *op {
                    *op = resolved;
                    changes += 1;
                }
            }
        }

        if let HighOp::Mov(_) = ins.opcode {
            let src = ins.operand(1).clone();
            // A move whose source and destination already canonicalize to
            // the same value computes nothing.
            if matches!(src, Operand::Vreg(_) | Operand::Imm(_))
                && src == resolve(&Operand::Vreg(dest), &canon)
            {
                changes += 1;
                continue;
            }
            invalidate(&mut canon, &mut seen, dest);
            if matches!(src, Operand::Vreg(_) | Operand::Imm(_)) {
                canon.insert(dest, src);
            }
            out.push(ins);
            continue;
        }

        // Conversions of a known constant fold at compile time.
        if let Some(val) = fold_conversion(&ins) {
            changes += 1;
            invalidate(&mut canon, &mut seen, dest);
            canon.insert(dest, Operand::Imm(val));
            let to = conversion_target(ins.opcode).unwrap_or(Width::Q);
            out.push(Instruction::new(
                HighOp::Mov(to),
                vec![Operand::Vreg(dest), Operand::Imm(val)],
            ));
            continue;
        }

        // Arithmetic over immediates folds; dead results vanish, live ones
        // become immediate moves.
        if ins.opcode.is_binary_arith() {
            if let (Operand::Imm(a), Operand::Imm(b)) =
                (ins.operand(1).clone(), ins.operand(2).clone())
            {
                let val = ins.opcode.eval(a, b)?;
                changes += 1;
                invalidate(&mut canon, &mut seen, dest);
                canon.insert(dest, Operand::Imm(val));
                if is_dead_after(after, dest) {
                    continue;
                }
                let w = ins.opcode.source_width().unwrap_or(Width::Q);
                out.push(Instruction::new(
                    HighOp::Mov(w),
                    vec![Operand::Vreg(dest), Operand::Imm(val)],
                ));
                continue;
            }
        }

        // Structural duplicate suppression: a second computation with the
        // same opcode and canonical sources becomes a move from the first
        // result.
        let numberable = ins
            .sources()
            .iter()
            .all(|op| matches!(op, Operand::Vreg(_) | Operand::Imm(_)));
        if numberable {
            let key: SeenKey = (ins.opcode, ins.sources().to_vec());
            if let Some(&first) = seen.get(&key) {
                changes += 1;
                if first == dest {
                    // Recomputing a value into the register that already
                    // holds it is a no-op; the tables stay valid.
                    continue;
                }
                invalidate(&mut canon, &mut seen, dest);
                canon.insert(dest, Operand::Vreg(first));
                // The first computation wrote every byte of its destination
                // width, so the replacement move must copy at that width. For
                // a conversion that is the widening target, not the narrow
                // source width.
                let w = conversion_target(ins.opcode)
                    .or_else(|| ins.opcode.source_width())
                    .unwrap_or(Width::Q);
                out.push(Instruction::new(
                    HighOp::Mov(w),
                    vec![Operand::Vreg(dest), Operand::Vreg(first)],
                ));
                continue;
            }
            invalidate(&mut canon, &mut seen, dest);
            // A computation that reads its own destination describes the
            // overwritten value; it cannot be recorded.
            if !key.1.iter().any(|op| op.base_vreg() == Some(dest)) {
                seen.insert(key, dest);
            }
        } else {
            invalidate(&mut canon, &mut seen, dest);
        }
        out.push(ins);
    }

    Ok((out, changes))
}

/// Follow the canonical map through register-to-register links. The guard
/// set stops resolution from revisiting a register.
fn resolve(op: &Operand, canon: &FxHashMap<u32, Operand>) -> Operand {
    let mut cur = op.clone();
    let mut visited: FxHashSet<u32> = FxHashSet::default();
    while let Operand::Vreg(r) = cur {
        if !visited.insert(r) {
            return Operand::Vreg(r);
        }
        match canon.get(&r) {
            Some(next) => cur = next.clone(),
            None => return Operand::Vreg(r),
        }
    }
    cur
}

/// Erase everything the write to `d` makes stale: d's own binding, every
/// binding whose canonical operand reaches d, and every seen entry whose
/// key mentions d or whose result lives in d.
fn invalidate(canon: &mut FxHashMap<u32, Operand>, seen: &mut FxHashMap<SeenKey, u32>, d: u32) {
    canon.remove(&d);
    let mut stale = vec![d];
    while let Some(r) = stale.pop() {
        let dependents: Vec<u32> = canon
            .iter()
            .filter(|(_, v)| v.vreg() == Some(r))
            .map(|(k, _)| *k)
            .collect();
        for k in dependents {
            canon.remove(&k);
            stale.push(k);
        }
    }
    seen.retain(|(_, ops), &mut first| {
        first != d && !ops.iter().any(|op| op.base_vreg() == Some(d))
    });
}

/// Compile-time value of a sign/zero extension of an immediate.
fn fold_conversion(ins: &Instruction<HighOp>) -> Option<i64> {
    let v = match ins.operand(1) {
        Operand::Imm(v) => *v,
        _ => return None,
    };
    match ins.opcode {
        HighOp::SConv(from, to) => Some(to.wrap(from.wrap(v))),
        HighOp::UConv(from, to) => Some(to.wrap(from.zero_extend(v))),
        _ => None,
    }
}

fn conversion_target(op: HighOp) -> Option<Width> {
    match op {
        HighOp::SConv(_, to) | HighOp::UConv(_, to) => Some(to),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::InstructionSequence;

    fn ins(op: HighOp, operands: Vec<Operand>) -> Instruction<HighOp> {
        Instruction::new(op, operands)
    }

    fn number(seq: InstructionSequence<HighOp>) -> InstructionSequence<HighOp> {
        let cfg = ControlFlowGraph::build(&seq);
        let (out, _) = run(&cfg).unwrap();
        out.flatten()
    }

    #[test]
    fn duplicate_computation_becomes_a_move() {
        // add vr12, vr10, vr11 ; add vr13, vr10, vr11 -- the second add is
        // the same value and becomes mov vr13, vr12.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(12), Operand::Vreg(10), Operand::Vreg(11)],
        ));
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(13), Operand::Vreg(10), Operand::Vreg(11)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(13)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = number(seq);
        assert_eq!(
            *flat.get(1),
            ins(
                HighOp::Mov(Width::L),
                vec![Operand::Vreg(13), Operand::Vreg(12)]
            )
        );
    }

    #[test]
    fn overwriting_an_input_blocks_suppression() {
        // vr10 changes between the two adds, so the second must stay.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(12), Operand::Vreg(10), Operand::Vreg(11)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(10), Operand::VregMem(14)],
        ));
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(13), Operand::Vreg(10), Operand::Vreg(11)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(13)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = number(seq);
        assert_eq!(flat.get(2).opcode, HighOp::Add(Width::L));
    }

    #[test]
    fn redundant_move_is_dropped() {
        // mov vr11, vr10 ; mov vr10, vr11 -- the second move restores a
        // value vr10 already holds.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(11), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(10), Operand::Vreg(11)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(10)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = number(seq);
        // Only the first copy and the return-channel move survive.
        assert_eq!(flat.len(), 3);
        assert!(!flat
            .iter()
            .any(|i| i.dest_vreg() == Some(10) && i.opcode == HighOp::Mov(Width::L)));
    }

    #[test]
    fn duplicate_conversion_copies_at_the_target_width() {
        // sconv_bl writes four destination bytes, so the move replacing a
        // repeated sconv_bl must be mov_l, not a one-byte move that would
        // leave the upper bytes of vr13 stale.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::SConv(Width::B, Width::L),
            vec![Operand::Vreg(12), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::SConv(Width::B, Width::L),
            vec![Operand::Vreg(13), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::B),
            vec![Operand::Vreg(10), Operand::Imm(0)],
        ));
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(12), Operand::Vreg(13)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = number(seq);
        assert_eq!(
            *flat.get(1),
            ins(
                HighOp::Mov(Width::L),
                vec![Operand::Vreg(13), Operand::Vreg(12)]
            )
        );
    }

    #[test]
    fn constant_conversion_folds() {
        // sconv_bl of 300 keeps only the low byte, sign-extended: 44.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Mov(Width::B),
            vec![Operand::Vreg(10), Operand::Imm(300)],
        ));
        seq.append(ins(
            HighOp::SConv(Width::B, Width::L),
            vec![Operand::Vreg(11), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(11)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = number(seq);
        let conv = flat.iter().find(|i| i.dest_vreg() == Some(11)).unwrap();
        assert_eq!(conv.opcode, HighOp::Mov(Width::L));
        assert_eq!(*conv.operand(1), Operand::Imm(44));
    }

    #[test]
    fn memory_operands_never_number() {
        // Two identical loads through vr10 may see different memory.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(11), Operand::VregMem(10)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::VregMem(12), Operand::Imm(0)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(13), Operand::VregMem(10)],
        ));
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(11), Operand::Vreg(13)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = number(seq);
        assert_eq!(flat.len(), 5);
        assert_eq!(*flat.get(2).operand(1), Operand::VregMem(10));
    }
}
