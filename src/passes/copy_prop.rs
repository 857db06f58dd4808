//! Block-local copy propagation and move elimination.
//!
//! Each block carries a vreg-to-operand copy table, reset at block entry.
//! A register-to-register move records its source together with the move
//! width; later reads of the destination at that width or below are
//! rewritten to the recorded source while the binding holds. A move out of
//! a register that dies at the move, when the immediately preceding
//! emitted instruction is the defining instruction, is folded away by
//! retargeting that definition's destination. The retarget target may be a
//! plain register or a store through a register.
//!
//! Invalidation is conservative: a write to r drops r's own binding and
//! every binding whose recorded source is r.

use crate::common::error::Result;
use crate::common::fx_hash::FxHashMap;
use crate::common::types::Width;
use crate::ir::cfg::{BasicBlock, ControlFlowGraph};
use crate::ir::instruction::{HighOp, Instruction};
use crate::ir::liveness::{is_dead_after, LiveVregs};
use crate::ir::operand::{Operand, VREG_FIRST_LOCAL};
use crate::passes::transform::rewrite_blocks;

pub fn run(cfg: &ControlFlowGraph) -> Result<(ControlFlowGraph, usize)> {
    rewrite_blocks(cfg, propagate_block)
}

fn propagate_block(
    block: &BasicBlock,
    live: &LiveVregs,
) -> Result<(Vec<Instruction<HighOp>>, usize)> {
    let mut copies: FxHashMap<u32, (Operand, Width)> = FxHashMap::default();
    let mut out: Vec<Instruction<HighOp>> = Vec::with_capacity(block.len());
    let mut changes = 0;

    for (idx, ins) in block.instrs.iter().enumerate() {
        let after = live.after_instruction(block.id, idx);
        let mut ins = ins.clone();

        // Move elimination first, on the unsubstituted source: for
        // `def vrX, ...; mov DEST, vrX` with vrX dead after the move, the
        // definition is retargeted straight to DEST and the move dropped.
        // DEST may be a register or a store through one. A store whose
        // address register is vrX itself is not a candidate: the address
        // must be read before vrX is redefined.
        if let HighOp::Mov(w) = ins.opcode {
            let target = match (ins.operand(0), ins.operand(1)) {
                (Operand::Vreg(y), Operand::Vreg(x)) => Some((Operand::Vreg(*y), *x)),
                (Operand::VregMem(z), Operand::Vreg(x)) if z != x => {
                    Some((Operand::VregMem(*z), *x))
                }
                _ => None,
            };
            if let Some((dest, x)) = target {
                if x >= VREG_FIRST_LOCAL && is_dead_after(after, x) {
                    if let Some(prev) = out.last_mut() {
                        if prev.dest_vreg() == Some(x)
                            && prev.opcode.source_width() == Some(w)
                        {
                            if let Operand::Vreg(y) = dest {
                                invalidate(&mut copies, y);
                            }
                            prev.operands[0] = dest;
                            invalidate(&mut copies, x);
                            changes += 1;
                            continue;
                        }
                    }
                }
            }
        }

        // Substitute tracked copies into source reads, but only where the
        // recorded move width covers the bytes the read consumes.
        if ins.opcode.defines_dest() {
            let read_width = ins.opcode.source_width();
            for op in ins.operands.iter_mut().skip(1) {
                if let Operand::Vreg(r) = op {
                    if let Some((src, w)) = copies.get(r) {
                        if read_width.is_some_and(|rw| rw <= *w) {
                            *op = src.clone();
                            changes += 1;
                        }
                    }
                }
            }
        }

        if let Some(d) = ins.dest_vreg() {
            invalidate(&mut copies, d);
            // A plain register copy establishes a new binding.
            if let HighOp::Mov(w) = ins.opcode {
                if let Operand::Vreg(src) = ins.operand(1) {
                    if *src != d {
                        copies.insert(d, (Operand::Vreg(*src), w));
                    }
                }
            }
        }

        out.push(ins);
    }

    Ok((out, changes))
}

/// Drop r's binding and every binding recorded as a copy of r.
fn invalidate(copies: &mut FxHashMap<u32, (Operand, Width)>, r: u32) {
    copies.remove(&r);
    copies.retain(|_, (src, _)| src.vreg() != Some(r));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Width;
    use crate::ir::instruction::InstructionSequence;

    fn ins(op: HighOp, operands: Vec<Operand>) -> Instruction<HighOp> {
        Instruction::new(op, operands)
    }

    fn prop(seq: InstructionSequence<HighOp>) -> InstructionSequence<HighOp> {
        let cfg = ControlFlowGraph::build(&seq);
        let (out, _) = run(&cfg).unwrap();
        out.flatten()
    }

    #[test]
    fn chained_moves_collapse_to_one() {
        // mov vr11, vr10; mov vr12, vr11 with vr11 dead after the second
        // move becomes a single mov vr12, vr10.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(11), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(12), Operand::Vreg(11)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = prop(seq);
        assert_eq!(flat.len(), 2);
        assert_eq!(
            *flat.get(0),
            ins(
                HighOp::Mov(Width::L),
                vec![Operand::Vreg(12), Operand::Vreg(10)]
            )
        );
    }

    #[test]
    fn retargets_arithmetic_destination() {
        // add vr10, vr11, vr12; mov vr13, vr10 with vr10 dead becomes
        // add vr13, vr11, vr12.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(10), Operand::Vreg(11), Operand::Vreg(12)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(13), Operand::Vreg(10)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = prop(seq);
        assert_eq!(flat.len(), 2);
        assert_eq!(
            *flat.get(0),
            ins(
                HighOp::Add(Width::L),
                vec![Operand::Vreg(13), Operand::Vreg(11), Operand::Vreg(12)]
            )
        );
    }

    #[test]
    fn retargets_store_through_register() {
        // add vr10, vr11, vr12; mov (vr13), vr10 with vr10 dead becomes
        // add (vr13), vr11, vr12.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(10), Operand::Vreg(11), Operand::Vreg(12)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::VregMem(13), Operand::Vreg(10)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = prop(seq);
        assert_eq!(flat.len(), 2);
        assert_eq!(
            *flat.get(0),
            ins(
                HighOp::Add(Width::L),
                vec![Operand::VregMem(13), Operand::Vreg(11), Operand::Vreg(12)]
            )
        );
    }

    #[test]
    fn narrow_copy_never_feeds_a_wider_read() {
        // mov_b vr11, vr10 copies one byte, so a four-byte read of vr11
        // must not be rewritten to vr10.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Mov(Width::B),
            vec![Operand::Vreg(11), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(11), Operand::Vreg(12)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = prop(seq);
        assert_eq!(*flat.get(1).operand(1), Operand::Vreg(11));
    }

    #[test]
    fn live_intermediate_blocks_elimination() {
        // vr11 is read again after the move, so the move must stay.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(11), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(12), Operand::Vreg(11)],
        ));
        seq.append(ins(
            HighOp::Add(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(11), Operand::Vreg(12)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = prop(seq);
        assert_eq!(flat.len(), 4);
        // Reads of vr11 and vr12 were rewritten back to vr10.
        let add = flat.iter().find(|i| i.opcode.is_binary_arith()).unwrap();
        assert_eq!(*add.operand(1), Operand::Vreg(10));
        assert_eq!(*add.operand(2), Operand::Vreg(10));
    }

    #[test]
    fn write_invalidates_dependent_bindings() {
        // mov vr11, vr10; mov vr10, $0; mov vr0, vr11 -- vr11's binding to
        // vr10 dies when vr10 is rewritten.
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(11), Operand::Vreg(10)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(10), Operand::Imm(0)],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(0), Operand::Vreg(11)],
        ));
        seq.append(ins(HighOp::Ret, vec![]));
        let flat = prop(seq);
        let last_mov = flat.iter().find(|i| i.dest_vreg() == Some(0)).unwrap();
        assert_eq!(*last_mov.operand(1), Operand::Vreg(11));
    }
}
