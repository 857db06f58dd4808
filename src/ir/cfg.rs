//! Control-flow graph over high-level instructions.
//!
//! `ControlFlowGraph::build` splits a linear instruction sequence into basic
//! blocks (a new block at every labeled position and after every
//! control-transfer instruction) and records the edges between them.
//! Synthetic empty entry and exit blocks bracket the real blocks so every
//! block has a predecessor and `Ret` has somewhere to go.
//! `flatten` is the inverse: ordinary blocks are emitted back in their
//! original code order with labels re-attached. The round trip preserves
//! control flow, not instruction positions.

use crate::common::fx_hash::FxHashMap;
use crate::ir::instruction::{FunctionInfo, HighOp, Instruction, InstructionSequence};
use crate::ir::operand::Operand;

/// A basic block identifier: an index into the graph's block vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Entry,
    Exit,
    Ordinary,
}

/// Why control flows along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Execution runs off the end of the source block.
    FallThrough,
    /// A conditional jump whose condition held.
    BranchTaken,
    /// A conditional jump whose condition did not hold.
    BranchNotTaken,
    /// An unconditional jump.
    Unconditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub source: BlockId,
    pub target: BlockId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    /// Position of this block in the original linear sequence. Flattening
    /// emits ordinary blocks in this order.
    pub code_order: u32,
    /// Label on the block's first instruction, if the block is a jump
    /// target.
    pub label: Option<String>,
    pub instrs: Vec<Instruction<HighOp>>,
}

impl BasicBlock {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

/// A function's control-flow graph: blocks plus per-block outgoing edges.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: Vec<BasicBlock>,
    edges_out: Vec<Vec<Edge>>,
    entry: BlockId,
    exit: BlockId,
    pub fun: Option<FunctionInfo>,
}

impl ControlFlowGraph {
    /// Build the CFG for a linear high-level instruction sequence.
    pub fn build(seq: &InstructionSequence<HighOp>) -> ControlFlowGraph {
        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut label_to_block: FxHashMap<String, BlockId> = FxHashMap::default();

        let entry = BlockId(0);
        blocks.push(BasicBlock {
            id: entry,
            kind: BlockKind::Entry,
            code_order: 0,
            label: None,
            instrs: Vec::new(),
        });

        // First scan: carve the sequence into blocks. A block starts at a
        // labeled position and ends after a control-transfer instruction.
        let mut current: Option<usize> = None;
        for idx in 0..seq.len() {
            let label = seq.label_at(idx);
            if label.is_some() || current.is_none() {
                let id = BlockId(blocks.len() as u32);
                let order = blocks.len() as u32;
                blocks.push(BasicBlock {
                    id,
                    kind: BlockKind::Ordinary,
                    code_order: order,
                    label: label.map(str::to_owned),
                    instrs: Vec::new(),
                });
                if let Some(name) = label {
                    label_to_block.insert(name.to_owned(), id);
                }
                current = Some(id.index());
            }
            let block = &mut blocks[current.unwrap_or(0)];
            let ins = seq.get(idx);
            block.instrs.push(ins.clone());
            if ins.opcode.ends_block() {
                current = None;
            }
        }

        let exit = BlockId(blocks.len() as u32);
        let exit_order = blocks.len() as u32;
        blocks.push(BasicBlock {
            id: exit,
            kind: BlockKind::Exit,
            code_order: exit_order,
            label: None,
            instrs: Vec::new(),
        });

        // Second scan: edges. Block order in `blocks` is code order, so the
        // fall-through successor of block i is block i + 1 (or exit).
        let mut edges_out: Vec<Vec<Edge>> = vec![Vec::new(); blocks.len()];
        let add = |edges_out: &mut Vec<Vec<Edge>>, source: BlockId, target: BlockId, kind| {
            edges_out[source.index()].push(Edge { source, target, kind });
        };

        add(
            &mut edges_out,
            entry,
            if blocks.len() > 2 { BlockId(1) } else { exit },
            EdgeKind::FallThrough,
        );

        for i in 1..blocks.len() - 1 {
            let id = blocks[i].id;
            let next = blocks[i + 1].id;
            match blocks[i].instrs.last() {
                Some(last) => match last.opcode {
                    HighOp::Jmp => {
                        let target = branch_target(last, &label_to_block, exit);
                        add(&mut edges_out, id, target, EdgeKind::Unconditional);
                    }
                    HighOp::CJmpT | HighOp::CJmpF => {
                        let target = branch_target(last, &label_to_block, exit);
                        add(&mut edges_out, id, target, EdgeKind::BranchTaken);
                        add(&mut edges_out, id, next, EdgeKind::BranchNotTaken);
                    }
                    HighOp::Ret => {
                        add(&mut edges_out, id, exit, EdgeKind::FallThrough);
                    }
                    _ => {
                        add(&mut edges_out, id, next, EdgeKind::FallThrough);
                    }
                },
                None => {
                    add(&mut edges_out, id, next, EdgeKind::FallThrough);
                }
            }
        }

        ControlFlowGraph {
            blocks,
            edges_out,
            entry,
            exit,
            fun: seq.fun.clone(),
        }
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn exit(&self) -> BlockId {
        self.exit
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    pub fn successors(&self, id: BlockId) -> &[Edge] {
        &self.edges_out[id.index()]
    }

    /// Rebuild a graph with the same shape but new per-block instruction
    /// vectors. Block ids, kinds, code order, labels, and the whole edge
    /// structure carry over unchanged.
    pub fn with_block_instrs(
        &self,
        mut instrs_for: impl FnMut(&BasicBlock) -> Vec<Instruction<HighOp>>,
    ) -> ControlFlowGraph {
        let blocks = self
            .blocks
            .iter()
            .map(|b| BasicBlock {
                id: b.id,
                kind: b.kind,
                code_order: b.code_order,
                label: b.label.clone(),
                instrs: instrs_for(b),
            })
            .collect();
        ControlFlowGraph {
            blocks,
            edges_out: self.edges_out.clone(),
            entry: self.entry,
            exit: self.exit,
            fun: self.fun.clone(),
        }
    }

    /// Flatten the graph back to a linear instruction sequence. Ordinary
    /// blocks are emitted in code order with their labels re-attached;
    /// the synthetic entry and exit contribute nothing.
    pub fn flatten(&self) -> InstructionSequence<HighOp> {
        let mut order: Vec<&BasicBlock> = self
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Ordinary)
            .collect();
        order.sort_by_key(|b| b.code_order);

        let mut seq = InstructionSequence::new();
        for block in order {
            if let Some(label) = &block.label {
                seq.define_label(label.clone());
            }
            for ins in &block.instrs {
                seq.append(ins.clone());
            }
        }
        seq.fun = self.fun.clone();
        seq
    }
}

fn branch_target(
    ins: &Instruction<HighOp>,
    labels: &FxHashMap<String, BlockId>,
    exit: BlockId,
) -> BlockId {
    for op in &ins.operands {
        if let Operand::Label(name) = op {
            if let Some(id) = labels.get(name) {
                return *id;
            }
        }
    }
    // A jump to a label outside the sequence leaves the function.
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Width;

    fn ins(op: HighOp, operands: Vec<Operand>) -> Instruction<HighOp> {
        Instruction::new(op, operands)
    }

    /// enter; mov vr10, $1; cjmp_t vr10, .L1; mov vr11, $2; .L1: ret
    fn branchy_seq() -> InstructionSequence<HighOp> {
        let mut seq = InstructionSequence::new();
        seq.append(ins(HighOp::Enter, vec![]));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(10), Operand::Imm(1)],
        ));
        seq.append(ins(
            HighOp::CJmpT,
            vec![Operand::Vreg(10), Operand::Label(".L1".into())],
        ));
        seq.append(ins(
            HighOp::Mov(Width::L),
            vec![Operand::Vreg(11), Operand::Imm(2)],
        ));
        seq.define_label(".L1");
        seq.append(ins(HighOp::Ret, vec![]));
        seq.fun = Some(FunctionInfo {
            name: "f".into(),
            local_storage: 0,
            max_vreg: 11,
        });
        seq
    }

    #[test]
    fn build_splits_at_labels_and_branches() {
        let cfg = ControlFlowGraph::build(&branchy_seq());
        // entry + 3 ordinary + exit
        assert_eq!(cfg.num_blocks(), 5);
        let ordinary: Vec<_> = cfg
            .blocks()
            .filter(|b| b.kind == BlockKind::Ordinary)
            .collect();
        assert_eq!(ordinary.len(), 3);
        assert_eq!(ordinary[0].len(), 3);
        assert_eq!(ordinary[1].len(), 1);
        assert_eq!(ordinary[2].len(), 1);
        assert_eq!(ordinary[2].label.as_deref(), Some(".L1"));

        let succs = cfg.successors(ordinary[0].id);
        assert_eq!(succs.len(), 2);
        assert!(succs
            .iter()
            .any(|e| e.kind == EdgeKind::BranchTaken && e.target == ordinary[2].id));
        assert!(succs
            .iter()
            .any(|e| e.kind == EdgeKind::BranchNotTaken && e.target == ordinary[1].id));

        let ret_succs = cfg.successors(ordinary[2].id);
        assert_eq!(ret_succs.len(), 1);
        assert_eq!(ret_succs[0].target, cfg.exit());
    }

    #[test]
    fn flatten_round_trips_instructions_and_labels() {
        let seq = branchy_seq();
        let flat = ControlFlowGraph::build(&seq).flatten();
        assert_eq!(flat.len(), seq.len());
        for i in 0..seq.len() {
            assert_eq!(flat.get(i), seq.get(i));
            assert_eq!(flat.label_at(i), seq.label_at(i));
        }
        assert_eq!(flat.fun, seq.fun);
    }

    #[test]
    fn call_ends_its_block() {
        let mut seq = InstructionSequence::new();
        seq.append(ins(HighOp::Call, vec![Operand::ImmLabel("g".into())]));
        seq.append(ins(HighOp::Ret, vec![]));
        let cfg = ControlFlowGraph::build(&seq);
        let ordinary: Vec<_> = cfg
            .blocks()
            .filter(|b| b.kind == BlockKind::Ordinary)
            .collect();
        assert_eq!(ordinary.len(), 2);
        let succs = cfg.successors(ordinary[0].id);
        assert_eq!(succs.len(), 1);
        assert_eq!(succs[0].kind, EdgeKind::FallThrough);
        assert_eq!(succs[0].target, ordinary[1].id);
    }
}
