//! Backward may-live dataflow over virtual registers.
//!
//! Computes, for every basic block and every instruction position, the set
//! of vregs whose current value may still be read on some path onward.
//! Blocks are iterated in reverse order to a fixpoint; the transfer
//! function is the usual kill-then-gen applied instruction by instruction
//! from the block's live-out fact.
//!
//! The dataflow uses compact bitsets instead of hash sets: vreg numbers are
//! already dense, so a bitset sized by the function's highest vreg makes
//! union/equality single word-level ops with no per-iteration allocation.

use crate::ir::cfg::{BlockId, ControlFlowGraph};
use crate::ir::instruction::{HighOp, Instruction};
use crate::ir::operand::{Operand, VREG_FIRST_LOCAL};

/// Safety bound on fixpoint iterations. The transfer is monotone over a
/// finite lattice so this never binds on well-formed graphs.
const MAX_ITERATIONS: usize = 50;

/// A compact bitset stored as a contiguous vec of u64 words.
#[derive(Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// Create an empty bitset able to hold indices [0, num_bits).
    pub fn new(num_bits: usize) -> Self {
        BitSet {
            words: vec![0u64; (num_bits + 63) / 64],
        }
    }

    #[inline(always)]
    pub fn insert(&mut self, idx: u32) {
        let idx = idx as usize;
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline(always)]
    pub fn remove(&mut self, idx: u32) {
        let idx = idx as usize;
        self.words[idx / 64] &= !(1u64 << (idx % 64));
    }

    #[inline(always)]
    pub fn contains(&self, idx: u32) -> bool {
        let idx = idx as usize;
        (self.words[idx / 64] >> (idx % 64)) & 1 != 0
    }

    /// self |= other. Returns true if self changed.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let before = *w;
            *w |= o;
            changed |= *w != before;
        }
        changed
    }

    pub fn clear(&mut self) {
        for w in &mut self.words {
            *w = 0;
        }
    }

    pub fn for_each_set_bit<F: FnMut(u32)>(&self, mut f: F) {
        for (wi, &word) in self.words.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                f((wi * 64) as u32 + bit);
                bits &= bits - 1;
            }
        }
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        self.for_each_set_bit(|b| {
            set.entry(&b);
        });
        set.finish()
    }
}

/// Liveness facts for one function's CFG.
pub struct LiveVregs {
    live_in: Vec<BitSet>,
    live_out: Vec<BitSet>,
    /// Fact after each instruction, indexed [block][instruction].
    after_instr: Vec<Vec<BitSet>>,
}

impl LiveVregs {
    /// Run the dataflow on `cfg` to a fixpoint and cache per-instruction
    /// facts.
    pub fn compute(cfg: &ControlFlowGraph) -> LiveVregs {
        let num_bits = num_bits_for(cfg);
        let n = cfg.num_blocks();
        let mut live_in = vec![BitSet::new(num_bits); n];
        let mut live_out = vec![BitSet::new(num_bits); n];

        for _ in 0..MAX_ITERATIONS {
            let mut changed = false;
            for bi in (0..n).rev() {
                let id = BlockId(bi as u32);
                // live_out = union of successors' live_in.
                let mut out = BitSet::new(num_bits);
                for edge in cfg.successors(id) {
                    out.union_with(&live_in[edge.target.index()]);
                }
                let mut fact = out.clone();
                for ins in cfg.block(id).instrs.iter().rev() {
                    transfer(ins, &mut fact);
                }
                if live_in[bi].union_with(&fact) {
                    changed = true;
                }
                live_out[bi] = out;
            }
            if !changed {
                break;
            }
        }

        // Final backward replay per block to cache the fact after every
        // instruction position.
        let mut after_instr: Vec<Vec<BitSet>> = Vec::with_capacity(n);
        for bi in 0..n {
            let block = cfg.block(BlockId(bi as u32));
            let mut after = vec![live_out[bi].clone(); block.len()];
            let mut fact = live_out[bi].clone();
            for (idx, ins) in block.instrs.iter().enumerate().rev() {
                after[idx] = fact.clone();
                transfer(ins, &mut fact);
            }
            after_instr.push(after);
        }

        LiveVregs {
            live_in,
            live_out,
            after_instr,
        }
    }

    /// Vregs live on entry to `block`.
    pub fn before_block(&self, block: BlockId) -> &BitSet {
        &self.live_in[block.index()]
    }

    /// Vregs live on exit from `block`.
    pub fn after_block(&self, block: BlockId) -> &BitSet {
        &self.live_out[block.index()]
    }

    /// Vregs live immediately after the instruction at `idx` in `block`.
    pub fn after_instruction(&self, block: BlockId, idx: usize) -> &BitSet {
        &self.after_instr[block.index()][idx]
    }
}

/// The one dead-register test every pass uses: `vreg` holds a value nobody
/// will read, per `fact`. Vregs below the local range are caller-visible
/// channels and never count as dead.
pub fn is_dead_after(fact: &BitSet, vreg: u32) -> bool {
    vreg >= VREG_FIRST_LOCAL && !fact.contains(vreg)
}

/// Backward transfer for one instruction: kill the defined vreg, then gen
/// every vreg read. A dest that is also read is re-inserted by the gen
/// step, which is the required semantics.
fn transfer(ins: &Instruction<HighOp>, fact: &mut BitSet) {
    if let Some(d) = ins.dest_vreg() {
        fact.remove(d);
    }
    ins.for_each_used_vreg(|r| fact.insert(r));
}

fn num_bits_for(cfg: &ControlFlowGraph) -> usize {
    let mut highest = VREG_FIRST_LOCAL;
    if let Some(fun) = &cfg.fun {
        highest = highest.max(fun.max_vreg);
    }
    // Scan the instructions too: the metadata may undercount after passes
    // have run.
    for block in cfg.blocks() {
        for ins in &block.instrs {
            for op in &ins.operands {
                if let Operand::Vreg(r) | Operand::VregMem(r) = op {
                    highest = highest.max(*r);
                }
            }
        }
    }
    highest as usize + 1
}
