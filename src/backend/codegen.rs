//! Per-function lowering driver.
//!
//! Translates the high-level three-address sequence into two-operand
//! x86-64 instructions, optionally running the optimization pipeline over
//! the CFG first. Expansion reserves r10 and r11 as intra-instruction
//! scratch and rax/rdx for the division idiom; nothing else is clobbered.
//!
//! Frame layout, from the frame pointer down: declared local storage
//! (rounded up to 8), then one 8-byte slot per vreg from vr10 to the
//! function's highest vreg, the whole frame rounded up to 16 so the stack
//! stays aligned across calls.

use crate::common::error::{CodegenError, Result};
use crate::common::types::Width;
use crate::ir::cfg::ControlFlowGraph;
use crate::ir::instruction::{FunctionInfo, HighOp, Instruction, InstructionSequence};
use crate::ir::operand::{Mreg, Operand, VREG_FIRST_LOCAL};
use crate::backend::lowlevel::LowOp;
use crate::passes;

/// Argument channel registers, in vr1..=vr6 order.
const ARG_REGS: [Mreg; 6] = [Mreg::Rdi, Mreg::Rsi, Mreg::Rdx, Mreg::Rcx, Mreg::R8, Mreg::R9];

pub struct LowLevelCodeGen {
    optimize: bool,
}

impl LowLevelCodeGen {
    pub fn new(optimize: bool) -> Self {
        LowLevelCodeGen { optimize }
    }

    /// Lower one function. The input sequence must carry its
    /// `FunctionInfo`; lowering cannot place vregs without the storage
    /// metadata.
    pub fn generate(
        &self,
        hl: &InstructionSequence<HighOp>,
    ) -> Result<InstructionSequence<LowOp>> {
        let fun = hl.fun.clone().ok_or(CodegenError::MissingFunction)?;

        let optimized;
        let hl = if self.optimize {
            let cfg = ControlFlowGraph::build(hl);
            optimized = passes::optimize(&cfg)?.flatten();
            &optimized
        } else {
            hl
        };

        let frame = FrameLayout::new(&fun);
        let mut ll = InstructionSequence::new();
        for idx in 0..hl.len() {
            if let Some(label) = hl.label_at(idx) {
                ll.define_label(label);
            }
            self.translate(hl.get(idx), &frame, &mut ll)?;
        }
        ll.fun = Some(fun);
        Ok(ll)
    }

    fn translate(
        &self,
        ins: &Instruction<HighOp>,
        frame: &FrameLayout,
        ll: &mut InstructionSequence<LowOp>,
    ) -> Result<()> {
        let r10 = |w| Operand::Mreg(w, Mreg::R10);
        let rsp = Operand::Mreg(Width::Q, Mreg::Rsp);
        let rbp = Operand::Mreg(Width::Q, Mreg::Rbp);

        match ins.opcode {
            HighOp::Nop => {
                ll.append(Instruction::new(LowOp::Nop, vec![]));
            }
            HighOp::Enter => {
                ll.append(Instruction::new(LowOp::Push(Width::Q), vec![rbp.clone()]));
                ll.append(Instruction::new(LowOp::Mov(Width::Q), vec![rsp.clone(), rbp]));
                if frame.total > 0 {
                    ll.append(Instruction::new(
                        LowOp::Sub(Width::Q),
                        vec![Operand::Imm(frame.total as i64), rsp],
                    ));
                }
            }
            HighOp::Leave => {
                if frame.total > 0 {
                    ll.append(Instruction::new(
                        LowOp::Add(Width::Q),
                        vec![Operand::Imm(frame.total as i64), rsp],
                    ));
                }
                ll.append(Instruction::new(LowOp::Pop(Width::Q), vec![rbp]));
            }
            HighOp::Ret => {
                ll.append(Instruction::new(LowOp::Ret, vec![]));
            }
            HighOp::Jmp => {
                ll.append(Instruction::new(LowOp::Jmp, vec![ins.operand(0).clone()]));
            }
            HighOp::CJmpT | HighOp::CJmpF => {
                let cond = frame.map_operand(ins.operand(0), Width::L, ll)?;
                let rel = if ins.opcode == HighOp::CJmpT {
                    crate::ir::instruction::CmpRel::Ne
                } else {
                    crate::ir::instruction::CmpRel::Eq
                };
                ll.append(Instruction::new(
                    LowOp::Cmp(Width::L),
                    vec![Operand::Imm(0), cond],
                ));
                ll.append(Instruction::new(
                    LowOp::JCond(rel),
                    vec![ins.operand(1).clone()],
                ));
            }
            HighOp::Call => {
                ll.append(Instruction::new(LowOp::Call, vec![ins.operand(0).clone()]));
            }
            HighOp::LocalAddr => {
                let dest = frame.map_operand(ins.operand(0), Width::Q, ll)?;
                let off = match ins.operand(1) {
                    Operand::Imm(v) => *v,
                    other => {
                        return Err(CodegenError::UnhandledOpcode(format!(
                            "localaddr with operand `{}`",
                            other
                        )))
                    }
                };
                ll.append(Instruction::new(
                    LowOp::Lea,
                    vec![
                        Operand::MregMemOff(Mreg::Rbp, frame.local_offset(off)),
                        r10(Width::Q),
                    ],
                ));
                ll.append(Instruction::new(
                    LowOp::Mov(Width::Q),
                    vec![r10(Width::Q), dest],
                ));
            }
            // Memory references through a spilled vreg all borrow r11 for
            // the base load, so each mapped operand is consumed before the
            // next one is mapped.
            HighOp::Mov(w) => {
                let mut src = frame.map_operand(ins.operand(1), w, ll)?;
                if src.is_memory() && hl_is_memory(ins.operand(0)) {
                    ll.append(Instruction::new(LowOp::Mov(w), vec![src, r10(w)]));
                    src = r10(w);
                }
                let dest = frame.map_operand(ins.operand(0), w, ll)?;
                ll.append(Instruction::new(LowOp::Mov(w), vec![src, dest]));
            }
            HighOp::Neg(w) => {
                let src = frame.map_operand(ins.operand(1), w, ll)?;
                ll.append(Instruction::new(LowOp::Mov(w), vec![src, r10(w)]));
                ll.append(Instruction::new(LowOp::Neg(w), vec![r10(w)]));
                let dest = frame.map_operand(ins.operand(0), w, ll)?;
                ll.append(Instruction::new(LowOp::Mov(w), vec![r10(w), dest]));
            }
            HighOp::Add(w) | HighOp::Sub(w) => {
                let op = match ins.opcode {
                    HighOp::Add(_) => LowOp::Add(w),
                    _ => LowOp::Sub(w),
                };
                let src1 = frame.map_operand(ins.operand(1), w, ll)?;
                ll.append(Instruction::new(LowOp::Mov(w), vec![src1, r10(w)]));
                let src2 = frame.map_operand(ins.operand(2), w, ll)?;
                ll.append(Instruction::new(op, vec![src2, r10(w)]));
                let dest = frame.map_operand(ins.operand(0), w, ll)?;
                ll.append(Instruction::new(LowOp::Mov(w), vec![r10(w), dest]));
            }
            HighOp::Mul(w) => {
                // imul has no useful byte/word form; sub-4-byte multiplies
                // run at 4 bytes.
                let ew = if w == Width::Q { Width::Q } else { Width::L };
                let src1 = frame.map_operand(ins.operand(1), ew, ll)?;
                ll.append(Instruction::new(LowOp::Mov(ew), vec![src1, r10(ew)]));
                let src2 = frame.map_operand(ins.operand(2), ew, ll)?;
                ll.append(Instruction::new(LowOp::Imul(ew), vec![src2, r10(ew)]));
                let dest = frame.map_operand(ins.operand(0), ew, ll)?;
                ll.append(Instruction::new(LowOp::Mov(ew), vec![r10(ew), dest]));
            }
            HighOp::Div(w) | HighOp::Mod(w) => {
                // Accumulator idiom: dividend in rax, sign-extend into
                // rdx, divide by a scratch-loaded divisor; quotient lands
                // in rax, remainder in rdx.
                let ew = if w == Width::Q { Width::Q } else { Width::L };
                let acc = Operand::Mreg(ew, Mreg::Rax);
                let src1 = frame.map_operand(ins.operand(1), ew, ll)?;
                ll.append(Instruction::new(LowOp::Mov(ew), vec![src1, acc.clone()]));
                ll.append(Instruction::new(
                    if ew == Width::Q { LowOp::Cqo } else { LowOp::Cdq },
                    vec![],
                ));
                let src2 = frame.map_operand(ins.operand(2), ew, ll)?;
                ll.append(Instruction::new(LowOp::Mov(ew), vec![src2, r10(ew)]));
                ll.append(Instruction::new(LowOp::Idiv(ew), vec![r10(ew)]));
                let result = match ins.opcode {
                    HighOp::Div(_) => acc,
                    _ => Operand::Mreg(ew, Mreg::Rdx),
                };
                let dest = frame.map_operand(ins.operand(0), ew, ll)?;
                ll.append(Instruction::new(LowOp::Mov(ew), vec![result, dest]));
            }
            HighOp::Cmp(rel, w) => {
                // The left operand always goes through r10: cmp cannot
                // take an immediate there, nor compare memory with memory.
                let src1 = frame.map_operand(ins.operand(1), w, ll)?;
                ll.append(Instruction::new(LowOp::Mov(w), vec![src1, r10(w)]));
                let src2 = frame.map_operand(ins.operand(2), w, ll)?;
                ll.append(Instruction::new(LowOp::Cmp(w), vec![src2, r10(w)]));
                ll.append(Instruction::new(LowOp::Set(rel), vec![r10(Width::B)]));
                if w != Width::B {
                    ll.append(Instruction::new(
                        LowOp::Movz(Width::B, w),
                        vec![r10(Width::B), r10(w)],
                    ));
                }
                let dest = frame.map_operand(ins.operand(0), w, ll)?;
                ll.append(Instruction::new(LowOp::Mov(w), vec![r10(w), dest]));
            }
            HighOp::SConv(from, to) | HighOp::UConv(from, to) => {
                if from >= to {
                    return Err(CodegenError::UnhandledOpcode(ins.opcode.to_string()));
                }
                let ext = match ins.opcode {
                    HighOp::SConv(..) => LowOp::Movs(from, to),
                    _ => LowOp::Movz(from, to),
                };
                let src = frame.map_operand(ins.operand(1), from, ll)?;
                ll.append(Instruction::new(LowOp::Mov(from), vec![src, r10(from)]));
                ll.append(Instruction::new(ext, vec![r10(from), r10(to)]));
                let dest = frame.map_operand(ins.operand(0), to, ll)?;
                ll.append(Instruction::new(LowOp::Mov(to), vec![r10(to), dest]));
            }
        }
        Ok(())
    }
}

/// Stack frame geometry for one function.
struct FrameLayout {
    /// Declared local storage, rounded up to 8.
    aligned_local: u32,
    /// Whole frame size, rounded up to 16.
    total: u32,
}

impl FrameLayout {
    fn new(fun: &FunctionInfo) -> FrameLayout {
        let aligned_local = round_up(fun.local_storage, 8);
        let mut total = aligned_local;
        if fun.max_vreg >= VREG_FIRST_LOCAL {
            total += (fun.max_vreg - 9) * 8;
        }
        FrameLayout {
            aligned_local,
            total: round_up(total, 16),
        }
    }

    /// rbp-relative offset of the spill slot for vreg `r` (r >= 10).
    fn vreg_slot(&self, r: u32) -> i32 {
        -((self.aligned_local + (r - 9) * 8) as i32)
    }

    /// rbp-relative offset of the local storage byte at `off`.
    fn local_offset(&self, off: i64) -> i32 {
        off as i32 - self.aligned_local as i32
    }

    /// Map a high-level operand to a low-level one at the given access
    /// width. Memory references through a spilled vreg first load the
    /// 8-byte base address into r11 and dereference that.
    fn map_operand(
        &self,
        op: &Operand,
        width: Width,
        ll: &mut InstructionSequence<LowOp>,
    ) -> Result<Operand> {
        match op {
            Operand::Vreg(r) => Ok(self.map_vreg(*r, width)?),
            Operand::VregMem(r) => match self.map_vreg(*r, Width::Q)? {
                Operand::Mreg(_, m) => Ok(Operand::MregMem(m)),
                slot => {
                    ll.append(Instruction::new(
                        LowOp::Mov(Width::Q),
                        vec![slot, Operand::Mreg(Width::Q, Mreg::R11)],
                    ));
                    Ok(Operand::MregMem(Mreg::R11))
                }
            },
            // Promotion may have placed a machine register here already;
            // re-size it to this use.
            Operand::Mreg(_, m) => Ok(Operand::Mreg(width, *m)),
            other => Ok(other.clone()),
        }
    }

    fn map_vreg(&self, r: u32, width: Width) -> Result<Operand> {
        match r {
            0 => Ok(Operand::Mreg(width, Mreg::Rax)),
            1..=6 => Ok(Operand::Mreg(width, ARG_REGS[(r - 1) as usize])),
            7..=9 => Err(CodegenError::ReservedVreg(r)),
            _ => Ok(Operand::MregMemOff(Mreg::Rbp, self.vreg_slot(r))),
        }
    }
}

fn round_up(n: u32, align: u32) -> u32 {
    (n + align - 1) / align * align
}

/// Will this high-level operand map to a memory location? Spilled vregs
/// and all memory-reference forms do; channel vregs, promoted registers,
/// and immediates do not.
fn hl_is_memory(op: &Operand) -> bool {
    match op {
        Operand::VregMem(_) | Operand::MregMem(_) | Operand::MregMemOff(..) => true,
        Operand::Vreg(r) => *r >= VREG_FIRST_LOCAL,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::CmpRel;

    fn ins(op: HighOp, operands: Vec<Operand>) -> Instruction<HighOp> {
        Instruction::new(op, operands)
    }

    fn seq_with_fun(
        instrs: Vec<Instruction<HighOp>>,
        local_storage: u32,
        max_vreg: u32,
    ) -> InstructionSequence<HighOp> {
        let mut seq = InstructionSequence::new();
        for i in instrs {
            seq.append(i);
        }
        seq.fun = Some(FunctionInfo {
            name: "f".into(),
            local_storage,
            max_vreg,
        });
        seq
    }

    #[test]
    fn frame_size_rounds_to_sixteen() {
        let frame = FrameLayout::new(&FunctionInfo {
            name: "f".into(),
            local_storage: 0,
            max_vreg: 12,
        });
        // Three vreg slots of 8 bytes, rounded up.
        assert_eq!(frame.total, 32);
        assert_eq!(frame.vreg_slot(10), -8);
        assert_eq!(frame.vreg_slot(12), -24);

        let frame = FrameLayout::new(&FunctionInfo {
            name: "g".into(),
            local_storage: 5,
            max_vreg: 10,
        });
        assert_eq!(frame.aligned_local, 8);
        assert_eq!(frame.total, 16);
        assert_eq!(frame.vreg_slot(10), -16);
        assert_eq!(frame.local_offset(0), -8);
    }

    #[test]
    fn enter_and_leave_expand_the_frame() {
        let seq = seq_with_fun(
            vec![
                ins(HighOp::Enter, vec![]),
                ins(HighOp::Leave, vec![]),
                ins(HighOp::Ret, vec![]),
            ],
            0,
            12,
        );
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        let text: Vec<String> = ll.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "pushq %rbp",
                "movq %rsp, %rbp",
                "subq $32, %rsp",
                "addq $32, %rsp",
                "popq %rbp",
                "ret",
            ]
        );
    }

    #[test]
    fn memory_to_memory_move_routes_through_scratch() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::Mov(Width::L),
                vec![Operand::Vreg(10), Operand::Vreg(11)],
            )],
            0,
            11,
        );
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        let text: Vec<String> = ll.iter().map(|i| i.to_string()).collect();
        assert_eq!(text, vec!["movl -16(%rbp), %r10d", "movl %r10d, -8(%rbp)"]);
    }

    #[test]
    fn load_through_vreg_goes_via_r11() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::Mov(Width::L),
                vec![Operand::Vreg(0), Operand::VregMem(10)],
            )],
            0,
            10,
        );
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        let text: Vec<String> = ll.iter().map(|i| i.to_string()).collect();
        assert_eq!(text, vec!["movq -8(%rbp), %r11", "movl (%r11), %eax"]);
    }

    #[test]
    fn division_uses_the_accumulator_idiom() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::Div(Width::L),
                vec![Operand::Vreg(10), Operand::Vreg(11), Operand::Vreg(12)],
            )],
            0,
            12,
        );
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        let text: Vec<String> = ll.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "movl -16(%rbp), %eax",
                "cdq",
                "movl -24(%rbp), %r10d",
                "idivl %r10d",
                "movl %eax, -8(%rbp)",
            ]
        );
    }

    #[test]
    fn eight_byte_division_uses_cqo() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::Mod(Width::Q),
                vec![Operand::Vreg(0), Operand::Vreg(10), Operand::Imm(3)],
            )],
            0,
            10,
        );
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        assert!(ll.iter().any(|i| i.opcode == LowOp::Cqo));
        assert!(!ll.iter().any(|i| i.opcode == LowOp::Cdq));
        // Remainder comes out of rdx.
        let last = ll.get(ll.len() - 1);
        assert_eq!(
            *last,
            Instruction::new(
                LowOp::Mov(Width::Q),
                vec![
                    Operand::Mreg(Width::Q, Mreg::Rdx),
                    Operand::Mreg(Width::Q, Mreg::Rax)
                ]
            )
        );
    }

    #[test]
    fn comparison_sets_and_widens() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::Cmp(CmpRel::Lt, Width::L),
                vec![Operand::Vreg(10), Operand::Vreg(11), Operand::Vreg(12)],
            )],
            0,
            12,
        );
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        let text: Vec<String> = ll.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "movl -16(%rbp), %r10d",
                "cmpl -24(%rbp), %r10d",
                "setl %r10b",
                "movzbl %r10b, %r10d",
                "movl %r10d, -8(%rbp)",
            ]
        );
    }

    #[test]
    fn conditional_jump_tests_against_zero() {
        let mut seq = seq_with_fun(
            vec![ins(
                HighOp::CJmpF,
                vec![Operand::Vreg(10), Operand::Label(".L2".into())],
            )],
            0,
            10,
        );
        seq.append(ins(HighOp::Ret, vec![]));
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        let text: Vec<String> = ll.iter().map(|i| i.to_string()).collect();
        assert_eq!(text[0], "cmpl $0, -8(%rbp)");
        assert_eq!(text[1], "je .L2");
    }

    #[test]
    fn sign_extension_expands_to_three_instructions() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::SConv(Width::W, Width::Q),
                vec![Operand::Vreg(10), Operand::Vreg(1)],
            )],
            0,
            10,
        );
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        let text: Vec<String> = ll.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "movw %di, %r10w",
                "movswq %r10w, %r10",
                "movq %r10, -8(%rbp)",
            ]
        );
    }

    #[test]
    fn narrowing_conversion_is_unhandled() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::SConv(Width::Q, Width::L),
                vec![Operand::Vreg(10), Operand::Vreg(11)],
            )],
            0,
            11,
        );
        assert!(matches!(
            LowLevelCodeGen::new(false).generate(&seq),
            Err(CodegenError::UnhandledOpcode(_))
        ));
    }

    #[test]
    fn reserved_vreg_is_fatal() {
        let seq = seq_with_fun(
            vec![ins(
                HighOp::Mov(Width::L),
                vec![Operand::Vreg(7), Operand::Imm(1)],
            )],
            0,
            10,
        );
        assert!(matches!(
            LowLevelCodeGen::new(false).generate(&seq),
            Err(CodegenError::ReservedVreg(7))
        ));
    }

    #[test]
    fn missing_function_info_is_fatal() {
        let mut seq: InstructionSequence<HighOp> = InstructionSequence::new();
        seq.append(ins(HighOp::Ret, vec![]));
        assert!(matches!(
            LowLevelCodeGen::new(false).generate(&seq),
            Err(CodegenError::MissingFunction)
        ));
    }

    #[test]
    fn labels_carry_through_lowering() {
        let mut seq = seq_with_fun(vec![], 0, 10);
        seq.append(ins(HighOp::Jmp, vec![Operand::Label(".L5".into())]));
        seq.define_label(".L5");
        seq.append(ins(HighOp::Ret, vec![]));
        let ll = LowLevelCodeGen::new(false).generate(&seq).unwrap();
        assert_eq!(ll.label_at(0), None);
        assert_eq!(ll.label_at(1), Some(".L5"));
    }

    #[test]
    fn optimized_constant_chain_materializes_once() {
        // x = 2 + 3; y = x * 4; return y -- with optimization on, the
        // whole chain becomes one immediate move into eax and no imul
        // survives.
        let seq = seq_with_fun(
            vec![
                ins(HighOp::Enter, vec![]),
                ins(
                    HighOp::Mov(Width::L),
                    vec![Operand::Vreg(10), Operand::Imm(2)],
                ),
                ins(
                    HighOp::Mov(Width::L),
                    vec![Operand::Vreg(11), Operand::Imm(3)],
                ),
                ins(
                    HighOp::Add(Width::L),
                    vec![Operand::Vreg(12), Operand::Vreg(10), Operand::Vreg(11)],
                ),
                ins(
                    HighOp::Mul(Width::L),
                    vec![Operand::Vreg(13), Operand::Vreg(12), Operand::Imm(4)],
                ),
                ins(
                    HighOp::Mov(Width::L),
                    vec![Operand::Vreg(0), Operand::Vreg(13)],
                ),
                ins(HighOp::Leave, vec![]),
                ins(HighOp::Ret, vec![]),
            ],
            0,
            13,
        );
        let ll = LowLevelCodeGen::new(true).generate(&seq).unwrap();
        assert!(!ll.iter().any(|i| matches!(i.opcode, LowOp::Imul(_))));
        assert!(ll.iter().any(|i| *i
            == Instruction::new(
                LowOp::Mov(Width::L),
                vec![Operand::Imm(20), Operand::Mreg(Width::L, Mreg::Rax)]
            )));
    }
}
