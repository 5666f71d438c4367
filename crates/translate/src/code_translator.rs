//! Per-opcode lowering from decoded RV32IMFD instructions to Cranelift IR.
//!
//! One function, one big match. Register reads and writes go through the
//! register file; guest memory accesses widen the 32-bit guest address to a
//! host pointer. Division follows the RISC-V never-trap semantics through
//! explicit guards on untracked helper blocks.

use cranelift_codegen::ir::{
    condcodes::{FloatCC, IntCC},
    types, InstBuilder, MemFlags, Value,
};

use crate::caller::emit_external_call;
use crate::constants::INSTRUCTION_SIZE;
use crate::context::Counter;
use crate::decode::{Inst, Op};
use crate::errors::{TranslationError, TranslationResult};
use crate::func_translator::FuncTranslator;
use crate::register_file::{SyncDirection, SyncFlags, A0, A7, RA, SP, ZERO};
use crate::relocation::{RelocTarget, RelocValue};

/// NaN boxing pattern for single-precision values in 64-bit F registers.
const NAN_BOX: i64 = 0xFFFF_FFFF_0000_0000u64 as i64;

pub(crate) fn translate_inst(
    ft: &mut FuncTranslator,
    inst: &Inst,
    reloc: Option<RelocValue>,
) -> TranslationResult<()> {
    use Op::*;
    match inst.op {
        // ---- upper immediates ----
        Lui => {
            let v = match reloc {
                Some(rv) => ft.reloc_ir_value(rv),
                None => {
                    let imm = (inst.imm as u32) << 12;
                    ft.emit(|em| em.iconst32(imm))
                }
            };
            ft.write_xreg(inst.rd, v);
        }
        Auipc => {
            // for relocations the mask was already applied to the result
            let v = match reloc {
                Some(rv) => ft.reloc_ir_value(rv),
                None => {
                    let abs = ft.cur_pc.wrapping_add((inst.imm as u32) << 12);
                    ft.emit(|em| em.iconst32(abs))
                }
            };
            ft.write_xreg(inst.rd, v);
        }

        // ---- ALU, register-immediate ----
        Addi => {
            if let Some(rv) = reloc {
                ft.note_label_value(&rv)?;
                let a = ft.read_xreg(inst.rs1);
                let b = ft.reloc_ir_value(rv);
                let v = ft.emit(|em| em.cur().ins().iadd(a, b));
                ft.write_xreg(inst.rd, v);
            } else {
                let a = ft.read_xreg(inst.rs1);
                let v = ft.emit(|em| em.cur().ins().iadd_imm(a, inst.imm as i64));
                if inst.rd == SP && inst.rs1 == SP {
                    ft.prepare_sp_delta(inst.imm as i64);
                }
                ft.write_xreg(inst.rd, v);
            }
        }
        Slti => {
            let a = ft.read_xreg(inst.rs1);
            let v = ft.emit(|em| {
                let c = em
                    .cur()
                    .ins()
                    .icmp_imm(IntCC::SignedLessThan, a, inst.imm as i64);
                em.cur().ins().uextend(types::I32, c)
            });
            ft.write_xreg(inst.rd, v);
        }
        Sltiu => {
            let a = ft.read_xreg(inst.rs1);
            let v = ft.emit(|em| {
                let c = em
                    .cur()
                    .ins()
                    .icmp_imm(IntCC::UnsignedLessThan, a, inst.imm as i64);
                em.cur().ins().uextend(types::I32, c)
            });
            ft.write_xreg(inst.rd, v);
        }
        Xori => alu_imm(ft, inst, |em, a, imm| em.cur().ins().bxor_imm(a, imm)),
        Ori => alu_imm(ft, inst, |em, a, imm| em.cur().ins().bor_imm(a, imm)),
        Andi => alu_imm(ft, inst, |em, a, imm| em.cur().ins().band_imm(a, imm)),
        Slli => alu_imm(ft, inst, |em, a, imm| em.cur().ins().ishl_imm(a, imm)),
        Srli => alu_imm(ft, inst, |em, a, imm| em.cur().ins().ushr_imm(a, imm)),
        Srai => alu_imm(ft, inst, |em, a, imm| em.cur().ins().sshr_imm(a, imm)),

        // ---- ALU, register-register ----
        Add => alu(ft, inst, |em, a, b| em.cur().ins().iadd(a, b)),
        Sub => alu(ft, inst, |em, a, b| em.cur().ins().isub(a, b)),
        Sll => alu(ft, inst, |em, a, b| em.cur().ins().ishl(a, b)),
        Srl => alu(ft, inst, |em, a, b| em.cur().ins().ushr(a, b)),
        Sra => alu(ft, inst, |em, a, b| em.cur().ins().sshr(a, b)),
        Xor => alu(ft, inst, |em, a, b| em.cur().ins().bxor(a, b)),
        Or => alu(ft, inst, |em, a, b| em.cur().ins().bor(a, b)),
        And => alu(ft, inst, |em, a, b| em.cur().ins().band(a, b)),
        Slt => {
            let (a, b) = read_pair(ft, inst);
            let v = ft.emit(|em| {
                let c = em.cur().ins().icmp(IntCC::SignedLessThan, a, b);
                em.cur().ins().uextend(types::I32, c)
            });
            ft.write_xreg(inst.rd, v);
        }
        Sltu => {
            let (a, b) = read_pair(ft, inst);
            let v = ft.emit(|em| {
                let c = em.cur().ins().icmp(IntCC::UnsignedLessThan, a, b);
                em.cur().ins().uextend(types::I32, c)
            });
            ft.write_xreg(inst.rd, v);
        }

        // ---- M extension ----
        Mul => alu(ft, inst, |em, a, b| em.cur().ins().imul(a, b)),
        Mulh => alu(ft, inst, |em, a, b| em.cur().ins().smulhi(a, b)),
        Mulhu => alu(ft, inst, |em, a, b| em.cur().ins().umulhi(a, b)),
        Mulhsu => {
            let (a, b) = read_pair(ft, inst);
            let v = ft.emit(|em| {
                let a64 = em.cur().ins().sextend(types::I64, a);
                let b64 = em.cur().ins().uextend(types::I64, b);
                let p = em.cur().ins().imul(a64, b64);
                let hi = em.cur().ins().sshr_imm(p, 32);
                em.cur().ins().ireduce(types::I32, hi)
            });
            ft.write_xreg(inst.rd, v);
        }
        Div | Rem => signed_div_rem(ft, inst)?,
        Divu | Remu => {
            let (a, b) = read_pair(ft, inst);
            let is_rem = inst.op == Remu;
            let v = ft.emit(|em| {
                let bz = em.cur().ins().icmp_imm(IntCC::Equal, b, 0);
                let one = em.iconst32(1);
                let safe = em.cur().ins().select(bz, one, b);
                let q = if is_rem {
                    em.cur().ins().urem(a, safe)
                } else {
                    em.cur().ins().udiv(a, safe)
                };
                let on_zero = if is_rem { a } else { em.iconst32(!0) };
                em.cur().ins().select(bz, on_zero, q)
            });
            ft.write_xreg(inst.rd, v);
        }

        // ---- loads and stores ----
        Lb | Lbu | Lh | Lhu | Lw => translate_load(ft, inst, reloc)?,
        Sb | Sh | Sw => translate_store(ft, inst)?,

        // ---- branches ----
        Beq | Bne | Blt | Bge | Bltu | Bgeu => {
            let cc = match inst.op {
                Beq => IntCC::Equal,
                Bne => IntCC::NotEqual,
                Blt => IntCC::SignedLessThan,
                Bge => IntCC::SignedGreaterThanOrEqual,
                Bltu => IntCC::UnsignedLessThan,
                _ => IntCC::UnsignedGreaterThanOrEqual,
            };
            let (a, b) = read_pair(ft, inst);
            let target = ft.cur_pc.wrapping_add(inst.imm as u32);
            let taken = ft.branch_target_bb(target)?;
            let fall = ft.branch_target_bb(ft.cur_pc + INSTRUCTION_SIZE)?;
            ft.emit(|em| {
                let c = em.cur().ins().icmp(cc, a, b);
                em.cur().ins().brif(c, taken, &[], fall, &[]);
            });
        }

        // ---- jumps and calls ----
        Jal => translate_jal(ft, inst)?,
        Jalr => translate_jalr(ft, inst, reloc)?,

        // ---- system ----
        Ecall => ft.emit_syscall()?,
        Ebreak | FenceI => {
            // no-op anchor; the driver records it for the PC map
        }
        Fence => {
            ft.emit(|em| {
                em.cur().ins().fence();
            });
        }
        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => translate_csr(ft, inst)?,

        // ---- F/D loads and stores ----
        Flw => {
            let p = mem_addr(ft, inst, reloc);
            let bits = ft.emit(|em| {
                let v = em.cur().ins().load(types::I32, MemFlags::new(), p, 0);
                let w = em.cur().ins().uextend(types::I64, v);
                em.cur().ins().bor_imm(w, NAN_BOX)
            });
            ft.write_freg(inst.rd, bits);
        }
        Fld => {
            if let Some(slot) = ft.spill_slot(inst.rs1, inst.imm, types::I64)? {
                let bits = ft.emit(|em| em.cur().ins().stack_load(types::I64, slot, 0));
                ft.write_freg(inst.rd, bits);
            } else {
                let p = mem_addr(ft, inst, reloc);
                let bits =
                    ft.emit(|em| em.cur().ins().load(types::I64, MemFlags::new(), p, 0));
                ft.write_freg(inst.rd, bits);
            }
        }
        Fsw => {
            let bits = ft.read_freg(inst.rs2);
            let p = mem_addr(ft, inst, reloc);
            ft.emit(|em| {
                let v = em.cur().ins().ireduce(types::I32, bits);
                em.cur().ins().store(MemFlags::new(), v, p, 0);
            });
        }
        Fsd => {
            let bits = ft.read_freg(inst.rs2);
            if let Some(slot) = ft.spill_slot(inst.rs1, inst.imm, types::I64)? {
                ft.emit(|em| {
                    em.cur().ins().stack_store(bits, slot, 0);
                });
            } else {
                let p = mem_addr(ft, inst, reloc);
                ft.emit(|em| {
                    em.cur().ins().store(MemFlags::new(), bits, p, 0);
                });
            }
        }

        // ---- F/D arithmetic ----
        Fadd { double } => fp_binop(ft, inst, double, |em, a, b| em.cur().ins().fadd(a, b)),
        Fsub { double } => fp_binop(ft, inst, double, |em, a, b| em.cur().ins().fsub(a, b)),
        Fmul { double } => fp_binop(ft, inst, double, |em, a, b| em.cur().ins().fmul(a, b)),
        Fdiv { double } => fp_binop(ft, inst, double, |em, a, b| em.cur().ins().fdiv(a, b)),
        Fmin { double } => fp_binop(ft, inst, double, |em, a, b| em.cur().ins().fmin(a, b)),
        Fmax { double } => fp_binop(ft, inst, double, |em, a, b| em.cur().ins().fmax(a, b)),
        Fsqrt { double } => {
            let a = read_fp(ft, inst.rs1, double);
            let v = ft.emit(|em| em.cur().ins().sqrt(a));
            write_fp(ft, inst.rd, double, v);
        }
        Fmadd { double } | Fmsub { double } | Fnmsub { double } | Fnmadd { double } => {
            let a = read_fp(ft, inst.rs1, double);
            let b = read_fp(ft, inst.rs2, double);
            let c = read_fp(ft, inst.rs3, double);
            let op = inst.op;
            let v = ft.emit(|em| match op {
                Fmadd { .. } => em.cur().ins().fma(a, b, c),
                Fmsub { .. } => {
                    let nc = em.cur().ins().fneg(c);
                    em.cur().ins().fma(a, b, nc)
                }
                Fnmsub { .. } => {
                    let na = em.cur().ins().fneg(a);
                    em.cur().ins().fma(na, b, c)
                }
                _ => {
                    let na = em.cur().ins().fneg(a);
                    let nc = em.cur().ins().fneg(c);
                    em.cur().ins().fma(na, b, nc)
                }
            });
            write_fp(ft, inst.rd, double, v);
        }

        // sign injection works on the raw representation
        Fsgnj { double } | Fsgnjn { double } | Fsgnjx { double } => {
            translate_sgnj(ft, inst, double);
        }

        Feq { double } | Flt { double } | Fle { double } => {
            let cc = match inst.op {
                Feq { .. } => FloatCC::Equal,
                Flt { .. } => FloatCC::LessThan,
                _ => FloatCC::LessThanOrEqual,
            };
            let a = read_fp(ft, inst.rs1, double);
            let b = read_fp(ft, inst.rs2, double);
            let v = ft.emit(|em| {
                let c = em.cur().ins().fcmp(cc, a, b);
                em.cur().ins().uextend(types::I32, c)
            });
            ft.write_xreg(inst.rd, v);
        }
        Fclass { double } => translate_fclass(ft, inst, double),

        FcvtWF { double, unsigned } => {
            let a = read_fp(ft, inst.rs1, double);
            let validate = ft.ctx.opts.enable_fcvt_validation;
            let v = ft.emit(|em| {
                let sat = if unsigned {
                    em.cur().ins().fcvt_to_uint_sat(types::I32, a)
                } else {
                    em.cur().ins().fcvt_to_sint_sat(types::I32, a)
                };
                if validate {
                    // RISC-V turns NaN into the maximum value
                    let nan = em.cur().ins().fcmp(FloatCC::Unordered, a, a);
                    let max = em.iconst32(if unsigned { !0 } else { i32::MAX as u32 });
                    em.cur().ins().select(nan, max, sat)
                } else {
                    sat
                }
            });
            ft.write_xreg(inst.rd, v);
        }
        FcvtFW { double, unsigned } => {
            let a = ft.read_xreg(inst.rs1);
            let ty = if double { types::F64 } else { types::F32 };
            let v = ft.emit(|em| {
                if unsigned {
                    em.cur().ins().fcvt_from_uint(ty, a)
                } else {
                    em.cur().ins().fcvt_from_sint(ty, a)
                }
            });
            write_fp(ft, inst.rd, double, v);
        }
        FcvtFF { to_double } => {
            let a = read_fp(ft, inst.rs1, !to_double);
            let v = ft.emit(|em| {
                if to_double {
                    em.cur().ins().fpromote(types::F64, a)
                } else {
                    em.cur().ins().fdemote(types::F32, a)
                }
            });
            write_fp(ft, inst.rd, to_double, v);
        }
        FmvXW => {
            let bits = ft.read_freg(inst.rs1);
            let v = ft.emit(|em| em.cur().ins().ireduce(types::I32, bits));
            ft.write_xreg(inst.rd, v);
        }
        FmvWX => {
            let v = ft.read_xreg(inst.rs1);
            let bits = ft.emit(|em| {
                let w = em.cur().ins().uextend(types::I64, v);
                em.cur().ins().bor_imm(w, NAN_BOX)
            });
            ft.write_freg(inst.rd, bits);
        }
    }
    Ok(())
}

// ---- helpers ----

fn read_pair(ft: &mut FuncTranslator, inst: &Inst) -> (Value, Value) {
    let a = ft.read_xreg(inst.rs1);
    let b = ft.read_xreg(inst.rs2);
    (a, b)
}

fn alu(
    ft: &mut FuncTranslator,
    inst: &Inst,
    f: impl FnOnce(&mut crate::func_translator::Emitter, Value, Value) -> Value,
) {
    let (a, b) = read_pair(ft, inst);
    let v = ft.emit(|em| f(em, a, b));
    ft.write_xreg(inst.rd, v);
}

fn alu_imm(
    ft: &mut FuncTranslator,
    inst: &Inst,
    f: impl FnOnce(&mut crate::func_translator::Emitter, Value, i64) -> Value,
) {
    let a = ft.read_xreg(inst.rs1);
    let imm = inst.imm as i64;
    let v = ft.emit(|em| f(em, a, imm));
    ft.write_xreg(inst.rd, v);
}

/// RISC-V division never traps: x/0 is all-ones (quotient) or x (remainder),
/// INT_MIN/-1 is INT_MIN (quotient) or 0 (remainder). The guards run on
/// untracked helper blocks.
fn signed_div_rem(ft: &mut FuncTranslator, inst: &Inst) -> TranslationResult<()> {
    let is_rem = inst.op == Op::Rem;
    let (a, b) = read_pair(ft, inst);

    let zero_bb = ft.new_ubb();
    let div_bb = ft.new_ubb();
    let cont_bb = ft.new_ubb();

    ft.emit(|em| {
        let bz = em.cur().ins().icmp_imm(IntCC::Equal, b, 0);
        em.cur().ins().brif(bz, zero_bb, &[], div_bb, &[]);
    });

    ft.cur = zero_bb;
    let on_zero = if is_rem {
        a
    } else {
        ft.emit(|em| em.iconst32(!0))
    };
    ft.write_xreg(inst.rd, on_zero);
    ft.emit(|em| {
        em.cur().ins().jump(cont_bb, &[]);
    });

    ft.cur = div_bb;
    let v = ft.emit(|em| {
        let m1 = em.cur().ins().icmp_imm(IntCC::Equal, b, -1);
        let min = em.cur().ins().icmp_imm(IntCC::Equal, a, i32::MIN as i64);
        let ovf = em.cur().ins().band(m1, min);
        let one = em.iconst32(1);
        let safe = em.cur().ins().select(ovf, one, b);
        let q = if is_rem {
            em.cur().ins().srem(a, safe)
        } else {
            em.cur().ins().sdiv(a, safe)
        };
        let on_ovf = if is_rem {
            em.iconst32(0)
        } else {
            em.iconst32(i32::MIN as u32)
        };
        em.cur().ins().select(ovf, on_ovf, q)
    });
    ft.write_xreg(inst.rd, v);
    ft.emit(|em| {
        em.cur().ins().jump(cont_bb, &[]);
    });

    ft.cur = cont_bb;
    Ok(())
}

/// Effective host address of a load/store: base + sign-extended immediate
/// (or the relocation value), widened to a host pointer.
fn mem_addr(ft: &mut FuncTranslator, inst: &Inst, reloc: Option<RelocValue>) -> Value {
    let base = ft.read_xreg(inst.rs1);
    let guest = match reloc {
        Some(rv) => {
            let off = ft.reloc_ir_value(rv);
            ft.emit(|em| em.cur().ins().iadd(base, off))
        }
        None => {
            if inst.imm == 0 {
                base
            } else {
                ft.emit(|em| em.cur().ins().iadd_imm(base, inst.imm as i64))
            }
        }
    };
    ft.emit(|em| em.guest_ptr(guest))
}

fn translate_load(
    ft: &mut FuncTranslator,
    inst: &Inst,
    reloc: Option<RelocValue>,
) -> TranslationResult<()> {
    if inst.op == Op::Lw && reloc.is_none() {
        if let Some(slot) = ft.spill_slot(inst.rs1, inst.imm, types::I32)? {
            let v = ft.emit(|em| em.cur().ins().stack_load(types::I32, slot, 0));
            ft.write_xreg(inst.rd, v);
            return Ok(());
        }
    }
    let p = mem_addr(ft, inst, reloc);
    let v = ft.emit(|em| {
        let flags = MemFlags::new();
        match inst.op {
            Op::Lb => em.cur().ins().sload8(types::I32, flags, p, 0),
            Op::Lbu => em.cur().ins().uload8(types::I32, flags, p, 0),
            Op::Lh => em.cur().ins().sload16(types::I32, flags, p, 0),
            Op::Lhu => em.cur().ins().uload16(types::I32, flags, p, 0),
            Op::Lw => em.cur().ins().load(types::I32, flags, p, 0),
            _ => unreachable!(),
        }
    });
    ft.write_xreg(inst.rd, v);
    Ok(())
}

fn translate_store(ft: &mut FuncTranslator, inst: &Inst) -> TranslationResult<()> {
    let v = ft.read_xreg(inst.rs2);
    if inst.op == Op::Sw {
        if let Some(slot) = ft.spill_slot(inst.rs1, inst.imm, types::I32)? {
            ft.emit(|em| {
                em.cur().ins().stack_store(v, slot, 0);
            });
            return Ok(());
        }
    }
    let p = mem_addr(ft, inst, None);
    ft.emit(|em| {
        let flags = MemFlags::new();
        match inst.op {
            Op::Sb => em.cur().ins().istore8(flags, v, p, 0),
            Op::Sh => em.cur().ins().istore16(flags, v, p, 0),
            Op::Sw => em.cur().ins().store(flags, v, p, 0),
            _ => unreachable!(),
        };
    });
    Ok(())
}

fn translate_jal(ft: &mut FuncTranslator, inst: &Inst) -> TranslationResult<()> {
    let target = ft.cur_pc.wrapping_add(inst.imm as u32);
    match inst.rd {
        ZERO => {
            // plain jump; a target outside this function is a tail call
            if (target < ft.addr || target >= ft.end) && ft.ctx.funcs.contains_key(&target) {
                ft.emit_internal_call(target)?;
                ft.freturn()
            } else {
                let bb = ft.branch_target_bb(target)?;
                ft.emit(|em| {
                    em.cur().ins().jump(bb, &[]);
                });
                Ok(())
            }
        }
        RA => ft.emit_internal_call(target),
        rd => Err(TranslationError::Unsupported {
            addr: ft.cur_pc,
            what: format!("jal with link register x{rd}"),
        }),
    }
}

fn translate_jalr(
    ft: &mut FuncTranslator,
    inst: &Inst,
    reloc: Option<RelocValue>,
) -> TranslationResult<()> {
    match reloc {
        Some(rv) => match rv.target {
            RelocTarget::Func { addr } => match inst.rd {
                RA => ft.emit_internal_call(addr),
                ZERO => {
                    if addr >= ft.addr && addr < ft.end {
                        let bb = ft.branch_target_bb(addr)?;
                        ft.emit(|em| {
                            em.cur().ins().jump(bb, &[]);
                        });
                        Ok(())
                    } else {
                        ft.emit_internal_call(addr)?;
                        ft.freturn()
                    }
                }
                rd => Err(TranslationError::Unsupported {
                    addr: ft.cur_pc,
                    what: format!("jalr with link register x{rd}"),
                }),
            },
            RelocTarget::ExtFunc { addr } => {
                let import = ft
                    .ctx
                    .importer
                    .by_ext_addr(addr)
                    .cloned()
                    .expect("external address without import record");
                match inst.rd {
                    RA => emit_external_call(ft, &import, false),
                    ZERO => emit_external_call(ft, &import, true),
                    rd => Err(TranslationError::Unsupported {
                        addr: ft.cur_pc,
                        what: format!("jalr with link register x{rd}"),
                    }),
                }
            }
            RelocTarget::Data { .. } | RelocTarget::ExtData { .. } => {
                Err(TranslationError::Unsupported {
                    addr: ft.cur_pc,
                    what: "jalr through a data relocation".into(),
                })
            }
        },
        None => {
            if inst.rd == ZERO && inst.rs1 == RA && inst.imm == 0 {
                // function return
                return ft.freturn();
            }
            let target = {
                let base = ft.read_xreg(inst.rs1);
                if inst.imm == 0 {
                    base
                } else {
                    ft.emit(|em| em.cur().ins().iadd_imm(base, inst.imm as i64))
                }
            };
            match inst.rd {
                RA => translate_icall(ft, target),
                ZERO => ft.emit_ijump(target),
                rd => Err(TranslationError::Unsupported {
                    addr: ft.cur_pc,
                    what: format!("jalr with link register x{rd}"),
                }),
            }
        }
    }
}

/// Indirect call: stage the target in the scratch word and dispatch through
/// the generated icaller.
fn translate_icall(ft: &mut FuncTranslator, target: Value) -> TranslationResult<()> {
    if ft.ctx.opts.hard_float_abi {
        return Err(TranslationError::Unsupported {
            addr: ft.cur_pc,
            what: "indirect call with --hard-float-abi".into(),
        });
    }
    let scratch = ft.ctx.icaller_target;
    ft.emit(|em| em.store_global(scratch, target));

    if ft.regs.local() {
        ft.sync_regs(SyncDirection::Store, SyncFlags::CALL);
    }
    let mut args = Vec::with_capacity(9);
    let staged = ft.emit(|em| em.load_global(scratch, types::I32));
    args.push(staged);
    for r in A0..=A7 {
        args.push(ft.read_xreg(r));
    }
    let icaller = ft.ctx.icaller_id()?;
    ft.emit(|em| {
        em.call_fn(icaller, &args);
    });
    if ft.regs.local() {
        ft.sync_regs(SyncDirection::Load, SyncFlags::CALL_RETURNED);
    }
    Ok(())
}

fn translate_csr(ft: &mut FuncTranslator, inst: &Inst) -> TranslationResult<()> {
    const CYCLE: u16 = 0xC00;
    const TIME: u16 = 0xC01;
    const INSTRET: u16 = 0xC02;
    const CYCLEH: u16 = 0xC80;
    const TIMEH: u16 = 0xC81;
    const INSTRETH: u16 = 0xC82;
    const FFLAGS: u16 = 0x001;
    const FRM: u16 = 0x002;
    const FCSR: u16 = 0x003;

    let imm_form = matches!(inst.op, Op::Csrrwi | Op::Csrrsi | Op::Csrrci);
    // operand is zero when the source register is x0 (or a zero immediate)
    let operand_is_zero = inst.rs1 == 0;
    let writes = match inst.op {
        Op::Csrrw | Op::Csrrwi => true,
        _ => !operand_is_zero,
    };

    match inst.csr {
        CYCLE | CYCLEH | TIME | TIMEH | INSTRET | INSTRETH => {
            if writes {
                return Err(TranslationError::UnsupportedCsr {
                    addr: ft.cur_pc,
                    csr: inst.csr,
                });
            }
            let which = match inst.csr {
                CYCLE | CYCLEH => Counter::Cycles,
                TIME | TIMEH => Counter::Time,
                _ => Counter::Instret,
            };
            let high = matches!(inst.csr, CYCLEH | TIMEH | INSTRETH);
            let id = ft.ctx.counter(which)?;
            let v = ft.emit(|em| {
                let wide = em.call_fn(id, &[])[0];
                let part = if high {
                    em.cur().ins().ushr_imm(wide, 32)
                } else {
                    wide
                };
                em.cur().ins().ireduce(types::I32, part)
            });
            ft.write_xreg(inst.rd, v);
            Ok(())
        }
        FFLAGS | FRM | FCSR => {
            if !ft.ctx.opts.enable_fcsr {
                if writes {
                    return Err(TranslationError::UnsupportedCsr {
                        addr: ft.cur_pc,
                        csr: inst.csr,
                    });
                }
                // harmless read of an unmodelled CSR
                let v = ft.emit(|em| em.iconst32(0));
                ft.write_xreg(inst.rd, v);
                return Ok(());
            }
            let fcsr = ft.ctx.fcsr;
            let old = ft.emit(|em| em.load_global(fcsr, types::I32));
            if writes {
                let rs = if imm_form {
                    let z = inst.rs1 as u32;
                    ft.emit(|em| em.iconst32(z))
                } else {
                    ft.read_xreg(inst.rs1)
                };
                let newv = ft.emit(|em| match inst.op {
                    Op::Csrrw | Op::Csrrwi => rs,
                    Op::Csrrs | Op::Csrrsi => em.cur().ins().bor(old, rs),
                    _ => {
                        let inv = em.cur().ins().bnot(rs);
                        em.cur().ins().band(old, inv)
                    }
                });
                ft.emit(|em| em.store_global(fcsr, newv));
            }
            ft.write_xreg(inst.rd, old);
            Ok(())
        }
        csr => Err(TranslationError::UnsupportedCsr {
            addr: ft.cur_pc,
            csr,
        }),
    }
}

// ---- floating point helpers ----

/// Typed value of an F register; singles are unboxed from the low word.
fn read_fp(ft: &mut FuncTranslator, r: u8, double: bool) -> Value {
    let bits = ft.read_freg(r);
    ft.emit(|em| {
        if double {
            em.cur().ins().bitcast(types::F64, MemFlags::new(), bits)
        } else {
            let lo = em.cur().ins().ireduce(types::I32, bits);
            em.cur().ins().bitcast(types::F32, MemFlags::new(), lo)
        }
    })
}

/// Store a typed float into an F register, NaN-boxing singles.
fn write_fp(ft: &mut FuncTranslator, r: u8, double: bool, v: Value) {
    let bits = ft.emit(|em| {
        if double {
            em.cur().ins().bitcast(types::I64, MemFlags::new(), v)
        } else {
            let lo = em.cur().ins().bitcast(types::I32, MemFlags::new(), v);
            let w = em.cur().ins().uextend(types::I64, lo);
            em.cur().ins().bor_imm(w, NAN_BOX)
        }
    });
    ft.write_freg(r, bits);
}

fn fp_binop(
    ft: &mut FuncTranslator,
    inst: &Inst,
    double: bool,
    f: impl FnOnce(&mut crate::func_translator::Emitter, Value, Value) -> Value,
) {
    let a = read_fp(ft, inst.rs1, double);
    let b = read_fp(ft, inst.rs2, double);
    let v = ft.emit(|em| f(em, a, b));
    write_fp(ft, inst.rd, double, v);
}

fn translate_sgnj(ft: &mut FuncTranslator, inst: &Inst, double: bool) {
    let a = ft.read_freg(inst.rs1);
    let b = ft.read_freg(inst.rs2);
    let op = inst.op;
    let bits = ft.emit(|em| {
        if double {
            let sign = em.cur().ins().iconst(types::I64, i64::MIN);
            let mag = em.cur().ins().band_imm(a, i64::MAX);
            let bs = match op {
                Op::Fsgnj { .. } => em.cur().ins().band(b, sign),
                Op::Fsgnjn { .. } => {
                    let nb = em.cur().ins().bnot(b);
                    em.cur().ins().band(nb, sign)
                }
                _ => {
                    let x = em.cur().ins().bxor(a, b);
                    em.cur().ins().band(x, sign)
                }
            };
            em.cur().ins().bor(mag, bs)
        } else {
            let a32 = em.cur().ins().ireduce(types::I32, a);
            let b32 = em.cur().ins().ireduce(types::I32, b);
            let sign = em.iconst32(0x8000_0000);
            let mag = em.cur().ins().band_imm(a32, 0x7FFF_FFFF);
            let bs = match op {
                Op::Fsgnj { .. } => em.cur().ins().band(b32, sign),
                Op::Fsgnjn { .. } => {
                    let nb = em.cur().ins().bnot(b32);
                    em.cur().ins().band(nb, sign)
                }
                _ => {
                    let x = em.cur().ins().bxor(a32, b32);
                    em.cur().ins().band(x, sign)
                }
            };
            let res = em.cur().ins().bor(mag, bs);
            let w = em.cur().ins().uextend(types::I64, res);
            em.cur().ins().bor_imm(w, NAN_BOX)
        }
    });
    ft.write_freg(inst.rd, bits);
}

/// `fclass`: the ten-bit classification mask, computed on the raw bits.
fn translate_fclass(ft: &mut FuncTranslator, inst: &Inst, double: bool) {
    let bits64 = ft.read_freg(inst.rs1);
    let v = ft.emit(|em| {
        let (bits, exp_bits, mant_bits) = if double {
            (bits64, 11u32, 52u32)
        } else {
            let lo = em.cur().ins().ireduce(types::I32, bits64);
            let w = em.cur().ins().uextend(types::I64, lo);
            (w, 8u32, 23u32)
        };
        let total = 1 + exp_bits + mant_bits;
        let exp_mask = (1i64 << exp_bits) - 1;
        let mant_mask = (1i64 << mant_bits) - 1;

        let sh = em.cur().ins().ushr_imm(bits, mant_bits as i64);
        let exp = em.cur().ins().band_imm(sh, exp_mask);
        let mant = em.cur().ins().band_imm(bits, mant_mask);
        let sgn_sh = em.cur().ins().ushr_imm(bits, (total - 1) as i64);
        let neg = em.cur().ins().band_imm(sgn_sh, 1);
        let neg = em.cur().ins().icmp_imm(IntCC::NotEqual, neg, 0);

        let exp_zero = em.cur().ins().icmp_imm(IntCC::Equal, exp, 0);
        let exp_ones = em.cur().ins().icmp_imm(IntCC::Equal, exp, exp_mask);
        let mant_zero = em.cur().ins().icmp_imm(IntCC::Equal, mant, 0);
        let quiet_sh = em.cur().ins().ushr_imm(mant, (mant_bits - 1) as i64);
        let quiet = em.cur().ins().icmp_imm(IntCC::NotEqual, quiet_sh, 0);

        let mant_nonzero = em.cur().ins().bxor_imm(mant_zero, 1);
        let is_nan = em.cur().ins().band(exp_ones, mant_nonzero);
        let is_inf = em.cur().ins().band(exp_ones, mant_zero);
        let is_zero = em.cur().ins().band(exp_zero, mant_zero);
        let is_sub = em.cur().ins().band(exp_zero, mant_nonzero);

        // positive lattice, then flip for the sign
        let pos_inf = em.iconst32(1 << 7);
        let pos_norm = em.iconst32(1 << 6);
        let pos_sub = em.iconst32(1 << 5);
        let pos_zero = em.iconst32(1 << 4);
        let neg_zero = em.iconst32(1 << 3);
        let neg_sub = em.iconst32(1 << 2);
        let neg_norm = em.iconst32(1 << 1);
        let neg_inf = em.iconst32(1 << 0);

        let p1 = em.cur().ins().select(is_zero, pos_zero, pos_norm);
        let p2 = em.cur().ins().select(is_sub, pos_sub, p1);
        let pos = em.cur().ins().select(is_inf, pos_inf, p2);
        let n1 = em.cur().ins().select(is_zero, neg_zero, neg_norm);
        let n2 = em.cur().ins().select(is_sub, neg_sub, n1);
        let negv = em.cur().ins().select(is_inf, neg_inf, n2);
        let base = em.cur().ins().select(neg, negv, pos);

        let qnan = em.iconst32(1 << 9);
        let snan = em.iconst32(1 << 8);
        let nanv = em.cur().ins().select(quiet, qnan, snan);
        em.cur().ins().select(is_nan, nanv, base)
    });
    ft.write_xreg(inst.rd, v);
}
