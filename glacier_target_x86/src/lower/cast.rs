//! Cast lowering: widening, narrowing, int/float conversion, bitcasts.
//!
//! The i64-involving conversions, fp-to-unsigned, and i1-vector bitcasts
//! must have been rewritten to helper calls before this point.

use glacier_ir::cond::CvtVariant;
use glacier_ir::inst::CastOp;
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, VarId};
use glacier_ir::variable::RegClass;

use super::{Legal, TargetX86};

impl TargetX86<'_> {
    pub(crate) fn lower_cast(&mut self, iid: InstId, op: CastOp) {
        let dest = self.cfg.inst(iid).dest.expect("cast without dest");
        let dest_ty = self.cfg.var(dest).ty;
        let src = self.cfg.inst(iid).srcs[0];
        match op {
            CastOp::Sext => self.lower_sext(dest, dest_ty, src),
            CastOp::Zext => self.lower_zext(dest, dest_ty, src),
            CastOp::Trunc => self.lower_trunc(dest, dest_ty, src),
            CastOp::Fptrunc | CastOp::Fpext => {
                let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
                let t = self.make_reg(dest_ty, None);
                self.cvt(t, src_rm, CvtVariant::Float2float);
                self.mov(dest, Operand::Var(t));
            }
            CastOp::Fptosi => self.lower_fptosi(dest, dest_ty, src),
            CastOp::Fptoui => self.lower_fptoui(dest, dest_ty, src),
            CastOp::Sitofp => self.lower_sitofp(dest, dest_ty, src),
            CastOp::Uitofp => self.lower_uitofp(dest, dest_ty, src),
            CastOp::Bitcast => self.lower_bitcast(iid, dest, dest_ty, src),
        }
    }

    fn lower_sext(&mut self, dest: VarId, dest_ty: Type, src: Operand) {
        let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
        if dest_ty.is_vector() {
            self.lower_sext_vector(dest, src_rm, dest_ty);
        } else if !self.config.is_64bit() && dest_ty == Type::I64 {
            // t1 = sext src; dest.lo = t1; dest.hi = sar t1, 31
            let shift = self.const_i32(31);
            let (dest_lo, dest_hi) = self.dest_parts(dest);
            let src_ty = self.operand_type(src_rm);
            let t_lo = self.make_reg(Type::I32, None);
            if src_ty == Type::I32 {
                self.mov(t_lo, src_rm);
            } else if src_ty == Type::I1 {
                self.movzx(t_lo, src_rm);
                self.shl(t_lo, shift);
                self.sar(t_lo, shift);
            } else {
                self.movsx(t_lo, src_rm);
            }
            self.mov(dest_lo, Operand::Var(t_lo));
            let t_hi = self.make_reg(Type::I32, None);
            self.mov(t_hi, Operand::Var(t_lo));
            if src_ty != Type::I1 {
                // For i1 the shift pair above already filled the sign.
                self.sar(t_hi, shift);
            }
            self.mov(dest_hi, Operand::Var(t_hi));
        } else if self.operand_type(src_rm) == Type::I1 {
            // shl/sar by width-1 fills every bit from the low one.
            let dest_bits = dest_ty.width_in_bytes() * 8;
            let amount = self.const_i32(dest_bits as i32 - 1);
            let t = self.make_reg(dest_ty, None);
            if dest_ty.width_in_bytes() <= self.operand_type(src_rm).width_in_bytes() {
                self.mov(t, src_rm);
            } else {
                // Widen with movzx; the shifts overwrite every bit anyway.
                self.movzx(t, src_rm);
            }
            self.shl(t, amount);
            self.sar(t, amount);
            self.mov(dest, Operand::Var(t));
        } else {
            let t = self.make_reg(dest_ty, None);
            self.movsx(t, src_rm);
            self.mov(dest, Operand::Var(t));
        }
    }

    /// Vector sext: shift left then arithmetic shift right by the lane
    /// width minus one; v16i8 has no lane shift and goes through a
    /// mask-and-compare instead.
    pub(crate) fn lower_sext_vector(&mut self, dest: VarId, src: Operand, dest_ty: Type) {
        let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
        if dest_ty == Type::V16I8 {
            let one_mask = self.make_vector_of_ones(dest_ty, None);
            let t = self.make_reg(dest_ty, None);
            self.movp(t, src_rm);
            self.pand(t, Operand::Var(one_mask));
            let zeros = self.make_vector_of_zeros(dest_ty, None);
            self.pcmpgt(t, Operand::Var(zeros));
            self.movp(dest, Operand::Var(t));
        } else {
            let shift = dest_ty.element_type().width_in_bytes() * 8 - 1;
            let amount = self.const_i32(shift as i32);
            let t = self.make_reg(dest_ty, None);
            self.movp(t, src_rm);
            self.psll(t, amount);
            self.psra(t, amount);
            self.movp(dest, Operand::Var(t));
        }
    }

    fn lower_zext(&mut self, dest: VarId, dest_ty: Type, src: Operand) {
        let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
        if dest_ty.is_vector() {
            // Mask down to the low bit of each lane.
            let one_mask = self.make_vector_of_ones(dest_ty, None);
            let t = self.make_reg(dest_ty, None);
            self.movp(t, src_rm);
            self.pand(t, Operand::Var(one_mask));
            self.movp(dest, Operand::Var(t));
        } else if !self.config.is_64bit() && dest_ty == Type::I64 {
            let zero = self.const_i32(0);
            let (dest_lo, dest_hi) = self.dest_parts(dest);
            let tmp = self.make_reg(Type::I32, None);
            if self.operand_type(src_rm) == Type::I32 {
                self.mov(tmp, src_rm);
            } else {
                self.movzx(tmp, src_rm);
            }
            self.mov(dest_lo, Operand::Var(tmp));
            self.mov(dest_hi, zero);
        } else if self.operand_type(src_rm) == Type::I1 {
            if dest_ty == Type::I8 {
                let t = self.make_reg(dest_ty, None);
                self.mov(t, src_rm);
                self.mov(dest, Operand::Var(t));
            } else {
                debug_assert!(dest_ty != Type::I1);
                // Use a full 32-bit (or 64-bit) zero-extension so a stack
                // spill of the temporary is fully extended.
                let wide = if dest_ty == Type::I64 {
                    Type::I64
                } else {
                    Type::I32
                };
                let t = self.make_reg(wide, None);
                self.movzx(t, src_rm);
                self.mov(dest, Operand::Var(t));
            }
        } else {
            let t = self.make_reg(dest_ty, None);
            self.movzx(t, src_rm);
            self.mov(dest, Operand::Var(t));
        }
    }

    fn lower_trunc(&mut self, dest: VarId, dest_ty: Type, src: Operand) {
        if dest_ty.is_vector() {
            let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
            let src_ty = self.operand_type(src_rm);
            let one_mask = self.make_vector_of_ones(src_ty, None);
            let t = self.make_reg(dest_ty, None);
            self.movp(t, src_rm);
            self.pand(t, Operand::Var(one_mask));
            self.movp(dest, Operand::Var(t));
        } else if dest_ty == Type::I1 || dest_ty == Type::I8 {
            let mut src = self.legalize_undef(src, None);
            if !self.config.is_64bit() && self.operand_type(src) == Type::I64 {
                src = self.lo_operand(src);
            }
            let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
            let t = self.copy_to_reg8(src_rm, None);
            if dest_ty == Type::I1 {
                let one = self.const_int(Type::I1, 1);
                self.and(t, one);
            }
            self.mov(dest, Operand::Var(t));
        } else {
            let mut src = self.legalize_undef(src, None);
            if !self.config.is_64bit() && self.operand_type(src) == Type::I64 {
                src = self.lo_operand(src);
            }
            let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
            let t = self.make_reg(dest_ty, None);
            self.mov(t, src_rm);
            self.mov(dest, Operand::Var(t));
        }
    }

    fn lower_fptosi(&mut self, dest: VarId, dest_ty: Type, src: Operand) {
        if dest_ty.is_vector() {
            debug_assert!(dest_ty == Type::V4I32);
            let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
            let src_rm = self.reg_if_mem(src_rm);
            let t = self.make_reg(dest_ty, None);
            self.cvt(t, src_rm, CvtVariant::Tps2dq);
            self.movp(dest, Operand::Var(t));
        } else if !self.config.is_64bit() && dest_ty == Type::I64 {
            unreachable!("fptosi to i64 should have become a helper call")
        } else {
            let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
            // Convert through the 32-bit (or 64-bit) integer form, then
            // narrow.
            let t1 = if self.config.is_64bit() && dest_ty == Type::I64 {
                self.make_reg(Type::I64, None)
            } else {
                debug_assert!(dest_ty != Type::I64);
                self.make_reg(Type::I32, None)
            };
            let t2 = self.make_reg(dest_ty, None);
            if dest_ty.is_byte_sized() {
                self.cfg.var_mut(t1).reg_class = RegClass::Is32To8;
                self.cfg.var_mut(t2).reg_class = RegClass::Trunc8Rcvr;
            }
            self.cvt(t1, src_rm, CvtVariant::Tss2si);
            self.mov(t2, Operand::Var(t1));
            if dest_ty == Type::I1 {
                let one = self.const_int(Type::I1, 1);
                self.and(t2, one);
            }
            self.mov(dest, Operand::Var(t2));
        }
    }

    fn lower_fptoui(&mut self, dest: VarId, dest_ty: Type, src: Operand) {
        if dest_ty.is_vector()
            || dest_ty == Type::I64
            || (!self.config.is_64bit() && dest_ty == Type::I32)
        {
            unreachable!("fptoui should have become a helper call")
        }
        let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
        // Widen through a larger signed conversion, then narrow.
        let t1 = if self.config.is_64bit() && dest_ty == Type::I32 {
            self.make_reg(Type::I64, None)
        } else {
            debug_assert!(dest_ty != Type::I32 || self.config.is_64bit());
            self.make_reg(Type::I32, None)
        };
        let t2 = self.make_reg(dest_ty, None);
        if dest_ty.is_byte_sized() {
            self.cfg.var_mut(t1).reg_class = RegClass::Is32To8;
            self.cfg.var_mut(t2).reg_class = RegClass::Trunc8Rcvr;
        }
        self.cvt(t1, src_rm, CvtVariant::Tss2si);
        self.mov(t2, Operand::Var(t1));
        if dest_ty == Type::I1 {
            let one = self.const_int(Type::I1, 1);
            self.and(t2, one);
        }
        self.mov(dest, Operand::Var(t2));
    }

    fn lower_sitofp(&mut self, dest: VarId, dest_ty: Type, src: Operand) {
        if dest_ty.is_vector() {
            debug_assert!(dest_ty == Type::V4F32);
            let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
            let src_rm = self.reg_if_mem(src_rm);
            let t = self.make_reg(dest_ty, None);
            self.cvt(t, src_rm, CvtVariant::Dq2ps);
            self.movp(dest, Operand::Var(t));
            return;
        }
        let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
        let src_ty = self.operand_type(src_rm);
        if !self.config.is_64bit() && src_ty == Type::I64 {
            unreachable!("sitofp from i64 should have become a helper call")
        }
        // Sign-extend to the conversion width first.
        let t1 = if self.config.is_64bit() && src_ty == Type::I64 {
            self.make_reg(Type::I64, None)
        } else {
            debug_assert!(src_ty != Type::I64);
            self.make_reg(Type::I32, None)
        };
        let t2 = self.make_reg(dest_ty, None);
        if src_ty == self.cfg.var(t1).ty {
            self.mov(t1, src_rm);
        } else {
            self.movsx(t1, src_rm);
        }
        self.cvt(t2, Operand::Var(t1), CvtVariant::Si2ss);
        self.mov(dest, Operand::Var(t2));
    }

    fn lower_uitofp(&mut self, dest: VarId, dest_ty: Type, src: Operand) {
        let src_ty = self.operand_type(src);
        if src_ty.is_vector()
            || src_ty == Type::I64
            || (!self.config.is_64bit() && src_ty == Type::I32)
        {
            unreachable!("uitofp should have become a helper call")
        }
        let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
        // Zero-extend to the conversion width first.
        let t1 = if self.config.is_64bit() && src_ty == Type::I32 {
            self.make_reg(Type::I64, None)
        } else {
            self.make_reg(Type::I32, None)
        };
        let t2 = self.make_reg(dest_ty, None);
        if src_ty == self.cfg.var(t1).ty {
            self.mov(t1, src_rm);
        } else {
            self.movzx(t1, src_rm);
        }
        self.cvt(t2, Operand::Var(t1), CvtVariant::Si2ss);
        self.mov(dest, Operand::Var(t2));
    }

    fn lower_bitcast(&mut self, iid: InstId, dest: VarId, dest_ty: Type, src: Operand) {
        let src_ty = self.operand_type(src);
        if dest_ty == src_ty {
            // Same-type bitcast degenerates to an assignment.
            self.lower_assign_like(dest, src);
            return;
        }
        match dest_ty {
            Type::I8 | Type::I16 | Type::V8I1 | Type::V16I1 => {
                unreachable!("i1-vector bitcast should have become a helper call")
            }
            Type::I32 | Type::F32 => {
                let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
                debug_assert!(
                    (dest_ty == Type::I32 && src_ty == Type::F32)
                        || (dest_ty == Type::F32 && src_ty == Type::I32),
                    "bitcast between mismatched widths"
                );
                if self.config.is_64bit() {
                    let t = self.make_reg(dest_ty, None);
                    self.movd(t, src_rm);
                    self.mov(dest, Operand::Var(t));
                } else {
                    // Round-trip through a spill slot linked to the dest.
                    let spill = self.cfg.make_variable(src_ty);
                    self.cfg.var_mut(spill).set_must_not_have_reg();
                    self.cfg.var_mut(spill).linked_to = Some(dest);
                    let t = self.make_reg(src_ty, None);
                    self.mov(t, src_rm);
                    self.mov(spill, Operand::Var(t));
                    self.mov(dest, Operand::Var(spill));
                }
            }
            Type::I64 => {
                debug_assert!(src_ty == Type::F64, "bitcast between mismatched widths");
                if self.config.is_64bit() {
                    let src_r = self.legalize_to_reg(src, None);
                    let t = self.make_reg(Type::I64, None);
                    self.movd(t, Operand::Var(src_r));
                    self.mov(dest, Operand::Var(t));
                } else {
                    let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
                    let (spill_lo, spill_hi) = if let Some(src_var) = src_rm.as_var() {
                        let spill = self.cfg.make_variable(Type::F64);
                        self.cfg.var_mut(spill).set_must_not_have_reg();
                        self.cfg.var_mut(spill).linked_to = Some(src_var);
                        self.movq(spill, src_rm);
                        (self.split_lo(spill), self.split_hi(spill))
                    } else {
                        let lo = self.lo_operand(src_rm);
                        let hi = self.hi_operand(src_rm);
                        (lo, hi)
                    };
                    let (dest_lo, dest_hi) = self.dest_parts(dest);
                    let t_lo = self.make_reg(Type::I32, None);
                    self.mov(t_lo, spill_lo);
                    self.mov(dest_lo, Operand::Var(t_lo));
                    let t_hi = self.make_reg(Type::I32, None);
                    self.mov(t_hi, spill_hi);
                    self.mov(dest_hi, Operand::Var(t_hi));
                }
            }
            Type::F64 => {
                debug_assert!(src_ty == Type::I64, "bitcast between mismatched widths");
                if self.config.is_64bit() {
                    let src_rm = self.legalize(src, Legal::REG | Legal::MEM, None);
                    let t = self.make_reg(Type::F64, None);
                    self.movd(t, src_rm);
                    self.mov(dest, Operand::Var(t));
                } else {
                    let src = self.legalize(src, Legal::ALL, None);
                    if src.as_mem().is_some() {
                        let t = self.cfg.make_variable(Type::F64);
                        self.cfg.var_mut(t).set_must_have_reg();
                        self.movq(t, src);
                        self.movq(dest, Operand::Var(t));
                        return;
                    }
                    // Build the f64 in a spill slot from the two halves,
                    // with a fake def so the slot is defined before its
                    // halves are stored.
                    let spill = self.cfg.make_variable(Type::F64);
                    self.cfg.var_mut(spill).set_must_not_have_reg();
                    self.cfg.var_mut(spill).linked_to = Some(dest);
                    let spill_lo = self.split_lo(spill);
                    let spill_hi = self.split_hi(spill);
                    let src_lo = self.lo_operand(src);
                    let src_hi = self.hi_operand(src);
                    let t_lo = self.make_reg(Type::I32, None);
                    self.mov(t_lo, src_lo);
                    self.fake_def(spill, None);
                    self.store_split(Operand::Var(t_lo), spill_lo);
                    let t_hi = self.make_reg(Type::I32, None);
                    self.mov(t_hi, src_hi);
                    self.store_split(Operand::Var(t_hi), spill_hi);
                    self.movq(dest, Operand::Var(spill));
                }
            }
            Type::V8I16 | Type::V16I8 | Type::V4I32 | Type::V4F32 => {
                let r = self.legalize_to_reg(src, None);
                self.movp(dest, Operand::Var(r));
            }
            _ => {
                self.cfg.set_error(glacier_ir::CfgError::UnsupportedLowering(
                    format!("bitcast to {}", dest_ty),
                ));
            }
        }
        let _ = iid;
    }

    /// Lower `dest = src` outside of a real Assign instruction.
    pub(crate) fn lower_assign_like(&mut self, dest: VarId, src: Operand) {
        let dest_ty = self.cfg.var(dest).ty;
        if !self.config.is_64bit() && dest_ty == Type::I64 {
            let src = self.legalize(src, Legal::ALL, None);
            let src_lo = self.lo_operand(src);
            let src_hi = self.hi_operand(src);
            let (dest_lo, dest_hi) = self.dest_parts(dest);
            let t_lo = self.make_reg(Type::I32, None);
            self.mov(t_lo, src_lo);
            self.mov(dest_lo, Operand::Var(t_lo));
            let t_hi = self.make_reg(Type::I32, None);
            self.mov(t_hi, src_hi);
            self.mov(dest_hi, Operand::Var(t_hi));
        } else {
            let legal = self.legalize(src, Legal::REG | Legal::IMM, None);
            if dest_ty.is_vector() {
                self.movp(dest, legal);
            } else {
                self.mov(dest, legal);
            }
        }
    }

    /// Store into one half of a 64-bit spill slot. The split operand is
    /// memory by construction; the assembler resolves it against the
    /// slot's frame offset.
    fn store_split(&mut self, value: Operand, split: Operand) {
        debug_assert!(matches!(split, Operand::Split { .. }));
        self.m(
            glacier_ir::inst::MachineOp::Store,
            None,
            smallvec::smallvec![value, split],
        );
    }
}
