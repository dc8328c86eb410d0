//! Compare and branch lowering, including compare/branch fusion and
//! select.

use smallvec::smallvec;

use glacier_ir::cond::BrCond;
use glacier_ir::inst::{ArithOp, FCond, ICond, InstKind, MachineOp};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, NodeId, VarId};

use crate::folding::{producer_kind, ProducerKind};
use crate::regs::InstructionSet;
use crate::tables;

use super::{Legal, TargetX86};

/// Branch targets of a conditional branch being fused with its compare.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BrTargets {
    pub target_true: NodeId,
    pub target_false: NodeId,
}

fn is_zero_const(this: &TargetX86, op: Operand) -> bool {
    match op {
        Operand::Const(c) => this.cfg.ctx().const_info(c).is_zero(),
        _ => false,
    }
}

impl TargetX86<'_> {
    pub(crate) fn lower_br(&mut self, iid: InstId) {
        let InstKind::Br {
            target_true,
            target_false,
        } = self.cfg.inst(iid).kind
        else {
            unreachable!();
        };
        let Some(target_false) = target_false else {
            self.br_node(None, target_true, None);
            return;
        };
        let cond = self.cfg.inst(iid).srcs[0];
        let br = BrTargets {
            target_true,
            target_false,
        };

        // Fold an eligible producer into the branch.
        if let Some(producer) = self.folding.producer_for(cond) {
            debug_assert!(self.cfg.inst(producer).is_deleted());
            match producer_kind(self.config.arch, self.cfg, producer) {
                ProducerKind::IcmpNative | ProducerKind::Icmp64 => {
                    let InstKind::Icmp(cc) = self.cfg.inst(producer).kind else {
                        unreachable!();
                    };
                    self.lower_icmp_and_br(producer, cc, Some(br));
                    return;
                }
                ProducerKind::Fcmp => {
                    let InstKind::Fcmp(cc) = self.cfg.inst(producer).kind else {
                        unreachable!();
                    };
                    self.lower_fcmp_and_br(producer, cc, Some(br));
                    return;
                }
                ProducerKind::Arith => {
                    let InstKind::Arithmetic(op) = self.cfg.inst(producer).kind else {
                        unreachable!();
                    };
                    self.lower_arith_and_br(producer, op, br);
                    return;
                }
                ProducerKind::None => {}
            }
        }
        let src0 = self.legalize(cond, Legal::REG | Legal::MEM, None);
        let zero = self.const_i32(0);
        self.cmp(src0, zero);
        self.br_node(Some(BrCond::Ne), target_true, Some(target_false));
    }

    /// Either materialize a condition with setcc or branch on it,
    /// depending on whether the compare was folded into a branch.
    pub(crate) fn setcc_or_br(&mut self, cond: BrCond, dest: VarId, br: Option<BrTargets>) {
        match br {
            None => self.setcc(dest, cond),
            Some(br) => self.br_node(Some(cond), br.target_true, Some(br.target_false)),
        }
    }

    /// A compile-time-known compare result: move a constant, or branch
    /// unconditionally (via an explicit compare, since the CFG edges must
    /// stay intact).
    pub(crate) fn mov_or_br(&mut self, result: bool, dest: VarId, br: Option<BrTargets>) {
        let ty = self.cfg.var(dest).ty;
        let value = self.const_int(ty, result as i64);
        match br {
            None => {
                self.mov(dest, value);
            }
            Some(targets) => {
                self.mov(dest, value);
                let zero = self.const_zero(ty);
                self.cmp(Operand::Var(dest), zero);
                self.br_node(
                    Some(BrCond::Ne),
                    targets.target_true,
                    Some(targets.target_false),
                );
            }
        }
    }

    pub(crate) fn lower_icmp_and_br(&mut self, iid: InstId, cond: ICond, br: Option<BrTargets>) {
        let dest = self.cfg.inst(iid).dest.expect("icmp without dest");
        let src0 = {
            let s = self.cfg.inst(iid).srcs[0];
            self.legalize(s, Legal::ALL, None)
        };
        let src1 = {
            let s = self.cfg.inst(iid).srcs[1];
            self.legalize(s, Legal::ALL, None)
        };

        if self.cfg.var(dest).ty.is_vector() {
            assert!(br.is_none(), "vector compare/branch cannot be folded");
            self.lower_icmp_vector(dest, cond, src0, src1);
            return;
        }

        if !self.config.is_64bit() && self.operand_type(src0) == Type::I64 {
            self.lower_icmp64(dest, cond, src0, src1, br);
            return;
        }

        // Unsigned compares against zero have constant results.
        if is_zero_const(self, src1) {
            match cond {
                ICond::Uge => {
                    self.mov_or_br(true, dest, br);
                    return;
                }
                ICond::Ult => {
                    self.mov_or_br(false, dest, br);
                    return;
                }
                _ => {}
            }
        }
        let src0 = self.legalize_src0_for_cmp(src0, src1);
        self.cmp(src0, src1);
        self.setcc_or_br(tables::icmp_to_cond(cond), dest, br);
    }

    /// 64-bit compare on the 32-bit target: a three-branch high/low
    /// sequence, with fast paths for comparisons against zero.
    fn lower_icmp64(
        &mut self,
        dest: VarId,
        cond: ICond,
        src0: Operand,
        src1: Operand,
        br: Option<BrTargets>,
    ) {
        let zero_rhs = is_zero_const(self, src1);
        if zero_rhs {
            let sign_mask = self.const_i32(0x80000000u32 as i32);
            match cond {
                ICond::Eq | ICond::Ule | ICond::Ne | ICond::Ugt => {
                    // or lo,hi and test against zero.
                    let lo = self.lo_operand(src0);
                    let hi = self.hi_operand(src0);
                    let lo = self.legalize(lo, Legal::REG | Legal::MEM, None);
                    let hi = self.legalize(hi, Legal::REG | Legal::MEM, None);
                    let tmp = self.make_reg(Type::I32, None);
                    self.mov(tmp, hi);
                    self.or(tmp, lo);
                    self.fake_use(tmp);
                    let cc = if matches!(cond, ICond::Eq | ICond::Ule) {
                        BrCond::E
                    } else {
                        BrCond::Ne
                    };
                    self.setcc_or_br(cc, dest, br);
                    return;
                }
                ICond::Uge => {
                    self.mov_or_br(true, dest, br);
                    return;
                }
                ICond::Ult => {
                    self.mov_or_br(false, dest, br);
                    return;
                }
                ICond::Sge | ICond::Slt => {
                    // Only the sign of the high half matters.
                    let hi = self.hi_operand(src0);
                    let hi = self.legalize(hi, Legal::REG | Legal::MEM, None);
                    self.test(hi, sign_mask);
                    let cc = if cond == ICond::Sge {
                        BrCond::E
                    } else {
                        BrCond::Ne
                    };
                    self.setcc_or_br(cc, dest, br);
                    return;
                }
                ICond::Sgt | ICond::Sle => {}
                _ => {}
            }
        }
        // General case.
        let src0_lo = self.lo_operand(src0);
        let src0_hi = self.hi_operand(src0);
        let src0_lo = self.legalize(src0_lo, Legal::REG | Legal::MEM, None);
        let src0_hi = self.legalize(src0_hi, Legal::REG | Legal::MEM, None);
        let src1_lo = self.lo_operand(src1);
        let src1_hi = self.hi_operand(src1);
        let src1_lo = self.legalize(src1_lo, Legal::REG | Legal::IMM, None);
        let src1_hi = self.legalize(src1_hi, Legal::REG | Legal::IMM, None);
        let row = tables::icmp64_row(cond);
        match br {
            None => {
                let ty = self.cfg.var(dest).ty;
                let one = self.const_int(ty, 1);
                let zero = self.const_int(ty, 0);
                let label_false = self.cfg.make_label();
                let label_true = self.cfg.make_label();
                self.mov(dest, one);
                self.cmp(src0_hi, src1_hi);
                if let Some(c1) = row.c1 {
                    self.br_label(c1, label_true);
                }
                if let Some(c2) = row.c2 {
                    self.br_label(c2, label_false);
                }
                self.cmp(src0_lo, src1_lo);
                self.br_label(row.c3, label_true);
                self.insert_label(label_false);
                self.mov_redefined(dest, zero);
                self.insert_label(label_true);
            }
            Some(targets) => {
                self.cmp(src0_hi, src1_hi);
                if let Some(c1) = row.c1 {
                    self.br_node(Some(c1), targets.target_true, None);
                }
                if let Some(c2) = row.c2 {
                    self.br_node(Some(c2), targets.target_false, None);
                }
                self.cmp(src0_lo, src1_lo);
                self.br_node(
                    Some(row.c3),
                    targets.target_true,
                    Some(targets.target_false),
                );
            }
        }
    }

    fn lower_icmp_vector(&mut self, dest: VarId, cond: ICond, src0: Operand, src1: Operand) {
        let mut ty = self.operand_type(src0);
        let mut src0 = src0;
        let mut src1 = src1;
        // Promote i1 vectors to full-width integer vectors first.
        if ty.element_type() == Type::I1 {
            let new_ty = match ty {
                Type::V4I1 => Type::V4I32,
                Type::V8I1 => Type::V8I16,
                Type::V16I1 => Type::V16I8,
                _ => unreachable!("unexpected i1 vector type"),
            };
            let new_src0 = self.cfg.make_variable(new_ty);
            let new_src1 = self.cfg.make_variable(new_ty);
            self.lower_sext_vector(new_src0, src0, new_ty);
            self.lower_sext_vector(new_src1, src1, new_ty);
            src0 = Operand::Var(new_src0);
            src1 = Operand::Var(new_src1);
            ty = new_ty;
        }

        let mut src0 = self.legalize(src0, Legal::REG | Legal::MEM, None);
        let mut src1 = self.legalize(src1, Legal::REG | Legal::MEM, None);

        // SSE2 compares are signed; flip the sign bits for the unsigned
        // predicates.
        if matches!(cond, ICond::Ugt | ICond::Uge | ICond::Ult | ICond::Ule) {
            let high = self.make_vector_of_high_order_bits(ty, None);
            let t0 = self.make_reg(ty, None);
            self.movp(t0, src0);
            self.pxor(t0, Operand::Var(high));
            let t1 = self.make_reg(ty, None);
            self.movp(t1, src1);
            self.pxor(t1, Operand::Var(high));
            src0 = Operand::Var(t0);
            src1 = Operand::Var(t1);
        }

        let t = self.make_reg(ty, None);
        match cond {
            ICond::Eq => {
                let src1 = self.reg_if_mem(src1);
                self.movp(t, src0);
                self.pcmpeq(t, src1);
            }
            ICond::Ne => {
                let src1 = self.reg_if_mem(src1);
                self.movp(t, src0);
                self.pcmpeq(t, src1);
                let minus_one = self.make_vector_of_minus_ones(ty, None);
                self.pxor(t, Operand::Var(minus_one));
            }
            ICond::Ugt | ICond::Sgt => {
                let src1 = self.reg_if_mem(src1);
                self.movp(t, src0);
                self.pcmpgt(t, src1);
            }
            ICond::Uge | ICond::Sge => {
                // !(src1 > src0)
                let src0 = self.reg_if_mem(src0);
                self.movp(t, src1);
                self.pcmpgt(t, src0);
                let minus_one = self.make_vector_of_minus_ones(ty, None);
                self.pxor(t, Operand::Var(minus_one));
            }
            ICond::Ult | ICond::Slt => {
                let src0 = self.reg_if_mem(src0);
                self.movp(t, src1);
                self.pcmpgt(t, src0);
            }
            ICond::Ule | ICond::Sle => {
                // !(src0 > src1)
                let src1 = self.reg_if_mem(src1);
                self.movp(t, src0);
                self.pcmpgt(t, src1);
                let minus_one = self.make_vector_of_minus_ones(ty, None);
                self.pxor(t, Operand::Var(minus_one));
            }
        }
        self.movp(dest, Operand::Var(t));
        self.eliminate_next_vector_sext(dest);
    }

    pub(crate) fn reg_if_mem(&mut self, op: Operand) -> Operand {
        if op.as_mem().is_some() {
            Operand::Var(self.legalize_to_reg(op, None))
        } else {
            op
        }
    }

    pub(crate) fn lower_fcmp_and_br(&mut self, iid: InstId, cond: FCond, br: Option<BrTargets>) {
        let dest = self.cfg.inst(iid).dest.expect("fcmp without dest");
        let mut src0 = self.cfg.inst(iid).srcs[0];
        let mut src1 = self.cfg.inst(iid).srcs[1];

        if self.cfg.var(dest).ty.is_vector() {
            assert!(br.is_none(), "vector compare/branch cannot be folded");
            self.lower_fcmp_vector(dest, cond, src0, src1);
            return;
        }

        let row = *tables::fcmp_row(cond);
        if row.swap_scalar_operands {
            std::mem::swap(&mut src0, &mut src1);
        }
        if let Some(c1) = row.c1 {
            let src0 = self.legalize(src0, Legal::ALL, None);
            let src1_rm = self.legalize(src1, Legal::REG | Legal::MEM, None);
            let ty = self.operand_type(src0);
            let t = self.make_reg(ty, None);
            self.mov(t, src0);
            self.ucomiss(Operand::Var(t), src1_rm);
            if row.c2.is_none() {
                debug_assert!(row.default);
                self.setcc_or_br(c1, dest, br);
                return;
            }
        }
        let default = row.default;
        match br {
            None => {
                let ty = self.cfg.var(dest).ty;
                let default_op = self.const_int(ty, default as i64);
                self.mov(dest, default_op);
                if let Some(c1) = row.c1 {
                    let label = self.cfg.make_label();
                    self.br_label(c1, label);
                    if let Some(c2) = row.c2 {
                        self.br_label(c2, label);
                    }
                    let non_default = self.const_int(ty, !default as i64);
                    self.mov_redefined(dest, non_default);
                    self.insert_label(label);
                }
            }
            Some(targets) => {
                let (mut t, mut f) = (targets.target_true, targets.target_false);
                if default {
                    std::mem::swap(&mut t, &mut f);
                }
                if let Some(c1) = row.c1 {
                    self.br_node(Some(c1), f, None);
                    if let Some(c2) = row.c2 {
                        self.br_node(Some(c2), f, None);
                    }
                    self.br_node(None, t, None);
                    return;
                }
                self.br_node(None, f, None);
            }
        }
    }

    fn lower_fcmp_vector(&mut self, dest: VarId, cond: FCond, mut src0: Operand, mut src1: Operand) {
        let row = *tables::fcmp_row(cond);
        if row.swap_vector_operands {
            std::mem::swap(&mut src0, &mut src1);
        }
        let t = match cond {
            FCond::True => self.make_vector_of_minus_ones(Type::V4I32, None),
            FCond::False => {
                let ty = self.cfg.var(dest).ty;
                self.make_vector_of_zeros(ty, None)
            }
            _ => {
                let src0 = self.legalize(src0, Legal::REG | Legal::MEM, None);
                let src1 = self.legalize(src1, Legal::REG | Legal::MEM, None);
                let src1 = self.reg_if_mem(src1);
                let ty = self.operand_type(src0);
                match cond {
                    FCond::One => {
                        // Unequal and ordered.
                        let t = self.make_reg(ty, None);
                        let t2 = self.make_reg(ty, None);
                        self.movp(t, src0);
                        self.cmpps(t, src1, glacier_ir::cond::CmppsCond::Neq);
                        self.movp(t2, src0);
                        self.cmpps(t2, src1, glacier_ir::cond::CmppsCond::Ord);
                        self.pand(t, Operand::Var(t2));
                        t
                    }
                    FCond::Ueq => {
                        // Equal or unordered.
                        let t = self.make_reg(ty, None);
                        let t2 = self.make_reg(ty, None);
                        self.movp(t, src0);
                        self.cmpps(t, src1, glacier_ir::cond::CmppsCond::Eq);
                        self.movp(t2, src0);
                        self.cmpps(t2, src1, glacier_ir::cond::CmppsCond::Unord);
                        self.por(t, Operand::Var(t2));
                        t
                    }
                    _ => {
                        let pred = row.predicate.expect("missing cmpps predicate");
                        let t = self.make_reg(ty, None);
                        self.movp(t, src0);
                        self.cmpps(t, src1, pred);
                        t
                    }
                }
            }
        };
        self.movp(dest, Operand::Var(t));
        self.eliminate_next_vector_sext(dest);
    }

    /// `cmp` lowered out of a flag-setting And/Or folded into a branch.
    fn lower_arith_and_br(&mut self, iid: InstId, op: ArithOp, br: BrTargets) {
        let dest = self.cfg.inst(iid).dest.expect("arith without dest");
        let src0 = {
            let s = self.cfg.inst(iid).srcs[0];
            self.legalize(s, Legal::ALL, None)
        };
        let src1 = {
            let s = self.cfg.inst(iid).srcs[1];
            self.legalize(s, Legal::ALL, None)
        };
        let ty = self.operand_type(src0);
        let t = self.make_reg(ty, None);
        match op {
            ArithOp::And => {
                self.mov(t, src0);
                // Test cannot take a memory operand in the second
                // position; t is guaranteed to be a register.
                if src1.is_const() {
                    self.test(Operand::Var(t), src1);
                } else {
                    self.test(src1, Operand::Var(t));
                }
            }
            ArithOp::Or => {
                self.mov(t, src0);
                self.or(t, src1);
            }
            _ => unreachable!("arithmetic operator not And or Or"),
        }
        self.fake_use(t);
        self.fake_def(dest, None);
        self.br_node(Some(BrCond::Ne), br.target_true, Some(br.target_false));
    }

    // --- Select ---

    pub(crate) fn lower_select(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("select without dest");
        let dest_ty = self.cfg.var(dest).ty;
        let condition = self.cfg.inst(iid).srcs[0];
        let src_t = self.cfg.inst(iid).srcs[1];
        let src_f = self.cfg.inst(iid).srcs[2];

        if dest_ty.is_vector() {
            self.lower_select_vector(dest, condition, src_t, src_f);
            return;
        }

        let mut cond_code = BrCond::Ne;
        let mut cmp0 = None;
        let mut cmp1 = None;
        // Fold a native icmp producer into the compare.
        if let Some(producer) = self.folding.producer_for(condition) {
            debug_assert!(self.cfg.inst(producer).is_deleted());
            if producer_kind(self.config.arch, self.cfg, producer) == ProducerKind::IcmpNative {
                let InstKind::Icmp(cc) = self.cfg.inst(producer).kind else {
                    unreachable!();
                };
                cond_code = tables::icmp_to_cond(cc);
                let p1 = self.cfg.inst(producer).srcs[1];
                let p0 = self.cfg.inst(producer).srcs[0];
                let op1 = self.legalize(p1, Legal::ALL, None);
                let op0 = self.legalize_src0_for_cmp(p0, op1);
                cmp0 = Some(op0);
                cmp1 = Some(op1);
            }
        }
        let (cmp0, cmp1) = match (cmp0, cmp1) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                let c = self.legalize(condition, Legal::REG | Legal::MEM, None);
                (c, self.const_i32(0))
            }
        };
        self.cmp(cmp0, cmp1);

        let mut src_t = src_t;
        let mut src_f = src_f;
        let mut cond_code = cond_code;
        if dest_ty.width_in_bytes() == 1 || dest_ty.is_float() {
            // cmov cannot take 8-bit or FP operands; use explicit control
            // flow.
            let label = self.cfg.make_label();
            let src_t = self.legalize(src_t, Legal::REG | Legal::IMM, None);
            self.mov(dest, src_t);
            self.br_label(cond_code, label);
            let src_f = self.legalize(src_f, Legal::REG | Legal::IMM, None);
            self.mov_redefined(dest, src_f);
            self.insert_label(label);
            return;
        }
        // cmov cannot take an immediate source; prefer swapping with the
        // inverted condition.
        if src_t.is_const() && !src_f.is_const() {
            std::mem::swap(&mut src_t, &mut src_f);
            cond_code = cond_code.opposite();
        }
        if !self.config.is_64bit() && dest_ty == Type::I64 {
            let src_t = self.legalize_undef(src_t, None);
            let src_f = self.legalize_undef(src_f, None);
            let (dest_lo, dest_hi) = self.dest_parts(dest);
            for (d, half) in [(dest_lo, false), (dest_hi, true)] {
                let f_half = if half {
                    self.hi_operand(src_f)
                } else {
                    self.lo_operand(src_f)
                };
                let t_half = if half {
                    self.hi_operand(src_t)
                } else {
                    self.lo_operand(src_t)
                };
                let f_half = self.legalize(f_half, Legal::ALL, None);
                let t_half = self.legalize(t_half, Legal::REG | Legal::MEM, None);
                let tmp = self.make_reg(Type::I32, None);
                self.mov(tmp, f_half);
                self.cmov(tmp, t_half, cond_code);
                self.mov(d, Operand::Var(tmp));
            }
            return;
        }
        debug_assert!(
            dest_ty == Type::I16
                || dest_ty == Type::I32
                || (self.config.is_64bit() && dest_ty == Type::I64)
        );
        let src_f = self.legalize(src_f, Legal::ALL, None);
        let t = self.make_reg(dest_ty, None);
        self.mov(t, src_f);
        let src_t = self.legalize(src_t, Legal::REG | Legal::MEM, None);
        self.cmov(t, src_t, cond_code);
        self.mov(dest, Operand::Var(t));
    }

    fn lower_select_vector(
        &mut self,
        dest: VarId,
        condition: Operand,
        src_t: Operand,
        src_f: Operand,
    ) {
        let src_ty = self.operand_type(src_t);
        let t = self.make_reg(src_ty, None);
        let src_t_rm = self.legalize(src_t, Legal::REG | Legal::MEM, None);
        let src_f_rm = self.legalize(src_f, Legal::REG | Legal::MEM, None);
        if self.config.isa >= InstructionSet::Sse41 {
            if matches!(src_ty, Type::V4I1 | Type::V4I32 | Type::V4F32) {
                // blendvps keys off the sign bit of xmm0.
                let cond_rm = self.legalize(condition, Legal::REG | Legal::MEM, None);
                let xmm0 = self.make_reg(Type::V4I32, Some(self.reg_xmm0()));
                self.movp(xmm0, cond_rm);
                let amt = self.const_i32(31);
                self.psll(xmm0, amt);
                self.movp(t, src_f_rm);
                self.m(
                    MachineOp::Blendvps,
                    Some(t),
                    smallvec![Operand::Var(t), src_t_rm, Operand::Var(xmm0)],
                );
                self.movp(dest, Operand::Var(t));
            } else {
                debug_assert!(src_ty.num_elements() == 8 || src_ty.num_elements() == 16);
                let cond_ty = self.operand_type(condition);
                let sext_ty = if cond_ty == Type::V8I1 {
                    Type::V8I16
                } else {
                    Type::V16I8
                };
                let xmm0 = self.make_reg(sext_ty, Some(self.reg_xmm0()));
                self.lower_sext_vector(xmm0, condition, sext_ty);
                self.movp(t, src_f_rm);
                self.m(
                    MachineOp::Pblendvb,
                    Some(t),
                    smallvec![Operand::Var(t), src_t_rm, Operand::Var(xmm0)],
                );
                self.movp(dest, Operand::Var(t));
            }
            return;
        }
        // Without SSE4.1: dest = (t & cond) | (f & ~cond), sign-extending
        // the condition first when its element type is not i1-sized.
        let t2 = self.make_reg(src_ty, None);
        if src_ty == Type::V4F32 {
            let t3 = self.cfg.make_variable(Type::V4I32);
            self.lower_sext_vector(t3, condition, Type::V4I32);
            self.movp(t, Operand::Var(t3));
        } else if src_ty.element_type() != Type::I1 {
            self.lower_sext_vector(t, condition, src_ty);
        } else {
            let cond_rm = self.legalize(condition, Legal::REG | Legal::MEM, None);
            self.movp(t, cond_rm);
        }
        self.movp(t2, Operand::Var(t));
        self.pand(t, src_t_rm);
        self.pandn(t2, src_f_rm);
        self.por(t, Operand::Var(t2));
        self.movp(dest, Operand::Var(t));
    }

    /// After a vector compare, a following `sext` of the result is a
    /// no-op: the compare already produced sign-filled lanes.
    pub(crate) fn eliminate_next_vector_sext(&mut self, sign_extended: VarId) {
        let Some(next) = self.ctx.next_inst(self.cfg) else {
            return;
        };
        let next_inst = self.cfg.inst(next);
        if next_inst.is_deleted() {
            return;
        }
        let InstKind::Cast(glacier_ir::inst::CastOp::Sext) = next_inst.kind else {
            return;
        };
        if next_inst.srcs[0] != Operand::Var(sign_extended) {
            return;
        }
        let cast_dest = next_inst.dest.expect("sext without dest");
        self.cfg.inst_mut(next).set_deleted();
        let r = self.legalize_to_reg(Operand::Var(sign_extended), None);
        self.movp(cast_dest, Operand::Var(r));
        self.ctx.advance_next(self.cfg);
    }
}
