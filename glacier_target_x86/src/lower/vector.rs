//! Vector element access and scalarization.

use smallvec::smallvec;

use glacier_ir::constants::Constant;
use glacier_ir::inst::{ArithOp, CastOp, Inst, InstKind, MachineOp};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, VarId};

use super::{Legal, TargetX86};

impl TargetX86<'_> {
    fn const_index(&self, op: Operand) -> u32 {
        // Only constant element indices exist in the input IR.
        let c = op.as_const().expect("non-constant element index");
        match self.cfg.ctx().const_info(c) {
            Constant::Int32(v) => v as u32,
            other => panic!("bad element index constant {:?}", other),
        }
    }

    pub(crate) fn lower_extract_element(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("extract without dest");
        let source_vect = self.cfg.inst(iid).srcs[0];
        let index = self.const_index(self.cfg.inst(iid).srcs[1]);
        let ty = self.operand_type(source_vect);
        let element_ty = ty.element_type();
        // Bool vector lanes widen to the underlying integer lane type.
        let in_vector_element_ty = match ty {
            Type::V4I1 => Type::I32,
            Type::V8I1 => Type::I16,
            Type::V16I1 => Type::I8,
            _ => element_ty,
        };

        let can_use_pextr = ty == Type::V8I16
            || ty == Type::V8I1
            || (self.config.isa >= crate::regs::InstructionSet::Sse41 && ty != Type::V4F32);
        let mut extracted = if can_use_pextr {
            // pextrb/w/d clear the upper bits, so extract into an i32.
            let r = self.make_reg(Type::I32, None);
            let src_r = self.legalize_to_reg(source_vect, None);
            let mask = self.const_i32(index as i32);
            self.m(
                MachineOp::Pextr,
                Some(r),
                smallvec![Operand::Var(src_r), mask],
            );
            r
        } else if matches!(ty, Type::V4I32 | Type::V4F32 | Type::V4I1) {
            // Shuffle the wanted lane to position zero, then movd/movss
            // it out.
            let r = self.make_reg(in_vector_element_ty, None);
            let t = if index != 0 {
                let mask = self.const_i32(index as i32);
                let t = self.make_reg(ty, None);
                let src_rm = self.legalize(source_vect, Legal::REG | Legal::MEM, None);
                self.pshufd(t, src_rm, mask);
                t
            } else {
                self.legalize_to_reg(source_vect, None)
            };
            if in_vector_element_ty == Type::I32 {
                self.movd(r, Operand::Var(t));
            } else {
                // movss merges lanes, so liveness needs a def first.
                self.fake_def(r, None);
                self.movss(r, t);
            }
            r
        } else {
            debug_assert!(ty == Type::V16I8 || ty == Type::V16I1);
            // Spill the vector and extract from memory.
            let slot = self.cfg.make_variable(ty);
            self.cfg.var_mut(slot).set_must_not_have_reg();
            let src_r = self.legalize_to_reg(source_vect, None);
            self.movp(slot, Operand::Var(src_r));
            let offset = index * in_vector_element_ty.width_in_bytes();
            let loc = self.memory_operand_for_stack_slot(slot, offset);
            let r = self.make_reg(in_vector_element_ty, None);
            self.mov(r, Operand::Mem(loc));
            r
        };

        if element_ty == Type::I1 {
            // Truncate to i1 via the cast lowering.
            let t = self.make_reg(Type::I1, None);
            self.lower_trunc_through(t, Operand::Var(extracted));
            extracted = t;
        }
        self.mov(dest, Operand::Var(extracted));
    }

    /// Route a value through the trunc lowering without a source
    /// instruction.
    fn lower_trunc_through(&mut self, dest: VarId, src: Operand) {
        let inst = Inst::new(InstKind::Cast(CastOp::Trunc), Some(dest), smallvec![src]);
        let id = self.cfg.add_inst(inst);
        self.lower_cast(id, CastOp::Trunc);
        self.cfg.inst_mut(id).set_deleted();
    }

    pub(crate) fn lower_insert_element(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("insert without dest");
        let source_vect = self.cfg.inst(iid).srcs[0];
        let mut element = self.cfg.inst(iid).srcs[1];
        let index = self.const_index(self.cfg.inst(iid).srcs[2]);
        let ty = self.operand_type(source_vect);
        debug_assert!(index < ty.num_elements());
        let element_ty = ty.element_type();
        let in_vector_element_ty = match ty {
            Type::V4I1 => Type::I32,
            Type::V8I1 => Type::I16,
            Type::V16I1 => Type::I8,
            _ => element_ty,
        };

        if element_ty == Type::I1 {
            // Widen the element so it can be inserted.
            let expanded = self.cfg.make_variable(in_vector_element_ty);
            let cast = Inst::new(
                InstKind::Cast(CastOp::Zext),
                Some(expanded),
                smallvec![element],
            );
            let id = self.cfg.add_inst(cast);
            self.lower_cast(id, CastOp::Zext);
            self.cfg.inst_mut(id).set_deleted();
            element = Operand::Var(expanded);
        }

        if ty == Type::V8I16
            || ty == Type::V8I1
            || self.config.isa >= crate::regs::InstructionSet::Sse41
        {
            // insertps / pinsrb / pinsrw / pinsrd.
            let mut element_rm = self.legalize(element, Legal::REG | Legal::MEM, None);
            let source_rm = self.legalize(source_vect, Legal::REG | Legal::MEM, None);
            let t = self.make_reg(ty, None);
            self.movp(t, source_rm);
            if ty == Type::V4F32 {
                let mask = self.const_i32((index << 4) as i32);
                self.m(
                    MachineOp::Insertps,
                    Some(t),
                    smallvec![Operand::Var(t), element_rm, mask],
                );
            } else {
                // A register source of pinsrb must be a full r32, never
                // ah/bh/ch/dh.
                if self.operand_type(element_rm) == Type::I8 && element_rm.is_var() {
                    element_rm = Operand::Var(self.copy_to_reg8(element_rm, None));
                }
                let mask = self.const_i32(index as i32);
                self.m(
                    MachineOp::Pinsr,
                    Some(t),
                    smallvec![Operand::Var(t), element_rm, mask],
                );
            }
            self.movp(dest, Operand::Var(t));
        } else if matches!(ty, Type::V4I32 | Type::V4F32 | Type::V4I1) {
            // Compose with movss/shufps.
            let source_rm = self.legalize(source_vect, Legal::REG | Legal::MEM, None);
            let element_r = if in_vector_element_ty == Type::F32 {
                self.legalize_to_reg(element, None)
            } else {
                let elem_rm = self.legalize(element, Legal::REG | Legal::MEM, None);
                let r = self.make_reg(ty, None);
                self.movd(r, elem_rm);
                r
            };

            if index == 0 {
                let t = self.make_reg(ty, None);
                self.movp(t, source_rm);
                self.movss(t, element_r);
                self.movp(dest, Operand::Var(t));
                return;
            }

            // Two shufps passes place element 0 of element_r into the
            // wanted lane; masks depend on the target index.
            let mask1 = [0, 192, 128][index as usize - 1];
            let mask2 = [227, 196, 52][index as usize - 1];
            let mask1 = self.const_i32(mask1);
            let mask2 = self.const_i32(mask2);
            if index == 1 {
                self.shufps(element_r, source_rm, mask1);
                self.shufps(element_r, source_rm, mask2);
                self.movp(dest, Operand::Var(element_r));
            } else {
                let t = self.make_reg(ty, None);
                self.movp(t, source_rm);
                self.shufps(element_r, Operand::Var(t), mask1);
                self.shufps(t, Operand::Var(element_r), mask2);
                self.movp(dest, Operand::Var(t));
            }
        } else {
            debug_assert!(ty == Type::V16I8 || ty == Type::V16I1);
            // Spill the vector, insert in memory, reload.
            let slot = self.cfg.make_variable(ty);
            self.cfg.var_mut(slot).set_must_not_have_reg();
            let src_r = self.legalize_to_reg(source_vect, None);
            self.movp(slot, Operand::Var(src_r));
            let offset = index * in_vector_element_ty.width_in_bytes();
            let loc = self.memory_operand_for_stack_slot(slot, offset);
            let elem_r = self.legalize_to_reg(element, None);
            self.store(Operand::Var(elem_r), loc);
            let t = self.make_reg(ty, None);
            self.movp(t, Operand::Var(slot));
            self.movp(dest, Operand::Var(t));
        }
    }
}

/// Scalarize a vector arithmetic operation: element-wise extract, scalar
/// op, insert. Runs in the helper-call pre-pass, producing high-level
/// instructions that are themselves subject to helper rewriting.
pub(crate) fn scalarize_arithmetic(
    cfg: &mut glacier_ir::Cfg,
    op: ArithOp,
    dest: VarId,
    src0: Operand,
    src1: Operand,
) -> Vec<InstId> {
    let ty = cfg.var(dest).ty;
    debug_assert!(ty.is_vector());
    let element_ty = ty.element_type();
    let num_elements = ty.num_elements();
    let mut out = Vec::new();

    let mut acc: Operand = Operand::Const(cfg.ctx().const_undef(ty));
    for i in 0..num_elements {
        let index = Operand::Const(cfg.ctx().const_int32(i as i32));

        let op0 = cfg.make_variable(element_ty);
        out.push(cfg.add_inst(Inst::new(
            InstKind::ExtractElement,
            Some(op0),
            smallvec![src0, index],
        )));
        let op1 = cfg.make_variable(element_ty);
        out.push(cfg.add_inst(Inst::new(
            InstKind::ExtractElement,
            Some(op1),
            smallvec![src1, index],
        )));

        let res = cfg.make_variable(element_ty);
        out.push(cfg.add_inst(Inst::new(
            InstKind::Arithmetic(op),
            Some(res),
            smallvec![Operand::Var(op0), Operand::Var(op1)],
        )));

        let dest_t = cfg.make_variable(ty);
        out.push(cfg.add_inst(Inst::new(
            InstKind::InsertElement,
            Some(dest_t),
            smallvec![acc, Operand::Var(res), index],
        )));
        acc = Operand::Var(dest_t);
    }
    out.push(cfg.add_inst(Inst::new(InstKind::Assign, Some(dest), smallvec![acc])));
    out
}
