//! Call, return, and argument lowering.
//!
//! x86-32 passes every argument on the stack in declaration order in a
//! fixed outgoing-argument area at the bottom of the frame; x86-64 uses
//! the GPR/XMM pools first. Returns use eax (plus edx for the i64 pair)
//! or xmm0.

use smallvec::{smallvec, SmallVec};

use glacier_ir::inst::{Inst, InstKind, MachineOp};
use glacier_ir::operand::{MemOperand, Operand};
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, VarId};

use crate::regs::{self, TargetArch, X86_MAX_GPR_ARGS, X86_MAX_XMM_ARGS, X86_STACK_ALIGNMENT_BYTES};

use super::{Legal, TargetX86};

fn apply_stack_alignment(bytes: u32) -> u32 {
    bytes.next_multiple_of(X86_STACK_ALIGNMENT_BYTES)
}

/// Bytes a type occupies in a stack argument slot (at least a word).
fn width_on_stack(arch: TargetArch, ty: Type) -> u32 {
    ty.width_in_bytes().max(arch.word_type().width_in_bytes())
}

impl TargetX86<'_> {
    pub(crate) fn update_max_out_args(&mut self, bytes: u32) {
        let aligned = apply_stack_alignment(bytes);
        self.max_out_args_bytes = self.max_out_args_bytes.max(aligned);
    }

    /// Outgoing stack bytes needed by a call with these argument types
    /// and return type.
    pub(crate) fn call_stack_bytes(&self, arg_types: &[Type], ret: Type) -> u32 {
        let mut bytes = 0u32;
        let mut gpr_count = 0usize;
        let mut xmm_count = 0usize;
        for &ty in arg_types {
            if self.config.is_64bit() {
                if ty.is_vector() && xmm_count < X86_MAX_XMM_ARGS {
                    xmm_count += 1;
                    continue;
                }
                if ty.is_scalar_integer() && gpr_count < X86_MAX_GPR_ARGS {
                    gpr_count += 1;
                    continue;
                }
            }
            if ty.is_vector() {
                bytes = apply_stack_alignment(bytes);
            }
            bytes += width_on_stack(self.config.arch, ty);
        }
        if !self.config.is_64bit() && ret.is_scalar_float() {
            // Room for staging the x87-returned value through memory.
            bytes = bytes.max(width_on_stack(self.config.arch, ret));
        }
        bytes
    }

    pub(crate) fn lower_call(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest;
        let callee = self.cfg.inst(iid).srcs[0];
        let args: Vec<Operand> = self.cfg.inst(iid).srcs[1..].to_vec();
        self.lower_call_inner(dest, callee, &args);
    }

    /// Build and lower a call to a named runtime helper.
    pub(crate) fn lower_helper_call(
        &mut self,
        name: &str,
        dest: Option<VarId>,
        args: &[Operand],
    ) {
        let callee = Operand::Const(self.cfg.ctx().const_sym(0, name, false));
        self.lower_call_inner(dest, callee, args);
    }

    fn lower_call_inner(&mut self, dest: Option<VarId>, callee: Operand, args: &[Operand]) {
        let word = self.word_type();
        let arg_types: Vec<Type> = args.iter().map(|&a| self.operand_type(a)).collect();
        let ret_ty = dest.map(|d| self.cfg.var(d).ty).unwrap_or(Type::Void);
        let stack_bytes = self.call_stack_bytes(&arg_types, ret_ty);
        self.update_max_out_args(stack_bytes);

        // Register and stack argument placement.
        let mut call_extra_srcs: SmallVec<[Operand; 4]> = smallvec![];
        let mut stack_offset = 0u32;
        let mut gpr_count = 0usize;
        let mut xmm_count = 0usize;
        let esp = self.get_physical_register(self.env.stack_reg(), word);
        for (&arg, &ty) in args.iter().zip(arg_types.iter()) {
            if self.config.is_64bit() {
                if ty.is_vector() && xmm_count < X86_MAX_XMM_ARGS {
                    let reg = regs::x8664::xmm(xmm_count as u8);
                    let t = self.make_reg(ty, Some(reg));
                    let arg_rm = self.legalize(arg, Legal::REG | Legal::MEM, None);
                    self.movp(t, arg_rm);
                    call_extra_srcs.push(Operand::Var(t));
                    xmm_count += 1;
                    continue;
                }
                if ty.is_scalar_integer() && gpr_count < X86_MAX_GPR_ARGS {
                    let reg = regs::X8664_GPR_ARGS[gpr_count];
                    let t = self.make_reg(ty, Some(reg));
                    let arg_legal = self.legalize(arg, Legal::ALL, None);
                    self.mov(t, arg_legal);
                    call_extra_srcs.push(Operand::Var(t));
                    gpr_count += 1;
                    continue;
                }
            }
            if ty.is_vector() {
                stack_offset = apply_stack_alignment(stack_offset);
            }
            let slot_offset = self.cfg.ctx().const_int32(stack_offset as i32);
            let mem = MemOperand::new(Some(esp), Some(slot_offset));
            if !self.config.is_64bit() && ty == Type::I64 {
                let arg = self.legalize_undef(arg, None);
                let lo = self.lo_operand(arg);
                let hi = self.hi_operand(arg);
                let lo = self.legalize(lo, Legal::REG | Legal::IMM, None);
                let hi = self.legalize(hi, Legal::REG | Legal::IMM, None);
                let mem_op = Operand::Mem(mem);
                let mem_lo = self.lo_operand(mem_op).as_mem().unwrap();
                let mem_hi = self.hi_operand(mem_op).as_mem().unwrap();
                self.store(lo, mem_lo);
                self.store(hi, mem_hi);
            } else if ty.is_vector() {
                let r = self.legalize_to_reg(arg, None);
                self.storep(r, mem);
            } else if ty == Type::F64 {
                let r = self.legalize_to_reg(arg, None);
                self.storeq(r, mem);
            } else {
                let v = self.legalize(arg, Legal::REG | Legal::IMM, None);
                self.store(v, mem);
            }
            stack_offset += width_on_stack(self.config.arch, ty);
        }

        // The return register(s).
        let mut return_reg: Option<VarId> = None;
        let mut return_reg_hi: Option<VarId> = None;
        if let Some(d) = dest {
            let ty = self.cfg.var(d).ty;
            match ty {
                Type::I64 if !self.config.is_64bit() => {
                    let eax = self.reg_eax(Type::I32);
                    let edx = self.reg_edx(Type::I32);
                    return_reg = Some(self.make_reg(Type::I32, Some(eax)));
                    return_reg_hi = Some(self.make_reg(Type::I32, Some(edx)));
                }
                _ if ty.is_scalar_integer() => {
                    return_reg = Some(self.make_reg(ty, Some(self.reg_eax(ty))));
                }
                _ => {
                    // FP and vector returns land in xmm0.
                    return_reg = Some(self.make_reg(ty, Some(self.reg_xmm0())));
                }
            }
        }

        // The call itself. Indirect targets need a register.
        let target = match callee {
            Operand::Const(_) => callee,
            _ => Operand::Var(self.legalize_to_reg(callee, None)),
        };
        let mut srcs: SmallVec<[Operand; 4]> = smallvec![target];
        srcs.extend(call_extra_srcs);
        self.m(MachineOp::Call, return_reg, srcs);
        if let (Some(lo), Some(hi)) = (return_reg, return_reg_hi) {
            // The pair return defines edx alongside eax.
            self.fake_def(hi, Some(lo));
        }

        // Copy the return value out.
        if let Some(d) = dest {
            let ty = self.cfg.var(d).ty;
            if !self.config.is_64bit() && ty == Type::I64 {
                let (dest_lo, dest_hi) = self.dest_parts(d);
                self.mov(dest_lo, Operand::Var(return_reg.unwrap()));
                self.mov(dest_hi, Operand::Var(return_reg_hi.unwrap()));
            } else if ty.is_vector() {
                self.movp(d, Operand::Var(return_reg.unwrap()));
            } else {
                self.mov(d, Operand::Var(return_reg.unwrap()));
            }
        }
    }

    pub(crate) fn lower_ret(&mut self, iid: InstId) {
        let mut ret_srcs: SmallVec<[Operand; 4]> = smallvec![];
        if !self.cfg.inst(iid).srcs.is_empty() {
            let value = self.cfg.inst(iid).srcs[0];
            let ty = self.operand_type(value);
            if !self.config.is_64bit() && ty == Type::I64 {
                let value = self.legalize_undef(value, None);
                let lo = self.lo_operand(value);
                let hi = self.hi_operand(value);
                let eax = self.make_reg(Type::I32, Some(self.reg_eax(Type::I32)));
                let edx = self.make_reg(Type::I32, Some(self.reg_edx(Type::I32)));
                let lo = self.legalize(lo, Legal::ALL, None);
                let hi = self.legalize(hi, Legal::ALL, None);
                self.mov(eax, lo);
                self.mov(edx, hi);
                ret_srcs.push(Operand::Var(eax));
                ret_srcs.push(Operand::Var(edx));
            } else if ty.is_scalar_integer() {
                let r = self.make_reg(ty, Some(self.reg_eax(ty)));
                let v = self.legalize(value, Legal::ALL, None);
                self.mov(r, v);
                ret_srcs.push(Operand::Var(r));
            } else {
                let r = self.make_reg(ty, Some(self.reg_xmm0()));
                let v = self.legalize(value, Legal::REG | Legal::MEM, None);
                if ty.is_vector() {
                    self.movp(r, v);
                } else {
                    self.mov(r, v);
                }
                ret_srcs.push(Operand::Var(r));
            }
        }
        self.m(MachineOp::Ret, None, ret_srcs);
    }

    /// Home register-passed arguments (x86-64) into their variables at
    /// function entry. On x86-32 every argument lives on the stack and
    /// nothing is needed until frame layout.
    pub fn lower_arguments(&mut self) {
        if !self.config.is_64bit() {
            return;
        }
        let mut movs: Vec<InstId> = Vec::new();
        let mut gpr_count = 0usize;
        let mut xmm_count = 0usize;
        for i in 0..self.cfg.args.len() {
            let arg = self.cfg.args[i];
            let ty = self.cfg.var(arg).ty;
            let (reg, packed) = if ty.is_vector() && xmm_count < X86_MAX_XMM_ARGS {
                let r = regs::x8664::xmm(xmm_count as u8);
                xmm_count += 1;
                (r, true)
            } else if ty.is_scalar_integer() && gpr_count < X86_MAX_GPR_ARGS {
                let r = regs::X8664_GPR_ARGS[gpr_count];
                gpr_count += 1;
                (r, false)
            } else {
                continue;
            };
            let t = self.cfg.make_variable(ty);
            self.cfg.var_mut(t).set_reg_num(reg);
            self.cfg.add_implicit_arg(t);
            let op = if packed {
                MachineOp::Movp
            } else {
                MachineOp::Mov
            };
            let mov = Inst::new(
                InstKind::Machine(op),
                Some(arg),
                smallvec![Operand::Var(t)],
            );
            movs.push(self.cfg.add_inst(mov));
            self.reg_args.push(arg);
        }
        let entry = self.cfg.entry;
        let node = self.cfg.node_mut(entry);
        let old = std::mem::take(&mut node.insts);
        node.insts = movs;
        node.insts.extend(old);
    }
}
