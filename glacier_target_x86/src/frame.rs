//! Stack frame construction: alloca layout, spill slots, argument
//! offsets, prologue and epilogue.
//!
//! Frame shape, low to high addresses:
//!
//! ```text
//!   [esp]                outgoing argument area
//!   [+out_args]          fixed alloca area
//!   [+allocas]           spill slots
//!   [+spills, aligned]   callee-saved pushes, saved ebp, return address
//!   [above]              incoming arguments
//! ```
//!
//! Without dynamic allocas the frame is esp-relative; a frame pointer is
//! established when allocas resize the stack at runtime.

use smallvec::smallvec;

use glacier_ir::constants::Constant;
use glacier_ir::inst::{Inst, InstKind, MachineOp};
use glacier_ir::operand::{MemOperand, Operand};
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, VarId};

use crate::lower::TargetX86;
use crate::regs::X86_STACK_ALIGNMENT_BYTES;

use glacier_regalloc::RegAllocEnv;

impl TargetX86<'_> {
    /// Lay out fixed-size allocas. With `sort_and_combine`, constant
    /// allocas are sorted by alignment, packed into one area, and their
    /// destinations become rematerializable with known offsets; the
    /// stack adjustment folds into the prologue.
    pub fn process_allocas(&mut self, sort_and_combine: bool) {
        if !sort_and_combine {
            return;
        }
        let entry = self.cfg.entry;
        let ids = self.cfg.node(entry).insts.clone();
        let mut fixed: Vec<(InstId, VarId, u32, u32)> = Vec::new();
        for iid in ids {
            let inst = self.cfg.inst(iid);
            if inst.is_deleted() {
                continue;
            }
            let InstKind::Alloca { align, .. } = inst.kind else {
                continue;
            };
            let dest = inst.dest.expect("alloca without dest");
            let Some(c) = inst.srcs[0].as_const() else {
                continue;
            };
            let Constant::Int32(size) = self.cfg.ctx().const_info(c) else {
                continue;
            };
            let align = align.max(1);
            if align > X86_STACK_ALIGNMENT_BYTES {
                // Over-aligned allocas keep the dynamic path.
                continue;
            }
            fixed.push((iid, dest, size as u32, align));
        }
        // Largest alignment first eliminates padding.
        fixed.sort_by_key(|&(_, _, _, align)| std::cmp::Reverse(align));
        let mut offset = 0u32;
        let stack_reg = self.env.stack_reg();
        for (iid, dest, size, align) in fixed {
            offset = offset.next_multiple_of(align);
            self.cfg
                .var_mut(dest)
                .set_rematerializable(stack_reg, offset as i32);
            if let InstKind::Alloca {
                known_frame_offset, ..
            } = &mut self.cfg.inst_mut(iid).kind
            {
                *known_frame_offset = true;
            }
            offset += size;
        }
    }

    /// Registers that must be preserved for the caller and are used by
    /// this function.
    fn used_callee_saved(&self) -> Vec<glacier_ir::RegNum> {
        let scratch = self.env.scratch_regs();
        let allocatable = self.env.allocatable();
        let mut used = Vec::new();
        for var in self.cfg.variables() {
            let Some(r) = var.reg_num() else {
                continue;
            };
            if var.is_implicit_arg {
                continue;
            }
            // Normalize to the widest alias so sub-register uses save the
            // full register once.
            let family = self.env.aliases(r);
            let Some(canonical) = family.iter().next() else {
                continue;
            };
            if scratch.contains(canonical) || !allocatable.contains(canonical) {
                continue;
            }
            if !used.contains(&canonical) {
                used.push(canonical);
            }
        }
        used.sort();
        used
    }

    /// Assign stack offsets and emit the prologue and epilogues.
    pub fn add_prolog_epilog(&mut self) {
        let word = self.word_type();
        let word_bytes = word.width_in_bytes();

        // Which variables need memory homes.
        let mut referenced = vec![false; self.cfg.num_variables()];
        for nid in self.cfg.node_ids() {
            for &iid in self.cfg.node(nid).insts.iter() {
                let inst = self.cfg.inst(iid);
                if inst.is_deleted() {
                    continue;
                }
                for v in inst.vars_read() {
                    referenced[v.index()] = true;
                }
                if let Some(d) = inst.dest {
                    referenced[d.index()] = true;
                }
            }
        }
        let arg_homes: Vec<VarId> = self
            .cfg
            .args
            .iter()
            .flat_map(|&a| {
                let mut vs = vec![a];
                if let Some(pair) = self.cfg.var(a).pair {
                    vs.push(pair.lo);
                    vs.push(pair.hi);
                }
                vs
            })
            .collect();

        let mut spill_vars: Vec<VarId> = Vec::new();
        for i in 0..self.cfg.num_variables() {
            let id = VarId(i as u32);
            let var = self.cfg.var(id);
            if !referenced[i]
                || var.has_reg()
                || var.is_rematerializable()
                || var.ignore_liveness()
                || arg_homes.contains(&id)
            {
                continue;
            }
            debug_assert!(
                !var.must_have_reg(),
                "infinite-weight variable {} has no register at frame time",
                id
            );
            spill_vars.push(id);
        }

        // Spill slot assignment, above the alloca area.
        let out_args = self.max_out_args_bytes;
        let alloca_area = self.fixed_alloca_bytes.next_multiple_of(word_bytes);
        let mut spill_bytes = 0u32;
        let spill_base = out_args + alloca_area;
        for &v in &spill_vars {
            let ty = self.cfg.var(v).ty;
            let width = ty.width_in_bytes().max(word_bytes);
            spill_bytes = spill_bytes.next_multiple_of(ty.align_in_bytes().max(word_bytes));
            let off = (spill_base + spill_bytes) as i32;
            self.cfg.var_mut(v).set_stack_offset(off);
            spill_bytes += width;
        }
        let total_frame =
            (out_args + alloca_area + spill_bytes).next_multiple_of(X86_STACK_ALIGNMENT_BYTES);

        let callee_saved = self.used_callee_saved();
        let pushes = callee_saved.len() as u32;

        // Prologue.
        let frame_reg = self.env.frame_reg();
        let stack_reg = self.env.stack_reg();
        let ebp = self.get_physical_register(frame_reg, word);
        let esp = self.get_physical_register(stack_reg, word);
        let mut prologue: Vec<InstId> = Vec::new();
        if self.has_frame_pointer {
            prologue.push(self.cfg.add_inst(Inst::new(
                InstKind::Machine(MachineOp::Push),
                None,
                smallvec![Operand::Var(ebp)],
            )));
            prologue.push(self.cfg.add_inst(Inst::new(
                InstKind::Machine(MachineOp::Mov),
                Some(ebp),
                smallvec![Operand::Var(esp)],
            )));
        }
        let mut saved_regs: Vec<VarId> = Vec::new();
        for &r in &callee_saved {
            let reg_var = self.get_physical_register(r, word);
            saved_regs.push(reg_var);
            prologue.push(self.cfg.add_inst(Inst::new(
                InstKind::Machine(MachineOp::Push),
                None,
                smallvec![Operand::Var(reg_var)],
            )));
        }
        if total_frame > 0 {
            let amt = Operand::Const(self.cfg.ctx().const_int32(total_frame as i32));
            prologue.push(self.cfg.add_inst(Inst::new(
                InstKind::Machine(MachineOp::Sub),
                Some(esp),
                smallvec![Operand::Var(esp), amt],
            )));
        }

        // Incoming argument offsets, above the return address and saves.
        let fills = self.finish_argument_lowering(total_frame, pushes);
        prologue.extend(fills);

        let entry = self.cfg.entry;
        let node = self.cfg.node_mut(entry);
        let old = std::mem::take(&mut node.insts);
        node.insts = prologue;
        node.insts.extend(old);

        // Epilogues before every return.
        for nid in self.cfg.node_ids() {
            let ids = self.cfg.node(nid).insts.clone();
            let Some(ret_pos) = ids.iter().position(|&i| {
                !self.cfg.inst(i).is_deleted()
                    && matches!(self.cfg.inst(i).kind, InstKind::Machine(MachineOp::Ret))
            }) else {
                continue;
            };
            let mut epilogue: Vec<InstId> = Vec::new();
            if self.has_frame_pointer {
                // esp may have moved; recover it from the frame pointer.
                let below = -((pushes * word_bytes) as i32);
                let off = self.cfg.ctx().const_int32(below);
                let mem = MemOperand::new(Some(ebp), Some(off));
                epilogue.push(self.cfg.add_inst(Inst::new(
                    InstKind::Machine(MachineOp::Lea),
                    Some(esp),
                    smallvec![Operand::Mem(mem)],
                )));
            } else if total_frame > 0 {
                let amt = Operand::Const(self.cfg.ctx().const_int32(total_frame as i32));
                epilogue.push(self.cfg.add_inst(Inst::new(
                    InstKind::Machine(MachineOp::Add),
                    Some(esp),
                    smallvec![Operand::Var(esp), amt],
                )));
            }
            for &reg_var in saved_regs.iter().rev() {
                epilogue.push(self.cfg.add_inst(Inst::new(
                    InstKind::Machine(MachineOp::Pop),
                    Some(reg_var),
                    smallvec![],
                )));
            }
            if self.has_frame_pointer {
                epilogue.push(self.cfg.add_inst(Inst::new(
                    InstKind::Machine(MachineOp::Pop),
                    Some(ebp),
                    smallvec![],
                )));
            }
            let node = self.cfg.node_mut(nid);
            node.insts.splice(ret_pos..ret_pos, epilogue);
        }

        log::debug!(
            "{}: frame {} bytes ({} out-args, {} allocas, {} spills), {} callee-saved",
            self.cfg.name,
            total_frame,
            out_args,
            alloca_area,
            spill_bytes,
            pushes
        );
    }

    /// Set incoming argument offsets and generate fills for arguments
    /// that were assigned registers. For an i64 split pair the lo half
    /// sits below the hi half.
    fn finish_argument_lowering(&mut self, total_frame: u32, pushes: u32) -> Vec<InstId> {
        let word = self.word_type();
        let word_bytes = word.width_in_bytes();
        // Distance from the final esp to the first incoming argument:
        // the frame, the saved registers, the saved frame pointer, and
        // the return address.
        let fp_slot = if self.has_frame_pointer { word_bytes } else { 0 };
        let base = total_frame + pushes * word_bytes + fp_slot + word_bytes;
        let frame_reg = if self.has_frame_pointer {
            self.env.frame_reg()
        } else {
            self.env.stack_reg()
        };
        let base_var = self.get_physical_register(frame_reg, word);

        let mut fills: Vec<InstId> = Vec::new();
        let mut in_args_bytes = 0u32;
        let args = self.cfg.args.clone();
        for arg in args {
            if self.reg_args.contains(&arg) {
                // Homed in a register by the argument lowering pass.
                continue;
            }
            let ty = self.cfg.var(arg).ty;
            if ty.is_vector() {
                in_args_bytes = in_args_bytes.next_multiple_of(X86_STACK_ALIGNMENT_BYTES);
            }
            let parts: Vec<(VarId, u32)> = match self.cfg.var(arg).pair {
                Some(pair) if !self.config.is_64bit() => {
                    vec![(pair.lo, 0), (pair.hi, 4), (arg, 0)]
                }
                _ => vec![(arg, 0)],
            };
            for &(part, delta) in &parts {
                let offset = base + in_args_bytes + delta;
                let ebp_relative = if self.has_frame_pointer {
                    // ebp sits above the pushes, below the return addr.
                    (in_args_bytes + delta + 2 * word_bytes) as i32
                } else {
                    offset as i32
                };
                self.cfg.var_mut(part).set_stack_offset(ebp_relative);
                if self.cfg.var(part).has_reg() && part != arg {
                    fills.push(self.fill_from_slot(part, base_var, ebp_relative));
                } else if self.cfg.var(part).has_reg() && self.cfg.var(part).pair.is_none() {
                    fills.push(self.fill_from_slot(part, base_var, ebp_relative));
                }
            }
            in_args_bytes += ty.width_in_bytes().max(word_bytes);
        }
        fills
    }

    fn fill_from_slot(
        &mut self,
        var: VarId,
        base: VarId,
        offset: i32,
    ) -> InstId {
        let ty = self.cfg.var(var).ty;
        let off = self.cfg.ctx().const_int32(offset);
        let mem = MemOperand::new(Some(base), Some(off));
        let op = if ty.is_vector() {
            MachineOp::Movp
        } else if ty == Type::F64 {
            MachineOp::Movq
        } else {
            MachineOp::Mov
        };
        self.cfg.ctx().stats().update_fills();
        self.cfg.add_inst(Inst::new(
            InstKind::Machine(op),
            Some(var),
            smallvec![Operand::Mem(mem)],
        ))
    }
}
