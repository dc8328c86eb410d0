//! Intrinsic lowering: atomics, bit counting, memory intrinsics, and the
//! small float/stack/trap family.

use smallvec::smallvec;

use glacier_ir::cond::BrCond;
use glacier_ir::constants::Constant;
use glacier_ir::inst::{
    memory_order, AtomicRmwOp, CastOp, ICond, Inst, InstKind, Intrinsic, MachineOp,
};
use glacier_ir::operand::{MemOperand, Operand};
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, VarId};
use glacier_ir::CfgError;

use crate::helpers;

use super::{Legal, OptLevel, TargetX86};

impl TargetX86<'_> {
    fn constant_memory_order(&self, op: Operand) -> i32 {
        match op.as_const().map(|c| self.cfg.ctx().const_info(c)) {
            Some(Constant::Int32(v)) => v,
            _ => memory_order::INVALID,
        }
    }

    pub(crate) fn lower_intrinsic(&mut self, iid: InstId, id: Intrinsic) {
        match id {
            Intrinsic::AtomicCmpxchg => {
                let success = self.constant_memory_order(self.cfg.inst(iid).srcs[3]);
                let failure = self.constant_memory_order(self.cfg.inst(iid).srcs[4]);
                if !memory_order::is_valid_pair(success, failure) {
                    self.cfg.set_error(CfgError::Configuration(
                        "unexpected memory ordering for AtomicCmpxchg".to_string(),
                    ));
                    return;
                }
                let dest = self.cfg.inst(iid).dest.expect("cmpxchg without dest");
                let ptr = {
                    let p = self.cfg.inst(iid).srcs[0];
                    self.legalize(p, Legal::ALL, None)
                };
                let expected = {
                    let e = self.cfg.inst(iid).srcs[1];
                    self.legalize(e, Legal::ALL, None)
                };
                let desired = {
                    let d = self.cfg.inst(iid).srcs[2];
                    self.legalize(d, Legal::ALL, None)
                };
                if self.try_optimized_cmpxchg_cmp_br(dest, ptr, expected, desired) {
                    return;
                }
                self.lower_atomic_cmpxchg(dest, ptr, expected, desired);
            }
            Intrinsic::AtomicFence => {
                let order = self.constant_memory_order(self.cfg.inst(iid).srcs[0]);
                if !memory_order::is_valid(order) {
                    self.cfg.set_error(CfgError::Configuration(
                        "unexpected memory ordering for AtomicFence".to_string(),
                    ));
                    return;
                }
                self.m(MachineOp::Mfence, None, smallvec![]);
            }
            Intrinsic::AtomicFenceAll => {
                self.m(MachineOp::Mfence, None, smallvec![]);
            }
            Intrinsic::AtomicIsLockFree => self.lower_atomic_is_lock_free(iid),
            Intrinsic::AtomicLoad => self.lower_atomic_load(iid),
            Intrinsic::AtomicRmw => self.lower_atomic_rmw_intrin(iid),
            Intrinsic::AtomicStore => self.lower_atomic_store(iid),
            Intrinsic::Bswap => self.lower_bswap(iid),
            Intrinsic::Ctpop => self.lower_ctpop(iid),
            Intrinsic::Ctlz => {
                let val = {
                    let v = self.cfg.inst(iid).srcs[0];
                    self.legalize(v, Legal::ALL, None)
                };
                let dest = self.cfg.inst(iid).dest.expect("ctlz without dest");
                let ty = self.operand_type(val);
                let (first, second) = if !self.config.is_64bit() && ty == Type::I64 {
                    (self.lo_operand(val), Some(self.hi_operand(val)))
                } else {
                    (val, None)
                };
                self.lower_count_zeros(false, ty, dest, first, second);
            }
            Intrinsic::Cttz => {
                let val = {
                    let v = self.cfg.inst(iid).srcs[0];
                    self.legalize(v, Legal::ALL, None)
                };
                let dest = self.cfg.inst(iid).dest.expect("cttz without dest");
                let ty = self.operand_type(val);
                let (first, second) = if !self.config.is_64bit() && ty == Type::I64 {
                    (self.hi_operand(val), Some(self.lo_operand(val)))
                } else {
                    (val, None)
                };
                self.lower_count_zeros(true, ty, dest, first, second);
            }
            Intrinsic::Fabs => self.lower_fabs(iid),
            Intrinsic::Longjmp => {
                let a0 = self.cfg.inst(iid).srcs[0];
                let a1 = self.cfg.inst(iid).srcs[1];
                self.lower_helper_call(helpers::H_LONGJMP, None, &[a0, a1]);
            }
            Intrinsic::Memcpy => self.lower_memcpy(iid),
            Intrinsic::Memmove => self.lower_memmove(iid),
            Intrinsic::Memset => self.lower_memset(iid),
            Intrinsic::ReadTp => {
                let dest = self.cfg.inst(iid).dest;
                self.lower_helper_call(helpers::H_READ_TP, dest, &[]);
            }
            Intrinsic::Setjmp => {
                let dest = self.cfg.inst(iid).dest;
                let a0 = self.cfg.inst(iid).srcs[0];
                self.lower_helper_call(helpers::H_SETJMP, dest, &[a0]);
            }
            Intrinsic::Sqrt => {
                let src = {
                    let s = self.cfg.inst(iid).srcs[0];
                    self.legalize(s, Legal::ALL, None)
                };
                let dest = self.cfg.inst(iid).dest.expect("sqrt without dest");
                let ty = self.cfg.var(dest).ty;
                let t = self.make_reg(ty, None);
                self.m(MachineOp::Sqrtss, Some(t), smallvec![src]);
                self.mov(dest, Operand::Var(t));
            }
            Intrinsic::Stacksave => {
                let word = self.word_type();
                let esp = self.get_physical_register(self.env.stack_reg(), word);
                let dest = self.cfg.inst(iid).dest.expect("stacksave without dest");
                self.mov(dest, Operand::Var(esp));
            }
            Intrinsic::Stackrestore => {
                let word = self.word_type();
                let esp = self.get_physical_register(self.env.stack_reg(), word);
                let a0 = {
                    let a = self.cfg.inst(iid).srcs[0];
                    self.legalize(a, Legal::ALL, None)
                };
                self.mov_redefined(esp, a0);
            }
            Intrinsic::Trap => {
                self.m(MachineOp::Ud2, None, smallvec![]);
            }
        }
    }

    // --- Atomics ---

    fn lower_atomic_cmpxchg(
        &mut self,
        dest_prev: VarId,
        ptr: Operand,
        expected: Operand,
        desired: Operand,
    ) {
        let ty = self.operand_type(expected);
        if !self.config.is_64bit() && ty == Type::I64 {
            // Reserve the pinned registers before formMemoryOperand can
            // add more infinite-weight temporaries.
            let t_edx = self.make_reg(Type::I32, Some(self.reg_edx(Type::I32)));
            let t_eax = self.make_reg(Type::I32, Some(self.reg_eax(Type::I32)));
            let t_ecx = self.make_reg(Type::I32, Some(self.reg_ecx()));
            let t_ebx = self.make_reg(Type::I32, Some(self.reg_ebx()));
            let exp_lo = self.lo_operand(expected);
            let exp_hi = self.hi_operand(expected);
            let des_lo = self.lo_operand(desired);
            let des_hi = self.hi_operand(desired);
            self.mov(t_eax, exp_lo);
            self.mov(t_edx, exp_hi);
            self.mov(t_ebx, des_lo);
            self.mov(t_ecx, des_hi);
            let addr = self.form_memory_operand(ptr, true);
            self.m(
                MachineOp::Cmpxchg8b { locked: true },
                None,
                smallvec![
                    Operand::Mem(addr),
                    Operand::Var(t_edx),
                    Operand::Var(t_eax),
                    Operand::Var(t_ecx),
                    Operand::Var(t_ebx)
                ],
            );
            self.fake_def(t_eax, None);
            self.fake_def(t_edx, None);
            let (dest_lo, dest_hi) = self.dest_parts(dest_prev);
            self.mov(dest_lo, Operand::Var(t_eax));
            self.mov(dest_hi, Operand::Var(t_edx));
            return;
        }
        let eax = self.reg_eax(ty);
        let t_eax = self.make_reg(ty, Some(eax));
        self.mov(t_eax, expected);
        let addr = self.form_memory_operand(ptr, true);
        let desired_reg = self.legalize_to_reg(desired, None);
        self.m(
            MachineOp::Cmpxchg { locked: true },
            None,
            smallvec![
                Operand::Mem(addr),
                Operand::Var(t_eax),
                Operand::Var(desired_reg)
            ],
        );
        self.fake_def(t_eax, None);
        self.mov(dest_prev, Operand::Var(t_eax));
    }

    /// Recognize `cmpxchg; icmp eq x, expected; br` (possibly with
    /// intervening phi-store assignments) and fuse into a cmpxchg whose
    /// ZF feeds the branch directly.
    fn try_optimized_cmpxchg_cmp_br(
        &mut self,
        dest: VarId,
        ptr: Operand,
        expected: Operand,
        desired: Operand,
    ) -> bool {
        if self.config.opt_level == OptLevel::Om1 {
            return false;
        }
        // Peek past phi stores placed before a loop backedge.
        let mut skip = 0usize;
        let mut phi_assigns: Vec<InstId> = Vec::new();
        let next_cmp = loop {
            let Some(next) = self.ctx.peek(self.cfg, skip) else {
                return false;
            };
            match self.cfg.inst(next).kind {
                InstKind::Assign => {
                    if self.cfg.inst(next).dest == Some(dest) {
                        return false;
                    }
                    phi_assigns.push(next);
                    skip += 1;
                }
                _ => break next,
            }
        };
        let InstKind::Icmp(ICond::Eq) = self.cfg.inst(next_cmp).kind else {
            return false;
        };
        {
            let cmp = self.cfg.inst(next_cmp);
            let s0 = cmp.srcs[0];
            let s1 = cmp.srcs[1];
            let dest_op = Operand::Var(dest);
            if !((s0 == dest_op && s1 == expected) || (s1 == dest_op && s0 == expected)) {
                return false;
            }
        }
        let Some(next_br) = self.ctx.peek(self.cfg, skip + 1) else {
            return false;
        };
        let InstKind::Br {
            target_true,
            target_false: Some(target_false),
        } = self.cfg.inst(next_br).kind
        else {
            return false;
        };
        let cmp_dest = self.cfg.inst(next_cmp).dest.expect("icmp without dest");
        {
            let br = self.cfg.inst(next_br);
            if br.srcs[0] != Operand::Var(cmp_dest) || !br.is_last_use(cmp_dest) {
                return false;
            }
        }

        self.lower_atomic_cmpxchg(dest, ptr, expected, desired);
        // Lower the phi stores in place, keeping their position before
        // the branch.
        for assign in phi_assigns {
            self.cfg.inst_mut(assign).set_deleted();
            self.lower_inst_body_assign(assign);
        }
        self.br_node(Some(BrCond::E), target_true, Some(target_false));
        self.cfg.inst_mut(next_cmp).set_deleted();
        self.cfg.inst_mut(next_br).set_deleted();
        true
    }

    /// Re-lower an Assign that was consumed by a peephole.
    fn lower_inst_body_assign(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("assign without dest");
        let src = self.cfg.inst(iid).srcs[0];
        self.lower_assign_like(dest, src);
    }

    fn lower_atomic_rmw_intrin(&mut self, iid: InstId) {
        let order = self.constant_memory_order(self.cfg.inst(iid).srcs[3]);
        if !memory_order::is_valid(order) {
            self.cfg.set_error(CfgError::Configuration(
                "unexpected memory ordering for AtomicRMW".to_string(),
            ));
            return;
        }
        let op_raw = match self.cfg.inst(iid).srcs[0].as_const() {
            Some(c) => match self.cfg.ctx().const_info(c) {
                Constant::Int32(v) => v,
                _ => -1,
            },
            None => -1,
        };
        let Some(operation) = AtomicRmwOp::from_raw(op_raw) else {
            self.cfg.set_error(CfgError::Configuration(
                "unknown AtomicRMW operation".to_string(),
            ));
            return;
        };
        let dest = self.cfg.inst(iid).dest.expect("atomicrmw without dest");
        let ptr = self.cfg.inst(iid).srcs[1];
        let val = self.cfg.inst(iid).srcs[2];
        self.lower_atomic_rmw(dest, operation, ptr, val);
    }

    fn lower_atomic_rmw(&mut self, dest: VarId, operation: AtomicRmwOp, ptr: Operand, val: Operand) {
        let ty = self.cfg.var(dest).ty;
        let split64 = !self.config.is_64bit() && ty == Type::I64;
        let ops: (Option<MachineOp>, Option<MachineOp>) = match operation {
            AtomicRmwOp::Add => {
                if !split64 {
                    // Single xadd.
                    let addr = self.form_memory_operand(ptr, true);
                    let t = self.make_reg(ty, None);
                    let val = self.legalize(val, Legal::ALL, None);
                    self.mov(t, val);
                    self.m(
                        MachineOp::Xadd { locked: true },
                        None,
                        smallvec![Operand::Mem(addr), Operand::Var(t)],
                    );
                    self.fake_def(t, None);
                    self.mov(dest, Operand::Var(t));
                    return;
                }
                (Some(MachineOp::Add), Some(MachineOp::Adc))
            }
            AtomicRmwOp::Sub => {
                if !split64 {
                    // xadd of the negation.
                    let addr = self.form_memory_operand(ptr, true);
                    let t = self.make_reg(ty, None);
                    let val = self.legalize(val, Legal::ALL, None);
                    self.mov(t, val);
                    self.neg(t);
                    self.m(
                        MachineOp::Xadd { locked: true },
                        None,
                        smallvec![Operand::Mem(addr), Operand::Var(t)],
                    );
                    self.fake_def(t, None);
                    self.mov(dest, Operand::Var(t));
                    return;
                }
                (Some(MachineOp::Sub), Some(MachineOp::Sbb))
            }
            AtomicRmwOp::Or => (Some(MachineOp::Or), Some(MachineOp::Or)),
            AtomicRmwOp::And => (Some(MachineOp::And), Some(MachineOp::And)),
            AtomicRmwOp::Xor => (Some(MachineOp::Xor), Some(MachineOp::Xor)),
            AtomicRmwOp::Exchange => {
                if !split64 {
                    let addr = self.form_memory_operand(ptr, true);
                    let t = self.make_reg(ty, None);
                    let val = self.legalize(val, Legal::ALL, None);
                    self.mov(t, val);
                    self.m(
                        MachineOp::Xchg,
                        None,
                        smallvec![Operand::Mem(addr), Operand::Var(t)],
                    );
                    self.fake_def(t, None);
                    self.mov(dest, Operand::Var(t));
                    return;
                }
                // cmpxchg8b loop with the value simply moved into
                // ecx:ebx.
                (None, None)
            }
        };
        self.expand_atomic_rmw_as_cmpxchg(ops.0, ops.1, dest, ptr, val);
    }

    /// The generic cmpxchg retry loop for operations with no single-
    /// instruction atomic form.
    fn expand_atomic_rmw_as_cmpxchg(
        &mut self,
        op_lo: Option<MachineOp>,
        op_hi: Option<MachineOp>,
        dest: VarId,
        ptr: Operand,
        val: Operand,
    ) {
        let val = self.legalize(val, Legal::ALL, None);
        let ty = self.operand_type(val);
        if !self.config.is_64bit() && ty == Type::I64 {
            let t_edx = self.make_reg(Type::I32, Some(self.reg_edx(Type::I32)));
            let t_eax = self.make_reg(Type::I32, Some(self.reg_eax(Type::I32)));
            let addr = self.form_memory_operand(ptr, true);
            let addr_op = Operand::Mem(addr);
            let addr_lo = self.lo_operand(addr_op);
            let addr_hi = self.hi_operand(addr_op);
            self.mov(t_eax, addr_lo);
            self.mov(t_edx, addr_hi);
            let t_ecx = self.make_reg(Type::I32, Some(self.reg_ecx()));
            let t_ebx = self.make_reg(Type::I32, Some(self.reg_ebx()));
            let label = self.cfg.make_label();
            let is_xchg8b = op_lo.is_none() && op_hi.is_none();
            let val_lo = self.lo_operand(val);
            let val_hi = self.hi_operand(val);
            if !is_xchg8b {
                self.insert_label(label);
                self.mov(t_ebx, Operand::Var(t_eax));
                self.two_addr(op_lo.unwrap(), t_ebx, val_lo);
                self.mov(t_ecx, Operand::Var(t_edx));
                self.two_addr(op_hi.unwrap(), t_ecx, val_hi);
            } else {
                // Exchange needs no math; just park the value in
                // ecx:ebx before the loop.
                self.mov(t_ebx, val_lo);
                self.mov(t_ecx, val_hi);
                self.insert_label(label);
            }
            self.m(
                MachineOp::Cmpxchg8b { locked: true },
                None,
                smallvec![
                    Operand::Mem(addr),
                    Operand::Var(t_edx),
                    Operand::Var(t_eax),
                    Operand::Var(t_ecx),
                    Operand::Var(t_ebx)
                ],
            );
            self.fake_def(t_eax, None);
            self.fake_def(t_edx, None);
            self.br_label(BrCond::Ne, label);
            // Model the values re-read by the loop body.
            if !is_xchg8b {
                if let Some(v) = val.as_var() {
                    let pair = self.cfg.var(v).pair.expect("unsplit i64 value");
                    self.fake_use(pair.lo);
                    self.fake_use(pair.hi);
                }
            } else {
                self.fake_use(t_ebx);
                self.fake_use(t_ecx);
            }
            if let Some(base) = addr.base {
                self.fake_use(base);
            }
            let (dest_lo, dest_hi) = self.dest_parts(dest);
            self.mov(dest_lo, Operand::Var(t_eax));
            self.mov(dest_hi, Operand::Var(t_edx));
            return;
        }
        let addr = self.form_memory_operand(ptr, true);
        let eax = self.reg_eax(ty);
        let t_eax = self.make_reg(ty, Some(eax));
        self.mov(t_eax, Operand::Mem(addr));
        let label = self.cfg.make_label();
        self.insert_label(label);
        // T must be a different register than eax, so make a fresh one.
        let t = self.make_reg(ty, None);
        self.mov(t, Operand::Var(t_eax));
        self.two_addr(op_lo.expect("missing rmw op"), t, val);
        self.m(
            MachineOp::Cmpxchg { locked: true },
            None,
            smallvec![Operand::Mem(addr), Operand::Var(t_eax), Operand::Var(t)],
        );
        self.fake_def(t_eax, None);
        self.br_label(BrCond::Ne, label);
        if let Some(v) = val.as_var() {
            self.fake_use(v);
        }
        if let Some(base) = addr.base {
            self.fake_use(base);
        }
        self.mov(dest, Operand::Var(t_eax));
    }

    fn lower_atomic_load(&mut self, iid: InstId) {
        let order = self.constant_memory_order(self.cfg.inst(iid).srcs[1]);
        if !memory_order::is_valid(order) {
            self.cfg.set_error(CfgError::Configuration(
                "unexpected memory ordering for AtomicLoad".to_string(),
            ));
            return;
        }
        let dest = self.cfg.inst(iid).dest.expect("atomic load without dest");
        let ptr = self.cfg.inst(iid).srcs[0];
        if !self.config.is_64bit() && self.cfg.var(dest).ty == Type::I64 {
            // A naturally-aligned movq is atomic: load through an xmm
            // register and bitcast the bits out, then pin the halves
            // live so the load is not elided.
            let t = self.make_reg(Type::F64, None);
            let addr = self.form_memory_operand(ptr, true);
            self.movq(t, Operand::Mem(addr));
            let cast = Inst::new(
                InstKind::Cast(CastOp::Bitcast),
                Some(dest),
                smallvec![Operand::Var(t)],
            );
            let cast_id = self.cfg.add_inst(cast);
            self.lower_cast(cast_id, CastOp::Bitcast);
            self.cfg.inst_mut(cast_id).set_deleted();
            let pair = self.cfg.var(dest).pair.expect("unsplit i64 dest");
            self.fake_use(pair.lo);
            self.fake_use(pair.hi);
            return;
        }
        // Naturally-aligned plain loads are atomic; a fake use keeps the
        // load alive even if the destination goes unused.
        let load = Inst::new(InstKind::Load, Some(dest), smallvec![ptr]);
        let load_id = self.cfg.add_inst(load);
        self.lower_load(load_id);
        self.cfg.inst_mut(load_id).set_deleted();
        if let Some(last) = self.ctx.last_inserted() {
            if let Some(d) = self.cfg.inst(last).dest {
                self.fake_use(d);
            }
        }
    }

    fn lower_atomic_store(&mut self, iid: InstId) {
        let order = self.constant_memory_order(self.cfg.inst(iid).srcs[2]);
        if !memory_order::is_valid(order) {
            self.cfg.set_error(CfgError::Configuration(
                "unexpected memory ordering for AtomicStore".to_string(),
            ));
            return;
        }
        let value = self.cfg.inst(iid).srcs[0];
        let ptr = self.cfg.inst(iid).srcs[1];
        let ty = self.operand_type(value);
        if !self.config.is_64bit() && ty == Type::I64 {
            // Bitcast into an xmm register and storeq, which is atomic
            // when naturally aligned.
            let t = self.cfg.make_variable(Type::F64);
            self.cfg.var_mut(t).set_must_have_reg();
            let cast = Inst::new(
                InstKind::Cast(CastOp::Bitcast),
                Some(t),
                smallvec![value],
            );
            let cast_id = self.cfg.add_inst(cast);
            self.lower_cast(cast_id, CastOp::Bitcast);
            self.cfg.inst_mut(cast_id).set_deleted();
            let addr = self.form_memory_operand(ptr, true);
            self.storeq(t, addr);
            self.m(MachineOp::Mfence, None, smallvec![]);
            return;
        }
        let store = Inst::new(InstKind::Store, None, smallvec![value, ptr]);
        let store_id = self.cfg.add_inst(store);
        self.lower_store(store_id);
        self.cfg.inst_mut(store_id).set_deleted();
        self.m(MachineOp::Mfence, None, smallvec![]);
    }

    fn lower_atomic_is_lock_free(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("is-lock-free without dest");
        let byte_size = self.cfg.inst(iid).srcs[0];
        let Some(c) = byte_size.as_const() else {
            self.cfg.set_error(CfgError::Configuration(
                "AtomicIsLockFree byte size should be compile-time constant".to_string(),
            ));
            return;
        };
        let Constant::Int32(size) = self.cfg.ctx().const_info(c) else {
            self.cfg.set_error(CfgError::Configuration(
                "AtomicIsLockFree byte size should be compile-time constant".to_string(),
            ));
            return;
        };
        // x86 is lock-free for 1/2/4/8-byte accesses; 16-byte operations
        // would need cmpxchg16b, unavailable in 32-bit mode.
        let result = matches!(size, 1 | 2 | 4 | 8) as i32;
        let value = self.const_i32(result);
        self.mov(dest, value);
    }

    // --- Bit manipulation ---

    fn lower_bswap(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("bswap without dest");
        let val = self.cfg.inst(iid).srcs[0];
        let ty = self.operand_type(val);
        if !self.config.is_64bit() && ty == Type::I64 {
            // Swap bytes within each half, then swap the halves.
            let val = self.legalize_undef(val, None);
            let lo = self.lo_operand(val);
            let hi = self.hi_operand(val);
            let t_lo = self.legalize_to_reg(lo, None);
            let t_hi = self.legalize_to_reg(hi, None);
            self.m(
                MachineOp::Bswap,
                Some(t_lo),
                smallvec![Operand::Var(t_lo)],
            );
            self.m(
                MachineOp::Bswap,
                Some(t_hi),
                smallvec![Operand::Var(t_hi)],
            );
            let (dest_lo, dest_hi) = self.dest_parts(dest);
            self.mov(dest_lo, Operand::Var(t_hi));
            self.mov(dest_hi, Operand::Var(t_lo));
        } else if ty == Type::I32 || (self.config.is_64bit() && ty == Type::I64) {
            let t = self.legalize_to_reg(val, None);
            self.m(MachineOp::Bswap, Some(t), smallvec![Operand::Var(t)]);
            self.mov(dest, Operand::Var(t));
        } else {
            debug_assert_eq!(ty, Type::I16);
            // 16-bit bswap is a rotate by 8.
            let val = self.legalize(val, Legal::ALL, None);
            let eight = self.const_int(Type::I16, 8);
            let t = self.make_reg(ty, None);
            self.mov(t, val);
            self.rol(t, eight);
            self.mov(dest, Operand::Var(t));
        }
    }

    fn lower_ctpop(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("ctpop without dest");
        let mut val = self.cfg.inst(iid).srcs[0];
        let mut val_ty = self.operand_type(val);
        debug_assert!(val_ty == Type::I32 || val_ty == Type::I64);

        let t = if !self.config.is_64bit() {
            dest
        } else {
            if val_ty == Type::I32 {
                // The 32-bit helper does not exist on the 64-bit target;
                // zero-extend and use the 64-bit one.
                let v = self.make_reg(Type::I64, None);
                self.movzx(v, val);
                val = Operand::Var(v);
            }
            val_ty = Type::I64;
            self.make_reg(Type::I64, None)
        };

        let helper = if val_ty == Type::I32 {
            helpers::H_CTPOP_I32
        } else {
            helpers::H_CTPOP_I64
        };
        self.lower_helper_call(helper, Some(t), &[val]);

        // The helpers return 32 bits; clear the upper half of the
        // destination in case the caller's IR does not.
        if !self.config.is_64bit() {
            debug_assert_eq!(t, dest);
            if self.operand_type(val) == Type::I64 {
                let (_, dest_hi) = self.dest_parts(dest);
                let zero = self.const_i32(0);
                self.mov(dest_hi, zero);
            }
        } else {
            let t1 = self.make_reg(Type::I32, None);
            self.mov(t1, Operand::Var(t));
            let t2 = self.make_reg(Type::I64, None);
            self.movzx(t2, Operand::Var(t1));
            self.mov(dest, Operand::Var(t2));
        }
    }

    /// bsr/bsf with a cmov covering the all-zeros input. For ctlz the bit
    /// index is converted to a leading-zero count by xor 31.
    fn lower_count_zeros(
        &mut self,
        cttz: bool,
        ty: Type,
        dest: VarId,
        first_val: Operand,
        second_val: Option<Operand>,
    ) {
        debug_assert!(ty == Type::I32 || ty == Type::I64);
        let t = self.make_reg(Type::I32, None);
        let first_rm = self.legalize(first_val, Legal::REG | Legal::MEM, None);
        if cttz {
            self.m(MachineOp::Bsf, Some(t), smallvec![first_rm]);
        } else {
            self.m(MachineOp::Bsr, Some(t), smallvec![first_rm]);
        }
        let t_dest = self.make_reg(Type::I32, None);
        let thirty_two = self.const_i32(32);
        let thirty_one = self.const_i32(31);
        if cttz {
            self.mov(t_dest, thirty_two);
        } else {
            let sixty_three = self.const_i32(63);
            self.mov(t_dest, sixty_three);
        }
        self.cmov(t_dest, Operand::Var(t), BrCond::Ne);
        if !cttz {
            self.xor(t_dest, thirty_one);
        }
        if self.config.is_64bit() || ty == Type::I32 {
            self.mov(dest, Operand::Var(t_dest));
            return;
        }
        // 64-bit on the 32-bit target: speculate on the first half and
        // patch with the second.
        self.add(t_dest, thirty_two);
        let (dest_lo, dest_hi) = self.dest_parts(dest);
        let second = second_val.expect("missing second half");
        let second_var = self.legalize_to_reg(second, None);
        let t_dest2 = self.make_reg(Type::I32, None);
        if cttz {
            self.m(
                MachineOp::Bsf,
                Some(t_dest2),
                smallvec![Operand::Var(second_var)],
            );
        } else {
            self.m(
                MachineOp::Bsr,
                Some(t_dest2),
                smallvec![Operand::Var(second_var)],
            );
            self.xor(t_dest2, thirty_one);
        }
        self.test(Operand::Var(second_var), Operand::Var(second_var));
        self.cmov(t_dest2, Operand::Var(t_dest), BrCond::E);
        self.mov(dest_lo, Operand::Var(t_dest2));
        let zero = self.const_i32(0);
        self.mov(dest_hi, zero);
    }

    fn lower_fabs(&mut self, iid: InstId) {
        let src = {
            let s = self.cfg.inst(iid).srcs[0];
            self.legalize(s, Legal::ALL, None)
        };
        let dest = self.cfg.inst(iid).dest.expect("fabs without dest");
        let ty = self.operand_type(src);
        let mask = self.make_vector_of_fabs_mask(ty, None);
        // pand wants a register or m128; scalars must be registerized.
        let src = if ty.is_vector() {
            self.reg_if_mem(src)
        } else {
            Operand::Var(self.legalize_to_reg(src, None))
        };
        self.pand(mask, src);
        if ty.is_vector() {
            self.movp(dest, Operand::Var(mask));
        } else {
            self.mov(dest, Operand::Var(mask));
        }
    }

    // --- Memory intrinsics ---

    const BYTES_PER_STOREP: u32 = 16;
    const BYTES_PER_STOREQ: u32 = 8;
    const BYTES_PER_STOREI32: u32 = 4;
    pub(crate) const MEMCPY_UNROLL_LIMIT: u32 = 8;
    pub(crate) const MEMMOVE_UNROLL_LIMIT: u32 = 8;

    fn should_optimize_mem_intrins(&self) -> bool {
        self.config.opt_level >= OptLevel::O2
    }

    /// The biggest load/store type not exceeding `size` (and `max_size`).
    pub(crate) fn largest_type_in_size(&self, size: u32, max_size: u32) -> Type {
        debug_assert!(size != 0);
        let types = self.types_for_size();
        let ty_index = (31 - size.leading_zeros()).min(types.len() as u32 - 1);
        let max_index = (31 - max_size.leading_zeros()).min(types.len() as u32 - 1);
        types[ty_index.min(max_index) as usize]
    }

    /// The smallest load/store type holding at least `size` bytes.
    pub(crate) fn first_type_that_fits_size(&self, size: u32) -> Type {
        debug_assert!(size != 0);
        let types = self.types_for_size();
        let mut ty_index = 31 - size.leading_zeros();
        if !size.is_power_of_two() {
            ty_index += 1;
        }
        types[(ty_index as usize).min(types.len() - 1)]
    }

    fn types_for_size(&self) -> [Type; 5] {
        [
            Type::I8,
            Type::I16,
            Type::I32,
            if self.config.is_64bit() {
                Type::I64
            } else {
                Type::F64
            },
            Type::V16I8,
        ]
    }

    fn typed_load(&mut self, ty: Type, dest: VarId, base: VarId, offset: i32) {
        let off = if offset != 0 {
            Some(self.cfg.ctx().const_int32(offset))
        } else {
            None
        };
        let mem = MemOperand::new(Some(base), off);
        if ty.is_vector() {
            self.movp(dest, Operand::Mem(mem));
        } else if ty == Type::F64 {
            self.movq(dest, Operand::Mem(mem));
        } else {
            self.mov(dest, Operand::Mem(mem));
        }
    }

    fn typed_store(&mut self, ty: Type, value: VarId, base: VarId, offset: i32) {
        let off = if offset != 0 {
            Some(self.cfg.ctx().const_int32(offset))
        } else {
            None
        };
        let mem = MemOperand::new(Some(base), off);
        if ty.is_vector() {
            self.storep(value, mem);
        } else if ty == Type::F64 {
            self.storeq(value, mem);
        } else {
            self.store(Operand::Var(value), mem);
        }
    }

    fn copy_memory(&mut self, ty: Type, dest: VarId, src: VarId, offset: i32) {
        let data = self.make_reg(ty, None);
        self.typed_load(ty, data, src, offset);
        self.typed_store(ty, data, dest, offset);
    }

    fn const_u32(&self, op: Operand) -> Option<u32> {
        match op.as_const().map(|c| self.cfg.ctx().const_info(c)) {
            Some(Constant::Int32(v)) => Some(v as u32),
            _ => None,
        }
    }

    fn lower_memcpy(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).srcs[0];
        let src = self.cfg.inst(iid).srcs[1];
        let count = self.cfg.inst(iid).srcs[2];
        let count_const = self.const_u32(count);
        if self.should_optimize_mem_intrins() {
            if let Some(count_value) = count_const {
                if count_value <= Self::BYTES_PER_STOREP * Self::MEMCPY_UNROLL_LIMIT {
                    if count_value == 0 {
                        return;
                    }
                    let src_base = self.legalize_to_reg(src, None);
                    let dest_base = self.legalize_to_reg(dest, None);
                    // Use the largest type as long as possible, then one
                    // overlapping access for the remainder.
                    let ty = self.largest_type_in_size(count_value, u32::MAX);
                    let ty_width = ty.width_in_bytes();
                    let mut remaining = count_value;
                    let mut offset = (count_value & !(ty_width - 1)) as i32 - ty_width as i32;
                    while remaining >= ty_width {
                        self.copy_memory(ty, dest_base, src_base, offset);
                        remaining -= ty_width;
                        offset -= ty_width as i32;
                    }
                    if remaining == 0 {
                        return;
                    }
                    let left_over_ty = self.first_type_that_fits_size(remaining);
                    let offset = (count_value - left_over_ty.width_in_bytes()) as i32;
                    self.copy_memory(left_over_ty, dest_base, src_base, offset);
                    return;
                }
            }
        }
        self.lower_helper_call(helpers::H_MEMCPY, None, &[dest, src, count]);
    }

    fn lower_memmove(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).srcs[0];
        let src = self.cfg.inst(iid).srcs[1];
        let count = self.cfg.inst(iid).srcs[2];
        let count_const = self.const_u32(count);
        if self.should_optimize_mem_intrins() {
            if let Some(count_value) = count_const {
                if count_value <= Self::BYTES_PER_STOREP * Self::MEMMOVE_UNROLL_LIMIT {
                    if count_value == 0 {
                        return;
                    }
                    let src_base = self.legalize_to_reg(src, None);
                    let dest_base = self.legalize_to_reg(dest, None);
                    // Load everything first: the ranges may overlap, so
                    // take a snapshot in registers before storing.
                    let ty = self.largest_type_in_size(count_value, u32::MAX);
                    let ty_width = ty.width_in_bytes();
                    let mut moves: Vec<(Type, i32, VarId)> = Vec::new();
                    let mut remaining = count_value;
                    let mut offset = (count_value & !(ty_width - 1)) as i32 - ty_width as i32;
                    while remaining >= ty_width {
                        let reg = self.make_reg(ty, None);
                        self.typed_load(ty, reg, src_base, offset);
                        moves.push((ty, offset, reg));
                        remaining -= ty_width;
                        offset -= ty_width as i32;
                    }
                    if remaining != 0 {
                        let ty = self.first_type_that_fits_size(remaining);
                        let offset = (count_value - ty.width_in_bytes()) as i32;
                        let reg = self.make_reg(ty, None);
                        self.typed_load(ty, reg, src_base, offset);
                        moves.push((ty, offset, reg));
                    }
                    for (ty, offset, reg) in moves {
                        self.typed_store(ty, reg, dest_base, offset);
                    }
                    return;
                }
            }
        }
        self.lower_helper_call(helpers::H_MEMMOVE, None, &[dest, src, count]);
    }

    fn lower_memset(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).srcs[0];
        let val = self.cfg.inst(iid).srcs[1];
        let count = self.cfg.inst(iid).srcs[2];
        debug_assert_eq!(self.operand_type(val), Type::I8);
        let count_const = self.const_u32(count);
        let val_const = self.const_u32(val);

        if let Some(0) = count_const {
            return;
        }

        if self.should_optimize_mem_intrins() {
            if let (Some(count_value), Some(val_value)) = (count_const, val_const) {
                let spread = (val_value << 24) | (val_value << 16) | (val_value << 8) | val_value;
                // Zero fills can use a vector register cheaply; other
                // values spread a byte across 32-bit stores.
                let (base, vec_reg, ty) = if val_value == 0
                    && count_value >= Self::BYTES_PER_STOREQ
                    && count_value <= Self::BYTES_PER_STOREP * Self::MEMCPY_UNROLL_LIMIT
                {
                    let base = self.legalize_to_reg(dest, None);
                    let vec = self.make_vector_of_zeros(Type::V16I8, None);
                    let ty = self.largest_type_in_size(count_value, u32::MAX);
                    (Some(base), Some(vec), ty)
                } else if count_value <= Self::BYTES_PER_STOREI32 * Self::MEMCPY_UNROLL_LIMIT {
                    let base = self.legalize_to_reg(dest, None);
                    let ty = self.largest_type_in_size(count_value, 4);
                    (Some(base), None, ty)
                } else {
                    (None, None, Type::I8)
                };
                if let Some(base) = base {
                    let ty_width = ty.width_in_bytes();
                    let mut remaining = count_value;
                    let mut offset = (count_value & !(ty_width - 1)) as i32 - ty_width as i32;
                    while remaining >= ty_width {
                        self.lower_set_chunk(ty, base, offset, spread, vec_reg);
                        remaining -= ty_width;
                        offset -= ty_width as i32;
                    }
                    if remaining == 0 {
                        return;
                    }
                    let left_over_ty = self.first_type_that_fits_size(remaining);
                    let offset = (count_value - left_over_ty.width_in_bytes()) as i32;
                    self.lower_set_chunk(left_over_ty, base, offset, spread, vec_reg);
                    return;
                }
            }
        }

        // The helper requires an argument of at least 32 bits.
        let val_ext = if val_const.is_some() {
            self.const_int(self.word_type(), val_const.unwrap() as i64)
        } else {
            let wide = self.cfg.make_variable(self.word_type());
            let cast = Inst::new(
                InstKind::Cast(CastOp::Zext),
                Some(wide),
                smallvec![val],
            );
            let cast_id = self.cfg.add_inst(cast);
            self.lower_cast(cast_id, CastOp::Zext);
            self.cfg.inst_mut(cast_id).set_deleted();
            Operand::Var(wide)
        };
        self.lower_helper_call(helpers::H_MEMSET, None, &[dest, val_ext, count]);
    }

    fn lower_set_chunk(
        &mut self,
        ty: Type,
        base: VarId,
        offset: i32,
        spread: u32,
        vec_reg: Option<VarId>,
    ) {
        let off = if offset != 0 {
            Some(self.cfg.ctx().const_int32(offset))
        } else {
            None
        };
        let mem = MemOperand::new(Some(base), off);
        if ty.is_vector() {
            self.storep(vec_reg.expect("missing vector register"), mem);
        } else if ty == Type::F64 {
            self.storeq(vec_reg.expect("missing vector register"), mem);
        } else {
            let value = self.const_int(ty, spread as i64);
            self.store(value, mem);
        }
    }

    // Register shorthands used only by the atomics.
    fn reg_ebx(&self) -> glacier_ir::value::RegNum {
        match self.config.arch {
            crate::regs::TargetArch::X8632 => crate::regs::x8632::EBX,
            crate::regs::TargetArch::X8664 => crate::regs::x8664::RBX,
        }
    }

    fn reg_ecx(&self) -> glacier_ir::value::RegNum {
        match self.config.arch {
            crate::regs::TargetArch::X8632 => crate::regs::x8632::ECX,
            crate::regs::TargetArch::X8664 => crate::regs::x8664::RCX,
        }
    }
}
