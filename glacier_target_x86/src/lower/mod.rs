//! Instruction lowering: rewriting high-level LLIR instructions into x86
//! machine instructions at the cursor.
//!
//! Submodules split the lowering by area; everything hangs off
//! [`TargetX86`]. Lowered instructions are inserted strictly before the
//! instruction being lowered, which is then deleted, so every input
//! instruction expands into a contiguous run of output.

mod call;
mod cast;
mod cmp;
mod intrin;
mod mem;
mod vector;

pub(crate) use vector::scalarize_arithmetic as vector_scalarize;

use std::collections::HashMap;

use smallvec::{smallvec, SmallVec};

use glacier_ir::cfg::Cfg;
use glacier_ir::cond::{BrCond, CmppsCond, CvtVariant};
use glacier_ir::constants::Constant;
use glacier_ir::inst::{ArithOp, BrTarget, Inst, InstKind, MachineOp};
use glacier_ir::operand::{MemOperand, Operand, SplitHalf};
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, LabelId, NodeId, RegNum, VarId};
use glacier_ir::variable::RegClass;

use crate::context::LoweringContext;
use crate::folding::BoolFolding;
use crate::regs::{self, InstructionSet, RegEnv, TargetArch};

bitflags::bitflags! {
    /// What operand shapes a lowering position accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Legal: u8 {
        const REG = 1 << 0;
        const IMM = 1 << 1;
        const MEM = 1 << 2;
        /// Rematerializable variables may pass through unmaterialized.
        const REMAT = 1 << 3;
    }
}

impl Legal {
    pub const ALL: Legal = Legal::REG.union(Legal::IMM).union(Legal::MEM);
}

/// Optimization level of the translation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    /// Minimal: no optimization passes, registers only for temporaries
    /// that require them.
    Om1,
    /// Full pipeline.
    O2,
}

/// Target parameters fixed per function unit.
#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    pub arch: TargetArch,
    pub isa: InstructionSet,
    pub opt_level: OptLevel,
}

impl TargetConfig {
    pub fn new(arch: TargetArch) -> Self {
        Self {
            arch,
            isa: InstructionSet::Sse2,
            opt_level: OptLevel::O2,
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.arch.is_64bit()
    }
}

/// The x86 lowering and its per-function state.
pub struct TargetX86<'a> {
    pub cfg: &'a mut Cfg,
    pub config: TargetConfig,
    pub env: RegEnv,
    pub ctx: LoweringContext,
    pub folding: BoolFolding,
    /// Named physical register variables, one per (register, type).
    phys_regs: HashMap<(RegNum, Type), VarId>,
    /// Bytes of outgoing argument space required by the worst call.
    pub max_out_args_bytes: u32,
    /// Fixed-offset alloca area accumulated during lowering.
    pub fixed_alloca_bytes: u32,
    pub has_frame_pointer: bool,
    pub needs_stack_alignment: bool,
    /// Arguments homed in registers (x86-64); the rest live on the stack.
    pub reg_args: Vec<VarId>,
}

impl<'a> TargetX86<'a> {
    pub fn new(cfg: &'a mut Cfg, config: TargetConfig) -> Self {
        Self {
            cfg,
            config,
            env: RegEnv::new(config.arch),
            ctx: LoweringContext::default(),
            folding: BoolFolding::default(),
            phys_regs: HashMap::new(),
            max_out_args_bytes: 0,
            fixed_alloca_bytes: 0,
            has_frame_pointer: false,
            needs_stack_alignment: false,
            reg_args: Vec::new(),
        }
    }

    // --- Emission primitives ---

    pub(crate) fn emit(
        &mut self,
        kind: InstKind,
        dest: Option<VarId>,
        srcs: SmallVec<[Operand; 4]>,
    ) -> InstId {
        self.ctx.insert(self.cfg, Inst::new(kind, dest, srcs))
    }

    pub(crate) fn m(
        &mut self,
        op: MachineOp,
        dest: Option<VarId>,
        srcs: SmallVec<[Operand; 4]>,
    ) -> InstId {
        self.emit(InstKind::Machine(op), dest, srcs)
    }

    /// Two-address form: `dest = dest op src`.
    fn two_addr(&mut self, op: MachineOp, dest: VarId, src: Operand) -> InstId {
        self.m(op, Some(dest), smallvec![Operand::Var(dest), src])
    }

    pub(crate) fn mov(&mut self, dest: VarId, src: Operand) -> InstId {
        self.m(MachineOp::Mov, Some(dest), smallvec![src])
    }

    /// A move whose destination is being reassigned due to lowering-
    /// introduced intra-block control flow.
    pub(crate) fn mov_redefined(&mut self, dest: VarId, src: Operand) {
        let id = self.mov(dest, src);
        self.cfg.inst_mut(id).set_dest_redefined();
    }

    pub(crate) fn movp(&mut self, dest: VarId, src: Operand) {
        self.m(MachineOp::Movp, Some(dest), smallvec![src]);
    }

    pub(crate) fn movq(&mut self, dest: VarId, src: Operand) {
        self.m(MachineOp::Movq, Some(dest), smallvec![src]);
    }

    pub(crate) fn movd(&mut self, dest: VarId, src: Operand) {
        self.m(MachineOp::Movd, Some(dest), smallvec![src]);
    }

    pub(crate) fn movsx(&mut self, dest: VarId, src: Operand) {
        self.m(MachineOp::Movsx, Some(dest), smallvec![src]);
    }

    pub(crate) fn movzx(&mut self, dest: VarId, src: Operand) {
        self.m(MachineOp::Movzx, Some(dest), smallvec![src]);
    }

    /// `movss` merges into the low lane, so it reads the destination.
    pub(crate) fn movss(&mut self, dest: VarId, src: VarId) {
        self.two_addr(MachineOp::Movss, dest, Operand::Var(src));
    }

    pub(crate) fn add(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Add, dest, src);
    }
    pub(crate) fn adc(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Adc, dest, src);
    }
    pub(crate) fn sub(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Sub, dest, src);
    }
    pub(crate) fn sbb(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Sbb, dest, src);
    }
    pub(crate) fn and(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::And, dest, src);
    }
    pub(crate) fn or(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Or, dest, src);
    }
    pub(crate) fn xor(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Xor, dest, src);
    }
    pub(crate) fn imul(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Imul, dest, src);
    }
    pub(crate) fn imul_imm(&mut self, dest: VarId, src: Operand, imm: Operand) {
        self.m(MachineOp::ImulImm, Some(dest), smallvec![src, imm]);
    }
    pub(crate) fn neg(&mut self, dest: VarId) {
        self.m(MachineOp::Neg, Some(dest), smallvec![Operand::Var(dest)]);
    }
    pub(crate) fn shl(&mut self, dest: VarId, amount: Operand) {
        self.two_addr(MachineOp::Shl, dest, amount);
    }
    pub(crate) fn shr(&mut self, dest: VarId, amount: Operand) {
        self.two_addr(MachineOp::Shr, dest, amount);
    }
    pub(crate) fn sar(&mut self, dest: VarId, amount: Operand) {
        self.two_addr(MachineOp::Sar, dest, amount);
    }
    pub(crate) fn rol(&mut self, dest: VarId, amount: Operand) {
        self.two_addr(MachineOp::Rol, dest, amount);
    }
    pub(crate) fn shld(&mut self, dest: VarId, src: VarId, amount: Operand) {
        self.m(
            MachineOp::Shld,
            Some(dest),
            smallvec![Operand::Var(dest), Operand::Var(src), amount],
        );
    }
    pub(crate) fn shrd(&mut self, dest: VarId, src: VarId, amount: Operand) {
        self.m(
            MachineOp::Shrd,
            Some(dest),
            smallvec![Operand::Var(dest), Operand::Var(src), amount],
        );
    }

    pub(crate) fn cmp(&mut self, a: Operand, b: Operand) {
        self.m(MachineOp::Cmp, None, smallvec![a, b]);
    }
    pub(crate) fn test(&mut self, a: Operand, b: Operand) {
        self.m(MachineOp::Test, None, smallvec![a, b]);
    }
    pub(crate) fn ucomiss(&mut self, a: Operand, b: Operand) {
        self.m(MachineOp::Ucomiss, None, smallvec![a, b]);
    }
    pub(crate) fn setcc(&mut self, dest: VarId, cond: BrCond) {
        self.m(MachineOp::Setcc(cond), Some(dest), smallvec![]);
    }
    pub(crate) fn cmov(&mut self, dest: VarId, src: Operand, cond: BrCond) {
        self.two_addr(MachineOp::Cmov(cond), dest, src);
    }

    pub(crate) fn br_node(&mut self, cond: Option<BrCond>, t: NodeId, f: Option<NodeId>) {
        self.m(
            MachineOp::Br {
                cond,
                target: BrTarget::Node(t),
                target_else: f.map(BrTarget::Node),
            },
            None,
            smallvec![],
        );
    }

    pub(crate) fn br_label(&mut self, cond: BrCond, label: LabelId) {
        self.m(
            MachineOp::Br {
                cond: Some(cond),
                target: BrTarget::Label(label),
                target_else: None,
            },
            None,
            smallvec![],
        );
    }

    pub(crate) fn insert_label(&mut self, label: LabelId) {
        self.emit(InstKind::Label(label), None, smallvec![]);
    }

    pub(crate) fn fake_def(&mut self, dest: VarId, dep: Option<VarId>) {
        let srcs = match dep {
            Some(d) => smallvec![Operand::Var(d)],
            None => smallvec![],
        };
        self.emit(InstKind::FakeDef, Some(dest), srcs);
    }

    pub(crate) fn fake_use(&mut self, var: VarId) {
        self.emit(InstKind::FakeUse, None, smallvec![Operand::Var(var)]);
    }

    pub(crate) fn lea(&mut self, dest: VarId, mem: MemOperand) {
        self.m(MachineOp::Lea, Some(dest), smallvec![Operand::Mem(mem)]);
    }

    pub(crate) fn cvt(&mut self, dest: VarId, src: Operand, variant: CvtVariant) {
        self.m(MachineOp::Cvt(variant), Some(dest), smallvec![src]);
    }

    pub(crate) fn store(&mut self, value: Operand, mem: MemOperand) {
        self.m(MachineOp::Store, None, smallvec![value, Operand::Mem(mem)]);
    }
    pub(crate) fn storep(&mut self, value: VarId, mem: MemOperand) {
        self.m(
            MachineOp::Storep,
            None,
            smallvec![Operand::Var(value), Operand::Mem(mem)],
        );
    }
    pub(crate) fn storeq(&mut self, value: VarId, mem: MemOperand) {
        self.m(
            MachineOp::Storeq,
            None,
            smallvec![Operand::Var(value), Operand::Mem(mem)],
        );
    }

    // Packed ops, two-address unless noted.
    pub(crate) fn padd(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Padd, dest, src);
    }
    pub(crate) fn psub(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Psub, dest, src);
    }
    pub(crate) fn pand(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Pand, dest, src);
    }
    pub(crate) fn pandn(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Pandn, dest, src);
    }
    pub(crate) fn por(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Por, dest, src);
    }
    pub(crate) fn pxor(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Pxor, dest, src);
    }
    pub(crate) fn pmull(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Pmull, dest, src);
    }
    pub(crate) fn pmuludq(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Pmuludq, dest, src);
    }
    pub(crate) fn pcmpeq(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Pcmpeq, dest, src);
    }
    pub(crate) fn pcmpgt(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Pcmpgt, dest, src);
    }
    pub(crate) fn psll(&mut self, dest: VarId, amount: Operand) {
        self.two_addr(MachineOp::Psll, dest, amount);
    }
    pub(crate) fn psrl(&mut self, dest: VarId, amount: Operand) {
        self.two_addr(MachineOp::Psrl, dest, amount);
    }
    pub(crate) fn psra(&mut self, dest: VarId, amount: Operand) {
        self.two_addr(MachineOp::Psra, dest, amount);
    }
    pub(crate) fn pshufd(&mut self, dest: VarId, src: Operand, mask: Operand) {
        self.m(MachineOp::Pshufd, Some(dest), smallvec![src, mask]);
    }
    pub(crate) fn shufps(&mut self, dest: VarId, src: Operand, mask: Operand) {
        self.m(
            MachineOp::Shufps,
            Some(dest),
            smallvec![Operand::Var(dest), src, mask],
        );
    }
    pub(crate) fn cmpps(&mut self, dest: VarId, src: Operand, pred: CmppsCond) {
        self.two_addr(MachineOp::Cmpps(pred), dest, src);
    }
    pub(crate) fn addps(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Addps, dest, src);
    }
    pub(crate) fn subps(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Subps, dest, src);
    }
    pub(crate) fn mulps(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Mulps, dest, src);
    }
    pub(crate) fn divps(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Divps, dest, src);
    }
    pub(crate) fn addss(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Addss, dest, src);
    }
    pub(crate) fn subss(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Subss, dest, src);
    }
    pub(crate) fn mulss(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Mulss, dest, src);
    }
    pub(crate) fn divss(&mut self, dest: VarId, src: Operand) {
        self.two_addr(MachineOp::Divss, dest, src);
    }

    // --- Register and constant helpers ---

    /// A fresh virtual register: infinite weight unless pinned to a
    /// specific physical register.
    pub(crate) fn make_reg(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        debug_assert!(self.config.is_64bit() || ty != Type::I64);
        let v = self.cfg.make_variable(ty);
        match reg {
            None => self.cfg.var_mut(v).set_must_have_reg(),
            Some(r) => self.cfg.var_mut(v).set_reg_num(r),
        }
        v
    }

    /// The cached named physical register of the given type, live on
    /// entry and exempt from liveness tracking.
    pub(crate) fn get_physical_register(&mut self, reg: RegNum, ty: Type) -> VarId {
        if let Some(&v) = self.phys_regs.get(&(reg, ty)) {
            return v;
        }
        let v = self.cfg.make_variable(ty);
        self.cfg.var_mut(v).set_reg_num(reg);
        self.cfg.var_mut(v).set_ignore_liveness();
        self.cfg.add_implicit_arg(v);
        self.phys_regs.insert((reg, ty), v);
        v
    }

    /// eax (or its narrower/wider view) for a given type.
    pub(crate) fn reg_eax(&self, ty: Type) -> RegNum {
        match self.config.arch {
            TargetArch::X8632 => match ty {
                Type::I1 | Type::I8 => regs::x8632::AL,
                _ => regs::x8632::EAX,
            },
            TargetArch::X8664 => match ty {
                Type::I1 | Type::I8 => regs::x8664::AL,
                _ => regs::x8664::RAX,
            },
        }
    }

    /// edx, or ah for the 8-bit divide whose remainder lands there.
    pub(crate) fn reg_edx(&self, ty: Type) -> RegNum {
        match self.config.arch {
            TargetArch::X8632 => match ty {
                Type::I1 | Type::I8 => regs::x8632::AH,
                _ => regs::x8632::EDX,
            },
            TargetArch::X8664 => match ty {
                Type::I1 | Type::I8 => regs::x8664::low_byte(regs::x8664::RDX),
                _ => regs::x8664::RDX,
            },
        }
    }

    pub(crate) fn reg_cl(&self) -> RegNum {
        match self.config.arch {
            TargetArch::X8632 => regs::x8632::CL,
            TargetArch::X8664 => regs::x8664::CL,
        }
    }

    pub(crate) fn reg_xmm0(&self) -> RegNum {
        match self.config.arch {
            TargetArch::X8632 => regs::x8632::XMM0,
            TargetArch::X8664 => regs::x8664::XMM0,
        }
    }

    pub(crate) fn word_type(&self) -> Type {
        self.config.arch.word_type()
    }

    pub(crate) fn const_i32(&self, v: i32) -> Operand {
        Operand::Const(self.cfg.ctx().const_int32(v))
    }

    pub(crate) fn const_zero(&self, ty: Type) -> Operand {
        Operand::Const(self.cfg.ctx().const_zero(ty))
    }

    pub(crate) fn const_int(&self, ty: Type, v: i64) -> Operand {
        Operand::Const(self.cfg.ctx().const_int(ty, v))
    }

    pub(crate) fn operand_type(&self, op: Operand) -> Type {
        match op {
            Operand::Var(v) => self.cfg.var(v).ty,
            Operand::Const(c) => self.cfg.ctx().const_info(c).ty(),
            Operand::Mem(_) => self.word_type(),
            Operand::Split { .. } => Type::I32,
        }
    }

    /// Zero a register without reference to memory. Integer zeros use a
    /// plain move to avoid clobbering FLAGS; float and vector zeros xor
    /// themselves, with a fake def so liveness sees a definition first.
    pub(crate) fn make_zeroed_register(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        let r = self.make_reg(ty, reg);
        if ty.is_scalar_integer() {
            let zero = self.const_zero(ty);
            self.mov(r, zero);
        } else {
            self.fake_def(r, None);
            self.pxor(r, Operand::Var(r));
        }
        r
    }

    pub(crate) fn make_vector_of_zeros(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        self.make_zeroed_register(ty, reg)
    }

    pub(crate) fn make_vector_of_minus_ones(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        let r = self.make_reg(ty, reg);
        self.fake_def(r, None);
        self.pcmpeq(r, Operand::Var(r));
        r
    }

    pub(crate) fn make_vector_of_ones(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        let dest = self.make_vector_of_zeros(ty, reg);
        let minus_one = self.make_vector_of_minus_ones(ty, None);
        self.psub(dest, Operand::Var(minus_one));
        dest
    }

    /// A vector with only the sign bit set in each lane.
    pub(crate) fn make_vector_of_high_order_bits(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        debug_assert!(matches!(
            ty,
            Type::V4I32 | Type::V4F32 | Type::V8I16 | Type::V16I8
        ));
        if ty == Type::V16I8 {
            // SSE has no 8-bit vector shift; splat the mask through a GPR.
            let mask = self.const_i32(0x80808080u32 as i32);
            let r = self.make_reg(ty, reg);
            let mask_op = self.legalize(mask, Legal::REG | Legal::MEM, None);
            self.movd(r, mask_op);
            let zero = self.const_i32(0);
            self.pshufd(r, Operand::Var(r), zero);
            r
        } else {
            let r = self.make_vector_of_ones(ty, reg);
            let shift = ty.element_type().width_in_bytes() * 8 - 1;
            let amt = self.const_i32(shift as i32);
            self.psll(r, amt);
            r
        }
    }

    /// Mask that clears the sign bit: all ones logically shifted right by
    /// one.
    pub(crate) fn make_vector_of_fabs_mask(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        let r = self.make_vector_of_minus_ones(ty, reg);
        let one = self.const_i32(1);
        self.psrl(r, one);
        r
    }

    // --- Operand legalization ---

    pub(crate) fn copy_to_reg(&mut self, src: Operand, reg: Option<RegNum>) -> VarId {
        let ty = self.operand_type(src);
        let r = self.make_reg(ty, reg);
        if ty.is_vector() {
            self.movp(r, src);
        } else {
            self.mov(r, src);
        }
        r
    }

    /// Copy a scalar integer into an 8-bit register, honoring the rule
    /// that a register source must pass through a truncable register and
    /// a truncation receiver (never ah..dh).
    pub(crate) fn copy_to_reg8(&mut self, src: Operand, reg: Option<RegNum>) -> VarId {
        let ty = self.operand_type(src);
        debug_assert!(ty.is_scalar_integer());
        debug_assert!(ty != Type::I1);
        let dest = self.make_reg(Type::I8, reg);
        self.cfg.var_mut(dest).reg_class = RegClass::Trunc8Rcvr;
        let mut src = src;
        let is_reloc = matches!(
            src,
            Operand::Const(c) if matches!(self.cfg.ctx().const_info(c), Constant::Relocatable { .. })
        );
        if src.is_var() || is_reloc {
            let truncable = self.make_reg(ty, None);
            self.cfg.var_mut(truncable).reg_class = match ty {
                Type::I64 => RegClass::Is64To8,
                Type::I32 => RegClass::Is32To8,
                Type::I16 => RegClass::Is16To8,
                _ => RegClass::Default,
            };
            let rcvr = self.make_reg(Type::I8, None);
            self.cfg.var_mut(rcvr).reg_class = RegClass::Trunc8Rcvr;
            self.mov(truncable, src);
            self.mov(rcvr, Operand::Var(truncable));
            src = Operand::Var(rcvr);
        }
        self.mov(dest, src);
        dest
    }

    /// Normalize an operand to one of the allowed shapes, optionally into
    /// a specific physical register.
    pub(crate) fn legalize(&mut self, from: Operand, allowed: Legal, reg: Option<RegNum>) -> Operand {
        debug_assert!(allowed.contains(Legal::REG));
        debug_assert!(reg.is_none() || allowed == Legal::REG);

        // Substitute an available infinite-weight copy when any register
        // is acceptable and the types line up.
        if reg.is_none() {
            if let Some(subst) = self.ctx.avail_get(from) {
                let sv = self.cfg.var(subst);
                if sv.must_have_reg()
                    && !sv.has_reg()
                    && sv.ty == self.operand_type(from)
                {
                    return Operand::Var(subst);
                }
            }
        }

        match from {
            Operand::Mem(mem) => {
                // Base and index must be in physical registers, with a
                // rematerializable pass-through.
                let base = mem.base.map(|b| {
                    self.legalize(Operand::Var(b), Legal::REG | Legal::REMAT, None)
                        .as_var()
                        .unwrap()
                });
                let index = mem.index.map(|i| {
                    self.legalize(Operand::Var(i), Legal::REG | Legal::REMAT, None)
                        .as_var()
                        .unwrap()
                });
                let mut mem = mem;
                mem.base = base;
                mem.index = index;
                if !allowed.contains(Legal::MEM) {
                    return Operand::Var(self.copy_to_reg(Operand::Mem(mem), reg));
                }
                Operand::Mem(mem)
            }
            Operand::Const(c) => {
                let info = self.cfg.ctx().const_info(c);
                if let Constant::Undef(_) = info {
                    let from = self.legalize_undef(from, reg);
                    if self.operand_type(from).is_vector() {
                        return from;
                    }
                    return self.legalize(from, allowed, reg);
                }
                let ty = info.ty();
                // 64-bit integer immediates need a register on x86-64.
                if self.config.is_64bit() {
                    if let Constant::Int64(_) = info {
                        return Operand::Var(self.copy_to_reg(from, reg));
                    }
                }
                if ty.is_scalar_float() {
                    // Zero is cheaper as pxor; everything else becomes a
                    // constant-pool reference.
                    let is_pos_zero = match info {
                        Constant::Float(bits) => bits == 0,
                        Constant::Double(bits) => bits == 0,
                        _ => false,
                    };
                    if is_pos_zero {
                        return Operand::Var(self.make_zeroed_register(ty, reg));
                    }
                    let label = match info {
                        Constant::Float(bits) => format!(".L$f32${:08x}", bits),
                        Constant::Double(bits) => format!(".L$f64${:016x}", bits),
                        _ => unreachable!(),
                    };
                    let sym = self.cfg.ctx().const_sym(0, &label, true);
                    let mem = MemOperand::new(None, Some(sym));
                    if !allowed.contains(Legal::MEM) {
                        return Operand::Var(self.copy_to_reg(Operand::Mem(mem), reg));
                    }
                    return Operand::Mem(mem);
                }
                if !allowed.contains(Legal::IMM) {
                    return Operand::Var(self.copy_to_reg(from, reg));
                }
                from
            }
            Operand::Var(v) => {
                let var = self.cfg.var(v);
                let must_have_register = var.has_reg() || var.must_have_reg();
                let must_rematerialize =
                    var.is_rematerializable() && !allowed.contains(Legal::REMAT);
                if must_rematerialize {
                    // The base+offset derivation is emitted inline as lea.
                    let new_var = self.make_reg(self.word_type(), reg);
                    let mem = MemOperand::new(Some(v), None);
                    self.lea(new_var, mem);
                    Operand::Var(new_var)
                } else if (!allowed.contains(Legal::MEM) && !must_have_register)
                    || (reg.is_some() && reg != var.reg_num())
                {
                    Operand::Var(self.copy_to_reg(from, reg))
                } else {
                    from
                }
            }
            Operand::Split { .. } => {
                // Split halves are memory references by construction.
                if !allowed.contains(Legal::MEM) {
                    return Operand::Var(self.copy_to_reg(from, reg));
                }
                from
            }
        }
    }

    pub(crate) fn legalize_to_reg(&mut self, from: Operand, reg: Option<RegNum>) -> VarId {
        match reg {
            None => self.legalize(from, Legal::REG, None).as_var().unwrap(),
            Some(_) => self.legalize(from, Legal::REG, reg).as_var().unwrap(),
        }
    }

    /// Lower undef to zero (scalar) or an all-zero register (vector).
    pub(crate) fn legalize_undef(&mut self, from: Operand, reg: Option<RegNum>) -> Operand {
        if let Operand::Const(c) = from {
            if let Constant::Undef(ty) = self.cfg.ctx().const_info(c) {
                if ty.is_vector() {
                    return Operand::Var(self.make_vector_of_zeros(ty, reg));
                }
                return Operand::Const(self.cfg.ctx().const_zero(ty));
            }
        }
        from
    }

    /// For `cmp`, the first operand may be memory only when the second is
    /// an immediate or known to be in a physical register.
    pub(crate) fn legalize_src0_for_cmp(&mut self, src0: Operand, src1: Operand) -> Operand {
        let src1_imm_or_reg = match src1 {
            Operand::Const(_) => true,
            Operand::Var(v) => self.cfg.var(v).has_reg(),
            _ => false,
        };
        let allowed = if src1_imm_or_reg {
            Legal::REG | Legal::MEM
        } else {
            Legal::REG
        };
        self.legalize(src0, allowed, None)
    }

    /// Turn an address operand into a memory operand of the given type.
    pub(crate) fn form_memory_operand(&mut self, opnd: Operand, do_legalize: bool) -> MemOperand {
        let mem = match opnd {
            Operand::Mem(m) => m,
            Operand::Var(base) => MemOperand::new(Some(base), None),
            Operand::Const(c) => MemOperand::new(None, Some(c)),
            Operand::Split { .. } => unreachable!("split half as address"),
        };
        if do_legalize {
            self.legalize(Operand::Mem(mem), Legal::ALL, None)
                .as_mem()
                .unwrap()
        } else {
            mem
        }
    }

    // --- 64-on-32 operand splitting ---

    /// The low half of an i64 (or spill-backed f64) operand.
    pub(crate) fn lo_operand(&mut self, op: Operand) -> Operand {
        match op {
            Operand::Var(v) => {
                let pair = self.cfg.var(v).pair.expect("lo_operand on unsplit variable");
                Operand::Var(pair.lo)
            }
            Operand::Const(c) => match self.cfg.ctx().const_info(c) {
                Constant::Int64(value) => self.const_i32(value as i32),
                _ => unreachable!("lo_operand on non-i64 constant"),
            },
            Operand::Mem(m) => Operand::Mem(m),
            Operand::Split { .. } => op,
        }
    }

    /// The high half: variables use their hi pair, constants shift, and
    /// memory operands displace by four bytes.
    pub(crate) fn hi_operand(&mut self, op: Operand) -> Operand {
        match op {
            Operand::Var(v) => {
                let pair = self.cfg.var(v).pair.expect("hi_operand on unsplit variable");
                Operand::Var(pair.hi)
            }
            Operand::Const(c) => match self.cfg.ctx().const_info(c) {
                Constant::Int64(value) => self.const_i32((value >> 32) as i32),
                _ => unreachable!("hi_operand on non-i64 constant"),
            },
            Operand::Mem(m) => {
                let offset = match m.offset {
                    None => self.cfg.ctx().const_int32(4),
                    Some(off) => match self.cfg.ctx().const_info(off) {
                        Constant::Int32(v) => self.cfg.ctx().const_int32(v + 4),
                        Constant::Relocatable {
                            sym,
                            offset,
                            suppress_mangling,
                        } => {
                            assert!(offset.checked_add(4).is_some());
                            self.cfg.ctx().const_sym_id(offset + 4, sym, suppress_mangling)
                        }
                        _ => unreachable!("bad displacement"),
                    },
                };
                let mut hi = m;
                hi.offset = Some(offset);
                Operand::Mem(hi)
            }
            Operand::Split { .. } => op,
        }
    }

    pub(crate) fn dest_parts(&mut self, dest: VarId) -> (VarId, VarId) {
        let pair = self.cfg.var(dest).pair.expect("unsplit i64 destination");
        (pair.lo, pair.hi)
    }

    // --- Top-level dispatch ---

    /// Lower one high-level instruction; the original is deleted unless
    /// it is already low-level.
    pub fn lower_inst(&mut self, iid: InstId) {
        let kind = self.cfg.inst(iid).kind.clone();
        match kind {
            InstKind::Assign => self.lower_assign(iid),
            InstKind::Arithmetic(op) => self.lower_arithmetic(iid, op),
            InstKind::Alloca { align, .. } => self.lower_alloca(iid, align),
            InstKind::Br { .. } => self.lower_br(iid),
            InstKind::Call => self.lower_call(iid),
            InstKind::Cast(op) => self.lower_cast(iid, op),
            InstKind::ExtractElement => self.lower_extract_element(iid),
            InstKind::Fcmp(cond) => self.lower_fcmp_and_br(iid, cond, None),
            InstKind::Icmp(cond) => self.lower_icmp_and_br(iid, cond, None),
            InstKind::InsertElement => self.lower_insert_element(iid),
            InstKind::IntrinsicCall(id) => self.lower_intrinsic(iid, id),
            InstKind::Load => self.lower_load(iid),
            InstKind::Phi { .. } => {
                self.cfg.set_error(glacier_ir::CfgError::InvariantViolation(
                    "phi found in regular instruction list".to_string(),
                ));
            }
            InstKind::Ret => self.lower_ret(iid),
            InstKind::Select => self.lower_select(iid),
            InstKind::Store => self.lower_store(iid),
            InstKind::Unreachable => self.lower_unreachable(),
            InstKind::FakeRmw { op } => self.lower_rmw(iid, op),
            // Already low-level; leave in place.
            InstKind::FakeDef | InstKind::FakeUse | InstKind::Label(_) | InstKind::Machine(_) => {
                return;
            }
        }
        self.cfg.inst_mut(iid).set_deleted();
    }

    // --- Assign ---

    fn lower_assign(&mut self, iid: InstId) {
        let dest = self.cfg.inst(iid).dest.expect("assign without dest");
        if self.cfg.var(dest).is_rematerializable() {
            self.fake_def(dest, None);
            return;
        }
        let src0 = self.cfg.inst(iid).srcs[0];
        let dest_ty = self.cfg.var(dest).ty;
        if !self.config.is_64bit() && dest_ty == Type::I64 {
            let src = self.legalize(src0, Legal::ALL, None);
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
            let src_legal = if self.cfg.var(dest).has_reg() {
                // A precolored destination accepts any shape; force the
                // source into that register.
                let reg = self.cfg.var(dest).reg_num();
                self.legalize(src0, Legal::REG, reg)
            } else {
                // A possibly-stack destination needs a register or an
                // immediate source.
                self.legalize(src0, Legal::REG | Legal::IMM, None)
            };
            if dest_ty.is_vector() {
                self.movp(dest, src_legal);
            } else {
                self.mov(dest, src_legal);
            }
        }
    }

    // --- Arithmetic ---

    fn lower_arithmetic(&mut self, iid: InstId, op: ArithOp) {
        let dest = self.cfg.inst(iid).dest.expect("arithmetic without dest");
        if self.cfg.var(dest).is_rematerializable() {
            self.fake_def(dest, None);
            return;
        }
        let ty = self.cfg.var(dest).ty;
        let mut src0 = {
            let s = self.cfg.inst(iid).srcs[0];
            self.legalize(s, Legal::ALL, None)
        };
        let mut src1 = {
            let s = self.cfg.inst(iid).srcs[1];
            self.legalize(s, Legal::ALL, None)
        };
        if op.is_commutative() {
            // Push variables left and constants right, and prefer ending
            // a lifetime in the two-address source position.
            if !src0.is_var() && src1.is_var() {
                std::mem::swap(&mut src0, &mut src1);
            } else if src0.is_const() && !src1.is_const() {
                std::mem::swap(&mut src0, &mut src1);
            } else if let (Some(v0), Some(v1)) = (src0.as_var(), src1.as_var()) {
                let inst = self.cfg.inst(iid);
                if !inst.is_last_use(v0) && inst.is_last_use(v1) {
                    std::mem::swap(&mut src0, &mut src1);
                }
            }
        }
        if !self.config.is_64bit() && ty == Type::I64 {
            self.lower_arithmetic_i64(dest, op, src0, src1);
            return;
        }
        if ty.is_vector() {
            self.lower_arithmetic_vector(dest, op, src0, src1, ty);
            return;
        }
        self.lower_arithmetic_scalar(iid, dest, op, src0, src1, ty);
    }

    fn lower_arithmetic_i64(&mut self, dest: VarId, op: ArithOp, src0: Operand, src1: Operand) {
        let (dest_lo, dest_hi) = self.dest_parts(dest);
        let src0_lo = self.lo_operand(src0);
        let src0_hi = self.hi_operand(src0);
        let src1_lo = self.lo_operand(src1);
        let src1_hi = self.hi_operand(src1);
        let pairwise = |this: &mut Self, lo_op: MachineOp, hi_op: MachineOp| {
            let t_lo = this.make_reg(Type::I32, None);
            this.mov(t_lo, src0_lo);
            this.two_addr(lo_op, t_lo, src1_lo);
            this.mov(dest_lo, Operand::Var(t_lo));
            let t_hi = this.make_reg(Type::I32, None);
            this.mov(t_hi, src0_hi);
            this.two_addr(hi_op, t_hi, src1_hi);
            this.mov(dest_hi, Operand::Var(t_hi));
        };
        match op {
            ArithOp::Add => pairwise(self, MachineOp::Add, MachineOp::Adc),
            ArithOp::Sub => pairwise(self, MachineOp::Sub, MachineOp::Sbb),
            ArithOp::And => pairwise(self, MachineOp::And, MachineOp::And),
            ArithOp::Or => pairwise(self, MachineOp::Or, MachineOp::Or),
            ArithOp::Xor => pairwise(self, MachineOp::Xor, MachineOp::Xor),
            ArithOp::Mul => {
                // t1 = b.hi * c.lo;  t2 = c.hi * b.lo
                // edx:eax = b.lo * c.lo
                // dest.lo = eax;  dest.hi = edx + t1 + t2
                let src1_lo = self.legalize(src1_lo, Legal::REG | Legal::MEM, None);
                let t1 = self.make_reg(Type::I32, None);
                self.mov(t1, src0_hi);
                self.imul(t1, src1_lo);
                let t2 = self.make_reg(Type::I32, None);
                self.mov(t2, src1_hi);
                self.imul(t2, src0_lo);
                let eax = self.reg_eax(Type::I32);
                let edx = self.reg_edx(Type::I32);
                let t3 = self.make_reg(Type::I32, Some(eax));
                self.mov(t3, src0_lo);
                let t4_lo = self.make_reg(Type::I32, Some(eax));
                let t4_hi = self.make_reg(Type::I32, Some(edx));
                self.m(
                    MachineOp::Mul,
                    Some(t4_lo),
                    smallvec![Operand::Var(t3), src1_lo],
                );
                // mul defines edx:eax; the fake def models edx.
                self.fake_def(t4_hi, Some(t4_lo));
                self.mov(dest_lo, Operand::Var(t4_lo));
                self.add(t4_hi, Operand::Var(t1));
                self.add(t4_hi, Operand::Var(t2));
                self.mov(dest_hi, Operand::Var(t4_hi));
            }
            ArithOp::Shl | ArithOp::Lshr | ArithOp::Ashr => {
                self.lower_shift64(op, src0_lo, src0_hi, src1_lo, dest_lo, dest_hi);
            }
            ArithOp::Udiv | ArithOp::Sdiv | ArithOp::Urem | ArithOp::Srem => {
                unreachable!("i64 division should have become a helper call")
            }
            ArithOp::Fadd | ArithOp::Fsub | ArithOp::Fmul | ArithOp::Fdiv | ArithOp::Frem => {
                unreachable!("float opcode with i64 type")
            }
        }
    }

    fn lower_arithmetic_vector(
        &mut self,
        dest: VarId,
        op: ArithOp,
        src0: Operand,
        mut src1: Operand,
        ty: Type,
    ) {
        if src1.as_mem().is_some() {
            src1 = Operand::Var(self.legalize_to_reg(src1, None));
        }
        let simple = |this: &mut Self, mop: MachineOp| {
            let t = this.make_reg(ty, None);
            this.movp(t, src0);
            this.two_addr(mop, t, src1);
            this.movp(dest, Operand::Var(t));
        };
        match op {
            ArithOp::Add => simple(self, MachineOp::Padd),
            ArithOp::And => simple(self, MachineOp::Pand),
            ArithOp::Or => simple(self, MachineOp::Por),
            ArithOp::Xor => simple(self, MachineOp::Pxor),
            ArithOp::Sub => simple(self, MachineOp::Psub),
            ArithOp::Mul => self.lower_vector_mul(dest, src0, src1, ty),
            ArithOp::Fadd => simple(self, MachineOp::Addps),
            ArithOp::Fsub => simple(self, MachineOp::Subps),
            ArithOp::Fmul => simple(self, MachineOp::Mulps),
            ArithOp::Fdiv => simple(self, MachineOp::Divps),
            ArithOp::Shl
            | ArithOp::Lshr
            | ArithOp::Ashr
            | ArithOp::Udiv
            | ArithOp::Urem
            | ArithOp::Sdiv
            | ArithOp::Srem
            | ArithOp::Frem => {
                unreachable!("vector operation should have been scalarized")
            }
        }
    }

    fn lower_vector_mul(&mut self, dest: VarId, src0: Operand, src1: Operand, ty: Type) {
        let pmull_type_ok = ty == Type::V4I32 || ty == Type::V8I16;
        let pmull_isa_ok = ty == Type::V8I16 || self.config.isa >= InstructionSet::Sse41;
        if pmull_type_ok && pmull_isa_ok {
            let t = self.make_reg(ty, None);
            self.movp(t, src0);
            let rhs = if src0 == src1 { Operand::Var(t) } else { src1 };
            self.pmull(t, rhs);
            self.movp(dest, Operand::Var(t));
        } else if ty == Type::V4I32 {
            // Two pmuludq passes over the even/odd lanes, then shuffle the
            // low halves back into lane order.
            const MASK_1030: i32 = 0x31;
            const MASK_0202: i32 = 0x88;
            const MASK_0213: i32 = 0xd8;
            let t1 = self.make_reg(Type::V4I32, None);
            let t2 = self.make_reg(Type::V4I32, None);
            let t3 = self.make_reg(Type::V4I32, None);
            let t4 = self.make_reg(Type::V4I32, None);
            let m1030 = self.const_i32(MASK_1030);
            let m0202 = self.const_i32(MASK_0202);
            let m0213 = self.const_i32(MASK_0213);
            self.movp(t1, src0);
            self.pshufd(t2, src0, m1030);
            self.pshufd(t3, src1, m1030);
            self.pmuludq(t1, src1);
            self.pmuludq(t2, Operand::Var(t3));
            self.shufps(t1, Operand::Var(t2), m0202);
            self.pshufd(t4, Operand::Var(t1), m0213);
            self.movp(dest, Operand::Var(t4));
        } else {
            unreachable!("v16i8 multiply should have been scalarized")
        }
    }

    fn lower_arithmetic_scalar(
        &mut self,
        iid: InstId,
        dest: VarId,
        op: ArithOp,
        src0: Operand,
        mut src1: Operand,
        ty: Type,
    ) {
        let _ = iid;
        match op {
            ArithOp::Add | ArithOp::And | ArithOp::Or | ArithOp::Xor | ArithOp::Sub => {
                let mop = match op {
                    ArithOp::Add => MachineOp::Add,
                    ArithOp::And => MachineOp::And,
                    ArithOp::Or => MachineOp::Or,
                    ArithOp::Xor => MachineOp::Xor,
                    _ => MachineOp::Sub,
                };
                let t = self.make_reg(ty, None);
                self.mov(t, src0);
                self.two_addr(mop, t, src1);
                self.mov(dest, Operand::Var(t));
            }
            ArithOp::Mul => {
                if let Some(c) = src1.as_const() {
                    if let Constant::Int32(value) = self.cfg.ctx().const_info(c) {
                        if self.optimize_scalar_mul(dest, src0, value) {
                            return;
                        }
                    }
                }
                if ty == Type::I8 {
                    // imul r/m8 demands al.
                    let al = self.reg_eax(Type::I8);
                    let t = self.make_reg(ty, Some(al));
                    self.mov(t, src0);
                    src1 = self.legalize(src1, Legal::REG | Legal::MEM, None);
                    let rhs = if src0 == src1 { Operand::Var(t) } else { src1 };
                    self.imul(t, rhs);
                    self.mov(dest, Operand::Var(t));
                } else if src1.is_const() {
                    let t = self.make_reg(ty, None);
                    self.imul_imm(t, src0, src1);
                    self.mov(dest, Operand::Var(t));
                } else {
                    let t = self.make_reg(ty, None);
                    self.mov(t, src0);
                    let rhs = if src0 == src1 { Operand::Var(t) } else { src1 };
                    self.imul(t, rhs);
                    self.mov(dest, Operand::Var(t));
                }
            }
            ArithOp::Shl | ArithOp::Lshr | ArithOp::Ashr => {
                let t = self.make_reg(ty, None);
                self.mov(t, src0);
                if !src1.is_const() {
                    let cl = self.reg_cl();
                    src1 = Operand::Var(self.copy_to_reg8(src1, Some(cl)));
                }
                match op {
                    ArithOp::Shl => self.shl(t, src1),
                    ArithOp::Lshr => self.shr(t, src1),
                    _ => self.sar(t, src1),
                }
                self.mov(dest, Operand::Var(t));
            }
            ArithOp::Udiv => {
                // div takes no immediate operand.
                src1 = self.legalize(src1, Legal::REG | Legal::MEM, None);
                let eax = self.reg_eax(ty);
                let edx = self.reg_edx(ty);
                let t = self.make_reg(ty, Some(eax));
                self.mov(t, src0);
                let t_edx = self.make_reg(ty, Some(edx));
                let zero = self.const_zero(ty);
                self.mov(t_edx, zero);
                self.m(
                    MachineOp::Div,
                    Some(t),
                    smallvec![Operand::Var(t), src1, Operand::Var(t_edx)],
                );
                self.mov(dest, Operand::Var(t));
            }
            ArithOp::Sdiv => {
                src1 = self.legalize(src1, Legal::REG | Legal::MEM, None);
                let eax = self.reg_eax(ty);
                // For i8 the sign extension lands in ax rather than dl:ah.
                let t_edx = if ty == Type::I8 {
                    self.make_reg(Type::I16, Some(self.reg_eax(Type::I16)))
                } else {
                    self.make_reg(ty, Some(self.reg_edx(ty)))
                };
                let t = self.make_reg(ty, Some(eax));
                self.mov(t, src0);
                self.m(
                    MachineOp::Cbwdq,
                    Some(t_edx),
                    smallvec![Operand::Var(t)],
                );
                self.m(
                    MachineOp::Idiv,
                    Some(t),
                    smallvec![Operand::Var(t), src1, Operand::Var(t_edx)],
                );
                self.mov(dest, Operand::Var(t));
            }
            ArithOp::Urem => {
                src1 = self.legalize(src1, Legal::REG | Legal::MEM, None);
                let eax = self.reg_eax(ty);
                let edx = self.reg_edx(ty);
                let t_edx = self.make_reg(ty, Some(edx));
                let zero = self.const_zero(ty);
                self.mov(t_edx, zero);
                let t = self.make_reg(ty, Some(eax));
                self.mov(t, src0);
                self.m(
                    MachineOp::Div,
                    Some(t_edx),
                    smallvec![Operand::Var(t_edx), src1, Operand::Var(t)],
                );
                self.mov(dest, Operand::Var(t_edx));
            }
            ArithOp::Srem => {
                src1 = self.legalize(src1, Legal::REG | Legal::MEM, None);
                let eax = self.reg_eax(ty);
                let t_edx = if ty == Type::I8 {
                    self.make_reg(Type::I16, Some(self.reg_eax(Type::I16)))
                } else {
                    self.make_reg(ty, Some(self.reg_edx(ty)))
                };
                let t = self.make_reg(ty, Some(eax));
                self.mov(t, src0);
                self.m(
                    MachineOp::Cbwdq,
                    Some(t_edx),
                    smallvec![Operand::Var(t)],
                );
                self.m(
                    MachineOp::Idiv,
                    Some(t_edx),
                    smallvec![Operand::Var(t_edx), src1, Operand::Var(t)],
                );
                self.mov(dest, Operand::Var(t_edx));
            }
            ArithOp::Fadd | ArithOp::Fsub | ArithOp::Fmul | ArithOp::Fdiv => {
                let mop = match op {
                    ArithOp::Fadd => MachineOp::Addss,
                    ArithOp::Fsub => MachineOp::Subss,
                    ArithOp::Fmul => MachineOp::Mulss,
                    _ => MachineOp::Divss,
                };
                let t = self.make_reg(ty, None);
                self.mov(t, src0);
                let rhs = if op == ArithOp::Fmul && src0 == src1 {
                    Operand::Var(t)
                } else {
                    src1
                };
                self.two_addr(mop, t, rhs);
                self.mov(dest, Operand::Var(t));
            }
            ArithOp::Frem => unreachable!("frem should have become a helper call"),
        }
    }

    /// Strength-reduce multiplication by a constant into lea/shl chains.
    /// Multipliers factorable into 9, 5, 3 and powers of two lower into at
    /// most three operations; lea forms apply only to i16/i32.
    fn optimize_scalar_mul(&mut self, dest: VarId, src0: Operand, mut multiplier: i32) -> bool {
        if self.config.opt_level < OptLevel::O2 {
            return false;
        }
        let ty = self.cfg.var(dest).ty;
        if multiplier == -1 {
            let t = self.make_reg(ty, None);
            self.mov(t, src0);
            self.neg(t);
            self.mov(dest, Operand::Var(t));
            return true;
        }
        if multiplier == 0 {
            let zero = self.const_zero(ty);
            self.mov(dest, zero);
            return true;
        }
        if multiplier == 1 {
            let t = self.make_reg(ty, None);
            self.mov(t, src0);
            self.mov(dest, Operand::Var(t));
            return true;
        }
        if multiplier == i32::MIN {
            return false;
        }
        let negative = multiplier < 0;
        if negative {
            multiplier = -multiplier;
        }
        let mut count9 = 0u32;
        let mut count5 = 0u32;
        let mut count3 = 0u32;
        let mut count2 = 0u32;
        let mut count_ops = 0u32;
        while multiplier > 1 {
            if multiplier % 9 == 0 {
                count_ops += 1;
                count9 += 1;
                multiplier /= 9;
            } else if multiplier % 5 == 0 {
                count_ops += 1;
                count5 += 1;
                multiplier /= 5;
            } else if multiplier % 3 == 0 {
                count_ops += 1;
                count3 += 1;
                multiplier /= 3;
            } else if multiplier % 2 == 0 {
                if count2 == 0 {
                    count_ops += 1;
                }
                count2 += 1;
                multiplier /= 2;
            } else {
                return false;
            }
        }
        // lea scaling only works at 16- and 32-bit widths.
        if ty != Type::I16 && ty != Type::I32 && (count3 | count5 | count9) != 0 {
            return false;
        }
        const MAX_OPS_FOR_OPTIMIZED_MUL: u32 = 3;
        if count_ops > MAX_OPS_FOR_OPTIMIZED_MUL {
            return false;
        }
        let t = self.make_reg(ty, None);
        self.mov(t, src0);
        for (count, shift) in [(count9, 3u16), (count5, 2), (count3, 1)] {
            for _ in 0..count {
                let zero = self.cfg.ctx().const_int32(0);
                let mem = MemOperand::with_index(Some(t), Some(zero), Some(t), shift);
                self.lea(t, mem);
            }
        }
        if count2 != 0 {
            let amt = self.const_int(ty, count2 as i64);
            self.shl(t, amt);
        }
        if negative {
            self.neg(t);
        }
        self.mov(dest, Operand::Var(t));
        true
    }

    /// The i64-on-32 shift expansion, bucketed by shift amount.
    fn lower_shift64(
        &mut self,
        op: ArithOp,
        src0_lo: Operand,
        src0_hi: Operand,
        src1_lo: Operand,
        dest_lo: VarId,
        dest_hi: VarId,
    ) {
        let zero = self.const_i32(0);
        let sign_extend = self.const_i32(0x1f);
        let const_amount = src1_lo.as_const().and_then(|c| {
            match self.cfg.ctx().const_info(c) {
                Constant::Int32(v) => Some(v as u32),
                _ => None,
            }
        });
        if let Some(amount) = const_amount {
            if amount > 32 {
                let reduced = self.const_i32(amount as i32 - 32);
                match op {
                    ArithOp::Shl => {
                        let t2 = self.make_reg(Type::I32, None);
                        self.mov(t2, src0_lo);
                        self.shl(t2, reduced);
                        self.mov(dest_hi, Operand::Var(t2));
                        self.mov(dest_lo, zero);
                    }
                    ArithOp::Lshr => {
                        let t2 = self.make_reg(Type::I32, None);
                        self.mov(t2, src0_hi);
                        self.shr(t2, reduced);
                        self.mov(dest_lo, Operand::Var(t2));
                        self.mov(dest_hi, zero);
                    }
                    ArithOp::Ashr => {
                        let t3 = self.make_reg(Type::I32, None);
                        self.mov(t3, src0_hi);
                        self.sar(t3, sign_extend);
                        let t2 = self.make_reg(Type::I32, None);
                        self.mov(t2, src0_hi);
                        self.shrd(t2, t3, reduced);
                        self.mov(dest_lo, Operand::Var(t2));
                        self.mov(dest_hi, Operand::Var(t3));
                    }
                    _ => unreachable!("non-shift opcode"),
                }
            } else if amount == 32 {
                match op {
                    ArithOp::Shl => {
                        let t2 = self.make_reg(Type::I32, None);
                        self.mov(t2, src0_lo);
                        self.mov(dest_hi, Operand::Var(t2));
                        self.mov(dest_lo, zero);
                    }
                    ArithOp::Lshr => {
                        let t2 = self.make_reg(Type::I32, None);
                        self.mov(t2, src0_hi);
                        self.mov(dest_lo, Operand::Var(t2));
                        self.mov(dest_hi, zero);
                    }
                    ArithOp::Ashr => {
                        let t2 = self.make_reg(Type::I32, None);
                        self.mov(t2, src0_hi);
                        self.mov(dest_lo, Operand::Var(t2));
                        let t3 = self.make_reg(Type::I32, None);
                        self.mov(t3, src0_hi);
                        self.sar(t3, sign_extend);
                        self.mov(dest_hi, Operand::Var(t3));
                    }
                    _ => unreachable!("non-shift opcode"),
                }
            } else {
                let amount_op = self.const_i32(amount as i32);
                let t2 = self.make_reg(Type::I32, None);
                self.mov(t2, src0_lo);
                let t3 = self.make_reg(Type::I32, None);
                self.mov(t3, src0_hi);
                match op {
                    ArithOp::Shl => {
                        self.shld(t3, t2, amount_op);
                        self.shl(t2, amount_op);
                    }
                    ArithOp::Lshr => {
                        self.shrd(t2, t3, amount_op);
                        self.shr(t3, amount_op);
                    }
                    ArithOp::Ashr => {
                        self.shrd(t2, t3, amount_op);
                        self.sar(t3, amount_op);
                    }
                    _ => unreachable!("non-shift opcode"),
                }
                self.mov(dest_lo, Operand::Var(t2));
                self.mov(dest_hi, Operand::Var(t3));
            }
        } else {
            // Non-constant amount: shift through cl, then test bit 5 of
            // the amount and patch up the wide-shift case with redefined
            // moves.
            let bit_test = self.const_i32(0x20);
            let label = self.cfg.make_label();
            let cl = self.reg_cl();
            let t1 = self.copy_to_reg8(src1_lo, Some(cl));
            let t2 = self.make_reg(Type::I32, None);
            self.mov(t2, src0_lo);
            let t3 = self.make_reg(Type::I32, None);
            self.mov(t3, src0_hi);
            match op {
                ArithOp::Shl => {
                    self.shld(t3, t2, Operand::Var(t1));
                    self.shl(t2, Operand::Var(t1));
                    self.test(Operand::Var(t1), bit_test);
                    self.br_label(BrCond::E, label);
                    self.mov_redefined(t3, Operand::Var(t2));
                    self.mov_redefined(t2, zero);
                }
                ArithOp::Lshr => {
                    self.shrd(t2, t3, Operand::Var(t1));
                    self.shr(t3, Operand::Var(t1));
                    self.test(Operand::Var(t1), bit_test);
                    self.br_label(BrCond::E, label);
                    self.mov_redefined(t2, Operand::Var(t3));
                    self.mov_redefined(t3, zero);
                }
                ArithOp::Ashr => {
                    self.shrd(t2, t3, Operand::Var(t1));
                    self.sar(t3, Operand::Var(t1));
                    self.test(Operand::Var(t1), bit_test);
                    self.br_label(BrCond::E, label);
                    self.mov_redefined(t2, Operand::Var(t3));
                    // t3 is reassigned through sar, which already reads
                    // it, so no redefined move is needed.
                    self.sar(t3, sign_extend);
                }
                _ => unreachable!("non-shift opcode"),
            }
            self.insert_label(label);
            self.mov(dest_lo, Operand::Var(t2));
            self.mov(dest_hi, Operand::Var(t3));
        }
    }

    // --- Alloca ---

    fn lower_alloca(&mut self, iid: InstId, align: u32) {
        self.needs_stack_alignment = true;
        let dest = self.cfg.inst(iid).dest.expect("alloca without dest");
        let size_op = self.cfg.inst(iid).srcs[0];

        let alignment = align.max(1).max(regs::X86_STACK_ALIGNMENT_BYTES);
        let over_aligned = alignment > regs::X86_STACK_ALIGNMENT_BYTES;
        let use_frame_pointer = self.has_frame_pointer
            || over_aligned
            || !self.cfg.var(dest).is_rematerializable()
            || self.config.opt_level == OptLevel::Om1;
        if use_frame_pointer {
            self.has_frame_pointer = true;
        }

        let word = self.word_type();
        let esp = self.get_physical_register(self.env.stack_reg(), word);
        if over_aligned {
            let mask = self.const_i32(-(alignment as i32));
            self.and(esp, mask);
        }

        let total_size = self.legalize(size_op, Legal::ALL, None);
        if let Some(c) = total_size.as_const() {
            if let Constant::Int32(value) = self.cfg.ctx().const_info(c) {
                let value = (value as u32).div_ceil(alignment) * alignment;
                if !use_frame_pointer {
                    // The dest is rematerializable with a known offset;
                    // no stack adjustment and no assignment needed.
                    debug_assert!(self.cfg.var(dest).is_rematerializable());
                    self.fixed_alloca_bytes += value;
                    self.fake_def(dest, None);
                    return;
                }
                let amt = self.const_i32(value as i32);
                self.sub(esp, amt);
            }
        } else {
            // Dynamic size: round up to the alignment at runtime.
            let t = self.make_reg(Type::I32, None);
            self.mov(t, total_size);
            let a1 = self.const_i32(alignment as i32 - 1);
            self.add(t, a1);
            let a2 = self.const_i32(-(alignment as i32));
            self.and(t, a2);
            self.sub(esp, Operand::Var(t));
        }
        // Skip over the out-args area at the bottom of the frame.
        let out_args = self.max_out_args_bytes;
        if out_args > 0 {
            let t = self.make_reg(Type::I32, None);
            let off = self.cfg.ctx().const_int32(out_args as i32);
            let mem = MemOperand::new(Some(esp), Some(off));
            self.lea(t, mem);
            self.mov(dest, Operand::Var(t));
        } else {
            self.mov(dest, Operand::Var(esp));
        }
    }

    // --- Unreachable / RMW ---

    fn lower_unreachable(&mut self) {
        self.m(MachineOp::Ud2, None, smallvec![]);
    }

    /// Lower a FakeRMW. If the beacon's live range does not end here, the
    /// store survived and the RMW is redundant; otherwise emit the
    /// memory-destination form.
    fn lower_rmw(&mut self, iid: InstId, op: ArithOp) {
        let inst = self.cfg.inst(iid);
        let beacon = inst.srcs[2].as_var().expect("rmw without beacon");
        if !inst.is_last_use(beacon) {
            return;
        }
        let data = inst.srcs[0];
        let addr = inst.srcs[1];
        let ty = self.operand_type(data);
        let addr_mem = self.form_memory_operand(addr, true);
        if !self.config.is_64bit() && ty == Type::I64 {
            let data = self.legalize_undef(data, None);
            let data_lo = self.lo_operand(data);
            let data_hi = self.hi_operand(data);
            let src_lo = self.legalize(data_lo, Legal::REG | Legal::IMM, None);
            let src_hi = self.legalize(data_hi, Legal::REG | Legal::IMM, None);
            let addr_op = Operand::Mem(addr_mem);
            let lo = self.lo_operand(addr_op).as_mem().unwrap();
            let hi = self.hi_operand(addr_op).as_mem().unwrap();
            let (lo_op, hi_op) = match op {
                ArithOp::Add => (MachineOp::AddRmw, MachineOp::AdcRmw),
                ArithOp::Sub => (MachineOp::SubRmw, MachineOp::SbbRmw),
                ArithOp::And => (MachineOp::AndRmw, MachineOp::AndRmw),
                ArithOp::Or => (MachineOp::OrRmw, MachineOp::OrRmw),
                ArithOp::Xor => (MachineOp::XorRmw, MachineOp::XorRmw),
                _ => unreachable!("bad RMW opcode"),
            };
            self.m(lo_op, None, smallvec![src_lo, Operand::Mem(lo)]);
            self.m(hi_op, None, smallvec![src_hi, Operand::Mem(hi)]);
        } else {
            let src = self.legalize(data, Legal::REG | Legal::IMM, None);
            let mop = match op {
                ArithOp::Add => MachineOp::AddRmw,
                ArithOp::Sub => MachineOp::SubRmw,
                ArithOp::And => MachineOp::AndRmw,
                ArithOp::Or => MachineOp::OrRmw,
                ArithOp::Xor => MachineOp::XorRmw,
                _ => unreachable!("bad RMW opcode"),
            };
            self.m(mop, None, smallvec![src, Operand::Mem(addr_mem)]);
        }
    }

    // --- Split-pair setup ---

    /// Attach lo/hi halves to every i64 variable on the 32-bit target.
    pub fn split_i64_variables(&mut self) {
        if self.config.is_64bit() {
            return;
        }
        for v in 0..self.cfg.num_variables() as u32 {
            let id = VarId(v);
            if self.cfg.var(id).ty == Type::I64 && self.cfg.var(id).pair.is_none() {
                self.cfg.split64(id);
            }
        }
    }

    /// A memory reference into a stack slot at a byte offset; used by the
    /// memory-based vector element accesses.
    pub(crate) fn memory_operand_for_stack_slot(
        &mut self,
        slot: VarId,
        offset: u32,
    ) -> MemOperand {
        debug_assert!(self.cfg.var(slot).must_not_have_reg());
        let loc = self.make_reg(self.word_type(), None);
        let mem = MemOperand::new(Some(slot), None);
        self.lea(loc, mem);
        let off = self.cfg.ctx().const_int32(offset as i32);
        MemOperand::new(Some(loc), Some(off))
    }

    pub(crate) fn split_lo(&self, var: VarId) -> Operand {
        Operand::Split {
            var,
            half: SplitHalf::Low,
        }
    }

    pub(crate) fn split_hi(&self, var: VarId) -> Operand {
        Operand::Split {
            var,
            half: SplitHalf::High,
        }
    }
}
