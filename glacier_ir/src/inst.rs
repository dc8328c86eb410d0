//! The unified instruction model.
//!
//! One tagged `InstKind` covers the high-level LLIR opcode set, the fake
//! instructions used for liveness modeling, and the lowered x86 machine
//! ops. Every instruction carries its operands in a uniform source vector
//! plus an optional destination variable, so liveness, folding analysis,
//! and dead-code elimination can walk instructions without knowing their
//! kind.
//!
//! Two-address machine instructions (`add t, src` and friends) list the
//! destination variable again as their first source, which models the
//! read-modify-write register semantics for liveness.

use smallvec::SmallVec;

use crate::cond::{BrCond, CmppsCond, CvtVariant};
use crate::liverange::InstNum;
use crate::operand::Operand;
use crate::value::{LabelId, NodeId, VarId};

/// High-level arithmetic opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    And,
    Or,
    Xor,
    Sub,
    Mul,
    Sdiv,
    Udiv,
    Srem,
    Urem,
    Shl,
    Lshr,
    Ashr,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Frem,
}

impl ArithOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            ArithOp::Add | ArithOp::And | ArithOp::Or | ArithOp::Xor | ArithOp::Mul
                | ArithOp::Fadd | ArithOp::Fmul
        )
    }
}

/// Cast opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    Sext,
    Zext,
    Trunc,
    Fptrunc,
    Fpext,
    Fptosi,
    Fptoui,
    Sitofp,
    Uitofp,
    Bitcast,
}

/// Integer compare conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ICond {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

/// The 16 IEEE floating-point compare conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCond {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    Uno,
    True,
}

impl FCond {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Intrinsic identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    AtomicCmpxchg,
    AtomicFence,
    AtomicFenceAll,
    AtomicIsLockFree,
    AtomicLoad,
    AtomicRmw,
    AtomicStore,
    Bswap,
    Ctpop,
    Ctlz,
    Cttz,
    Fabs,
    Longjmp,
    Memcpy,
    Memmove,
    Memset,
    ReadTp,
    Setjmp,
    Sqrt,
    Stacksave,
    Stackrestore,
    Trap,
}

/// Atomic read-modify-write sub-operations (first argument of the
/// `AtomicRmw` intrinsic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicRmwOp {
    Add = 1,
    Sub = 2,
    And = 3,
    Or = 4,
    Xor = 5,
    Exchange = 6,
}

impl AtomicRmwOp {
    pub fn from_raw(raw: i32) -> Option<AtomicRmwOp> {
        Some(match raw {
            1 => AtomicRmwOp::Add,
            2 => AtomicRmwOp::Sub,
            3 => AtomicRmwOp::And,
            4 => AtomicRmwOp::Or,
            5 => AtomicRmwOp::Xor,
            6 => AtomicRmwOp::Exchange,
            _ => return None,
        })
    }
}

/// C11-style memory orders, as integer arguments to the atomic intrinsics.
pub mod memory_order {
    pub const RELAXED: i32 = 1;
    pub const CONSUME: i32 = 2;
    pub const ACQUIRE: i32 = 3;
    pub const RELEASE: i32 = 4;
    pub const ACQ_REL: i32 = 5;
    pub const SEQ_CST: i32 = 6;
    pub const INVALID: i32 = 0;

    /// The ABI restricts atomics to sequentially-consistent ordering.
    pub fn is_valid(order: i32) -> bool {
        order == SEQ_CST
    }

    pub fn is_valid_pair(success: i32, failure: i32) -> bool {
        is_valid(success) && is_valid(failure)
    }
}

/// A branch target after lowering: a CFG node or a local label inside the
/// current node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrTarget {
    Node(NodeId),
    Label(LabelId),
}

/// Lowered x86 machine opcodes. Operands live in the instruction's uniform
/// source vector; the payload here is only what cannot be an operand
/// (condition codes, branch targets, lock prefixes).
#[derive(Debug, Clone, PartialEq)]
pub enum MachineOp {
    Adc,
    AdcRmw,
    Add,
    AddRmw,
    Addps,
    Addss,
    And,
    AndRmw,
    /// srcs: [dest-as-src, src, xmm0 mask]
    Blendvps,
    Bsf,
    Bsr,
    Bswap,
    /// Machine branch. Unconditional when `cond` is none.
    Br {
        cond: Option<BrCond>,
        target: BrTarget,
        /// Secondary target for two-way conditional branches to nodes.
        target_else: Option<BrTarget>,
    },
    /// srcs: [callee, ...]; dest is the precolored return register if any.
    Call,
    /// cbw/cwd/cdq/cqo: sign-extend eax into edx:eax (width by type).
    Cbwdq,
    Cmov(BrCond),
    Cmp,
    Cmpps(CmppsCond),
    /// srcs: [mem, eax, desired]
    Cmpxchg { locked: bool },
    /// srcs: [mem, edx, eax, ecx, ebx]
    Cmpxchg8b { locked: bool },
    Cvt(CvtVariant),
    /// srcs: [dest-as-src (quotient/remainder coupling), divisor, other half]
    Div,
    Divps,
    Divss,
    Idiv,
    Imul,
    /// Three-operand form: srcs: [src, imm]
    ImulImm,
    Insertps,
    Lea,
    Mfence,
    Mov,
    Movd,
    /// Packed (vector) register move.
    Movp,
    Movq,
    /// Scalar float move into the low lane; reads the untouched high lanes.
    Movss,
    Movsx,
    Movzx,
    /// Widening unsigned multiply: dest = eax, edx modeled by a fake def.
    Mul,
    Mulps,
    Mulss,
    Neg,
    Nop,
    Or,
    OrRmw,
    Padd,
    Pand,
    Pandn,
    Pblendvb,
    Pcmpeq,
    Pcmpgt,
    Pextr,
    Pinsr,
    Pmull,
    Pmuludq,
    Pop,
    Por,
    Pshufd,
    Psll,
    Psra,
    Psrl,
    Psub,
    Push,
    Pxor,
    Ret,
    Rol,
    Sar,
    Sbb,
    SbbRmw,
    Setcc(BrCond),
    Shl,
    Shld,
    Shr,
    Shrd,
    Shufps,
    Sqrtss,
    /// srcs: [value, mem]
    Store,
    Storep,
    Storeq,
    Sub,
    SubRmw,
    Subps,
    Subss,
    Test,
    Ucomiss,
    Ud2,
    /// srcs: [mem, summand]; exchange-and-add.
    Xadd { locked: bool },
    /// srcs: [mem, value]
    Xchg,
    Xor,
    XorRmw,
}

impl MachineOp {
    /// Machine instructions that must never be removed by dead-code
    /// elimination: memory writes, control flow, flag producers consumed by
    /// later branches, and atomics.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            MachineOp::AdcRmw
                | MachineOp::AddRmw
                | MachineOp::AndRmw
                | MachineOp::Br { .. }
                | MachineOp::Call
                | MachineOp::Cmp
                | MachineOp::Cmpps(_)
                | MachineOp::Cmpxchg { .. }
                | MachineOp::Cmpxchg8b { .. }
                | MachineOp::Mfence
                | MachineOp::Nop
                | MachineOp::OrRmw
                | MachineOp::Pop
                | MachineOp::Push
                | MachineOp::Ret
                | MachineOp::SbbRmw
                | MachineOp::Store
                | MachineOp::Storep
                | MachineOp::Storeq
                | MachineOp::SubRmw
                | MachineOp::Test
                | MachineOp::Ucomiss
                | MachineOp::Ud2
                | MachineOp::Xadd { .. }
                | MachineOp::Xchg
                | MachineOp::XorRmw
        )
    }
}

/// The instruction kind: LLIR opcodes, fake instructions, and machine ops.
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// srcs: [size]; alignment in the payload.
    Alloca {
        align: u32,
        /// Set once alloca processing has given the result a fixed frame
        /// offset, making the dest rematerializable.
        known_frame_offset: bool,
    },
    /// srcs: [a, b]
    Arithmetic(ArithOp),
    /// srcs: [src]
    Assign,
    /// Conditional (srcs: [cond]) or unconditional (no srcs) branch.
    Br {
        target_true: NodeId,
        target_false: Option<NodeId>,
    },
    /// srcs: [callee, args...]
    Call,
    /// srcs: [src]
    Cast(CastOp),
    /// srcs: [vector, index]
    ExtractElement,
    /// srcs: [a, b]
    Fcmp(FCond),
    /// srcs: [a, b]
    Icmp(ICond),
    /// srcs: [vector, element, index]
    InsertElement,
    /// srcs: intrinsic arguments
    IntrinsicCall(Intrinsic),
    /// srcs: [addr]
    Load,
    /// srcs[i] is the value flowing in from `preds[i]`.
    Phi { preds: SmallVec<[NodeId; 4]> },
    /// srcs: [value] or empty
    Ret,
    /// srcs: [cond, true_value, false_value]
    Select,
    /// srcs: [data, addr] plus an optional RMW beacon as srcs[2].
    Store,
    Unreachable,
    /// Definition without a real computation; an optional source models a
    /// dependency (e.g. edx defined alongside eax by `mul`).
    FakeDef,
    /// Keeps its sources alive without emitting anything.
    FakeUse,
    /// Read-modify-write marker inserted before a store; lowered to a
    /// memory-destination op only if the store is dead-code eliminated.
    /// srcs: [data, addr, beacon]
    FakeRmw { op: ArithOp },
    /// Local label inside a node, for lowering-introduced control flow.
    Label(LabelId),
    /// A lowered x86 instruction.
    Machine(MachineOp),
}

/// An instruction: kind plus the uniform operand record.
#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    pub dest: Option<VarId>,
    pub srcs: SmallVec<[Operand; 4]>,
    /// Assigned by renumbering; even and increasing within a function.
    pub number: InstNum,
    deleted: bool,
    dead: bool,
    /// Suppresses the liveness interference of a destination that is
    /// reassigned inside one node due to internally generated branches.
    dest_redefined: bool,
    /// Bit i set means the variable at source position i ends its live
    /// range here. Filled by liveness.
    live_ranges_ended: u64,
}

impl Inst {
    pub fn new(kind: InstKind, dest: Option<VarId>, srcs: SmallVec<[Operand; 4]>) -> Self {
        Self {
            kind,
            dest,
            srcs,
            number: -1,
            deleted: false,
            dead: false,
            dest_redefined: false,
            live_ranges_ended: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Remove the instruction from all later processing and emission.
    pub fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Mark for later dead-code elimination while leaving the instruction
    /// walkable, so peepholes can still inspect it.
    pub fn set_dead(&mut self) {
        self.dead = true;
    }

    pub fn is_dest_redefined(&self) -> bool {
        self.dest_redefined
    }

    pub fn set_dest_redefined(&mut self) {
        self.dest_redefined = true;
    }

    /// Whether the given variable appears as a source whose live range ends
    /// at this instruction.
    pub fn is_last_use(&self, var: VarId) -> bool {
        if self.live_ranges_ended == 0 {
            return false;
        }
        self.srcs.iter().enumerate().any(|(i, src)| {
            matches!(src, Operand::Var(v) if *v == var) && self.live_ranges_ended & (1 << i) != 0
        })
    }

    pub fn clear_live_ranges_ended(&mut self) {
        self.live_ranges_ended = 0;
    }

    pub fn set_last_use(&mut self, src_index: usize) {
        if src_index < 64 {
            self.live_ranges_ended |= 1 << src_index;
        }
    }

    /// Recompute the last-use bits from two instructions this one replaces,
    /// used when fusing (e.g. folding a load into its consumer).
    pub fn splice_liveness_info(&mut self, replaced: &Inst, also: &Inst) {
        self.live_ranges_ended = 0;
        for (i, src) in self.srcs.iter().enumerate() {
            if let Operand::Var(v) = src {
                if replaced.is_last_use(*v) || also.is_last_use(*v) {
                    if i < 64 {
                        self.live_ranges_ended |= 1 << i;
                    }
                }
            }
        }
    }

    /// Source operand positions holding variables, with their index.
    pub fn var_srcs(&self) -> impl Iterator<Item = (usize, VarId)> + '_ {
        self.srcs.iter().enumerate().filter_map(|(i, s)| match s {
            Operand::Var(v) => Some((i, *v)),
            _ => None,
        })
    }

    /// Every variable read by this instruction, including memory-operand
    /// base/index registers and split halves.
    pub fn vars_read(&self) -> SmallVec<[VarId; 4]> {
        let mut out = SmallVec::new();
        for src in &self.srcs {
            match src {
                Operand::Var(v) => out.push(*v),
                Operand::Mem(m) => {
                    if let Some(b) = m.base {
                        out.push(b);
                    }
                    if let Some(i) = m.index {
                        out.push(i);
                    }
                }
                Operand::Split { var, .. } => out.push(*var),
                Operand::Const(_) => {}
            }
        }
        out
    }

    /// Whether removing the instruction would change observable behavior.
    /// A store that acquired a destination through the RMW transform is
    /// deliberately eligible for elimination.
    pub fn has_side_effects(&self) -> bool {
        match &self.kind {
            InstKind::Br { .. }
            | InstKind::Call
            | InstKind::IntrinsicCall(_)
            | InstKind::Ret
            | InstKind::Unreachable
            | InstKind::FakeUse
            | InstKind::FakeRmw { .. }
            | InstKind::Label(_) => true,
            InstKind::Store => self.dest.is_none(),
            InstKind::Machine(op) => op.has_side_effects(),
            _ => false,
        }
    }

    /// Terminators end a node's instruction list.
    pub fn is_terminator(&self) -> bool {
        match &self.kind {
            InstKind::Br { .. } | InstKind::Ret | InstKind::Unreachable => true,
            InstKind::Machine(MachineOp::Ret | MachineOp::Ud2) => true,
            InstKind::Machine(MachineOp::Br { target, target_else, .. }) => {
                // Branches to local labels stay inside the node.
                matches!(target, BrTarget::Node(_))
                    || matches!(target_else, Some(BrTarget::Node(_)))
            }
            _ => false,
        }
    }

    /// The CFG successors named by a (high-level or machine) branch.
    pub fn branch_targets(&self) -> SmallVec<[NodeId; 2]> {
        let mut out = SmallVec::new();
        match &self.kind {
            InstKind::Br {
                target_true,
                target_false,
            } => {
                out.push(*target_true);
                if let Some(f) = target_false {
                    out.push(*f);
                }
            }
            InstKind::Machine(MachineOp::Br {
                target,
                target_else,
                ..
            }) => {
                if let BrTarget::Node(n) = target {
                    out.push(*n);
                }
                if let Some(BrTarget::Node(n)) = target_else {
                    out.push(*n);
                }
            }
            _ => {}
        }
        out
    }

    /// Whether this is a lowered call (used to collect the kill points of
    /// the scratch register set).
    pub fn is_machine_call(&self) -> bool {
        matches!(self.kind, InstKind::Machine(MachineOp::Call))
    }
}
