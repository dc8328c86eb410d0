//! Bool folding: finding i1 producers that can be folded into their
//! consumer's lowering.
//!
//! The x86 backend can emit compare+branch or compare+conditional-move
//! pairs that share the flags register; folding an eligible producer into
//! its consumer eliminates the materialization of the i1 value.

use std::collections::HashMap;

use glacier_ir::cfg::Cfg;
use glacier_ir::inst::{ArithOp, InstKind};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::{InstId, NodeId};

use crate::regs::TargetArch;
use crate::tables;

/// Kinds of instruction that can produce a foldable i1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    None,
    /// An integer compare with a single-compare lowering.
    IcmpNative,
    /// A 64-bit integer compare on the 32-bit target.
    Icmp64,
    Fcmp,
    /// A flag-setting And/Or.
    Arith,
}

/// Kinds of instruction that can consume a folded producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    None,
    Br,
    Select,
}

#[derive(Debug)]
struct Entry {
    inst: Option<InstId>,
    is_complex: bool,
    is_live_out: bool,
    num_uses: u32,
}

/// Per-node producer map, rebuilt by `init` at the start of each node's
/// lowering.
#[derive(Debug, Default)]
pub struct BoolFolding {
    producers: HashMap<u32, Entry>,
}

pub fn producer_kind(arch: TargetArch, cfg: &Cfg, inst: InstId) -> ProducerKind {
    let inst = cfg.inst(inst);
    match &inst.kind {
        InstKind::Icmp(_) => {
            let src_ty = operand_type(cfg, inst.srcs[0]);
            if arch.is_64bit() || src_ty != Type::I64 {
                ProducerKind::IcmpNative
            } else {
                ProducerKind::Icmp64
            }
        }
        InstKind::Fcmp(_) => ProducerKind::Fcmp,
        InstKind::Arithmetic(op) => {
            let src_ty = operand_type(cfg, inst.srcs[0]);
            if !arch.is_64bit() && src_ty == Type::I64 {
                return ProducerKind::None;
            }
            match op {
                ArithOp::And | ArithOp::Or => ProducerKind::Arith,
                _ => ProducerKind::None,
            }
        }
        // The cast producer kinds are disabled.
        _ => ProducerKind::None,
    }
}

fn consumer_kind(cfg: &Cfg, inst: InstId) -> ConsumerKind {
    match cfg.inst(inst).kind {
        InstKind::Br { .. } => ConsumerKind::Br,
        InstKind::Select => ConsumerKind::Select,
        // The cast consumer kinds are disabled.
        _ => ConsumerKind::None,
    }
}

fn operand_type(cfg: &Cfg, op: Operand) -> Type {
    match op {
        Operand::Var(v) => cfg.var(v).ty,
        Operand::Const(c) => cfg.ctx().const_info(c).ty(),
        Operand::Mem(_) => Type::I32,
        Operand::Split { .. } => Type::I32,
    }
}

/// Whether the producer's lowering needs more than one conditional
/// branch. Complex producers fold into at most one consumer, since
/// folding then duplicates branches.
fn has_complex_lowering(arch: TargetArch, cfg: &Cfg, inst: InstId) -> bool {
    match producer_kind(arch, cfg, inst) {
        ProducerKind::Icmp64 => true,
        ProducerKind::Fcmp => {
            let InstKind::Fcmp(cond) = cfg.inst(inst).kind else {
                unreachable!();
            };
            tables::fcmp_is_complex(cond)
        }
        _ => false,
    }
}

impl BoolFolding {
    /// Analyze one node. Producers that survive are marked dead (not
    /// deleted), so later peepholes can still inspect them.
    pub fn init(&mut self, arch: TargetArch, cfg: &mut Cfg, node: NodeId) {
        self.producers.clear();
        let ids = cfg.node(node).insts.clone();
        for &iid in &ids {
            let inst = cfg.inst(iid);
            if inst.is_deleted() {
                continue;
            }
            // Record valid producers: an i1 destination of a whitelisted
            // kind.
            if let Some(dest) = inst.dest {
                if cfg.var(dest).ty == Type::I1
                    && producer_kind(arch, cfg, iid) != ProducerKind::None
                {
                    self.producers.insert(
                        dest.0,
                        Entry {
                            inst: Some(iid),
                            is_complex: has_complex_lowering(arch, cfg, iid),
                            is_live_out: true,
                            num_uses: 0,
                        },
                    );
                }
            }
            // Check each source variable against the map.
            let inst = cfg.inst(iid);
            let uses: Vec<(usize, glacier_ir::value::VarId)> = inst.var_srcs().collect();
            for (pos, var) in uses {
                let Some(entry) = self.producers.get(&var.0) else {
                    continue;
                };
                let Some(producer) = entry.inst else {
                    continue;
                };
                let invalid =
                    // All valid consumers use the value as the first source.
                    pos != 0
                    || consumer_kind(cfg, iid) == ConsumerKind::None
                    // Only a natively-lowered icmp may fold into anything
                    // other than a branch.
                    || (consumer_kind(cfg, iid) != ConsumerKind::Br
                        && producer_kind(arch, cfg, producer) != ProducerKind::IcmpNative)
                    // A complex producer cannot be multi-use.
                    || (entry.is_complex && entry.num_uses > 0);
                let is_last_use = cfg.inst(iid).is_last_use(var);
                let entry = self.producers.get_mut(&var.0).unwrap();
                if invalid {
                    entry.inst = None;
                    continue;
                }
                entry.num_uses += 1;
                if is_last_use {
                    entry.is_live_out = false;
                }
            }
        }
        // Disable producers that may be live beyond this node, then mark
        // the remaining producers dead.
        for entry in self.producers.values_mut() {
            if entry.inst.is_some() && entry.is_live_out {
                entry.inst = None;
            }
        }
        for entry in self.producers.values() {
            if let Some(iid) = entry.inst {
                log::trace!("foldable producer at inst {}", iid.0);
                cfg.inst_mut(iid).set_dead();
            }
        }
    }

    /// The producer instruction foldable into a consumer of `op`, if any.
    pub fn producer_for(&self, op: Operand) -> Option<InstId> {
        let var = op.as_var()?;
        self.producers.get(&var.0)?.inst
    }
}
