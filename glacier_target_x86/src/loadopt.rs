//! Load folding: merging a load into the next instruction when that
//! instruction is the single last use of the loaded value.
//!
//! The load's memory operand replaces the matching source of the
//! consumer; both originals are deleted and the fused instruction takes
//! over their liveness info.

use glacier_ir::inst::{memory_order, Inst, InstKind, Intrinsic};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::VarId;

use crate::lower::TargetX86;

/// Replace the matching source with the load's memory operand, as long
/// as exactly one source matches.
fn fold_into_sources(
    srcs: &mut [Operand],
    a: usize,
    b: usize,
    load_dest: VarId,
    load_src: Operand,
) -> bool {
    let dv = Operand::Var(load_dest);
    if srcs[a] == dv && srcs[b] != dv {
        srcs[a] = load_src;
        return true;
    }
    if srcs[a] != dv && srcs[b] == dv {
        srcs[b] = load_src;
        return true;
    }
    false
}

impl TargetX86<'_> {
    /// Run load folding over the whole function.
    pub fn do_load_opt(&mut self) {
        for nid in self.cfg.node_ids() {
            self.ctx.init(self.cfg, nid);
            while !self.ctx.at_end(self.cfg) {
                let Some(cur) = self.ctx.cur(self.cfg) else {
                    break;
                };
                let mut load_dest: Option<VarId> = None;
                let mut load_src: Option<Operand> = None;
                if matches!(self.cfg.inst(cur).kind, InstKind::Load) {
                    // A plain load always qualifies.
                    let dest = self.cfg.inst(cur).dest.expect("load without dest");
                    let addr = self.cfg.inst(cur).srcs[0];
                    load_dest = Some(dest);
                    load_src = Some(Operand::Mem(self.form_memory_operand(addr, false)));
                } else if matches!(
                    self.cfg.inst(cur).kind,
                    InstKind::IntrinsicCall(Intrinsic::AtomicLoad)
                ) {
                    // An atomic load qualifies when its ordering is valid
                    // and it lowers to a single load (not i64 on the
                    // 32-bit target).
                    let dest = self.cfg.inst(cur).dest.expect("atomic load without dest");
                    let order = self.cfg.inst(cur).srcs[1]
                        .as_const()
                        .map(|c| match self.cfg.ctx().const_info(c) {
                            glacier_ir::Constant::Int32(v) => v,
                            _ => memory_order::INVALID,
                        })
                        .unwrap_or(memory_order::INVALID);
                    let ok = (self.config.is_64bit() || self.cfg.var(dest).ty != Type::I64)
                        && memory_order::is_valid(order);
                    if ok {
                        let addr = self.cfg.inst(cur).srcs[0];
                        load_dest = Some(dest);
                        load_src = Some(Operand::Mem(self.form_memory_operand(addr, false)));
                    }
                }

                if let (Some(dest), Some(src)) = (load_dest, load_src) {
                    if let Some(next) = self.ctx.next_inst(self.cfg) {
                        if self.cfg.inst(next).is_last_use(dest) {
                            if let Some(new_inst) = self.build_folded(next, dest, src) {
                                let mut new_inst = new_inst;
                                {
                                    let next_ref = self.cfg.inst(next);
                                    let cur_ref = self.cfg.inst(cur);
                                    new_inst.splice_liveness_info(next_ref, cur_ref);
                                }
                                self.cfg.inst_mut(cur).set_deleted();
                                self.cfg.inst_mut(next).set_deleted();
                                self.ctx.insert(self.cfg, new_inst);
                                log::debug!(
                                    "{}: folded load {} into {}",
                                    self.cfg.name,
                                    cur.0,
                                    next.0
                                );
                            }
                        }
                    }
                }
                self.ctx.advance_cur(self.cfg);
            }
        }
    }

    /// The folded replacement for `next`, if its shape allows folding.
    fn build_folded(&self, next: glacier_ir::InstId, dest: VarId, src: Operand) -> Option<Inst> {
        let inst = self.cfg.inst(next);
        let mut srcs = inst.srcs.clone();
        let folded = match inst.kind {
            InstKind::Arithmetic(_) | InstKind::Icmp(_) | InstKind::Fcmp(_) => {
                fold_into_sources(&mut srcs, 0, 1, dest, src)
            }
            InstKind::Select => fold_into_sources(&mut srcs, 1, 2, dest, src),
            InstKind::Cast(_) => {
                // The load dest can always fold into a cast.
                if srcs[0] == Operand::Var(dest) {
                    srcs[0] = src;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if !folded {
            return None;
        }
        Some(Inst::new(inst.kind.clone(), inst.dest, srcs))
    }
}
