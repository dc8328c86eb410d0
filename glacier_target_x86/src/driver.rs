//! The per-function target driver: pass ordering for the full and the
//! minimal pipelines, the codegen loop, and the regalloc-until-stable
//! protocol.

use glacier_ir::inst::{BrTarget, InstKind, MachineOp};
use glacier_ir::liverange::InstNum;
use glacier_ir::value::NodeId;

use glacier_regalloc::allocator::{LinearScan, SECOND_CHANCE_CAP};
use glacier_regalloc::liveness::{self, LivenessMode};
use glacier_regalloc::RegAllocKind;

use crate::lower::{OptLevel, TargetX86};
use crate::{addressopt, rmw};

impl TargetX86<'_> {
    /// Translate one function. On return either the CFG holds lowered,
    /// register-allocated machine instructions, or `has_error` is set.
    pub fn translate(&mut self) {
        match self.config.opt_level {
            OptLevel::O2 => self.translate_o2(),
            OptLevel::Om1 => self.translate_om1(),
        }
    }

    fn translate_o2(&mut self) {
        self.cfg.compute_edges();
        self.split_i64_variables();

        self.gen_target_helper_calls();
        if self.cfg.has_error() {
            return;
        }

        // Merge constant allocas and lay out their area.
        self.process_allocas(true);

        // Lower phis into predecessor assignments.
        self.cfg.lower_phis_basic();
        if self.cfg.has_error() {
            return;
        }

        // Loop depth feeds the regalloc weights.
        self.cfg.compute_loop_nest_depth();

        addressopt::do_address_opt(self.cfg);

        // RMW runs after address-mode optimization so the rewritten
        // loads and stores are already in canonical form.
        rmw::find_rmw(self.cfg);

        self.lower_arguments();

        // Codegen needs last-use bits for compare/branch fusing and
        // load folding.
        self.cfg.renumber_instructions();
        liveness::compute(self.cfg, LivenessMode::Basic);
        if self.cfg.has_error() {
            return;
        }

        self.do_load_opt();
        self.gen_code();
        if self.cfg.has_error() {
            return;
        }
        log::trace!("after codegen:\n{}", glacier_ir::display::dump_cfg(self.cfg));

        // Full interval liveness, then linear scan until no evictions.
        self.cfg.compute_edges();
        self.cfg.renumber_instructions();
        let lv = liveness::compute(self.cfg, LivenessMode::Intervals);
        if self.cfg.has_error() {
            return;
        }
        self.reg_alloc(RegAllocKind::Global, &lv.kills);
        if self.cfg.has_error() {
            return;
        }

        self.add_prolog_epilog();
        if self.cfg.has_error() {
            return;
        }

        self.optimize_branches();
    }

    fn translate_om1(&mut self) {
        self.cfg.compute_edges();
        self.split_i64_variables();

        self.gen_target_helper_calls();
        if self.cfg.has_error() {
            return;
        }
        self.process_allocas(false);
        self.cfg.lower_phis_basic();
        if self.cfg.has_error() {
            return;
        }
        self.lower_arguments();
        self.gen_code();
        if self.cfg.has_error() {
            return;
        }
        self.cfg.renumber_instructions();
        self.reg_alloc(RegAllocKind::InfOnly, &[]);
        if self.cfg.has_error() {
            return;
        }
        self.add_prolog_epilog();
    }

    /// Per-instruction lowering over every node. Dead instructions (bool
    /// folding producers) convert to deleted as the cursor passes them.
    pub fn gen_code(&mut self) {
        for nid in self.cfg.node_ids() {
            self.folding.init(self.config.arch, self.cfg, nid);
            self.ctx.init(self.cfg, nid);
            while !self.ctx.at_end(self.cfg) {
                let Some(iid) = self.ctx.cur(self.cfg) else {
                    break;
                };
                if self.cfg.inst(iid).is_deleted() {
                    self.ctx.advance_cur(self.cfg);
                    continue;
                }
                if self.cfg.inst(iid).is_dead() {
                    self.cfg.inst_mut(iid).set_deleted();
                    self.ctx.advance_cur(self.cfg);
                    continue;
                }
                self.lower_inst(iid);
                if self.cfg.has_error() {
                    return;
                }
                if self.config.opt_level >= OptLevel::O2 {
                    self.ctx.avail_update(self.cfg);
                }
                self.ctx.advance_cur(self.cfg);
            }
        }
    }

    /// Run the allocator, rerunning with the second-chance variant until
    /// evictions stop or the cap is reached.
    pub fn reg_alloc(&mut self, kind: RegAllocKind, kills: &[InstNum]) {
        let env = self.env;
        let mask = env.allocatable();
        let mut scan = LinearScan::new(&env);
        scan.scan(self.cfg, kind, mask, kills);
        if kind != RegAllocKind::Global {
            return;
        }
        let mut rounds = 0;
        while scan.has_evictions() && rounds < SECOND_CHANCE_CAP {
            log::debug!(
                "{}: {} evictions, rerunning second-chance",
                self.cfg.name,
                scan.num_evictions()
            );
            scan.scan(self.cfg, RegAllocKind::SecondChance, mask, kills);
            rounds += 1;
        }
    }

    /// Minimal branch cleanup: remove jumps to the next node and prefer
    /// fallthrough on the false edge of two-way branches.
    pub fn optimize_branches(&mut self) {
        for nid in self.cfg.node_ids() {
            let next_node = NodeId(nid.0 + 1);
            let ids = self.cfg.node(nid).insts.clone();
            for &iid in ids.iter().rev() {
                if self.cfg.inst(iid).is_deleted() {
                    continue;
                }
                let InstKind::Machine(MachineOp::Br {
                    cond,
                    target,
                    target_else,
                }) = self.cfg.inst(iid).kind.clone()
                else {
                    break;
                };
                match (cond, target, target_else) {
                    // Unconditional jump to the next node: fallthrough.
                    (None, BrTarget::Node(t), None) if t == next_node => {
                        self.cfg.inst_mut(iid).set_deleted();
                    }
                    // Two-way branch whose false side is next: drop it.
                    (Some(c), BrTarget::Node(t), Some(BrTarget::Node(f))) if f == next_node => {
                        self.cfg.inst_mut(iid).kind = InstKind::Machine(MachineOp::Br {
                            cond: Some(c),
                            target: BrTarget::Node(t),
                            target_else: None,
                        });
                    }
                    // Two-way branch whose true side is next: invert.
                    (Some(c), BrTarget::Node(t), Some(BrTarget::Node(f))) if t == next_node => {
                        self.cfg.inst_mut(iid).kind = InstKind::Machine(MachineOp::Br {
                            cond: Some(c.opposite()),
                            target: BrTarget::Node(f),
                            target_else: None,
                        });
                    }
                    _ => {}
                }
                break;
            }
        }
    }
}
