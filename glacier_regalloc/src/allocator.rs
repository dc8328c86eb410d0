//! Linear-scan register allocation with live intervals, precoloring,
//! aliasing, eviction, and a second-chance rerun protocol.
//!
//! The allocator processes variables in order of increasing live-range
//! start. Precolored variables pass through with their fixed register;
//! everyone else tries, in order: the register of their single copy
//! source, any free register, and finally eviction of cheaper occupants.
//! An infinite-weight variable that cannot evict anything steals a
//! register by spilling its value around the variable's range.
//!
//! Registers are tracked through alias families: assigning `al` also
//! occupies `ax` and `eax`, and vice versa.

use std::collections::HashSet;

use glacier_ir::cfg::Cfg;
use glacier_ir::inst::{Inst, InstKind, MachineOp};
use glacier_ir::liverange::InstNum;
use glacier_ir::metadata::VariablesMetadata;
use glacier_ir::operand::Operand;
use glacier_ir::value::{NodeId, RegNum, VarId};
use glacier_ir::variable::RegWeight;

use crate::{RegAllocEnv, RegAllocKind, RegSet};

/// Cap on second-chance reruns; reaching it leaves residual evictions.
pub const SECOND_CHANCE_CAP: u32 = 10;

/// The linear-scan allocator. One instance is reused across reruns so the
/// second-chance variant can see the previous round's evictees.
pub struct LinearScan<'e, E: RegAllocEnv> {
    env: &'e E,
    unhandled: Vec<VarId>,
    /// Subset of `unhandled` that is precolored, kept in the same order
    /// for the overlap filtering step.
    unhandled_precolored: Vec<VarId>,
    active: Vec<VarId>,
    inactive: Vec<VarId>,
    handled: Vec<VarId>,
    evicted: Vec<VarId>,
    /// Number of live ranges currently assigned to each register. Can
    /// exceed one through AllowOverlap inference and spill/fill stealing.
    reg_uses: Vec<i32>,
    /// In-progress assignments; written back to the CFG at finalization.
    tmp_reg: Vec<Option<RegNum>>,
    /// Call-clobber points from liveness.
    kills: Vec<InstNum>,
    /// Evictees of the previous round, retried at infinite priority by
    /// the second-chance variant.
    boosted: HashSet<VarId>,
    /// Everything that entered the queue this round.
    entered: Vec<VarId>,
}

impl<'e, E: RegAllocEnv> LinearScan<'e, E> {
    pub fn new(env: &'e E) -> Self {
        Self {
            env,
            unhandled: Vec::new(),
            unhandled_precolored: Vec::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            handled: Vec::new(),
            evicted: Vec::new(),
            reg_uses: Vec::new(),
            tmp_reg: Vec::new(),
            kills: Vec::new(),
            boosted: HashSet::new(),
            entered: Vec::new(),
        }
    }

    pub fn has_evictions(&self) -> bool {
        !self.evicted.is_empty()
    }

    pub fn num_evictions(&self) -> usize {
        self.evicted.len()
    }

    fn weight_of(&self, cfg: &Cfg, v: VarId) -> RegWeight {
        if self.boosted.contains(&v) {
            RegWeight::INF
        } else {
            cfg.var(v).weight()
        }
    }

    fn sort_queue(&mut self, cfg: &Cfg) {
        // Highest priority (smallest start, then larger weight, then
        // smaller index) sorts to the back, where the scan loop pops.
        let mut queue = std::mem::take(&mut self.unhandled);
        let mut pre = std::mem::take(&mut self.unhandled_precolored);
        {
            let start = |v: VarId| cfg.var(v).live_range.start();
            let cmp = |a: &VarId, b: &VarId| {
                start(*b)
                    .cmp(&start(*a))
                    .then_with(|| self.weight_of(cfg, *a).cmp(&self.weight_of(cfg, *b)))
                    .then_with(|| b.0.cmp(&a.0))
            };
            queue.sort_by(|a, b| cmp(a, b));
            pre.sort_by(|a, b| cmp(a, b));
        }
        self.unhandled = queue;
        self.unhandled_precolored = pre;
    }

    fn init(&mut self, cfg: &mut Cfg, kind: RegAllocKind, kills: &[InstNum]) {
        self.unhandled.clear();
        self.unhandled_precolored.clear();
        self.active.clear();
        self.inactive.clear();
        self.handled.clear();
        self.reg_uses = vec![0; self.env.num_regs()];
        self.tmp_reg = vec![None; cfg.num_variables()];
        self.kills = kills.to_vec();
        self.kills.sort_unstable();

        match kind {
            RegAllocKind::Global => {
                self.boosted.clear();
                self.evicted.clear();
                for v in 0..cfg.num_variables() as u32 {
                    let id = VarId(v);
                    let var = cfg.var(id);
                    if var.live_range.is_empty()
                        || var.ignore_liveness()
                        || var.must_not_have_reg()
                    {
                        continue;
                    }
                    self.unhandled.push(id);
                    if var.has_reg() {
                        self.tmp_reg[id.index()] = var.reg_num();
                        self.unhandled_precolored.push(id);
                    }
                }
            }
            RegAllocKind::InfOnly => {
                self.boosted.clear();
                self.evicted.clear();
                synthesize_inf_ranges(cfg);
                for v in 0..cfg.num_variables() as u32 {
                    let id = VarId(v);
                    let var = cfg.var(id);
                    if var.live_range.is_empty() || var.ignore_liveness() {
                        continue;
                    }
                    if !var.must_have_reg() && !var.has_reg() {
                        continue;
                    }
                    self.unhandled.push(id);
                    if var.has_reg() {
                        self.tmp_reg[id.index()] = var.reg_num();
                        self.unhandled_precolored.push(id);
                    }
                }
            }
            RegAllocKind::SecondChance => {
                // Survivor assignments become seeds; last round's evictees
                // are retried first, at infinite priority.
                self.boosted = self.evicted.iter().copied().collect();
                for &v in &self.evicted {
                    cfg.var_mut(v).clear_reg_num();
                }
                self.evicted.clear();
                for v in 0..cfg.num_variables() as u32 {
                    let id = VarId(v);
                    let var = cfg.var(id);
                    if var.live_range.is_empty()
                        || var.ignore_liveness()
                        || var.must_not_have_reg()
                    {
                        continue;
                    }
                    self.unhandled.push(id);
                    if var.has_reg() {
                        self.tmp_reg[id.index()] = var.reg_num();
                        self.unhandled_precolored.push(id);
                    }
                }
            }
        }
        self.entered = self.unhandled.clone();
        self.sort_queue(cfg);
    }

    /// Run the scan and write final assignments into the CFG.
    pub fn scan(&mut self, cfg: &mut Cfg, kind: RegAllocKind, reg_mask: RegSet, kills: &[InstNum]) {
        self.init(cfg, kind, kills);
        let md = VariablesMetadata::init(cfg);

        while let Some(cur) = self.unhandled.pop() {
            if self.unhandled_precolored.last() == Some(&cur) {
                self.unhandled_precolored.pop();
            }
            let cur_start = cfg.var(cur).live_range.start();
            self.handle_active_expired_or_inactive(cfg, cur_start);
            self.handle_inactive_expired_or_reactivated(cfg, cur_start);

            // Precolored pass-through.
            if cfg.var(cur).has_reg() {
                let reg = cfg.var(cur).reg_num().unwrap();
                self.inc_uses(reg);
                self.active.push(cur);
                log::trace!("precolored {} -> r{}", cur, reg.0);
                continue;
            }

            let var = cfg.var(cur);
            let var_mask = reg_mask & self.env.regs_for(var.ty, var.reg_class);

            // Register preference from a single-definition copy.
            let (mut prefer, mut allow_overlap) = self.find_register_preference(cfg, &md, cur);

            // `forbidden` filters free allocation: inactive ranges
            // overlapping Cur, precolored unhandled ranges overlapping
            // Cur, and the scratch set when Cur spans a call.
            // `forbidden_inf` is the subset that can never be freed by
            // eviction (precolored conflicts and call clobbers).
            let mut forbidden = RegSet::EMPTY;
            let mut forbidden_inf = RegSet::EMPTY;
            for &v in &self.inactive {
                if self.ranges_overlap(cfg, v, cur) {
                    if let Some(r) = self.tmp_reg[v.index()] {
                        forbidden |= self.env.aliases(r);
                    }
                }
            }
            for &p in &self.unhandled_precolored {
                if self.ranges_overlap(cfg, p, cur) {
                    let pr = cfg.var(p).reg_num().unwrap();
                    let al = self.env.aliases(pr);
                    forbidden |= al;
                    forbidden_inf |= al;
                    if let Some(pref) = prefer {
                        if allow_overlap && al.contains(pref) {
                            allow_overlap = false;
                        }
                    }
                }
            }
            if self.spans_kill(cfg, cur) {
                forbidden |= self.env.scratch_regs();
                forbidden_inf |= self.env.scratch_regs();
                if let Some(pref) = prefer {
                    if self.env.scratch_regs().contains(pref) {
                        prefer = None;
                    }
                }
            }

            let mut free = var_mask & !forbidden;
            for r in var_mask.iter() {
                if self.reg_uses[r.index()] > 0 {
                    free.remove(r);
                }
            }

            // Try the preference.
            if let Some(pref) = prefer {
                let overlap_ok =
                    allow_overlap && var_mask.contains(pref) && !forbidden.contains(pref);
                if free.contains(pref) || overlap_ok {
                    self.assign(cfg, cur, pref);
                    log::trace!("preferred {} -> r{}", cur, pref.0);
                    continue;
                }
            }

            // Per-register weights over Active plus overlapping Inactive.
            let weights = self.register_weights(cfg, cur, var_mask, forbidden_inf);

            if !free.is_empty() {
                let choice = free
                    .iter()
                    .min_by_key(|r| (weights[r.index()], r.0))
                    .unwrap();
                self.assign(cfg, cur, choice);
                log::trace!("free {} -> r{}", cur, choice.0);
                continue;
            }

            self.handle_no_free_registers(cfg, cur, var_mask, weights);
        }

        self.assign_final_registers(cfg, kind);
        log::debug!(
            "regalloc({:?}) for {}: {} evictions",
            kind,
            cfg.name,
            self.evicted.len()
        );
    }

    // --- Scan steps ---

    fn handle_active_expired_or_inactive(&mut self, cfg: &Cfg, cur_start: InstNum) {
        for i in (0..self.active.len()).rev() {
            let v = self.active[i];
            let range = &cfg.var(v).live_range;
            if range.end() <= cur_start {
                self.free_reg_of(v);
                self.active.swap_remove(i);
                self.handled.push(v);
            } else if !range.contains_value(cur_start) {
                // A hole in the range: temporarily release the register.
                self.free_reg_of(v);
                self.active.swap_remove(i);
                self.inactive.push(v);
            }
        }
    }

    fn handle_inactive_expired_or_reactivated(&mut self, cfg: &Cfg, cur_start: InstNum) {
        for i in (0..self.inactive.len()).rev() {
            let v = self.inactive[i];
            let range = &cfg.var(v).live_range;
            if range.end() <= cur_start {
                self.inactive.swap_remove(i);
                self.handled.push(v);
            } else if range.contains_value(cur_start) {
                if let Some(r) = self.tmp_reg[v.index()] {
                    self.inc_uses(r);
                }
                self.inactive.swap_remove(i);
                self.active.push(v);
            }
        }
    }

    fn find_register_preference(
        &self,
        cfg: &Cfg,
        md: &VariablesMetadata,
        cur: VarId,
    ) -> (Option<RegNum>, bool) {
        let Some(def) = md.single_definition(cur) else {
            return (None, false);
        };
        let inst = cfg.inst(def);
        let is_copy = matches!(inst.kind, InstKind::Assign | InstKind::Machine(MachineOp::Mov));
        if !is_copy || inst.srcs.len() != 1 {
            return (None, false);
        }
        let Some(src) = inst.srcs[0].as_var() else {
            return (None, false);
        };
        let Some(reg) = self.tmp_reg[src.index()] else {
            return (None, false);
        };
        let src_range = &cfg.var(src).live_range;
        let cur_range = &cfg.var(cur).live_range;
        let allow_overlap = !src_range.overlaps(cur_range, false, 0)
            || src_range.overlaps_at_exactly_one_point(cur_range);
        (Some(reg), allow_overlap)
    }

    fn register_weights(
        &self,
        cfg: &Cfg,
        cur: VarId,
        var_mask: RegSet,
        forbidden_inf: RegSet,
    ) -> Vec<RegWeight> {
        let mut weights = vec![RegWeight::ZERO; self.env.num_regs()];
        let mut add = |set: RegSet, w: RegWeight, weights: &mut Vec<RegWeight>| {
            for r in (set & var_mask).iter() {
                weights[r.index()].add(w);
            }
        };
        for &v in &self.active {
            if let Some(r) = self.tmp_reg[v.index()] {
                add(self.env.aliases(r), self.weight_of(cfg, v), &mut weights);
            }
        }
        for &v in &self.inactive {
            if self.ranges_overlap(cfg, v, cur) {
                if let Some(r) = self.tmp_reg[v.index()] {
                    add(self.env.aliases(r), self.weight_of(cfg, v), &mut weights);
                }
            }
        }
        // Precolored and call-crossing conflicts can never be evicted.
        for r in (forbidden_inf & var_mask).iter() {
            weights[r.index()] = RegWeight::INF;
        }
        weights
    }

    fn handle_no_free_registers(
        &mut self,
        cfg: &mut Cfg,
        cur: VarId,
        var_mask: RegSet,
        weights: Vec<RegWeight>,
    ) {
        let Some(best) = var_mask.iter().min_by_key(|r| (weights[r.index()], r.0)) else {
            // No register of the right class is allocatable at all.
            assert!(
                !self.weight_of(cfg, cur).is_inf(),
                "infinite-weight {} has an empty register mask",
                cur
            );
            self.handled.push(cur);
            return;
        };
        let cur_weight = self.weight_of(cfg, cur);
        if cur_weight > weights[best.index()] {
            // Evict everything pinning the chosen register.
            for i in (0..self.active.len()).rev() {
                let v = self.active[i];
                let Some(r) = self.tmp_reg[v.index()] else {
                    continue;
                };
                if self.env.aliases(r).contains(best) {
                    self.free_reg_of(v);
                    self.tmp_reg[v.index()] = None;
                    self.active.swap_remove(i);
                    self.evicted.push(v);
                    self.requeue(cfg, v);
                    log::trace!("evicted {} from r{}", v, r.0);
                }
            }
            for i in (0..self.inactive.len()).rev() {
                let v = self.inactive[i];
                if !self.ranges_overlap(cfg, v, cur) {
                    continue;
                }
                let Some(r) = self.tmp_reg[v.index()] else {
                    continue;
                };
                if self.env.aliases(r).contains(best) {
                    self.tmp_reg[v.index()] = None;
                    self.inactive.swap_remove(i);
                    self.evicted.push(v);
                    self.requeue(cfg, v);
                    log::trace!("evicted inactive {} from r{}", v, r.0);
                }
            }
            self.assign(cfg, cur, best);
        } else if cur_weight.is_inf() {
            self.add_spill_fill(cfg, cur, var_mask);
        } else {
            // Not worth a register: stays on the stack.
            self.handled.push(cur);
        }
    }

    /// Free a register for infinite-weight `cur` by parking an unrelated
    /// register's value in a stack slot for the duration of Cur's range.
    fn add_spill_fill(&mut self, cfg: &mut Cfg, cur: VarId, var_mask: RegSet) {
        let start = cfg.var(cur).live_range.start();
        let end = cfg.var(cur).live_range.end();

        // The victim must not be touched by the instructions inside Cur's
        // range, so the spill and fill are the only accesses.
        let mut used = RegSet::EMPTY;
        let mut spill_at: Option<(NodeId, usize)> = None;
        let mut fill_at: Option<(NodeId, usize)> = None;
        for nid in cfg.node_ids() {
            for (pos, &iid) in cfg.node(nid).insts.iter().enumerate() {
                let inst = cfg.inst(iid);
                if inst.is_deleted() || inst.number < 0 {
                    continue;
                }
                if inst.number < start || inst.number > end {
                    continue;
                }
                if inst.number == start {
                    spill_at = Some((nid, pos));
                }
                if inst.number <= end {
                    fill_at = Some((nid, pos));
                }
                for v in inst
                    .vars_read()
                    .into_iter()
                    .chain(inst.dest.into_iter())
                {
                    let reg = self.tmp_reg[v.index()].or(cfg.var(v).reg_num());
                    if let Some(r) = reg {
                        used |= self.env.aliases(r);
                    }
                }
            }
        }
        let victim = (var_mask & !used)
            .first()
            .or_else(|| var_mask.first())
            .expect("no register available for spill/fill");

        let (spill_node, spill_pos) = spill_at.expect("spill point not found");
        let (fill_node, fill_pos) = fill_at.expect("fill point not found");
        let word = self.env.word_type();

        let slot = cfg.make_variable(word);
        cfg.var_mut(slot).set_must_not_have_reg();
        let save = cfg.make_variable(word);
        cfg.var_mut(save).set_reg_num(victim);
        cfg.var_mut(save).set_ignore_liveness();
        let restore = cfg.make_variable(word);
        cfg.var_mut(restore).set_reg_num(victim);
        cfg.var_mut(restore).set_ignore_liveness();

        let mut spill = Inst::new(
            InstKind::Machine(MachineOp::Mov),
            Some(slot),
            smallvec::smallvec![Operand::Var(save)],
        );
        spill.number = start - 1;
        let mut fill = Inst::new(
            InstKind::Machine(MachineOp::Mov),
            Some(restore),
            smallvec::smallvec![Operand::Var(slot)],
        );
        fill.number = end + 1;

        let spill_id = cfg.add_inst(spill);
        let fill_id = cfg.add_inst(fill);
        cfg.node_mut(spill_node).insts.insert(spill_pos, spill_id);
        let mut at = fill_pos + 1;
        if fill_node == spill_node {
            at += 1;
        }
        cfg.node_mut(fill_node).insts.insert(at, fill_id);

        cfg.ctx().stats().update_spills();
        cfg.ctx().stats().update_fills();
        self.tmp_reg.resize(cfg.num_variables(), None);
        self.tmp_reg[save.index()] = Some(victim);
        self.tmp_reg[restore.index()] = Some(victim);
        self.assign(cfg, cur, victim);
        log::trace!("spill/fill around {} steals r{}", cur, victim.0);
    }

    fn assign_final_registers(&mut self, cfg: &mut Cfg, kind: RegAllocKind) {
        for &v in &self.entered {
            match self.tmp_reg[v.index()] {
                Some(r) => cfg.var_mut(v).set_reg_num(r),
                None => {
                    assert!(
                        !cfg.var(v).must_have_reg(),
                        "infinite-weight variable {} has no register after {:?} allocation",
                        v,
                        kind
                    );
                    cfg.var_mut(v).clear_reg_num();
                }
            }
        }
    }

    // --- Small helpers ---

    fn ranges_overlap(&self, cfg: &Cfg, a: VarId, b: VarId) -> bool {
        cfg.var(a)
            .live_range
            .overlaps(&cfg.var(b).live_range, false, 0)
    }

    fn spans_kill(&self, cfg: &Cfg, v: VarId) -> bool {
        let range = &cfg.var(v).live_range;
        self.kills.iter().any(|&k| range.contains_value(k))
    }

    fn assign(&mut self, _cfg: &Cfg, v: VarId, reg: RegNum) {
        self.tmp_reg[v.index()] = Some(reg);
        self.inc_uses(reg);
        self.active.push(v);
    }

    fn inc_uses(&mut self, reg: RegNum) {
        for r in self.env.aliases(reg).iter() {
            self.reg_uses[r.index()] += 1;
        }
    }

    fn free_reg_of(&mut self, v: VarId) {
        if let Some(reg) = self.tmp_reg[v.index()] {
            for r in self.env.aliases(reg).iter() {
                self.reg_uses[r.index()] -= 1;
                debug_assert!(self.reg_uses[r.index()] >= 0);
            }
        }
    }

    /// Put an evictee back into the queue, restoring the sort order.
    /// Evictions are rare enough that a re-sort is the simplest safe way
    /// to keep the queue invariant.
    fn requeue(&mut self, cfg: &Cfg, v: VarId) {
        self.unhandled.push(v);
        self.sort_queue(cfg);
    }
}

/// The -Om1 pipeline skips liveness; infinite-weight and precolored
/// variables get a single conservative segment spanning their first
/// definition to their last use, so the scan can see their conflicts.
fn synthesize_inf_ranges(cfg: &mut Cfg) {
    let mut spans: Vec<Option<(InstNum, InstNum)>> = vec![None; cfg.num_variables()];
    for nid in cfg.node_ids() {
        for &iid in cfg.node(nid).insts.iter() {
            let inst = cfg.inst(iid);
            if inst.is_deleted() {
                continue;
            }
            let num = inst.number;
            let mut touch = |v: VarId| {
                let span = &mut spans[v.index()];
                *span = Some(match *span {
                    None => (num, num),
                    Some((b, e)) => (b.min(num), e.max(num)),
                });
            };
            if let Some(d) = inst.dest {
                touch(d);
            }
            for v in inst.vars_read() {
                touch(v);
            }
        }
    }
    for (i, span) in spans.into_iter().enumerate() {
        let var = cfg.var_mut(VarId(i as u32));
        if var.ignore_liveness() || !var.live_range.is_empty() {
            continue;
        }
        if !var.must_have_reg() && !var.has_reg() {
            continue;
        }
        if let Some((b, e)) = span {
            var.live_range.add_segment(b, e + 1);
        }
    }
}
