//! The lowering context: a cursor over one node's instruction list, plus
//! the availability map used for legalize-time copy propagation.

use std::collections::HashMap;

use glacier_ir::cfg::Cfg;
use glacier_ir::inst::{Inst, InstKind, MachineOp};
use glacier_ir::operand::Operand;
use glacier_ir::value::{InstId, NodeId, VarId};

/// Cursor state for lowering one node. `cur` and `next` are positions in
/// the node's instruction list; insertion places new instructions
/// strictly before the current one, so each input instruction expands
/// into a contiguous prefix of output.
#[derive(Debug)]
pub struct LoweringContext {
    node: NodeId,
    cur: usize,
    next: usize,
    last_inserted: Option<InstId>,
    /// Instructions inserted since the last availability update.
    recent: Vec<InstId>,
    avail: Availability,
}

impl Default for LoweringContext {
    fn default() -> Self {
        Self {
            node: NodeId(0),
            cur: 0,
            next: 0,
            last_inserted: None,
            recent: Vec::new(),
            avail: Availability::default(),
        }
    }
}

impl LoweringContext {
    pub fn init(&mut self, cfg: &Cfg, node: NodeId) {
        self.node = node;
        self.cur = Self::skip_deleted(cfg, node, 0);
        self.next = Self::skip_deleted(cfg, node, self.cur + 1);
        self.last_inserted = None;
        self.recent.clear();
        self.avail.clear();
    }

    fn skip_deleted(cfg: &Cfg, node: NodeId, mut pos: usize) -> usize {
        let insts = &cfg.node(node).insts;
        while pos < insts.len() && cfg.inst(insts[pos]).is_deleted() {
            pos += 1;
        }
        pos
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn at_end(&self, cfg: &Cfg) -> bool {
        self.cur >= cfg.node(self.node).insts.len()
    }

    pub fn cur(&self, cfg: &Cfg) -> Option<InstId> {
        cfg.node(self.node).insts.get(self.cur).copied()
    }

    /// The instruction after the current one, skipping deleted entries.
    pub fn next_inst(&self, cfg: &Cfg) -> Option<InstId> {
        cfg.node(self.node).insts.get(self.next).copied()
    }

    pub fn last_inserted(&self) -> Option<InstId> {
        self.last_inserted
    }

    /// The `skip`-th non-deleted instruction after the current one,
    /// without moving the cursor. `peek(cfg, 0)` matches `next_inst`.
    pub fn peek(&self, cfg: &Cfg, skip: usize) -> Option<InstId> {
        let insts = &cfg.node(self.node).insts;
        let mut pos = self.next;
        for _ in 0..skip {
            pos = Self::skip_deleted(cfg, self.node, pos + 1);
        }
        insts.get(pos).copied()
    }

    /// Move the cursor past the current instruction.
    pub fn advance_cur(&mut self, cfg: &Cfg) {
        self.cur = self.next;
        self.next = Self::skip_deleted(cfg, self.node, self.cur + 1);
    }

    /// Move the lookahead one instruction forward.
    pub fn advance_next(&mut self, cfg: &Cfg) {
        self.next = Self::skip_deleted(cfg, self.node, self.next + 1);
    }

    /// Insert an instruction before the current one.
    pub fn insert(&mut self, cfg: &mut Cfg, inst: Inst) -> InstId {
        let id = cfg.add_inst(inst);
        self.insert_id(cfg, id);
        id
    }

    /// Insert an already-created instruction before the current one.
    pub fn insert_id(&mut self, cfg: &mut Cfg, id: InstId) {
        cfg.node_mut(self.node).insts.insert(self.cur, id);
        self.cur += 1;
        self.next += 1;
        self.last_inserted = Some(id);
        self.recent.push(id);
    }

    // --- Availability ---

    /// A substitution candidate for `op`, if a live copy exists.
    pub fn avail_get(&self, op: Operand) -> Option<VarId> {
        self.avail.get(op)
    }

    /// Fold the instructions emitted since the last update into the
    /// availability map. Called after each high-level instruction's
    /// lowering completes.
    pub fn avail_update(&mut self, cfg: &Cfg) {
        for id in std::mem::take(&mut self.recent) {
            let inst = cfg.inst(id);
            if inst.is_deleted() {
                continue;
            }
            self.avail.note(cfg, inst);
        }
    }
}

/// Records, per source variable, the infinite-weight temporary holding a
/// copy of it: after `mov a <- b`, a later use of `b` that accepts any
/// register may use `a` instead. Entries die when either side is written
/// or at node boundaries.
#[derive(Debug, Default)]
struct Availability {
    map: HashMap<VarId, VarId>,
}

impl Availability {
    fn clear(&mut self) {
        self.map.clear();
    }

    fn get(&self, op: Operand) -> Option<VarId> {
        self.map.get(&op.as_var()?).copied()
    }

    fn note(&mut self, cfg: &Cfg, inst: &glacier_ir::inst::Inst) {
        let Some(dest) = inst.dest else {
            return;
        };
        // Any write invalidates entries involving the written variable.
        self.map.retain(|&k, &mut v| k != dest && v != dest);
        let is_copy = matches!(
            inst.kind,
            InstKind::Assign | InstKind::Machine(MachineOp::Mov)
        );
        if !is_copy || inst.srcs.len() != 1 {
            return;
        }
        let Some(src) = inst.srcs[0].as_var() else {
            return;
        };
        let dvar = cfg.var(dest);
        if dvar.must_have_reg() && !dvar.has_reg() {
            self.map.insert(src, dest);
        }
    }
}
