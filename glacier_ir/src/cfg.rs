//! The per-function control-flow graph.
//!
//! The CFG owns arenas of variables and instructions; nodes hold ordered
//! id lists into the instruction arena. All cross-references are typed
//! indices, so passes move ids, never pointers.

use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;

use crate::constants::GlobalContext;
use crate::inst::{Inst, InstKind};
use crate::node::Node;
use crate::operand::Operand;
use crate::types::Type;
use crate::value::{InstId, LabelId, NodeId, VarId};
use crate::variable::{LoHi, Variable};

/// Error kinds a pass can record on the CFG. The driver checks between
/// passes and abandons the function once an error is present.
#[derive(Debug, Error)]
pub enum CfgError {
    #[error("unsupported lowering: {0}")]
    UnsupportedLowering(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("numeric overflow: {0}")]
    Overflow(String),
    #[error("bad configuration: {0}")]
    Configuration(String),
}

/// A function under translation.
pub struct Cfg {
    ctx: Arc<GlobalContext>,
    pub name: String,
    variables: Vec<Variable>,
    insts: Vec<Inst>,
    pub nodes: Vec<Node>,
    pub entry: NodeId,
    pub args: Vec<VarId>,
    /// Named physical registers, live on entry.
    pub implicit_args: Vec<VarId>,
    error: Option<CfgError>,
    next_label: u32,
}

impl Cfg {
    pub fn new(ctx: Arc<GlobalContext>, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
            variables: Vec::new(),
            insts: Vec::new(),
            nodes: Vec::new(),
            entry: NodeId(0),
            args: Vec::new(),
            implicit_args: Vec::new(),
            error: None,
            next_label: 0,
        }
    }

    pub fn ctx(&self) -> &Arc<GlobalContext> {
        &self.ctx
    }

    pub fn set_error(&mut self, err: CfgError) {
        log::debug!("{}: {}", self.name, err);
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&CfgError> {
        self.error.as_ref()
    }

    // --- Arena accessors ---

    pub fn make_variable(&mut self, ty: Type) -> VarId {
        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable::new(id, ty));
        id
    }

    /// Create an i64 variable backed by explicit lo/hi i32 halves, for the
    /// 32-bit target where i64 is not natively addressable.
    pub fn make_variable64_on_32(&mut self) -> VarId {
        let id = self.make_variable(Type::I64);
        self.split64(id);
        id
    }

    /// Attach lo/hi halves to an existing i64 (or f64 spill) variable.
    pub fn split64(&mut self, var: VarId) -> LoHi {
        if let Some(pair) = self.variables[var.index()].pair {
            return pair;
        }
        let lo = self.make_variable(Type::I32);
        let hi = self.make_variable(Type::I32);
        let pair = LoHi { lo, hi };
        self.variables[var.index()].pair = Some(pair);
        pair
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.variables[id.index()]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.variables[id.index()]
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut [Variable] {
        &mut self.variables
    }

    pub fn add_inst(&mut self, inst: Inst) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(inst);
        id
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub fn make_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(id.0));
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn make_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    pub fn add_arg(&mut self, var: VarId) {
        self.var_mut(var).is_arg = true;
        self.args.push(var);
    }

    pub fn add_implicit_arg(&mut self, var: VarId) {
        self.var_mut(var).is_implicit_arg = true;
        self.implicit_args.push(var);
    }

    // --- Edges ---

    /// Recompute in/out edges from the nodes' terminators.
    pub fn compute_edges(&mut self) {
        for node in &mut self.nodes {
            node.in_edges.clear();
            node.out_edges.clear();
        }
        let mut edges: Vec<(NodeId, NodeId)> = Vec::new();
        for nid in self.node_ids() {
            let mut out: SmallVec<[NodeId; 2]> = SmallVec::new();
            for &iid in &self.node(nid).insts {
                let inst = self.inst(iid);
                if inst.is_deleted() {
                    continue;
                }
                for t in inst.branch_targets() {
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
            }
            for t in out {
                edges.push((nid, t));
            }
        }
        for (from, to) in edges {
            self.nodes[from.index()].out_edges.push(to);
            self.nodes[to.index()].in_edges.push(from);
        }
    }

    // --- Numbering ---

    /// Assign even, increasing numbers to every non-deleted instruction,
    /// phis first within each node.
    pub fn renumber_instructions(&mut self) {
        let mut next = 0;
        for nid in 0..self.nodes.len() {
            let ids: Vec<InstId> = self.nodes[nid]
                .phis
                .iter()
                .chain(self.nodes[nid].insts.iter())
                .copied()
                .collect();
            for iid in ids {
                let inst = &mut self.insts[iid.index()];
                if inst.is_deleted() {
                    continue;
                }
                inst.number = next;
                next += 2;
            }
        }
    }

    // --- Loop analysis ---

    /// Tag every node with its loop nesting depth. Back edges are found by
    /// DFS; each back edge's natural loop body gets one extra level.
    pub fn compute_loop_nest_depth(&mut self) {
        for n in &mut self.nodes {
            n.loop_nest_depth = 0;
        }
        let n = self.nodes.len();
        if n == 0 {
            return;
        }
        // Iterative DFS from the entry recording back edges.
        let mut state = vec![0u8; n]; // 0 unvisited, 1 on stack, 2 done
        let mut back_edges: Vec<(NodeId, NodeId)> = Vec::new();
        let mut stack: Vec<(NodeId, usize)> = vec![(self.entry, 0)];
        state[self.entry.index()] = 1;
        while let Some(&(nid, next)) = stack.last() {
            let succs = &self.nodes[nid.index()].out_edges;
            if next < succs.len() {
                let succ = succs[next];
                stack.last_mut().unwrap().1 += 1;
                match state[succ.index()] {
                    0 => {
                        state[succ.index()] = 1;
                        stack.push((succ, 0));
                    }
                    1 => back_edges.push((nid, succ)),
                    _ => {}
                }
            } else {
                state[nid.index()] = 2;
                stack.pop();
            }
        }
        // For each back edge tail->head, walk predecessors from the tail
        // until the head; that natural loop body nests one level deeper.
        for (tail, head) in back_edges {
            let mut in_loop = vec![false; n];
            in_loop[head.index()] = true;
            let mut work = vec![tail];
            while let Some(nid) = work.pop() {
                if in_loop[nid.index()] {
                    continue;
                }
                in_loop[nid.index()] = true;
                for &pred in &self.nodes[nid.index()].in_edges {
                    work.push(pred);
                }
            }
            for (i, inside) in in_loop.iter().enumerate() {
                if *inside {
                    self.nodes[i].loop_nest_depth += 1;
                }
            }
        }
    }

    // --- Phi lowering (basic mode) ---

    /// Lower phis by placing assignments: each phi gets a load `dest = tmp`
    /// at the top of its node, and each predecessor gets `tmp = operand`
    /// stores before its terminator. Afterwards the phis are deleted.
    pub fn lower_phis_basic(&mut self) {
        // Phi loads: dest = tmp at the top of the node.
        for nid in self.node_ids() {
            let phis = self.node(nid).phis.clone();
            if phis.is_empty() {
                continue;
            }
            let mut loads: Vec<InstId> = Vec::new();
            for pid in phis {
                if self.inst(pid).is_deleted() {
                    continue;
                }
                let dest = self.inst(pid).dest.expect("phi without dest");
                let ty = self.var(dest).ty;
                let tmp = self.make_variable(ty);
                // Redirect the phi to define tmp; the load copies it out.
                self.inst_mut(pid).dest = Some(tmp);
                let load = Inst::new(
                    InstKind::Assign,
                    Some(dest),
                    smallvec::smallvec![Operand::Var(tmp)],
                );
                loads.push(self.add_inst(load));
            }
            let node = self.node_mut(nid);
            let old = std::mem::take(&mut node.insts);
            node.insts = loads;
            node.insts.extend(old);
        }
        // Phi stores: tmp = operand on each predecessor, before the
        // terminator.
        for nid in self.node_ids() {
            let preds = self.node(nid).in_edges.clone();
            let phis = self.node(nid).phis.clone();
            if phis.is_empty() {
                continue;
            }
            for pred in preds {
                let mut stores: Vec<InstId> = Vec::new();
                for &pid in &phis {
                    if self.inst(pid).is_deleted() {
                        continue;
                    }
                    let (tmp, operand) = {
                        let phi = self.inst(pid);
                        let InstKind::Phi { preds: ref sources } = phi.kind else {
                            unreachable!("non-phi in phi list");
                        };
                        let pos = sources
                            .iter()
                            .position(|&p| p == pred)
                            .expect("phi missing predecessor operand");
                        (phi.dest.unwrap(), phi.srcs[pos])
                    };
                    let store = Inst::new(
                        InstKind::Assign,
                        Some(tmp),
                        smallvec::smallvec![operand],
                    );
                    stores.push(self.add_inst(store));
                }
                // Insert before the terminator of the predecessor.
                let pn = self.node_mut(pred);
                let at = pn.insts.len().saturating_sub(1);
                pn.insts.splice(at..at, stores);
            }
        }
        // Delete the phis.
        for nid in self.node_ids() {
            for pid in self.node(nid).phis.clone() {
                self.inst_mut(pid).set_deleted();
            }
            self.node_mut(nid).phis.clear();
        }
    }
}
