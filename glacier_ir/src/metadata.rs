//! Variable metadata oracle: definition counts and block locality.
//!
//! Address-mode synthesis and bool folding only rewrite through variables
//! with a single definition that stay inside one basic block; this pass
//! computes that in one forward walk. The snapshot is immutable once built,
//! so queries have no observable side effects.

use crate::cfg::Cfg;
use crate::value::{InstId, NodeId, VarId};

#[derive(Debug, Clone, Copy, Default)]
enum DefState {
    #[default]
    None,
    Single(InstId),
    Multi,
}

/// Per-variable definition and block-locality facts.
#[derive(Debug, Default)]
pub struct VariablesMetadata {
    defs: Vec<DefState>,
    home_node: Vec<Option<NodeId>>,
    multi_block: Vec<bool>,
}

impl VariablesMetadata {
    /// Build the oracle from the current (non-deleted) instructions.
    pub fn init(cfg: &Cfg) -> Self {
        let n = cfg.num_variables();
        let mut md = VariablesMetadata {
            defs: vec![DefState::None; n],
            home_node: vec![None; n],
            multi_block: vec![false; n],
        };
        // Arguments are live on entry and usable anywhere; treat them as
        // multi-block with no single definition.
        for &arg in cfg.args.iter().chain(cfg.implicit_args.iter()) {
            md.multi_block[arg.index()] = true;
        }
        for nid in cfg.node_ids() {
            let node = cfg.node(nid);
            for &iid in node.phis.iter().chain(node.insts.iter()) {
                let inst = cfg.inst(iid);
                if inst.is_deleted() {
                    continue;
                }
                if let Some(dest) = inst.dest {
                    md.defs[dest.index()] = match md.defs[dest.index()] {
                        DefState::None => DefState::Single(iid),
                        _ => DefState::Multi,
                    };
                    md.note_node(dest, nid);
                }
                for v in inst.vars_read() {
                    md.note_node(v, nid);
                }
            }
        }
        md
    }

    fn note_node(&mut self, var: VarId, node: NodeId) {
        match self.home_node[var.index()] {
            None => self.home_node[var.index()] = Some(node),
            Some(home) if home != node => self.multi_block[var.index()] = true,
            _ => {}
        }
    }

    /// The unique defining instruction, if exactly one exists.
    pub fn single_definition(&self, var: VarId) -> Option<InstId> {
        match self.defs[var.index()] {
            DefState::Single(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_multi_def(&self, var: VarId) -> bool {
        matches!(self.defs[var.index()], DefState::Multi)
    }

    /// Whether the variable is referenced from more than one node.
    pub fn is_multi_block(&self, var: VarId) -> bool {
        self.multi_block[var.index()]
    }
}
