//! CFG nodes: ordered phis then instructions, edges, loop depth.

use crate::value::{InstId, NodeId};

/// A basic block. Instructions are ids into the CFG's instruction arena;
/// the node's lists give them their order.
#[derive(Debug, Default)]
pub struct Node {
    pub index: u32,
    /// Phi instructions, conceptually executed on entry.
    pub phis: Vec<InstId>,
    /// Regular instructions, ending with a terminator.
    pub insts: Vec<InstId>,
    pub in_edges: Vec<NodeId>,
    pub out_edges: Vec<NodeId>,
    /// Nesting depth used to scale use weights for register allocation.
    pub loop_nest_depth: u32,
}

impl Node {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId(self.index)
    }
}
