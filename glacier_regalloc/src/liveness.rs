//! Liveness analysis over the CFG.
//!
//! Computes per-node live-in/live-out sets by backward dataflow to a fixed
//! point, then walks each node backward to fill per-instruction last-use
//! bits, build per-variable live ranges as `[def, last_use + 1)` interval
//! unions, accumulate loop-scaled use weights, and eliminate dead code.
//!
//! Variables marked `ignore_liveness` (named physical registers) and
//! rematerializable variables do not participate.

use std::collections::HashSet;

use glacier_ir::cfg::Cfg;
use glacier_ir::liverange::InstNum;
use glacier_ir::value::{NodeId, VarId};
use glacier_ir::variable::RegWeight;

/// How much liveness detail to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessMode {
    /// Last-use bits and dead-code elimination only.
    Basic,
    /// Additionally build live-range intervals, use weights, and the call
    /// kill list for register allocation.
    Intervals,
}

/// Results that do not live on the CFG itself.
#[derive(Debug, Default)]
pub struct Liveness {
    /// Sorted instruction numbers at which calls clobber the scratch set.
    pub kills: Vec<InstNum>,
}

fn tracked(cfg: &Cfg, v: VarId) -> bool {
    let var = cfg.var(v);
    !var.ignore_liveness() && !var.is_rematerializable()
}

/// Per-use weight, scaled by the loop nesting depth of the using node.
fn use_weight(depth: u32) -> RegWeight {
    RegWeight::new(1u32 << (2 * depth.min(12)))
}

/// Run liveness. Instructions must have been renumbered first.
pub fn compute(cfg: &mut Cfg, mode: LivenessMode) -> Liveness {
    let num_nodes = cfg.nodes.len();

    // Reset previous results.
    for var in cfg.variables_mut() {
        var.live_range.reset();
        var.reset_weight();
    }
    for nid in cfg.node_ids() {
        for iid in cfg.node(nid).phis.clone().into_iter().chain(cfg.node(nid).insts.clone()) {
            cfg.inst_mut(iid).clear_live_ranges_ended();
        }
    }

    // Per-node gen/kill: gen = used before defined, kill = defined.
    let mut gen_sets: Vec<HashSet<VarId>> = vec![HashSet::new(); num_nodes];
    let mut kill_sets: Vec<HashSet<VarId>> = vec![HashSet::new(); num_nodes];
    for nid in cfg.node_ids() {
        let ids: Vec<_> = cfg
            .node(nid)
            .phis
            .iter()
            .chain(cfg.node(nid).insts.iter())
            .copied()
            .collect();
        let (gen_set, kill_set) = (&mut gen_sets[nid.index()], &mut kill_sets[nid.index()]);
        for iid in ids {
            let inst = cfg.inst(iid);
            if inst.is_deleted() {
                continue;
            }
            for v in inst.vars_read() {
                if tracked(cfg, v) && !kill_set.contains(&v) {
                    gen_set.insert(v);
                }
            }
            if let Some(d) = inst.dest {
                if tracked(cfg, d) && !inst.is_dest_redefined() {
                    kill_set.insert(d);
                }
            }
        }
    }

    // Backward dataflow to a fixed point.
    let mut live_in: Vec<HashSet<VarId>> = vec![HashSet::new(); num_nodes];
    let mut live_out: Vec<HashSet<VarId>> = vec![HashSet::new(); num_nodes];
    let mut changed = true;
    while changed {
        changed = false;
        for ni in (0..num_nodes).rev() {
            let mut new_out: HashSet<VarId> = HashSet::new();
            for &succ in &cfg.nodes[ni].out_edges {
                new_out.extend(&live_in[succ.index()]);
            }
            let mut new_in = gen_sets[ni].clone();
            for &v in &new_out {
                if !kill_sets[ni].contains(&v) {
                    new_in.insert(v);
                }
            }
            if new_in != live_in[ni] || new_out != live_out[ni] {
                live_in[ni] = new_in;
                live_out[ni] = new_out;
                changed = true;
            }
        }
    }

    // Backward per-node walk: last-use bits, DCE, range segments, weights.
    let mut segments: Vec<(VarId, InstNum, InstNum)> = Vec::new();
    let mut kills: Vec<InstNum> = Vec::new();
    for nid in cfg.node_ids() {
        walk_node(
            cfg,
            nid,
            &live_out[nid.index()],
            mode,
            &mut segments,
            &mut kills,
        );
    }

    if mode == LivenessMode::Intervals {
        segments.sort_by_key(|&(v, b, _)| (v, b));
        for (v, b, e) in segments {
            cfg.var_mut(v).live_range.add_segment(b, e);
        }
        kills.sort_unstable();
        kills.dedup();
    }

    log::trace!("liveness({:?}) done for {}", mode, cfg.name);
    Liveness { kills }
}

fn walk_node(
    cfg: &mut Cfg,
    nid: NodeId,
    live_out: &HashSet<VarId>,
    mode: LivenessMode,
    segments: &mut Vec<(VarId, InstNum, InstNum)>,
    kills: &mut Vec<InstNum>,
) {
    let ids: Vec<_> = cfg
        .node(nid)
        .phis
        .iter()
        .chain(cfg.node(nid).insts.iter())
        .copied()
        .collect();
    let numbers: Vec<InstNum> = ids
        .iter()
        .filter(|&&i| !cfg.inst(i).is_deleted())
        .map(|&i| cfg.inst(i).number)
        .collect();
    let Some(&first_num) = numbers.first() else {
        return;
    };
    let last_num = *numbers.last().unwrap();
    let depth = cfg.node(nid).loop_nest_depth;

    let mut live: HashSet<VarId> = live_out
        .iter()
        .copied()
        .filter(|&v| tracked(cfg, v))
        .collect();
    let mut live_end: Vec<(VarId, InstNum)> = live.iter().map(|&v| (v, last_num + 1)).collect();

    let end_of = |ends: &[(VarId, InstNum)], v: VarId| {
        ends.iter().rev().find(|&&(ev, _)| ev == v).map(|&(_, e)| e)
    };

    for &iid in ids.iter().rev() {
        if cfg.inst(iid).is_deleted() {
            continue;
        }
        // Dead-code elimination: a dead-marked instruction, or one whose
        // destination is not live and which has no side effects, is
        // removed here.
        let (deletable, num) = {
            let inst = cfg.inst(iid);
            // The redefined flag only suppresses the kill below; a dead
            // destination still makes the instruction removable.
            let dead_dest = match inst.dest {
                Some(d) => tracked(cfg, d) && !live.contains(&d),
                None => false,
            };
            (
                inst.is_dead() || (dead_dest && !inst.has_side_effects()),
                inst.number,
            )
        };
        if deletable {
            cfg.inst_mut(iid).set_deleted();
            continue;
        }

        if mode == LivenessMode::Intervals && cfg.inst(iid).is_machine_call() {
            kills.push(num);
        }

        // Destination: ends the backward-live window, producing a segment
        // from this def to the recorded end.
        let (dest, redefined) = {
            let inst = cfg.inst(iid);
            (inst.dest, inst.is_dest_redefined())
        };
        if let Some(d) = dest {
            if tracked(cfg, d) {
                if live.contains(&d) {
                    if redefined {
                        // An intra-block redefinition: the variable stays
                        // live above this instruction, so no kill.
                    } else {
                        live.remove(&d);
                        if mode == LivenessMode::Intervals {
                            let end = end_of(&live_end, d).unwrap_or(num + 1);
                            segments.push((d, num, end));
                        }
                    }
                } else if mode == LivenessMode::Intervals {
                    // Dest not consumed but the instruction survives (side
                    // effects); the def still occupies its point.
                    segments.push((d, num, num + 1));
                }
            }
        }

        // Sources: first appearance walking backward is the last use.
        let srcs_len = cfg.inst(iid).srcs.len();
        for pos in 0..srcs_len {
            let src = cfg.inst(iid).srcs[pos];
            let mut note_use = |cfg: &mut Cfg, v: VarId, is_direct: bool| {
                if !tracked(cfg, v) {
                    return;
                }
                if !live.contains(&v) {
                    live.insert(v);
                    live_end.push((v, num + 1));
                    if is_direct {
                        cfg.inst_mut(iid).set_last_use(pos);
                    }
                }
                if mode == LivenessMode::Intervals {
                    cfg.var_mut(v).add_weight(use_weight(depth));
                }
            };
            match src {
                glacier_ir::operand::Operand::Var(v) => note_use(cfg, v, true),
                glacier_ir::operand::Operand::Mem(m) => {
                    if let Some(b) = m.base {
                        note_use(cfg, b, false);
                    }
                    if let Some(ix) = m.index {
                        note_use(cfg, ix, false);
                    }
                }
                glacier_ir::operand::Operand::Split { var, .. } => note_use(cfg, var, false),
                glacier_ir::operand::Operand::Const(_) => {}
            }
        }
    }

    // Variables live at node entry span from the node's first instruction.
    if mode == LivenessMode::Intervals {
        for v in live {
            let end = end_of(&live_end, v).unwrap_or(last_num + 1);
            segments.push((v, first_num, end));
        }
    }
}
