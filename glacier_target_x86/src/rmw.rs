//! Read-modify-write pattern detection.
//!
//! Scans consecutive non-deleted `load; op; store` triples over the same
//! address and plants a FakeRMW plus a beacon fake-def before the store.
//! The store acquires the arithmetic's destination, making it eligible
//! for dead-code elimination; if it is eliminated, the beacon's live
//! range ends at the FakeRMW and the RMW lowers into a single
//! memory-destination operation. If the store survives, the FakeRMW is
//! redundant and is dropped at lowering.

use smallvec::smallvec;

use glacier_ir::cfg::Cfg;
use glacier_ir::inst::{ArithOp, Inst, InstKind};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::InstId;

/// Opcodes with a memory-destination x86 form of matching semantics.
/// Shifts and multiplies have no simple form; float ops have none.
fn can_rmw(cfg: &Cfg, arith: InstId) -> bool {
    let inst = cfg.inst(arith);
    let InstKind::Arithmetic(op) = inst.kind else {
        return false;
    };
    let Some(dest) = inst.dest else {
        return false;
    };
    let ty = cfg.var(dest).ty;
    if ty.is_vector() {
        return false;
    }
    matches!(
        op,
        ArithOp::Add | ArithOp::Sub | ArithOp::And | ArithOp::Or | ArithOp::Xor
    )
}

fn is_same_mem_address(a: Operand, b: Operand) -> bool {
    a == b
}

/// Run the detection over the whole function.
pub fn find_rmw(cfg: &mut Cfg) {
    for nid in cfg.node_ids() {
        let ids = cfg.node(nid).insts.clone();
        // Consider each sliding window of three non-deleted instructions.
        // The search tolerates deleted instructions in between but not
        // live ones; a reorderable instruction in the middle defeats it.
        let live: Vec<InstId> = ids
            .iter()
            .copied()
            .filter(|&i| !cfg.inst(i).is_deleted())
            .collect();
        let mut inserts: Vec<(InstId, Vec<InstId>)> = Vec::new();
        for w in live.windows(3) {
            let (i1, i2, i3) = (w[0], w[1], w[2]);
            if !matches!(cfg.inst(i1).kind, InstKind::Load) {
                continue;
            }
            if !matches!(cfg.inst(i2).kind, InstKind::Arithmetic(_)) {
                continue;
            }
            if !matches!(cfg.inst(i3).kind, InstKind::Store) {
                continue;
            }
            let load_addr = cfg.inst(i1).srcs[0];
            let store_addr = cfg.inst(i3).srcs[1];
            if !is_same_mem_address(load_addr, store_addr) {
                continue;
            }
            let load_dest = cfg.inst(i1).dest.expect("load without dest");
            let arith = cfg.inst(i2);
            let InstKind::Arithmetic(op) = arith.kind else {
                continue;
            };
            let mut src_from_load = arith.srcs[0];
            let mut src_other = arith.srcs[1];
            if src_from_load != Operand::Var(load_dest) {
                if !op.is_commutative() || src_other != Operand::Var(load_dest) {
                    continue;
                }
                std::mem::swap(&mut src_from_load, &mut src_other);
            }
            let arith_dest = arith.dest.expect("arithmetic without dest");
            if cfg.inst(i3).srcs[0] != Operand::Var(arith_dest) {
                continue;
            }
            if !can_rmw(cfg, i2) {
                continue;
            }
            log::debug!("found RMW in {} at inst {}", cfg.name, i3.0);

            // Plant the beacon: a fake-def before the store, the store
            // acquiring a dest plus the beacon as an extra source, and
            // the FakeRMW carrying (other, addr, beacon).
            let beacon = cfg.make_variable(Type::I32);
            cfg.var_mut(beacon).set_must_not_have_reg();
            let beacon_def = cfg.add_inst(Inst::new(InstKind::FakeDef, Some(beacon), smallvec![]));
            let fake_rmw = cfg.add_inst(Inst::new(
                InstKind::FakeRmw { op },
                None,
                smallvec![src_other, store_addr, Operand::Var(beacon)],
            ));
            {
                let store = cfg.inst_mut(i3);
                store.dest = Some(arith_dest);
                store.srcs.push(Operand::Var(beacon));
                // The store redefines the arithmetic's destination;
                // suppress the liveness conflict.
                store.set_dest_redefined();
            }
            inserts.push((i3, vec![beacon_def, fake_rmw]));
        }
        // Splice the new instructions in before their stores.
        if inserts.is_empty() {
            continue;
        }
        let mut new_list: Vec<InstId> = Vec::new();
        for iid in ids {
            if let Some(pos) = inserts.iter().position(|&(store, _)| store == iid) {
                new_list.extend(&inserts[pos].1);
            }
            new_list.push(iid);
        }
        cfg.node_mut(nid).insts = new_list;
    }
}
