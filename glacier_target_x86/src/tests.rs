//! Unit tests for the lowering passes.

use std::sync::Arc;

use glacier_ir::builder::FuncBuilder;
use glacier_ir::constants::{Constant, GlobalContext};
use glacier_ir::inst::{ArithOp, ICond, InstKind, MachineOp};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::NodeId;
use glacier_ir::Cfg;

use glacier_regalloc::liveness::{self, LivenessMode};

use crate::addressopt;
use crate::folding::BoolFolding;
use crate::lower::{OptLevel, TargetConfig, TargetX86};
use crate::regs::TargetArch;
use crate::rmw;

fn ctx() -> Arc<GlobalContext> {
    Arc::new(GlobalContext::new())
}

fn config32() -> TargetConfig {
    TargetConfig::new(TargetArch::X8632)
}

/// All non-deleted machine ops in a node, in order.
fn machine_ops(cfg: &Cfg, node: NodeId) -> Vec<MachineOp> {
    cfg.node(node)
        .insts
        .iter()
        .filter(|&&i| !cfg.inst(i).is_deleted())
        .filter_map(|&i| match &cfg.inst(i).kind {
            InstKind::Machine(op) => Some(op.clone()),
            _ => None,
        })
        .collect()
}

fn const_value(cfg: &Cfg, op: Operand) -> Option<i32> {
    match cfg.ctx().const_info(op.as_const()?) {
        Constant::Int32(v) => Some(v),
        _ => None,
    }
}

fn prepare_liveness(cfg: &mut Cfg) {
    cfg.compute_edges();
    cfg.renumber_instructions();
    liveness::compute(cfg, LivenessMode::Basic);
}

// --- Bool folding ---

#[test]
fn folding_finds_icmp_branch_producer() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let t = b.make_node();
    let f = b.make_node();
    let x = b.add_arg(Type::I32);
    let zero = b.i32_const(0);
    let c = b.icmp(ICond::Ne, Operand::Var(x), zero);
    b.br_if(Operand::Var(c), t, f);
    b.switch_to(t);
    b.ret(None);
    b.switch_to(f);
    b.ret(None);
    let mut cfg = b.finish();
    prepare_liveness(&mut cfg);

    let entry = cfg.entry;
    let mut folding = BoolFolding::default();
    folding.init(TargetArch::X8632, &mut cfg, entry);

    let producer = folding.producer_for(Operand::Var(c));
    assert!(producer.is_some(), "icmp feeding br should be foldable");
    let producer = producer.unwrap();
    // BF-1: the producer is marked dead (not deleted) and defines c.
    assert!(cfg.inst(producer).is_dead());
    assert!(!cfg.inst(producer).is_deleted());
    assert_eq!(cfg.inst(producer).dest, Some(c));
}

#[test]
fn folding_rejects_live_out_producer() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let t = b.make_node();
    let f = b.make_node();
    let x = b.add_arg(Type::I32);
    let zero = b.i32_const(0);
    let c = b.icmp(ICond::Ne, Operand::Var(x), zero);
    b.br_if(Operand::Var(c), t, f);
    b.switch_to(t);
    // c is used again here, so it is live out of the entry node.
    b.ret(Some(Operand::Var(c)));
    b.switch_to(f);
    b.ret(None);
    let mut cfg = b.finish();
    prepare_liveness(&mut cfg);

    let entry = cfg.entry;
    let mut folding = BoolFolding::default();
    folding.init(TargetArch::X8632, &mut cfg, entry);
    // BF-2: no producer survives the analysis live-out.
    assert!(folding.producer_for(Operand::Var(c)).is_none());
}

#[test]
fn folding_rejects_non_first_operand_consumer() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I32);
    let zero = b.i32_const(0);
    let c = b.icmp(ICond::Ne, Operand::Var(x), zero);
    // The condition is used as the second operand of a select.
    let c2 = b.icmp(ICond::Eq, Operand::Var(x), zero);
    let one = b.i32_const(1);
    let _sel = b.select(Type::I1, Operand::Var(c2), Operand::Var(c), one);
    b.ret(None);
    let mut cfg = b.finish();
    prepare_liveness(&mut cfg);

    let entry = cfg.entry;
    let mut folding = BoolFolding::default();
    folding.init(TargetArch::X8632, &mut cfg, entry);
    assert!(folding.producer_for(Operand::Var(c)).is_none());
}

// --- Address-mode synthesis ---

fn build_addr_chain() -> (Cfg, glacier_ir::VarId, [glacier_ir::InstId; 3]) {
    let mut b = FuncBuilder::new(ctx(), "f");
    let a = b.add_arg(Type::I32);
    let bb = b.add_arg(Type::I32);
    let c = b.add_arg(Type::I32);
    let t1 = b.arith(ArithOp::Add, Type::I32, Operand::Var(a), Operand::Var(bb));
    let t2 = b.arith(ArithOp::Mul, Type::I32, Operand::Var(t1), b.i32_const(4));
    let t3 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t2), Operand::Var(c));
    let t4 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t3), b.i32_const(8));
    let v = b.load(Type::I32, Operand::Var(t4));
    b.ret(Some(Operand::Var(v)));
    let cfg = b.finish();
    let entry = cfg.entry;
    let insts = &cfg.node(entry).insts;
    let ids = [insts[1], insts[2], insts[3]]; // t2, t3, t4
    (cfg, t1, ids)
}

#[test]
fn address_opt_folds_chain() {
    let (mut cfg, t1, consumed) = build_addr_chain();
    addressopt::do_address_opt(&mut cfg);

    // The load was rewritten to use a single memory operand.
    let entry = cfg.entry;
    let load = cfg
        .node(entry)
        .insts
        .iter()
        .copied()
        .find(|&i| !cfg.inst(i).is_deleted() && matches!(cfg.inst(i).kind, InstKind::Load))
        .expect("rewritten load");
    let mem = cfg.inst(load).srcs[0].as_mem().expect("load of mem operand");
    assert_eq!(mem.shift, 2, "the *4 became a shift of 2");
    assert_eq!(mem.index, Some(t1));
    assert!(mem.base.is_some());
    assert_eq!(const_value(&cfg, Operand::Const(mem.offset.unwrap())), Some(8));

    // The consumed arithmetic becomes dead once liveness runs.
    prepare_liveness(&mut cfg);
    for id in consumed {
        assert!(cfg.inst(id).is_deleted(), "inst {:?} should be dead", id);
    }
}

#[test]
fn address_opt_is_idempotent() {
    let (mut cfg, _, _) = build_addr_chain();
    addressopt::do_address_opt(&mut cfg);
    let entry = cfg.entry;
    let find_load = |cfg: &Cfg| {
        cfg.node(entry)
            .insts
            .iter()
            .copied()
            .find(|&i| !cfg.inst(i).is_deleted() && matches!(cfg.inst(i).kind, InstKind::Load))
            .unwrap()
    };
    let first = cfg.inst(find_load(&cfg)).srcs[0];
    addressopt::do_address_opt(&mut cfg);
    let second = cfg.inst(find_load(&cfg)).srcs[0];
    assert_eq!(first, second, "a second application changes nothing");
}

#[test]
fn address_opt_rejects_multi_block_base() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let other = b.make_node();
    let a = b.add_arg(Type::I32);
    let t1 = b.arith(ArithOp::Add, Type::I32, Operand::Var(a), b.i32_const(8));
    b.br(other);
    b.switch_to(other);
    let v = b.load(Type::I32, Operand::Var(t1));
    b.ret(Some(Operand::Var(v)));
    let mut cfg = b.finish();
    addressopt::do_address_opt(&mut cfg);

    // t1 is multi-block; the load keeps its variable address.
    let load = cfg
        .node(other)
        .insts
        .iter()
        .copied()
        .find(|&i| !cfg.inst(i).is_deleted() && matches!(cfg.inst(i).kind, InstKind::Load))
        .unwrap();
    assert!(cfg.inst(load).srcs[0].is_var());
}

#[test]
fn address_opt_rejects_offset_overflow() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let a = b.add_arg(Type::I32);
    let big = b.i32_const(i32::MAX);
    let t1 = b.arith(ArithOp::Add, Type::I32, Operand::Var(a), big);
    let t2 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t1), big);
    let v = b.load(Type::I32, Operand::Var(t2));
    b.ret(Some(Operand::Var(v)));
    let mut cfg = b.finish();
    addressopt::do_address_opt(&mut cfg);

    let entry = cfg.entry;
    let load = cfg
        .node(entry)
        .insts
        .iter()
        .copied()
        .find(|&i| !cfg.inst(i).is_deleted() && matches!(cfg.inst(i).kind, InstKind::Load))
        .unwrap();
    // One addition folds; the second would overflow the displacement and
    // must be left in place.
    if let Some(mem) = cfg.inst(load).srcs[0].as_mem() {
        assert_eq!(
            const_value(&cfg, Operand::Const(mem.offset.unwrap())),
            Some(i32::MAX)
        );
        assert_eq!(mem.base, Some(t1));
    }
}

// --- RMW detection ---

#[test]
fn rmw_detection_plants_beacon() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let p = b.add_arg(Type::I32);
    let x = b.add_arg(Type::I32);
    let loaded = b.load(Type::I32, Operand::Var(p));
    let sum = b.arith(ArithOp::Add, Type::I32, Operand::Var(loaded), Operand::Var(x));
    b.store(Operand::Var(sum), Operand::Var(p));
    b.ret(None);
    let mut cfg = b.finish();
    rmw::find_rmw(&mut cfg);

    let entry = cfg.entry;
    let kinds: Vec<_> = cfg
        .node(entry)
        .insts
        .iter()
        .map(|&i| cfg.inst(i).kind.clone())
        .collect();
    assert!(kinds.iter().any(|k| matches!(k, InstKind::FakeRmw { op: ArithOp::Add })));
    assert!(kinds.iter().any(|k| matches!(k, InstKind::FakeDef)));
    // The store acquired a dest and a beacon source.
    let store = cfg
        .node(entry)
        .insts
        .iter()
        .copied()
        .find(|&i| matches!(cfg.inst(i).kind, InstKind::Store))
        .unwrap();
    assert_eq!(cfg.inst(store).dest, Some(sum));
    assert_eq!(cfg.inst(store).srcs.len(), 3);
    assert!(cfg.inst(store).is_dest_redefined());
}

#[test]
fn rmw_detection_rejects_mismatched_address() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let p = b.add_arg(Type::I32);
    let q = b.add_arg(Type::I32);
    let x = b.add_arg(Type::I32);
    let loaded = b.load(Type::I32, Operand::Var(p));
    let sum = b.arith(ArithOp::Add, Type::I32, Operand::Var(loaded), Operand::Var(x));
    b.store(Operand::Var(sum), Operand::Var(q));
    b.ret(None);
    let mut cfg = b.finish();
    rmw::find_rmw(&mut cfg);

    let entry = cfg.entry;
    assert!(!cfg
        .node(entry)
        .insts
        .iter()
        .any(|&i| matches!(cfg.inst(i).kind, InstKind::FakeRmw { .. })));
}

// --- Scalar multiply strength reduction ---

#[test]
fn mul_by_100_uses_leas_not_imul() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I32);
    let hundred = b.i32_const(100);
    let r = b.arith(ArithOp::Mul, Type::I32, Operand::Var(x), hundred);
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();
    assert!(!cfg.has_error());

    let ops = machine_ops(&cfg, cfg.entry);
    let leas = ops.iter().filter(|o| matches!(o, MachineOp::Lea)).count();
    let shls = ops.iter().filter(|o| matches!(o, MachineOp::Shl)).count();
    assert_eq!(leas, 2, "two lea-by-5 steps for the factor 25");
    assert_eq!(shls, 1, "one shl for the factor 4");
    assert!(
        !ops.iter()
            .any(|o| matches!(o, MachineOp::Imul | MachineOp::ImulImm)),
        "multiply by 100 must not use imul"
    );
}

#[test]
fn mul_by_large_prime_falls_back_to_imul() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I32);
    let prime = b.i32_const(1009);
    let r = b.arith(ArithOp::Mul, Type::I32, Operand::Var(x), prime);
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();

    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops
        .iter()
        .any(|o| matches!(o, MachineOp::Imul | MachineOp::ImulImm)));
}

// --- Sext i1 ---

#[test]
fn sext_i1_to_i32_shifts() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I32);
    let zero = b.i32_const(0);
    let c = b.icmp(ICond::Ne, Operand::Var(x), zero);
    let z = b.cast(glacier_ir::CastOp::Sext, Type::I32, Operand::Var(c));
    b.ret(Some(Operand::Var(z)));
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();
    assert!(!cfg.has_error());

    let entry = cfg.entry;
    let ops = machine_ops(&cfg, entry);
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Movzx)));
    // One shl and one sar, both by 31.
    let mut shift_amounts = Vec::new();
    for &iid in &cfg.node(entry).insts {
        let inst = cfg.inst(iid);
        if inst.is_deleted() {
            continue;
        }
        if matches!(
            inst.kind,
            InstKind::Machine(MachineOp::Shl) | InstKind::Machine(MachineOp::Sar)
        ) {
            shift_amounts.push(const_value(&cfg, inst.srcs[1]).unwrap());
        }
    }
    assert_eq!(shift_amounts, vec![31, 31]);
}

// --- Memset unrolling ---

#[test]
fn memset_small_constant_unrolls() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let p = b.add_arg(Type::I32);
    let val = Operand::Const(b.ctx().const_int32(0xab));
    let count = b.i32_const(8);
    b.intrinsic(
        glacier_ir::Intrinsic::Memset,
        None,
        &[Operand::Var(p), val, count],
    );
    b.ret(None);
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();
    assert!(!cfg.has_error());

    let ops = machine_ops(&cfg, cfg.entry);
    let stores = ops.iter().filter(|o| matches!(o, MachineOp::Store)).count();
    assert_eq!(stores, 2, "8 bytes of 0xab becomes two 32-bit stores");
    assert!(!ops.iter().any(|o| matches!(o, MachineOp::Call)));
}

#[test]
fn memset_large_count_calls_helper() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let p = b.add_arg(Type::I32);
    let val = Operand::Const(b.ctx().const_int32(0xab));
    let count = b.i32_const(4096);
    b.intrinsic(
        glacier_ir::Intrinsic::Memset,
        None,
        &[Operand::Var(p), val, count],
    );
    b.ret(None);
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();

    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Call)));
}

// --- i64 split lowering ---

#[test]
fn i64_add_splits_into_add_adc() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I64);
    let y = b.add_arg(Type::I64);
    let r = b.arith(ArithOp::Add, Type::I64, Operand::Var(x), Operand::Var(y));
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();
    assert!(!cfg.has_error());

    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Add)));
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Adc)));
}

#[test]
fn i64_division_becomes_helper_call() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I64);
    let y = b.add_arg(Type::I64);
    let r = b.arith(ArithOp::Udiv, Type::I64, Operand::Var(x), Operand::Var(y));
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();
    assert!(!cfg.has_error());

    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Call)));
    assert!(!ops.iter().any(|o| matches!(o, MachineOp::Div)));
}

// --- Shift-amount masking bucket checks ---

#[test]
fn i64_shift_by_40_uses_reduced_amount() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I64);
    let amount = b.i64_const(40);
    let r = b.arith(ArithOp::Shl, Type::I64, Operand::Var(x), amount);
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    let mut target = TargetX86::new(&mut cfg, config32());
    target.translate();
    assert!(!cfg.has_error());

    // Shift amount 40 > 32: lo shifts by 8 into hi, lo becomes zero.
    let entry = cfg.entry;
    let mut shl_amounts = Vec::new();
    for &iid in &cfg.node(entry).insts {
        let inst = cfg.inst(iid);
        if !inst.is_deleted() && matches!(inst.kind, InstKind::Machine(MachineOp::Shl)) {
            shl_amounts.push(const_value(&cfg, inst.srcs[1]).unwrap());
        }
    }
    assert_eq!(shl_amounts, vec![8]);
    let ops = machine_ops(&cfg, entry);
    assert!(!ops.iter().any(|o| matches!(o, MachineOp::Shld)));
}

// --- Om1 pipeline smoke test ---

#[test]
fn om1_translates_without_optimization() {
    let mut b = FuncBuilder::new(ctx(), "f");
    let x = b.add_arg(Type::I32);
    let hundred = b.i32_const(100);
    let r = b.arith(ArithOp::Mul, Type::I32, Operand::Var(x), hundred);
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    let mut config = config32();
    config.opt_level = OptLevel::Om1;
    let mut target = TargetX86::new(&mut cfg, config);
    target.translate();
    assert!(!cfg.has_error());

    // The strength reduction is disabled below O2.
    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops
        .iter()
        .any(|o| matches!(o, MachineOp::Imul | MachineOp::ImulImm)));
}
