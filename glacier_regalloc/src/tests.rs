//! Unit tests for liveness analysis and the linear-scan allocator.

use std::sync::Arc;

use glacier_ir::builder::FuncBuilder;
use glacier_ir::cfg::Cfg;
use glacier_ir::constants::GlobalContext;
use glacier_ir::inst::{ArithOp, ICond, Inst, InstKind};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::{NodeId, RegNum, VarId};
use glacier_ir::variable::RegClass;

use crate::allocator::LinearScan;
use crate::liveness::{self, LivenessMode};
use crate::{RegAllocEnv, RegAllocKind, RegSet};

/// A flat register file with no aliasing and no scratch registers.
struct FlatEnv {
    n: usize,
    scratch: RegSet,
}

impl FlatEnv {
    fn new(n: usize) -> Self {
        Self {
            n,
            scratch: RegSet::EMPTY,
        }
    }
}

impl RegAllocEnv for FlatEnv {
    fn num_regs(&self) -> usize {
        self.n
    }
    fn aliases(&self, r: RegNum) -> RegSet {
        RegSet::single(r)
    }
    fn scratch_regs(&self) -> RegSet {
        self.scratch
    }
    fn regs_for(&self, _ty: Type, _class: RegClass) -> RegSet {
        RegSet((1u64 << self.n) - 1)
    }
    fn word_type(&self) -> Type {
        Type::I32
    }
}

fn all_regs(n: usize) -> RegSet {
    RegSet((1u64 << n) - 1)
}

/// Append a FakeUse of the given variables before the node's terminator.
fn fake_use(cfg: &mut Cfg, node: NodeId, vars: &[VarId]) {
    let srcs = vars.iter().map(|&v| Operand::Var(v)).collect();
    let id = cfg.add_inst(Inst::new(InstKind::FakeUse, None, srcs));
    let n = cfg.node_mut(node);
    let at = n.insts.len().saturating_sub(1);
    n.insts.insert(at, id);
}

fn prepare(cfg: &mut Cfg) -> Vec<i32> {
    cfg.compute_edges();
    cfg.compute_loop_nest_depth();
    cfg.renumber_instructions();
    liveness::compute(cfg, LivenessMode::Intervals).kills
}

// --- Liveness ---

#[test]
fn liveness_straight_line_ranges() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let one = b.i32_const(1);
    let two = b.i32_const(2);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, two);
    let t1 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t0), one);
    b.ret(Some(Operand::Var(t1)));
    let mut cfg = b.finish();
    prepare(&mut cfg);

    // t0: defined at 0, last used at 2 -> [0, 3).
    assert_eq!(cfg.var(t0).live_range.start(), 0);
    assert_eq!(cfg.var(t0).live_range.end(), 3);
    // t1: defined at 2, last used at 4 -> [2, 5).
    assert_eq!(cfg.var(t1).live_range.start(), 2);
    assert_eq!(cfg.var(t1).live_range.end(), 5);
}

#[test]
fn liveness_sets_last_use_bits() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let one = b.i32_const(1);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t1 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t0), Operand::Var(t0));
    b.ret(Some(Operand::Var(t1)));
    let mut cfg = b.finish();
    prepare(&mut cfg);

    let entry = cfg.entry;
    let add2 = cfg.node(entry).insts[1];
    assert!(cfg.inst(add2).is_last_use(t0));
    let ret = cfg.node(entry).insts[2];
    assert!(cfg.inst(ret).is_last_use(t1));
}

#[test]
fn liveness_across_branch() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let exit = b.make_node();
    let x = b.add_arg(Type::I32);
    let zero = b.i32_const(0);
    let c = b.icmp(ICond::Ne, Operand::Var(x), zero);
    b.br_if(Operand::Var(c), exit, exit);
    b.switch_to(exit);
    b.ret(Some(Operand::Var(x)));
    let mut cfg = b.finish();
    prepare(&mut cfg);

    // x is live from the entry through its use in exit.
    let range = &cfg.var(x).live_range;
    assert_eq!(range.start(), 0);
    assert!(range.end() > 4);
}

#[test]
fn liveness_deletes_dead_code() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let one = b.i32_const(1);
    let dead = b.arith(ArithOp::Add, Type::I32, one, one);
    let live = b.arith(ArithOp::Add, Type::I32, one, one);
    b.ret(Some(Operand::Var(live)));
    let mut cfg = b.finish();
    prepare(&mut cfg);

    let entry = cfg.entry;
    let first = cfg.node(entry).insts[0];
    assert!(cfg.inst(first).is_deleted(), "unused add should be deleted");
    assert!(cfg.var(dead).live_range.is_empty());
}

#[test]
fn liveness_scales_weight_by_loop_depth() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let header = b.make_node();
    let body = b.make_node();
    let exit = b.make_node();
    let x = b.add_arg(Type::I32);
    let y = b.add_arg(Type::I32);
    let zero = b.i32_const(0);
    // y is used once outside the loop; x once inside.
    let c0 = b.icmp(ICond::Ne, Operand::Var(y), zero);
    let _ = c0;
    b.br(header);
    b.switch_to(header);
    let c = b.icmp(ICond::Ne, Operand::Var(x), zero);
    b.br_if(Operand::Var(c), body, exit);
    b.switch_to(body);
    b.br(header);
    b.switch_to(exit);
    b.ret(None);
    let mut cfg = b.finish();
    prepare(&mut cfg);

    assert!(cfg.var(x).weight() > cfg.var(y).weight());
}

// --- Allocator ---

#[test]
fn alloc_sequential_ranges_share_register() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let one = b.i32_const(1);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t1 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t0), one);
    let t2 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t1), one);
    b.ret(Some(Operand::Var(t2)));
    let mut cfg = b.finish();
    let kills = prepare(&mut cfg);

    let env = FlatEnv::new(4);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(4), &kills);

    for v in [t0, t1, t2] {
        assert!(cfg.var(v).has_reg(), "{} should be colored", v);
    }
    assert!(!scan.has_evictions());
}

#[test]
fn alloc_overlapping_ranges_get_distinct_registers() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let entry = b.cur_node();
    let one = b.i32_const(1);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t1 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t2 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t0), Operand::Var(t1));
    b.ret(Some(Operand::Var(t2)));
    let mut cfg = b.finish();
    fake_use(&mut cfg, entry, &[t0, t1]);
    let kills = prepare(&mut cfg);

    let env = FlatEnv::new(4);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(4), &kills);

    assert_ne!(cfg.var(t0).reg_num(), cfg.var(t1).reg_num());
}

#[test]
fn alloc_precolored_is_respected() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let one = b.i32_const(1);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t1 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t2 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t0), Operand::Var(t1));
    b.ret(Some(Operand::Var(t2)));
    let mut cfg = b.finish();
    cfg.var_mut(t1).set_reg_num(RegNum(2));
    let kills = prepare(&mut cfg);

    let env = FlatEnv::new(4);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(4), &kills);

    assert_eq!(cfg.var(t1).reg_num(), Some(RegNum(2)));
    assert_ne!(cfg.var(t0).reg_num(), Some(RegNum(2)));
}

#[test]
fn alloc_copy_preference_reuses_source_register() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let one = b.i32_const(1);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t1 = b.var(Type::I32);
    b.assign(t1, Operand::Var(t0));
    let t2 = b.arith(ArithOp::Add, Type::I32, Operand::Var(t1), one);
    b.ret(Some(Operand::Var(t2)));
    let mut cfg = b.finish();
    let kills = prepare(&mut cfg);

    let env = FlatEnv::new(4);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(4), &kills);

    // t1 is a copy of t0 whose range begins where t0's ends; the
    // preference should coalesce them onto one register.
    assert_eq!(cfg.var(t0).reg_num(), cfg.var(t1).reg_num());
}

#[test]
fn alloc_eviction_and_second_chance() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let entry = b.cur_node();
    let one = b.i32_const(1);
    // Three overlapping values but only two registers; t2 must have a
    // register and is defined last.
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t1 = b.arith(ArithOp::Add, Type::I32, one, one);
    let t2 = b.arith(ArithOp::Add, Type::I32, one, one);
    b.ret(None);
    let mut cfg = b.finish();
    fake_use(&mut cfg, entry, &[t0, t1, t2]);
    cfg.var_mut(t2).set_must_have_reg();
    let kills = prepare(&mut cfg);

    let env = FlatEnv::new(2);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(2), &kills);
    assert!(scan.has_evictions());

    let mut rounds = 0;
    while scan.has_evictions() && rounds < 10 {
        scan.scan(&mut cfg, RegAllocKind::SecondChance, all_regs(2), &kills);
        rounds += 1;
    }
    assert!(!scan.has_evictions());
    assert!(cfg.var(t2).has_reg());
}

#[test]
fn alloc_no_overlapping_assignments() {
    // RA-1: after allocation, no two variables sharing a register have
    // conflicting live ranges.
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let entry = b.cur_node();
    let one = b.i32_const(1);
    let mut vars = Vec::new();
    for _ in 0..6 {
        vars.push(b.arith(ArithOp::Add, Type::I32, one, one));
    }
    b.ret(None);
    let mut cfg = b.finish();
    fake_use(&mut cfg, entry, &vars);
    let kills = prepare(&mut cfg);

    let env = FlatEnv::new(8);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(8), &kills);

    for (i, &a) in vars.iter().enumerate() {
        for &b2 in &vars[i + 1..] {
            let (va, vb) = (cfg.var(a), cfg.var(b2));
            if va.reg_num().is_some() && va.reg_num() == vb.reg_num() {
                let conflict = va.live_range.overlaps(&vb.live_range, false, 0)
                    && !va.live_range.overlaps_at_exactly_one_point(&vb.live_range);
                assert!(!conflict, "{} and {} share a register and overlap", a, b2);
            }
        }
    }
}

#[test]
fn alloc_scratch_register_avoided_across_calls() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx.clone(), "f");
    let entry = b.cur_node();
    let one = b.i32_const(1);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    // A machine call between def and use of t0.
    b.ret(None);
    let mut cfg = b.finish();
    let callee = Operand::Const(ctx.const_sym(0, "helper", false));
    let call = cfg.add_inst(Inst::new(
        InstKind::Machine(glacier_ir::MachineOp::Call),
        None,
        smallvec::smallvec![callee],
    ));
    cfg.node_mut(entry).insts.insert(1, call);
    fake_use(&mut cfg, entry, &[t0]);
    let kills = prepare(&mut cfg);
    assert_eq!(kills.len(), 1);

    // Register 0 is scratch; t0 lives across the call and must avoid it.
    let mut env = FlatEnv::new(2);
    env.scratch = RegSet::single(RegNum(0));
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(2), &kills);

    assert_eq!(cfg.var(t0).reg_num(), Some(RegNum(1)));
}

#[test]
fn alloc_inf_only_colors_only_infinite_weight() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let entry = b.cur_node();
    let one = b.i32_const(1);
    let plain = b.arith(ArithOp::Add, Type::I32, one, one);
    let inf = b.arith(ArithOp::Add, Type::I32, one, one);
    b.ret(None);
    let mut cfg = b.finish();
    fake_use(&mut cfg, entry, &[plain, inf]);
    cfg.var_mut(inf).set_must_have_reg();
    cfg.compute_edges();
    cfg.renumber_instructions();

    // No liveness pass: InfOnly synthesizes its own ranges.
    let env = FlatEnv::new(2);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::InfOnly, all_regs(2), &[]);

    assert!(cfg.var(inf).has_reg());
    assert!(!cfg.var(plain).has_reg());
}

#[test]
fn second_chance_noop_without_evictions() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let one = b.i32_const(1);
    let t0 = b.arith(ArithOp::Add, Type::I32, one, one);
    b.ret(Some(Operand::Var(t0)));
    let mut cfg = b.finish();
    let kills = prepare(&mut cfg);

    let env = FlatEnv::new(2);
    let mut scan = LinearScan::new(&env);
    scan.scan(&mut cfg, RegAllocKind::Global, all_regs(2), &kills);
    assert!(!scan.has_evictions());
    let before = cfg.var(t0).reg_num();

    scan.scan(&mut cfg, RegAllocKind::SecondChance, all_regs(2), &kills);
    assert!(!scan.has_evictions());
    assert_eq!(cfg.var(t0).reg_num(), before);
}
