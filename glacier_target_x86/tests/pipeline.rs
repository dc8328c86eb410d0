//! End-to-end pipeline tests: build a function, run the full O2
//! translation, and check the shape of the machine code.

use std::sync::Arc;

use glacier_ir::builder::FuncBuilder;
use glacier_ir::cond::BrCond;
use glacier_ir::constants::{Constant, GlobalContext};
use glacier_ir::inst::{ArithOp, BrTarget, ICond, InstKind, Intrinsic, MachineOp};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::NodeId;
use glacier_ir::Cfg;

use glacier_target_x86::{TargetConfig, TargetArch, TargetX86};

fn ctx() -> Arc<GlobalContext> {
    Arc::new(GlobalContext::new())
}

fn translate32(cfg: &mut Cfg) {
    let config = TargetConfig::new(TargetArch::X8632);
    let mut target = TargetX86::new(cfg, config);
    target.translate();
    assert!(!cfg.has_error(), "translation failed: {:?}", cfg.error());
}

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

fn mask_of(cfg: &Cfg, op: Operand) -> i32 {
    match cfg.ctx().const_info(op.as_const().expect("const mask")) {
        Constant::Int32(v) => v,
        other => panic!("unexpected mask constant {:?}", other),
    }
}

#[test]
fn compare_branch_fuses() {
    let mut b = FuncBuilder::new(ctx(), "cmp_br");
    // The false side is laid out next, so the branch keeps its
    // condition after fallthrough optimization.
    let on_false = b.make_node();
    let on_true = b.make_node();
    let x = b.add_arg(Type::I32);
    let y = b.add_arg(Type::I32);
    let c = b.icmp(ICond::Slt, Operand::Var(x), Operand::Var(y));
    b.br_if(Operand::Var(c), on_true, on_false);
    b.switch_to(on_true);
    b.ret(Some(Operand::Var(x)));
    b.switch_to(on_false);
    b.ret(Some(Operand::Var(y)));
    let mut cfg = b.finish();
    translate32(&mut cfg);

    // One cmp and one conditional branch; no setcc materialization.
    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Cmp)));
    assert!(
        !ops.iter().any(|o| matches!(o, MachineOp::Setcc(_))),
        "compare feeding a branch should not materialize the i1"
    );
    let br = ops
        .iter()
        .find_map(|o| match o {
            MachineOp::Br { cond: Some(c), .. } => Some(*c),
            _ => None,
        })
        .expect("conditional branch");
    assert_eq!(br, BrCond::L);
}

#[test]
fn fused_cmpxchg_cmp_br() {
    let mut b = FuncBuilder::new(ctx(), "cmpxchg_br");
    let fail = b.make_node();
    let ok = b.make_node();
    let ptr = b.add_arg(Type::I32);
    let expected = b.add_arg(Type::I32);
    let desired = b.add_arg(Type::I32);
    let seq_cst = b.i32_const(6);
    let prev = b
        .intrinsic(
            Intrinsic::AtomicCmpxchg,
            Some(Type::I32),
            &[
                Operand::Var(ptr),
                Operand::Var(expected),
                Operand::Var(desired),
                seq_cst,
                seq_cst,
            ],
        )
        .unwrap();
    let eq = b.icmp(ICond::Eq, Operand::Var(prev), Operand::Var(expected));
    b.br_if(Operand::Var(eq), ok, fail);
    b.switch_to(ok);
    b.ret(None);
    b.switch_to(fail);
    b.ret(None);
    let mut cfg = b.finish();
    translate32(&mut cfg);

    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops
        .iter()
        .any(|o| matches!(o, MachineOp::Cmpxchg { locked: true })));
    // The compare is subsumed: the branch keys directly off ZF.
    assert!(!ops.iter().any(|o| matches!(o, MachineOp::Cmp)));
    assert!(!ops.iter().any(|o| matches!(o, MachineOp::Setcc(_))));
    let br = ops
        .iter()
        .find_map(|o| match o {
            MachineOp::Br {
                cond: Some(c),
                target: BrTarget::Node(_),
                ..
            } => Some(*c),
            _ => None,
        })
        .expect("fused conditional branch");
    assert_eq!(br, BrCond::E);
}

#[test]
fn v4i32_multiply_without_sse41() {
    let mut b = FuncBuilder::new(ctx(), "vec_mul");
    let x = b.add_arg(Type::V4I32);
    let y = b.add_arg(Type::V4I32);
    let r = b.arith(ArithOp::Mul, Type::V4I32, Operand::Var(x), Operand::Var(y));
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    translate32(&mut cfg);

    let entry = cfg.entry;
    let mut pshufd_masks = Vec::new();
    let mut shufps_masks = Vec::new();
    let mut pmuludq = 0;
    for &iid in &cfg.node(entry).insts {
        let inst = cfg.inst(iid);
        if inst.is_deleted() {
            continue;
        }
        match inst.kind {
            InstKind::Machine(MachineOp::Pshufd) => {
                pshufd_masks.push(mask_of(&cfg, inst.srcs[1]));
            }
            InstKind::Machine(MachineOp::Shufps) => {
                shufps_masks.push(mask_of(&cfg, inst.srcs[2]));
            }
            InstKind::Machine(MachineOp::Pmuludq) => pmuludq += 1,
            _ => {}
        }
    }
    assert_eq!(pmuludq, 2);
    assert_eq!(shufps_masks, vec![0x88]);
    assert_eq!(pshufd_masks, vec![0x31, 0x31, 0xd8]);
    assert!(
        !machine_ops(&cfg, entry)
            .iter()
            .any(|o| matches!(o, MachineOp::Pmull)),
        "pmulld needs SSE4.1"
    );
}

#[test]
fn rmw_store_folds_to_memory_op() {
    // p[0] += x, with the loaded value otherwise unused: the store is
    // dead-code eliminated and the RMW becomes add [p], x.
    let mut b = FuncBuilder::new(ctx(), "rmw");
    let p = b.add_arg(Type::I32);
    let x = b.add_arg(Type::I32);
    let loaded = b.load(Type::I32, Operand::Var(p));
    let sum = b.arith(ArithOp::Add, Type::I32, Operand::Var(loaded), Operand::Var(x));
    b.store(Operand::Var(sum), Operand::Var(p));
    b.ret(None);
    let mut cfg = b.finish();
    translate32(&mut cfg);

    let ops = machine_ops(&cfg, cfg.entry);
    assert!(
        ops.iter().any(|o| matches!(o, MachineOp::AddRmw)),
        "expected a memory-destination add, got {:?}",
        ops
    );
    assert!(
        !ops.iter().any(|o| matches!(o, MachineOp::Store)),
        "the store should have been dead-code eliminated"
    );
}

#[test]
fn allocation_has_no_conflicting_assignments() {
    // RA-1 on a function with real register pressure.
    let mut b = FuncBuilder::new(ctx(), "pressure");
    let mut vals = Vec::new();
    for i in 0..10 {
        let c = b.i32_const(i);
        let d = b.i32_const(i + 1);
        vals.push(b.arith(ArithOp::Add, Type::I32, c, d));
    }
    // Sum everything so all values stay live to varying extents.
    let mut acc = Operand::Var(vals[0]);
    for &v in &vals[1..] {
        acc = Operand::Var(b.arith(ArithOp::Add, Type::I32, acc, Operand::Var(v)));
    }
    b.ret(Some(acc));
    let mut cfg = b.finish();
    translate32(&mut cfg);

    for i in 0..cfg.num_variables() {
        for j in (i + 1)..cfg.num_variables() {
            let a = cfg.var(glacier_ir::VarId(i as u32));
            let b2 = cfg.var(glacier_ir::VarId(j as u32));
            if a.ignore_liveness() || b2.ignore_liveness() {
                continue;
            }
            let (Some(ra), Some(rb)) = (a.reg_num(), b2.reg_num()) else {
                continue;
            };
            if ra != rb {
                continue;
            }
            let conflict = a.live_range.overlaps(&b2.live_range, false, 0)
                && !a.live_range.overlaps_at_exactly_one_point(&b2.live_range);
            assert!(
                !conflict,
                "variables {} and {} share r{} with overlapping ranges {} and {}",
                i, j, ra.0, a.live_range, b2.live_range
            );
        }
    }
}

#[test]
fn loads_fold_into_consumers() {
    let mut b = FuncBuilder::new(ctx(), "load_fold");
    let p = b.add_arg(Type::I32);
    let x = b.add_arg(Type::I32);
    let loaded = b.load(Type::I32, Operand::Var(p));
    let sum = b.arith(ArithOp::Add, Type::I32, Operand::Var(x), Operand::Var(loaded));
    b.ret(Some(Operand::Var(sum)));
    let mut cfg = b.finish();
    translate32(&mut cfg);

    // The add consumed the load: some arithmetic op reads memory and no
    // standalone load-of-[p] mov remains before it.
    let entry = cfg.entry;
    let mut add_reads_mem = false;
    for &iid in &cfg.node(entry).insts {
        let inst = cfg.inst(iid);
        if inst.is_deleted() {
            continue;
        }
        if matches!(inst.kind, InstKind::Machine(MachineOp::Add)) {
            add_reads_mem |= inst.srcs.iter().any(|s| s.as_mem().is_some());
        }
    }
    assert!(add_reads_mem, "the load should fold into the add");
}

#[test]
fn select_uses_cmov_for_i32() {
    let mut b = FuncBuilder::new(ctx(), "sel");
    let x = b.add_arg(Type::I32);
    let y = b.add_arg(Type::I32);
    let zero = b.i32_const(0);
    let c = b.icmp(ICond::Sgt, Operand::Var(x), zero);
    let r = b.select(Type::I32, Operand::Var(c), Operand::Var(x), Operand::Var(y));
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    translate32(&mut cfg);

    let ops = machine_ops(&cfg, cfg.entry);
    let cmov = ops
        .iter()
        .find_map(|o| match o {
            MachineOp::Cmov(c) => Some(*c),
            _ => None,
        })
        .expect("select of i32 uses cmov");
    // The compare folded into the cmov condition.
    assert_eq!(cmov, BrCond::G);
    assert!(!ops.iter().any(|o| matches!(o, MachineOp::Setcc(_))));
}

#[test]
fn x8664_call_uses_register_arguments() {
    let mut b = FuncBuilder::new(ctx(), "call64");
    let x = b.add_arg(Type::I64);
    let callee = Operand::Const(b.ctx().const_sym(0, "callee", false));
    let r = b
        .call(Some(Type::I64), callee, &[Operand::Var(x)])
        .unwrap();
    b.ret(Some(Operand::Var(r)));
    let mut cfg = b.finish();
    let config = TargetConfig::new(TargetArch::X8664);
    let mut target = TargetX86::new(&mut cfg, config);
    target.translate();
    assert!(!cfg.has_error());

    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Call)));
    // No outgoing stack stores: the lone argument travels in rdi.
    assert!(!ops.iter().any(|o| matches!(o, MachineOp::Store)));
}

#[test]
fn unreachable_lowers_to_ud2() {
    let mut b = FuncBuilder::new(ctx(), "trap");
    b.unreachable();
    let mut cfg = b.finish();
    translate32(&mut cfg);
    let ops = machine_ops(&cfg, cfg.entry);
    assert!(ops.iter().any(|o| matches!(o, MachineOp::Ud2)));
}
