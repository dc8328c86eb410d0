//! Unit tests for the IR data model.

use std::sync::Arc;

use smallvec::smallvec;

use crate::builder::FuncBuilder;
use crate::constants::{Constant, GlobalContext};
use crate::inst::{ArithOp, ICond, Inst, InstKind};
use crate::liverange::LiveRange;
use crate::metadata::VariablesMetadata;
use crate::operand::Operand;
use crate::types::Type;

#[test]
fn type_properties() {
    assert_eq!(Type::I64.width_in_bytes(), 8);
    assert_eq!(Type::V4I32.num_elements(), 4);
    assert_eq!(Type::V4I32.element_type(), Type::I32);
    assert_eq!(Type::V16I8.width_in_bytes(), 16);
    assert!(Type::V8I1.is_vector_bool());
    assert!(!Type::V8I1.is_load_store());
    assert_eq!(Type::V8I16.compare_result_type(), Type::V8I1);
    assert_eq!(Type::F64.compare_result_type(), Type::I1);
    assert!(Type::I1.is_byte_sized());
    assert_eq!(Type::I1.scalar_int_bit_width(), 1);
}

#[test]
fn constant_interning() {
    let ctx = GlobalContext::new();
    let a = ctx.const_int32(42);
    let b = ctx.const_int32(42);
    assert_eq!(a, b);
    let c = ctx.const_int32(43);
    assert_ne!(a, c);

    let r1 = ctx.const_sym(8, "table", false);
    let r2 = ctx.const_sym(8, "table", false);
    let r3 = ctx.const_sym(8, "table", true);
    assert_eq!(r1, r2);
    assert_ne!(r1, r3);

    match ctx.const_info(r1) {
        Constant::Relocatable { offset, .. } => assert_eq!(offset, 8),
        other => panic!("unexpected constant {:?}", other),
    }
}

#[test]
fn float_interning_by_bits() {
    let ctx = GlobalContext::new();
    let pos = ctx.const_f32(0.0);
    let neg = ctx.const_f32(-0.0);
    assert_ne!(pos, neg, "-0.0 must intern separately from 0.0");
}

#[test]
fn live_range_overlap() {
    let mut a = LiveRange::new();
    a.add_segment(0, 10);
    let mut b = LiveRange::new();
    b.add_segment(10, 20);
    assert!(!a.overlaps(&b, false, 0));

    let mut c = LiveRange::new();
    c.add_segment(4, 12);
    assert!(a.overlaps(&c, false, 0));

    // Holes are respected.
    let mut d = LiveRange::new();
    d.add_segment(0, 4);
    d.add_segment(16, 20);
    let mut e = LiveRange::new();
    e.add_segment(6, 8);
    assert!(!d.overlaps(&e, false, 0));
    assert!(d.overlaps(&b, false, 0));
}

#[test]
fn live_range_one_point() {
    // [0,11) and [10, 20): a's tail is b's head.
    let mut a = LiveRange::new();
    a.add_segment(0, 11);
    let mut b = LiveRange::new();
    b.add_segment(10, 20);
    assert!(a.overlaps(&b, false, 0));
    assert!(a.overlaps_at_exactly_one_point(&b));
    assert!(b.overlaps_at_exactly_one_point(&a));
}

#[test]
fn live_range_trimming() {
    let mut a = LiveRange::new();
    a.add_segment(0, 10);
    a.add_segment(20, 30);
    let mut b = LiveRange::new();
    b.add_segment(5, 8);
    // The early segment is trimmed away, removing the overlap.
    assert!(a.overlaps(&b, false, 0));
    assert!(!a.overlaps(&b, true, 10));
}

#[test]
fn last_use_bits() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let x = b.add_arg(Type::I32);
    let y = b.add_arg(Type::I32);
    let cfg = b.finish();

    let mut inst = Inst::new(
        InstKind::Arithmetic(ArithOp::Add),
        None,
        smallvec![Operand::Var(x), Operand::Var(y)],
    );
    inst.set_last_use(1);
    assert!(!inst.is_last_use(x));
    assert!(inst.is_last_use(y));
    drop(cfg);
}

#[test]
fn metadata_single_def_and_multi_block() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let a = b.add_arg(Type::I32);
    let one = b.i32_const(1);
    let t = b.arith(ArithOp::Add, Type::I32, Operand::Var(a), one);
    let exit = b.make_node();
    b.br(exit);
    b.switch_to(exit);
    let c = b.icmp(ICond::Eq, Operand::Var(t), one);
    let _ = c;
    b.ret(Some(Operand::Var(t)));
    let cfg = b.finish();

    let md = VariablesMetadata::init(&cfg);
    assert!(md.single_definition(t).is_some());
    assert!(!md.is_multi_def(t));
    // t is defined in the entry and used in exit.
    assert!(md.is_multi_block(t));
    // Arguments have no defining instruction.
    assert!(md.single_definition(a).is_none());
}

#[test]
fn phi_lowering_places_assignments() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let entry = b.cur_node();
    let left = b.make_node();
    let right = b.make_node();
    let join = b.make_node();

    let cond = b.add_arg(Type::I32);
    let c = b.icmp(ICond::Ne, Operand::Var(cond), b.i32_const(0));
    b.br_if(Operand::Var(c), left, right);
    b.switch_to(left);
    b.br(join);
    b.switch_to(right);
    b.br(join);
    b.switch_to(join);
    let one = b.i32_const(1);
    let two = b.i32_const(2);
    let phi = b.phi(Type::I32, &[(left, one), (right, two)]);
    b.ret(Some(Operand::Var(phi)));
    let mut cfg = b.finish();

    cfg.lower_phis_basic();
    assert!(cfg.node(join).phis.is_empty());
    // Each predecessor got an assignment before its terminator.
    for pred in [left, right] {
        let insts = &cfg.node(pred).insts;
        assert_eq!(insts.len(), 2);
        assert!(matches!(cfg.inst(insts[0]).kind, InstKind::Assign));
    }
    // The join node starts with the phi load.
    let first = cfg.node(join).insts[0];
    assert!(matches!(cfg.inst(first).kind, InstKind::Assign));
    assert_eq!(cfg.inst(first).dest, Some(phi));
    let _ = entry;
}

#[test]
fn loop_depth_tagging() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "loop");
    let entry = b.cur_node();
    let header = b.make_node();
    let body = b.make_node();
    let exit = b.make_node();

    let n = b.add_arg(Type::I32);
    b.br(header);
    b.switch_to(header);
    let c = b.icmp(ICond::Ne, Operand::Var(n), b.i32_const(0));
    b.br_if(Operand::Var(c), body, exit);
    b.switch_to(body);
    b.br(header);
    b.switch_to(exit);
    b.ret(None);
    let mut cfg = b.finish();

    cfg.compute_loop_nest_depth();
    assert_eq!(cfg.node(entry).loop_nest_depth, 0);
    assert_eq!(cfg.node(header).loop_nest_depth, 1);
    assert_eq!(cfg.node(body).loop_nest_depth, 1);
    assert_eq!(cfg.node(exit).loop_nest_depth, 0);
}

#[test]
fn renumbering_is_even_and_increasing() {
    let ctx = Arc::new(GlobalContext::new());
    let mut b = FuncBuilder::new(ctx, "f");
    let x = b.add_arg(Type::I32);
    let t = b.arith(ArithOp::Add, Type::I32, Operand::Var(x), b.i32_const(1));
    b.ret(Some(Operand::Var(t)));
    let mut cfg = b.finish();

    cfg.renumber_instructions();
    let mut last = -1;
    for nid in cfg.node_ids() {
        for &iid in &cfg.node(nid).insts {
            let n = cfg.inst(iid).number;
            assert!(n % 2 == 0);
            assert!(n > last);
            last = n;
        }
    }
}
