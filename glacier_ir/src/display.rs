//! Compact textual dumps of the IR, for pass tracing and test diagnostics.

use std::fmt::Write;

use crate::cfg::Cfg;
use crate::constants::Constant;
use crate::inst::{Inst, InstKind};
use crate::operand::{Operand, SplitHalf};

fn fmt_operand(cfg: &Cfg, op: &Operand, out: &mut String) {
    match op {
        Operand::Var(v) => {
            let var = cfg.var(*v);
            let _ = write!(out, "%v{}:{}", v.0, var.ty.name());
            if let Some(r) = var.reg_num() {
                let _ = write!(out, "@r{}", r.0);
            }
        }
        Operand::Const(c) => match cfg.ctx().const_info(*c) {
            Constant::Int32(v) => {
                let _ = write!(out, "{}", v);
            }
            Constant::Int64(v) => {
                let _ = write!(out, "{}", v);
            }
            Constant::Float(bits) => {
                let _ = write!(out, "{}f", f32::from_bits(bits));
            }
            Constant::Double(bits) => {
                let _ = write!(out, "{}", f64::from_bits(bits));
            }
            Constant::Relocatable { sym, offset, .. } => {
                let _ = write!(out, "@{}+{}", cfg.ctx().symbol_name(sym), offset);
            }
            Constant::Undef(_) => {
                let _ = write!(out, "undef");
            }
        },
        Operand::Mem(m) => {
            out.push('[');
            if let Some(b) = m.base {
                let _ = write!(out, "%v{}", b.0);
            }
            if let Some(i) = m.index {
                let _ = write!(out, "+%v{}*{}", i.0, 1u32 << m.shift);
            }
            if let Some(off) = m.offset {
                out.push('+');
                fmt_operand(cfg, &Operand::Const(off), out);
            }
            out.push(']');
        }
        Operand::Split { var, half } => {
            let _ = write!(
                out,
                "%v{}.{}",
                var.0,
                if *half == SplitHalf::Low { "lo" } else { "hi" }
            );
        }
    }
}

/// One instruction on one line.
pub fn dump_inst(cfg: &Cfg, inst: &Inst) -> String {
    let mut out = String::new();
    if inst.number >= 0 {
        let _ = write!(out, "[{:>3}] ", inst.number);
    }
    if inst.is_deleted() {
        out.push_str("(deleted) ");
    } else if inst.is_dead() {
        out.push_str("(dead) ");
    }
    if let Some(d) = inst.dest {
        let _ = write!(out, "%v{} = ", d.0);
    }
    match &inst.kind {
        InstKind::Machine(op) => {
            let _ = write!(out, "x86.{:?}", op);
        }
        kind => {
            let _ = write!(out, "{:?}", kind);
        }
    }
    for (i, src) in inst.srcs.iter().enumerate() {
        out.push_str(if i == 0 { " " } else { ", " });
        fmt_operand(cfg, src, &mut out);
    }
    out
}

/// The whole function, one node per paragraph.
pub fn dump_cfg(cfg: &Cfg) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "fn {}:", cfg.name);
    for nid in cfg.node_ids() {
        let node = cfg.node(nid);
        let _ = writeln!(out, "{} (depth {}):", nid, node.loop_nest_depth);
        for &iid in node.phis.iter().chain(node.insts.iter()) {
            let _ = writeln!(out, "  {}", dump_inst(cfg, cfg.inst(iid)));
        }
    }
    out
}
