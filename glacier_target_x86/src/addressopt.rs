//! Address-mode synthesis: folding assignment/add/shift chains feeding a
//! load or store address into a single x86 memory operand
//! `<relocatable + offset>(base, index, 1<<shift)`.
//!
//! A fixed-point loop applies local rewrite rules until none fires. Every
//! variable walked through must be single-definition and single-block;
//! offset arithmetic is overflow-checked before committing, and a rewrite
//! that would overflow leaves the original instructions in place. The
//! consumed arithmetic becomes dead and is removed by the next liveness
//! pass.

use glacier_ir::cfg::Cfg;
use glacier_ir::constants::{ConstId, Constant};
use glacier_ir::inst::{ArithOp, Inst, InstKind};
use glacier_ir::metadata::VariablesMetadata;
use glacier_ir::operand::{MemOperand, Operand};
use glacier_ir::value::VarId;

/// The in-progress canonical address expression.
#[derive(Debug, Clone, Copy)]
struct AddrParts {
    relocatable: Option<ConstId>,
    offset: i32,
    base: Option<VarId>,
    index: Option<VarId>,
    shift: u16,
}

fn usable(cfg: &Cfg, md: &VariablesMetadata, v: VarId) -> bool {
    !md.is_multi_def(v) && !md.is_multi_block(v) && !cfg.var(v).is_rematerializable()
}

/// `var = src_var` substitutes the source; `var = const` folds into the
/// offset; `var = reloc` adopts the relocatable.
fn match_assign(
    cfg: &Cfg,
    md: &VariablesMetadata,
    var: &mut Option<VarId>,
    relocatable: &mut Option<ConstId>,
    offset: &mut i32,
) -> bool {
    let Some(v) = *var else {
        return false;
    };
    let Some(def) = md.single_definition(v) else {
        return false;
    };
    let inst = cfg.inst(def);
    if !matches!(inst.kind, InstKind::Assign) {
        return false;
    }
    match inst.srcs[0] {
        Operand::Var(src) => {
            if usable(cfg, md, src) {
                *var = Some(src);
                return true;
            }
        }
        Operand::Const(c) => match cfg.ctx().const_info(c) {
            Constant::Int32(more) => {
                let Some(sum) = offset.checked_add(more) else {
                    return false;
                };
                *var = None;
                *offset = sum;
                return true;
            }
            Constant::Relocatable { .. } => {
                if relocatable.is_none() {
                    *var = None;
                    *relocatable = Some(c);
                    return true;
                }
            }
            _ => {}
        },
        _ => {}
    }
    false
}

/// `base = v1 + v2` with no index yet splits into base and index.
fn match_combined_base_index(cfg: &Cfg, md: &VariablesMetadata, parts: &mut AddrParts) -> bool {
    let Some(base) = parts.base else {
        return false;
    };
    if parts.index.is_some() {
        return false;
    }
    let Some(def) = md.single_definition(base) else {
        return false;
    };
    let inst = cfg.inst(def);
    if !matches!(inst.kind, InstKind::Arithmetic(ArithOp::Add)) {
        return false;
    }
    let (Some(v1), Some(v2)) = (inst.srcs[0].as_var(), inst.srcs[1].as_var()) else {
        return false;
    };
    if !usable(cfg, md, v1) || !usable(cfg, md, v2) {
        return false;
    }
    parts.base = Some(v1);
    parts.index = Some(v2);
    parts.shift = 0;
    true
}

/// `index = v * {1,2,4,8}` or `index = v << {0..3}` absorbs the scale
/// into the shift, as long as the combined shift stays within 3.
fn match_shifted_index(
    cfg: &Cfg,
    md: &VariablesMetadata,
    index: &mut Option<VarId>,
    shift: &mut u16,
) -> bool {
    let Some(ix) = *index else {
        return false;
    };
    let Some(def) = md.single_definition(ix) else {
        return false;
    };
    let inst = cfg.inst(def);
    let InstKind::Arithmetic(op) = inst.kind else {
        return false;
    };
    let Some(var) = inst.srcs[0].as_var() else {
        return false;
    };
    let Some(c) = inst.srcs[1].as_const() else {
        return false;
    };
    let Constant::Int32(value) = cfg.ctx().const_info(c) else {
        return false;
    };
    if !usable(cfg, md, var) {
        return false;
    }
    let log = match op {
        ArithOp::Mul => match value {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => return false,
        },
        ArithOp::Shl => match value {
            0..=3 => value as u16,
            _ => return false,
        },
        _ => return false,
    };
    if *shift + log > 3 {
        return false;
    }
    *index = Some(var);
    *shift += log;
    true
}

/// `base = v + C`, `base = C + v`, or `base = v - C` folds the constant
/// (or relocatable) into the offset.
fn match_offset_base(
    cfg: &Cfg,
    md: &VariablesMetadata,
    base: &mut Option<VarId>,
    relocatable: &mut Option<ConstId>,
    offset: &mut i32,
) -> bool {
    let Some(b) = *base else {
        return false;
    };
    let Some(def) = md.single_definition(b) else {
        return false;
    };
    let inst = cfg.inst(def);
    let InstKind::Arithmetic(op) = inst.kind else {
        return false;
    };
    let is_add = match op {
        ArithOp::Add => true,
        ArithOp::Sub => false,
        _ => return false,
    };
    let classify = |o: Operand| -> (Option<VarId>, Option<i32>, Option<ConstId>) {
        match o {
            Operand::Var(v) => (Some(v), None, None),
            Operand::Const(c) => match cfg.ctx().const_info(c) {
                Constant::Int32(v) => (None, Some(v), None),
                Constant::Relocatable { .. } => (None, None, Some(c)),
                _ => (None, None, None),
            },
            _ => (None, None, None),
        }
    };
    let (var0, const0, reloc0) = classify(inst.srcs[0]);
    let (var1, const1, reloc1) = classify(inst.srcs[1]);
    if var0.is_some() && var1.is_some() {
        return false;
    }
    // Subtracting a variable from a constant is not an address shape.
    if !is_add && var1.is_some() {
        return false;
    }
    let new_base = var0.or(var1);
    if let Some(nb) = new_base {
        if !usable(cfg, md, nb) {
            return false;
        }
    }
    // Two relocatables cannot combine, and one cannot be subtracted.
    if (relocatable.is_some() && (reloc0.is_some() || reloc1.is_some()))
        || (reloc0.is_some() && reloc1.is_some())
    {
        return false;
    }
    if !is_add && reloc1.is_some() {
        return false;
    }
    let mut new_offset = *offset;
    for c in [const0, const1] {
        if let Some(v) = c {
            let more = if is_add { Some(v) } else { v.checked_neg() };
            let Some(sum) = more.and_then(|m| new_offset.checked_add(m)) else {
                return false;
            };
            new_offset = sum;
        }
    }
    *base = new_base;
    *offset = new_offset;
    if let Some(r) = reloc0.or(reloc1) {
        *relocatable = Some(r);
    }
    true
}

/// Run the fixed-point rewriting. Returns the synthesized parts when at
/// least one rule fired.
fn compute_address_opt(
    cfg: &Cfg,
    md: &VariablesMetadata,
    base: VarId,
) -> Option<(Option<ConstId>, i32, Option<VarId>, Option<VarId>, u16)> {
    if md.is_multi_block(base) {
        return None;
    }
    let mut parts = AddrParts {
        relocatable: None,
        offset: 0,
        base: Some(base),
        index: None,
        shift: 0,
    };
    let mut optimized = false;
    loop {
        // Follow assignment chains on base and index.
        if match_assign(cfg, md, &mut parts.base, &mut parts.relocatable, &mut parts.offset) {
            optimized = true;
            // Prefer a non-null base when the assignment zapped it.
            if parts.base.is_none() && parts.index.is_some() && parts.shift == 0 {
                std::mem::swap(&mut parts.base, &mut parts.index);
            }
            continue;
        }
        if match_assign(cfg, md, &mut parts.index, &mut parts.relocatable, &mut parts.offset) {
            optimized = true;
            continue;
        }
        if match_combined_base_index(cfg, md, &mut parts) {
            optimized = true;
            continue;
        }
        if match_shifted_index(cfg, md, &mut parts.index, &mut parts.shift) {
            optimized = true;
            continue;
        }
        // With a zero shift the base/index choice was arbitrary; look for
        // shift opportunities on the base as well.
        if parts.shift == 0 && match_shifted_index(cfg, md, &mut parts.base, &mut parts.shift) {
            std::mem::swap(&mut parts.base, &mut parts.index);
            optimized = true;
            continue;
        }
        if match_offset_base(
            cfg,
            md,
            &mut parts.base,
            &mut parts.relocatable,
            &mut parts.offset,
        ) {
            optimized = true;
            continue;
        }
        if parts.shift == 0
            && match_offset_base(
                cfg,
                md,
                &mut parts.index,
                &mut parts.relocatable,
                &mut parts.offset,
            )
        {
            optimized = true;
            continue;
        }
        break;
    }
    if optimized {
        Some((
            parts.relocatable,
            parts.offset,
            parts.base,
            parts.index,
            parts.shift,
        ))
    } else {
        None
    }
}

fn materialize_offset(cfg: &Cfg, relocatable: Option<ConstId>, offset: i32) -> ConstId {
    match relocatable {
        None => cfg.ctx().const_int32(offset),
        Some(r) => {
            let Constant::Relocatable {
                sym,
                offset: roff,
                suppress_mangling,
            } = cfg.ctx().const_info(r)
            else {
                unreachable!("non-relocatable in relocatable slot");
            };
            cfg.ctx().const_sym_id(roff + offset, sym, suppress_mangling)
        }
    }
}

/// Apply address-mode optimization to every load and store in the
/// function.
pub fn do_address_opt(cfg: &mut Cfg) {
    let md = VariablesMetadata::init(cfg);
    for nid in cfg.node_ids() {
        let ids = cfg.node(nid).insts.clone();
        let mut rewritten = Vec::new();
        for (pos, &iid) in ids.iter().enumerate() {
            let inst = cfg.inst(iid);
            if inst.is_deleted() {
                continue;
            }
            let addr_pos = match inst.kind {
                InstKind::Load => 0,
                InstKind::Store => 1,
                _ => continue,
            };
            let Some(base) = inst.srcs[addr_pos].as_var() else {
                continue;
            };
            let Some((reloc, offset, nbase, nindex, shift)) =
                compute_address_opt(cfg, &md, base)
            else {
                continue;
            };
            log::debug!(
                "address opt in {}: base {} becomes {:?}+{} ({:?},{:?},{})",
                cfg.name,
                base,
                reloc,
                offset,
                nbase,
                nindex,
                shift
            );
            let offset_op = materialize_offset(cfg, reloc, offset);
            let mem = Operand::Mem(MemOperand::with_index(
                nbase,
                Some(offset_op),
                nindex,
                shift,
            ));
            let old = cfg.inst(iid);
            let mut srcs = old.srcs.clone();
            srcs[addr_pos] = mem;
            let new_inst = Inst::new(old.kind.clone(), old.dest, srcs);
            cfg.inst_mut(iid).set_deleted();
            let new_id = cfg.add_inst(new_inst);
            rewritten.push((pos, new_id));
        }
        // Place each rewritten instruction right after its original.
        for (pos, new_id) in rewritten.into_iter().rev() {
            cfg.node_mut(nid).insts.insert(pos + 1, new_id);
        }
    }
}
