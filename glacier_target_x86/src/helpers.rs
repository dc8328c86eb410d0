//! The helper-call pre-pass: rewriting operations with no native x86
//! lowering into calls to named runtime helpers, and scalarizing vector
//! operations the hardware cannot do.
//!
//! Runs before any lowering so that the later passes only ever see
//! operations they can emit directly. Helper arguments are at least 32
//! bits wide; narrower values are zero-extended first.

use smallvec::smallvec;

use glacier_ir::inst::{ArithOp, CastOp, Inst, InstKind, Intrinsic};
use glacier_ir::operand::Operand;
use glacier_ir::types::Type;
use glacier_ir::value::InstId;

use crate::lower::{vector_scalarize, TargetX86};

pub const H_CTPOP_I32: &str = "ctpop_i32";
pub const H_CTPOP_I64: &str = "ctpop_i64";
pub const H_UDIV_I64: &str = "udiv_i64";
pub const H_SDIV_I64: &str = "sdiv_i64";
pub const H_UREM_I64: &str = "urem_i64";
pub const H_SREM_I64: &str = "srem_i64";
pub const H_FREM_F32: &str = "frem_f32";
pub const H_FREM_F64: &str = "frem_f64";
pub const H_FPTOSI_F32_I64: &str = "fptosi_f32_i64";
pub const H_FPTOSI_F64_I64: &str = "fptosi_f64_i64";
pub const H_FPTOUI_F32_I32: &str = "fptoui_f32_i32";
pub const H_FPTOUI_F64_I32: &str = "fptoui_f64_i32";
pub const H_FPTOUI_F32_I64: &str = "fptoui_f32_i64";
pub const H_FPTOUI_F64_I64: &str = "fptoui_f64_i64";
pub const H_FPTOUI_4XI32_F32: &str = "fptoui_4xi32_f32";
pub const H_SITOFP_I64_F32: &str = "sitofp_i64_f32";
pub const H_SITOFP_I64_F64: &str = "sitofp_i64_f64";
pub const H_UITOFP_I32_F32: &str = "uitofp_i32_f32";
pub const H_UITOFP_I32_F64: &str = "uitofp_i32_f64";
pub const H_UITOFP_I64_F32: &str = "uitofp_i64_f32";
pub const H_UITOFP_I64_F64: &str = "uitofp_i64_f64";
pub const H_UITOFP_4XI32_4XF32: &str = "uitofp_4xi32_4xf32";
pub const H_BITCAST_8XI1_I8: &str = "bitcast_8xi1_i8";
pub const H_BITCAST_16XI1_I16: &str = "bitcast_16xi1_i16";
pub const H_BITCAST_I8_8XI1: &str = "bitcast_i8_8xi1";
pub const H_BITCAST_I16_16XI1: &str = "bitcast_i16_16xi1";
pub const H_MEMCPY: &str = "memcpy";
pub const H_MEMMOVE: &str = "memmove";
pub const H_MEMSET: &str = "memset";
pub const H_SETJMP: &str = "setjmp";
pub const H_LONGJMP: &str = "longjmp";
pub const H_READ_TP: &str = "read_tp";

impl TargetX86<'_> {
    /// Walk every instruction and rewrite the ones that need helpers.
    /// Rewrites splice replacement instructions in place of the
    /// originals.
    pub fn gen_target_helper_calls(&mut self) {
        for nid in self.cfg.node_ids() {
            let ids = self.cfg.node(nid).insts.clone();
            let mut new_list: Vec<InstId> = Vec::new();
            for iid in ids {
                if self.cfg.inst(iid).is_deleted() {
                    new_list.push(iid);
                    continue;
                }
                let mut replacements = Vec::new();
                self.gen_helper_call_for(iid, &mut replacements);
                if replacements.is_empty() {
                    new_list.push(iid);
                } else {
                    new_list.extend(replacements);
                    new_list.push(iid);
                }
            }
            self.cfg.node_mut(nid).insts = new_list;
        }
    }

    /// Rewrite one instruction if needed; replacement instruction ids go
    /// to `out` and the original is deleted.
    fn gen_helper_call_for(&mut self, iid: InstId, out: &mut Vec<InstId>) {
        let kind = self.cfg.inst(iid).kind.clone();
        match kind {
            InstKind::Arithmetic(op) => self.gen_helper_for_arith(iid, op, out),
            InstKind::Cast(op) => self.gen_helper_for_cast(iid, op, out),
            InstKind::Call | InstKind::IntrinsicCall(_) | InstKind::Ret => {
                // No rewrite, but the outgoing-args area must be sized.
                self.note_stack_args(iid, &kind);
            }
            _ => {}
        }
    }

    fn note_stack_args(&mut self, iid: InstId, kind: &InstKind) {
        let (arg_types, ret): (Vec<Type>, Type) = match kind {
            InstKind::Call => {
                let inst = self.cfg.inst(iid);
                let args = inst.srcs[1..]
                    .iter()
                    .map(|&a| self.operand_type(a))
                    .collect();
                let ret = inst
                    .dest
                    .map(|d| self.cfg.var(d).ty)
                    .unwrap_or(Type::Void);
                (args, ret)
            }
            InstKind::IntrinsicCall(id) => {
                let word = self.word_type();
                match id {
                    Intrinsic::Ctpop => {
                        let ty = self.operand_type(self.cfg.inst(iid).srcs[0]);
                        (vec![ty], Type::I32)
                    }
                    Intrinsic::Longjmp => (vec![word, word], Type::Void),
                    Intrinsic::Memcpy | Intrinsic::Memmove | Intrinsic::Memset => {
                        (vec![word, word, word], Type::Void)
                    }
                    Intrinsic::ReadTp => (vec![], Type::I32),
                    Intrinsic::Setjmp => (vec![word], Type::I32),
                    _ => return,
                }
            }
            InstKind::Ret => {
                let inst = self.cfg.inst(iid);
                if inst.srcs.is_empty() {
                    return;
                }
                let ty = self.operand_type(inst.srcs[0]);
                if !ty.is_scalar_float() {
                    return;
                }
                (vec![], ty)
            }
            _ => return,
        };
        let bytes = self.call_stack_bytes(&arg_types, ret);
        self.update_max_out_args(bytes);
    }

    fn gen_helper_for_arith(&mut self, iid: InstId, op: ArithOp, out: &mut Vec<InstId>) {
        let dest = match self.cfg.inst(iid).dest {
            Some(d) => d,
            None => return,
        };
        let dest_ty = self.cfg.var(dest).ty;
        let helper = if !self.config.is_64bit() && dest_ty == Type::I64 {
            match op {
                ArithOp::Udiv => H_UDIV_I64,
                ArithOp::Sdiv => H_SDIV_I64,
                ArithOp::Urem => H_UREM_I64,
                ArithOp::Srem => H_SREM_I64,
                _ => return,
            }
        } else if dest_ty.is_vector() {
            match op {
                ArithOp::Mul if dest_ty == Type::V16I8 => {
                    self.scalarize(iid, op, out);
                    return;
                }
                ArithOp::Mul => return,
                ArithOp::Shl
                | ArithOp::Lshr
                | ArithOp::Ashr
                | ArithOp::Udiv
                | ArithOp::Urem
                | ArithOp::Sdiv
                | ArithOp::Srem
                | ArithOp::Frem => {
                    self.scalarize(iid, op, out);
                    return;
                }
                _ => return,
            }
        } else {
            match op {
                ArithOp::Frem => {
                    if dest_ty == Type::F32 {
                        H_FREM_F32
                    } else {
                        H_FREM_F64
                    }
                }
                _ => return,
            }
        };
        let srcs = self.cfg.inst(iid).srcs.clone();
        self.replace_with_call(iid, helper, Some(dest), &srcs, out);
    }

    fn gen_helper_for_cast(&mut self, iid: InstId, op: CastOp, out: &mut Vec<InstId>) {
        let dest = self.cfg.inst(iid).dest.expect("cast without dest");
        let dest_ty = self.cfg.var(dest).ty;
        let mut src = self.cfg.inst(iid).srcs[0];
        let src_ty = self.operand_type(src);
        let helper = match op {
            CastOp::Fptosi => {
                if !self.config.is_64bit() && dest_ty == Type::I64 {
                    if src_ty == Type::F32 {
                        H_FPTOSI_F32_I64
                    } else {
                        H_FPTOSI_F64_I64
                    }
                } else {
                    return;
                }
            }
            CastOp::Fptoui => {
                if dest_ty.is_vector() {
                    debug_assert!(dest_ty == Type::V4I32 && src_ty == Type::V4F32);
                    H_FPTOUI_4XI32_F32
                } else if dest_ty == Type::I64
                    || (!self.config.is_64bit() && dest_ty == Type::I32)
                {
                    if self.config.is_64bit() || dest_ty == Type::I64 {
                        if src_ty == Type::F32 {
                            H_FPTOUI_F32_I64
                        } else {
                            H_FPTOUI_F64_I64
                        }
                    } else if src_ty == Type::F32 {
                        H_FPTOUI_F32_I32
                    } else {
                        H_FPTOUI_F64_I32
                    }
                } else {
                    return;
                }
            }
            CastOp::Sitofp => {
                if !self.config.is_64bit() && src_ty == Type::I64 {
                    if dest_ty == Type::F32 {
                        H_SITOFP_I64_F32
                    } else {
                        H_SITOFP_I64_F64
                    }
                } else {
                    return;
                }
            }
            CastOp::Uitofp => {
                if src_ty.is_vector() {
                    debug_assert!(dest_ty == Type::V4F32 && src_ty == Type::V4I32);
                    H_UITOFP_4XI32_4XF32
                } else if src_ty == Type::I64 || (!self.config.is_64bit() && src_ty == Type::I32) {
                    if src_ty == Type::I32 {
                        if dest_ty == Type::F32 {
                            H_UITOFP_I32_F32
                        } else {
                            H_UITOFP_I32_F64
                        }
                    } else if dest_ty == Type::F32 {
                        H_UITOFP_I64_F32
                    } else {
                        H_UITOFP_I64_F64
                    }
                } else {
                    return;
                }
            }
            CastOp::Bitcast => {
                if dest_ty == src_ty {
                    return;
                }
                match dest_ty {
                    Type::I8 => {
                        debug_assert_eq!(src_ty, Type::V8I1);
                        H_BITCAST_8XI1_I8
                    }
                    Type::I16 => {
                        debug_assert_eq!(src_ty, Type::V16I1);
                        H_BITCAST_16XI1_I16
                    }
                    Type::V8I1 => {
                        debug_assert_eq!(src_ty, Type::I8);
                        // Helper arguments must be at least 32 bits.
                        src = self.widen_to_word(src, out);
                        H_BITCAST_I8_8XI1
                    }
                    Type::V16I1 => {
                        debug_assert_eq!(src_ty, Type::I16);
                        src = self.widen_to_word(src, out);
                        H_BITCAST_I16_16XI1
                    }
                    _ => return,
                }
            }
            _ => return,
        };
        self.replace_with_call(iid, helper, Some(dest), &[src], out);
    }

    fn widen_to_word(&mut self, src: Operand, out: &mut Vec<InstId>) -> Operand {
        let wide = self.cfg.make_variable(self.word_type());
        let cast = Inst::new(InstKind::Cast(CastOp::Zext), Some(wide), smallvec![src]);
        out.push(self.cfg.add_inst(cast));
        Operand::Var(wide)
    }

    fn replace_with_call(
        &mut self,
        iid: InstId,
        helper: &str,
        dest: Option<glacier_ir::VarId>,
        args: &[Operand],
        out: &mut Vec<InstId>,
    ) {
        let callee = Operand::Const(self.cfg.ctx().const_sym(0, helper, false));
        let mut srcs: smallvec::SmallVec<[Operand; 4]> = smallvec![callee];
        srcs.extend_from_slice(args);
        let arg_types: Vec<Type> = args.iter().map(|&a| self.operand_type(a)).collect();
        let ret = dest.map(|d| self.cfg.var(d).ty).unwrap_or(Type::Void);
        let bytes = self.call_stack_bytes(&arg_types, ret);
        self.update_max_out_args(bytes);
        let call = Inst::new(InstKind::Call, dest, srcs);
        out.push(self.cfg.add_inst(call));
        self.cfg.inst_mut(iid).set_deleted();
        log::debug!("{}: rewrote inst {} into call to {}", self.cfg.name, iid.0, helper);
    }

    fn scalarize(&mut self, iid: InstId, op: ArithOp, out: &mut Vec<InstId>) {
        let dest = self.cfg.inst(iid).dest.expect("scalarize without dest");
        let src0 = self.cfg.inst(iid).srcs[0];
        let src1 = self.cfg.inst(iid).srcs[1];
        let new_ids = vector_scalarize(self.cfg, op, dest, src0, src1);
        // The scalar ops may themselves need helpers (e.g. frem).
        for id in new_ids {
            let mut nested = Vec::new();
            self.gen_helper_call_for(id, &mut nested);
            if nested.is_empty() {
                out.push(id);
            } else {
                out.extend(nested);
                out.push(id);
            }
        }
        self.cfg.inst_mut(iid).set_deleted();
    }
}
