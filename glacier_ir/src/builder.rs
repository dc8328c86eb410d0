//! A small function builder for constructing CFGs by hand.
//!
//! The frontend reader is out of scope; tests and embedders use this
//! builder to assemble LLIR functions directly.

use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::cfg::Cfg;
use crate::constants::GlobalContext;
use crate::inst::{ArithOp, CastOp, FCond, ICond, Inst, InstKind, Intrinsic};
use crate::operand::Operand;
use crate::types::Type;
use crate::value::{NodeId, VarId};

/// Builds one function, appending instructions to a current node.
pub struct FuncBuilder {
    cfg: Cfg,
    cur: NodeId,
}

impl FuncBuilder {
    pub fn new(ctx: Arc<GlobalContext>, name: &str) -> Self {
        let mut cfg = Cfg::new(ctx, name);
        let entry = cfg.make_node();
        cfg.entry = entry;
        Self { cfg, cur: entry }
    }

    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    pub fn ctx(&self) -> Arc<GlobalContext> {
        self.cfg.ctx().clone()
    }

    /// Finish building: recompute edges and hand the CFG over.
    pub fn finish(mut self) -> Cfg {
        self.cfg.compute_edges();
        self.cfg
    }

    pub fn make_node(&mut self) -> NodeId {
        self.cfg.make_node()
    }

    pub fn switch_to(&mut self, node: NodeId) {
        self.cur = node;
    }

    pub fn cur_node(&self) -> NodeId {
        self.cur
    }

    pub fn add_arg(&mut self, ty: Type) -> VarId {
        let v = self.cfg.make_variable(ty);
        self.cfg.add_arg(v);
        v
    }

    pub fn var(&mut self, ty: Type) -> VarId {
        self.cfg.make_variable(ty)
    }

    pub fn i32_const(&self, value: i32) -> Operand {
        Operand::Const(self.cfg.ctx().const_int32(value))
    }

    pub fn i64_const(&self, value: i64) -> Operand {
        Operand::Const(self.cfg.ctx().const_int64(value))
    }

    fn push(&mut self, kind: InstKind, dest: Option<VarId>, srcs: SmallVec<[Operand; 4]>) {
        let id = self.cfg.add_inst(Inst::new(kind, dest, srcs));
        self.cfg.node_mut(self.cur).insts.push(id);
    }

    pub fn assign(&mut self, dest: VarId, src: Operand) {
        self.push(InstKind::Assign, Some(dest), smallvec![src]);
    }

    pub fn arith(&mut self, op: ArithOp, ty: Type, a: Operand, b: Operand) -> VarId {
        let dest = self.var(ty);
        self.push(InstKind::Arithmetic(op), Some(dest), smallvec![a, b]);
        dest
    }

    pub fn icmp(&mut self, cond: ICond, a: Operand, b: Operand) -> VarId {
        let dest = self.var(Type::I1);
        self.push(InstKind::Icmp(cond), Some(dest), smallvec![a, b]);
        dest
    }

    pub fn fcmp(&mut self, cond: FCond, a: Operand, b: Operand) -> VarId {
        let dest = self.var(Type::I1);
        self.push(InstKind::Fcmp(cond), Some(dest), smallvec![a, b]);
        dest
    }

    pub fn cast(&mut self, op: CastOp, to: Type, src: Operand) -> VarId {
        let dest = self.var(to);
        self.push(InstKind::Cast(op), Some(dest), smallvec![src]);
        dest
    }

    pub fn load(&mut self, ty: Type, addr: Operand) -> VarId {
        let dest = self.var(ty);
        self.push(InstKind::Load, Some(dest), smallvec![addr]);
        dest
    }

    pub fn store(&mut self, data: Operand, addr: Operand) {
        self.push(InstKind::Store, None, smallvec![data, addr]);
    }

    pub fn select(&mut self, ty: Type, cond: Operand, t: Operand, f: Operand) -> VarId {
        let dest = self.var(ty);
        self.push(InstKind::Select, Some(dest), smallvec![cond, t, f]);
        dest
    }

    pub fn br(&mut self, target: NodeId) {
        self.push(
            InstKind::Br {
                target_true: target,
                target_false: None,
            },
            None,
            smallvec![],
        );
    }

    pub fn br_if(&mut self, cond: Operand, target_true: NodeId, target_false: NodeId) {
        self.push(
            InstKind::Br {
                target_true,
                target_false: Some(target_false),
            },
            None,
            smallvec![cond],
        );
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        let srcs = match value {
            Some(v) => smallvec![v],
            None => smallvec![],
        };
        self.push(InstKind::Ret, None, srcs);
    }

    pub fn call(&mut self, ret_ty: Option<Type>, callee: Operand, args: &[Operand]) -> Option<VarId> {
        let dest = ret_ty.map(|ty| self.var(ty));
        let mut srcs: SmallVec<[Operand; 4]> = smallvec![callee];
        srcs.extend_from_slice(args);
        self.push(InstKind::Call, dest, srcs);
        dest
    }

    pub fn intrinsic(
        &mut self,
        id: Intrinsic,
        ret_ty: Option<Type>,
        args: &[Operand],
    ) -> Option<VarId> {
        let dest = ret_ty.map(|ty| self.var(ty));
        let mut srcs: SmallVec<[Operand; 4]> = smallvec![];
        srcs.extend_from_slice(args);
        self.push(InstKind::IntrinsicCall(id), dest, srcs);
        dest
    }

    pub fn alloca(&mut self, size: Operand, align: u32) -> VarId {
        let dest = self.var(Type::I32);
        self.push(
            InstKind::Alloca {
                align,
                known_frame_offset: false,
            },
            Some(dest),
            smallvec![size],
        );
        dest
    }

    pub fn unreachable(&mut self) {
        self.push(InstKind::Unreachable, None, smallvec![]);
    }

    /// Add a phi to the current node. `incoming` pairs each predecessor
    /// with the operand flowing in along that edge.
    pub fn phi(&mut self, ty: Type, incoming: &[(NodeId, Operand)]) -> VarId {
        let dest = self.var(ty);
        let preds: SmallVec<[NodeId; 4]> = incoming.iter().map(|(n, _)| *n).collect();
        let srcs: SmallVec<[Operand; 4]> = incoming.iter().map(|(_, o)| *o).collect();
        let id = self
            .cfg
            .add_inst(Inst::new(InstKind::Phi { preds }, Some(dest), srcs));
        self.cfg.node_mut(self.cur).phis.push(id);
        dest
    }
}
