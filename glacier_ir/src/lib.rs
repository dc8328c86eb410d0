//! Low-level IR for the glacier x86 backend.
//!
//! The IR is a typed, SSA-form instruction set over a closed set of scalar
//! and short-vector types, plus the lowered x86 machine instructions the
//! backend rewrites it into. Everything is arena-allocated per function and
//! referenced through typed u32 indices.

pub mod builder;
pub mod cfg;
pub mod cond;
pub mod constants;
pub mod display;
pub mod inst;
pub mod liverange;
pub mod metadata;
pub mod node;
pub mod operand;
pub mod types;
pub mod value;
pub mod variable;

pub use cfg::{Cfg, CfgError};
pub use constants::{ConstId, Constant, GlobalContext, SymbolId};
pub use inst::{ArithOp, CastOp, FCond, ICond, Inst, InstKind, Intrinsic, MachineOp};
pub use operand::{MemOperand, Operand};
pub use types::Type;
pub use value::{InstId, LabelId, NodeId, RegNum, VarId};
pub use variable::{RegClass, RegWeight, Variable};

#[cfg(test)]
mod tests;
