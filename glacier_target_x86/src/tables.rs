//! Compare lowering tables.
//!
//! Scalar fcmp lowers through `ucomiss` flag patterns: ZF/PF/CF encode
//! greater, less, equal, and unordered. Each condition row gives the
//! operand swaps, up to two branch conditions, the default result, and
//! the packed-compare predicate for the vector form.
//!
//! 64-bit integer compares on the 32-bit target use a three-branch
//! high/low word sequence driven by the icmp64 rows.

use glacier_ir::cond::{BrCond, CmppsCond};
use glacier_ir::inst::{FCond, ICond};

/// One row of the fcmp lowering table.
#[derive(Debug, Clone, Copy)]
pub struct FcmpRow {
    /// Result when one of the branches fires.
    pub default: bool,
    pub swap_scalar_operands: bool,
    pub c1: Option<BrCond>,
    pub c2: Option<BrCond>,
    pub swap_vector_operands: bool,
    /// Packed-compare predicate; none for the conditions that need a
    /// two-compare combination (One, Ueq) or are constant (False, True).
    pub predicate: Option<CmppsCond>,
}

const fn row(
    default: bool,
    swap_scalar_operands: bool,
    c1: Option<BrCond>,
    c2: Option<BrCond>,
    swap_vector_operands: bool,
    predicate: Option<CmppsCond>,
) -> FcmpRow {
    FcmpRow {
        default,
        swap_scalar_operands,
        c1,
        c2,
        swap_vector_operands,
        predicate,
    }
}

/// Indexed by `FCond as usize`.
pub const TABLE_FCMP: [FcmpRow; 16] = [
    // False
    row(false, false, None, None, false, None),
    // Oeq: equal and ordered (ZF=1, PF=0).
    row(false, false, Some(BrCond::Ne), Some(BrCond::P), false, Some(CmppsCond::Eq)),
    // Ogt
    row(true, false, Some(BrCond::A), None, true, Some(CmppsCond::Lt)),
    // Oge
    row(true, false, Some(BrCond::Ae), None, true, Some(CmppsCond::Le)),
    // Olt: compare swapped, then "above".
    row(true, true, Some(BrCond::A), None, false, Some(CmppsCond::Lt)),
    // Ole
    row(true, true, Some(BrCond::Ae), None, false, Some(CmppsCond::Le)),
    // One: unequal and ordered (ZF=0); vector needs neq & ord.
    row(true, false, Some(BrCond::Ne), None, false, None),
    // Ord
    row(true, false, Some(BrCond::Np), None, false, Some(CmppsCond::Ord)),
    // Ueq: equal or unordered (ZF=1); vector needs eq | unord.
    row(true, false, Some(BrCond::E), None, false, None),
    // Ugt
    row(true, true, Some(BrCond::B), None, false, Some(CmppsCond::Nle)),
    // Uge
    row(true, true, Some(BrCond::Be), None, false, Some(CmppsCond::Nlt)),
    // Ult
    row(true, false, Some(BrCond::B), None, true, Some(CmppsCond::Nle)),
    // Ule
    row(true, false, Some(BrCond::Be), None, true, Some(CmppsCond::Nlt)),
    // Une: unequal or unordered (ZF=0 or PF=1).
    row(true, false, Some(BrCond::Ne), Some(BrCond::P), false, Some(CmppsCond::Neq)),
    // Uno
    row(true, false, Some(BrCond::P), None, false, Some(CmppsCond::Unord)),
    // True
    row(true, false, None, None, false, None),
];

pub fn fcmp_row(cond: FCond) -> &'static FcmpRow {
    &TABLE_FCMP[cond.index()]
}

/// Whether the scalar lowering of this fcmp condition needs two branches.
pub fn fcmp_is_complex(cond: FCond) -> bool {
    fcmp_row(cond).c2.is_some()
}

/// One row of the 64-bit icmp lowering table:
/// `cmp hi; br C1 -> true; br C2 -> false; cmp lo; br C3 -> true`.
#[derive(Debug, Clone, Copy)]
pub struct Icmp64Row {
    pub c1: Option<BrCond>,
    pub c2: Option<BrCond>,
    pub c3: BrCond,
}

pub fn icmp64_row(cond: ICond) -> Icmp64Row {
    let (c1, c2, c3) = match cond {
        ICond::Eq => (None, Some(BrCond::Ne), BrCond::E),
        ICond::Ne => (Some(BrCond::Ne), None, BrCond::Ne),
        ICond::Ugt => (Some(BrCond::A), Some(BrCond::B), BrCond::A),
        ICond::Uge => (Some(BrCond::A), Some(BrCond::B), BrCond::Ae),
        ICond::Ult => (Some(BrCond::B), Some(BrCond::A), BrCond::B),
        ICond::Ule => (Some(BrCond::B), Some(BrCond::A), BrCond::Be),
        ICond::Sgt => (Some(BrCond::G), Some(BrCond::L), BrCond::A),
        ICond::Sge => (Some(BrCond::G), Some(BrCond::L), BrCond::Ae),
        ICond::Slt => (Some(BrCond::L), Some(BrCond::G), BrCond::B),
        ICond::Sle => (Some(BrCond::L), Some(BrCond::G), BrCond::Be),
    };
    Icmp64Row { c1, c2, c3 }
}

/// Native (32-bit and narrower, plus 64-bit on the 64-bit target) icmp
/// condition mapping.
pub fn icmp_to_cond(cond: ICond) -> BrCond {
    match cond {
        ICond::Eq => BrCond::E,
        ICond::Ne => BrCond::Ne,
        ICond::Ugt => BrCond::A,
        ICond::Uge => BrCond::Ae,
        ICond::Ult => BrCond::B,
        ICond::Ule => BrCond::Be,
        ICond::Sgt => BrCond::G,
        ICond::Sge => BrCond::Ge,
        ICond::Slt => BrCond::L,
        ICond::Sle => BrCond::Le,
    }
}
