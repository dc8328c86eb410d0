//! Register files for the x86-32 and x86-64 targets.
//!
//! Register numbers index a flat per-target table. Sub-registers that
//! share silicon (al, ah, eax) have distinct numbers tied together by
//! alias sets, which is what lets the allocator hand out `ah` as the
//! remainder register of an 8-bit divide while `eax` is otherwise busy.

use glacier_ir::types::Type;
use glacier_ir::value::RegNum;
use glacier_ir::variable::RegClass;

use glacier_regalloc::{RegAllocEnv, RegSet};

/// Which x86 variant is being targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X8632,
    X8664,
}

impl TargetArch {
    pub fn is_64bit(self) -> bool {
        self == TargetArch::X8664
    }

    pub fn word_type(self) -> Type {
        if self.is_64bit() {
            Type::I64
        } else {
            Type::I32
        }
    }

    /// Hardware shift-amount mask: 6 low bits on 64-bit, 5 on 32-bit.
    pub fn shift_mask(self) -> u32 {
        if self.is_64bit() {
            0x3f
        } else {
            0x1f
        }
    }
}

/// Available instruction set extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstructionSet {
    Sse2,
    Sse41,
}

// x86-32 register numbering.
//
//  0..=7   eax ecx edx ebx esp ebp esi edi   (32- and 16-bit views)
//  8..=11  al  cl  dl  bl
// 12..=15  ah  ch  dh  bh
// 16..=23  xmm0..xmm7
pub mod x8632 {
    use glacier_ir::value::RegNum;

    pub const EAX: RegNum = RegNum(0);
    pub const ECX: RegNum = RegNum(1);
    pub const EDX: RegNum = RegNum(2);
    pub const EBX: RegNum = RegNum(3);
    pub const ESP: RegNum = RegNum(4);
    pub const EBP: RegNum = RegNum(5);
    pub const ESI: RegNum = RegNum(6);
    pub const EDI: RegNum = RegNum(7);
    pub const AL: RegNum = RegNum(8);
    pub const CL: RegNum = RegNum(9);
    pub const DL: RegNum = RegNum(10);
    pub const BL: RegNum = RegNum(11);
    pub const AH: RegNum = RegNum(12);
    pub const CH: RegNum = RegNum(13);
    pub const DH: RegNum = RegNum(14);
    pub const BH: RegNum = RegNum(15);
    pub const XMM0: RegNum = RegNum(16);
    pub const NUM_REGS: usize = 24;

    pub fn xmm(i: u8) -> RegNum {
        debug_assert!(i < 8);
        RegNum(16 + i)
    }
}

// x86-64 register numbering.
//
//  0..=15  rax rcx rdx rbx rsp rbp rsi rdi r8..r15  (64/32/16-bit views)
// 16..=31  low-byte views (al..r15b); no high-byte registers
// 32..=47  xmm0..xmm15
pub mod x8664 {
    use glacier_ir::value::RegNum;

    pub const RAX: RegNum = RegNum(0);
    pub const RCX: RegNum = RegNum(1);
    pub const RDX: RegNum = RegNum(2);
    pub const RBX: RegNum = RegNum(3);
    pub const RSP: RegNum = RegNum(4);
    pub const RBP: RegNum = RegNum(5);
    pub const RSI: RegNum = RegNum(6);
    pub const RDI: RegNum = RegNum(7);
    pub const R8: RegNum = RegNum(8);
    pub const R9: RegNum = RegNum(9);
    pub const R10: RegNum = RegNum(10);
    pub const R11: RegNum = RegNum(11);
    pub const AL: RegNum = RegNum(16);
    pub const CL: RegNum = RegNum(17);
    pub const XMM0: RegNum = RegNum(32);
    pub const NUM_REGS: usize = 48;

    pub fn low_byte(r: RegNum) -> RegNum {
        debug_assert!(r.0 < 16);
        RegNum(r.0 + 16)
    }

    pub fn xmm(i: u8) -> RegNum {
        debug_assert!(i < 16);
        RegNum(32 + i)
    }
}

/// Maximum integer arguments passed in registers (x86-64 only).
pub const X86_MAX_GPR_ARGS: usize = 6;
/// Maximum vector arguments passed in xmm registers (x86-64 only).
pub const X86_MAX_XMM_ARGS: usize = 8;
/// Stack alignment maintained at calls.
pub const X86_STACK_ALIGNMENT_BYTES: u32 = 16;

/// x86-64 integer argument registers, in order.
pub const X8664_GPR_ARGS: [RegNum; X86_MAX_GPR_ARGS] = [
    x8664::RDI,
    x8664::RSI,
    x8664::RDX,
    x8664::RCX,
    x8664::R8,
    x8664::R9,
];

fn set_of(regs: &[RegNum]) -> RegSet {
    let mut s = RegSet::EMPTY;
    for &r in regs {
        s.insert(r);
    }
    s
}

/// The register environment: everything the allocator and the lowering
/// need to know about one target's register file.
#[derive(Debug, Clone, Copy)]
pub struct RegEnv {
    pub arch: TargetArch,
}

impl RegEnv {
    pub fn new(arch: TargetArch) -> Self {
        Self { arch }
    }

    /// Registers the allocator may hand out. Excludes the stack and frame
    /// pointers and their views.
    pub fn allocatable(&self) -> RegSet {
        let mut s = RegSet::EMPTY;
        match self.arch {
            TargetArch::X8632 => {
                for r in 0..x8632::NUM_REGS as u8 {
                    s.insert(RegNum(r));
                }
                s.remove(x8632::ESP);
                s.remove(x8632::EBP);
            }
            TargetArch::X8664 => {
                for r in 0..x8664::NUM_REGS as u8 {
                    s.insert(RegNum(r));
                }
                s.remove(x8664::RSP);
                s.remove(x8664::RBP);
                s.remove(x8664::low_byte(x8664::RSP));
                s.remove(x8664::low_byte(x8664::RBP));
            }
        }
        s
    }

    pub fn frame_reg(&self) -> RegNum {
        match self.arch {
            TargetArch::X8632 => x8632::EBP,
            TargetArch::X8664 => x8664::RBP,
        }
    }

    pub fn stack_reg(&self) -> RegNum {
        match self.arch {
            TargetArch::X8632 => x8632::ESP,
            TargetArch::X8664 => x8664::RSP,
        }
    }

    /// A human-readable name, varying with the width the register is used
    /// at.
    pub fn reg_name(&self, r: RegNum, ty: Type) -> String {
        match self.arch {
            TargetArch::X8632 => {
                const R32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
                const R16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
                const R8L: [&str; 4] = ["al", "cl", "dl", "bl"];
                const R8H: [&str; 4] = ["ah", "ch", "dh", "bh"];
                let i = r.0 as usize;
                match i {
                    0..=7 => {
                        if ty == Type::I16 {
                            R16[i].to_string()
                        } else {
                            R32[i].to_string()
                        }
                    }
                    8..=11 => R8L[i - 8].to_string(),
                    12..=15 => R8H[i - 12].to_string(),
                    _ => format!("xmm{}", i - 16),
                }
            }
            TargetArch::X8664 => {
                const R64: [&str; 16] = [
                    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10",
                    "r11", "r12", "r13", "r14", "r15",
                ];
                let i = r.0 as usize;
                match i {
                    0..=15 => match ty {
                        Type::I64 => R64[i].to_string(),
                        _ => format!("{}d", R64[i]),
                    },
                    16..=31 => format!("{}b", R64[i - 16]),
                    _ => format!("xmm{}", i - 32),
                }
            }
        }
    }
}

impl RegAllocEnv for RegEnv {
    fn num_regs(&self) -> usize {
        match self.arch {
            TargetArch::X8632 => x8632::NUM_REGS,
            TargetArch::X8664 => x8664::NUM_REGS,
        }
    }

    fn aliases(&self, r: RegNum) -> RegSet {
        match self.arch {
            TargetArch::X8632 => {
                let i = r.0;
                match i {
                    // eax..ebx alias their 8-bit low and high views.
                    0..=3 => set_of(&[RegNum(i), RegNum(i + 8), RegNum(i + 12)]),
                    8..=11 => set_of(&[RegNum(i - 8), RegNum(i), RegNum(i + 4)]),
                    12..=15 => set_of(&[RegNum(i - 12), RegNum(i - 4), RegNum(i)]),
                    _ => RegSet::single(r),
                }
            }
            TargetArch::X8664 => {
                let i = r.0;
                match i {
                    0..=15 => set_of(&[RegNum(i), RegNum(i + 16)]),
                    16..=31 => set_of(&[RegNum(i - 16), RegNum(i)]),
                    _ => RegSet::single(r),
                }
            }
        }
    }

    fn scratch_regs(&self) -> RegSet {
        match self.arch {
            TargetArch::X8632 => {
                let mut s = set_of(&[
                    x8632::EAX,
                    x8632::ECX,
                    x8632::EDX,
                    x8632::AL,
                    x8632::CL,
                    x8632::DL,
                    x8632::AH,
                    x8632::CH,
                    x8632::DH,
                ]);
                for i in 0..8 {
                    s.insert(x8632::xmm(i));
                }
                s
            }
            TargetArch::X8664 => {
                let mut s = RegSet::EMPTY;
                for r in [
                    x8664::RAX,
                    x8664::RCX,
                    x8664::RDX,
                    x8664::RSI,
                    x8664::RDI,
                    x8664::R8,
                    x8664::R9,
                    x8664::R10,
                    x8664::R11,
                ] {
                    s.insert(r);
                    s.insert(x8664::low_byte(r));
                }
                for i in 0..16 {
                    s.insert(x8664::xmm(i));
                }
                s
            }
        }
    }

    fn regs_for(&self, ty: Type, class: RegClass) -> RegSet {
        match self.arch {
            TargetArch::X8632 => {
                let gpr32 = set_of(&[
                    x8632::EAX,
                    x8632::ECX,
                    x8632::EDX,
                    x8632::EBX,
                    x8632::ESI,
                    x8632::EDI,
                ]);
                let gpr32_to8 = set_of(&[x8632::EAX, x8632::ECX, x8632::EDX, x8632::EBX]);
                let byte_lo = set_of(&[x8632::AL, x8632::CL, x8632::DL, x8632::BL]);
                let byte_all = byte_lo
                    | set_of(&[x8632::AH, x8632::CH, x8632::DH, x8632::BH]);
                let mut xmm = RegSet::EMPTY;
                for i in 0..8 {
                    xmm.insert(x8632::xmm(i));
                }
                match ty {
                    Type::I1 | Type::I8 => match class {
                        RegClass::Trunc8Rcvr => byte_lo,
                        _ => byte_all,
                    },
                    Type::I16 => match class {
                        RegClass::Is16To8 => gpr32_to8,
                        _ => gpr32,
                    },
                    Type::I32 => match class {
                        RegClass::Is32To8 => gpr32_to8,
                        _ => gpr32,
                    },
                    // i64 is never directly register-allocated on x86-32.
                    Type::I64 => RegSet::EMPTY,
                    Type::Void => RegSet::EMPTY,
                    _ => xmm,
                }
            }
            TargetArch::X8664 => {
                let mut gpr = RegSet::EMPTY;
                for i in 0..16u8 {
                    gpr.insert(RegNum(i));
                }
                gpr.remove(x8664::RSP);
                gpr.remove(x8664::RBP);
                let mut bytes = RegSet::EMPTY;
                for i in 16..32u8 {
                    bytes.insert(RegNum(i));
                }
                bytes.remove(x8664::low_byte(x8664::RSP));
                bytes.remove(x8664::low_byte(x8664::RBP));
                let mut xmm = RegSet::EMPTY;
                for i in 0..16 {
                    xmm.insert(x8664::xmm(i));
                }
                match ty {
                    Type::I1 | Type::I8 => bytes,
                    Type::I16 | Type::I32 | Type::I64 => gpr,
                    Type::Void => RegSet::EMPTY,
                    _ => xmm,
                }
            }
        }
    }

    fn word_type(&self) -> Type {
        self.arch.word_type()
    }
}
