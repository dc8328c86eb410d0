//! x86 lowering backend for glacier.
//!
//! Translates LLIR functions into register-allocated x86 machine
//! instructions. The heavy lifting happens in [`lower`], driven per
//! function by [`TargetX86::translate`]; the analyses it leans on live in
//! their own modules.

pub mod addressopt;
pub mod context;
pub mod driver;
pub mod folding;
pub mod frame;
pub mod helpers;
pub mod loadopt;
pub mod lower;
pub mod regs;
pub mod rmw;
pub mod tables;

pub use lower::{OptLevel, TargetConfig, TargetX86};
pub use regs::{InstructionSet, RegEnv, TargetArch};

#[cfg(test)]
mod tests;
