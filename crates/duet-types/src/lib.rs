//! Shared vocabulary for the ARMv4/ARMv5 execution engine.
//!
//! Everything here is pure: bit-field helpers, the barrel shifter, condition evaluation and the
//! program status register layout. The decoder, the interpreter and the JIT all build on these so
//! that a given architectural rule is written exactly once.

pub mod bits;
mod cond;
mod psr;
pub mod shifter;

pub use cond::{Cond, ConditionTable, CONDITION_TABLE};
pub use psr::{Arch, ExceptionKind, Mode, Psr, RegisterBank, SpsrBank};
