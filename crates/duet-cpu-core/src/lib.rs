//! CPU state model, memory surface and the reference interpreter for the ARMv4/ARMv5 cores.
//!
//! The interpreter is the semantics of record: the JIT in `duet-jit` is tested step by step
//! against it.

pub mod bus;
pub mod cp15;
mod cpu;
mod exec;
pub mod interpreter;
pub mod state;
pub mod tcm;

#[doc(hidden)]
pub use duet_types;

pub use bus::{Bus, BusKind, FlatMemory, Width};
pub use cp15::{Cp15, Cp15Register};
pub use cpu::ArmCpu;
pub use exec::{psr_field_mask, BlockTransfer, Core, LoadKind, StoreWidth};
pub use interpreter::Interpreter;
pub use state::{CpuState, StateError, LR, PC, SP};
pub use tcm::{TcmBus, TcmConfig, TcmLayout};
