//! Block translator and the two backends that execute its output.
//!
//! Guest code is translated one basic block at a time into a small SSA-like IR
//! ([`ir`]). Blocks are cached by [`Location`] and run either by the portable
//! [`IrInterpreter`] or, on AArch64 hosts, as machine code produced by [`native`].
//! [`JitCpu`] ties the pieces together behind the same [`duet_cpu_core::ArmCpu`]
//! surface as the reference interpreter.

mod block;
mod config;
mod eval;
pub mod ir;
pub mod ir_interp;
pub mod native;
mod runtime;
pub mod translate;

pub use block::{BasicBlock, BlockEnd, Location};
pub use config::{BackendKind, JitConfig};
pub use ir::{BinaryOp, FlagMask, GuestReg, IrOp, IrValue, IrVariable, SaturatingOp};
pub use ir_interp::IrInterpreter;
pub use native::{CodeCacheError, CompileError, NativeBackend};
pub use runtime::{JitCpu, JitStats};
pub use translate::Translator;
