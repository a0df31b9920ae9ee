//! Back end B: translated blocks compiled to AArch64 machine code.
//!
//! Code is generated on any host (and unit tested there), but only executed on AArch64 Linux and
//! macOS. Everywhere else [`NativeBackend::new`] reports [`CompileError::UnsupportedHost`] and
//! the dispatcher stays on the IR interpreter.

pub mod a64;
mod codegen;
mod helpers;
mod regalloc;

#[cfg(unix)]
mod code_cache;

use std::io;

use thiserror::Error;

use crate::block::Location;

pub use a64::AsmError;
#[cfg(unix)]
pub use code_cache::CodeCache;
pub use codegen::{compile, CompiledCode};

/// Whether this host can run generated code.
pub const HOST_SUPPORTED: bool = cfg!(all(
    target_arch = "aarch64",
    any(target_os = "linux", target_os = "macos")
));

#[derive(Debug, Error)]
pub enum CodeCacheError {
    #[error("code cache exhausted: {requested} bytes requested, {capacity} bytes capacity")]
    Exhausted { requested: usize, capacity: usize },
    #[error("failed to map executable memory")]
    Map(#[source] io::Error),
    #[error("failed to change code protection")]
    Protect(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("block at {location} keeps more values live than the {available} registers available")]
    RegisterPressure { location: Location, available: usize },
    #[error("failed to place compiled code")]
    CodeCache(#[from] CodeCacheError),
    #[error("failed to link compiled code")]
    Assembler(#[from] AsmError),
    #[error("native code needs an AArch64 Linux or macOS host")]
    UnsupportedHost,
}

#[cfg(unix)]
pub use backend::NativeBackend;

#[cfg(unix)]
mod backend {
    use core::marker::PhantomData;
    use core::ptr;

    use rustc_hash::FxHashMap;

    use duet_cpu_core::{Bus, Core};

    use super::code_cache::CodeCache;
    use super::codegen::{self, BlockFn, SKIPPED};
    use super::{CodeCacheError, CompileError, HOST_SUPPORTED};
    use crate::block::{fall_through, BasicBlock, Location};
    use crate::ir::IrOp;

    struct NativeBlock {
        entry: *const u8,
        instructions: u32,
        /// Every op runs once the condition passes, so this is known at compile time.
        branches: bool,
        /// Referenced by the block's helper calls.
        _helper_ops: Box<[IrOp]>,
    }

    pub struct NativeBackend<M> {
        cache: CodeCache,
        blocks: FxHashMap<Location, NativeBlock>,
        _core: PhantomData<fn(&mut Core<M>)>,
    }

    impl<M: Bus> NativeBackend<M> {
        pub fn new(code_cache_bytes: usize) -> Result<Self, CompileError> {
            if !HOST_SUPPORTED {
                return Err(CompileError::UnsupportedHost);
            }
            Ok(Self {
                cache: CodeCache::new(code_cache_bytes)?,
                blocks: FxHashMap::default(),
                _core: PhantomData,
            })
        }

        pub fn contains(&self, location: &Location) -> bool {
            self.blocks.contains_key(location)
        }

        pub fn len(&self) -> usize {
            self.blocks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.blocks.is_empty()
        }

        pub fn cache(&self) -> &CodeCache {
            &self.cache
        }

        /// Compiles `block` into the code cache, flushing the whole cache first if it is full.
        pub fn compile(&mut self, block: &BasicBlock) -> Result<(), CompileError> {
            let compiled = codegen::compile::<M>(block)?;
            let entry = match self.cache.insert(block.location, &compiled.code) {
                Ok(entry) => entry,
                Err(CodeCacheError::Exhausted { capacity, .. }) => {
                    tracing::info!(capacity, blocks = self.blocks.len(), "code cache full, flushing");
                    self.reset();
                    self.cache.insert(block.location, &compiled.code)?
                }
                Err(error) => return Err(error.into()),
            };
            tracing::debug!(
                location = %block.location,
                bytes = compiled.code.len(),
                inlined = compiled.inlined,
                registers = compiled.registers,
                helpers = compiled.helper_ops.len(),
                "compiled native block"
            );
            self.blocks.insert(
                block.location,
                NativeBlock {
                    entry,
                    instructions: block.instruction_count,
                    branches: block.ops.iter().any(IrOp::is_branch),
                    _helper_ops: compiled.helper_ops,
                },
            );
            Ok(())
        }

        /// Runs the code compiled for `location` and returns the cycles it consumed.
        ///
        /// # Panics
        ///
        /// If nothing was compiled for `location`.
        pub fn run(&mut self, core: &mut Core<M>, location: &Location) -> u32 {
            let Some(block) = self.blocks.get(location) else {
                panic!("no native block at {location}");
            };
            // SAFETY: `entry` was produced by `codegen::compile::<M>` and is still in the cache,
            // and `_helper_ops` keeps every op its helper calls point at alive.
            let status = unsafe {
                let entry = core::mem::transmute::<*const u8, BlockFn<M>>(block.entry);
                let core: *mut Core<M> = &mut *core;
                entry(core, ptr::addr_of_mut!((*core).state))
            };
            if status == SKIPPED || !block.branches {
                fall_through(core, block.instructions);
            }
            block.instructions
        }

        /// Drops every compiled block.
        pub fn reset(&mut self) {
            self.blocks.clear();
            self.cache.reset();
        }
    }

    impl<M> core::fmt::Debug for NativeBackend<M> {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("NativeBackend")
                .field("blocks", &self.blocks.len())
                .field("cache", &self.cache)
                .finish()
        }
    }
}

#[cfg(not(unix))]
pub use unsupported::NativeBackend;

/// Hosts without `mmap`: the backend cannot be constructed.
#[cfg(not(unix))]
mod unsupported {
    use core::convert::Infallible;
    use core::marker::PhantomData;

    use duet_cpu_core::{Bus, Core};

    use super::CompileError;
    use crate::block::{BasicBlock, Location};

    #[derive(Debug)]
    pub struct NativeBackend<M> {
        never: Infallible,
        _core: PhantomData<fn(&mut Core<M>)>,
    }

    impl<M: Bus> NativeBackend<M> {
        pub fn new(_code_cache_bytes: usize) -> Result<Self, CompileError> {
            Err(CompileError::UnsupportedHost)
        }

        pub fn contains(&self, _location: &Location) -> bool {
            match self.never {}
        }

        pub fn len(&self) -> usize {
            match self.never {}
        }

        pub fn is_empty(&self) -> bool {
            match self.never {}
        }

        pub fn compile(&mut self, _block: &BasicBlock) -> Result<(), CompileError> {
            match self.never {}
        }

        pub fn run(&mut self, _core: &mut Core<M>, _location: &Location) -> u32 {
            match self.never {}
        }

        pub fn reset(&mut self) {
            match self.never {}
        }
    }
}
