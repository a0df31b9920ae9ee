//! The JIT-backed CPU: translates on first visit, then dispatches whole blocks to a backend.

use rustc_hash::FxHashSet;

use duet_cpu_core::{ArmCpu, Bus, Core};
use duet_types::{Arch, ExceptionKind};

use crate::block::Location;
use crate::config::{BackendKind, JitConfig};
use crate::ir_interp::IrInterpreter;
use crate::native::NativeBackend;
use crate::translate::Translator;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    pub blocks_translated: usize,
    pub native_blocks_compiled: usize,
    /// Blocks the native backend rejected; they run on the IR interpreter instead.
    pub native_fallbacks: usize,
    pub cache_invalidations: usize,
}

#[derive(Debug)]
pub struct JitCpu<M> {
    core: Core<M>,
    translator: Translator,
    ir: IrInterpreter<M>,
    /// `None` when the IR interpreter was requested or the host cannot run native code.
    native: Option<NativeBackend<M>>,
    fallback: FxHashSet<Location>,
    config: JitConfig,
    /// Cycles left over from (or overdrawn by) previous `run` calls. Blocks are not split, so a
    /// run may overshoot by less than one block; the debt is paid by the next call.
    budget: i64,
    stats: JitStats,
}

impl<M: Bus> JitCpu<M> {
    pub fn new(arch: Arch, bus: M) -> Self {
        Self::with_config(arch, bus, JitConfig::default())
    }

    pub fn with_config(arch: Arch, bus: M, config: JitConfig) -> Self {
        let native = match config.backend {
            BackendKind::IrInterpreter => None,
            BackendKind::Native => match NativeBackend::new(config.code_cache_bytes) {
                Ok(backend) => Some(backend),
                Err(error) => {
                    tracing::warn!(%error, "native backend unavailable, using the IR interpreter");
                    None
                }
            },
        };
        Self {
            core: Core::new(arch, bus),
            translator: Translator::new(config.max_block_instructions),
            ir: IrInterpreter::new(),
            native,
            fallback: FxHashSet::default(),
            config,
            budget: 0,
            stats: JitStats::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// The backend blocks actually run on.
    pub fn backend(&self) -> BackendKind {
        if self.native.is_some() {
            BackendKind::Native
        } else {
            BackendKind::IrInterpreter
        }
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn core(&self) -> &Core<M> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core<M> {
        &mut self.core
    }

    pub fn bus(&self) -> &M {
        &self.core.bus
    }

    pub fn bus_mut(&mut self) -> &mut M {
        &mut self.core.bus
    }

    /// The two prefetched instructions, oldest first.
    pub fn pipeline(&self) -> [u32; 2] {
        self.core.state.pipeline
    }

    /// Where the next block would start.
    pub fn location(&self) -> Location {
        Location::current(&self.core)
    }

    /// Cycles the last `run` call overshot its budget by.
    pub fn overshoot(&self) -> u64 {
        self.budget.min(0).unsigned_abs()
    }

    /// Drops every translated and compiled block. Needed after guest code is modified.
    pub fn invalidate_code_cache(&mut self) {
        self.ir.clear();
        if let Some(native) = &mut self.native {
            native.reset();
        }
        self.fallback.clear();
        self.stats.cache_invalidations += 1;
        tracing::info!("code cache invalidated");
    }

    /// Runs one block (or takes a pending IRQ) and returns the cycles it cost.
    pub fn step_block(&mut self) -> u32 {
        if self.core.irq_pending() {
            self.core.raise(ExceptionKind::Irq);
            return 1;
        }

        let location = Location::current(&self.core);
        if let Some(native) = &mut self.native {
            if !self.fallback.contains(&location) {
                if !native.contains(&location) {
                    let block = self.translator.translate(&mut self.core, location);
                    self.stats.blocks_translated += 1;
                    match native.compile(&block) {
                        Ok(()) => self.stats.native_blocks_compiled += 1,
                        Err(error) => {
                            tracing::debug!(%location, %error, "falling back to the IR interpreter");
                            self.fallback.insert(location);
                            self.stats.native_fallbacks += 1;
                            self.ir.compile(&block);
                            return self.ir.run(&mut self.core, &location);
                        }
                    }
                }
                return native.run(&mut self.core, &location);
            }
        }

        if !self.ir.contains(&location) {
            let block = self.translator.translate(&mut self.core, location);
            self.stats.blocks_translated += 1;
            self.ir.compile(&block);
        }
        self.ir.run(&mut self.core, &location)
    }
}

impl<M: Bus> ArmCpu for JitCpu<M> {
    /// Resets the core. Translated code stays valid because it only depends on memory.
    fn reset(&mut self) {
        self.core.reset();
        self.budget = 0;
    }

    fn run(&mut self, cycles: u64) {
        let cycles = i64::try_from(cycles).unwrap_or(i64::MAX);
        self.budget = self.budget.saturating_add(cycles);
        while self.budget > 0 {
            if self.core.state.halted {
                self.budget = 0;
                return;
            }
            self.budget -= self.step_block() as i64;
        }
    }

    duet_cpu_core::delegate_arm_cpu_state!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_cpu_core::{FlatMemory, PC};
    use duet_types::{Mode, Psr};

    const MOV_R0_1: u32 = 0xE3A0_0001;
    const ADD_R0_R0_1: u32 = 0xE280_0001;

    fn cpu(words: &[u32], max_block_instructions: usize) -> JitCpu<FlatMemory> {
        let mut memory = FlatMemory::new(0x1000);
        memory.load_words(0, words);
        let config = JitConfig {
            max_block_instructions,
            ..JitConfig::default()
        };
        JitCpu::with_config(Arch::V4, memory, config)
    }

    #[test]
    fn blocks_are_never_split() {
        // The zero words after the program are ANDEQ, which ends the block.
        let mut cpu = cpu(&[MOV_R0_1, ADD_R0_R0_1, ADD_R0_R0_1, ADD_R0_R0_1], 32);
        cpu.run(3);
        assert_eq!(cpu.gpr(0), 4);
        assert_eq!(cpu.location().address, 16);
        assert_eq!(cpu.overshoot(), 1);
        assert_eq!(cpu.stats().blocks_translated, 1);
    }

    #[test]
    fn overshoot_is_carried_into_the_next_run() {
        let mut cpu = cpu(&[MOV_R0_1, ADD_R0_R0_1, ADD_R0_R0_1, ADD_R0_R0_1], 2);
        cpu.run(1);
        assert_eq!(cpu.gpr(0), 2);
        assert_eq!(cpu.overshoot(), 1);
        cpu.run(1);
        assert_eq!(cpu.gpr(0), 2);
        assert_eq!(cpu.overshoot(), 0);
        cpu.run(1);
        assert_eq!(cpu.gpr(0), 4);
    }

    #[test]
    fn halted_cores_return_immediately_and_irq_wakes_them() {
        let mut cpu = cpu(&[ADD_R0_R0_1; 16], 4);
        cpu.update_halted(true);
        cpu.run(100);
        assert_eq!(cpu.gpr(0), 0);

        // Masked IRQ: wakes the core without being taken.
        cpu.update_irq(true);
        assert!(!cpu.is_halted());
        cpu.run(4);
        assert_eq!(cpu.gpr(0), 4);
        assert_eq!(cpu.cpsr().mode(), Mode::Supervisor);
    }

    #[test]
    fn unmasked_irq_costs_one_slot() {
        let mut cpu = cpu(&[ADD_R0_R0_1; 16], 4);
        let mut cpsr = cpu.cpsr();
        cpsr.remove(Psr::I);
        cpu.set_cpsr(cpsr);
        cpu.update_irq(true);
        cpu.run(1);
        assert_eq!(cpu.cpsr().mode(), Mode::Irq);
        assert_eq!(cpu.gpr(PC), 0x18 + 8);
        assert_eq!(cpu.gpr(0), 0);
    }

    #[test]
    fn invalidation_forces_retranslation() {
        let mut cpu = cpu(&[MOV_R0_1, ADD_R0_R0_1], 1);
        cpu.run(1);
        cpu.invalidate_code_cache();
        cpu.core_mut().state.gpr[PC] = 8;
        cpu.flush_pipeline_arm();
        cpu.run(1);
        assert_eq!(cpu.stats().blocks_translated, 2);
        assert_eq!(cpu.stats().cache_invalidations, 1);
    }

    #[test]
    fn native_request_degrades_off_aarch64() {
        let memory = FlatMemory::new(0x1000);
        let config = JitConfig {
            backend: BackendKind::Native,
            ..JitConfig::default()
        };
        let cpu = JitCpu::with_config(Arch::V5, memory, config);
        if crate::native::HOST_SUPPORTED {
            assert_eq!(cpu.backend(), BackendKind::Native);
        } else {
            assert_eq!(cpu.backend(), BackendKind::IrInterpreter);
        }
    }
}
