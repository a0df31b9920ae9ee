use duet_types::{Mode, Psr};

use crate::state::StateError;

/// The surface system-level code drives a core through. Implemented by the interpreter and by
/// the JIT so the two are interchangeable.
pub trait ArmCpu {
    fn reset(&mut self);

    /// Executes `cycles` instruction slots (one cycle each). Returns early once the core halts.
    fn run(&mut self, cycles: u64);

    /// Register as seen by the current mode.
    fn gpr(&self, reg: usize) -> u32;
    fn set_gpr(&mut self, reg: usize, value: u32);

    /// Register as seen by `mode`, whether or not it is active.
    fn gpr_in(&self, reg: usize, mode: Mode) -> u32;
    fn set_gpr_in(&mut self, reg: usize, mode: Mode, value: u32);

    fn cpsr(&self) -> Psr;
    /// Replaces CPSR (switching register banks as needed). The pipeline is left alone; call one
    /// of the flush methods after changing the instruction set.
    fn set_cpsr(&mut self, value: Psr);

    fn spsr(&self, mode: Mode) -> Result<Psr, StateError>;
    fn set_spsr(&mut self, mode: Mode, value: Psr) -> Result<(), StateError>;

    /// Drives the IRQ line. Asserting it wakes a halted core even if IRQs are masked.
    fn update_irq(&mut self, asserted: bool);
    fn update_halted(&mut self, halted: bool);
    fn is_halted(&self) -> bool;

    fn flush_pipeline_arm(&mut self);
    fn flush_pipeline_thumb(&mut self);
    /// Flushes for whichever instruction set CPSR selects.
    fn flush_pipeline(&mut self);
}

/// Implements [`ArmCpu`] register/status plumbing by delegating to a `core` field of type
/// [`crate::Core`].
#[macro_export]
macro_rules! delegate_arm_cpu_state {
    () => {
        fn gpr(&self, reg: usize) -> u32 {
            self.core.state.gpr[reg]
        }

        fn set_gpr(&mut self, reg: usize, value: u32) {
            self.core.state.gpr[reg] = value;
        }

        fn gpr_in(&self, reg: usize, mode: $crate::duet_types::Mode) -> u32 {
            self.core.state.gpr_in(reg, mode)
        }

        fn set_gpr_in(&mut self, reg: usize, mode: $crate::duet_types::Mode, value: u32) {
            self.core.state.set_gpr_in(reg, mode, value)
        }

        fn cpsr(&self) -> $crate::duet_types::Psr {
            self.core.state.cpsr()
        }

        fn set_cpsr(&mut self, value: $crate::duet_types::Psr) {
            self.core.state.set_cpsr(value)
        }

        fn spsr(
            &self,
            mode: $crate::duet_types::Mode,
        ) -> Result<$crate::duet_types::Psr, $crate::StateError> {
            self.core.state.spsr(mode)
        }

        fn set_spsr(
            &mut self,
            mode: $crate::duet_types::Mode,
            value: $crate::duet_types::Psr,
        ) -> Result<(), $crate::StateError> {
            self.core.state.set_spsr(mode, value)
        }

        fn update_irq(&mut self, asserted: bool) {
            self.core.state.irq_line = asserted;
            if asserted {
                self.core.state.halted = false;
            }
        }

        fn update_halted(&mut self, halted: bool) {
            self.core.state.halted = halted;
        }

        fn is_halted(&self) -> bool {
            self.core.state.halted
        }

        fn flush_pipeline_arm(&mut self) {
            self.core.flush_arm()
        }

        fn flush_pipeline_thumb(&mut self) {
            self.core.flush_thumb()
        }

        fn flush_pipeline(&mut self) {
            self.core.flush_pipeline()
        }
    };
}
