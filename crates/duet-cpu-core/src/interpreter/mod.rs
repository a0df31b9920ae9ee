//! Direct interpreter: decode one instruction, execute it against [`Core`], repeat.

mod arm;
mod thumb;

use std::sync::Arc;

use duet_decoder::Decoder;
use duet_types::{Arch, Cond, ExceptionKind, Mode, Psr};

use crate::bus::Bus;
use crate::cpu::ArmCpu;
use crate::exec::{BlockTransfer, Core, LoadKind, StoreWidth};
use crate::state::PC;

pub struct Interpreter<M> {
    core: Core<M>,
    decoder: Arc<Decoder<Interpreter<M>>>,
    /// Set by a handler that redirected control flow (and already flushed the pipeline).
    branched: bool,
}

impl<M: Bus> Interpreter<M> {
    pub fn new(arch: Arch, bus: M) -> Self {
        Self::with_decoder(arch, bus, Arc::new(Decoder::new()))
    }

    /// Builds an interpreter around a decoder shared with other cores.
    pub fn with_decoder(arch: Arch, bus: M, decoder: Arc<Decoder<Self>>) -> Self {
        Self {
            core: Core::new(arch, bus),
            decoder,
            branched: false,
        }
    }

    pub fn decoder(&self) -> &Arc<Decoder<Self>> {
        &self.decoder
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

    /// Executes one instruction slot: either IRQ entry or the instruction at the pipeline head.
    pub fn step(&mut self) {
        if self.core.irq_pending() {
            self.core.raise(ExceptionKind::Irq);
            return;
        }

        let thumb = self.core.state.thumb();
        let width = self.core.state.width();
        let pc = self.core.state.gpr[PC];
        let fetched = if thumb {
            self.core.fetch_thumb(pc) as u32
        } else {
            self.core.fetch_arm(pc)
        };
        let [instr, next] = self.core.state.pipeline;
        self.core.state.pipeline = [next, fetched];

        self.branched = false;
        if thumb {
            let handler = self.decoder.decode_thumb(instr as u16);
            handler(self, instr as u16);
        } else if self.core.condition_passes(Cond::from_bits(instr >> 28), instr) {
            let handler = self.decoder.decode_arm(instr);
            handler(self, instr);
        }

        if !self.branched {
            self.core.state.gpr[PC] = pc.wrapping_add(width);
        }
    }

    #[inline]
    fn reg(&self, reg: usize) -> u32 {
        self.core.state.gpr[reg]
    }

    /// Register write; writing PC is a branch in the current instruction set.
    fn set_reg(&mut self, reg: usize, value: u32) {
        if reg == PC {
            self.core.branch(value);
            self.branched = true;
        } else {
            self.core.state.gpr[reg] = value;
        }
    }

    /// Result of a word load; PC loads interwork on ARMv5.
    fn set_reg_loaded(&mut self, reg: usize, value: u32) {
        if reg == PC {
            self.core.load_pc(value);
            self.branched = true;
        } else {
            self.core.state.gpr[reg] = value;
        }
    }

    fn branch(&mut self, target: u32) {
        self.core.branch(target);
        self.branched = true;
    }

    fn branch_exchange(&mut self, target: u32) {
        self.core.branch_exchange(target);
        self.branched = true;
    }

    fn raise(&mut self, kind: ExceptionKind) {
        self.core.raise(kind);
        self.branched = true;
    }

    fn set_nz(&mut self, result: u32) {
        let state = &mut self.core.state;
        state.set_flag(Psr::N, result >> 31 != 0);
        state.set_flag(Psr::Z, result == 0);
    }

    fn set_nzc(&mut self, result: u32, carry: bool) {
        self.set_nz(result);
        self.core.state.set_flag(Psr::C, carry);
    }

    fn set_nzcv(&mut self, result: u32, carry: bool, overflow: bool) {
        self.set_nzc(result, carry);
        self.core.state.set_flag(Psr::V, overflow);
    }

    fn block_transfer(&mut self, plan: BlockTransfer) {
        let base = self.reg(plan.base);
        let final_base = plan.writeback.map(|offset| base.wrapping_add(offset));
        let bank = if plan.user_bank {
            Mode::User
        } else {
            self.core.state.mode()
        };
        let mut addr = base.wrapping_add(plan.start);

        if plan.load {
            let mut target = None;
            for reg in (0..16).filter(|reg| plan.registers & (1 << reg) != 0) {
                let value = self.core.load(LoadKind::WordAligned, addr);
                if reg == PC {
                    target = Some(value);
                } else {
                    self.core.state.set_gpr_in(reg, bank, value);
                }
                addr = addr.wrapping_add(4);
            }
            if let Some(value) = final_base {
                self.core.state.gpr[plan.base] = value;
            }
            if let Some(target) = target {
                if plan.restore_cpsr {
                    self.core.return_from_exception(target);
                } else {
                    self.core.load_pc(target);
                }
                self.branched = true;
            }
        } else {
            for reg in (0..16).filter(|reg| plan.registers & (1 << reg) != 0) {
                let value = if reg == plan.base && plan.store_new_base {
                    final_base.unwrap_or(base)
                } else if reg == PC {
                    self.reg(PC).wrapping_add(self.core.state.width())
                } else {
                    self.core.state.gpr_in(reg, bank)
                };
                self.core.store(StoreWidth::Word, addr, value);
                addr = addr.wrapping_add(4);
            }
            if let Some(value) = final_base {
                self.core.state.gpr[plan.base] = value;
            }
        }
    }

    fn illegal(&self, class: &str, instr: u32) {
        tracing::warn!(
            class,
            instr = format_args!("{instr:#010x}"),
            addr = format_args!("{:#010x}", self.core.next_address()),
            "illegal instruction ignored"
        );
    }
}

impl<M: Bus> ArmCpu for Interpreter<M> {
    fn reset(&mut self) {
        self.core.reset();
    }

    fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            if self.core.state.halted {
                return;
            }
            self.step();
        }
    }

    crate::delegate_arm_cpu_state!();
}
