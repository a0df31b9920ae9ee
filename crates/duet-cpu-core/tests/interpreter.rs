use duet_cpu_core::duet_types::{Arch, Mode, Psr};
use duet_cpu_core::{ArmCpu, Bus, BusKind, FlatMemory, Interpreter, StateError, PC};

fn arm(arch: Arch, code: &[u32]) -> Interpreter<FlatMemory> {
    let mut mem = FlatMemory::new(0x1_0000);
    mem.load_words(0, code);
    Interpreter::new(arch, mem)
}

fn thumb(arch: Arch, code: &[u16]) -> Interpreter<FlatMemory> {
    let mut mem = FlatMemory::new(0x1_0000);
    mem.load_halfwords(0x100, code);
    let mut cpu = Interpreter::new(arch, mem);
    cpu.set_cpsr(Psr::T | Psr::from_bits_retain(Mode::System as u32));
    cpu.set_gpr(PC, 0x100);
    cpu.flush_pipeline_thumb();
    cpu
}

fn user_mode(cpu: &mut Interpreter<FlatMemory>) {
    cpu.set_cpsr(Psr::from_bits_retain(Mode::User as u32));
}

#[test]
fn mov_immediate_without_flags() {
    let mut cpu = arm(Arch::V5, &[0xE3A0_0005]); // mov r0, #5
    let flags = Psr::N | Psr::C | Psr::from_bits_retain(Mode::Supervisor as u32);
    cpu.set_cpsr(flags);
    let pc = cpu.gpr(PC);

    cpu.run(1);

    assert_eq!(cpu.gpr(0), 5);
    assert_eq!(cpu.cpsr().nzcv(), flags.nzcv());
    assert_eq!(cpu.gpr(PC), pc + 4);
}

#[test]
fn adds_sets_overflow() {
    let mut cpu = arm(Arch::V4, &[0xE092_1003]); // adds r1, r2, r3
    cpu.set_gpr(2, 0x7FFF_FFFF);
    cpu.set_gpr(3, 1);

    cpu.run(1);

    assert_eq!(cpu.gpr(1), 0x8000_0000);
    let cpsr = cpu.cpsr();
    assert!(cpsr.contains(Psr::V));
    assert!(!cpsr.contains(Psr::C));
    assert!(cpsr.contains(Psr::N));
    assert!(!cpsr.contains(Psr::Z));
}

#[test]
fn software_interrupt_enters_supervisor() {
    for arch in [Arch::V4, Arch::V5] {
        let mut cpu = arm(arch, &[0xEF00_0000, 0, 0xE3A0_0001, 0xE3A0_0002]);
        user_mode(&mut cpu);

        cpu.run(1);

        assert_eq!(cpu.cpsr().mode(), Mode::Supervisor);
        assert!(cpu.cpsr().contains(Psr::I));
        assert_eq!(cpu.gpr_in(14, Mode::Supervisor), 4);
        assert_eq!(cpu.gpr(PC), 0x08 + 8);
        assert_eq!(cpu.pipeline(), [0xE3A0_0001, 0xE3A0_0002]);
        assert_eq!(cpu.spsr(Mode::Supervisor).map(|p| p.mode()), Ok(Mode::User));
    }
}

#[test]
fn high_vectors_relocate_exceptions() {
    // mcr p15, 0, r0, c1, c0, 0 ; swi
    let mut cpu = arm(Arch::V5, &[0xEE01_0F10, 0xEF00_0000]);
    cpu.set_gpr(0, 0x2078 | 1 << 13);
    cpu.run(2);
    assert_eq!(cpu.gpr(PC), 0xFFFF_0008 + 8);
}

#[test]
fn spsr_access_is_rejected_without_a_bank() {
    let mut cpu = arm(Arch::V5, &[0xE14F_0000]); // mrs r0, spsr
    user_mode(&mut cpu);
    cpu.set_gpr(0, 0x1234);

    cpu.run(1);

    assert_eq!(cpu.gpr(0), 0x1234);
    assert_eq!(
        cpu.spsr(Mode::System),
        Err(StateError::NoSpsr { mode: Mode::System })
    );
}

#[test]
fn banked_registers_survive_mode_switches() {
    // msr cpsr_c, #0xD2 (IRQ) ; mov sp, #0x100 ; msr cpsr_c, #0xD3 (SVC) ; mov sp, #0x200
    let mut cpu = arm(Arch::V4, &[0xE321_F0D2, 0xE3A0_DC01, 0xE321_F0D3, 0xE3A0_DC02]);
    cpu.run(4);
    assert_eq!(cpu.cpsr().mode(), Mode::Supervisor);
    assert_eq!(cpu.gpr(13), 0x200);
    assert_eq!(cpu.gpr_in(13, Mode::Irq), 0x100);
    cpu.set_gpr_in(13, Mode::Fiq, 0x300);
    assert_eq!(cpu.gpr_in(13, Mode::Fiq), 0x300);
    assert_eq!(cpu.gpr(13), 0x200);
}

#[test]
fn user_mode_msr_only_writes_flags() {
    // msr cpsr_fc, r0
    let mut cpu = arm(Arch::V5, &[0xE129_F000]);
    user_mode(&mut cpu);
    cpu.set_gpr(0, 0xF000_00D3);
    cpu.run(1);
    assert_eq!(cpu.cpsr().mode(), Mode::User);
    assert_eq!(cpu.cpsr().nzcv(), 0xF);
}

#[test]
fn conditional_instruction_is_skipped() {
    let mut cpu = arm(Arch::V4, &[0x03A0_0001]); // moveq r0, #1
    cpu.run(1);
    assert_eq!(cpu.gpr(0), 0);
    assert_eq!(cpu.gpr(PC), 12);
}

#[test]
fn branch_with_link_flushes() {
    // bl +8 (to 0x10)
    let mut cpu = arm(Arch::V4, &[0xEB00_0002, 0, 0, 0, 0xE3A0_0007]);
    cpu.run(2);
    assert_eq!(cpu.gpr(14), 4);
    assert_eq!(cpu.gpr(0), 7);
    assert_eq!(cpu.gpr(PC), 0x14 + 8);
}

#[test]
fn ldm_to_pc_interworks_only_on_v5() {
    for (arch, thumb) in [(Arch::V4, false), (Arch::V5, true)] {
        // ldmia r0, {pc}
        let mut cpu = arm(arch, &[0xE890_8000]);
        cpu.bus_mut().write_u32(BusKind::Data, 0x800, 0x201);
        cpu.set_gpr(0, 0x800);
        cpu.run(1);
        assert_eq!(cpu.cpsr().thumb(), thumb, "{arch:?}");
        let expected = if thumb { 0x200 + 4 } else { 0x200 + 8 };
        assert_eq!(cpu.gpr(PC), expected, "{arch:?}");
    }
}

#[test]
fn stm_stores_pc_plus_twelve() {
    // stmia r0, {pc}
    let mut cpu = arm(Arch::V5, &[0xE880_8000]);
    cpu.set_gpr(0, 0x800);
    cpu.run(1);
    assert_eq!(cpu.bus_mut().read_u32(BusKind::Data, 0x800), 12);
}

#[test]
fn clz_is_undefined_on_v4() {
    let mut cpu = arm(Arch::V4, &[0xE16F_0F11]); // clz r0, r1
    cpu.run(1);
    assert_eq!(cpu.cpsr().mode(), Mode::Undefined);
    assert_eq!(cpu.gpr(PC), 0x04 + 8);

    let mut cpu = arm(Arch::V5, &[0xE16F_0F11]);
    cpu.set_gpr(1, 0x0000_8000);
    cpu.run(1);
    assert_eq!(cpu.gpr(0), 16);
}

#[test]
fn qadd_saturates_and_sets_q() {
    let mut cpu = arm(Arch::V5, &[0xE101_0052]); // qadd r0, r2, r1
    cpu.set_gpr(1, 0x7FFF_FFFF);
    cpu.set_gpr(2, 1);
    cpu.run(1);
    assert_eq!(cpu.gpr(0), 0x7FFF_FFFF);
    assert!(cpu.cpsr().contains(Psr::Q));
}

#[test]
fn wait_for_interrupt_halts_until_irq() {
    // mcr p15, 0, r0, c7, c0, 4 ; mov r1, #1
    let mut cpu = arm(Arch::V5, &[0xEE07_0F90, 0xE3A0_1001]);
    cpu.run(10);
    assert!(cpu.is_halted());
    assert_eq!(cpu.gpr(1), 0);

    // Masked IRQ still wakes the core; execution continues in place.
    cpu.update_irq(true);
    assert!(!cpu.is_halted());
    cpu.run(1);
    assert_eq!(cpu.gpr(1), 1);
}

#[test]
fn unmasked_irq_is_taken_before_fetch() {
    let mut cpu = arm(Arch::V4, &[0xE3A0_0001, 0xE3A0_0002]);
    cpu.set_cpsr(Psr::from_bits_retain(Mode::System as u32));
    cpu.run(1);
    cpu.update_irq(true);
    cpu.run(1);
    assert_eq!(cpu.cpsr().mode(), Mode::Irq);
    // Return with `subs pc, lr, #4` resumes at 0x4.
    assert_eq!(cpu.gpr(14), 0x8);
    assert_eq!(cpu.gpr(PC), 0x18 + 8);
}

#[test]
fn thumb_alu_and_branch() {
    let mut cpu = thumb(
        Arch::V5,
        &[
            0x2005, // movs r0, #5
            0x1C41, // adds r1, r0, #1
            0x4248, // negs r0, r1
            0xE7FE, // b .
        ],
    );
    cpu.run(4);
    assert_eq!(cpu.gpr(1), 6);
    assert_eq!(cpu.gpr(0), (-6i32) as u32);
    assert!(cpu.cpsr().contains(Psr::N));
    assert_eq!(cpu.gpr(PC), 0x106 + 4);
}

#[test]
fn thumb_bl_pair_links_and_blx_switches_to_arm() {
    let mut cpu = thumb(
        Arch::V5,
        &[
            0xF000, // bl prefix, offset 0
            0xE802, // blx suffix, +4 -> (0x104 + 4) & !3
        ],
    );
    cpu.run(2);
    assert!(!cpu.cpsr().thumb());
    assert_eq!(cpu.gpr(14), 0x105);
    assert_eq!(cpu.gpr(PC), 0x108 + 8);
}

#[test]
fn thumb_push_pop_round_trip() {
    let mut cpu = thumb(
        Arch::V4,
        &[
            0xB503, // push {r0, r1, lr}
            0xBC0C, // pop {r2, r3}
        ],
    );
    cpu.set_gpr(13, 0x800);
    cpu.set_gpr(0, 0xA);
    cpu.set_gpr(1, 0xB);
    cpu.set_gpr(14, 0xC);
    cpu.run(2);
    assert_eq!(cpu.gpr(2), 0xA);
    assert_eq!(cpu.gpr(3), 0xB);
    assert_eq!(cpu.gpr(13), 0x800 - 4);
    assert_eq!(cpu.bus_mut().read_u32(BusKind::Data, 0x800 - 4), 0xC);
}
