use duet_cpu_core::duet_types::{Arch, Cond, Mode};
use duet_cpu_core::{Core, FlatMemory};
use duet_jit::{BasicBlock, BlockEnd, GuestReg, IrOp, IrValue, Location, Translator};

fn arm_block(arch: Arch, code: &[u32], max: usize) -> BasicBlock {
    let mut mem = FlatMemory::new(0x1_0000);
    mem.load_words(0, code);
    let mut core = Core::new(arch, mem);
    let location = Location::current(&core);
    Translator::new(max).translate(&mut core, location)
}

fn thumb_block(code: &[u16]) -> BasicBlock {
    let mut mem = FlatMemory::new(0x1_0000);
    mem.load_halfwords(0x100, code);
    let mut core = Core::new(Arch::V5, mem);
    let location = Location {
        address: 0x100,
        mode: Mode::System,
        thumb: true,
    };
    Translator::new(32).translate(&mut core, location)
}

fn r(index: u8) -> GuestReg {
    GuestReg {
        index,
        mode: Mode::Supervisor,
    }
}

#[test]
fn straight_line_code_up_to_a_branch() {
    // mov r0, #1 ; add r0, r0, #1 ; b .
    let block = arm_block(Arch::V4, &[0xE3A0_0001, 0xE280_0001, 0xEAFF_FFFE], 32);
    assert_eq!(block.instruction_count, 3);
    assert_eq!(block.cycles(), 3);
    assert_eq!(block.end, BlockEnd::Break);
    assert_eq!(block.cond, Cond::Al);
    assert!(block.ops.contains(&IrOp::StoreGpr {
        reg: r(0),
        src: IrValue::Constant(1),
    }));
    assert_eq!(
        block.ops.last(),
        Some(&IrOp::Branch {
            target: IrValue::Constant(8),
        })
    );
}

#[test]
fn pc_reads_become_constants() {
    // nop ; mov r0, pc
    let block = arm_block(Arch::V5, &[0xE1A0_0000, 0xE1A0_000F], 2);
    assert!(block.ops.contains(&IrOp::StoreGpr {
        reg: r(0),
        src: IrValue::Constant(4 + 8),
    }));
}

#[test]
fn instruction_limit_caps_blocks() {
    let block = arm_block(Arch::V4, &[0xE3A0_0001; 8], 2);
    assert_eq!(block.instruction_count, 2);
    assert_eq!(block.end, BlockEnd::InstructionLimit);
}

#[test]
fn condition_changes_end_blocks() {
    // moveq r0, #1 ; movne r0, #2
    let block = arm_block(Arch::V4, &[0x03A0_0001, 0x13A0_0002], 32);
    assert_eq!(block.cond, Cond::Eq);
    assert_eq!(block.instruction_count, 1);
    assert_eq!(block.end, BlockEnd::ConditionChanged);
}

#[test]
fn conditional_flag_writes_end_blocks() {
    // moveq r0, #0 ; cmpeq r0, #1 ; moveq r1, #1
    let block = arm_block(Arch::V4, &[0x03A0_0000, 0x0350_0001, 0x03A0_1001], 32);
    assert_eq!(block.instruction_count, 2);
    assert_eq!(block.end, BlockEnd::FlagsChanged);
}

#[test]
fn unconditional_flag_writes_do_not() {
    // cmp r0, #1 ; mov r1, #1 ; mov r2, #2
    let block = arm_block(Arch::V4, &[0xE350_0001, 0xE3A0_1001, 0xE3A0_2002], 3);
    assert_eq!(block.instruction_count, 3);
    assert_eq!(block.end, BlockEnd::InstructionLimit);
}

#[test]
fn thumb_conditional_branch_is_its_own_block() {
    // movs r0, #1 ; beq .
    let block = thumb_block(&[0x2001, 0xD0FE]);
    assert_eq!(block.instruction_count, 1);
    assert_eq!(block.end, BlockEnd::ConditionChanged);

    let block = thumb_block(&[0xD0FE]);
    assert_eq!(block.cond, Cond::Eq);
    assert_eq!(block.end, BlockEnd::Break);
    assert_eq!(block.location.width(), 2);
}

#[test]
fn blx_immediate_needs_v5() {
    // blx #0
    let v4 = arm_block(Arch::V4, &[0xFA00_0000], 32);
    assert_eq!(v4.cond, Cond::Nv);
    let v5 = arm_block(Arch::V5, &[0xFA00_0000], 32);
    assert_eq!(v5.cond, Cond::Al);
    assert_eq!(v5.end, BlockEnd::Break);
}

#[test]
fn variables_are_defined_once_and_counted() {
    // ldmia r0!, {r1-r4} ; adds r5, r1, r2 ; umull r6, r7, r3, r4 ; b .
    let block = arm_block(
        Arch::V5,
        &[0xE8B0_001E, 0xE091_5002, 0xE087_6493, 0xEAFF_FFFE],
        32,
    );
    let mut defined = Vec::new();
    for op in &block.ops {
        op.for_each_use(|var| assert!(defined.contains(&var), "{var:?} used before definition"));
        op.for_each_def(|var| {
            assert!(!defined.contains(&var), "{var:?} defined twice");
            assert!(var.0 < block.variable_count);
            defined.push(var);
        });
    }
}
