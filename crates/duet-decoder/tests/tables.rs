use duet_decoder::{arm_index, thumb_index, ArmHandlers, Decoder, ThumbHandlers, ARM_INDEX_BITS, THUMB_INDEX_BITS};

#[derive(Default)]
struct Recorder {
    last: &'static str,
}

macro_rules! record {
    ($trait:ident, $ty:ty, $($method:ident),* $(,)?) => {
        impl $trait for Recorder {
            $(fn $method(&mut self, _instr: $ty) {
                self.last = stringify!($method);
            })*
        }
    };
}

record!(
    ArmHandlers,
    u32,
    arm_data_processing,
    arm_psr_read,
    arm_psr_write_register,
    arm_psr_write_immediate,
    arm_multiply,
    arm_multiply_long,
    arm_signed_halfword_multiply,
    arm_saturating_arithmetic,
    arm_count_leading_zeros,
    arm_swap,
    arm_halfword_transfer,
    arm_single_transfer,
    arm_block_transfer,
    arm_branch,
    arm_branch_exchange,
    arm_branch_link_exchange_register,
    arm_breakpoint,
    arm_coprocessor_register,
    arm_coprocessor_other,
    arm_software_interrupt,
    arm_undefined,
    arm_illegal,
);

record!(
    ThumbHandlers,
    u16,
    thumb_shift_immediate,
    thumb_add_subtract,
    thumb_alu_immediate,
    thumb_alu_register,
    thumb_high_register,
    thumb_load_pc_relative,
    thumb_transfer_register_offset,
    thumb_transfer_signed,
    thumb_transfer_immediate,
    thumb_transfer_halfword,
    thumb_transfer_stack,
    thumb_add_address,
    thumb_adjust_stack,
    thumb_push_pop,
    thumb_block_transfer,
    thumb_conditional_branch,
    thumb_software_interrupt,
    thumb_branch,
    thumb_branch_link_prefix,
    thumb_branch_link_suffix,
    thumb_branch_link_exchange_suffix,
    thumb_breakpoint,
    thumb_illegal,
);

fn arm(decoder: &Decoder<Recorder>, instr: u32) -> &'static str {
    let mut recorder = Recorder::default();
    decoder.decode_arm(instr)(&mut recorder, instr);
    recorder.last
}

fn thumb(decoder: &Decoder<Recorder>, instr: u16) -> &'static str {
    let mut recorder = Recorder::default();
    decoder.decode_thumb(instr)(&mut recorder, instr);
    recorder.last
}

#[test]
fn every_index_resolves_to_the_most_specific_match() {
    let decoder = Decoder::<Recorder>::new();

    let entries = decoder.arm_entries();
    for index in 0..1usize << ARM_INDEX_BITS {
        let slot = decoder.arm_slot(index);
        let chosen = entries[slot].pattern;
        assert!(chosen.matches(index as u32), "index {index:#05x}");
        // Nothing earlier in resolution order matches, and nothing later is more specific.
        assert!(entries[..slot].iter().all(|e| !e.pattern.matches(index as u32)));
        assert!(entries[slot..]
            .iter()
            .filter(|e| e.pattern.matches(index as u32))
            .all(|e| e.pattern.specificity() <= chosen.specificity()));
    }

    let entries = decoder.thumb_entries();
    for index in 0..1usize << THUMB_INDEX_BITS {
        let slot = decoder.thumb_slot(index);
        let chosen = entries[slot].pattern;
        assert!(chosen.matches(index as u32), "index {index:#05x}");
        assert!(entries[..slot].iter().all(|e| !e.pattern.matches(index as u32)));
        assert!(entries[slot..]
            .iter()
            .filter(|e| e.pattern.matches(index as u32))
            .all(|e| e.pattern.specificity() <= chosen.specificity()));
    }
}

#[test]
fn entries_are_sorted_by_descending_specificity() {
    let decoder = Decoder::<Recorder>::new();
    let arm = decoder.arm_entries();
    assert!(arm.windows(2).all(|w| w[0].pattern.specificity() >= w[1].pattern.specificity()));
    assert_eq!(arm.last().map(|e| e.name), Some("illegal"));
    let thumb = decoder.thumb_entries();
    assert!(thumb.windows(2).all(|w| w[0].pattern.specificity() >= w[1].pattern.specificity()));
}

#[test]
fn decodes_representative_arm_instructions() {
    let decoder = Decoder::<Recorder>::new();
    let cases: &[(u32, &str)] = &[
        (0xE3A0_0005, "arm_data_processing"),            // mov r0, #5
        (0xE092_1003, "arm_data_processing"),            // adds r1, r2, r3
        (0xE12F_FF1E, "arm_branch_exchange"),            // bx lr
        (0xE12F_FF33, "arm_branch_link_exchange_register"), // blx r3
        (0xE16F_0F11, "arm_count_leading_zeros"),        // clz r0, r1
        (0xE100_0052, "arm_saturating_arithmetic"),      // qadd r0, r2, r1
        (0xE100_0380, "arm_signed_halfword_multiply"),   // smlabb r0, r0, r3, r0
        (0xE000_0291, "arm_multiply"),                   // mul r0, r1, r2
        (0xE0C1_0392, "arm_multiply_long"),              // smull r0, r1, r2, r3
        (0xE102_0091, "arm_swap"),                       // swp r0, r1, [r2]
        (0xE1D0_00B2, "arm_halfword_transfer"),          // ldrh r0, [r0, #2]
        (0xE10F_0000, "arm_psr_read"),                   // mrs r0, cpsr
        (0xE129_F000, "arm_psr_write_register"),         // msr cpsr_fc, r0
        (0xE328_F20F, "arm_psr_write_immediate"),        // msr cpsr_f, #0xF0000000
        (0xE591_0004, "arm_single_transfer"),            // ldr r0, [r1, #4]
        (0xE791_0012, "arm_undefined"),                  // register-offset encoding with bit 4 set
        (0xE8BD_8000, "arm_block_transfer"),             // ldmia sp!, {pc}
        (0xEAFF_FFFE, "arm_branch"),                     // b .
        (0xFA00_0000, "arm_branch"),                     // blx #imm
        (0xEE01_0F10, "arm_coprocessor_register"),       // mcr p15, 0, r0, c1, c0, 0
        (0xEE00_0000, "arm_coprocessor_other"),          // cdp
        (0xED90_0000, "arm_coprocessor_other"),          // ldc
        (0xEF00_0000, "arm_software_interrupt"),         // swi 0
        (0xE120_0070, "arm_breakpoint"),                 // bkpt
    ];
    for &(instr, expected) in cases {
        assert_eq!(arm(&decoder, instr), expected, "{instr:#010x}");
    }
    assert_eq!(decoder.arm_class_name(0xE12F_FF1E), "bx");
}

#[test]
fn decodes_representative_thumb_instructions() {
    let decoder = Decoder::<Recorder>::new();
    let cases: &[(u16, &str)] = &[
        (0x0048, "thumb_shift_immediate"),             // lsls r0, r1, #1
        (0x1888, "thumb_add_subtract"),                // adds r0, r1, r2
        (0x2005, "thumb_alu_immediate"),               // movs r0, #5
        (0x4008, "thumb_alu_register"),                // ands r0, r1
        (0x4770, "thumb_high_register"),               // bx lr
        (0x4801, "thumb_load_pc_relative"),            // ldr r0, [pc, #4]
        (0x5088, "thumb_transfer_register_offset"),    // str r0, [r1, r2]
        (0x5E88, "thumb_transfer_signed"),             // ldrsh r0, [r1, r2]
        (0x6848, "thumb_transfer_immediate"),          // ldr r0, [r1, #4]
        (0x8848, "thumb_transfer_halfword"),           // ldrh r0, [r1, #2]
        (0x9801, "thumb_transfer_stack"),              // ldr r0, [sp, #4]
        (0xA801, "thumb_add_address"),                 // add r0, sp, #4
        (0xB082, "thumb_adjust_stack"),                // sub sp, #8
        (0xB500, "thumb_push_pop"),                    // push {lr}
        (0xBD00, "thumb_push_pop"),                    // pop {pc}
        (0xBE00, "thumb_breakpoint"),                  // bkpt
        (0xC103, "thumb_block_transfer"),              // stmia r1!, {r0, r1}
        (0xD0FE, "thumb_conditional_branch"),          // beq .
        (0xDF00, "thumb_software_interrupt"),          // swi 0
        (0xE7FE, "thumb_branch"),                      // b .
        (0xF000, "thumb_branch_link_prefix"),
        (0xF800, "thumb_branch_link_suffix"),
        (0xE800, "thumb_branch_link_exchange_suffix"),
        (0xB100, "thumb_illegal"),                     // cbz space (not present before ARMv6T2)
    ];
    for &(instr, expected) in cases {
        assert_eq!(thumb(&decoder, instr), expected, "{instr:#06x}");
    }
    assert_eq!(decoder.thumb_class_name(0xDF00), "swi");
}

#[test]
fn index_helpers_pick_the_distinguishing_bits() {
    assert_eq!(arm_index(0x0FF0_00F0), 0xFFF);
    assert_eq!(arm_index(0xF00F_FF0F), 0);
    assert_eq!(thumb_index(0xFFC0), 0x3FF);
    assert_eq!(thumb_index(0x003F), 0);
}
