//! Table-driven ARM/Thumb instruction decoder.
//!
//! Instruction classes are registered as bit-pattern strings over the bits that distinguish them
//! (bits 27:20 and 7:4 for ARM, bits 15:6 for Thumb). At construction every possible index is
//! resolved once, most specific pattern first, so decoding is a single table lookup.
//!
//! The decoder is generic over its consumer: anything implementing [`ArmHandlers`] and
//! [`ThumbHandlers`] (the interpreter executes, the translator emits IR) gets a table of plain
//! function pointers into its own methods.

mod pattern;

pub use pattern::{Pattern, PatternError};

use std::fmt;

pub const ARM_INDEX_BITS: usize = 12;
pub const THUMB_INDEX_BITS: usize = 10;

pub type ArmHandler<T> = fn(&mut T, u32);
pub type ThumbHandler<T> = fn(&mut T, u16);

/// One method per ARM instruction class.
pub trait ArmHandlers: Sized {
    fn arm_data_processing(&mut self, instr: u32);
    fn arm_psr_read(&mut self, instr: u32);
    fn arm_psr_write_register(&mut self, instr: u32);
    fn arm_psr_write_immediate(&mut self, instr: u32);
    fn arm_multiply(&mut self, instr: u32);
    fn arm_multiply_long(&mut self, instr: u32);
    fn arm_signed_halfword_multiply(&mut self, instr: u32);
    fn arm_saturating_arithmetic(&mut self, instr: u32);
    fn arm_count_leading_zeros(&mut self, instr: u32);
    fn arm_swap(&mut self, instr: u32);
    fn arm_halfword_transfer(&mut self, instr: u32);
    fn arm_single_transfer(&mut self, instr: u32);
    fn arm_block_transfer(&mut self, instr: u32);
    fn arm_branch(&mut self, instr: u32);
    fn arm_branch_exchange(&mut self, instr: u32);
    fn arm_branch_link_exchange_register(&mut self, instr: u32);
    fn arm_breakpoint(&mut self, instr: u32);
    fn arm_coprocessor_register(&mut self, instr: u32);
    fn arm_coprocessor_other(&mut self, instr: u32);
    fn arm_software_interrupt(&mut self, instr: u32);
    fn arm_undefined(&mut self, instr: u32);
    fn arm_illegal(&mut self, instr: u32);
}

/// One method per Thumb instruction class.
pub trait ThumbHandlers: Sized {
    fn thumb_shift_immediate(&mut self, instr: u16);
    fn thumb_add_subtract(&mut self, instr: u16);
    fn thumb_alu_immediate(&mut self, instr: u16);
    fn thumb_alu_register(&mut self, instr: u16);
    fn thumb_high_register(&mut self, instr: u16);
    fn thumb_load_pc_relative(&mut self, instr: u16);
    fn thumb_transfer_register_offset(&mut self, instr: u16);
    fn thumb_transfer_signed(&mut self, instr: u16);
    fn thumb_transfer_immediate(&mut self, instr: u16);
    fn thumb_transfer_halfword(&mut self, instr: u16);
    fn thumb_transfer_stack(&mut self, instr: u16);
    fn thumb_add_address(&mut self, instr: u16);
    fn thumb_adjust_stack(&mut self, instr: u16);
    fn thumb_push_pop(&mut self, instr: u16);
    fn thumb_block_transfer(&mut self, instr: u16);
    fn thumb_conditional_branch(&mut self, instr: u16);
    fn thumb_software_interrupt(&mut self, instr: u16);
    fn thumb_branch(&mut self, instr: u16);
    fn thumb_branch_link_prefix(&mut self, instr: u16);
    fn thumb_branch_link_suffix(&mut self, instr: u16);
    fn thumb_branch_link_exchange_suffix(&mut self, instr: u16);
    fn thumb_breakpoint(&mut self, instr: u16);
    fn thumb_illegal(&mut self, instr: u16);
}

/// Index into the ARM table: bits 27:20 followed by bits 7:4.
#[inline]
pub const fn arm_index(instr: u32) -> usize {
    (((instr >> 16) & 0xFF0) | ((instr >> 4) & 0xF)) as usize
}

/// Index into the Thumb table: bits 15:6.
#[inline]
pub const fn thumb_index(instr: u16) -> usize {
    (instr >> 6) as usize
}

macro_rules! arm {
    ($text:literal) => {{
        const PATTERN: Pattern = Pattern::parse($text, ARM_INDEX_BITS);
        PATTERN
    }};
}

macro_rules! thumb {
    ($text:literal) => {{
        const PATTERN: Pattern = Pattern::parse($text, THUMB_INDEX_BITS);
        PATTERN
    }};
}

#[derive(Clone, Copy)]
pub struct Entry<H> {
    pub name: &'static str,
    pub pattern: Pattern,
    pub handler: H,
}

impl<H> fmt::Debug for Entry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .finish()
    }
}

struct Table<H> {
    entries: Vec<Entry<H>>,
    lookup: Box<[u16]>,
}

impl<H: Copy> Table<H> {
    /// Sorts `entries` by descending specificity (stable, so earlier registration wins ties) and
    /// resolves every index. The last entry must match everything.
    fn build(mut entries: Vec<Entry<H>>, index_bits: usize) -> Self {
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.pattern.specificity()));

        let lookup = (0..1u32 << index_bits)
            .map(|index| {
                entries
                    .iter()
                    .position(|entry| entry.pattern.matches(index))
                    .map_or(u16::MAX, |position| position as u16)
            })
            .collect::<Box<[u16]>>();
        debug_assert!(lookup.iter().all(|&slot| slot != u16::MAX));

        Self { entries, lookup }
    }

    #[inline]
    fn entry(&self, index: usize) -> &Entry<H> {
        &self.entries[self.lookup[index] as usize]
    }
}

/// Two flat lookup tables resolving opcodes to handlers of `T`.
pub struct Decoder<T> {
    arm: Table<ArmHandler<T>>,
    thumb: Table<ThumbHandler<T>>,
}

impl<T: ArmHandlers + ThumbHandlers> Decoder<T> {
    pub fn new() -> Self {
        Self {
            arm: Table::build(arm_entries::<T>(), ARM_INDEX_BITS),
            thumb: Table::build(thumb_entries::<T>(), THUMB_INDEX_BITS),
        }
    }
}

impl<T: ArmHandlers + ThumbHandlers> Default for Decoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Decoder<T> {
    #[inline]
    pub fn decode_arm(&self, instr: u32) -> ArmHandler<T> {
        self.arm.entry(arm_index(instr)).handler
    }

    #[inline]
    pub fn decode_thumb(&self, instr: u16) -> ThumbHandler<T> {
        self.thumb.entry(thumb_index(instr)).handler
    }

    /// Instruction class name for diagnostics.
    pub fn arm_class_name(&self, instr: u32) -> &'static str {
        self.arm.entry(arm_index(instr)).name
    }

    pub fn thumb_class_name(&self, instr: u16) -> &'static str {
        self.thumb.entry(thumb_index(instr)).name
    }

    /// Registered ARM entries in resolution order.
    pub fn arm_entries(&self) -> &[Entry<ArmHandler<T>>] {
        &self.arm.entries
    }

    pub fn thumb_entries(&self) -> &[Entry<ThumbHandler<T>>] {
        &self.thumb.entries
    }

    /// Position in [`Decoder::arm_entries`] that `index` resolves to.
    pub fn arm_slot(&self, index: usize) -> usize {
        self.arm.lookup[index] as usize
    }

    pub fn thumb_slot(&self, index: usize) -> usize {
        self.thumb.lookup[index] as usize
    }
}

impl<T> fmt::Debug for Decoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("arm_entries", &self.arm.entries.len())
            .field("thumb_entries", &self.thumb.entries.len())
            .finish()
    }
}

fn arm_entries<T: ArmHandlers>() -> Vec<Entry<ArmHandler<T>>> {
    let entry = |name, pattern, handler: ArmHandler<T>| Entry {
        name,
        pattern,
        handler,
    };
    vec![
        entry("bx", arm!("000100100001"), T::arm_branch_exchange),
        entry("blx_reg", arm!("000100100011"), T::arm_branch_link_exchange_register),
        entry("bkpt", arm!("000100100111"), T::arm_breakpoint),
        entry("clz", arm!("000101100001"), T::arm_count_leading_zeros),
        entry("qadd", arm!("00010xx00101"), T::arm_saturating_arithmetic),
        entry("smla_xy", arm!("00010xx01xx0"), T::arm_signed_halfword_multiply),
        entry("mul", arm!("000000xx1001"), T::arm_multiply),
        entry("mull", arm!("00001xxx1001"), T::arm_multiply_long),
        entry("swp", arm!("00010x001001"), T::arm_swap),
        entry("halfword_transfer", arm!("000xxxxx1xx1"), T::arm_halfword_transfer),
        entry("mrs", arm!("00010x000000"), T::arm_psr_read),
        entry("msr_reg", arm!("00010x100000"), T::arm_psr_write_register),
        entry("msr_imm", arm!("00110x10xxxx"), T::arm_psr_write_immediate),
        entry("data_processing", arm!("00xxxxxxxxxx"), T::arm_data_processing),
        entry("undefined", arm!("011xxxxxxxx1"), T::arm_undefined),
        entry("single_transfer", arm!("01xxxxxxxxxx"), T::arm_single_transfer),
        entry("block_transfer", arm!("100xxxxxxxxx"), T::arm_block_transfer),
        entry("branch", arm!("101xxxxxxxxx"), T::arm_branch),
        entry("coprocessor_register", arm!("1110xxxxxxx1"), T::arm_coprocessor_register),
        entry("coprocessor_data", arm!("1110xxxxxxx0"), T::arm_coprocessor_other),
        entry("coprocessor_transfer", arm!("110xxxxxxxxx"), T::arm_coprocessor_other),
        entry("swi", arm!("1111xxxxxxxx"), T::arm_software_interrupt),
        entry("illegal", arm!("xxxxxxxxxxxx"), T::arm_illegal),
    ]
}

fn thumb_entries<T: ThumbHandlers>() -> Vec<Entry<ThumbHandler<T>>> {
    let entry = |name, pattern, handler: ThumbHandler<T>| Entry {
        name,
        pattern,
        handler,
    };
    vec![
        entry("add_subtract", thumb!("00011xxxxx"), T::thumb_add_subtract),
        entry("shift_immediate", thumb!("000xxxxxxx"), T::thumb_shift_immediate),
        entry("alu_immediate", thumb!("001xxxxxxx"), T::thumb_alu_immediate),
        entry("alu_register", thumb!("010000xxxx"), T::thumb_alu_register),
        entry("high_register", thumb!("010001xxxx"), T::thumb_high_register),
        entry("ldr_pc", thumb!("01001xxxxx"), T::thumb_load_pc_relative),
        entry("transfer_register", thumb!("0101xx0xxx"), T::thumb_transfer_register_offset),
        entry("transfer_signed", thumb!("0101xx1xxx"), T::thumb_transfer_signed),
        entry("transfer_immediate", thumb!("011xxxxxxx"), T::thumb_transfer_immediate),
        entry("transfer_halfword", thumb!("1000xxxxxx"), T::thumb_transfer_halfword),
        entry("transfer_stack", thumb!("1001xxxxxx"), T::thumb_transfer_stack),
        entry("add_address", thumb!("1010xxxxxx"), T::thumb_add_address),
        entry("adjust_stack", thumb!("10110000xx"), T::thumb_adjust_stack),
        entry("push_pop", thumb!("1011x10xxx"), T::thumb_push_pop),
        entry("bkpt", thumb!("10111110xx"), T::thumb_breakpoint),
        entry("block_transfer", thumb!("1100xxxxxx"), T::thumb_block_transfer),
        entry("swi", thumb!("11011111xx"), T::thumb_software_interrupt),
        entry("conditional_branch", thumb!("1101xxxxxx"), T::thumb_conditional_branch),
        entry("branch", thumb!("11100xxxxx"), T::thumb_branch),
        entry("blx_suffix", thumb!("11101xxxxx"), T::thumb_branch_link_exchange_suffix),
        entry("bl_prefix", thumb!("11110xxxxx"), T::thumb_branch_link_prefix),
        entry("bl_suffix", thumb!("11111xxxxx"), T::thumb_branch_link_suffix),
        entry("illegal", thumb!("xxxxxxxxxx"), T::thumb_illegal),
    ]
}
