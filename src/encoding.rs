//! AArch64 instruction-word classification and bit-field decoding.
//!
//! Every function here is pure: a predicate `is_x(word)` tests whether a raw
//! little-endian instruction word belongs to one encoding class, and the
//! matching `decode_x(word)` extracts its operand fields. A `decode_x` call
//! is only meaningful after its `is_x` returned true; callers must test
//! first. `classify` composes the pairs into a single dispatch and `lower`
//! turns the decoded fields into an evaluator operation with all pc-relative
//! arithmetic resolved.

use crate::evaluator::{LoadAddress, Op, Operand, Writeback};
use crate::{Address, Reg};

/// Extend option of a register-offset load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOption {
    Uxtw,
    Lsl,
    Sxtw,
    Sxtx,
    Unknown,
}

/// Shift kind of the second operand of ADD (shifted register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Lsl,
    Lsr,
    Asr,
}

/// One classified instruction word with its decoded operand fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInst {
    Adr { rd: Reg, offset: i64 },
    Adrp { rd: Reg, offset: i64 },
    AddImmediate { rd: Reg, rn: Reg, is64: bool, imm: u64 },
    AddShiftedRegister { rd: Reg, rn: Reg, rm: Reg, is64: bool, shift: u8, amount: u8 },
    /// Recognized but not decoded; the evaluator stops on it.
    AddExtendedRegister,
    MovWideImmediate { rd: Reg, is64: bool, imm: i64 },
    MovInvertedWideImmediate { rd: Reg, is64: bool, imm: i64 },
    /// Recognized but not decoded; the evaluator stops on it.
    MovBitmaskImmediate,
    MovRegister { rd: Reg, rm: Reg, is64: bool },
    MovToFromSp { rd: Reg, rn: Reg, is64: bool },
    LdrImmediatePostIndex { rt: Reg, rn: Reg, is64: bool, simm: i64 },
    LdrImmediatePreIndex { rt: Reg, rn: Reg, is64: bool, simm: i64 },
    LdrImmediateUnsignedOffset { rt: Reg, rn: Reg, is64: bool, pimm: u64 },
    LdrLiteral { rt: Reg, is64: bool, label: i64 },
    LdrRegister { rt: Reg, rn: Reg, rm: Reg, is64: bool, extend: ExtendOption, amount: u8 },
    LdrswImmediatePostIndex { rt: Reg, rn: Reg, simm: i64 },
    LdrswImmediatePreIndex { rt: Reg, rn: Reg, simm: i64 },
    LdrswImmediateUnsignedOffset { rt: Reg, rn: Reg, pimm: u64 },
    LdrswLiteral { rt: Reg, label: i64 },
    LdrswRegister { rt: Reg, rn: Reg, rm: Reg, extend: ExtendOption, amount: u8 },
    StrImmediatePostIndex { rt: Reg, rn: Reg, is64: bool, simm: i64 },
    StrImmediatePreIndex { rt: Reg, rn: Reg, is64: bool, simm: i64 },
    StrImmediateUnsignedOffset { rt: Reg, rn: Reg, is64: bool, pimm: u64 },
    StrRegister { rt: Reg, rn: Reg, rm: Reg, is64: bool, extend: ExtendOption, amount: u8 },
    B { label: i64 },
    Bl { label: i64 },
    /// Branch to register; target is dynamic.
    Br { rn: Reg },
    /// Branch-and-link to register; target is dynamic.
    Blr { rn: Reg },
    Nop,
    Ret,
    Cbnz,
    Stp,
    /// stlxr/stxr; bounds atomic sequences, never analyzed.
    StoreExclusive,
}

/// Interpret `twos_complement` as a signed integer of `bit_width` bits.
pub fn twos_complement_to_int(twos_complement: u64, bit_width: u32) -> i64 {
    if bit_width >= 64 {
        return twos_complement as i64;
    }
    let sign_bit_mask = 1u64 << (bit_width - 1);
    if twos_complement & sign_bit_mask == 0 {
        twos_complement as i64
    } else {
        twos_complement as i64 - (1i64 << bit_width)
    }
}

/// Encode a signed integer back into `bit_width` bits of two's complement.
pub fn int_to_twos_complement(value: i64, bit_width: u32) -> u64 {
    if bit_width >= 64 {
        return value as u64;
    }
    (value as u64) & ((1u64 << bit_width) - 1)
}

/// The adrp effective address: page-align the pc, then add immediate pages.
pub fn adrp_result(immediate: i64, pc_address: Address) -> Address {
    let page = pc_address - pc_address % 4096;
    page.wrapping_add_signed(immediate.wrapping_mul(4096))
}

// ---------------------------------------------------------------------------
// Classification predicates. Masks follow the little-endian byte layout:
// bits [31:24] are the most significant byte of the word.
// ---------------------------------------------------------------------------

/// ADR <Xd>, <label>
pub fn is_adr(word: u32) -> bool {
    (word >> 24) & 0x9f == 0x10
}

/// ADRP <Xd>, <label>
pub fn is_adrp(word: u32) -> bool {
    (word >> 24) & 0x9f == 0x90
}

/// B <label>
pub fn is_b(word: u32) -> bool {
    (word >> 24) & 0xfc == 0x14
}

/// BL <label>
pub fn is_bl(word: u32) -> bool {
    (word >> 24) & 0xfc == 0x94
}

/// ADD (extended register), both widths.
/// A few rarely-hit encodings are not excluded, matching the scan's
/// efficiency-over-exactness tradeoff.
pub fn is_add_extended_register(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x0b && (word >> 16) & 0xe0 == 0x20
}

/// ADD (immediate), both widths. Also matches the MOV (to/from SP) alias;
/// classify() tests the alias first.
pub fn is_add_immediate(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x11 && (word >> 16) & 0x80 == 0x00
}

/// ADD (shifted register), both widths.
pub fn is_add_shifted_register(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x0b && (word >> 16) & 0x20 == 0x00
}

/// LDR (immediate), post-index: LDR <Rt>, [<Xn|SP>], #<simm>
pub fn is_ldr_immediate_post_index(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb8 && (word >> 16) & 0xe0 == 0x40 && (word >> 8) & 0x0c == 0x04
}

/// LDR (immediate), pre-index: LDR <Rt>, [<Xn|SP>, #<simm>]!
pub fn is_ldr_immediate_pre_index(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb8 && (word >> 16) & 0xe0 == 0x40 && (word >> 8) & 0x0c == 0x0c
}

/// LDR (immediate), unsigned offset: LDR <Rt>, [<Xn|SP>{, #<pimm>}]
pub fn is_ldr_immediate_unsigned_offset(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb9 && (word >> 16) & 0xc0 == 0x40
}

/// LDR (literal): LDR <Rt>, <label>
pub fn is_ldr_literal(word: u32) -> bool {
    (word >> 24) & 0xbf == 0x18
}

/// LDR (register): LDR <Rt>, [<Xn|SP>, (<Wm>|<Xm>){, <extend> {<amount>}}]
pub fn is_ldr_register(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb8 && (word >> 16) & 0xe0 == 0x60 && (word >> 8) & 0x0c == 0x08
}

/// LDRSW (immediate), post-index.
pub fn is_ldrsw_immediate_post_index(word: u32) -> bool {
    (word >> 24) & 0xff == 0xb8 && (word >> 16) & 0xe0 == 0x80 && (word >> 8) & 0x0c == 0x04
}

/// LDRSW (immediate), pre-index.
pub fn is_ldrsw_immediate_pre_index(word: u32) -> bool {
    (word >> 24) & 0xff == 0xb8 && (word >> 16) & 0xe0 == 0x80 && (word >> 8) & 0x0c == 0x0c
}

/// LDRSW (immediate), unsigned offset.
pub fn is_ldrsw_immediate_unsigned_offset(word: u32) -> bool {
    (word >> 24) & 0xff == 0xb9 && (word >> 16) & 0xc0 == 0x80
}

/// LDRSW (literal).
pub fn is_ldrsw_literal(word: u32) -> bool {
    (word >> 24) & 0xff == 0x98
}

/// LDRSW (register).
pub fn is_ldrsw_register(word: u32) -> bool {
    (word >> 24) & 0xff == 0xb8 && (word >> 16) & 0xe0 == 0xa0 && (word >> 8) & 0x0c == 0x08
}

/// MOV (bitmask immediate), an alias of ORR (immediate) with Rn = zr.
pub fn is_mov_bitmask_immediate(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x32
        && (word >> 16) & 0x80 == 0x00
        && (word >> 8) & 0x03 == 0x03
        && word & 0xe0 == 0xe0
}

/// MOV (inverted wide immediate), an alias of MOVN.
pub fn is_mov_inverted_wide_immediate(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x12 && (word >> 16) & 0x80 == 0x80
}

/// MOV (register), an alias of ORR (shifted register) with Rn = zr.
pub fn is_mov_register(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x2a
        && (word >> 16) & 0xe0 == 0x00
        && (word >> 8) & 0xff == 0x03
        && word & 0xe0 == 0xe0
}

/// MOV (to/from SP), an alias of ADD (immediate) with #0.
pub fn is_mov_to_from_sp(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x11 && (word >> 16) & 0xff == 0x00 && (word >> 8) & 0xfc == 0x00
}

/// MOV (wide immediate), an alias of MOVZ.
pub fn is_mov_wide_immediate(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x52 && (word >> 16) & 0x80 == 0x80
}

/// STR (immediate), post-index.
pub fn is_str_immediate_post_index(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb8 && (word >> 16) & 0xe0 == 0x00 && (word >> 8) & 0x0c == 0x04
}

/// STR (immediate), pre-index.
pub fn is_str_immediate_pre_index(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb8 && (word >> 16) & 0xe0 == 0x00 && (word >> 8) & 0x0c == 0x0c
}

/// STR (immediate), unsigned offset.
pub fn is_str_immediate_unsigned_offset(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb9 && (word >> 16) & 0xc0 == 0x00
}

/// STR (register).
pub fn is_str_register(word: u32) -> bool {
    (word >> 24) & 0xbf == 0xb8 && (word >> 16) & 0xe0 == 0x20 && (word >> 8) & 0x0c == 0x08
}

/// BR <Xn>
pub fn is_br(word: u32) -> bool {
    word & 0xfffffc1f == 0xd61f0000
}

/// BLR <Xn>
pub fn is_blr(word: u32) -> bool {
    word & 0xfffffc1f == 0xd63f0000
}

/// Decode br/blr: the branch register.
pub fn decode_branch_register(word: u32) -> Reg {
    ((word >> 5) & 0x1f) as Reg
}

/// NOP
pub fn is_nop(word: u32) -> bool {
    word == 0xd503201f
}

/// RET, RETAA, RETAB
pub fn is_ret(word: u32) -> bool {
    (word & 0xfffffc1f) == 0xd65f0000 || word == 0xd65f0bff || word == 0xd65f0fff
}

/// CBNZ, both widths.
pub fn is_cbnz(word: u32) -> bool {
    (word >> 24) & 0x7f == 0x35
}

/// STP, both widths (store form of the load/store-pair group).
pub fn is_stp(word: u32) -> bool {
    let opc = word >> 30;
    (word >> 25) & 0x1f == 0b10100 && (word >> 22) & 1 == 0 && (opc == 0b00 || opc == 0b10)
}

/// STLXR / STXR, both widths (Rt2 must be 11111).
pub fn is_store_exclusive(word: u32) -> bool {
    word >> 31 == 1 && (word >> 21) & 0x1ff == 0b001000000 && (word >> 10) & 0x1f == 0x1f
}

// ---------------------------------------------------------------------------
// Decoders. Each assumes its predicate matched.
// ---------------------------------------------------------------------------

/// Decode adr/adrp: (Rd, offset). For adrp the offset is in pages.
pub fn decode_adr(word: u32) -> (Reg, i64) {
    let rd = (word & 0x1f) as Reg;
    let immhi = (word >> 5) as u64 & 0x7ffff;
    let immlo = (word >> 29) as u64 & 0b11;
    let imm21 = (immhi << 2) | immlo;
    (rd, twos_complement_to_int(imm21, 21))
}

/// Decode b/bl: the byte offset of the label.
pub fn decode_b(word: u32) -> i64 {
    let imm26 = word as u64 & 0x3ff_ffff;
    twos_complement_to_int(imm26, 26) * 4
}

/// Decode ADD (immediate): (Rd, Rn, is64, final immediate with shift applied).
pub fn decode_add_immediate(word: u32) -> (Reg, Reg, bool, u64) {
    let is64 = word >> 31 == 1;
    let sh = (word >> 22) & 1;
    let imm12 = (word >> 10) as u64 & 0xfff;
    let rd = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let imm = if sh == 0 { imm12 } else { imm12 << 12 };
    (rd, rn, is64, imm)
}

/// Decode ADD (shifted register): (Rd, Rn, Rm, is64, shift kind, amount).
pub fn decode_add_shifted_register(word: u32) -> (Reg, Reg, Reg, bool, u8, u8) {
    let is64 = word >> 31 == 1;
    let rd = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let rm = ((word >> 16) & 0x1f) as Reg;
    let shift = ((word >> 22) & 0b11) as u8;
    let imm6 = ((word >> 10) & 0x3f) as u8;
    (rd, rn, rm, is64, shift, imm6)
}

/// Decode LDR (immediate) post-index: (Rt, Rn, is64, simm).
pub fn decode_ldr_immediate_post_index(word: u32) -> (Reg, Reg, bool, i64) {
    let is64 = (word >> 30) & 1 == 1;
    let rt = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let imm9 = (word >> 12) as u64 & 0x1ff;
    (rt, rn, is64, twos_complement_to_int(imm9, 9))
}

/// Decode LDR (immediate) pre-index: (Rt, Rn, is64, simm).
pub fn decode_ldr_immediate_pre_index(word: u32) -> (Reg, Reg, bool, i64) {
    decode_ldr_immediate_post_index(word)
}

/// Decode LDR (immediate) unsigned offset: (Rt, Rn, is64, pimm).
pub fn decode_ldr_immediate_unsigned_offset(word: u32) -> (Reg, Reg, bool, u64) {
    let is64 = (word >> 30) & 1 == 1;
    let rt = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let imm12 = (word >> 10) as u64 & 0xfff;
    let pimm = if is64 { imm12 * 8 } else { imm12 * 4 };
    (rt, rn, is64, pimm)
}

/// Decode LDR (literal): (Rt, is64, byte offset of the label).
pub fn decode_ldr_literal(word: u32) -> (Reg, bool, i64) {
    let is64 = (word >> 24) & 0x40 == 0x40;
    let rt = (word & 0x1f) as Reg;
    let imm19 = (word >> 5) as u64 & 0x7ffff;
    (rt, is64, twos_complement_to_int(imm19, 19) * 4)
}

fn extend_option(option: u32) -> ExtendOption {
    match option {
        0b010 => ExtendOption::Uxtw,
        0b011 => ExtendOption::Lsl,
        0b110 => ExtendOption::Sxtw,
        0b111 => ExtendOption::Sxtx,
        _ => ExtendOption::Unknown,
    }
}

/// Decode LDR (register): (Rt, Rn, Rm, is64, extend, amount).
pub fn decode_ldr_register(word: u32) -> (Reg, Reg, Reg, bool, ExtendOption, u8) {
    let is64 = (word >> 30) & 1 == 1;
    let rt = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let rm = ((word >> 16) & 0x1f) as Reg;
    let option = (word >> 13) & 0b111;
    let s = (word >> 12) & 1;
    let amount = if s == 0 {
        0
    } else if is64 {
        3
    } else {
        2
    };
    (rt, rn, rm, is64, extend_option(option), amount)
}

/// Decode LDRSW (immediate) post-index: (Rt, Rn, simm).
pub fn decode_ldrsw_immediate_post_index(word: u32) -> (Reg, Reg, i64) {
    let rt = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let imm9 = (word >> 12) as u64 & 0x1ff;
    (rt, rn, twos_complement_to_int(imm9, 9))
}

/// Decode LDRSW (immediate) pre-index: (Rt, Rn, simm).
pub fn decode_ldrsw_immediate_pre_index(word: u32) -> (Reg, Reg, i64) {
    decode_ldrsw_immediate_post_index(word)
}

/// Decode LDRSW (immediate) unsigned offset: (Rt, Rn, pimm).
pub fn decode_ldrsw_immediate_unsigned_offset(word: u32) -> (Reg, Reg, u64) {
    let rt = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let imm12 = (word >> 10) as u64 & 0xfff;
    (rt, rn, imm12 * 4)
}

/// Decode LDRSW (literal): (Rt, byte offset of the label).
pub fn decode_ldrsw_literal(word: u32) -> (Reg, i64) {
    let rt = (word & 0x1f) as Reg;
    let imm19 = (word >> 5) as u64 & 0x7ffff;
    (rt, twos_complement_to_int(imm19, 19) * 4)
}

/// Decode LDRSW (register): (Rt, Rn, Rm, extend, amount).
pub fn decode_ldrsw_register(word: u32) -> (Reg, Reg, Reg, ExtendOption, u8) {
    let rt = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    let rm = ((word >> 16) & 0x1f) as Reg;
    let option = (word >> 13) & 0b111;
    let s = (word >> 12) & 1;
    let amount = if s == 0 { 0 } else { 2 };
    (rt, rn, rm, extend_option(option), amount)
}

/// Decode MOV (inverted wide immediate): (Rd, is64, immediate).
pub fn decode_mov_inverted_wide_immediate(word: u32) -> (Reg, bool, i64) {
    let is64 = word >> 31 == 1;
    let rd = (word & 0x1f) as Reg;
    let imm16 = (word >> 5) as u64 & 0xffff;
    let hw = (word >> 21) as u64 & 0b11;
    let shifted = imm16 << (hw << 4);
    let imm = if is64 {
        twos_complement_to_int(!shifted, 64)
    } else {
        twos_complement_to_int(!shifted & 0xffff_ffff, 32)
    };
    (rd, is64, imm)
}

/// Decode MOV (register): (Rd, Rm, is64).
pub fn decode_mov_register(word: u32) -> (Reg, Reg, bool) {
    let is64 = word >> 31 == 1;
    let rd = (word & 0x1f) as Reg;
    let rm = ((word >> 16) & 0x1f) as Reg;
    (rd, rm, is64)
}

/// Decode MOV (to/from SP): (Rd, Rn, is64).
pub fn decode_mov_to_from_sp(word: u32) -> (Reg, Reg, bool) {
    let is64 = word >> 31 == 1;
    let rd = (word & 0x1f) as Reg;
    let rn = ((word >> 5) & 0x1f) as Reg;
    (rd, rn, is64)
}

/// Decode MOV (wide immediate): (Rd, is64, immediate).
pub fn decode_mov_wide_immediate(word: u32) -> (Reg, bool, i64) {
    let is64 = word >> 31 == 1;
    let rd = (word & 0x1f) as Reg;
    let imm16 = (word >> 5) as u64 & 0xffff;
    let hw = (word >> 21) as u64 & 0b11;
    let shifted = imm16 << (hw << 4);
    let bit_width = if is64 { 64 } else { 32 };
    (rd, is64, twos_complement_to_int(shifted, bit_width))
}

/// Decode STR (immediate) post-index: (Rt, Rn, is64, simm).
pub fn decode_str_immediate_post_index(word: u32) -> (Reg, Reg, bool, i64) {
    // str x8, [x22], #0x8  - (8, 22, true, 0x8)
    // str x21, [sp], #0x10 - (21, 31, true, 0x10)
    decode_ldr_immediate_post_index(word)
}

/// Decode STR (immediate) pre-index: (Rt, Rn, is64, simm).
pub fn decode_str_immediate_pre_index(word: u32) -> (Reg, Reg, bool, i64) {
    // str wzr, [sp, #-0x10]! - (31, 31, false, -0x10)
    decode_ldr_immediate_post_index(word)
}

/// Decode STR (immediate) unsigned offset: (Rt, Rn, is64, pimm).
pub fn decode_str_immediate_unsigned_offset(word: u32) -> (Reg, Reg, bool, u64) {
    // str xzr, [sp, #0x58] - (31, 31, true, 0x58)
    decode_ldr_immediate_unsigned_offset(word)
}

/// Decode STR (register): (Rt, Rn, Rm, is64, extend, amount).
pub fn decode_str_register(word: u32) -> (Reg, Reg, Reg, bool, ExtendOption, u8) {
    // str x9, [x8, w20, uxtw #3] - (9, 8, 20, true, Uxtw, 3)
    decode_ldr_register(word)
}

/// Classify one instruction word. Returns `None` for anything the engine
/// does not recognize at all.
pub fn classify(word: u32) -> Option<RawInst> {
    if is_nop(word) {
        return Some(RawInst::Nop);
    }
    if is_ret(word) {
        return Some(RawInst::Ret);
    }
    if is_cbnz(word) {
        return Some(RawInst::Cbnz);
    }
    if is_store_exclusive(word) {
        return Some(RawInst::StoreExclusive);
    }
    if is_stp(word) {
        return Some(RawInst::Stp);
    }
    if is_adr(word) {
        let (rd, offset) = decode_adr(word);
        return Some(RawInst::Adr { rd, offset });
    }
    if is_adrp(word) {
        let (rd, offset) = decode_adr(word);
        return Some(RawInst::Adrp { rd, offset });
    }
    if is_b(word) {
        return Some(RawInst::B { label: decode_b(word) });
    }
    if is_bl(word) {
        return Some(RawInst::Bl { label: decode_b(word) });
    }
    if is_br(word) {
        return Some(RawInst::Br { rn: decode_branch_register(word) });
    }
    if is_blr(word) {
        return Some(RawInst::Blr { rn: decode_branch_register(word) });
    }
    // The MOV (to/from SP) alias shares its encoding with ADD (immediate),
    // so the alias is tested first.
    if is_mov_to_from_sp(word) {
        let (rd, rn, is64) = decode_mov_to_from_sp(word);
        return Some(RawInst::MovToFromSp { rd, rn, is64 });
    }
    if is_add_immediate(word) {
        let (rd, rn, is64, imm) = decode_add_immediate(word);
        return Some(RawInst::AddImmediate { rd, rn, is64, imm });
    }
    if is_add_shifted_register(word) {
        let (rd, rn, rm, is64, shift, amount) = decode_add_shifted_register(word);
        return Some(RawInst::AddShiftedRegister { rd, rn, rm, is64, shift, amount });
    }
    if is_add_extended_register(word) {
        return Some(RawInst::AddExtendedRegister);
    }
    if is_mov_wide_immediate(word) {
        let (rd, is64, imm) = decode_mov_wide_immediate(word);
        return Some(RawInst::MovWideImmediate { rd, is64, imm });
    }
    if is_mov_inverted_wide_immediate(word) {
        let (rd, is64, imm) = decode_mov_inverted_wide_immediate(word);
        return Some(RawInst::MovInvertedWideImmediate { rd, is64, imm });
    }
    if is_mov_bitmask_immediate(word) {
        return Some(RawInst::MovBitmaskImmediate);
    }
    if is_mov_register(word) {
        let (rd, rm, is64) = decode_mov_register(word);
        return Some(RawInst::MovRegister { rd, rm, is64 });
    }
    if is_ldrsw_immediate_post_index(word) {
        let (rt, rn, simm) = decode_ldrsw_immediate_post_index(word);
        return Some(RawInst::LdrswImmediatePostIndex { rt, rn, simm });
    }
    if is_ldrsw_immediate_pre_index(word) {
        let (rt, rn, simm) = decode_ldrsw_immediate_pre_index(word);
        return Some(RawInst::LdrswImmediatePreIndex { rt, rn, simm });
    }
    if is_ldrsw_immediate_unsigned_offset(word) {
        let (rt, rn, pimm) = decode_ldrsw_immediate_unsigned_offset(word);
        return Some(RawInst::LdrswImmediateUnsignedOffset { rt, rn, pimm });
    }
    if is_ldrsw_literal(word) {
        let (rt, label) = decode_ldrsw_literal(word);
        return Some(RawInst::LdrswLiteral { rt, label });
    }
    if is_ldrsw_register(word) {
        let (rt, rn, rm, extend, amount) = decode_ldrsw_register(word);
        return Some(RawInst::LdrswRegister { rt, rn, rm, extend, amount });
    }
    if is_ldr_immediate_post_index(word) {
        let (rt, rn, is64, simm) = decode_ldr_immediate_post_index(word);
        return Some(RawInst::LdrImmediatePostIndex { rt, rn, is64, simm });
    }
    if is_ldr_immediate_pre_index(word) {
        let (rt, rn, is64, simm) = decode_ldr_immediate_pre_index(word);
        return Some(RawInst::LdrImmediatePreIndex { rt, rn, is64, simm });
    }
    if is_ldr_immediate_unsigned_offset(word) {
        let (rt, rn, is64, pimm) = decode_ldr_immediate_unsigned_offset(word);
        return Some(RawInst::LdrImmediateUnsignedOffset { rt, rn, is64, pimm });
    }
    if is_ldr_literal(word) {
        let (rt, is64, label) = decode_ldr_literal(word);
        return Some(RawInst::LdrLiteral { rt, is64, label });
    }
    if is_ldr_register(word) {
        let (rt, rn, rm, is64, extend, amount) = decode_ldr_register(word);
        return Some(RawInst::LdrRegister { rt, rn, rm, is64, extend, amount });
    }
    if is_str_immediate_post_index(word) {
        let (rt, rn, is64, simm) = decode_str_immediate_post_index(word);
        return Some(RawInst::StrImmediatePostIndex { rt, rn, is64, simm });
    }
    if is_str_immediate_pre_index(word) {
        let (rt, rn, is64, simm) = decode_str_immediate_pre_index(word);
        return Some(RawInst::StrImmediatePreIndex { rt, rn, is64, simm });
    }
    if is_str_immediate_unsigned_offset(word) {
        let (rt, rn, is64, pimm) = decode_str_immediate_unsigned_offset(word);
        return Some(RawInst::StrImmediateUnsignedOffset { rt, rn, is64, pimm });
    }
    if is_str_register(word) {
        let (rt, rn, rm, is64, extend, amount) = decode_str_register(word);
        return Some(RawInst::StrRegister { rt, rn, rm, is64, extend, amount });
    }
    None
}

/// Lower a classified instruction into an evaluator operation, resolving all
/// pc-relative arithmetic against `load_address`. Returns `None` for classes
/// the evaluator cannot model (the conservative-stop set).
pub fn lower(raw: &RawInst, load_address: Address) -> Option<Op> {
    match *raw {
        RawInst::Adr { rd, offset } => Some(Op::Adr {
            rd,
            target: load_address.wrapping_add_signed(offset),
        }),
        RawInst::Adrp { rd, offset } => Some(Op::Adr {
            rd,
            target: adrp_result(offset, load_address),
        }),
        RawInst::AddImmediate { rd, rn, is64, imm } => Some(Op::Add {
            rd,
            is64,
            lhs: Operand::Reg { index: rn, is64 },
            rhs: Operand::Imm(imm as i64),
        }),
        RawInst::AddShiftedRegister { rd, rn, rm, is64, shift, amount } => {
            let shift = match shift {
                0b00 => Shift::Lsl,
                0b01 => Shift::Lsr,
                0b10 => Shift::Asr,
                _ => return None,
            };
            Some(Op::Add {
                rd,
                is64,
                lhs: Operand::Reg { index: rn, is64 },
                rhs: Operand::ShiftedReg { index: rm, is64, shift, amount },
            })
        }
        RawInst::MovWideImmediate { rd, is64, imm }
        | RawInst::MovInvertedWideImmediate { rd, is64, imm } => Some(Op::Mov {
            rd,
            is64,
            src: Operand::Imm(imm),
        }),
        RawInst::MovRegister { rd, rm, is64 } => Some(Op::Mov {
            rd,
            is64,
            src: Operand::Reg { index: rm, is64 },
        }),
        RawInst::MovToFromSp { rd, rn, is64 } => Some(Op::Mov {
            rd,
            is64,
            src: Operand::Reg { index: rn, is64 },
        }),
        RawInst::LdrImmediatePostIndex { rt, rn, is64, simm } => Some(Op::Load {
            rt,
            is64,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(simm),
                writeback: Writeback::Post,
            },
        }),
        RawInst::LdrImmediatePreIndex { rt, rn, is64, simm } => Some(Op::Load {
            rt,
            is64,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(simm),
                writeback: Writeback::Pre,
            },
        }),
        RawInst::LdrImmediateUnsignedOffset { rt, rn, is64, pimm } => Some(Op::Load {
            rt,
            is64,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(pimm as i64),
                writeback: Writeback::None,
            },
        }),
        RawInst::LdrLiteral { rt, is64, label } => Some(Op::Load {
            rt,
            is64,
            sign_extend_word: false,
            address: LoadAddress::Literal {
                target: load_address.wrapping_add_signed(label),
            },
        }),
        RawInst::LdrRegister { rt, rn, rm, is64, extend, amount } => {
            if extend == ExtendOption::Unknown {
                return None;
            }
            Some(Op::Load {
                rt,
                is64,
                sign_extend_word: false,
                address: LoadAddress::BaseRegister { base: rn, rm, extend, amount },
            })
        }
        RawInst::LdrswImmediatePostIndex { rt, rn, simm } => Some(Op::Load {
            rt,
            is64: true,
            sign_extend_word: true,
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(simm),
                writeback: Writeback::Post,
            },
        }),
        RawInst::LdrswImmediatePreIndex { rt, rn, simm } => Some(Op::Load {
            rt,
            is64: true,
            sign_extend_word: true,
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(simm),
                writeback: Writeback::Pre,
            },
        }),
        RawInst::LdrswImmediateUnsignedOffset { rt, rn, pimm } => Some(Op::Load {
            rt,
            is64: true,
            sign_extend_word: true,
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(pimm as i64),
                writeback: Writeback::None,
            },
        }),
        RawInst::LdrswLiteral { rt, label } => Some(Op::Load {
            rt,
            is64: true,
            sign_extend_word: true,
            address: LoadAddress::Literal {
                target: load_address.wrapping_add_signed(label),
            },
        }),
        RawInst::LdrswRegister { rt, rn, rm, extend, amount } => {
            if extend == ExtendOption::Unknown {
                return None;
            }
            Some(Op::Load {
                rt,
                is64: true,
                sign_extend_word: true,
                address: LoadAddress::BaseRegister { base: rn, rm, extend, amount },
            })
        }
        RawInst::StrImmediatePostIndex { rn, simm, .. } => Some(Op::Store {
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(simm),
                writeback: Writeback::Post,
            },
        }),
        RawInst::StrImmediatePreIndex { rn, simm, .. } => Some(Op::Store {
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(simm),
                writeback: Writeback::Pre,
            },
        }),
        RawInst::StrImmediateUnsignedOffset { rn, pimm, .. } => Some(Op::Store {
            address: LoadAddress::BaseOffset {
                base: rn,
                offset: Operand::Imm(pimm as i64),
                writeback: Writeback::None,
            },
        }),
        RawInst::StrRegister { rn, rm, extend, amount, .. } => {
            if extend == ExtendOption::Unknown {
                return None;
            }
            Some(Op::Store {
                address: LoadAddress::BaseRegister { base: rn, rm, extend, amount },
            })
        }
        RawInst::B { label } => Some(Op::Branch {
            link: false,
            target: load_address.wrapping_add_signed(label),
        }),
        RawInst::Bl { label } => Some(Op::Branch {
            link: true,
            target: load_address.wrapping_add_signed(label),
        }),
        RawInst::Nop => Some(Op::Nop),
        RawInst::AddExtendedRegister
        | RawInst::MovBitmaskImmediate
        | RawInst::Br { .. }
        | RawInst::Blr { .. }
        | RawInst::Ret
        | RawInst::Cbnz
        | RawInst::Stp
        | RawInst::StoreExclusive => None,
    }
}

/// Instruction-word builders for tests. Field layouts are the inverse of the
/// decoders above.
#[cfg(test)]
pub(crate) mod build {
    use super::int_to_twos_complement;
    use crate::Reg;

    pub fn adr(rd: Reg, imm21: i64) -> u32 {
        let imm = int_to_twos_complement(imm21, 21) as u32;
        ((imm & 0b11) << 29) | (0x10 << 24) | (((imm >> 2) & 0x7ffff) << 5) | rd as u32
    }

    pub fn adrp(rd: Reg, imm21: i64) -> u32 {
        adr(rd, imm21) | (1 << 31)
    }

    pub fn add_imm(rd: Reg, rn: Reg, is64: bool, imm12: u32, sh: bool) -> u32 {
        let base = if is64 { 0x9100_0000 } else { 0x1100_0000 };
        base | ((sh as u32) << 22) | ((imm12 & 0xfff) << 10) | ((rn as u32) << 5) | rd as u32
    }

    pub fn add_shifted(rd: Reg, rn: Reg, rm: Reg, is64: bool, shift: u32, amount: u32) -> u32 {
        let base = if is64 { 0x8b00_0000 } else { 0x0b00_0000 };
        base | (shift << 22)
            | ((rm as u32) << 16)
            | ((amount & 0x3f) << 10)
            | ((rn as u32) << 5)
            | rd as u32
    }

    pub fn movz(rd: Reg, is64: bool, imm16: u32, hw: u32) -> u32 {
        let base = if is64 { 0xd280_0000 } else { 0x5280_0000 };
        base | (hw << 21) | ((imm16 & 0xffff) << 5) | rd as u32
    }

    pub fn movn(rd: Reg, is64: bool, imm16: u32, hw: u32) -> u32 {
        let base = if is64 { 0x9280_0000 } else { 0x1280_0000 };
        base | (hw << 21) | ((imm16 & 0xffff) << 5) | rd as u32
    }

    pub fn mov_reg(rd: Reg, rm: Reg, is64: bool) -> u32 {
        let base = if is64 { 0xaa00_03e0 } else { 0x2a00_03e0 };
        base | ((rm as u32) << 16) | rd as u32
    }

    pub fn mov_sp(rd: Reg, rn: Reg, is64: bool) -> u32 {
        let base = if is64 { 0x9100_0000 } else { 0x1100_0000 };
        base | ((rn as u32) << 5) | rd as u32
    }

    pub fn ldr_imm_unsigned(rt: Reg, rn: Reg, is64: bool, imm12: u32) -> u32 {
        let base = if is64 { 0xf940_0000 } else { 0xb940_0000 };
        base | ((imm12 & 0xfff) << 10) | ((rn as u32) << 5) | rt as u32
    }

    pub fn ldr_imm_post(rt: Reg, rn: Reg, is64: bool, simm9: i64) -> u32 {
        let base = if is64 { 0xf840_0400 } else { 0xb840_0400 };
        base | ((int_to_twos_complement(simm9, 9) as u32) << 12) | ((rn as u32) << 5) | rt as u32
    }

    pub fn ldr_imm_pre(rt: Reg, rn: Reg, is64: bool, simm9: i64) -> u32 {
        let base = if is64 { 0xf840_0c00 } else { 0xb840_0c00 };
        base | ((int_to_twos_complement(simm9, 9) as u32) << 12) | ((rn as u32) << 5) | rt as u32
    }

    pub fn ldr_register(rt: Reg, rn: Reg, rm: Reg, is64: bool, option: u32, s: u32) -> u32 {
        let base = if is64 { 0xf860_0800 } else { 0xb860_0800 };
        base | ((rm as u32) << 16) | (option << 13) | (s << 12) | ((rn as u32) << 5) | rt as u32
    }

    pub fn ldrsw_imm_unsigned(rt: Reg, rn: Reg, imm12: u32) -> u32 {
        0xb980_0000 | ((imm12 & 0xfff) << 10) | ((rn as u32) << 5) | rt as u32
    }

    pub fn ldrsw_literal(rt: Reg, imm19: i64) -> u32 {
        0x9800_0000 | ((int_to_twos_complement(imm19, 19) as u32) << 5) | rt as u32
    }

    pub fn str_imm_unsigned(rt: Reg, rn: Reg, is64: bool, imm12: u32) -> u32 {
        let base = if is64 { 0xf900_0000 } else { 0xb900_0000 };
        base | ((imm12 & 0xfff) << 10) | ((rn as u32) << 5) | rt as u32
    }

    pub fn str_imm_post(rt: Reg, rn: Reg, is64: bool, simm9: i64) -> u32 {
        let base = if is64 { 0xf800_0400 } else { 0xb800_0400 };
        base | ((int_to_twos_complement(simm9, 9) as u32) << 12) | ((rn as u32) << 5) | rt as u32
    }

    pub fn b(offset_bytes: i64) -> u32 {
        0x1400_0000 | (int_to_twos_complement(offset_bytes / 4, 26) as u32 & 0x3ff_ffff)
    }

    pub fn br(rn: Reg) -> u32 {
        0xd61f_0000 | ((rn as u32) << 5)
    }

    pub fn blr(rn: Reg) -> u32 {
        0xd63f_0000 | ((rn as u32) << 5)
    }

    pub fn bl(offset_bytes: i64) -> u32 {
        0x9400_0000 | (int_to_twos_complement(offset_bytes / 4, 26) as u32 & 0x3ff_ffff)
    }

    pub fn nop() -> u32 {
        0xd503_201f
    }

    pub fn ret() -> u32 {
        0xd65f_03c0
    }
}
