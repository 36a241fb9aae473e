//! PowerPC instruction classification.
//!
//! Only the handful of instruction forms the control-flow analysis cares about
//! are recognized: the branch families, and the few loads and moves that make
//! up a jump-table dispatch sequence. All functions are pure predicates over a
//! single Big Endian instruction word.

/// `b`, `bl`, `ba`, `bla` (I-form).
const OPCODE_B: u32 = 0x48000000;
/// `bc` and its extended mnemonics (B-form).
const OPCODE_BC: u32 = 0x40000000;
const OPCODE_MASK: u32 = 0xFC000000;
/// `bclr` (XL-form, opcode 19, XO 16).
const BCLR: u32 = 0x4C000020;
/// `bcctr` (XL-form, opcode 19, XO 528).
const BCCTR: u32 = 0x4C000420;
const XL_MASK: u32 = 0xFC0007FE;
/// Link bit.
const LK: u32 = 0x1;

/// `mflr r12`, the first instruction of most non-leaf prologues.
pub const MFLR_R12: u32 = 0x7D8802A6;

/// Extracts the BO field of a B-form or XL-form branch.
pub fn bo(word: u32) -> u32 {
    (word >> 21) & 0x1F
}

/// Extracts the BI field of a B-form or XL-form branch.
pub fn bi(word: u32) -> u32 {
    (word >> 16) & 0x1F
}

/// Whether a BO value ignores both the condition and the counter.
pub fn bo_always(bo: u32) -> bool {
    bo & 0x14 == 0x14
}

/// Unconditional relative branch without link.
pub fn is_b(word: u32) -> bool {
    word & 0xFC000003 == OPCODE_B
}

/// Unconditional relative branch with link (a call).
pub fn is_bl(word: u32) -> bool {
    word & 0xFC000003 == OPCODE_B | LK
}

/// Any conditional relative branch, with or without link.
pub fn is_bc(word: u32) -> bool {
    word & OPCODE_MASK == OPCODE_BC
}

/// Conditional relative branch with link.
pub fn is_bcl(word: u32) -> bool {
    is_bc(word) && word & LK != 0
}

fn is_bclr_family(word: u32) -> bool {
    word & XL_MASK == BCLR
}

fn is_bcctr_family(word: u32) -> bool {
    word & XL_MASK == BCCTR
}

/// Unconditional return: `blr`.
pub fn is_blr(word: u32) -> bool {
    is_bclr_family(word) && bo_always(bo(word)) && word & LK == 0
}

/// Unconditional call through the link register: `blrl`.
pub fn is_blrl(word: u32) -> bool {
    is_bclr_family(word) && bo_always(bo(word)) && word & LK != 0
}

/// Unconditional branch through the count register: `bctr`.
pub fn is_bctr(word: u32) -> bool {
    is_bcctr_family(word) && bo_always(bo(word)) && word & LK == 0
}

/// Unconditional call through the count register: `bctrl`.
pub fn is_bctrl(word: u32) -> bool {
    is_bcctr_family(word) && bo_always(bo(word)) && word & LK != 0
}

/// Conditional return, e.g. `beqlr`.
pub fn is_conditional_return(word: u32) -> bool {
    is_bclr_family(word) && !bo_always(bo(word))
}

/// Conditional branch through the count register, e.g. `beqctr`.
pub fn is_conditional_bcctr(word: u32) -> bool {
    is_bcctr_family(word) && !bo_always(bo(word))
}

/// `lis rD, imm` (`addis rD, 0, imm`).
pub fn is_lis(word: u32) -> bool {
    word & 0xFC1F0000 == 0x3C000000
}

/// `lfs`.
pub fn is_lfs(word: u32) -> bool {
    word & OPCODE_MASK == 0xC0000000
}

/// `addi` (and `li`).
pub fn is_addi(word: u32) -> bool {
    word & OPCODE_MASK == 0x38000000
}

/// `bdnz` (decrement CTR, branch if non-zero).
pub fn is_bdnz(word: u32) -> bool {
    word & 0xFFFF0000 == 0x42000000
}

/// Indexed zero-extending loads: `lbzx`, `lhzx`, `lwzx`.
pub fn is_load_indexed(word: u32) -> bool {
    match word & 0xFC0007FF {
        0x7C0000AE | 0x7C00022E | 0x7C00002E => true,
        _ => false,
    }
}

/// `cmpli` / `cmplwi` (compare logical immediate).
pub fn is_cmpli(word: u32) -> bool {
    word & OPCODE_MASK == 0x28000000
}

/// `mtspr`, any special purpose register.
pub fn is_mtspr(word: u32) -> bool {
    word & XL_MASK == 0x7C0003A6
}

/// `mtctr rS`.
pub fn is_mtctr(word: u32) -> bool {
    word & 0xFC1FFFFF == 0x7C0903A6
}

/// Target of an I-form branch at `addr`: the 24-bit LI field, shifted left by
/// 2 and sign-extended, relative to the instruction.
pub fn branch_target(addr: u32, word: u32) -> u32 {
    let offset = (((word & 0x03FFFFFC) << 6) as i32) >> 6;
    addr.wrapping_add(offset as u32)
}

/// Target of a B-form branch at `addr`: the 14-bit BD field, shifted left by
/// 2 and sign-extended, relative to the instruction.
pub fn bc_target(addr: u32, word: u32) -> u32 {
    let offset = i32::from((word & 0xFFFC) as u16 as i16);
    addr.wrapping_add(offset as u32)
}

/// How an instruction transfers control.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Control {
    /// Not a control transfer.
    None,
    /// `b`, or a `bc` whose condition is always true.
    Branch(u32),
    /// `bl` or `bcl`.
    Call(u32),
    /// `bc` depending on a condition or the counter.
    ConditionalBranch(u32),
    /// `blr`.
    Return,
    /// `blrl`.
    ReturnAndLink,
    /// `bclr` depending on a condition.
    ConditionalReturn,
    /// `bctr`.
    IndirectBranch,
    /// `bctrl`.
    IndirectCall,
    /// `bcctr` depending on a condition.
    ConditionalIndirect,
}

/// Classifies the instruction `word` located at `addr`.
pub fn classify(addr: u32, word: u32) -> Control {
    if is_b(word) {
        Control::Branch(branch_target(addr, word))
    } else if is_bl(word) {
        Control::Call(branch_target(addr, word))
    } else if is_bc(word) {
        let target = bc_target(addr, word);
        if is_bcl(word) {
            Control::Call(target)
        } else if bo_always(bo(word)) {
            Control::Branch(target)
        } else {
            Control::ConditionalBranch(target)
        }
    } else if is_blr(word) {
        Control::Return
    } else if is_blrl(word) {
        Control::ReturnAndLink
    } else if is_conditional_return(word) {
        Control::ConditionalReturn
    } else if is_bctr(word) {
        Control::IndirectBranch
    } else if is_bctrl(word) {
        Control::IndirectCall
    } else if is_conditional_bcctr(word) {
        Control::ConditionalIndirect
    } else {
        Control::None
    }
}
