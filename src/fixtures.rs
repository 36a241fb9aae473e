//! Synthetic PE images and PowerPC code for the unit tests.

use crate::pe::{PeImage, SectionFlags, MACHINE_POWERPC_BE};

pub const IMAGE_BASE: u32 = 0x82000000;
pub const TEXT_RVA: u32 = 0x1000;
pub const TEXT_BASE: u32 = IMAGE_BASE + TEXT_RVA;
/// Offsets of the register save blocks in `.text` built by `text_builder`.
pub const FPR_OFFSET: u32 = 0xB0;
pub const VMX_OFFSET: u32 = 0x150;
pub const INTRINSICS_SIZE: u32 = 0x680;
/// First address after the intrinsics, where test code is placed.
pub const CODE_BASE: u32 = TEXT_BASE + INTRINSICS_SIZE;
/// A branch target outside of `.text`.
pub const FOREIGN: u32 = 0x82100000;

pub const NOP: u32 = 0x60000000;
pub const BLR: u32 = 0x4E800020;
pub const BLRL: u32 = 0x4E800021;
pub const BCTR: u32 = 0x4E800420;
pub const BCTRL: u32 = 0x4E800421;
pub const BEQLR: u32 = 0x4D820020;
pub const BEQCTR: u32 = 0x4D820420;
pub const MFLR_R12: u32 = 0x7D8802A6;
pub const MTCTR_R12: u32 = 0x7D8903A6;
/// `lwzx r0, r3, r4`
pub const LWZX: u32 = 0x7C03202E;
/// `li r3, 0`
pub const LI_R3_0: u32 = 0x38600000;

/// Address of the `i`th instruction of the test code.
pub fn at(i: usize) -> u32 {
    CODE_BASE + 4 * i as u32
}

pub fn b(from: u32, to: u32) -> u32 {
    0x48000000 | (to.wrapping_sub(from) & 0x03FFFFFC)
}

pub fn bl(from: u32, to: u32) -> u32 {
    b(from, to) | 1
}

pub fn bc(bo: u32, bi: u32, from: u32, to: u32) -> u32 {
    0x40000000 | bo << 21 | bi << 16 | (to.wrapping_sub(from) & 0xFFFC)
}

pub fn beq(from: u32, to: u32) -> u32 {
    bc(12, 2, from, to)
}

pub fn bne(from: u32, to: u32) -> u32 {
    bc(4, 2, from, to)
}

/// `cmplwi r11, n`
pub fn cmplwi(n: u16) -> u32 {
    0x280B0000 | u32::from(n)
}

/// Packs an exception table entry's data word.
pub fn pdata_word(prologue: u32, count: u32, handler: bool) -> u32 {
    let handler = if handler { 1 << 31 } else { 0 };
    prologue & 0xFF | (count & 0x3FFFFF) << 8 | 1 << 30 | handler
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes().to_vec()).collect()
}

/// `INTRINSICS_SIZE` Bytes holding the GPR, FPR and VMX save/restore blocks.
pub fn intrinsic_words() -> Vec<u32> {
    let mut words = Vec::new();
    let ds = |base: i32, reg: u32| (base + 8 * (reg as i32 - 14)) as u16 as u32;

    // std rN, x(r1) ... stw r12, -8(r1); blr
    words.extend((14..32).map(|r| 0xF8010000 | r << 21 | ds(-0x98, r)));
    words.extend(&[0x9181FFF8, BLR]);
    // ld rN, x(r1) ... lwz r12, -8(r1); mtlr r12; blr
    words.extend((14..32).map(|r| 0xE8010000 | r << 21 | ds(-0x98, r)));
    words.extend(&[0x8181FFF8, 0x7D8803A6, BLR]);
    words.resize((FPR_OFFSET / 4) as usize, 0);

    // stfd fN, x(r12) ... blr, lfd fN, x(r12) ... blr
    words.extend((14..32).map(|r| 0xD80C0000 | r << 21 | ds(-0x90, r)));
    words.push(BLR);
    words.extend((14..32).map(|r| 0xC80C0000 | r << 21 | ds(-0x90, r)));
    words.push(BLR);
    words.resize((VMX_OFFSET / 4) as usize, 0);

    // li r11, x; stvx/lvx vN, r11, r12 for each register, each group closed by blr
    let groups: [(u32, std::ops::Range<u32>); 4] = [
        (0x7C0B61CE, 14..32),
        (0x7C0B61CE, 64..128),
        (0x7C0B60CE, 14..32),
        (0x7C0B60CE, 64..128),
    ];
    for (op, regs) in groups.iter() {
        for reg in regs.clone() {
            let offset = (-0x120 + 0x10 * (reg as i32 - regs.start as i32)) as u16 as u32;
            words.push(0x39600000 | offset);
            words.push(op | (reg & 0x1F) << 21);
        }
        words.push(BLR);
    }

    assert_eq!(words.len() * 4, INTRINSICS_SIZE as usize);
    words
}

/// Returns a builder for an image whose `.text` starts with the intrinsics.
pub fn text_builder() -> TextBuilder {
    TextBuilder {
        text: intrinsic_words(),
        pdata: Vec::new(),
        entry: 0,
    }
}

/// An image with the intrinsics followed by `code` at `CODE_BASE`.
pub fn image_with_code(code: &[u32]) -> PeImage {
    text_builder().code(code).build()
}

/// Builds images with a `.text` section and an optional `.pdata` section.
#[derive(Debug, Clone)]
pub struct TextBuilder {
    text: Vec<u32>,
    pdata: Vec<(u32, u32)>,
    entry: u32,
}

impl TextBuilder {
    /// Appends instructions to `.text`.
    pub fn code(&mut self, code: &[u32]) -> &mut Self {
        self.text.extend_from_slice(code);
        self
    }

    /// Adds exception table entries.
    pub fn pdata(&mut self, entries: &[(u32, u32)]) -> &mut Self {
        self.pdata.extend_from_slice(entries);
        self
    }

    /// Sets the entry point VA.
    pub fn entry(&mut self, addr: u32) -> &mut Self {
        self.entry = addr;
        self
    }

    /// Zeroes the first four words of an intrinsic block, destroying its
    /// signature.
    pub fn clear_intrinsic(&mut self, offset: u32) -> &mut Self {
        let start = (offset / 4) as usize;
        for word in &mut self.text[start..start + 4] {
            *word = 0;
        }
        self
    }

    pub fn build_flat(&self) -> Vec<u8> {
        let text = words_to_bytes(&self.text);
        let mut builder = PeBuilder::new()
            .entry(self.entry.wrapping_sub(IMAGE_BASE))
            .section(
                ".text",
                TEXT_RVA,
                &text,
                SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
            );
        if !self.pdata.is_empty() {
            let mut words = Vec::new();
            for &(begin, data) in &self.pdata {
                words.push(begin);
                words.push(data);
            }
            words.extend(&[0, 0]);
            let rva = (TEXT_RVA + text.len() as u32 + 0xFFF) & !0xFFF;
            builder = builder.section(
                ".pdata",
                rva,
                &words_to_bytes(&words),
                SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ,
            );
        }
        builder.build_flat()
    }

    pub fn build(&self) -> PeImage {
        PeImage::reconstruct(&self.build_flat()).unwrap()
    }
}

struct SectionSpec {
    name: String,
    virtual_address: u32,
    virtual_size: u32,
    data: Vec<u8>,
    flags: SectionFlags,
}

/// Assembles a flat (virtual address laid out) PE image.
///
/// The DOS header points to the PE signature at 0x80, the COFF header
/// follows at 0x84, the optional header at 0x98 and the section table at
/// 0x178.
pub struct PeBuilder {
    image_base: u32,
    entry_rva: u32,
    headers_size: u32,
    sections: Vec<SectionSpec>,
    raw_offsets: Option<Vec<u32>>,
}

const LFANEW: usize = 0x80;
const OPTIONAL_HEADER_SIZE: usize = 0xE0;

impl PeBuilder {
    pub fn new() -> Self {
        Self {
            image_base: IMAGE_BASE,
            entry_rva: 0,
            headers_size: 0x1000,
            sections: Vec::new(),
            raw_offsets: None,
        }
    }

    pub fn entry(mut self, rva: u32) -> Self {
        self.entry_rva = rva;
        self
    }

    pub fn image_base(mut self, base: u32) -> Self {
        self.image_base = base;
        self
    }

    pub fn section(mut self, name: &str, virtual_address: u32, data: &[u8], flags: SectionFlags) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            virtual_address,
            virtual_size: data.len() as u32,
            data: data.to_vec(),
            flags,
        });
        self
    }

    pub fn bss(mut self, name: &str, virtual_address: u32, size: u32) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            virtual_address,
            virtual_size: size,
            data: Vec::new(),
            flags: SectionFlags::CNT_UNINITIALIZED_DATA | SectionFlags::MEM_READ | SectionFlags::MEM_WRITE,
        });
        self
    }

    /// Overrides the raw offset of every section, in table order.
    pub fn raw_offsets(mut self, offsets: &[u32]) -> Self {
        self.raw_offsets = Some(offsets.to_vec());
        self
    }

    fn raw_layout(&self) -> Vec<u32> {
        if let Some(offsets) = &self.raw_offsets {
            return offsets.clone();
        }
        let mut next = self.headers_size;
        self.sections
            .iter()
            .map(|s| {
                if s.data.is_empty() {
                    0
                } else {
                    let offset = next;
                    next += s.data.len() as u32;
                    offset
                }
            })
            .collect()
    }

    pub fn build_flat(&self) -> Vec<u8> {
        let table = LFANEW + 24 + OPTIONAL_HEADER_SIZE;
        let len = self
            .sections
            .iter()
            .map(|s| s.virtual_address as usize + s.data.len())
            .chain(Some(self.headers_size as usize))
            .chain(Some(table + 40 * self.sections.len()))
            .max()
            .unwrap();
        let mut flat = vec![0; len];

        let put16 = |flat: &mut Vec<u8>, at: usize, v: u16| flat[at..at + 2].copy_from_slice(&v.to_le_bytes());
        let put32 = |flat: &mut Vec<u8>, at: usize, v: u32| flat[at..at + 4].copy_from_slice(&v.to_le_bytes());

        put16(&mut flat, 0, 0x5A4D);
        put32(&mut flat, 0x3C, LFANEW as u32);
        flat[LFANEW..LFANEW + 4].copy_from_slice(b"PE\0\0");

        let coff = LFANEW + 4;
        put16(&mut flat, coff, MACHINE_POWERPC_BE);
        put16(&mut flat, coff + 2, self.sections.len() as u16);
        put16(&mut flat, coff + 16, OPTIONAL_HEADER_SIZE as u16);
        put16(&mut flat, coff + 18, 0x0102);

        let opt = coff + 20;
        put16(&mut flat, opt, 0x10B);
        put32(&mut flat, opt + 16, self.entry_rva);
        put32(&mut flat, opt + 28, self.image_base);
        put32(&mut flat, opt + 32, 0x1000);
        put32(&mut flat, opt + 36, 0x200);

        for ((i, section), raw_offset) in self.sections.iter().enumerate().zip(self.raw_layout()) {
            let entry = table + 40 * i;
            let name = section.name.as_bytes();
            flat[entry..entry + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            put32(&mut flat, entry + 8, section.virtual_size);
            put32(&mut flat, entry + 12, section.virtual_address);
            put32(&mut flat, entry + 16, section.data.len() as u32);
            put32(&mut flat, entry + 20, raw_offset);
            put32(&mut flat, entry + 36, section.flags.bits());

            let va = section.virtual_address as usize;
            flat[va..va + section.data.len()].copy_from_slice(&section.data);
        }

        flat
    }

    pub fn build(&self) -> PeImage {
        PeImage::reconstruct(&self.build_flat()).unwrap()
    }
}
