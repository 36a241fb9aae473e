//! Locates compiler intrinsics and platform stubs in the code section.
//!
//! The compiler emits the register save and restore routines as one block
//! per register class, every entry point of which is a function of its own
//! (`__savegprlr_14` saves r14..r31, `__savegprlr_15` r15..r31, and so on).
//! They are found by searching for the first four save instructions of each
//! block. Their extent is fixed, so they are registered as exact functions.

use crate::function::{Function, FunctionRegistry, FunctionSource, IntrinsicKind, IntrinsicRanges};
use crate::pe::{PeImage, SectionView};
use crate::Error;

use std::ops::Range;

/// `std r14, -0x98(r1)` .. `std r17, -0x80(r1)`
const GPR_SAVE_SIGNATURE: [u32; 4] = [0xF9C1FF68, 0xF9E1FF70, 0xFA01FF78, 0xFA21FF80];
/// `stfd f14, -0x90(r12)` .. `stfd f17, -0x78(r12)`
const FPR_SAVE_SIGNATURE: [u32; 4] = [0xD9CCFF70, 0xD9ECFF78, 0xDA0CFF80, 0xDA2CFF88];
/// `li r11, -0x120; stvx v14, r11, r12` .. `li r11, -0xF0; stvx v17, r11, r12`
const VMX_SAVE_SIGNATURE: [u32; 8] = [
    0x3960FEE0, 0x7DCB61CE, 0x3960FEF0, 0x7DEB61CE, 0x3960FF00, 0x7E0B61CE, 0x3960FF10, 0x7E2B61CE,
];

/// Import stubs that are linked into `.text` of release builds.
const PLATFORM_STUBS: &[(&str, [u32; 4])] = &[
    ("XamInputGetCapabilities", [0x01000190, 0x02000190, 0x7D6903A6, 0x4E800420]),
    ("XamInputGetState", [0x01000191, 0x02000191, 0x7D6903A6, 0x4E800420]),
    ("XamInputSetState", [0x01000192, 0x02000192, 0x7D6903A6, 0x4E800420]),
];

/// Offset from `__savegprlr_N` to `__restgprlr_N`.
const GPR_RESTORE_OFFSET: u32 = 0x50;
/// Offset from `__savefpr_N` to `__restfpr_N`.
const FPR_RESTORE_OFFSET: u32 = 0x4C;

/// Size of each save/restore block, from its signature to its last `blr`.
const GPR_BLOCK_SIZE: u32 = 0xA4;
const FPR_BLOCK_SIZE: u32 = 0x98;
const VMX_BLOCK_SIZE: u32 = 0x530;

fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes().to_vec()).collect()
}

/// Finds all intrinsics in `.text`, registers them and returns their spans.
///
/// Fails with `Error::MissingIntrinsic` if one of the three register save
/// blocks is not present.
pub fn scan(image: &PeImage, registry: &mut FunctionRegistry) -> Result<IntrinsicRanges, Error> {
    let text = image.code_view()?;
    let mut ranges = IntrinsicRanges::new();
    let mut found = Vec::new();

    let gpr = locate(&text, &GPR_SAVE_SIGNATURE, GPR_BLOCK_SIZE, "__savegprlr_14")?;
    ranges.record(IntrinsicKind::Gpr, "__savegprlr", gpr_functions(gpr, &mut found));

    let fpr = locate(&text, &FPR_SAVE_SIGNATURE, FPR_BLOCK_SIZE, "__savefpr_14")?;
    ranges.record(IntrinsicKind::Fpr, "__savefpr", fpr_functions(fpr, &mut found));

    let vmx = locate(&text, &VMX_SAVE_SIGNATURE, VMX_BLOCK_SIZE, "__savevmx_14")?;
    ranges.record(IntrinsicKind::Vmx, "__savevmx", vmx_functions(vmx, &mut found));

    for &(name, ref signature) in PLATFORM_STUBS {
        match text.find(&to_bytes(signature)) {
            Some(addr) => {
                let end = addr + 16;
                debug!("{} stub at {:08X}", name, addr);
                found.push((name.to_string(), addr, end, IntrinsicKind::PlatformApi));
                ranges.record(IntrinsicKind::PlatformApi, name, addr..end);
            }
            None => trace!("{} stub not present", name),
        }
    }

    let mut registered = 0;
    for (name, start, end, kind) in found {
        let function = Function::new(start, end, FunctionSource::Intrinsic(kind)).with_name(name);
        if registry.insert(function).is_some() {
            registered += 1;
        }
    }

    info!(
        "intrinsics: gpr {}, fpr {}, vmx {}, {} platform stubs, {} functions",
        fmt_range(ranges.gpr()),
        fmt_range(ranges.fpr()),
        fmt_range(ranges.vmx()),
        ranges.stubs().len(),
        registered
    );

    Ok(ranges)
}

fn fmt_range(range: Option<&Range<u32>>) -> String {
    match range {
        Some(r) => format!("{:08X}..{:08X}", r.start, r.end),
        None => "-".to_string(),
    }
}

/// Finds the block starting with `signature`, which must fit into `.text`.
fn locate(text: &SectionView, signature: &[u32], size: u32, name: &'static str) -> Result<u32, Error> {
    let addr = text
        .find(&to_bytes(signature))
        .ok_or(Error::MissingIntrinsic(name))?;
    match addr.checked_add(size) {
        Some(end) if end <= text.end() => {}
        _ => {
            return Err(Error::Malformed(format!(
                "{} block at {:08X} is cut off by the end of .text ({:08X})",
                name,
                addr,
                text.end()
            )))
        }
    }
    debug!("{} at {:08X}", name, addr);
    Ok(addr)
}

type Found = Vec<(String, u32, u32, IntrinsicKind)>;

/// `__savegprlr_N` are single `std`s falling through into each other, the
/// last one also saves LR and returns. The restore routines start 0x50 Bytes
/// later and additionally reload LR.
fn gpr_functions(base: u32, found: &mut Found) -> Range<u32> {
    let mut end = base;
    for (i, reg) in (14..=31).enumerate() {
        let save = base + 4 * i as u32;
        let restore = save + GPR_RESTORE_OFFSET;
        let (save_len, restore_len) = if reg == 31 { (12, 16) } else { (4, 4) };
        found.push((format!("__savegprlr_{}", reg), save, save + save_len, IntrinsicKind::Gpr));
        found.push((format!("__restgprlr_{}", reg), restore, restore + restore_len, IntrinsicKind::Gpr));
        end = restore + restore_len;
    }
    base..end
}

fn fpr_functions(base: u32, found: &mut Found) -> Range<u32> {
    let mut end = base;
    for (i, reg) in (14..=31).enumerate() {
        let save = base + 4 * i as u32;
        let restore = save + FPR_RESTORE_OFFSET;
        let len = if reg == 31 { 8 } else { 4 };
        found.push((format!("__savefpr_{}", reg), save, save + len, IntrinsicKind::Fpr));
        found.push((format!("__restfpr_{}", reg), restore, restore + len, IntrinsicKind::Fpr));
        end = restore + len;
    }
    base..end
}

/// Each VMX routine is an `li`/`stvx` (or `lvx`) pair. The block holds four
/// groups, save v14..v31, save v64..v127, restore v14..v31 and restore
/// v64..v127, each closed by a `blr` after its last entry.
fn vmx_functions(base: u32, found: &mut Found) -> Range<u32> {
    let groups: [(&str, Range<u32>); 4] = [
        ("__savevmx", 14..32),
        ("__savevmx", 64..128),
        ("__restvmx", 14..32),
        ("__restvmx", 64..128),
    ];

    let mut addr = base;
    let mut end = base;
    for (prefix, regs) in groups.iter() {
        let last = regs.end - 1;
        for reg in regs.clone() {
            let len = if reg == last { 12 } else { 8 };
            found.push((format!("{}_{}", prefix, reg), addr, addr + len, IntrinsicKind::Vmx));
            end = addr + len;
            addr += 8;
        }
        // skip the `blr`
        addr += 4;
    }
    base..end
}
