//! The `.pdata` exception table.
//!
//! Every function with an exception handler or a non-trivial prologue gets an
//! 8-Byte entry: its start address, followed by a packed word holding the
//! prologue length, the function length (both in instructions) and two flags.
//! Functions listed here have an authoritative extent.

use crate::analysis::Diagnostic;
use crate::function::{Function, FunctionRegistry, FunctionSource, IntrinsicRanges};
use crate::pe::PeImage;
use crate::raw;
use crate::Error;

/// An entry of the exception table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionEntry {
    begin: u32,
    data: u32,
}

impl ExceptionEntry {
    pub fn new(begin: u32, data: u32) -> Self {
        Self { begin, data }
    }

    /// Address of the function's first instruction.
    pub fn begin(&self) -> u32 {
        self.begin
    }

    /// Number of prologue instructions.
    pub fn prologue_count(&self) -> u32 {
        self.data & 0xFF
    }

    /// Number of instructions of the function.
    pub fn instruction_count(&self) -> u32 {
        (self.data >> 8) & 0x3FFFFF
    }

    /// One past the function's last instruction.
    pub fn end(&self) -> u32 {
        self.begin.wrapping_add(self.instruction_count() * 4)
    }

    pub fn is_32bit(&self) -> bool {
        self.data & (1 << 30) != 0
    }

    pub fn has_exception_handler(&self) -> bool {
        self.data & (1 << 31) != 0
    }
}

/// Reads the exception table from the `.pdata` section.
///
/// Entries are read until one with a start address of 0, or until the
/// section data ends. Images without `.pdata` have an empty table.
pub fn read(image: &PeImage) -> Result<Vec<ExceptionEntry>, Error> {
    let section = match image.section_view(".pdata") {
        Some(section) => section,
        None => {
            debug!("no .pdata section");
            return Ok(Vec::new());
        }
    };

    let mut data = section.data();
    let mut entries = Vec::new();
    while data.len() >= raw::PdataEntry::SIZE as usize {
        let entry = raw::PdataEntry::parse(&mut data)?;
        if entry.begin == 0 {
            break;
        }
        entries.push(ExceptionEntry::new(entry.begin, entry.data));
    }

    info!("exception table: {} entries", entries.len());
    Ok(entries)
}

/// Registers the functions described by the exception table.
///
/// Entries starting inside an intrinsic, or reaching past the end of the
/// address space, are ignored. A function already
/// found by a heuristic is upgraded to the table's extent, and reported if
/// its end disagrees.
pub fn register(
    entries: &[ExceptionEntry],
    registry: &mut FunctionRegistry,
    intrinsics: &IntrinsicRanges,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let mut added = 0;
    let mut upgraded = 0;

    for entry in entries {
        let (start, end) = match entry.begin().checked_add(entry.instruction_count() * 4) {
            Some(end) => (entry.begin(), end),
            None => {
                warn!("exception table entry at {:08X} wraps around the address space", entry.begin());
                continue;
            }
        };
        if intrinsics.contains(start) {
            trace!("ignoring exception table entry for intrinsic at {:08X}", start);
            continue;
        }

        match registry.find_by_start(start) {
            Some(id) => {
                let function = registry.get_mut(id);
                if function.is_exact() {
                    warn!("duplicate exception table entry for {:08X}", start);
                    continue;
                }
                if function.end() != end {
                    let diagnostic = Diagnostic::ExtentMismatch {
                        start,
                        table_end: end,
                        heuristic_end: function.end(),
                    };
                    warn!("{}", diagnostic);
                    diagnostics.push(diagnostic);
                }
                function.mark_exception_table(end, entry.has_exception_handler());
                upgraded += 1;
            }
            None => {
                let mut function = Function::new(start, end, FunctionSource::ExceptionTable);
                function.set_exception_handler(entry.has_exception_handler());
                registry.insert(function);
                added += 1;
            }
        }
    }

    info!("exception table: {} functions added, {} upgraded", added, upgraded);
}
