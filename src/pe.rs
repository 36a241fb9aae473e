//! The PE image embedded in a XEX container.
//!
//! A decoded XEX image is laid out by virtual address: every section sits at
//! its `virtual_address` offset. `PeImage::reconstruct` moves the sections back
//! to their raw file offsets, producing a conventional PE file, and keeps the
//! section table around for address translation.

use crate::decompress::MAX_IMAGE_SIZE;
use crate::raw;
use crate::utils::{find_subslice, ByteRegion, NoDebug};
use crate::Error;

use byteorder::{ByteOrder, ReadBytesExt, BE, LE};
use std::fmt;
use std::ops::Range;

/// `MZ`
const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0`
const PE_SIGNATURE: u32 = 0x00004550;
const PE32_MAGIC: u16 = 0x10B;
/// IMAGE_FILE_MACHINE_POWERPCBE
pub const MACHINE_POWERPC_BE: u16 = 0x1F2;

/// A PE image in raw file layout, together with its parsed section table.
#[derive(Debug)]
pub struct PeImage {
    data: NoDebug<Vec<u8>>,
    sections: Vec<SectionDescriptor>,
    image_base: u32,
    entry_point_rva: u32,
    machine: u16,
}

impl PeImage {
    /// Rebuilds the raw file layout from a flat, virtual-address-laid-out
    /// image.
    ///
    /// The headers up to the first section are copied verbatim. Then every
    /// section with initialized data is appended in table order, taking
    /// `size_of_raw_data` Bytes from its virtual address (missing Bytes are
    /// zero). A section must start exactly where the output ends, otherwise
    /// `Error::Layout` is returned. Uninitialized-data sections are skipped.
    ///
    /// Sections mapped past the end of the 32-bit address space, and output
    /// growing beyond `MAX_IMAGE_SIZE`, are rejected as `Error::Malformed`.
    pub fn reconstruct(flat: &[u8]) -> Result<Self, Error> {
        let headers = Headers::parse(flat)?;
        let first = headers.sections.first().ok_or_else(|| {
            Error::Malformed("PE image has no sections".to_string())
        })?;

        let mut out = Vec::with_capacity(flat.len());
        copy_zero_filled(&mut out, flat, 0, first.virtual_address)?;

        for section in &headers.sections {
            if section.is_bss() {
                trace!("skipping uninitialized section '{}'", section.name);
                continue;
            }

            let actual = out.len() as u32;
            if actual != section.raw_offset {
                return Err(Error::Layout {
                    section: section.name.clone(),
                    expected: section.raw_offset,
                    actual,
                });
            }

            debug!(
                "section '{}': {:#X} Bytes from VA offset {:#X} to raw offset {:#X}",
                section.name, section.raw_size, section.virtual_address, section.raw_offset
            );
            copy_zero_filled(&mut out, flat, section.virtual_address, section.raw_size)?;
        }

        info!(
            "reconstructed PE image: {} sections, {:#X} Bytes",
            headers.sections.len(),
            out.len()
        );

        Ok(Self {
            data: NoDebug(out),
            sections: headers.sections,
            image_base: headers.image_base,
            entry_point_rva: headers.entry_point_rva,
            machine: headers.machine,
        })
    }

    /// The raw PE file.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The section table, in table order.
    pub fn sections(&self) -> &[SectionDescriptor] {
        &self.sections
    }

    /// Returns an iterator over views of all sections.
    pub fn section_views(&self) -> Sections {
        Sections::new(self)
    }

    /// Looks up a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionDescriptor> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Returns a view of the section called `name`.
    pub fn section_view(&self, name: &str) -> Option<SectionView> {
        self.section(name).map(|s| SectionView::new(self, s))
    }

    /// Returns a view of the `.text` section.
    pub fn code_view(&self) -> Result<SectionView, Error> {
        self.section_view(".text")
            .ok_or_else(|| Error::Malformed("image has no .text section".to_string()))
    }

    /// Virtual address the image is linked at.
    pub fn image_base(&self) -> u32 {
        self.image_base
    }

    /// Entry point, relative to the image base.
    pub fn entry_point_rva(&self) -> u32 {
        self.entry_point_rva
    }

    /// Entry point as a virtual address.
    pub fn entry_point(&self) -> u32 {
        self.image_base.wrapping_add(self.entry_point_rva)
    }

    /// The COFF machine type.
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Translates a raw file offset to a virtual address.
    ///
    /// Returns `None` if the offset isn't inside the raw data of any section.
    pub fn offset_to_addr(&self, offset: u32) -> Option<u32> {
        let section = self
            .sections
            .iter()
            .filter(|s| !s.is_bss())
            .find(|s| s.raw_range().contains(&offset))?;
        let rva = section.virtual_address + (offset - section.raw_offset);
        self.image_base.checked_add(rva)
    }

    /// Translates a virtual address to a raw file offset.
    ///
    /// Returns `None` if the address isn't backed by raw data of a section.
    pub fn addr_to_offset(&self, addr: u32) -> Option<u32> {
        let rva = addr.checked_sub(self.image_base)?;
        let section = self
            .sections
            .iter()
            .filter(|s| !s.is_bss())
            .find(|s| rva >= s.virtual_address && rva - s.virtual_address < s.raw_size)?;
        section.raw_offset.checked_add(rva - section.virtual_address)
    }

    /// Reads a Big Endian word at a virtual address.
    pub fn read_u32_at(&self, addr: u32) -> Result<u32, Error> {
        let offset = self.addr_to_offset(addr).ok_or_else(|| {
            Error::Malformed(format!("address {:#08X} is not backed by section data", addr))
        })?;
        let end = offset
            .checked_add(4)
            .ok_or_else(|| Error::addr_overflow(offset, 4))?;
        Ok(BE::read_u32(self.data.region(offset..end, "word")?))
    }

    /// Scans the section headers for a section whose virtual address range
    /// contains the given address.
    ///
    /// Returns an `AddressInfo` object for debug printing the address, its
    /// containing section and its offset into the section.
    pub fn find_address_info(&self, addr: u32) -> AddressInfo {
        let section = addr.checked_sub(self.image_base).and_then(|rva| {
            self.sections
                .iter()
                .find(|s| s.virt_range().contains(&rva))
        });
        let offset = match section {
            Some(s) => addr - self.image_base - s.virtual_address,
            None => 0,
        };

        AddressInfo {
            section,
            image_base: self.image_base,
            offset,
            address: addr,
        }
    }
}

/// Appends `len` Bytes of `src` starting at `start`, padding with zeros where
/// `src` ends early.
///
/// The padding is bounded: the output may not grow past `MAX_IMAGE_SIZE`.
fn copy_zero_filled(out: &mut Vec<u8>, src: &[u8], start: u32, len: u32) -> Result<(), Error> {
    let new_len = (out.len() as u64) + u64::from(len);
    if new_len > u64::from(MAX_IMAGE_SIZE) {
        return Err(Error::Malformed(format!(
            "{:#X} Bytes at {:#X} would grow the PE image past {:#X} Bytes",
            len, start, MAX_IMAGE_SIZE
        )));
    }

    let start = start as usize;
    let len = len as usize;
    let available = src.len().saturating_sub(start).min(len);
    if let Some(data) = src.get(start..start + available) {
        out.extend_from_slice(data);
    }
    out.resize(out.len() + (len - available), 0);
    Ok(())
}

/// The parts of the PE headers needed to locate the sections.
struct Headers {
    machine: u16,
    image_base: u32,
    entry_point_rva: u32,
    sections: Vec<SectionDescriptor>,
}

impl Headers {
    fn parse(image: &[u8]) -> Result<Self, Error> {
        let dos = raw::DosHeader::parse(&mut &*image)?;
        if dos.magic != DOS_MAGIC {
            return Err(Error::Malformed(format!(
                "invalid DOS magic (got {:#X}, expected {:#X})",
                dos.magic, DOS_MAGIC
            )));
        }

        let mut data = image.region_from(dos.lfanew, "PE signature")?;
        let signature = data.read_u32::<LE>()?;
        if signature != PE_SIGNATURE {
            return Err(Error::Malformed(format!(
                "invalid PE signature {:#X} at {:#X}",
                signature, dos.lfanew
            )));
        }

        let coff = raw::CoffHeader::parse(&mut data)?;
        if coff.machine != MACHINE_POWERPC_BE {
            warn!(
                "unexpected machine type {:#X} (expected {:#X})",
                coff.machine, MACHINE_POWERPC_BE
            );
        }

        if u32::from(coff.size_of_optional_header) < raw::OptionalHeader32::SIZE {
            return Err(Error::Malformed(format!(
                "optional header too small ({:#X} Bytes)",
                coff.size_of_optional_header
            )));
        }
        let opt = raw::OptionalHeader32::parse(&mut &*data)?;
        if opt.magic != PE32_MAGIC {
            return Err(Error::Unsupported(format!(
                "optional header magic {:#X}",
                opt.magic
            )));
        }

        let table = dos
            .lfanew
            .checked_add(4 + raw::CoffHeader::SIZE + u32::from(coff.size_of_optional_header))
            .ok_or_else(|| Error::addr_overflow(dos.lfanew, 4 + raw::CoffHeader::SIZE))?;
        let mut data = image.region_from(table, "section table")?;

        debug!(
            "PE: machine {:#X}, image base {:#08X}, entry {:#X}, {} sections at {:#X}",
            coff.machine, opt.image_base, opt.address_of_entry_point, coff.number_of_sections, table
        );

        let sections = (0..coff.number_of_sections)
            .map(|_| {
                SectionDescriptor::from_raw(&raw::SectionHeader::parse(&mut data)?, opt.image_base)
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            machine: coff.machine,
            image_base: opt.image_base,
            entry_point_rva: opt.address_of_entry_point,
            sections,
        })
    }
}

/// An entry of the PE section table.
#[derive(Debug, Clone)]
pub struct SectionDescriptor {
    name: String,
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_offset: u32,
    flags: SectionFlags,
}

impl SectionDescriptor {
    /// Checks that the section fits into the address space when the image is
    /// loaded at `image_base`, so section addresses can be computed without
    /// overflow later.
    fn from_raw(raw: &raw::SectionHeader, image_base: u32) -> Result<Self, Error> {
        let size = raw.virtual_size.max(raw.size_of_raw_data);
        image_base
            .checked_add(raw.virtual_address)
            .and_then(|start| start.checked_add(size))
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "section at RVA {:#X} ({:#X} Bytes) doesn't fit above image base {:#08X}",
                    raw.virtual_address, size, image_base
                ))
            })?;
        raw.pointer_to_raw_data
            .checked_add(raw.size_of_raw_data)
            .ok_or_else(|| Error::addr_overflow(raw.pointer_to_raw_data, raw.size_of_raw_data))?;

        let name = {
            let bytes = raw.name.split(|b| *b == 0).next().unwrap_or(&[]);
            String::from_utf8_lossy(bytes).into_owned()
        };

        Ok(Self {
            flags: {
                let flags = SectionFlags::from_bits_truncate(raw.characteristics);
                if flags.bits() != raw.characteristics {
                    warn!(
                        "unknown section flags in '{}': known flags: {:#X}, raw flags: {:#X}",
                        name,
                        flags.bits(),
                        raw.characteristics
                    );
                }
                flags
            },
            name,
            virtual_address: raw.virtual_address,
            virtual_size: raw.virtual_size,
            raw_size: raw.size_of_raw_data,
            raw_offset: raw.pointer_to_raw_data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the section, relative to the image base.
    pub fn virtual_address(&self) -> u32 {
        self.virtual_address
    }

    pub fn virtual_size(&self) -> u32 {
        self.virtual_size
    }

    /// Size of the section's data in the raw file.
    pub fn raw_size(&self) -> u32 {
        self.raw_size
    }

    /// File offset of the section's data in the raw file.
    pub fn raw_offset(&self) -> u32 {
        self.raw_offset
    }

    pub fn flags(&self) -> &SectionFlags {
        &self.flags
    }

    /// Whether this section holds only uninitialized data.
    pub fn is_bss(&self) -> bool {
        self.flags.contains(SectionFlags::CNT_UNINITIALIZED_DATA)
    }

    /// Size of the section in memory.
    ///
    /// Uses the raw size if no virtual size is given.
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.raw_size
        } else {
            self.virtual_size
        }
    }

    /// The range of image-relative addresses this section is mapped to.
    pub fn virt_range(&self) -> Range<u32> {
        self.virtual_address..self.virtual_address + self.mapped_size()
    }

    /// The range of file offsets holding the section's data.
    pub fn raw_range(&self) -> Range<u32> {
        self.raw_offset..self.raw_offset + self.raw_size
    }
}

bitflags! {
    /// PE section characteristics.
    pub struct SectionFlags: u32 {
        const TYPE_NO_PAD            = 0x00000008;
        const CNT_CODE               = 0x00000020;
        const CNT_INITIALIZED_DATA   = 0x00000040;
        const CNT_UNINITIALIZED_DATA = 0x00000080;
        const LNK_INFO               = 0x00000200;
        const LNK_REMOVE             = 0x00000800;
        const LNK_COMDAT             = 0x00001000;
        const GPREL                  = 0x00008000;
        /// 4-bit alignment value.
        const ALIGN_MASK             = 0x00F00000;
        const LNK_NRELOC_OVFL        = 0x01000000;
        const MEM_DISCARDABLE        = 0x02000000;
        const MEM_NOT_CACHED         = 0x04000000;
        const MEM_NOT_PAGED          = 0x08000000;
        const MEM_SHARED             = 0x10000000;
        const MEM_EXECUTE            = 0x20000000;
        const MEM_READ               = 0x40000000;
        const MEM_WRITE              = 0x80000000;
    }
}

/// Iterator over views of the sections in a `PeImage`.
#[derive(Debug)]
pub struct Sections<'a> {
    image: &'a PeImage,
    headers: std::slice::Iter<'a, SectionDescriptor>,
}

impl<'a> Sections<'a> {
    fn new(image: &'a PeImage) -> Self {
        Self {
            image,
            headers: image.sections.iter(),
        }
    }
}

impl<'a> Iterator for Sections<'a> {
    type Item = SectionView<'a>;

    fn next(&mut self) -> Option<SectionView<'a>> {
        let header = self.headers.next()?;
        Some(SectionView::new(self.image, header))
    }
}

/// A section of a `PeImage`, addressed by virtual address.
#[derive(Debug, Clone)]
pub struct SectionView<'a> {
    header: &'a SectionDescriptor,
    /// Virtual address of the first Byte.
    base: u32,
    /// Size of the mapped range.
    len: u32,
    /// The section's raw data. May be shorter than `len`.
    data: NoDebug<&'a [u8]>,
}

impl<'a> SectionView<'a> {
    fn new(image: &'a PeImage, header: &'a SectionDescriptor) -> Self {
        let data: &'a [u8] = if header.is_bss() {
            &[]
        } else {
            let raw = image.data.as_slice();
            let start = (header.raw_offset as usize).min(raw.len());
            let end = (header.raw_offset as usize + header.raw_size as usize).min(raw.len());
            raw.get(start..end).unwrap_or(&[])
        };
        Self {
            header,
            // can't overflow, checked by `SectionDescriptor::from_raw`
            base: image.image_base + header.virtual_address,
            len: header.mapped_size(),
            data: NoDebug(data),
        }
    }

    pub fn header(&self) -> &'a SectionDescriptor {
        self.header
    }

    pub fn name(&self) -> &'a str {
        &self.header.name
    }

    /// Virtual address of the section start.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Size of the section in memory.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last mapped virtual address.
    pub fn end(&self) -> u32 {
        self.base.saturating_add(self.len)
    }

    /// The section's raw data.
    pub fn data(&self) -> &'a [u8] {
        *self.data
    }

    /// Whether `addr` lies inside the mapped range.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Reads the Big Endian word at `addr`.
    ///
    /// Returns `None` if the word isn't fully backed by raw data.
    pub fn word_at(&self, addr: u32) -> Option<u32> {
        let offset = addr.checked_sub(self.base)? as usize;
        let bytes = self.data.get(offset..offset.checked_add(4)?)?;
        Some(BE::read_u32(bytes))
    }

    /// Returns the virtual address of the first occurrence of `pattern`.
    pub fn find(&self, pattern: &[u8]) -> Option<u32> {
        let data: &'a [u8] = *self.data;
        let offset = find_subslice(data, pattern)?;
        Some(self.base + offset as u32)
    }

    /// Iterates over `(address, word)` pairs of the raw data.
    pub fn words(&self) -> impl Iterator<Item = (u32, u32)> + 'a {
        let base = self.base;
        let data: &'a [u8] = *self.data;
        data.chunks_exact(4)
            .enumerate()
            .map(move |(i, chunk)| (base + i as u32 * 4, BE::read_u32(chunk)))
    }
}

/// Info for a virtual address in the image's memory map.
///
/// This is suitable for user display, but probably most useful as a debug
/// helper since the `Display` output is very technical.
#[derive(Debug)]
pub struct AddressInfo<'a> {
    /// Section `address` is located in (if any).
    section: Option<&'a SectionDescriptor>,
    image_base: u32,
    /// Offset from start of section. 0 if not in a section.
    offset: u32,
    /// Virtual address to look up.
    address: u32,
}

impl<'a> AddressInfo<'a> {
    /// The virtual address for which this information was determined.
    pub fn virt_addr(&self) -> u32 {
        self.address
    }

    /// Returns the offset of `virt_addr` into its containing section.
    ///
    /// Returns `None` if `virt_addr` is not inside any section.
    pub fn offset(&self) -> Option<u32> {
        self.section.map(|_| self.offset)
    }

    /// Returns the section containing the virtual address.
    pub fn section(&self) -> Option<&'a SectionDescriptor> {
        self.section
    }
}

impl<'a> fmt::Display for AddressInfo<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(section) = self.section {
            let virt = section.virt_range();
            let raw = section.raw_range();
            write!(f,
                   "address {:#08X} is {:#X} Bytes into section '{}' spanning virtual addresses {:#08X}..{:#08X} and raw offsets {:#08X}..{:#08X}",
                   self.address, self.offset, section.name(),
                   self.image_base.wrapping_add(virt.start), self.image_base.wrapping_add(virt.end),
                   raw.start, raw.end
            )
        } else {
            write!(f,
                   "address {:#08X} is not inside any section of the image",
                   self.address
            )
        }
    }
}
