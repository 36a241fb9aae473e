//! Raw structures that can be deserialized from binary data.
//!
//! Generally, the structures in here have a very loose structure in that they
//! don't try to verify their values if not necessary. They also store most
//! things as raw values instead of more convenient types. That's left to do for
//! the user-facing wrappers.
//!
//! This module also serves to document the basic memory layout of the XEX and
//! PE structures: All struct fields are parsed in-order and are deserialized
//! using `bincode` (no padding is used anywhere and the layout is mostly
//! "obvious").
//!
//! XEX container structures and exception table entries are Big Endian, the
//! embedded PE headers are Little Endian.

use crate::Error;

use bincode::Options;
use serde::de::{self, DeserializeOwned};

use std::fmt;
use std::marker::PhantomData;

/// Deserializes a fixed-layout Big Endian structure and advances `data`.
fn parse_be<T: DeserializeOwned>(data: &mut &[u8]) -> Result<T, Error> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .deserialize_from(data)
        .map_err(|e| Error::Malformed(format!("{:?}", e)))
}

/// Deserializes a fixed-layout Little Endian structure and advances `data`.
fn parse_le<T: DeserializeOwned>(data: &mut &[u8]) -> Result<T, Error> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .deserialize_from(data)
        .map_err(|e| Error::Malformed(format!("{:?}", e)))
}

/// Fixed part of the XEX header, at the very start of the file.
#[derive(Debug, Deserialize)]
pub struct XexHeader {
    /// Magic number, must be equal to the constant `MAGIC_NUMBER`.
    pub magic: u32,
    /// See `ModuleFlags`.
    pub module_flags: u32,
    /// File offset of the (possibly encrypted and compressed) PE image.
    pub pe_data_offset: u32,
    pub reserved: u32,
    /// File offset of the `SecurityInfo` structure.
    pub security_offset: u32,
    /// Number of `OptionalHeaderEntry` records directly following this header.
    pub optional_header_count: u32,
}

impl XexHeader {
    /// Size of the structure in Bytes.
    pub const SIZE: u32 = 24;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// An `(id, value)` pair in the optional header table.
///
/// The low byte of `id` determines how `value` is interpreted, see
/// `header::OptionalHeader`.
#[derive(Debug, Deserialize)]
pub struct OptionalHeaderEntry {
    pub id: u32,
    pub value: u32,
}

impl OptionalHeaderEntry {
    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// Security (loader) info, located at `XexHeader::security_offset`.
///
/// Followed directly by a `u32` count and that many `PageDescriptor`s.
#[derive(Debug, Deserialize)]
pub struct SecurityInfo {
    pub header_size: u32,
    /// Size of the decompressed image in Bytes.
    pub image_size: u32,
    /// RSA signature over the header. Never verified.
    pub signature: Signature,
    pub unknown: u32,
    /// See `ImageFlags`.
    pub image_flags: u32,
    /// Virtual address the image is loaded to.
    pub load_address: u32,
    pub section_digest: [u8; 20],
    pub import_table_count: u32,
    pub import_table_digest: [u8; 20],
    pub media_id: [u8; 16],
    /// The session key, encrypted with the console-class key.
    pub file_key: [u8; 16],
    pub export_table: u32,
    pub header_digest: [u8; 20],
    /// See `GameRegions`.
    pub game_regions: u32,
    /// See `MediaFlags`.
    pub allowed_media: u32,
}

impl SecurityInfo {
    /// Size of the structure in Bytes.
    pub const SIZE: u32 = 0x180;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// Entry of the page-descriptor table following `SecurityInfo`.
#[derive(Debug, Deserialize)]
pub struct PageDescriptor {
    /// Packed value: the lowest 4 bits are the page kind, the upper 28 bits
    /// the number of pages described.
    pub info: u32,
    pub digest: [u8; 20],
}

impl PageDescriptor {
    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// Leading part of the base file format optional header payload.
#[derive(Debug, Deserialize)]
pub struct FileFormatInfo {
    pub encryption: u16,
    pub compression: u16,
}

impl FileFormatInfo {
    pub const SIZE: u32 = 4;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// A basic compression run: `data_size` literal Bytes followed by
/// `zero_size` zero Bytes.
#[derive(Debug, Deserialize)]
pub struct BasicRun {
    pub data_size: u32,
    pub zero_size: u32,
}

impl BasicRun {
    pub const SIZE: u32 = 8;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// Parameters of the windowed ("normal") compression scheme.
#[derive(Debug, Deserialize)]
pub struct NormalCompressionInfo {
    pub window_size: u32,
    /// Size of the first compressed block.
    pub block_size: u32,
    /// Digest of the first compressed block.
    pub block_hash: [u8; 20],
}

impl NormalCompressionInfo {
    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// Leading part of the import libraries optional header payload.
///
/// Followed by the string table (`string_table_size` Bytes) and
/// `library_count` `ImportLibraryHeader`s, each followed by its records.
#[derive(Debug, Deserialize)]
pub struct ImportTableHeader {
    pub string_table_size: u32,
    pub library_count: u32,
}

impl ImportTableHeader {
    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportLibraryHeader {
    pub size: u32,
    pub next_import_digest: [u8; 20],
    pub id: u32,
    pub version: u32,
    pub min_version: u32,
    /// Index of the library name in the import string table.
    pub name_index: u16,
    /// Number of `u32` records following this header.
    pub record_count: u16,
}

impl ImportLibraryHeader {
    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// A `.pdata` (exception table) record. Terminated by `begin == 0`.
#[derive(Debug, Deserialize)]
pub struct PdataEntry {
    /// Virtual address of the function.
    pub begin: u32,
    /// Packed prologue length, function length and flags.
    pub data: u32,
}

impl PdataEntry {
    pub const SIZE: u32 = 8;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_be(data)
    }
}

/// The MS-DOS stub header at the start of the PE image.
#[derive(Debug, Deserialize)]
pub struct DosHeader {
    /// `MZ`.
    pub magic: u16,
    pub unused: [u16; 29],
    /// File offset of the `PE\0\0` signature.
    pub lfanew: u32,
}

impl DosHeader {
    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_le(data)
    }
}

/// The COFF file header, following the `PE\0\0` signature.
#[derive(Debug, Deserialize)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl CoffHeader {
    pub const SIZE: u32 = 20;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_le(data)
    }
}

/// The leading, fixed-layout part of the PE32 optional header.
///
/// The data directories following it are not needed and not parsed.
#[derive(Debug, Deserialize)]
pub struct OptionalHeader32 {
    /// `0x10B` for PE32.
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    /// Relative to `image_base`.
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
}

impl OptionalHeader32 {
    /// Number of Bytes covered by this structure.
    pub const SIZE: u32 = 72;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_le(data)
    }
}

/// A PE section table entry.
#[derive(Debug, Deserialize)]
pub struct SectionHeader {
    /// Zero-padded ASCII name.
    pub name: [u8; 8],
    pub virtual_size: u32,
    /// Relative to the image base.
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    /// See `SectionFlags`.
    pub characteristics: u32,
}

impl SectionHeader {
    pub const SIZE: u32 = 40;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_le(data)
    }
}

/// A serde visitor that deserializes a fixed number of elements as a sequence
/// and passes them to a closure to be put into the final result type.
struct SliceAdapter<F, S: 'static, R>
where F: FnOnce(&[S]) -> R {
    /// Maps the decoded slice to the final result value of type `R`.
    ///
    /// The passed slice always has length `num_elements`.
    map: F,
    /// A string describing what kind of item was expected.
    expected: &'static str,
    /// Number of elements to decode from the stream.
    num_elements: usize,
    _phantom: PhantomData<&'static S>,
}

impl<F, S: 'static, R> SliceAdapter<F, S, R>
where F: FnOnce(&[S]) -> R {
    fn new(map: F, expected: &'static str, num_elements: usize) -> Self {
        Self {
            map, expected,
            num_elements,
            _phantom: PhantomData,
        }
    }
}

impl<'de, F, S: 'static, R> de::Visitor<'de> for SliceAdapter<F, S, R>
where
    F: FnOnce(&[S]) -> R,
    S: de::Deserialize<'de>
{
    type Value = R;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}", self.expected)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error> where
        A: de::SeqAccess<'de>, {

        let mut buf = Vec::with_capacity(self.num_elements);
        for i in 0..self.num_elements {
            match seq.next_element::<S>()? {
                Some(elem) => buf.push(elem),
                None => return Err(de::Error::invalid_length(i, &self)),
            }
        }

        Ok((self.map)(&buf))
    }
}

/// RSA signature blob.
///
/// This type exists solely because `[u8; 256]` implements neither `Debug`
/// nor `Deserialize`.
#[derive(Copy, Clone)]
pub struct Signature(pub [u8; 256]);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let slice: &[u8] = &self.0;
        write!(f, "0x")?;
        for b in slice {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl<'de> de::Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error> where
        D: de::Deserializer<'de> {

        // we use tuple instead of seq or bytes here since we know the length
        deserializer.deserialize_tuple(256, SliceAdapter::new(
            |slice| {
                let mut buf = [0; 256];
                buf.copy_from_slice(slice);
                Signature(buf)
            },
            "signature blob (256 Bytes)",
            256,
        ))
    }
}
