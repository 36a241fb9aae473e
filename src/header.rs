//! The XEX header and the optional headers it references.
//!
//! The fixed header at the start of the file is followed by a table of
//! `(id, value)` pairs, the optional headers. Depending on the id, the value is
//! either the payload itself or a file offset pointing to the payload. Two of
//! them are required to decode the image: the base file format (encryption and
//! compression parameters) and, for resolving imports, the import libraries.

use crate::error::Error;
use crate::pe::PeImage;
use crate::raw;
use crate::reader::BeReader;
use crate::utils::ByteRegion;

use std::fmt;

/// "XEX2"
pub const MAGIC_NUMBER: u32 = 0x58455832;

/// The decoded fixed XEX header and its optional header table.
#[derive(Debug)]
pub struct XexHeader {
    module_flags: ModuleFlags,
    pe_data_offset: u32,
    reserved: u32,
    security_offset: u32,
    optional_headers: Vec<OptionalHeader>,
}

impl XexHeader {
    /// Parses the header at the start of `file`.
    pub fn parse(file: &[u8]) -> Result<Self, Error> {
        let mut data = file;
        let raw = raw::XexHeader::parse(&mut data)?;
        if raw.magic != MAGIC_NUMBER {
            return Err(Error::Malformed(format!(
                "invalid magic number (got {:#X}, expected {:#X})",
                raw.magic, MAGIC_NUMBER
            )));
        }

        let module_flags = {
            let flags = ModuleFlags::from_bits_truncate(raw.module_flags);
            if flags.bits() != raw.module_flags {
                warn!(
                    "unknown module flags: known flags: {:#X}, raw flags: {:#X}",
                    flags.bits(),
                    raw.module_flags
                );
            }
            flags
        };

        debug!(
            "{} optional headers, image data at {:#X}, security info at {:#X}",
            raw.optional_header_count, raw.pe_data_offset, raw.security_offset
        );

        let mut optional_headers = Vec::new();
        for _ in 0..raw.optional_header_count {
            let entry = raw::OptionalHeaderEntry::parse(&mut data)?;
            optional_headers.push(OptionalHeader::from_raw(&entry, file)?);
        }

        Ok(Self {
            module_flags,
            pe_data_offset: raw.pe_data_offset,
            reserved: raw.reserved,
            security_offset: raw.security_offset,
            optional_headers,
        })
    }

    pub fn module_flags(&self) -> &ModuleFlags {
        &self.module_flags
    }

    /// File offset of the (encrypted, compressed) image data.
    pub fn pe_data_offset(&self) -> u32 {
        self.pe_data_offset
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// File offset of the security info.
    pub fn security_offset(&self) -> u32 {
        self.security_offset
    }

    /// All optional headers, in file order.
    pub fn optional_headers(&self) -> &[OptionalHeader] {
        &self.optional_headers
    }

    /// Returns the first optional header with the given id.
    pub fn find(&self, id: OptionalHeaderId) -> Option<&OptionalHeader> {
        self.optional_headers.iter().find(|h| h.id() == id as u32)
    }
}

bitflags! {
    /// Values of the `module_flags` field in the header.
    pub struct ModuleFlags: u32 {
        const TITLE              = 0x00000001;
        const EXPORTS_TO_TITLE   = 0x00000002;
        const SYSTEM_DEBUGGER    = 0x00000004;
        const DLL_MODULE         = 0x00000008;
        const MODULE_PATCH       = 0x00000010;
        const PATCH_FULL         = 0x00000020;
        const PATCH_DELTA        = 0x00000040;
        const USER_MODE          = 0x00000080;
    }
}

/// Known optional header ids.
///
/// The low byte of an id encodes how its value is stored, see
/// [`OptionalHeader`](struct.OptionalHeader.html).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OptionalHeaderId {
    ResourceInfo = 0x2FF,
    BaseFileFormat = 0x3FF,
    BaseReference = 0x405,
    DeltaPatchDescriptor = 0x5FF,
    BoundingPath = 0x80FF,
    DeviceId = 0x8105,
    OriginalBaseAddress = 0x10001,
    EntryPoint = 0x10100,
    ImageBaseAddress = 0x10201,
    ImportLibraries = 0x103FF,
    ChecksumTimestamp = 0x18002,
    EnabledForCallcap = 0x18102,
    EnabledForFastcap = 0x18200,
    OriginalPeName = 0x183FF,
    StaticLibraries = 0x200FF,
    TlsInfo = 0x20104,
    DefaultStackSize = 0x20200,
    DefaultFilesystemCacheSize = 0x20301,
    DefaultHeapSize = 0x20401,
    PageHeapSizeAndFlags = 0x28002,
    SystemFlags = 0x30000,
    ExecutionId = 0x40006,
    ServiceIdList = 0x401FF,
    TitleWorkspaceSize = 0x40201,
    GameRatings = 0x40310,
    LanKey = 0x40404,
    Xbox360Logo = 0x405FF,
    MultidiscMediaIds = 0x406FF,
    AlternateTitleIds = 0x407FF,
    AdditionalTitleMemory = 0x40801,
    ExportsByName = 0xE10402,
}

impl OptionalHeaderId {
    const ALL: &'static [OptionalHeaderId] = &[
        OptionalHeaderId::ResourceInfo,
        OptionalHeaderId::BaseFileFormat,
        OptionalHeaderId::BaseReference,
        OptionalHeaderId::DeltaPatchDescriptor,
        OptionalHeaderId::BoundingPath,
        OptionalHeaderId::DeviceId,
        OptionalHeaderId::OriginalBaseAddress,
        OptionalHeaderId::EntryPoint,
        OptionalHeaderId::ImageBaseAddress,
        OptionalHeaderId::ImportLibraries,
        OptionalHeaderId::ChecksumTimestamp,
        OptionalHeaderId::EnabledForCallcap,
        OptionalHeaderId::EnabledForFastcap,
        OptionalHeaderId::OriginalPeName,
        OptionalHeaderId::StaticLibraries,
        OptionalHeaderId::TlsInfo,
        OptionalHeaderId::DefaultStackSize,
        OptionalHeaderId::DefaultFilesystemCacheSize,
        OptionalHeaderId::DefaultHeapSize,
        OptionalHeaderId::PageHeapSizeAndFlags,
        OptionalHeaderId::SystemFlags,
        OptionalHeaderId::ExecutionId,
        OptionalHeaderId::ServiceIdList,
        OptionalHeaderId::TitleWorkspaceSize,
        OptionalHeaderId::GameRatings,
        OptionalHeaderId::LanKey,
        OptionalHeaderId::Xbox360Logo,
        OptionalHeaderId::MultidiscMediaIds,
        OptionalHeaderId::AlternateTitleIds,
        OptionalHeaderId::AdditionalTitleMemory,
        OptionalHeaderId::ExportsByName,
    ];

    /// Looks up the known id with the given raw value.
    pub fn from_raw(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|known| *known as u32 == id)
    }
}

/// An entry of the optional header table, with its payload already read.
pub struct OptionalHeader {
    id: u32,
    value: u32,
    data: Vec<u8>,
}

impl OptionalHeader {
    /// Reads the payload of an optional header entry from the container.
    ///
    /// * low byte `0x00` or `0x01`: `value` is the payload.
    /// * low byte `0xFF`: `value` is the file offset of a `u32` length
    ///   (counting itself) followed by the payload.
    /// * otherwise: `value` is the file offset of a `u32` count of words,
    ///   followed by `count * 4` Bytes of payload.
    fn from_raw(raw: &raw::OptionalHeaderEntry, file: &[u8]) -> Result<Self, Error> {
        let data = match raw.id & 0xFF {
            0x00 | 0x01 => raw.value.to_be_bytes().to_vec(),
            0xFF => {
                let len = BeReader::at(file, raw.value)?.read_u32()?;
                if len < 4 {
                    return Err(Error::Malformed(format!(
                        "optional header {:#X} has invalid length {:#X}",
                        raw.id, len
                    )));
                }
                let start = raw
                    .value
                    .checked_add(4)
                    .ok_or_else(|| Error::addr_overflow(raw.value, 4))?;
                let end = raw
                    .value
                    .checked_add(len)
                    .ok_or_else(|| Error::addr_overflow(raw.value, len))?;
                file.region(start..end, "optional header payload")?.to_vec()
            }
            _ => {
                let words = BeReader::at(file, raw.value)?.read_u32()?;
                let len = words.checked_mul(4).ok_or_else(|| {
                    Error::Malformed(format!(
                        "optional header {:#X} has invalid length {:#X} words",
                        raw.id, words
                    ))
                })?;
                let start = raw
                    .value
                    .checked_add(4)
                    .ok_or_else(|| Error::addr_overflow(raw.value, 4))?;
                let end = start
                    .checked_add(len)
                    .ok_or_else(|| Error::addr_overflow(start, len))?;
                file.region(start..end, "optional header payload")?.to_vec()
            }
        };

        match OptionalHeaderId::from_raw(raw.id) {
            Some(known) => trace!("optional header {:?}: {} Bytes", known, data.len()),
            None => debug!("unknown optional header {:#X}: {} Bytes", raw.id, data.len()),
        }

        Ok(Self {
            id: raw.id,
            value: raw.value,
            data,
        })
    }

    /// The raw id of this header.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The id of this header, if it is a known one.
    pub fn known_id(&self) -> Option<OptionalHeaderId> {
        OptionalHeaderId::from_raw(self.id)
    }

    /// The raw value stored in the header table (a payload or a file offset).
    pub fn value(&self) -> u32 {
        self.value
    }

    /// The payload of this header.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Interprets the first 4 payload Bytes as a Big Endian `u32`.
    pub fn as_u32(&self) -> Option<u32> {
        BeReader::new(&self.data).read_u32().ok()
    }

    /// Interprets the payload as a zero-terminated ASCII string.
    pub fn as_str(&self) -> String {
        let bytes = self.data.split(|b| *b == 0).next().unwrap_or(&[]);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl fmt::Debug for OptionalHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("OptionalHeader");
        match self.known_id() {
            Some(id) => s.field("id", &id),
            None => s.field("id", &format_args!("{:#X}", self.id)),
        };
        s.field("value", &format_args!("{:#X}", self.value))
            .field("len", &self.data.len())
            .finish()
    }
}

/// Encryption applied to the image data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encryption {
    None,
    /// AES-128-CBC with the session key.
    Normal,
}

/// Compression applied to the (decrypted) image data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    None,
    /// Runs of literal data and zeros.
    Basic(Vec<BasicRun>),
    /// Windowed LZX compression. Recognized, but not supported.
    Normal(NormalCompression),
    /// No image is stored in the container.
    Delta,
}

impl Compression {
    /// The raw compression id as stored in the container.
    pub fn id(&self) -> u16 {
        match self {
            Compression::None => 0,
            Compression::Basic(_) => 1,
            Compression::Normal(_) => 2,
            Compression::Delta => 3,
        }
    }
}

/// A basic compression run.
///
/// Expands to `data_size` Bytes copied from the input, followed by
/// `zero_size` zero Bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BasicRun {
    pub data_size: u32,
    pub zero_size: u32,
}

/// Parameters of the windowed compression scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalCompression {
    pub window_size: u32,
    pub block_size: u32,
    pub block_hash: [u8; 20],
}

/// The decoded base file format optional header.
#[derive(Debug, Clone)]
pub struct BaseFileFormat {
    encryption: Encryption,
    compression: Compression,
}

impl BaseFileFormat {
    /// Decodes the payload of the base file format optional header.
    ///
    /// Fails with `Error::Unsupported` for unknown encryption or compression
    /// ids.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut data = payload;
        let info = raw::FileFormatInfo::parse(&mut data)?;

        let encryption = match info.encryption {
            0 => Encryption::None,
            1 => Encryption::Normal,
            other => {
                return Err(Error::Unsupported(format!(
                    "encryption type {}",
                    other
                )))
            }
        };

        let compression = match info.compression {
            0 => Compression::None,
            1 => {
                let count = (payload.len() as u32).saturating_sub(raw::FileFormatInfo::SIZE)
                    / raw::BasicRun::SIZE;
                let mut runs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let run = raw::BasicRun::parse(&mut data)?;
                    runs.push(BasicRun {
                        data_size: run.data_size,
                        zero_size: run.zero_size,
                    });
                }
                Compression::Basic(runs)
            }
            2 => {
                let raw = raw::NormalCompressionInfo::parse(&mut data)?;
                Compression::Normal(NormalCompression {
                    window_size: raw.window_size,
                    block_size: raw.block_size,
                    block_hash: raw.block_hash,
                })
            }
            3 => Compression::Delta,
            other => {
                return Err(Error::Unsupported(format!(
                    "compression type {}",
                    other
                )))
            }
        };

        debug!("image data: {:?} encryption, compression {}", encryption, compression.id());

        Ok(Self {
            encryption,
            compression,
        })
    }

    pub fn encryption(&self) -> Encryption {
        self.encryption
    }

    pub fn compression(&self) -> &Compression {
        &self.compression
    }
}

/// A library the module imports functions or variables from.
#[derive(Debug, Clone)]
pub struct ImportLibrary {
    name: String,
    id: u32,
    version: u32,
    min_version: u32,
    /// Virtual addresses of the import slots.
    records: Vec<u32>,
}

impl ImportLibrary {
    /// Decodes the payload of the import libraries optional header.
    pub fn parse_table(payload: &[u8]) -> Result<Vec<Self>, Error> {
        let mut data = payload;
        let table = raw::ImportTableHeader::parse(&mut data)?;
        let strings = data.region(0..table.string_table_size, "import string table")?;
        let names = parse_string_table(strings);
        data = data.region_from(table.string_table_size, "import libraries")?;

        let mut libraries = Vec::new();
        for _ in 0..table.library_count {
            let header = raw::ImportLibraryHeader::parse(&mut data)?;
            let name = names
                .get(header.name_index as usize)
                .cloned()
                .ok_or_else(|| {
                    Error::Malformed(format!(
                        "import library name index {} out of range ({} names)",
                        header.name_index,
                        names.len()
                    ))
                })?;

            let mut reader = BeReader::new(data);
            let records = (0..header.record_count)
                .map(|_| reader.read_u32())
                .collect::<Result<Vec<_>, _>>()?;
            data = reader.rest();

            debug!("import library '{}': {} records", name, records.len());
            libraries.push(ImportLibrary {
                name,
                id: header.id,
                version: header.version,
                min_version: header.min_version,
                records,
            });
        }

        Ok(libraries)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Minimum library version the module is compatible with.
    pub fn min_version(&self) -> u32 {
        self.min_version
    }

    /// Virtual addresses of the import slots of this library.
    pub fn records(&self) -> &[u32] {
        &self.records
    }

    /// Reads every import slot from the reconstructed image.
    ///
    /// Each slot holds a packed word: record type in the top byte, library
    /// index in the next byte and the ordinal in the low half. A type 0 record
    /// introduces an import, a type 1 record supplies the thunk address of the
    /// import with the same ordinal.
    pub fn resolve(&self, image: &PeImage) -> Result<Vec<ImportFunction>, Error> {
        let mut functions: Vec<ImportFunction> = Vec::new();
        for &record in &self.records {
            let word = image.read_u32_at(record)?;
            let kind = word >> 24;
            let ordinal = (word & 0xFFFF) as u16;

            match kind {
                0 => functions.push(ImportFunction {
                    address: record,
                    ordinal,
                    thunk: None,
                }),
                1 => match functions.iter_mut().find(|f| f.ordinal == ordinal) {
                    Some(function) => function.thunk = Some(record),
                    None => functions.push(ImportFunction {
                        address: record,
                        ordinal,
                        thunk: Some(record),
                    }),
                },
                _ => warn!(
                    "import record at {:#08X} in '{}' has unknown type {}",
                    record, self.name, kind
                ),
            }
        }
        Ok(functions)
    }
}

/// An imported function or variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFunction {
    /// Virtual address of the import slot.
    pub address: u32,
    /// Export ordinal in the imported library.
    pub ordinal: u16,
    /// Virtual address of the call thunk, if the import is a function.
    pub thunk: Option<u32>,
}

/// Splits the zero-padded, NUL-separated import string table.
fn parse_string_table(data: &[u8]) -> Vec<String> {
    data.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}
