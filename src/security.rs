//! Contains the security info data structures.
//!
//! The security info (also called loader info) holds the image size and load
//! address, the encrypted file key, region and media restrictions and a table
//! of page descriptors with their digests. Digests and the signature are
//! exposed as-is and never verified.

use crate::error::Error;
use crate::raw;
use crate::reader::BeReader;
use crate::utils::ByteRegion;

use std::fmt;

/// The security info of a XEX container.
///
/// Returned by [`Xex::security_info`].
///
/// [`Xex::security_info`]: ../struct.Xex.html#method.security_info
#[derive(Debug)]
pub struct SecurityInfo {
    header_size: u32,
    /// Size of the decompressed image in Bytes.
    image_size: u32,
    signature: raw::Signature,
    unknown: u32,
    image_flags: ImageFlags,
    load_address: u32,
    section_digest: Digest,
    import_table_count: u32,
    import_table_digest: Digest,
    media_id: Key,
    /// Session key, encrypted with the console-class key.
    file_key: Key,
    export_table: u32,
    header_digest: Digest,
    game_regions: GameRegions,
    allowed_media: MediaFlags,
    pages: Vec<PageDescriptor>,
}

impl SecurityInfo {
    /// Decodes the security info and the page-descriptor table following it.
    pub(crate) fn parse(file: &[u8], offset: u32) -> Result<Self, Error> {
        let mut data = file.region_from(offset, "security info")?;
        let raw = raw::SecurityInfo::parse(&mut data)?;

        let mut reader = BeReader::new(data);
        let page_count = reader.read_u32()?;
        let mut data = reader.rest();
        debug!("security info at {:#X}, {} page descriptors", offset, page_count);

        let mut pages = Vec::new();
        for _ in 0..page_count {
            pages.push(PageDescriptor::from_raw(&raw::PageDescriptor::parse(&mut data)?));
        }

        Ok(Self {
            header_size: raw.header_size,
            image_size: raw.image_size,
            signature: raw.signature,
            unknown: raw.unknown,
            image_flags: {
                let flags = ImageFlags::from_bits_truncate(raw.image_flags);
                if flags.bits() != raw.image_flags {
                    warn!(
                        "unknown image flags: known flags: {:#X}, raw flags: {:#X}",
                        flags.bits(),
                        raw.image_flags
                    );
                }
                flags
            },
            load_address: raw.load_address,
            section_digest: Digest(raw.section_digest),
            import_table_count: raw.import_table_count,
            import_table_digest: Digest(raw.import_table_digest),
            media_id: Key(raw.media_id),
            file_key: Key(raw.file_key),
            export_table: raw.export_table,
            header_digest: Digest(raw.header_digest),
            game_regions: {
                let flags = GameRegions::from_bits_truncate(raw.game_regions);
                if flags.bits() != raw.game_regions {
                    warn!(
                        "unknown game region flags: known flags: {:#X}, raw flags: {:#X}",
                        flags.bits(),
                        raw.game_regions
                    );
                }
                flags
            },
            allowed_media: {
                let flags = MediaFlags::from_bits_truncate(raw.allowed_media);
                if flags.bits() != raw.allowed_media {
                    warn!(
                        "unknown media flags: known flags: {:#X}, raw flags: {:#X}",
                        flags.bits(),
                        raw.allowed_media
                    );
                }
                flags
            },
            pages,
        })
    }

    pub fn header_size(&self) -> u32 {
        self.header_size
    }

    /// Size of the decompressed image in Bytes.
    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Returns the RSA signature over the header.
    pub fn signature(&self) -> &[u8; 256] {
        &self.signature.0
    }

    pub fn unknown(&self) -> u32 {
        self.unknown
    }

    pub fn image_flags(&self) -> &ImageFlags {
        &self.image_flags
    }

    /// Virtual address the image is loaded to.
    pub fn load_address(&self) -> u32 {
        self.load_address
    }

    pub fn section_digest(&self) -> &Digest {
        &self.section_digest
    }

    pub fn import_table_count(&self) -> u32 {
        self.import_table_count
    }

    pub fn import_table_digest(&self) -> &Digest {
        &self.import_table_digest
    }

    pub fn media_id(&self) -> &Key {
        &self.media_id
    }

    /// The encrypted session key.
    ///
    /// Use [`crypto::decrypt_file_key`] to obtain the key the image data is
    /// encrypted with.
    ///
    /// [`crypto::decrypt_file_key`]: ../crypto/fn.decrypt_file_key.html
    pub fn file_key(&self) -> &Key {
        &self.file_key
    }

    /// Virtual address of the export table, or 0.
    pub fn export_table(&self) -> u32 {
        self.export_table
    }

    pub fn header_digest(&self) -> &Digest {
        &self.header_digest
    }

    /// Bit flags of regions in which this title may run.
    pub fn game_regions(&self) -> &GameRegions {
        &self.game_regions
    }

    /// Bit flags of media the title may be started from.
    pub fn allowed_media(&self) -> &MediaFlags {
        &self.allowed_media
    }

    /// The page descriptors, in address order.
    pub fn pages(&self) -> &[PageDescriptor] {
        &self.pages
    }

    /// Size of a page described by the page-descriptor table.
    pub fn page_size(&self) -> u32 {
        if self.image_flags.contains(ImageFlags::PAGE_SIZE_4KB) {
            0x1000
        } else {
            0x10000
        }
    }
}

bitflags! {
    /// Values of the `image_flags` field in `SecurityInfo`.
    pub struct ImageFlags: u32 {
        const MANUFACTURING_UTILITY        = 0x00000002;
        const MANUFACTURING_SUPPORT_TOOLS  = 0x00000004;
        const XGD2_MEDIA_ONLY              = 0x00000008;
        const CARDEA_KEY                   = 0x00000100;
        const XEIKA_KEY                    = 0x00000200;
        const USERMODE_TITLE               = 0x00000400;
        const USERMODE_SYSTEM              = 0x00000800;
        const ORANGE0                      = 0x00001000;
        const ORANGE1                      = 0x00002000;
        const ORANGE2                      = 0x00004000;
        const IPTV_SIGNUP_APPLICATION      = 0x00010000;
        const IPTV_TITLE_APPLICATION       = 0x00020000;
        const KEYVAULT_PRIVILEGES_REQUIRED = 0x04000000;
        const ONLINE_ACTIVATION_REQUIRED   = 0x08000000;
        /// Pages in the page-descriptor table are 4 KB instead of 64 KB.
        const PAGE_SIZE_4KB                = 0x10000000;
        const REGION_FREE                  = 0x20000000;
        const REVOCATION_CHECK_OPTIONAL    = 0x40000000;
        const REVOCATION_CHECK_REQUIRED    = 0x80000000;
    }
}

bitflags! {
    /// Media type mask used for the `allowed_media` field in `SecurityInfo`.
    pub struct MediaFlags: u32 {
        const HARD_DISK              = 0x00000001;
        const DVD_X2                 = 0x00000002;
        const DVD_CD                 = 0x00000004;
        const DVD_5                  = 0x00000008;
        const DVD_9                  = 0x00000010;
        const SYSTEM_FLASH           = 0x00000020;
        const MEMORY_UNIT            = 0x00000080;
        const USB_MASS_STORAGE       = 0x00000100;
        const NETWORK                = 0x00000200;
        const DIRECT_FROM_MEMORY     = 0x00000400;
        const RAM_DRIVE              = 0x00000800;
        const SVOD                   = 0x00001000;
        const INSECURE_PACKAGE       = 0x01000000;
        const SAVEGAME_PACKAGE       = 0x02000000;
        const LOCALLY_SIGNED_PACKAGE = 0x04000000;
        const LIVE_SIGNED_PACKAGE    = 0x08000000;
        const XBOX_PACKAGE           = 0x10000000;
    }
}

bitflags! {
    /// Region flags used in the `game_regions` field of `SecurityInfo`.
    pub struct GameRegions: u32 {
        const NTSC_U       = 0x000000FF;
        const NTSC_J       = 0x0000FF00;
        const NTSC_J_JAPAN = 0x00000100;
        const NTSC_J_CHINA = 0x00000200;
        const PAL          = 0x00FF0000;
        const PAL_AU_NZ    = 0x00010000;
        const OTHER        = 0xFF000000;
    }
}

/// What kind of data a run of pages holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageKind {
    Code,
    Data,
    ReadOnlyData,
    Unknown(u8),
}

/// An entry of the page-descriptor table.
///
/// Describes `page_count` consecutive pages of the loaded image, starting
/// where the previous descriptor ended.
#[derive(Debug)]
pub struct PageDescriptor {
    kind: PageKind,
    page_count: u32,
    digest: Digest,
}

impl PageDescriptor {
    fn from_raw(raw: &raw::PageDescriptor) -> Self {
        let kind = match raw.info & 0xF {
            1 => PageKind::Code,
            2 => PageKind::Data,
            3 => PageKind::ReadOnlyData,
            n => PageKind::Unknown(n as u8),
        };
        Self {
            kind,
            page_count: raw.info >> 4,
            digest: Digest(raw.digest),
        }
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// 16-Byte key or identifier.
///
/// This struct exists to make the debug output nicer.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Key(pub [u8; 16]);

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// 20-Byte SHA-1 digest.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Digest(pub [u8; 20]);

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

fn write_hex(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
    write!(f, "0x")?;
    for b in bytes {
        write!(f, "{:02X}", b)?;
    }
    Ok(())
}
