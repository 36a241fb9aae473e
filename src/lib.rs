//! Decoder and control-flow analyzer for the `XEX2` container format used by
//! Xbox 360 executables.
//!
//! A XEX file wraps a PowerPC PE image, usually encrypted with a per-file
//! session key and compressed. [`Xex`] decodes the container into the flat
//! image (every section at its virtual address), [`PeImage`] turns that back
//! into a regular PE file, and [`analysis::analyze`] recovers the functions
//! and basic blocks of its code section.
//!
//! [`Xex`]: struct.Xex.html
//! [`PeImage`]: pe/struct.PeImage.html
//! [`analysis::analyze`]: analysis/fn.analyze.html

#![doc(html_root_url = "https://docs.rs/xex/0.1.0")]
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]

// Deny unchecked slice indexing when using clippy. This can almost always
// result in a panic with a malformed XEX.
#![cfg_attr(feature = "cargo-clippy", deny(indexing_slicing))]
#![cfg_attr(feature = "cargo-clippy", allow(unreadable_literal, large_digit_groups))]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate log;
#[macro_use] extern crate serde_derive;
extern crate serde;
extern crate bincode;
extern crate byteorder;

pub mod analysis;
pub mod cfa;
pub mod crypto;
pub mod decompress;
pub mod discover;
mod error;
pub mod function;
pub mod header;
pub mod intrinsics;
pub mod map;
pub mod pdata;
pub mod pe;
pub mod ppc;
mod raw;
pub mod reader;
pub mod security;
mod utils;

#[cfg(test)]
mod fixtures;

pub use crate::analysis::{analyze, Analysis, AnalysisOptions, Diagnostic};
pub use crate::crypto::KeySource;
pub use crate::error::Error;
pub use crate::header::{BaseFileFormat, ImportLibrary, OptionalHeaderId, XexHeader};
pub use crate::pe::PeImage;
pub use crate::security::SecurityInfo;
use crate::header::Encryption;
use crate::utils::{ByteRegion, NoDebug};

use std::u32;

/// A decoded Xbox 360 executable (XEX2 container).
///
/// Using the `parse` method, you can parse a `Xex` from raw bytes. Parsing
/// decrypts and decompresses the contained image, which can then be turned
/// into a PE file with [`reconstruct`](#method.reconstruct).
#[derive(Debug)]
pub struct Xex<'a> {
    header: XexHeader,
    base_file_format: BaseFileFormat,
    import_libraries: Vec<ImportLibrary>,
    security_info: SecurityInfo,
    session_key: NoDebug<[u8; 16]>,
    /// The flat image, sections laid out by virtual address.
    image: NoDebug<Option<Vec<u8>>>,
    /// The raw container data.
    data: NoDebug<&'a [u8]>,
}

impl<'a> Xex<'a> {
    /// Tries to parse a development-kit XEX file from raw data.
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        Self::parse_with_key(data, &KeySource::DevKit)
    }

    /// Tries to parse a XEX file, decrypting its file key with the key
    /// provided by `key`.
    pub fn parse_with_key(data: &'a [u8], key: &KeySource) -> Result<Self, Error> {
        if data.len() >= u32::MAX as usize {
            return Err(Error::Malformed(format!("container too large ({} Bytes)", data.len())));
        }

        let header = XexHeader::parse(data)?;

        let base_file_format = {
            let mut formats = header
                .optional_headers()
                .iter()
                .filter(|h| h.id() == OptionalHeaderId::BaseFileFormat as u32);
            let first = formats.next().ok_or_else(|| {
                Error::Malformed("missing base file format header".to_string())
            })?;
            let duplicates = formats.count();
            if duplicates != 0 {
                warn!("{} duplicate base file format headers, using the first", duplicates);
            }
            BaseFileFormat::parse(first.data())?
        };

        let import_libraries = match header.find(OptionalHeaderId::ImportLibraries) {
            Some(table) => ImportLibrary::parse_table(table.data())?,
            None => Vec::new(),
        };

        let security_info = SecurityInfo::parse(data, header.security_offset())?;
        let session_key = crypto::decrypt_file_key(key, &security_info.file_key().0)?;

        let image = if base_file_format.compression().id() == 3 {
            info!("container stores no image");
            None
        } else {
            let payload = data.region_from(header.pe_data_offset(), "image data")?;
            let payload = match base_file_format.encryption() {
                Encryption::None => payload.to_vec(),
                Encryption::Normal => crypto::decrypt_cbc(&session_key, payload)?,
            };
            decompress::decompress(
                base_file_format.compression(),
                &payload,
                security_info.image_size(),
            )?
        };

        if let Some(image) = &image {
            info!(
                "decoded {:#X} Byte image, load address {:#08X}",
                image.len(),
                security_info.load_address()
            );
        }

        Ok(Self {
            header,
            base_file_format,
            import_libraries,
            security_info,
            session_key: NoDebug::from(session_key),
            image: NoDebug::from(image),
            data: NoDebug::from(data),
        })
    }

    /// Returns the fixed header and the optional header table.
    pub fn header(&self) -> &XexHeader {
        &self.header
    }

    /// Returns the encryption and compression parameters of the image data.
    pub fn base_file_format(&self) -> &BaseFileFormat {
        &self.base_file_format
    }

    /// Returns the libraries this module imports from.
    ///
    /// Use [`ImportLibrary::resolve`] on the reconstructed image to read the
    /// individual imports.
    ///
    /// [`ImportLibrary::resolve`]: header/struct.ImportLibrary.html#method.resolve
    pub fn import_libraries(&self) -> &[ImportLibrary] {
        &self.import_libraries
    }

    /// Returns the security info (also called loader info).
    ///
    /// It contains the image size, load address and the page descriptors. The
    /// digests and signature in here are not verified.
    pub fn security_info(&self) -> &SecurityInfo {
        &self.security_info
    }

    /// Returns the decrypted file key used to decrypt the image data.
    pub fn session_key(&self) -> &[u8; 16] {
        &self.session_key
    }

    /// Returns the decrypted and decompressed image, with every section at its
    /// virtual address.
    ///
    /// Containers using compression type 3 store no image, this returns
    /// `None` for them.
    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_ref().map(|image| image.as_slice())
    }

    /// Rebuilds the raw PE file from the decoded image.
    pub fn reconstruct(&self) -> Result<PeImage, Error> {
        let image = self.image().ok_or_else(|| {
            Error::Malformed("container stores no image to reconstruct".to_string())
        })?;
        PeImage::reconstruct(image)
    }

    /// Returns the entry point of the module (virtual address).
    pub fn entry_point(&self) -> Option<u32> {
        self.optional_u32(OptionalHeaderId::EntryPoint)
    }

    /// Returns the address the image is loaded at, if the container says so.
    ///
    /// Otherwise, the load address in the security info applies.
    pub fn image_base(&self) -> Option<u32> {
        self.optional_u32(OptionalHeaderId::ImageBaseAddress)
    }

    /// Returns the base address the PE image was linked at.
    pub fn original_base_address(&self) -> Option<u32> {
        self.optional_u32(OptionalHeaderId::OriginalBaseAddress)
    }

    /// Number of Bytes to reserve for the main thread's stack.
    pub fn default_stack_size(&self) -> Option<u32> {
        self.optional_u32(OptionalHeaderId::DefaultStackSize)
    }

    /// Raw system flags.
    pub fn system_flags(&self) -> Option<u32> {
        self.optional_u32(OptionalHeaderId::SystemFlags)
    }

    /// Returns the file name of the PE image before it was converted to a XEX.
    pub fn original_pe_name(&self) -> Option<String> {
        self.header
            .find(OptionalHeaderId::OriginalPeName)
            .map(|h| h.as_str())
    }

    /// Returns the raw container data this XEX was decoded from.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    fn optional_u32(&self, id: OptionalHeaderId) -> Option<u32> {
        self.header.find(id).and_then(|h| h.as_u32())
    }
}
