use std::{error, fmt, io};

/// The error type used by the `xex` library.
#[derive(Debug)]
pub enum Error {
    /// The input violates the structure of the format being decoded.
    Malformed(String),
    /// The input uses a feature that is recognized but not implemented.
    Unsupported(String),
    /// A mandatory compiler intrinsic could not be located in the code section.
    MissingIntrinsic(&'static str),
    /// The embedded section table contradicts the raw file layout it describes.
    Layout {
        /// Name of the offending section.
        section: String,
        /// The `PointerToRawData` declared by the section header.
        expected: u32,
        /// The size of the reconstructed image when the section was reached.
        actual: u32,
    },
    Io(io::Error),
}

impl Error {
    /// Creates an `Error` denoting that an address computation would have lead
    /// to an overflow.
    pub(crate) fn addr_overflow(base: u32, offset: u32) -> Self {
        Error::Malformed(format!(
            "invalid address or length: address computation overflow ({:#08X}+{:#08X})",
            base, offset
        ))
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Malformed(s) => write!(f, "malformed data: {}", s),
            Error::Unsupported(s) => write!(f, "unsupported: {}", s),
            Error::MissingIntrinsic(name) => write!(
                f,
                "compiler intrinsic `{}` not found in code section",
                name
            ),
            Error::Layout { section, expected, actual } => write!(
                f,
                "section '{}' expected at raw offset {:#X}, but reconstructed image is {:#X} bytes long",
                section, expected, actual
            ),
            Error::Io(io) => write!(f, "i/o error: {}", io),
        }
    }
}

impl From<io::Error> for Error {
    fn from(io: io::Error) -> Self {
        Error::Io(io)
    }
}
