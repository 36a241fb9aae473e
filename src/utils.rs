use crate::error::Error;

use std::fmt;
use std::ops::{Deref, Range};

/// Bounds-checked access to container and image bytes.
///
/// XEX and PE headers address everything with 32-bit file offsets. A region
/// outside of the data is reported as `Error::Malformed`, naming the
/// structure that was being read.
pub trait ByteRegion {
    /// Returns the Bytes in `range`.
    fn region(&self, range: Range<u32>, what: &str) -> Result<&[u8], Error>;

    /// Returns everything from `start` to the end of the data.
    fn region_from(&self, start: u32, what: &str) -> Result<&[u8], Error>;
}

impl ByteRegion for [u8] {
    fn region(&self, range: Range<u32>, what: &str) -> Result<&[u8], Error> {
        self.get(range.start as usize..range.end as usize)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "{} at {:#X}..{:#X} lies outside of the {:#X} Bytes of data",
                    what,
                    range.start,
                    range.end,
                    self.len()
                ))
            })
    }

    fn region_from(&self, start: u32, what: &str) -> Result<&[u8], Error> {
        self.get(start as usize..).ok_or_else(|| {
            Error::Malformed(format!(
                "{} at {:#X} lies outside of the {:#X} Bytes of data",
                what,
                start,
                self.len()
            ))
        })
    }
}

/// Returns the index of the first occurrence of `needle` in `haystack`.
pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Keeps image data and key material out of `{:?}` output.
#[derive(Clone, Copy)]
pub struct NoDebug<T>(pub T);

impl<T> fmt::Debug for NoDebug<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(omitted)")
    }
}

impl<T> Deref for NoDebug<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> From<T> for NoDebug<T> {
    fn from(t: T) -> Self {
        NoDebug(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_name_the_structure() {
        let data = [1u8, 2, 3, 4];
        assert_eq!(data.region(1..3, "run").unwrap(), &[2, 3]);
        assert_eq!(data.region_from(4, "payload").unwrap(), &[] as &[u8]);

        match data.region(2..5, "security info") {
            Err(Error::Malformed(msg)) => {
                assert!(msg.starts_with("security info at 0x2..0x5"), "{}", msg)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(data.region_from(5, "payload").is_err());
        // inverted ranges are out of bounds, too
        assert!(data.region(3..1, "run").is_err());
    }

    #[test]
    fn no_debug_output() {
        let wrapped = NoDebug([0x55u8; 16]);
        assert_eq!(format!("{:?}", wrapped), "(omitted)");
        let copy = wrapped;
        assert_eq!(copy[0], wrapped[15]);
    }

    #[test]
    fn find_subslice_locates_first_hit() {
        let hay = [0u8, 1, 2, 3, 1, 2, 3];
        assert_eq!(find_subslice(&hay, &[1, 2, 3]), Some(1));
        assert_eq!(find_subslice(&hay, &[3, 1]), Some(3));
        assert_eq!(find_subslice(&hay, &[4]), None);
        assert_eq!(find_subslice(&hay, &[]), None);
        assert_eq!(find_subslice(&[1, 2], &[1, 2, 3]), None);
    }
}
