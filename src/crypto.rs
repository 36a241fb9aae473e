//! AES-128-CBC helpers and key configuration.
//!
//! XEX containers encrypt their payload with a per-file session key. The
//! session key is itself stored encrypted (the "file key" in the security
//! info) and is recovered by decrypting it with a console-class key. Both
//! steps use AES-128 in CBC mode with an all-zero IV and no padding.

use crate::Error;

use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};

use std::fmt;
use std::str::FromStr;

type Aes128CbcEnc = Encryptor<Aes128>;
type Aes128CbcDec = Decryptor<Aes128>;

/// AES block size in Bytes.
pub const BLOCK_SIZE: usize = 16;

const ZERO_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// Decrypts `data` with AES-128-CBC, zero IV, no padding.
///
/// `data.len()` must be a multiple of 16.
pub fn decrypt_cbc(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, Error> {
    check_block_multiple(data.len())?;
    let cipher = Aes128CbcDec::new_from_slices(key, &ZERO_IV)
        .map_err(|e| Error::Malformed(format!("invalid AES key: {}", e)))?;
    let mut buf = data.to_vec();
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| Error::Malformed(format!("AES decryption failed: {:?}", e)))?;
    Ok(buf)
}

/// Encrypts `data` with AES-128-CBC, zero IV, no padding.
///
/// This is the inverse of `decrypt_cbc` and can be used to build encrypted
/// containers.
pub fn encrypt_cbc(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, Error> {
    check_block_multiple(data.len())?;
    let cipher = Aes128CbcEnc::new_from_slices(key, &ZERO_IV)
        .map_err(|e| Error::Malformed(format!("invalid AES key: {}", e)))?;
    let mut buf = data.to_vec();
    let len = buf.len();
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|e| Error::Malformed(format!("AES encryption failed: {:?}", e)))?;
    Ok(buf)
}

fn check_block_multiple(len: usize) -> Result<(), Error> {
    if len % BLOCK_SIZE != 0 {
        return Err(Error::Malformed(format!(
            "encrypted data length {:#X} is not a multiple of the AES block size",
            len
        )));
    }
    Ok(())
}

/// Where the key used to decrypt a container's file key comes from.
///
/// Development-kit containers use an all-zero key. Retail containers require
/// the retail key, which this crate does not ship; supply it as `Custom`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    DevKit,
    Custom([u8; 16]),
}

impl KeySource {
    /// Returns the 128-bit key this source stands for.
    pub fn key(&self) -> [u8; 16] {
        match self {
            KeySource::DevKit => [0; 16],
            KeySource::Custom(key) => *key,
        }
    }
}

impl Default for KeySource {
    fn default() -> Self {
        KeySource::DevKit
    }
}

// Key material is kept out of debug output.
impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeySource::DevKit => f.write_str("DevKit"),
            KeySource::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for KeySource {
    type Err = Error;

    /// Parses `devkit` or a key given as 32 hexadecimal digits.
    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("devkit") {
            return Ok(KeySource::DevKit);
        }

        if s.len() != 32 || !s.is_ascii() {
            return Err(Error::Malformed(format!(
                "key must be `devkit` or 32 hex digits, got `{}`",
                s
            )));
        }

        let mut key = [0; 16];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = s
                .get(i * 2..i * 2 + 2)
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| Error::Malformed(format!("invalid key `{}`", s)))?;
        }
        Ok(KeySource::Custom(key))
    }
}

/// Recovers the session key by decrypting the container's encrypted file key.
pub fn decrypt_file_key(source: &KeySource, file_key: &[u8; 16]) -> Result<[u8; 16], Error> {
    let plain = decrypt_cbc(&source.key(), file_key)?;
    let mut key = [0; 16];
    key.copy_from_slice(&plain);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIPS_KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const FIPS_PLAIN: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];
    const FIPS_CIPHER: [u8; 16] = [
        0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5,
        0x5a,
    ];

    #[test]
    fn single_block_matches_fips197() {
        // With a zero IV, the first CBC block is plain AES.
        assert_eq!(decrypt_cbc(&FIPS_KEY, &FIPS_CIPHER).unwrap(), FIPS_PLAIN);
        assert_eq!(encrypt_cbc(&FIPS_KEY, &FIPS_PLAIN).unwrap(), FIPS_CIPHER);
    }

    #[test]
    fn blocks_are_chained() {
        let plain = [0x5Au8; 48];
        let cipher = encrypt_cbc(&FIPS_KEY, &plain).unwrap();
        // Identical plaintext blocks must encrypt differently in CBC mode.
        assert_ne!(cipher[0..16], cipher[16..32]);
        assert_eq!(decrypt_cbc(&FIPS_KEY, &cipher).unwrap(), plain.to_vec());
    }

    #[test]
    fn rejects_partial_blocks() {
        assert!(decrypt_cbc(&FIPS_KEY, &[0; 17]).is_err());
        assert!(encrypt_cbc(&FIPS_KEY, &[0; 15]).is_err());
        assert_eq!(decrypt_cbc(&FIPS_KEY, &[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn parses_key_sources() {
        assert_eq!("devkit".parse::<KeySource>().unwrap(), KeySource::DevKit);
        assert_eq!("DevKit".parse::<KeySource>().unwrap(), KeySource::DevKit);
        assert_eq!(
            "000102030405060708090a0B0c0d0e0f".parse::<KeySource>().unwrap(),
            KeySource::Custom(FIPS_KEY)
        );
        assert!("0001".parse::<KeySource>().is_err());
        assert!("zz0102030405060708090a0b0c0d0e0f".parse::<KeySource>().is_err());
        assert_eq!(KeySource::default().key(), [0; 16]);
        assert_eq!(format!("{:?}", KeySource::Custom(FIPS_KEY)), "Custom(..)");
    }

    #[test]
    fn file_key_roundtrip() {
        let session = [0x42u8; 16];
        let mut stored = [0; 16];
        stored.copy_from_slice(&encrypt_cbc(&[0; 16], &session).unwrap());
        assert_eq!(
            decrypt_file_key(&KeySource::DevKit, &stored).unwrap(),
            session
        );
    }
}
