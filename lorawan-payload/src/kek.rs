//! AES key wrap (RFC 3394), used by the key vault to protect session
//! keys with a key-encryption key.
use crate::default_crypto::DefaultFactory;
use crate::keys::{AES128, CryptoFactory, Decrypter, Encrypter};

const IV: [u8; 8] = [0xa6; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Input is not a whole number of 64-bit blocks, or too short.
    InvalidLength,
    /// The integrity check value did not match after unwrapping.
    Mismatch,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidLength => write!(f, "invalid key wrap length"),
            Error::Mismatch => write!(f, "key wrap integrity check failed"),
        }
    }
}

/// Wraps `plaintext` under `kek`. `out` must be `plaintext.len() + 8`
/// bytes; `plaintext` must be a multiple of 8 bytes, at least 16.
pub fn wrap(kek: &AES128, plaintext: &[u8], out: &mut [u8]) -> Result<(), Error> {
    let n = plaintext.len() / 8;
    if plaintext.len() % 8 != 0 || n < 2 || out.len() != plaintext.len() + 8 {
        return Err(Error::InvalidLength);
    }
    let enc = DefaultFactory.new_enc(kek);

    out[..8].copy_from_slice(&IV);
    out[8..].copy_from_slice(plaintext);

    let mut block = [0u8; 16];
    for j in 0..6u64 {
        for i in 1..=n {
            block[..8].copy_from_slice(&out[..8]);
            block[8..].copy_from_slice(&out[i * 8..i * 8 + 8]);
            enc.encrypt_block(&mut block);
            let t = (n as u64) * j + i as u64;
            out[..8].copy_from_slice(&block[..8]);
            for (a, b) in out[..8].iter_mut().zip(t.to_be_bytes()) {
                *a ^= b;
            }
            out[i * 8..i * 8 + 8].copy_from_slice(&block[8..]);
        }
    }
    Ok(())
}

/// Unwraps `ciphertext` under `kek`, verifying the integrity check
/// value. `out` must be `ciphertext.len() - 8` bytes.
pub fn unwrap(kek: &AES128, ciphertext: &[u8], out: &mut [u8]) -> Result<(), Error> {
    let n = ciphertext.len() / 8 - 1;
    if ciphertext.len() % 8 != 0 || n < 2 || out.len() + 8 != ciphertext.len() {
        return Err(Error::InvalidLength);
    }
    let dec = DefaultFactory.new_dec(kek);

    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..8]);
    out.copy_from_slice(&ciphertext[8..]);

    let mut block = [0u8; 16];
    for j in (0..6u64).rev() {
        for i in (1..=n).rev() {
            let t = (n as u64) * j + i as u64;
            block[..8].copy_from_slice(&a);
            for (b, x) in block[..8].iter_mut().zip(t.to_be_bytes()) {
                *b ^= x;
            }
            block[8..].copy_from_slice(&out[(i - 1) * 8..i * 8]);
            dec.decrypt_block(&mut block);
            a.copy_from_slice(&block[..8]);
            out[(i - 1) * 8..i * 8].copy_from_slice(&block[8..]);
        }
    }
    if a != IV {
        return Err(Error::Mismatch);
    }
    Ok(())
}

/// Unwraps a 16-byte key, the common case for session keys.
pub fn unwrap_key(kek: &AES128, ciphertext: &[u8]) -> Result<AES128, Error> {
    let mut key = [0u8; 16];
    if ciphertext.len() != 24 {
        return Err(Error::InvalidLength);
    }
    unwrap(kek, ciphertext, &mut key)?;
    Ok(AES128(key))
}
