//! FRMPayload encryption as defined by LoRaWAN 1.0, section 4.3.3.
//!
//! The payload is XORed with a key stream of AES-encrypted counter
//! blocks, so applying the same operation twice restores the input.
use crate::default_crypto::DefaultFactory;
use crate::keys::{AES128, CryptoFactory, Encrypter};
use crate::types::DevAddr;

/// Direction of the frame carrying the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn byte(self) -> u8 {
        match self {
            Direction::Up => 0,
            Direction::Down => 1,
        }
    }
}

/// Applies the FRMPayload key stream in place.
///
/// The same key stream both encrypts and decrypts; callers pick the
/// name that states their intent.
pub fn apply_frm_payload(
    enc: &dyn Encrypter,
    dev_addr: DevAddr,
    fcnt: u32,
    direction: Direction,
    payload: &mut [u8],
) {
    let mut a = [0u8; 16];
    a[0] = 0x01;
    // a[1..5] are 0
    a[5] = direction.byte();
    // DevAddr and FCnt travel least significant byte first
    a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());
    // a[14] is 0; a[15] is the block counter

    let mut s = [0u8; 16];
    let mut ctr = 1u8;
    for i in 0..payload.len() {
        let j = i & 0x0f;
        if j == 0 {
            a[15] = ctr;
            ctr = ctr.wrapping_add(1);
            s.copy_from_slice(&a);
            enc.encrypt_block(&mut s);
        }
        payload[i] ^= s[j];
    }
}

/// Encrypts an FRMPayload in place with the given application session key.
pub fn encrypt_frm_payload(
    key: &AES128,
    dev_addr: DevAddr,
    fcnt: u32,
    direction: Direction,
    payload: &mut [u8],
) {
    let enc = DefaultFactory.new_enc(key);
    apply_frm_payload(&enc, dev_addr, fcnt, direction, payload);
}

/// Decrypts an FRMPayload in place with the given application session key.
pub fn decrypt_frm_payload(
    key: &AES128,
    dev_addr: DevAddr,
    fcnt: u32,
    direction: Direction,
    payload: &mut [u8],
) {
    encrypt_frm_payload(key, dev_addr, fcnt, direction, payload);
}
