//! Provides a default software implementation for the AES primitives.
use super::keys::*;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use generic_array::GenericArray;

/// Provides a default implementation for build object for using the crypto functions.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct DefaultFactory;

impl CryptoFactory for DefaultFactory {
    type E = Aes128;
    type D = Aes128;

    fn new_enc(&self, key: &AES128) -> Self::E {
        Aes128::new(GenericArray::from_slice(&key.0[..]))
    }

    fn new_dec(&self, key: &AES128) -> Self::D {
        Aes128::new(GenericArray::from_slice(&key.0[..]))
    }
}

impl Encrypter for Aes128 {
    fn encrypt_block(&self, block: &mut [u8]) {
        BlockEncrypt::encrypt_block(self, GenericArray::from_mut_slice(block));
    }
}

impl Decrypter for Aes128 {
    fn decrypt_block(&self, block: &mut [u8]) {
        BlockDecrypt::decrypt_block(self, GenericArray::from_mut_slice(block));
    }
}
