//! Application-layer LoRaWAN payload handling: session keys, device
//! addressing, the FRMPayload stream cipher and the key wrap used to
//! protect session keys in transit.
#![cfg_attr(not(test), no_std)]
#![allow(clippy::upper_case_acronyms)]

pub mod crypto;
pub mod default_crypto;
pub mod kek;
pub mod keys;
pub mod types;

pub use crypto::{decrypt_frm_payload, encrypt_frm_payload, Direction};
pub use keys::{AppSKey, CryptoFactory, DevEui, AES128};
pub use types::{DevAddr, EUI64};
