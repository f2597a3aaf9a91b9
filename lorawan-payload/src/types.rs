//! Fixed-size wire types shared between the server and its peers.

macro_rules! fixed_len_struct {
    (
        $(#[$outer:meta])*
        pub struct $type:ident[$size:expr];
    ) => {
        $(#[$outer])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $type([u8; $size]);

        impl $type {
            pub const fn new(bytes: [u8; $size]) -> Self {
                $type(bytes)
            }

            /// Constructs the value from a slice of exactly the right length.
            pub fn from_slice(data: &[u8]) -> Option<Self> {
                let mut bytes = [0u8; $size];
                if data.len() != $size {
                    return None;
                }
                bytes.copy_from_slice(data);
                Some($type(bytes))
            }
        }

        impl From<[u8; $size]> for $type {
            fn from(v: [u8; $size]) -> Self {
                $type(v)
            }
        }

        impl From<$type> for [u8; $size] {
            fn from(v: $type) -> Self {
                v.0
            }
        }

        impl AsRef<[u8]> for $type {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl core::fmt::Display for $type {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
        }
    };
}

fixed_len_struct! {
    /// EUI64 represents a 64-bit extended unique identifier.
    pub struct EUI64[8];
}

fixed_len_struct! {
    /// DevAddr represents a 32-bit device address.
    pub struct DevAddr[4];
}

impl DevAddr {
    pub fn nwk_id(&self) -> u8 {
        self.0[0] >> 1
    }

    /// The address in transmission order, least significant byte first.
    pub fn to_le_bytes(self) -> [u8; 4] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl From<DevAddr> for u32 {
    fn from(v: DevAddr) -> Self {
        u32::from_be_bytes(v.0)
    }
}

impl From<u32> for DevAddr {
    fn from(v: u32) -> Self {
        Self::new(v.to_be_bytes())
    }
}
