//! Cryptographic primitives (C2) and key schedule (C3).
//!
//! Primitives are thin, verified-library-backed wrappers: HKDF and AEAD come
//! from `ring`, header protection uses `ring::aead::quic` directly since it
//! implements exactly the RFC 9001 §5.4 sampling/masking algorithm for both
//! the AES and ChaCha20 cases. The key schedule (initial secrets, the
//! per-level key derivation, and key updates) is ours, built on top of those
//! primitives, and is exercised end-to-end by the RFC 9001 Appendix A.1 test
//! vector in [`keys`].

pub mod aead;
pub mod header_protection;
pub mod hkdf;
pub mod keys;

pub use aead::{AeadAlgorithm, PacketKey};
pub use header_protection::HeaderProtectionKey;
pub use keys::{InitialSecrets, KeySchedule, Level};

/// QUIC wire versions this crate negotiates, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    pub const V1_NUMBER: u32 = 0x0000_0001;
    pub const V2_NUMBER: u32 = 0x6b33_43cf;

    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            Self::V1_NUMBER => Some(Version::V1),
            Self::V2_NUMBER => Some(Version::V2),
            _ => None,
        }
    }

    pub fn wire(self) -> u32 {
        match self {
            Version::V1 => Self::V1_NUMBER,
            Version::V2 => Self::V2_NUMBER,
        }
    }

    /// RFC 9001 §5.2 / RFC 9369 §3.3.2 version-specific initial salt.
    fn initial_salt(self) -> &'static [u8; 20] {
        match self {
            Version::V1 => &[
                0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4,
                0xc8, 0x0c, 0xad, 0xcc, 0xbb, 0x7f, 0x0a,
            ],
            Version::V2 => &[
                0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e,
                0x26, 0x9d, 0xcb, 0xf9, 0xbd, 0x2e, 0xd9,
            ],
        }
    }

    /// RFC 9001 §5.8 / RFC 9369 §3.3.3 Retry integrity key and nonce.
    pub fn retry_key_and_nonce(self) -> (&'static [u8; 16], &'static [u8; 12]) {
        match self {
            Version::V1 => (
                &[
                    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3,
                    0x68, 0xc8, 0x4e,
                ],
                &[0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb],
            ),
            Version::V2 => (
                &[
                    0x8f, 0xb4, 0xb0, 0x1b, 0x56, 0xac, 0x48, 0xe2, 0x60, 0xfb, 0xcb, 0xce, 0xad,
                    0x7c, 0xcc, 0x92,
                ],
                &[0xd8, 0x69, 0x69, 0xbc, 0x2d, 0x7c, 0x6d, 0x99, 0x90, 0xef, 0xb0, 0x4a],
            ),
        }
    }

    /// RFC 9369 §3.3 uses a different KEY_UPDATE label and different frame
    /// type codepoints for a handful of frames; §6 of the spec scopes that
    /// down to "v1/v2" transport and the key schedule is the only piece that
    /// differs between the two in this crate, via [`Self::hkdf_labels`].
    pub fn hkdf_labels(self) -> HkdfLabels {
        match self {
            Version::V1 => HkdfLabels {
                client_in: "client in",
                server_in: "server in",
                key: "quic key",
                iv: "quic iv",
                hp: "quic hp",
                ku: "quic ku",
            },
            // RFC 9369 §3.3.1: labels are renamed but play the same role.
            Version::V2 => HkdfLabels {
                client_in: "client in",
                server_in: "server in",
                key: "quicv2 key",
                iv: "quicv2 iv",
                hp: "quicv2 hp",
                ku: "quicv2 ku",
            },
        }
    }
}

pub struct HkdfLabels {
    pub client_in: &'static str,
    pub server_in: &'static str,
    pub key: &'static str,
    pub iv: &'static str,
    pub hp: &'static str,
    pub ku: &'static str,
}
