//! QUIC header protection (RFC 9001 §5.4).
//!
//! `ring::aead::quic` already implements the exact sample → mask algorithm
//! the spec describes (AES-ECB of the sample for the AES suites, or
//! `ChaCha20(key, sample[0..4] as counter, sample[4..16] as nonce)` for
//! ChaCha20), so this is a thin wrapper that fixes the sample length and
//! applies the resulting 5-byte mask to the first byte and packet-number
//! bytes as §4.4 specifies.

use crate::crypto::aead::AeadAlgorithm;
use crate::error::WireError;
use ring::aead::quic;

pub struct HeaderProtectionKey {
    inner: quic::HeaderProtectionKey,
}

impl HeaderProtectionKey {
    pub fn new(algorithm: AeadAlgorithm, key_bytes: &[u8]) -> Result<Self, WireError> {
        let inner = quic::HeaderProtectionKey::new(algorithm.header_protection_algorithm(), key_bytes)
            .map_err(|_| WireError::ProtocolViolation("bad header protection key"))?;
        Ok(Self { inner })
    }

    pub fn sample_len(&self) -> usize {
        self.inner.algorithm().sample_len()
    }

    fn mask(&self, sample: &[u8]) -> Result<[u8; 5], WireError> {
        self.inner
            .new_mask(sample)
            .map_err(|_| WireError::ProtocolViolation("header protection sample too short"))
    }

    /// Applies protection to an outgoing header: `first_byte` already has
    /// the low bits it needs (the four OFF/LEN/FIN style bits have no
    /// business here — this is long/short header's packet-number-length
    /// field), `pn_bytes` is the already-encoded, truncated packet number.
    pub fn protect(
        &self,
        is_long_header: bool,
        first_byte: &mut u8,
        sample: &[u8],
        pn_bytes: &mut [u8],
    ) -> Result<(), WireError> {
        let mask = self.mask(sample)?;
        let bits_mask = if is_long_header { 0x0f } else { 0x1f };
        *first_byte ^= mask[0] & bits_mask;
        for (i, b) in pn_bytes.iter_mut().enumerate() {
            *b ^= mask[1 + i];
        }
        Ok(())
    }

    /// Removes protection. The caller must already know `pn_len` bytes
    /// follow the first byte (true after this same call unmasks the first
    /// byte's low bits) — so this is called twice in sequence by the packet
    /// codec: once to unmask the first byte, then again (or continued) to
    /// unmask the now-known-length packet number field. To keep the
    /// algorithm single-pass, callers pass the maximum possible 4-byte
    /// window and only the first `pn_len` unmasked bytes are meaningful.
    pub fn unprotect(
        &self,
        is_long_header: bool,
        first_byte: &mut u8,
        sample: &[u8],
        pn_bytes: &mut [u8],
    ) -> Result<(), WireError> {
        // XOR is its own inverse; protect and unprotect are identical.
        self.protect(is_long_header, first_byte, sample, pn_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_then_unprotect_round_trips() {
        let key_bytes = [3u8; 16];
        let hp = HeaderProtectionKey::new(AeadAlgorithm::Aes128Gcm, &key_bytes).unwrap();
        let sample = [5u8; 16];

        let mut first_byte = 0b1100_0011u8;
        let original_first_byte = first_byte;
        let mut pn_bytes = [1u8, 2, 3, 4];
        let original_pn = pn_bytes;

        hp.protect(true, &mut first_byte, &sample, &mut pn_bytes).unwrap();
        assert_ne!(first_byte & 0x0f, original_first_byte & 0x0f);
        assert_ne!(pn_bytes, original_pn);

        hp.unprotect(true, &mut first_byte, &sample, &mut pn_bytes).unwrap();
        assert_eq!(first_byte, original_first_byte);
        assert_eq!(pn_bytes, original_pn);
    }

    #[test]
    fn short_header_only_masks_five_bits() {
        let key_bytes = [9u8; 32];
        let hp = HeaderProtectionKey::new(AeadAlgorithm::ChaCha20Poly1305, &key_bytes).unwrap();
        let sample = [1u8; 16];
        let mut first_byte = 0xff;
        let mut pn_bytes = [0u8; 1];
        hp.protect(false, &mut first_byte, &sample, &mut pn_bytes).unwrap();
        // Top 3 bits (fixed bit, key phase, spin-independent reserved bits)
        // must never be touched by header protection on a short header.
        assert_eq!(first_byte & 0xe0, 0xe0);
    }
}
