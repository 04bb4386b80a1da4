//! AEAD packet protection (RFC 9001 §5.3) over AES-128/256-GCM and
//! ChaCha20-Poly1305 (RFC 8439), backed by `ring`.

use crate::error::WireError;
use ring::aead;
use ring::hkdf;

/// The three AEAD algorithms QUIC v1/v2 negotiate via the TLS cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    pub fn key_len(self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm => 16,
            AeadAlgorithm::Aes256Gcm => 32,
            AeadAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    pub const IV_LEN: usize = 12;
    pub const TAG_LEN: usize = 16;

    pub fn digest(self) -> hkdf::Algorithm {
        match self {
            AeadAlgorithm::Aes128Gcm => hkdf::HKDF_SHA256,
            AeadAlgorithm::Aes256Gcm => hkdf::HKDF_SHA384,
            AeadAlgorithm::ChaCha20Poly1305 => hkdf::HKDF_SHA256,
        }
    }

    fn ring_algorithm(self) -> &'static aead::Algorithm {
        match self {
            AeadAlgorithm::Aes128Gcm => &aead::AES_128_GCM,
            AeadAlgorithm::Aes256Gcm => &aead::AES_256_GCM,
            AeadAlgorithm::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    pub(crate) fn header_protection_algorithm(self) -> &'static aead::quic::Algorithm {
        match self {
            AeadAlgorithm::Aes128Gcm => &aead::quic::AES_128,
            AeadAlgorithm::Aes256Gcm => &aead::quic::AES_256,
            AeadAlgorithm::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }
}

/// One direction's packet-protection key: the AEAD key plus its IV. Owned by
/// a single encryption level in [`crate::crypto::KeySchedule`].
pub struct PacketKey {
    algorithm: AeadAlgorithm,
    key: aead::LessSafeKey,
    iv: [u8; AeadAlgorithm::IV_LEN],
}

impl PacketKey {
    pub fn new(algorithm: AeadAlgorithm, key_bytes: &[u8], iv: &[u8]) -> Result<Self, WireError> {
        if key_bytes.len() != algorithm.key_len() || iv.len() != AeadAlgorithm::IV_LEN {
            return Err(WireError::ProtocolViolation("bad AEAD key/iv length"));
        }
        let unbound = aead::UnboundKey::new(algorithm.ring_algorithm(), key_bytes)
            .map_err(|_| WireError::ProtocolViolation("bad AEAD key"))?;
        let mut iv_arr = [0u8; AeadAlgorithm::IV_LEN];
        iv_arr.copy_from_slice(iv);
        Ok(Self { algorithm, key: aead::LessSafeKey::new(unbound), iv: iv_arr })
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    /// §4.4: nonce = iv XOR (packet number, big-endian, right-aligned).
    fn nonce_for(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        let pn_bytes = packet_number.to_be_bytes();
        for (byte, pn_byte) in nonce.iter_mut().rev().zip(pn_bytes.iter().rev()) {
            *byte ^= pn_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypts `payload` in place using `header` as AAD, appending the
    /// 16-byte tag. Returns the combined ciphertext length.
    pub fn seal(&self, packet_number: u64, header: &[u8], payload: &mut Vec<u8>) -> Result<(), WireError> {
        let nonce = self.nonce_for(packet_number);
        self.key
            .seal_in_place_append_tag(nonce, aead::Aad::from(header), payload)
            .map_err(|_| WireError::AeadFailure)
    }

    /// Decrypts `buf` (ciphertext || tag) in place using `header` as AAD.
    /// Returns the plaintext slice; never mutates connection state on
    /// failure beyond the buffer itself (§4.4, §7b).
    pub fn open<'a>(
        &self,
        packet_number: u64,
        header: &[u8],
        buf: &'a mut [u8],
    ) -> Result<&'a [u8], WireError> {
        let nonce = self.nonce_for(packet_number);
        self.key
            .open_in_place(nonce, aead::Aad::from(header), buf)
            .map(|s| &*s)
            .map_err(|_| WireError::AeadFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_aes128gcm() {
        let key = [7u8; 16];
        let iv = [9u8; 12];
        let k = PacketKey::new(AeadAlgorithm::Aes128Gcm, &key, &iv).unwrap();
        let header = b"header-as-aad";
        let mut buf = b"hello quic".to_vec();
        k.seal(42, header, &mut buf).unwrap();
        let opened = k.open(42, header, &mut buf).unwrap();
        assert_eq!(opened, b"hello quic");
    }

    #[test]
    fn bit_flip_in_ciphertext_fails() {
        let key = [1u8; 32];
        let iv = [2u8; 12];
        let k = PacketKey::new(AeadAlgorithm::ChaCha20Poly1305, &key, &iv).unwrap();
        let header = b"aad";
        let mut buf = b"payload-bytes".to_vec();
        k.seal(1, header, &mut buf).unwrap();
        buf[0] ^= 1;
        assert_eq!(k.open(1, header, &mut buf), Err(WireError::AeadFailure));
    }

    #[test]
    fn bit_flip_in_aad_fails() {
        let key = [1u8; 16];
        let iv = [2u8; 12];
        let k = PacketKey::new(AeadAlgorithm::Aes128Gcm, &key, &iv).unwrap();
        let mut buf = b"payload-bytes".to_vec();
        k.seal(5, b"aad-one", &mut buf).unwrap();
        assert_eq!(k.open(5, b"aad-two", &mut buf), Err(WireError::AeadFailure));
    }

    #[test]
    fn bit_flip_in_tag_fails() {
        let key = [1u8; 16];
        let iv = [2u8; 12];
        let k = PacketKey::new(AeadAlgorithm::Aes128Gcm, &key, &iv).unwrap();
        let mut buf = b"payload-bytes".to_vec();
        k.seal(5, b"aad", &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 1;
        assert_eq!(k.open(5, b"aad", &mut buf), Err(WireError::AeadFailure));
    }
}
