//! HKDF-Extract / HKDF-Expand-Label (RFC 5869, RFC 8446 §7.1).
//!
//! Built directly on `ring::hkdf`; the only piece `ring` doesn't provide is
//! the TLS 1.3 `HkdfLabel` framing and an expand that accepts an arbitrary
//! output length, both implemented here.

use crate::error::WireError;
use ring::hkdf;

/// `ring::hkdf::Prk::expand` wants a `KeyType` to learn the output length;
/// this is that type, parameterised by whatever length the caller needs.
struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// `HKDF-Extract(salt, secret)`.
pub fn extract(algorithm: hkdf::Algorithm, salt: &[u8], secret: &[u8]) -> hkdf::Prk {
    hkdf::Salt::new(algorithm, salt).extract(secret)
}

/// A PRK built directly from raw key material (e.g. a TLS-exported secret),
/// skipping the extract step — used once handshake/application secrets
/// arrive pre-extracted from the TLS adapter (§4.3).
pub fn prk_from_secret(algorithm: hkdf::Algorithm, secret: &[u8]) -> hkdf::Prk {
    hkdf::Prk::new_less_safe(algorithm, secret)
}

/// `HKDF-Expand-Label(secret, label, "", length)` with the `"tls13 "` prefix
/// (RFC 9001 §5.1). QUIC never uses a non-empty context, so that field is
/// fixed at zero length.
pub fn expand_label(prk: &hkdf::Prk, label: &str, out: &mut [u8]) -> Result<(), WireError> {
    const LABEL_PREFIX: &[u8] = b"tls13 ";

    let full_label_len = LABEL_PREFIX.len() + label.len();
    if full_label_len > 255 || out.len() > u16::MAX as usize {
        return Err(WireError::ProtocolViolation("hkdf label too long"));
    }

    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [full_label_len as u8];
    let context_len = [0u8];

    let info: [&[u8]; 5] = [&out_len, &label_len, LABEL_PREFIX, label.as_bytes(), &context_len];

    prk.expand(&info, OutputLen(out.len()))
        .map_err(|_| WireError::ProtocolViolation("hkdf expand failed"))?
        .fill(out)
        .map_err(|_| WireError::ProtocolViolation("hkdf fill failed"))
}

/// Convenience: expand a label straight into a freshly allocated `Vec`.
pub fn expand_label_vec(prk: &hkdf::Prk, label: &str, len: usize) -> Result<Vec<u8>, WireError> {
    let mut out = vec![0u8; len];
    expand_label(prk, label, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_label_matches_rfc9001_appendix_a1_client_key() {
        // Client initial secret from RFC 9001 Appendix A.1, expanded with
        // label "quic key" must produce the documented 16-byte AES-128 key.
        let secret =
            hex::decode("c00cf151ca5be075ed0ebfb5c0ff f2b7ebb7b7e1f09b7a0d46b3a2d29d71a5f".replace(' ', ""))
                .unwrap();
        let prk = prk_from_secret(hkdf::HKDF_SHA256, &secret);
        let key = expand_label_vec(&prk, "quic key", 16).unwrap();
        assert_eq!(key, hex::decode("1f369613dd76d5467730efcbe3b1a22d").unwrap());
    }

    #[test]
    fn expand_label_matches_rfc9001_appendix_a1_client_iv() {
        let secret =
            hex::decode("c00cf151ca5be075ed0ebfb5c0ff f2b7ebb7b7e1f09b7a0d46b3a2d29d71a5f".replace(' ', ""))
                .unwrap();
        let prk = prk_from_secret(hkdf::HKDF_SHA256, &secret);
        let iv = expand_label_vec(&prk, "quic iv", 12).unwrap();
        assert_eq!(iv, hex::decode("fa044b2f42a3fd3b46fb255c").unwrap());
    }
}
