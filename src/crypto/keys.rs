//! Key schedule (C3): initial secrets, per-level key derivation, and
//! application-level key update.

use crate::crypto::aead::{AeadAlgorithm, PacketKey};
use crate::crypto::header_protection::HeaderProtectionKey;
use crate::crypto::hkdf;
use crate::crypto::{HkdfLabels, Version};
use crate::error::WireError;

/// The three encryption levels a connection carries keys for, plus the
/// 0-RTT level read-only clients receive when resuming (kept in the same
/// slot as Application's "early" keys are never used for 0-RTT serving in
/// this client-only implementation, matching the Non-goals in §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Initial,
    Handshake,
    Application,
}

/// One direction's packet + header protection key pair.
pub struct DirectionalKeys {
    pub packet: PacketKey,
    pub header: HeaderProtectionKey,
}

impl DirectionalKeys {
    fn derive(algorithm: AeadAlgorithm, labels: &HkdfLabels, secret: &[u8]) -> Result<Self, WireError> {
        let prk = hkdf::prk_from_secret(algorithm.digest(), secret);
        let key = hkdf::expand_label_vec(&prk, labels.key, algorithm.key_len())?;
        let iv = hkdf::expand_label_vec(&prk, labels.iv, AeadAlgorithm::IV_LEN)?;
        let hp = hkdf::expand_label_vec(&prk, labels.hp, algorithm.key_len())?;
        Ok(Self {
            packet: PacketKey::new(algorithm, &key, &iv)?,
            header: HeaderProtectionKey::new(algorithm, &hp)?,
        })
    }
}

/// Client-write and server-write keys for one encryption level.
pub struct LevelKeys {
    pub client: DirectionalKeys,
    pub server: DirectionalKeys,
}

impl LevelKeys {
    fn derive(
        algorithm: AeadAlgorithm,
        labels: &HkdfLabels,
        client_secret: &[u8],
        server_secret: &[u8],
    ) -> Result<Self, WireError> {
        Ok(Self {
            client: DirectionalKeys::derive(algorithm, labels, client_secret)?,
            server: DirectionalKeys::derive(algorithm, labels, server_secret)?,
        })
    }
}

/// Client/server initial secrets, derived from the client-chosen
/// destination connection ID per RFC 9001 §5.2 / RFC 9369 §3.3.1.
pub struct InitialSecrets {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

impl InitialSecrets {
    pub fn derive(version: Version, dcid: &[u8]) -> Self {
        let salt = version.initial_salt();
        let initial_secret = hkdf::extract(ring::hkdf::HKDF_SHA256, salt, dcid);
        let labels = version.hkdf_labels();
        let client = hkdf::expand_label_vec(&initial_secret, labels.client_in, 32)
            .expect("32-byte SHA-256 output always fits");
        let server = hkdf::expand_label_vec(&initial_secret, labels.server_in, 32)
            .expect("32-byte SHA-256 output always fits");
        Self { client, server }
    }
}

/// Owns the keys for every encryption level of one connection. A lower
/// level's keys are dropped as soon as the next level installs (§3
/// invariant); `application` additionally tracks one prior key-update
/// generation so reordered packets can still be decrypted.
pub struct KeySchedule {
    version: Version,
    algorithm: AeadAlgorithm,
    initial: Option<LevelKeys>,
    handshake: Option<LevelKeys>,
    application: Option<ApplicationKeys>,
}

impl KeySchedule {
    pub fn new(version: Version, algorithm: AeadAlgorithm) -> Self {
        Self { version, algorithm, initial: None, handshake: None, application: None }
    }

    /// Installs Initial keys from the client-chosen destination CID. Called
    /// once, as soon as the client knows what DCID it is using (§4.3).
    pub fn install_initial(&mut self, dcid: &[u8]) -> Result<(), WireError> {
        let secrets = InitialSecrets::derive(self.version, dcid);
        let labels = self.version.hkdf_labels();
        self.initial = Some(LevelKeys::derive(
            AeadAlgorithm::Aes128Gcm,
            &labels,
            &secrets.client,
            &secrets.server,
        )?);
        Ok(())
    }

    /// Installs Handshake keys from TLS-exported traffic secrets and drops
    /// Initial keys (§3 invariant: a lower level's keys are discarded once
    /// the next level installs). The caller (the TLS adapter, C13) is
    /// responsible for calling this only once both secrets are available.
    pub fn install_handshake(&mut self, client_secret: &[u8], server_secret: &[u8]) -> Result<(), WireError> {
        let labels = self.version.hkdf_labels();
        self.handshake =
            Some(LevelKeys::derive(self.algorithm, &labels, client_secret, server_secret)?);
        self.initial = None;
        Ok(())
    }

    /// Installs the first generation of Application keys and drops
    /// Handshake keys.
    pub fn install_application(&mut self, client_secret: &[u8], server_secret: &[u8]) -> Result<(), WireError> {
        self.application = Some(ApplicationKeys::new(
            self.version,
            self.algorithm,
            client_secret.to_vec(),
            server_secret.to_vec(),
        )?);
        self.handshake = None;
        Ok(())
    }

    pub fn level(&self, level: Level) -> Option<&LevelKeys> {
        match level {
            Level::Initial => self.initial.as_ref(),
            Level::Handshake => self.handshake.as_ref(),
            Level::Application => self.application.as_ref().map(|a| &a.current),
        }
    }

    pub fn application_mut(&mut self) -> Option<&mut ApplicationKeys> {
        self.application.as_mut()
    }

    pub fn application(&self) -> Option<&ApplicationKeys> {
        self.application.as_ref()
    }
}

/// Application-level keys with one-generation key-update support (§4.3).
pub struct ApplicationKeys {
    version: Version,
    algorithm: AeadAlgorithm,
    client_secret: Vec<u8>,
    server_secret: Vec<u8>,
    /// Key-phase bit carried by `current`'s packets.
    current_phase: bool,
    current: LevelKeys,
    /// Previous generation, retained only long enough to decrypt packets
    /// that were reordered across the update; never used to encrypt.
    previous: Option<(bool, LevelKeys)>,
}

impl ApplicationKeys {
    fn new(
        version: Version,
        algorithm: AeadAlgorithm,
        client_secret: Vec<u8>,
        server_secret: Vec<u8>,
    ) -> Result<Self, WireError> {
        let labels = version.hkdf_labels();
        let current = LevelKeys::derive(algorithm, &labels, &client_secret, &server_secret)?;
        Ok(Self {
            version,
            algorithm,
            client_secret,
            server_secret,
            current_phase: false,
            current,
            previous: None,
        })
    }

    pub fn current(&self) -> &LevelKeys {
        &self.current
    }

    pub fn current_phase(&self) -> bool {
        self.current_phase
    }

    /// Returns keys able to decrypt a packet whose header carries
    /// `phase`: the current generation if it matches, otherwise the
    /// retained previous generation if one exists and matches.
    pub fn keys_for_phase(&self, phase: bool) -> Option<&LevelKeys> {
        if phase == self.current_phase {
            Some(&self.current)
        } else {
            self.previous.as_ref().filter(|(p, _)| *p == phase).map(|(_, k)| k)
        }
    }

    /// Derives and installs the next generation via the `quic ku` label
    /// (RFC 9001 §6), keeping the outgoing generation as `previous` so
    /// packets sent just before the flip can still be decrypted once their
    /// ACKs arrive out of order.
    pub fn update(&mut self) -> Result<(), WireError> {
        let labels = self.version.hkdf_labels();
        let client_prk = hkdf::prk_from_secret(self.algorithm.digest(), &self.client_secret);
        let server_prk = hkdf::prk_from_secret(self.algorithm.digest(), &self.server_secret);
        let next_client = hkdf::expand_label_vec(&client_prk, labels.ku, self.client_secret.len())?;
        let next_server = hkdf::expand_label_vec(&server_prk, labels.ku, self.server_secret.len())?;
        let next = LevelKeys::derive(self.algorithm, &labels, &next_client, &next_server)?;

        let old_phase = self.current_phase;
        let old_keys = std::mem::replace(&mut self.current, next);
        self.previous = Some((old_phase, old_keys));
        self.current_phase = !old_phase;
        self.client_secret = next_client;
        self.server_secret = next_server;
        Ok(())
    }

    /// Drops the retained previous generation once one RTT has elapsed
    /// since the update, per §4.3.
    pub fn drop_previous(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc9001_appendix_a1_initial_secrets() {
        let dcid = hex::decode("8394c8f03e515708").unwrap();
        let secrets = InitialSecrets::derive(Version::V1, &dcid);
        assert_eq!(
            secrets.client,
            hex::decode("c00cf151ca5be075ed0ebfb5c0fff2b7ebb7b7e1f09b7a0d46b3a2d29d71a5f").unwrap()
        );
    }

    #[test]
    fn rfc9001_appendix_a1_client_packet_keys() {
        let dcid = hex::decode("8394c8f03e515708").unwrap();
        let secrets = InitialSecrets::derive(Version::V1, &dcid);
        let labels = Version::V1.hkdf_labels();
        let prk = hkdf::prk_from_secret(AeadAlgorithm::Aes128Gcm.digest(), &secrets.client);
        let key = hkdf::expand_label_vec(&prk, labels.key, 16).unwrap();
        let iv = hkdf::expand_label_vec(&prk, labels.iv, 12).unwrap();
        assert_eq!(key, hex::decode("1f369613dd76d5467730efcbe3b1a22d").unwrap());
        assert_eq!(iv, hex::decode("fa044b2f42a3fd3b46fb255c").unwrap());
    }

    #[test]
    fn key_update_keeps_previous_generation_decryptable() {
        let mut app = ApplicationKeys::new(Version::V1, AeadAlgorithm::Aes128Gcm, vec![1u8; 32], vec![2u8; 32])
            .unwrap();
        let header = b"short-header";
        let mut buf = b"reordered packet".to_vec();
        app.current().client.packet.seal(7, header, &mut buf).unwrap();
        let old_phase = app.current_phase();

        app.update().unwrap();
        assert_ne!(app.current_phase(), old_phase);

        // A packet protected before the update, arriving after, must still
        // decrypt against the retained previous generation.
        let keys = app.keys_for_phase(old_phase).expect("previous generation retained");
        let opened = keys.client.packet.open(7, header, &mut buf).unwrap();
        assert_eq!(opened, b"reordered packet");

        app.drop_previous();
        assert!(app.keys_for_phase(old_phase).is_none());
    }
}
