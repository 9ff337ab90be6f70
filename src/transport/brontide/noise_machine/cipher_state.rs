use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;

use super::NoiseError;

/// BOLT-8 rotates each direction's key after this many messages.
pub const KEY_ROTATION_INTERVAL: u64 = 1000;

/// One direction of a BOLT-8 session: ChaCha20-Poly1305 keyed by `secret_key`, with the
/// chaining key kept as `salt` so the key can be rotated in place.
pub struct CipherState {
    pub(crate) nonce: u64,
    pub(crate) secret_key: [u8; 32],
    pub(crate) salt: [u8; 32],
    cipher: Option<ChaCha20Poly1305>,
}

impl Default for CipherState {
    fn default() -> Self {
        Self::new()
    }
}

impl CipherState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nonce: 0,
            secret_key: [0u8; 32],
            salt: [0u8; 32],
            cipher: None,
        }
    }

    pub fn initialize_key(&mut self, key: [u8; 32]) {
        self.secret_key = key;
        self.nonce = 0;
        self.cipher = Some(ChaCha20Poly1305::new(&Key::from(key)));
    }

    pub fn initialize_key_with_salt(&mut self, salt: [u8; 32], key: [u8; 32]) {
        self.salt = salt;
        self.initialize_key(key);
    }

    /// Encrypt `plaintext` under the current nonce with `associated_data` as AAD.
    ///
    /// # Errors
    /// Returns `NoiseError::InvalidState` if no key is set or `NoiseError::Crypto` if sealing fails.
    pub fn encrypt(
        &mut self,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let nonce = self.current_nonce();
        let cipher = self.cipher()?;
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|e| NoiseError::Crypto(format!("encrypt: {e}")))?;
        self.advance()?;
        Ok(ciphertext)
    }

    /// Decrypt and authenticate `ciphertext` under the current nonce.
    ///
    /// # Errors
    /// Returns `NoiseError::InvalidState` if no key is set or `NoiseError::Crypto` when the MAC
    /// does not verify.
    pub fn decrypt(
        &mut self,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, NoiseError> {
        let nonce = self.current_nonce();
        let cipher = self.cipher()?;
        let plaintext = cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| NoiseError::Crypto("message authentication failed".into()))?;
        self.advance()?;
        Ok(plaintext)
    }

    fn cipher(&self) -> Result<&ChaCha20Poly1305, NoiseError> {
        self.cipher
            .as_ref()
            .ok_or_else(|| NoiseError::InvalidState("cipher not initialized".into()))
    }

    // 32 zero bits followed by the little-endian 64-bit counter.
    fn current_nonce(&self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.nonce.to_le_bytes());
        Nonce::from(nonce)
    }

    fn advance(&mut self) -> Result<(), NoiseError> {
        self.nonce += 1;
        if self.nonce == KEY_ROTATION_INTERVAL {
            self.rotate_key()?;
        }
        Ok(())
    }

    fn rotate_key(&mut self) -> Result<(), NoiseError> {
        let (salt, key) = hkdf_split(&self.salt, &self.secret_key)?;
        self.initialize_key_with_salt(salt, key);
        Ok(())
    }
}

/// `HKDF-SHA256(salt, ikm)` expanded to 64 bytes and split into two 32-byte halves.
///
/// # Errors
/// Returns `NoiseError::Crypto` if the expansion fails.
pub fn hkdf_split(salt: &[u8; 32], ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), NoiseError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .map_err(|_| NoiseError::Crypto("hkdf expand failed".into()))?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}
