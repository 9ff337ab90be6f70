use sha2::{Digest, Sha256};

use super::{
    cipher_state::{hkdf_split, CipherState},
    NoiseError,
};

/// Handshake transcript: chaining key `ck`, handshake hash `h` and the cipher that seals act
/// payloads under the current temporary key.
pub struct SymmetricState {
    pub(crate) cipher_state: CipherState,
    pub(crate) chaining_key: [u8; 32],
    pub(crate) handshake_digest: [u8; 32],
}

impl SymmetricState {
    /// Start a transcript for `protocol_name`: `h = ck = SHA256(protocol_name)`, then absorb
    /// the prologue into `h`.
    #[must_use]
    pub fn start(protocol_name: &str, prologue: &[u8]) -> Self {
        let seed: [u8; 32] = Sha256::digest(protocol_name.as_bytes()).into();
        let mut cipher_state = CipherState::new();
        cipher_state.initialize_key([0u8; 32]);
        let mut state = Self {
            cipher_state,
            chaining_key: seed,
            handshake_digest: seed,
        };
        state.mix_hash(prologue);
        state
    }

    /// `h = SHA256(h || data)`.
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.handshake_digest = Sha256::new()
            .chain_update(self.handshake_digest)
            .chain_update(data)
            .finalize()
            .into();
    }

    /// `ck, temp_k = HKDF(ck, input)`; the act cipher restarts at nonce zero under `temp_k`.
    ///
    /// # Errors
    /// Returns `NoiseError::Crypto` if HKDF expansion fails.
    pub fn mix_key(&mut self, input: &[u8]) -> Result<(), NoiseError> {
        let (chaining_key, temp_key) = hkdf_split(&self.chaining_key, input)?;
        self.chaining_key = chaining_key;
        self.cipher_state.initialize_key(temp_key);
        Ok(())
    }

    /// Seal under `h` as associated data and absorb the result.
    ///
    /// # Errors
    /// Propagates cipher failures.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let sealed = self.cipher_state.encrypt(&self.handshake_digest, plaintext)?;
        self.mix_hash(&sealed);
        Ok(sealed)
    }

    /// Open under `h` as associated data and absorb the ciphertext.
    ///
    /// # Errors
    /// Returns `NoiseError::Crypto` when the tag does not verify.
    pub fn decrypt_and_hash(&mut self, sealed: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let opened = self.cipher_state.decrypt(&self.handshake_digest, sealed)?;
        self.mix_hash(sealed);
        Ok(opened)
    }

    /// Final split: `sk, rk = HKDF(ck, zero-length)`.
    ///
    /// # Errors
    /// Returns `NoiseError::Crypto` if HKDF expansion fails.
    pub fn split(&self) -> Result<([u8; 32], [u8; 32]), NoiseError> {
        hkdf_split(&self.chaining_key, &[])
    }
}
