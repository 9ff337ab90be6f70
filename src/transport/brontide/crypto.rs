//! secp256k1 helpers shared by the BOLT-8 handshake.

use k256::{elliptic_curve::sec1::ToEncodedPoint, ProjectivePoint, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use super::noise_machine::NoiseError;

/// Public key for `secret`.
#[must_use]
pub fn public_from_secret(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_scalar(&secret.to_nonzero_scalar())
}

/// Compressed SEC1 encoding (33 bytes).
#[must_use]
pub fn compressed(pk: &PublicKey) -> [u8; 33] {
    let encoded = pk.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// BOLT-8 ECDH: SHA256 of the compressed shared point.
///
/// # Errors
/// Returns `NoiseError::Crypto` if the product is the point at infinity.
pub fn ecdh(local: &SecretKey, remote: &PublicKey) -> Result<[u8; 32], NoiseError> {
    let scalar = local.to_nonzero_scalar();
    let shared = ProjectivePoint::from(*remote) * *scalar.as_ref();
    let shared = PublicKey::from_affine(shared.to_affine())
        .map_err(|_| NoiseError::Crypto("ECDH produced the identity point".into()))?;
    let digest = Sha256::digest(compressed(&shared));
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Fresh random ephemeral key pair.
#[must_use]
pub fn gen_ephemeral() -> SecretKey {
    SecretKey::random(&mut rand::thread_rng())
}
