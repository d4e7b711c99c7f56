// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Hybrid encryption of point-to-point payloads under a peer's identity key.
//!
//! An ephemeral secp256k1 Diffie-Hellman exchange produces a shared point;
//! HKDF-SHA256 turns it into a one-time AES-256-GCM key. Used for the
//! encrypted Shamir shares in round three of key generation.

use crate::{
    errors::{DkgError, InternalError, Result},
    utils::{random_nonzero_scalar, CurvePoint},
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use k256::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

const KEY_INFO: &[u8] = b"CLIRift hybrid share encryption v1";

/// A node's long-lived identity keypair, used by peers to encrypt shares to
/// it.
#[derive(Clone)]
pub struct IdentityKeypair {
    secret: Scalar,
    public: CurvePoint,
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("secret", &"[redacted]")
            .field("public", &self.public)
            .finish()
    }
}

impl Drop for IdentityKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl IdentityKeypair {
    /// Generate a fresh identity keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self> {
        let secret = random_nonzero_scalar(rng)?;
        let public = CurvePoint::GENERATOR.multiply_by_scalar(&secret);
        Ok(Self { secret, public })
    }

    /// The public half, shared with peers out of band.
    pub fn public(&self) -> CurvePoint {
        self.public
    }
}

/// An encrypted point-to-point payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HybridCiphertext {
    ephemeral: CurvePoint,
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` so only the holder of `recipient`'s identity secret
/// can read it.
pub(crate) fn encrypt<R: RngCore + CryptoRng>(
    rng: &mut R,
    recipient: &CurvePoint,
    plaintext: &[u8],
) -> Result<HybridCiphertext> {
    if recipient.is_identity() {
        return Err(InternalError::InternalInvariantFailed);
    }

    let mut ephemeral_secret = random_nonzero_scalar(rng)?;
    let ephemeral = CurvePoint::GENERATOR.multiply_by_scalar(&ephemeral_secret);
    let shared = recipient.multiply_by_scalar(&ephemeral_secret);
    ephemeral_secret.zeroize();

    let key = derive_key(&shared)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|_| InternalError::InternalInvariantFailed)?;

    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| InternalError::InternalInvariantFailed)?;

    Ok(HybridCiphertext {
        ephemeral,
        nonce,
        ciphertext,
    })
}

/// Decrypt a payload addressed to this identity.
pub(crate) fn decrypt(
    identity: &IdentityKeypair,
    encrypted: &HybridCiphertext,
) -> Result<Zeroizing<Vec<u8>>> {
    let shared = encrypted.ephemeral.multiply_by_scalar(&identity.secret);
    let key = derive_key(&shared)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|_| InternalError::InternalInvariantFailed)?;

    cipher
        .decrypt(
            Nonce::from_slice(&encrypted.nonce),
            encrypted.ciphertext.as_slice(),
        )
        .map(Zeroizing::new)
        .map_err(|_| DkgError::ShareDecryptionFailed.into())
}

fn derive_key(shared: &CurvePoint) -> Result<Zeroizing<[u8; 32]>> {
    let mut ikm = shared.to_compressed_bytes();
    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(KEY_INFO, key.as_mut())
        .map_err(|_| InternalError::InternalInvariantFailed)?;
    ikm.zeroize();
    Ok(key)
}
