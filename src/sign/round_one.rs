// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round one of the signing session: nonce commitments and Paillier setup.

use crate::{
    errors::{Result, SigningError},
    messages::{Message, MessageType, SignMessageType},
    paillier::{validate_modulus, PaillierCiphertext, PaillierDecryptionKey},
    protocol::Identifier,
    schnorr::{SchnorrContext, SchnorrProof},
    utils::CurvePoint,
};
use k256::Scalar;
use libpaillier::unknown_order::BigNumber;
use serde::{Deserialize, Serialize};
use tracing::error;
use zeroize::Zeroize;

/// This signer's round one secrets: the nonces and the session Paillier
/// decryption key. Lives only in the session and is destroyed with it.
pub(crate) struct Private {
    pub(crate) k: Scalar,
    pub(crate) gamma: Scalar,
    pub(crate) paillier_sk: PaillierDecryptionKey,
}

impl std::fmt::Debug for Private {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("sign::round_one::Private")
            .field("k", &"[redacted]")
            .field("gamma", &"[redacted]")
            .field("paillier_sk", &"[redacted]")
            .finish()
    }
}

impl Drop for Private {
    fn drop(&mut self) {
        self.k.zeroize();
        self.gamma.zeroize();
    }
}

/// The broadcast half of round one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Public {
    pub(crate) party_index: u32,
    /// `gamma_i * G`.
    pub(crate) gamma_commitment: CurvePoint,
    /// `k_i * G`, consumed again in round four's partial-signature check.
    pub(crate) nonce_commitment: CurvePoint,
    /// The sender's fresh session modulus `N_i`.
    pub(crate) modulus: BigNumber,
    /// `Enc_{N_i}(k_i)`.
    pub(crate) nonce_ciphertext: PaillierCiphertext,
    pub(crate) gamma_proof: SchnorrProof,
    pub(crate) nonce_proof: SchnorrProof,
}

impl Public {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Sign(SignMessageType::R1Commit))?;
        deserialize!(&message.unverified_bytes)
    }

    /// Validate a peer's round one broadcast: the modulus, the ciphertext
    /// range, and both proofs of knowledge under their session-bound
    /// contexts.
    pub(crate) fn verify(&self, session: Identifier, expected_party_index: u32) -> Result<()> {
        if self.party_index != expected_party_index {
            error!("round one broadcast declares the wrong party index");
            Err(SigningError::InvalidPeerModulus)?;
        }

        validate_modulus(&self.modulus)?;

        let modulus_squared = &self.modulus * &self.modulus;
        if self.nonce_ciphertext.0 < BigNumber::one() || self.nonce_ciphertext.0 >= modulus_squared
        {
            Err(SigningError::CiphertextOutOfRange)?;
        }

        if !self
            .gamma_proof
            .verify(&self.gamma_commitment, &SchnorrContext::sign_gamma(session))
        {
            error!("gamma proof of knowledge failed for party {}", self.party_index);
            Err(SigningError::InvalidProofOfKnowledge)?;
        }
        if !self
            .nonce_proof
            .verify(&self.nonce_commitment, &SchnorrContext::sign_nonce(session))
        {
            error!("nonce proof of knowledge failed for party {}", self.party_index);
            Err(SigningError::InvalidProofOfKnowledge)?;
        }
        Ok(())
    }
}
