// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A non-interactive Schnorr proof of knowledge of discrete logarithm.
//!
//! Proves knowledge of `x` such that `x * G = P`, Fiat-Shamir transformed
//! over a transcript that binds a caller-supplied context. The context must
//! uniquely identify the call site; reuse across purposes is a security bug,
//! so constructors exist only for the contexts the protocols actually use.

use crate::{
    errors::Result,
    protocol::Identifier,
    utils::{challenge_scalar, random_nonzero_scalar, CurvePoint},
};
use k256::{elliptic_curve::Field, Scalar};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Domain separation for a [`SchnorrProof`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SchnorrContext(Vec<u8>);

impl SchnorrContext {
    /// Context for a party's intercept proof in a key generation ceremony.
    pub(crate) fn dkg_party(ceremony: Identifier, party_index: u32) -> Self {
        Self(format!("DKG-{}-party-{}", ceremony.as_hex(), party_index).into_bytes())
    }

    /// Context for the `gamma` nonce proof in a signing session.
    pub(crate) fn sign_gamma(session: Identifier) -> Self {
        Self(format!("GG20-GAMMA-{}", session.as_hex()).into_bytes())
    }

    /// Context for the `k` nonce proof in a signing session.
    pub(crate) fn sign_nonce(session: Identifier) -> Self {
        Self(format!("GG20-KI-{}", session.as_hex()).into_bytes())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Proof of knowledge of the discrete logarithm of a group element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SchnorrProof {
    /// Commitment to the proof mask (`R = k * G`).
    commitment: CurvePoint,
    /// Response binding the mask, challenge, and secret (`s = k + e * x`).
    response: Scalar,
}

impl SchnorrProof {
    /// Prove knowledge of `secret` where `public = secret * G`.
    pub(crate) fn prove<R: RngCore + CryptoRng>(
        secret: &Scalar,
        public: &CurvePoint,
        context: &SchnorrContext,
        rng: &mut R,
    ) -> Result<Self> {
        let mask = random_nonzero_scalar(rng)?;
        let commitment = CurvePoint::GENERATOR.multiply_by_scalar(&mask);
        let challenge = Self::challenge(public, &commitment, context);
        let response = mask + challenge * secret;
        Ok(Self {
            commitment,
            response,
        })
    }

    /// Verify the proof under the same context it was produced with.
    #[must_use]
    pub(crate) fn verify(&self, public: &CurvePoint, context: &SchnorrContext) -> bool {
        // The response must be in [1, q); a zero response would make the
        // proof independent of the secret.
        if bool::from(self.response.is_zero()) {
            return false;
        }
        let challenge = Self::challenge(public, &self.commitment, context);
        let lhs = CurvePoint::GENERATOR.multiply_by_scalar(&self.response);
        let rhs = self.commitment + public.multiply_by_scalar(&challenge);
        lhs == rhs
    }

    fn challenge(
        public: &CurvePoint,
        commitment: &CurvePoint,
        context: &SchnorrContext,
    ) -> Scalar {
        let mut transcript = Transcript::new(b"SchnorrPoK");
        transcript.append_message(b"public", &public.to_compressed_bytes());
        transcript.append_message(b"commitment", &commitment.to_compressed_bytes());
        transcript.append_message(b"context", context.as_bytes());
        challenge_scalar(&mut transcript, b"challenge")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    #[test]
    fn proof_verifies_under_matching_context() {
        let mut rng = init_testing();
        let sid = Identifier::random(&mut rng);

        let secret = random_nonzero_scalar(&mut rng).unwrap();
        let public = CurvePoint::GENERATOR.multiply_by_scalar(&secret);
        let context = SchnorrContext::sign_gamma(sid);

        let proof = SchnorrProof::prove(&secret, &public, &context, &mut rng).unwrap();
        assert!(proof.verify(&public, &context));
    }

    #[test]
    fn proof_fails_under_a_different_context() {
        let mut rng = init_testing();
        let sid = Identifier::random(&mut rng);

        let secret = random_nonzero_scalar(&mut rng).unwrap();
        let public = CurvePoint::GENERATOR.multiply_by_scalar(&secret);

        let proof =
            SchnorrProof::prove(&secret, &public, &SchnorrContext::sign_gamma(sid), &mut rng)
                .unwrap();
        assert!(!proof.verify(&public, &SchnorrContext::sign_nonce(sid)));

        let other_sid = Identifier::random(&mut rng);
        assert!(!proof.verify(&public, &SchnorrContext::sign_gamma(other_sid)));
    }

    #[test]
    fn proof_fails_for_the_wrong_public_key() {
        let mut rng = init_testing();
        let context = SchnorrContext::dkg_party(Identifier::random(&mut rng), 1);

        let secret = random_nonzero_scalar(&mut rng).unwrap();
        let public = CurvePoint::GENERATOR.multiply_by_scalar(&secret);
        let proof = SchnorrProof::prove(&secret, &public, &context, &mut rng).unwrap();

        let other = public + CurvePoint::GENERATOR;
        assert!(!proof.verify(&other, &context));
    }

    #[test]
    fn tampered_proofs_are_rejected() {
        let mut rng = init_testing();
        let context = SchnorrContext::dkg_party(Identifier::random(&mut rng), 2);

        let secret = random_nonzero_scalar(&mut rng).unwrap();
        let public = CurvePoint::GENERATOR.multiply_by_scalar(&secret);
        let proof = SchnorrProof::prove(&secret, &public, &context, &mut rng).unwrap();

        let tampered = SchnorrProof {
            commitment: proof.commitment + CurvePoint::GENERATOR,
            response: proof.response,
        };
        assert!(!tampered.verify(&public, &context));

        let zeroed = SchnorrProof {
            commitment: proof.commitment,
            response: Scalar::ZERO,
        };
        assert!(!zeroed.verify(&public, &context));
    }
}
