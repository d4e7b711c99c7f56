// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The durable output of a key generation ceremony.

use crate::{
    protocol::Identifier,
    utils::CurvePoint,
};
use hmac::Mac;
use k256::Scalar;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha512 = hmac::Hmac<sha2::Sha512>;

/// Key used to bind the chain code to this wallet's key domain.
const CHAIN_CODE_KEY: &[u8] = b"CLIRift v1";

/// This node's Shamir share of the never-materialized master secret.
///
/// The only durable secret in the system; always encrypted at rest and
/// zeroed on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeySharePrivate {
    x: Scalar,
}

impl std::fmt::Debug for KeySharePrivate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySharePrivate([redacted])")
    }
}

impl KeySharePrivate {
    pub(crate) fn new(x: Scalar) -> Self {
        Self { x }
    }

    /// The share scalar. Callers must not let copies outlive the session
    /// that needed them.
    pub(crate) fn as_scalar(&self) -> &Scalar {
        &self.x
    }
}

/// The public image `x_j * G` of one party's share, as derived from the
/// ceremony's Feldman commitments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyShare {
    party_index: u32,
    share: CurvePoint,
}

impl PublicKeyShare {
    pub(crate) fn new(party_index: u32, share: CurvePoint) -> Self {
        Self { party_index, share }
    }

    /// The one-based party index this share belongs to.
    pub fn party_index(&self) -> u32 {
        self.party_index
    }

    /// The public share point.
    pub fn share(&self) -> &CurvePoint {
        &self.share
    }
}

/// Everything a node persists after a successful ceremony: its private
/// share plus the ceremony's public facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyShare {
    party_index: u32,
    private_share: KeySharePrivate,
    public_key_shares: Vec<PublicKeyShare>,
    public_key: CurvePoint,
    chain_code: [u8; 32],
    ceremony: Identifier,
    threshold: usize,
}

impl KeyShare {
    pub(crate) fn new(
        party_index: u32,
        private_share: KeySharePrivate,
        public_key_shares: Vec<PublicKeyShare>,
        public_key: CurvePoint,
        chain_code: [u8; 32],
        ceremony: Identifier,
        threshold: usize,
    ) -> Self {
        Self {
            party_index,
            private_share,
            public_key_shares,
            public_key,
            chain_code,
            ceremony,
            threshold,
        }
    }

    /// This node's one-based party index.
    pub fn party_index(&self) -> u32 {
        self.party_index
    }

    /// The master public key `P`.
    pub fn public_key(&self) -> &CurvePoint {
        &self.public_key
    }

    /// The BIP32 chain code derived alongside `P`.
    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    /// The ceremony that produced this share.
    pub fn ceremony(&self) -> Identifier {
        self.ceremony
    }

    /// The signing threshold `t`.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The public share of every party, in index order.
    pub fn public_key_shares(&self) -> &[PublicKeyShare] {
        &self.public_key_shares
    }

    pub(crate) fn private_share(&self) -> &KeySharePrivate {
        &self.private_share
    }

    /// Construct a share directly from its parts.
    ///
    /// This bypasses the ceremony and is meant for tests and for restoring
    /// state that was produced by one.
    pub fn from_parts(
        party_index: u32,
        secret_share: Scalar,
        public_key_shares: Vec<PublicKeyShare>,
        public_key: CurvePoint,
        chain_code: [u8; 32],
        ceremony: Identifier,
        threshold: usize,
    ) -> Self {
        Self::new(
            party_index,
            KeySharePrivate::new(secret_share),
            public_key_shares,
            public_key,
            chain_code,
            ceremony,
            threshold,
        )
    }
}

/// Derive the ceremony chain code from the master public key: the right half
/// of `HMAC-SHA512("CLIRift v1", P)`.
pub(crate) fn derive_chain_code(public_key: &CurvePoint) -> [u8; 32] {
    let mut mac = HmacSha512::new_from_slice(CHAIN_CODE_KEY)
        .expect("this never fails: hmac can handle keys of any size");
    mac.update(&public_key.to_compressed_bytes());
    let output = mac.finalize().into_bytes();

    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&output[32..64]);
    chain_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{random_nonzero_scalar, testing::init_testing};

    #[test]
    fn chain_code_is_a_pure_function_of_the_public_key() {
        let mut rng = init_testing();
        let p1 = CurvePoint::GENERATOR.multiply_by_scalar(&random_nonzero_scalar(&mut rng).unwrap());
        let p2 = CurvePoint::GENERATOR.multiply_by_scalar(&random_nonzero_scalar(&mut rng).unwrap());

        assert_eq!(derive_chain_code(&p1), derive_chain_code(&p1));
        assert_ne!(derive_chain_code(&p1), derive_chain_code(&p2));
    }

    #[test]
    fn private_share_debug_output_is_redacted() {
        let mut rng = init_testing();
        let share = KeySharePrivate::new(random_nonzero_scalar(&mut rng).unwrap());
        assert_eq!(format!("{share:?}"), "KeySharePrivate([redacted])");
    }
}
