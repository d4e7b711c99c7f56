// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Signing session setup: the initiator's request, the fixed signer subset,
//! and the assembled signature.

use crate::{
    derive::DerivationPath,
    errors::{CallerError, Result, SigningError},
    eth::{parse_tx_hash, Eip1559Transaction},
    protocol::{Identifier, ParticipantIdentifier},
    utils::{invert_scalar, scalar_from_be_bytes, scalar_is_high, CurvePoint},
};
use k256::{elliptic_curve::Field, Scalar};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A request to open a signing session, broadcast by the initiator.
///
/// Receivers must never trust the declared `tx_hash`: [`SignRequest::validate`]
/// recomputes it from the raw transaction, which is what prevents a
/// compromised initiator from substituting a different payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub session_id: Identifier,
    pub initiator: ParticipantIdentifier,
    pub initiator_party_index: u32,
    /// Lowercase hex of the 32-byte signing hash, no `0x` prefix.
    pub tx_hash: String,
    pub raw_tx: Eip1559Transaction,
    /// BIP44 path of the child key to sign under; `None` signs under the
    /// master key.
    pub derivation_path: Option<String>,
    /// Session deadline, milliseconds since the epoch.
    pub deadline_ms: u64,
}

impl SignRequest {
    /// Build a request for `transaction`, deriving the hash honestly.
    pub fn new(
        session_id: Identifier,
        initiator: ParticipantIdentifier,
        initiator_party_index: u32,
        transaction: Eip1559Transaction,
        derivation_path: Option<DerivationPath>,
        deadline_ms: u64,
    ) -> Self {
        Self {
            session_id,
            initiator,
            initiator_party_index,
            tx_hash: transaction.tx_hash_hex(),
            raw_tx: transaction,
            derivation_path: derivation_path.map(|path| path.as_str().to_string()),
            deadline_ms,
        }
    }

    /// Recompute the signing hash from the raw transaction and compare it to
    /// the declared hash. Returns the verified hash bytes.
    pub fn validate(&self) -> Result<[u8; 32]> {
        let recomputed = self.raw_tx.tx_hash();
        let declared = parse_tx_hash(&self.tx_hash)?;
        if recomputed != declared {
            Err(SigningError::TxHashMismatch)?;
        }
        Ok(recomputed)
    }

    /// The address index to tweak by, if the request names a child key.
    pub fn derivation_index(&self) -> Result<Option<u32>> {
        self.derivation_path
            .as_deref()
            .map(|path| DerivationPath::parse(path).map(|parsed| parsed.index()))
            .transpose()
    }
}

/// The fixed `t`-subset of signers for one session, mapping party indices to
/// node identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerSet {
    entries: BTreeMap<u32, ParticipantIdentifier>,
}

impl SignerSet {
    /// Fix the signer subset from `(party index, node)` pairs.
    pub fn new(entries: impl IntoIterator<Item = (u32, ParticipantIdentifier)>) -> Result<Self> {
        let entries: BTreeMap<u32, ParticipantIdentifier> = entries.into_iter().collect();
        let mut nodes: Vec<_> = entries.values().collect();
        nodes.sort();
        nodes.dedup();
        if nodes.len() != entries.len() {
            Err(CallerError::InvalidArgument(String::from(
                "a node appears twice in the signer set",
            )))?;
        }
        if entries.keys().any(|&index| index == 0) {
            Err(CallerError::InvalidArgument(String::from(
                "party indices are one-based",
            )))?;
        }
        Ok(Self { entries })
    }

    /// The party index of `id` within this subset.
    pub fn index_of(&self, id: ParticipantIdentifier) -> Result<u32> {
        self.entries
            .iter()
            .find(|(_, &node)| node == id)
            .map(|(&index, _)| index)
            .ok_or_else(|| {
                CallerError::InvalidArgument(String::from("node is not in the signer set")).into()
            })
    }

    /// The node holding `index`.
    pub fn id_at(&self, index: u32) -> Result<ParticipantIdentifier> {
        self.entries.get(&index).copied().ok_or_else(|| {
            CallerError::InvalidArgument(String::from("party index is not in the signer set"))
                .into()
        })
    }

    /// All party indices, ascending.
    pub fn indices(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    /// All signer nodes, in index order.
    pub fn ids(&self) -> Vec<ParticipantIdentifier> {
        self.entries.values().copied().collect()
    }

    /// Number of signers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no signer has been fixed yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An assembled ECDSA signature with its Ethereum recovery byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    r: Scalar,
    s: Scalar,
    /// `true` when the (normalized) signature's nonce point has odd y.
    y_parity: bool,
}

impl Signature {
    pub(crate) fn new(r: Scalar, s: Scalar, y_parity: bool) -> Self {
        Self { r, s, y_parity }
    }

    /// The `r` component.
    pub fn r(&self) -> &Scalar {
        &self.r
    }

    /// The `s` component; always in the low half of the range per EIP-2.
    pub fn s(&self) -> &Scalar {
        &self.s
    }

    /// The parity of the nonce point's y-coordinate.
    pub fn y_parity(&self) -> bool {
        self.y_parity
    }

    /// The legacy 27/28 recovery byte.
    pub fn v(&self) -> u8 {
        27 + u8::from(self.y_parity)
    }

    /// Convert to a `k256` signature for interop with standard verifiers.
    pub fn to_k256(&self) -> Result<k256::ecdsa::Signature> {
        k256::ecdsa::Signature::from_scalars(self.r.to_bytes(), self.s.to_bytes())
            .map_err(|_| crate::errors::InternalError::SignatureInstantiationFailed)
    }

    /// Big-endian `r` bytes.
    pub fn r_bytes(&self) -> [u8; 32] {
        self.r.to_bytes().into()
    }

    /// Big-endian `s` bytes.
    pub fn s_bytes(&self) -> [u8; 32] {
        self.s.to_bytes().into()
    }

    /// Verify this signature over a 32-byte message hash against a public
    /// key.
    pub fn verify(&self, public_key: &CurvePoint, message_hash: &[u8; 32]) -> Result<bool> {
        let m = scalar_from_be_bytes(message_hash)?;
        Ok(self.verify_scalar(public_key, &m))
    }

    pub(crate) fn verify_scalar(&self, public_key: &CurvePoint, m: &Scalar) -> bool {
        if bool::from(self.r.is_zero()) || bool::from(self.s.is_zero()) {
            return false;
        }
        if scalar_is_high(&self.s) {
            return false;
        }
        let s_inv = match invert_scalar(&self.s) {
            Ok(s_inv) => s_inv,
            Err(_) => return false,
        };
        let u1 = *m * s_inv;
        let u2 = self.r * s_inv;
        let nonce_point = CurvePoint::GENERATOR.multiply_by_scalar(&u1)
            + public_key.multiply_by_scalar(&u2);
        if nonce_point.is_identity() {
            return false;
        }
        match nonce_point.x_projection() {
            Ok(x) => x == self.r,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    fn sample_tx() -> Eip1559Transaction {
        Eip1559Transaction {
            chain_id: 1,
            nonce: 0,
            max_priority_fee_per_gas: 1_500_000_000,
            max_fee_per_gas: 30_000_000_000,
            gas: 21_000,
            to: Some([0x11; 20]),
            value: 100_000_000_000_000_000,
            data: vec![],
        }
    }

    #[test]
    fn honest_requests_validate() {
        let mut rng = init_testing();
        let request = SignRequest::new(
            Identifier::random(&mut rng),
            ParticipantIdentifier::random(&mut rng),
            1,
            sample_tx(),
            Some(DerivationPath::for_index(4).unwrap()),
            1_700_000_060_000,
        );
        let hash = request.validate().unwrap();
        assert_eq!(hash, sample_tx().tx_hash());
        assert_eq!(request.derivation_index().unwrap(), Some(4));
    }

    #[test]
    fn substituted_hashes_are_detected() {
        let mut rng = init_testing();
        let mut request = SignRequest::new(
            Identifier::random(&mut rng),
            ParticipantIdentifier::random(&mut rng),
            1,
            sample_tx(),
            None,
            1_700_000_060_000,
        );

        // Declare the hash of a different transaction: a 0.1 ETH transfer
        // whose stated hash belongs to a 10 ETH transfer.
        let mut other = sample_tx();
        other.value *= 100;
        request.tx_hash = other.tx_hash_hex();

        assert_eq!(
            request.validate(),
            Err(SigningError::TxHashMismatch.into())
        );
    }

    #[test]
    fn request_round_trips_through_json() {
        let mut rng = init_testing();
        let request = SignRequest::new(
            Identifier::random(&mut rng),
            ParticipantIdentifier::random(&mut rng),
            2,
            sample_tx(),
            Some(DerivationPath::for_index(0).unwrap()),
            1_700_000_060_000,
        );
        let json = serde_json::to_string(&request).unwrap();
        let parsed: SignRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn signer_set_rejects_duplicates_and_unknowns() {
        let mut rng = init_testing();
        let a = ParticipantIdentifier::random(&mut rng);
        let b = ParticipantIdentifier::random(&mut rng);
        let c = ParticipantIdentifier::random(&mut rng);

        let signers = SignerSet::new([(1, a), (3, b)]).unwrap();
        assert_eq!(signers.index_of(a).unwrap(), 1);
        assert_eq!(signers.id_at(3).unwrap(), b);
        assert_eq!(signers.indices(), vec![1, 3]);
        assert!(signers.index_of(c).is_err());
        assert!(signers.id_at(2).is_err());

        assert!(SignerSet::new([(1, a), (2, a)]).is_err());
        assert!(SignerSet::new([(0, a)]).is_err());
    }
}
