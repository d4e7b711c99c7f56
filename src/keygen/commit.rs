// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round payload types for the key generation ceremony.

use crate::{
    errors::{DkgError, Result},
    hybrid::HybridCiphertext,
    messages::{KeygenMessageType, Message, MessageType},
    protocol::Identifier,
    schnorr::{SchnorrContext, SchnorrProof},
    sharing::{CommitmentBlinding, FeldmanCommitment, HashCommitment},
    utils::CurvePoint,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Round one: a hash commitment binding a party's Feldman vector before any
/// peer reveals theirs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DkgCommit {
    pub(crate) party_index: u32,
    pub(crate) commitment: HashCommitment,
}

impl DkgCommit {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Keygen(KeygenMessageType::R1CommitHash))?;
        deserialize!(&message.unverified_bytes)
    }
}

/// Round two: the opened commitment. Carries the Feldman coefficient
/// commitments, the blinding factor from round one, and a proof of knowledge
/// of the polynomial intercept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DkgDecommit {
    pub(crate) party_index: u32,
    pub(crate) feldman: FeldmanCommitment,
    pub(crate) blinding: CommitmentBlinding,
    pub(crate) proof: SchnorrProof,
}

impl DkgDecommit {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Keygen(KeygenMessageType::R2Decommit))?;
        deserialize!(&message.unverified_bytes)
    }

    /// Verify the opening against the round-one commitment and check the
    /// proof of knowledge for the intercept. Either failure is fatal for the
    /// ceremony.
    pub(crate) fn verify(
        &self,
        ceremony: Identifier,
        expected_party_index: u32,
        expected_threshold: usize,
        commit: &DkgCommit,
    ) -> Result<()> {
        if self.party_index != expected_party_index
            || self.feldman.threshold() != expected_threshold
        {
            error!(
                "decommitment shape mismatch from party {}",
                expected_party_index
            );
            Err(DkgError::CommitmentMismatch)?;
        }

        commit
            .commitment
            .verify(self.feldman.points(), &self.blinding)?;

        let intercept_commitment = self.feldman.intercept_commitment()?;
        let context = SchnorrContext::dkg_party(ceremony, self.party_index);
        if !self.proof.verify(&intercept_commitment, &context) {
            error!(
                "intercept proof of knowledge failed for party {}",
                self.party_index
            );
            Err(DkgError::InvalidProofOfKnowledge)?;
        }
        Ok(())
    }
}

/// Round three: one party's Shamir share for the recipient, encrypted under
/// the recipient's identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DkgEncryptedShare {
    pub(crate) ciphertext: HybridCiphertext,
}

impl DkgEncryptedShare {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Keygen(KeygenMessageType::R3EncryptedShare))?;
        deserialize!(&message.unverified_bytes)
    }
}

/// Round four: the sender's aggregated public share and its confirmation
/// that every inbound share passed Feldman verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DkgPublicShare {
    pub(crate) party_index: u32,
    pub(crate) public_share: CurvePoint,
    pub(crate) share_verified: bool,
}

impl DkgPublicShare {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Keygen(KeygenMessageType::R4PublicShare))?;
        deserialize!(&message.unverified_bytes)
    }
}
