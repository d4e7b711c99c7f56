// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Identifiers and configuration shared by every protocol run.

use crate::errors::{CallerError, Result};
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A generic identifier for a ceremony or signing session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(u128);

impl Identifier {
    /// Produces a random [`Identifier`].
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(rng.gen::<u128>())
    }

    /// Hex form used in Schnorr domain-separation contexts and log lines.
    pub fn as_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Id({})", hex::encode(&self.0.to_be_bytes()[..4]))
    }
}

/// An identifier corresponding to a single node in the cluster.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantIdentifier(Identifier);

impl ParticipantIdentifier {
    /// Generates a random [`ParticipantIdentifier`].
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        ParticipantIdentifier(Identifier::random(rng))
    }

    /// Full hex form, used in on-disk metadata.
    pub fn as_hex(&self) -> String {
        self.0.as_hex()
    }
}

impl std::fmt::Display for ParticipantIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ParticipantId({})",
            hex::encode(&self.0 .0.to_be_bytes()[..4])
        )
    }
}

/// The ordered roster of a ceremony.
///
/// Party indices `1..=n` are assigned by position in the proposal's
/// participant list, so every node derives the same assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRoster {
    ordered: Vec<ParticipantIdentifier>,
}

impl PartyRoster {
    /// Build a roster from the proposal's participant list, in order.
    pub fn new(ordered: Vec<ParticipantIdentifier>) -> Result<Self> {
        let mut seen = ordered.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != ordered.len() {
            Err(CallerError::InvalidArgument(String::from(
                "duplicate participant in roster",
            )))?;
        }
        Ok(Self { ordered })
    }

    /// The one-based party index of the given participant.
    pub fn index_of(&self, id: ParticipantIdentifier) -> Result<u32> {
        self.ordered
            .iter()
            .position(|&p| p == id)
            .map(|pos| pos as u32 + 1)
            .ok_or_else(|| {
                CallerError::InvalidArgument(String::from("participant not in roster")).into()
            })
    }

    /// The participant holding the given one-based party index.
    pub fn id_at(&self, index: u32) -> Result<ParticipantIdentifier> {
        if index == 0 {
            Err(CallerError::InvalidArgument(String::from(
                "party indices are one-based",
            )))?;
        }
        self.ordered
            .get(index as usize - 1)
            .copied()
            .ok_or_else(|| {
                CallerError::InvalidArgument(String::from("party index out of range")).into()
            })
    }

    /// All (index, participant) pairs in index order.
    pub fn entries(&self) -> BTreeMap<u32, ParticipantIdentifier> {
        self.ordered
            .iter()
            .enumerate()
            .map(|(pos, &id)| (pos as u32 + 1, id))
            .collect()
    }

    /// Number of parties in the roster.
    pub fn count(&self) -> usize {
        self.ordered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    #[test]
    fn roster_assigns_indices_by_proposal_order() {
        let mut rng = init_testing();
        let ids = (0..4)
            .map(|_| ParticipantIdentifier::random(&mut rng))
            .collect::<Vec<_>>();
        let roster = PartyRoster::new(ids.clone()).unwrap();

        for (pos, id) in ids.iter().enumerate() {
            assert_eq!(roster.index_of(*id).unwrap(), pos as u32 + 1);
            assert_eq!(roster.id_at(pos as u32 + 1).unwrap(), *id);
        }
        assert!(roster.id_at(0).is_err());
        assert!(roster.id_at(5).is_err());
    }

    #[test]
    fn roster_rejects_duplicates() {
        let mut rng = init_testing();
        let id = ParticipantIdentifier::random(&mut rng);
        assert!(PartyRoster::new(vec![id, id]).is_err());
    }
}
