// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round four of the signing session: partial signatures.

use crate::{
    errors::{Result, SigningError},
    messages::{Message, MessageType, SignMessageType},
    utils::CurvePoint,
};
use k256::Scalar;
use serde::{Deserialize, Serialize};
use tracing::error;

/// The broadcast half of round four.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Public {
    /// `s_i = m * k_i + r * sigma_i`.
    pub(crate) partial_signature: Scalar,
    /// `sigma_i * G`, which lets peers check the partial signature without
    /// learning `sigma_i`.
    pub(crate) sigma_commitment: CurvePoint,
}

impl Public {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Sign(SignMessageType::R4PartialSig))?;
        deserialize!(&message.unverified_bytes)
    }

    /// Check the partial signature against the sender's round one nonce
    /// commitment: `s_j * G =? m * (k_j * G) + r * (sigma_j * G)`.
    pub(crate) fn verify(
        &self,
        m: &Scalar,
        r: &Scalar,
        nonce_commitment: &CurvePoint,
    ) -> Result<()> {
        let lhs = CurvePoint::GENERATOR.multiply_by_scalar(&self.partial_signature);
        let rhs =
            nonce_commitment.multiply_by_scalar(m) + self.sigma_commitment.multiply_by_scalar(r);
        if lhs != rhs {
            error!("partial signature failed the algebraic check");
            Err(SigningError::InvalidPartialSignature)?;
        }
        Ok(())
    }
}
