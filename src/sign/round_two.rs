// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round two of the signing session: the per-peer MtA conversions.

use crate::{
    errors::Result,
    messages::{Message, MessageType, SignMessageType},
    paillier::PaillierCiphertext,
    utils::CurvePoint,
};
use k256::Scalar;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The masks this signer retains from the MtA conversions it initiated
/// toward one peer. These are the negated blinding values, i.e. this
/// signer's additive shares of `k_j * gamma_i` and `k_j * w_i`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Private {
    pub(crate) neg_beta_delta: Scalar,
    pub(crate) neg_beta_sigma: Scalar,
}

impl std::fmt::Debug for Private {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("sign::round_two::Private([redacted])")
    }
}

/// The point-to-point half of round two: both MtA ciphertexts, encrypted
/// under the recipient's session modulus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Public {
    /// Homomorphically `Enc_{N_j}(k_j * gamma_i + beta_delta)`.
    pub(crate) delta_ciphertext: PaillierCiphertext,
    /// Homomorphically `Enc_{N_j}(k_j * w_i + beta_sigma)`, where `w_i` is
    /// the Lagrange-weighted, tweak-adjusted share.
    pub(crate) sigma_ciphertext: PaillierCiphertext,
    /// The sender's `gamma_i * G`, echoed for convenience.
    pub(crate) gamma_commitment: CurvePoint,
}

impl Public {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Sign(SignMessageType::R2MtA))?;
        deserialize!(&message.unverified_bytes)
    }
}
