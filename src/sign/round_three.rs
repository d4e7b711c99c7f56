// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round three of the signing session: the delta broadcast.

use crate::{
    errors::Result,
    messages::{Message, MessageType, SignMessageType},
};
use k256::Scalar;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// This signer's assembled MtA outputs. `sigma` is secret: revealing it
/// alongside `delta` would let an observer reconstruct the weighted share.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Private {
    pub(crate) delta: Scalar,
    pub(crate) sigma: Scalar,
}

impl std::fmt::Debug for Private {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("sign::round_three::Private([redacted])")
    }
}

/// The broadcast half of round three: only the delta share is revealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Public {
    pub(crate) delta_share: Scalar,
}

impl Public {
    pub(crate) fn from_message(message: &Message) -> Result<Self> {
        message.check_type(MessageType::Sign(SignMessageType::R3Delta))?;
        deserialize!(&message.unverified_bytes)
    }
}
