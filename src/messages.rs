// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Contains the functions and definitions for dealing with messages that are
//! passed between participants during a ceremony.

use crate::{
    errors::{InternalError, Result},
    protocol::{Identifier, ParticipantIdentifier},
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// An enum consisting of all message types, one nested enum per
/// sub-protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Key generation ceremony messages.
    Keygen(KeygenMessageType),
    /// Signing session messages.
    Sign(SignMessageType),
}

/// Message types within the key generation ceremony.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeygenMessageType {
    /// Signals that the ceremony is ready to begin.
    Ready,
    /// Round one: hash commitment to the Feldman vector.
    R1CommitHash,
    /// Round two: commitment opening plus proof of knowledge.
    R2Decommit,
    /// Round three: a Shamir share encrypted to one recipient.
    R3EncryptedShare,
    /// Round four: public share and verification confirmation.
    R4PublicShare,
}

/// Message types within the signing session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignMessageType {
    /// Signals that the signer subset is fixed and the session may begin.
    Ready,
    /// Round one: nonce commitments and Paillier setup.
    R1Commit,
    /// Round two: per-peer MtA ciphertexts.
    R2MtA,
    /// Round three: delta share broadcast.
    R3Delta,
    /// Round four: partial signature broadcast.
    R4PartialSig,
}

/// A message to be delivered to another participant, or broadcast to all of
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    /// The ceremony or session this message belongs to.
    identifier: Identifier,
    from: ParticipantIdentifier,
    to: ParticipantIdentifier,
    /// The raw bytes for the message, which need to be verified. This should
    /// be a private member of the struct, so that we require consumers to call
    /// a typed `from_message` constructor in order to extract bytes.
    pub(crate) unverified_bytes: Vec<u8>,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Message {{ {:?}, {}, from: {}, to: {} }}",
            self.message_type, self.identifier, self.from, self.to
        )
    }
}

impl Message {
    /// Creates a new instance of [`Message`].
    pub fn new(
        message_type: MessageType,
        identifier: Identifier,
        from: ParticipantIdentifier,
        to: ParticipantIdentifier,
        unverified_bytes: &[u8],
    ) -> Self {
        Self {
            message_type,
            identifier,
            from,
            to,
            unverified_bytes: unverified_bytes.to_vec(),
        }
    }

    /// The type of the message.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The ceremony or session identifier of the message.
    pub fn id(&self) -> Identifier {
        self.identifier
    }

    /// The participant this message is coming from.
    pub fn from(&self) -> ParticipantIdentifier {
        self.from
    }

    /// The participant this message is addressed to.
    pub fn to(&self) -> ParticipantIdentifier {
        self.to
    }

    /// Check that the message type is as expected.
    pub(crate) fn check_type(&self, expected: MessageType) -> Result<()> {
        if self.message_type() != expected {
            error!(
                "A message was misrouted. Expected {:?}, got {:?}",
                expected,
                self.message_type()
            );
            return Err(InternalError::MisroutedMessage);
        }
        Ok(())
    }
}
