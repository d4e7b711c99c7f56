// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A multi-party ECDSA wallet core for secp256k1.
//!
//! A cluster of independent nodes jointly holds a private key such that no
//! single node ever materializes it, yet any `t` of `n` nodes can
//! collaboratively produce a valid signature. Two ceremonies make up the
//! core:
//!
//! - **Key generation** ([`keygen`]): a four-round verifiable secret
//!   sharing protocol producing a master public key, per-node Shamir
//!   shares, and a BIP32 chain code.
//! - **Signing** ([`sign`]): a four-round GG20-style protocol producing an
//!   ECDSA signature `(r, s, v)` on a transaction hash, using Paillier
//!   homomorphic encryption for the multiplicative-to-additive conversions,
//!   with the non-hardened BIP32 child tweak folded into each signer's
//!   share.
//!
//! Both ceremonies are driven entirely by messages applied to a
//! [`ProtocolParticipant`]; a node's [`Coordinator`] owns the active
//! ceremony, enforces deadlines, and persists the resulting share with the
//! encrypted [`keystore`]. The TLS transport, peer discovery, CLI, and
//! configuration layers live outside this crate and plug into the
//! [`envelope`] boundary.

#[macro_use]
mod errors;

mod coordinator;
mod hybrid;
mod local_storage;
mod message_queue;
mod messages;
mod paillier;
mod parameters;
mod participant;
mod protocol;
mod schnorr;
mod sharing;
mod utils;

pub mod derive;
pub mod envelope;
pub mod eth;
pub mod keygen;
pub mod keystore;
pub mod sign;

pub use coordinator::{Coordinator, Outcome};
pub use errors::{
    CallerError, DkgError, InternalError, PaillierError, Result, SigningError, StorageError,
    ValidationError,
};
pub use hybrid::IdentityKeypair;
pub use messages::{KeygenMessageType, Message, MessageType, SignMessageType};
pub use participant::{ProcessOutcome, ProtocolParticipant};
pub use protocol::{Identifier, ParticipantIdentifier, PartyRoster};
pub use utils::CurvePoint;
