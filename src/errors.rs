// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A list of error types which are produced during an execution of the
//! protocols.

use thiserror::Error;

/// The default Result type used in this crate.
pub type Result<T> = std::result::Result<T, InternalError>;

/// Represents an error in protocol execution or the manipulation of internal
/// cryptographic data.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum InternalError {
    #[error("Serialization Error")]
    Serialization,
    #[error("Represents some code assumption that was checked at runtime but failed to be true")]
    InternalInvariantFailed,
    #[error("Could not convert a BigNumber to a curve scalar, as it was not in [0, q)")]
    CouldNotConvertToScalar,
    #[error("Could not invert a scalar that was expected to be invertible")]
    CouldNotInvertScalar,
    #[error("Reached the maximum allowed number of retries")]
    RetryFailed,
    #[error("This participant was given a message intended for somebody else")]
    WrongMessageRecipient,
    #[error("Encountered a MessageType which was not expected in this context")]
    MisroutedMessage,
    #[error("Storage does not contain the requested item")]
    StorageItemNotFound,
    #[error("Could not construct a signature from the provided scalars")]
    SignatureInstantiationFailed,
    #[error("Message could not be validated: `{0}`")]
    Validation(#[from] ValidationError),
    #[error("Key generation ceremony failed: `{0}`")]
    Dkg(#[from] DkgError),
    #[error("Signing session failed: `{0}`")]
    Signing(#[from] SigningError),
    #[error("Paillier error: `{0}`")]
    Paillier(#[from] PaillierError),
    #[error("Key-share store error: `{0}`")]
    Storage(#[from] StorageError),
    #[error("Calling error: `{0}`")]
    Caller(#[from] CallerError),
}

/// Errors raised when a single inbound message fails validation. These drop
/// the offending message without tearing down a running ceremony.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum ValidationError {
    #[error("envelope was malformed and could not be parsed")]
    MalformedEnvelope,
    #[error("envelope timestamp is more than {0} ms behind the local clock")]
    StaleTimestamp(u64),
    #[error("transport sender identity does not match the payload sender")]
    SenderMismatch,
    #[error("message addressed to a different recipient")]
    WrongRecipient,
}

/// Errors which abort a running key generation ceremony.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum DkgError {
    #[error("commitment opening does not match the round one commitment")]
    CommitmentMismatch,
    #[error("Schnorr proof of knowledge failed to verify")]
    InvalidProofOfKnowledge,
    #[error("received share is inconsistent with the sender's Feldman commitments")]
    ShareVerificationFailed,
    #[error("could not decrypt the share addressed to this participant")]
    ShareDecryptionFailed,
    #[error("received more than one `{0}` message from the same sender")]
    DuplicateMessage(&'static str),
    #[error("reported public share does not match the Feldman commitments")]
    PublicShareMismatch,
    #[error("ceremony deadline has passed")]
    DeadlineExceeded,
    #[error("a peer aborted the ceremony: `{0}`")]
    PeerAbort(String),
}

/// Errors which abort a running signing session.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum SigningError {
    #[error("peer Paillier modulus failed validation")]
    InvalidPeerModulus,
    #[error("a consumed Paillier ciphertext was outside [1, N^2)")]
    CiphertextOutOfRange,
    #[error("Schnorr proof of knowledge failed to verify")]
    InvalidProofOfKnowledge,
    #[error("received more than one `{0}` message from the same sender")]
    Equivocation(&'static str),
    #[error("aggregated delta was zero; session must be retried with fresh nonces")]
    DegenerateDelta,
    #[error("signature r component was zero; session must be retried with fresh nonces")]
    DegenerateR,
    #[error("a peer's partial signature failed the algebraic check")]
    InvalidPartialSignature,
    #[error("assembled signature does not verify under the derived child key")]
    AssembledSignatureInvalid,
    #[error("session deadline has passed")]
    DeadlineExceeded,
    #[error("declared transaction hash does not match the raw transaction")]
    TxHashMismatch,
    #[error("a peer aborted the session: `{0}`")]
    PeerAbort(String),
}

/// Paillier-specific errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PaillierError {
    #[error("failed to create a Paillier decryption key from inputs")]
    CouldNotCreateKey,
    #[error("the inputs to a homomorphic operation on a Paillier ciphertext were malformed")]
    InvalidOperation,
    #[error("the attempted decryption of a Paillier ciphertext failed")]
    DecryptionFailed,
    #[error("modulus is even")]
    ModulusEven,
    #[error("modulus is smaller than 2^1022")]
    ModulusTooSmall,
    #[error("modulus shares a factor with the curve order")]
    ModulusSharesFactorWithCurveOrder,
    #[error("modulus is a perfect square")]
    ModulusPerfectSquare,
}

/// Errors produced by the key-share store.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum StorageError {
    #[error("I/O failure: `{0}`")]
    Io(String),
    #[error("encryption of the key share failed")]
    EncryptionFailed,
    #[error("decryption of the key share failed; wrong key or corrupted file")]
    DecryptionFailed,
    #[error("key derivation from the passphrase failed")]
    KdfFailed,
    #[error("on-disk document has version `{0}`, expected `{1}`")]
    UnsupportedVersion(u32, u32),
    #[error("no key share has been persisted at this path")]
    NotFound,
}

/// Represents an error that the caller of this library made when invoking an
/// API method.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum CallerError {
    #[error("function call contained invalid arguments: `{0}`")]
    InvalidArgument(String),
    #[error("tried to start a protocol instance while another is in progress")]
    CeremonyInProgress,
    #[error("protocol instance has already terminated")]
    ProtocolAlreadyTerminated,
    #[error("passphrase must be at least 32 characters")]
    PassphraseTooShort,
    #[error("derivation path must end in a non-hardened index")]
    HardenedDerivationUnsupported,
    #[error("no key share is loaded; run key generation first")]
    NoKeyShare,
}

macro_rules! serialize {
    ($x:expr) => {{
        bincode::serialize($x).or(Err(crate::errors::InternalError::Serialization))
    }};
}

macro_rules! deserialize {
    ($x:expr) => {{
        bincode::deserialize($x).or(Err(crate::errors::InternalError::Serialization))
    }};
}
