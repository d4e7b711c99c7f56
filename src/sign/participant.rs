//! Types and functions related to the signing session participant.

// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    derive::child_tweak,
    errors::{CallerError, InternalError, Result, SigningError},
    keygen::{KeyShare, KeySharePrivate},
    local_storage::{LocalStorage, TypeTag},
    message_queue::MessageQueue,
    messages::{Message, MessageType, SignMessageType},
    paillier::{PaillierDecryptionKey, PaillierEncryptionKey},
    participant::{run_only_once, InnerProtocolParticipant, ProcessOutcome, ProtocolParticipant},
    protocol::{Identifier, ParticipantIdentifier},
    schnorr::{SchnorrContext, SchnorrProof},
    sharing::lagrange_at_zero,
    sign::{
        request::{SignRequest, Signature, SignerSet},
        round_four, round_one, round_three, round_two,
    },
    utils::{
        bn_to_scalar, invert_scalar, random_nonzero_scalar, random_scalar, scalar_from_be_bytes,
        scalar_is_high, scalar_to_bn, CurvePoint,
    },
};
use k256::{elliptic_curve::Field, Scalar};
use rand::{CryptoRng, RngCore};
use std::collections::HashSet;
use tracing::{error, info, instrument};
use zeroize::Zeroize;

mod storage {
    use super::*;

    pub(super) struct Ready;
    impl TypeTag for Ready {
        type Value = ();
    }
    pub(super) struct RoundOnePrivate;
    impl TypeTag for RoundOnePrivate {
        type Value = round_one::Private;
    }
    pub(super) struct RoundOnePublic;
    impl TypeTag for RoundOnePublic {
        type Value = round_one::Public;
    }
    pub(super) struct RoundTwoPrivate;
    impl TypeTag for RoundTwoPrivate {
        type Value = round_two::Private;
    }
    pub(super) struct RoundTwoPublic;
    impl TypeTag for RoundTwoPublic {
        type Value = round_two::Public;
    }
    pub(super) struct RoundThreePrivate;
    impl TypeTag for RoundThreePrivate {
        type Value = round_three::Private;
    }
    pub(super) struct RoundThreePublic;
    impl TypeTag for RoundThreePublic {
        type Value = round_three::Public;
    }
    pub(super) struct NoncePoint;
    impl TypeTag for NoncePoint {
        type Value = (CurvePoint, Scalar);
    }
    pub(super) struct RoundFourPublic;
    impl TypeTag for RoundFourPublic {
        type Value = round_four::Public;
    }
}

/// Protocol status for [`SignParticipant`].
///
/// Rounds are reserved synchronously before the work for them starts, so an
/// inbound message always observes the post-transition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The session has been initialized but not all signers are ready.
    Initialized,
    /// Nonce commitments and Paillier setup are being exchanged.
    Round1,
    /// Per-peer MtA ciphertexts are being exchanged.
    Round2,
    /// Delta shares are being exchanged.
    Round3,
    /// Partial signatures are being exchanged.
    Round4,
    /// The session terminated with a verified signature.
    TerminatedSuccessfully,
    /// The session aborted; all in-memory material has been discarded.
    Aborted,
}

/// Input for a signing session.
#[derive(Debug)]
pub struct Input {
    key_share: KeyShare,
    signers: SignerSet,
    /// The verified 32-byte signing hash.
    tx_hash: [u8; 32],
    /// `tx_hash` as a scalar.
    message: Scalar,
    /// This signer's Lagrange-weighted, tweak-adjusted share
    /// `w_i = L_i * (x_i + T)`.
    weighted_share: KeySharePrivate,
    /// The public key the assembled signature must verify under:
    /// `P + T * G`.
    child_public_key: CurvePoint,
}

impl Input {
    /// Assemble a session input from a share, the fixed signer subset, the
    /// verified signing hash, and the optional derivation tweak.
    ///
    /// The persistent share is folded into the session's weighted share
    /// here; because the Lagrange weights sum to one at zero, the tweak
    /// carries through to the assembled key.
    pub fn new(
        key_share: KeyShare,
        signers: SignerSet,
        tx_hash: [u8; 32],
        tweak: Option<Scalar>,
    ) -> Result<Self> {
        if signers.len() != key_share.threshold() {
            Err(CallerError::InvalidArgument(String::from(
                "signer subset size must equal the ceremony threshold",
            )))?;
        }
        let my_index = key_share.party_index();
        // Also confirms this node is a member of the subset.
        signers.id_at(my_index)?;

        let weight = lagrange_at_zero(my_index, &signers.indices())?;
        let shift = tweak.unwrap_or(Scalar::ZERO);
        let mut effective = *key_share.private_share().as_scalar() + shift;
        let weighted_share = KeySharePrivate::new(weight * effective);
        effective.zeroize();

        let child_public_key =
            *key_share.public_key() + CurvePoint::GENERATOR.multiply_by_scalar(&shift);

        Ok(Self {
            message: scalar_from_be_bytes(&tx_hash)?,
            key_share,
            signers,
            tx_hash,
            weighted_share,
            child_public_key,
        })
    }

    /// Assemble a session input from a validated [`SignRequest`]: the hash
    /// is recomputed from the raw transaction and the derivation tweak is
    /// taken from the request's path.
    pub fn from_request(
        key_share: KeyShare,
        signers: SignerSet,
        request: &SignRequest,
    ) -> Result<Self> {
        let tx_hash = request.validate()?;
        let tweak = request
            .derivation_index()?
            .map(|index| child_tweak(key_share.public_key(), key_share.chain_code(), index))
            .transpose()?;
        Self::new(key_share, signers, tx_hash, tweak)
    }

    /// The public key the signature will verify under.
    pub fn child_public_key(&self) -> &CurvePoint {
        &self.child_public_key
    }

    /// The verified signing hash.
    pub fn tx_hash(&self) -> &[u8; 32] {
        &self.tx_hash
    }

    fn my_index(&self) -> u32 {
        self.key_share.party_index()
    }
}

/// A [`ProtocolParticipant`] that runs the four-round threshold signing
/// session.
///
/// # Protocol input
/// The session [`Input`]: this signer's key share, the fixed `t`-subset of
/// signers, the verified transaction hash, and the derivation tweak.
///
/// # Protocol output
/// Upon successful completion, a [`Signature`] that has already been
/// verified against the derived child public key. A session that cannot
/// produce a verifying signature aborts instead of emitting one.
///
/// # High-level protocol description
/// - In round one, each signer samples nonces `k_i, gamma_i`, generates a
///   fresh Paillier keypair, broadcasts commitments to both nonces, the
///   modulus, an encryption of `k_i`, and proofs of knowledge for both
///   nonces.
/// - In round two, each pair of signers runs two MtA conversions over the
///   Paillier ciphertexts, turning the products `k_j * gamma_i` and
///   `k_j * w_i` into additive shares.
/// - In round three, each signer decrypts its inbound MtA results and
///   broadcasts its share of `K * Gamma`; the sigma share stays private.
/// - In round four, signers reveal partial signatures, cross-check them
///   against the round-one commitments, and independently assemble and
///   verify the final signature.
#[derive(Debug)]
pub struct SignParticipant {
    /// The current session identifier.
    sid: Identifier,
    /// A unique identifier for this participant.
    id: ParticipantIdentifier,
    /// The other members of the signer subset.
    other_participant_ids: Vec<ParticipantIdentifier>,
    /// Local storage for this participant to store state of the run.
    local_storage: LocalStorage,
    /// Stash for messages that arrive ahead of the local round.
    message_queue: MessageQueue,
    /// Guards for once-only round initiation.
    progress: HashSet<&'static str>,
    /// Session input.
    input: Input,
    /// Status of the protocol execution.
    status: Status,
}

impl ProtocolParticipant for SignParticipant {
    type Input = Input;
    type Output = Signature;
    type Status = Status;

    fn new(
        sid: Identifier,
        id: ParticipantIdentifier,
        other_participant_ids: Vec<ParticipantIdentifier>,
        input: Self::Input,
    ) -> Result<Self> {
        if input.signers.index_of(id)? != input.my_index() {
            Err(CallerError::InvalidArgument(String::from(
                "signer subset places this node at a different party index",
            )))?;
        }
        for other in &other_participant_ids {
            input.signers.index_of(*other)?;
        }
        if other_participant_ids.len() + 1 != input.signers.len() {
            Err(CallerError::InvalidArgument(String::from(
                "signer subset does not match the participant list",
            )))?;
        }

        Ok(Self {
            sid,
            id,
            other_participant_ids,
            local_storage: Default::default(),
            message_queue: Default::default(),
            progress: Default::default(),
            input,
            status: Status::Initialized,
        })
    }

    fn ready_type() -> MessageType {
        MessageType::Sign(SignMessageType::Ready)
    }

    fn id(&self) -> ParticipantIdentifier {
        self.id
    }

    fn other_ids(&self) -> &[ParticipantIdentifier] {
        &self.other_participant_ids
    }

    fn sid(&self) -> Identifier {
        self.sid
    }

    #[instrument(skip_all)]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>> {
        info!("Processing signing message.");

        if matches!(
            self.status,
            Status::TerminatedSuccessfully | Status::Aborted
        ) {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }

        match message.message_type() {
            MessageType::Sign(SignMessageType::Ready) => self.handle_ready_msg(rng, message),
            MessageType::Sign(SignMessageType::R1Commit) => {
                self.handle_round_one_msg(rng, message)
            }
            MessageType::Sign(SignMessageType::R2MtA) => self.handle_round_two_msg(rng, message),
            MessageType::Sign(SignMessageType::R3Delta) => {
                self.handle_round_three_msg(rng, message)
            }
            MessageType::Sign(SignMessageType::R4PartialSig) => {
                self.handle_round_four_msg(message)
            }
            message_type => {
                error!(
                    "Incorrect MessageType given to SignParticipant. Got: {:?}",
                    message_type
                );
                Err(InternalError::InternalInvariantFailed)
            }
        }
    }

    fn status(&self) -> &Self::Status {
        &self.status
    }
}

impl InnerProtocolParticipant for SignParticipant {
    fn local_storage(&self) -> &LocalStorage {
        &self.local_storage
    }

    fn local_storage_mut(&mut self) -> &mut LocalStorage {
        &mut self.local_storage
    }

    fn message_queue_mut(&mut self) -> &mut MessageQueue {
        &mut self.message_queue
    }

    fn progress_mut(&mut self) -> &mut HashSet<&'static str> {
        &mut self.progress
    }
}

impl SignParticipant {
    /// The message that signals this participant to start the session.
    pub fn ready_message(&self) -> Message {
        Message::new(Self::ready_type(), self.sid, self.id, self.id, &[])
    }

    fn abort<T>(&mut self, reason: SigningError) -> Result<T> {
        error!("Aborting signing session: {reason}");
        self.status = Status::Aborted;
        self.local_storage = Default::default();
        Err(reason.into())
    }

    /// Handle "Ready" messages from the signer subset.
    #[instrument(skip_all, err(Debug))]
    fn handle_ready_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling ready signing message.");

        let (ready_messages, is_ready) = self.process_ready_message::<storage::Ready>(message)?;
        if !is_ready {
            return Ok(ProcessOutcome::from_messages(ready_messages));
        }

        let round_one_messages = run_only_once!(self.gen_round_one_msgs(rng))?;

        // Peer round-one messages may have arrived while our own Paillier
        // generation was pending; both conditions are checked here so the
        // last arrival wins.
        let outcome = self.advance_if_round_one_complete(rng)?;
        Ok(outcome
            .with_messages(ready_messages)
            .with_messages(round_one_messages))
    }

    /// Generate the session's round one message: nonce commitments, the
    /// fresh session Paillier key, the encrypted nonce, and both proofs of
    /// knowledge.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_one_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round one signing messages.");

        // Reserve the round before the long-running keypair generation.
        self.status = Status::Round1;

        let k = random_nonzero_scalar(rng)?;
        let gamma = random_nonzero_scalar(rng)?;
        let gamma_commitment = CurvePoint::GENERATOR.multiply_by_scalar(&gamma);
        let nonce_commitment = CurvePoint::GENERATOR.multiply_by_scalar(&k);

        // The longest blocking computation in the system.
        let paillier_sk = PaillierDecryptionKey::new(rng)?;
        let paillier_pk = paillier_sk.encryption_key();
        let nonce_ciphertext = paillier_pk.encrypt(rng, &scalar_to_bn(&k))?;

        let gamma_proof = SchnorrProof::prove(
            &gamma,
            &gamma_commitment,
            &SchnorrContext::sign_gamma(self.sid),
            rng,
        )?;
        let nonce_proof = SchnorrProof::prove(
            &k,
            &nonce_commitment,
            &SchnorrContext::sign_nonce(self.sid),
            rng,
        )?;

        let public = round_one::Public {
            party_index: self.input.my_index(),
            gamma_commitment,
            nonce_commitment,
            modulus: paillier_pk.n().clone(),
            nonce_ciphertext,
            gamma_proof,
            nonce_proof,
        };

        self.local_storage.store::<storage::RoundOnePrivate>(
            self.id,
            round_one::Private {
                k,
                gamma,
                paillier_sk,
            },
        );
        self.local_storage
            .store::<storage::RoundOnePublic>(self.id, public.clone());

        self.message_for_other_participants(MessageType::Sign(SignMessageType::R1Commit), &public)
    }

    /// Handle a peer's round one broadcast.
    ///
    /// Messages arriving while this node's own keypair generation is still
    /// pending are recorded immediately; round two fires when the last of
    /// the two conditions (all peer messages, own keygen) is met.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_one_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round one signing message.");

        if self
            .local_storage
            .contains::<storage::RoundOnePublic>(message.from())
        {
            return self.abort(SigningError::Equivocation("R1Commit"));
        }

        let public = round_one::Public::from_message(message)?;
        let expected_index = self.input.signers.index_of(message.from())?;
        if let Err(reason) = public.verify(self.sid, expected_index) {
            self.status = Status::Aborted;
            self.local_storage = Default::default();
            return Err(reason);
        }
        self.local_storage
            .store::<storage::RoundOnePublic>(message.from(), public);

        self.advance_if_round_one_complete(rng)
    }

    fn advance_if_round_one_complete<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        let peers_done = self
            .local_storage
            .contains_for_all_ids::<storage::RoundOnePublic>(&self.other_participant_ids);
        let own_done = self
            .local_storage
            .contains::<storage::RoundOnePrivate>(self.id);
        if !peers_done || !own_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let round_two_messages = run_only_once!(self.gen_round_two_msgs(rng))?;

        let stashed = self.fetch_messages(MessageType::Sign(SignMessageType::R2MtA))?;
        let outcomes = stashed
            .iter()
            .map(|msg| self.handle_round_two_msg(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        ProcessOutcome::collect_with_messages(outcomes, round_two_messages)
    }

    /// Generate the session's round two messages: for every peer, the two
    /// MtA ciphertexts under the peer's session modulus.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_two_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round two signing messages.");

        self.status = Status::Round2;

        let gamma = self
            .local_storage
            .retrieve::<storage::RoundOnePrivate>(self.id)?
            .gamma;
        let gamma_commitment = self
            .local_storage
            .retrieve::<storage::RoundOnePublic>(self.id)?
            .gamma_commitment;
        let weighted = *self.input.weighted_share.as_scalar();

        let mut messages = Vec::with_capacity(self.other_participant_ids.len());
        for peer in self.other_participant_ids.clone() {
            let (delta_ciphertext, sigma_ciphertext) = {
                let peer_public = self.local_storage.retrieve::<storage::RoundOnePublic>(peer)?;
                let peer_pk =
                    PaillierEncryptionKey::from_validated_modulus(peer_public.modulus.clone());

                let beta_delta = random_scalar(rng)?;
                let beta_sigma = random_scalar(rng)?;

                let delta_ciphertext = peer_pk.homomorphic_mul_add(
                    rng,
                    &peer_public.nonce_ciphertext,
                    &scalar_to_bn(&gamma),
                    &scalar_to_bn(&beta_delta),
                )?;
                let sigma_ciphertext = peer_pk.homomorphic_mul_add(
                    rng,
                    &peer_public.nonce_ciphertext,
                    &scalar_to_bn(&weighted),
                    &scalar_to_bn(&beta_sigma),
                )?;

                self.local_storage.store::<storage::RoundTwoPrivate>(
                    peer,
                    round_two::Private {
                        neg_beta_delta: -beta_delta,
                        neg_beta_sigma: -beta_sigma,
                    },
                );
                (delta_ciphertext, sigma_ciphertext)
            };

            let public = round_two::Public {
                delta_ciphertext,
                sigma_ciphertext,
                gamma_commitment,
            };
            messages.push(Message::new(
                MessageType::Sign(SignMessageType::R2MtA),
                self.sid,
                self.id,
                peer,
                &serialize!(&public)?,
            ));
        }
        Ok(messages)
    }

    /// Handle a peer's MtA ciphertexts addressed to this signer.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_two_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round two signing message.");

        if message.to() != self.id {
            return Err(InternalError::WrongMessageRecipient);
        }

        if !matches!(self.status, Status::Round2 | Status::Round3 | Status::Round4) {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        if self
            .local_storage
            .contains::<storage::RoundTwoPublic>(message.from())
        {
            return self.abort(SigningError::Equivocation("R2MtA"));
        }

        let public = round_two::Public::from_message(message)?;
        self.local_storage
            .store::<storage::RoundTwoPublic>(message.from(), public);

        let r2_done = self
            .local_storage
            .contains_for_all_ids::<storage::RoundTwoPublic>(&self.other_participant_ids);
        if !r2_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let round_three_messages = run_only_once!(self.gen_round_three_msgs())?;

        let stashed = self.fetch_messages(MessageType::Sign(SignMessageType::R3Delta))?;
        let outcomes = stashed
            .iter()
            .map(|msg| self.handle_round_three_msg(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        ProcessOutcome::collect_with_messages(outcomes, round_three_messages)
    }

    /// Generate the session's round three message: decrypt the inbound MtA
    /// results and broadcast the delta share.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_three_msgs(&mut self) -> Result<Vec<Message>> {
        info!("Generating round three signing messages.");

        self.status = Status::Round3;

        let (delta, sigma) = {
            let r1_private = self
                .local_storage
                .retrieve::<storage::RoundOnePrivate>(self.id)?;
            let weighted = *self.input.weighted_share.as_scalar();

            let mut delta = r1_private.k * r1_private.gamma;
            let mut sigma = r1_private.k * weighted;

            for peer in &self.other_participant_ids {
                let r2_public = self.local_storage.retrieve::<storage::RoundTwoPublic>(*peer)?;
                let r2_private = self.local_storage.retrieve::<storage::RoundTwoPrivate>(*peer)?;

                let delta_plain = r1_private
                    .paillier_sk
                    .decrypt(&r2_public.delta_ciphertext)?;
                let sigma_plain = r1_private
                    .paillier_sk
                    .decrypt(&r2_public.sigma_ciphertext)?;

                delta += bn_to_scalar(&delta_plain)? + r2_private.neg_beta_delta;
                sigma += bn_to_scalar(&sigma_plain)? + r2_private.neg_beta_sigma;
            }
            (delta, sigma)
        };

        let public = round_three::Public { delta_share: delta };
        self.local_storage
            .store::<storage::RoundThreePrivate>(self.id, round_three::Private { delta, sigma });
        self.local_storage
            .store::<storage::RoundThreePublic>(self.id, public.clone());

        self.message_for_other_participants(MessageType::Sign(SignMessageType::R3Delta), &public)
    }

    /// Handle a peer's delta broadcast.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_three_msg<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round three signing message.");

        if !matches!(self.status, Status::Round3 | Status::Round4) {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        if self
            .local_storage
            .contains::<storage::RoundThreePublic>(message.from())
        {
            return self.abort(SigningError::Equivocation("R3Delta"));
        }

        let public = round_three::Public::from_message(message)?;
        self.local_storage
            .store::<storage::RoundThreePublic>(message.from(), public);

        let r3_done = self
            .local_storage
            .contains_for_all_ids::<storage::RoundThreePublic>(&self.all_participants());
        if !r3_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let round_four_messages = run_only_once!(self.gen_round_four_msgs())?;

        let stashed = self.fetch_messages(MessageType::Sign(SignMessageType::R4PartialSig))?;
        let outcomes = stashed
            .iter()
            .map(|msg| self.handle_round_four_msg(msg))
            .collect::<Result<Vec<_>>>()?;
        ProcessOutcome::collect_with_messages(outcomes, round_four_messages)
    }

    /// Generate the session's round four message: aggregate the deltas,
    /// derive the nonce point, and broadcast the partial signature.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_four_msgs(&mut self) -> Result<Vec<Message>> {
        info!("Generating round four signing messages.");

        self.status = Status::Round4;

        let mut delta_total = Scalar::ZERO;
        let mut gamma_total = CurvePoint::IDENTITY;
        for participant in self.all_participants() {
            delta_total += &self
                .local_storage
                .retrieve::<storage::RoundThreePublic>(participant)?
                .delta_share;
            gamma_total = gamma_total
                + self
                    .local_storage
                    .retrieve::<storage::RoundOnePublic>(participant)?
                    .gamma_commitment;
        }

        if bool::from(delta_total.is_zero()) {
            return self.abort(SigningError::DegenerateDelta);
        }
        let delta_inv = invert_scalar(&delta_total)?;
        let nonce_point = gamma_total.multiply_by_scalar(&delta_inv);
        let r = nonce_point.x_projection()?;
        if bool::from(r.is_zero()) {
            return self.abort(SigningError::DegenerateR);
        }
        self.local_storage
            .store::<storage::NoncePoint>(self.id, (nonce_point, r));

        let (partial_signature, sigma_commitment) = {
            let r1_private = self
                .local_storage
                .retrieve::<storage::RoundOnePrivate>(self.id)?;
            let r3_private = self
                .local_storage
                .retrieve::<storage::RoundThreePrivate>(self.id)?;
            (
                self.input.message * r1_private.k + r * r3_private.sigma,
                CurvePoint::GENERATOR.multiply_by_scalar(&r3_private.sigma),
            )
        };

        let public = round_four::Public {
            partial_signature,
            sigma_commitment,
        };
        self.local_storage
            .store::<storage::RoundFourPublic>(self.id, public.clone());

        self.message_for_other_participants(
            MessageType::Sign(SignMessageType::R4PartialSig),
            &public,
        )
    }

    /// Handle a peer's partial signature: check it against the round one
    /// nonce commitment, and assemble the signature once every partial has
    /// arrived.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_four_msg(
        &mut self,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round four signing message.");

        if self.status != Status::Round4 {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        if self
            .local_storage
            .contains::<storage::RoundFourPublic>(message.from())
        {
            return self.abort(SigningError::Equivocation("R4PartialSig"));
        }

        let public = round_four::Public::from_message(message)?;
        let verified = {
            let (_, r) = *self.local_storage.retrieve::<storage::NoncePoint>(self.id)?;
            let nonce_commitment = self
                .local_storage
                .retrieve::<storage::RoundOnePublic>(message.from())?
                .nonce_commitment;
            public.verify(&self.input.message, &r, &nonce_commitment)
        };
        if verified.is_err() {
            return self.abort(SigningError::InvalidPartialSignature);
        }
        self.local_storage
            .store::<storage::RoundFourPublic>(message.from(), public);

        let r4_done = self
            .local_storage
            .contains_for_all_ids::<storage::RoundFourPublic>(&self.all_participants());
        if !r4_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let signature = self.assemble()?;
        Ok(ProcessOutcome::Terminated(signature))
    }

    /// Assemble and verify the final signature. Every signer runs this
    /// independently; a signature that fails verification against the
    /// derived child key is never released.
    fn assemble(&mut self) -> Result<Signature> {
        let mut s = Scalar::ZERO;
        for participant in self.all_participants() {
            s += &self
                .local_storage
                .retrieve::<storage::RoundFourPublic>(participant)?
                .partial_signature;
        }
        let (nonce_point, r) = *self.local_storage.retrieve::<storage::NoncePoint>(self.id)?;

        // EIP-2 low-s normalization; negating s mirrors the nonce point.
        let mut y_parity = nonce_point.y_is_odd();
        if scalar_is_high(&s) {
            s = -s;
            y_parity = !y_parity;
        }

        let signature = Signature::new(r, s, y_parity);
        if !signature.verify_scalar(&self.input.child_public_key, &self.input.message) {
            return self.abort(SigningError::AssembledSignatureInvalid);
        }

        // The session's secrets are no longer needed.
        self.local_storage = Default::default();
        self.status = Status::TerminatedSuccessfully;
        Ok(signature)
    }
}
