//! Types and functions related to the key generation ceremony participant.

// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, DkgError, InternalError, Result},
    hybrid::{self, IdentityKeypair},
    keygen::{
        commit::{DkgCommit, DkgDecommit, DkgEncryptedShare, DkgPublicShare},
        keyshare::{derive_chain_code, KeyShare, KeySharePrivate, PublicKeyShare},
    },
    local_storage::{LocalStorage, TypeTag},
    message_queue::MessageQueue,
    messages::{KeygenMessageType, Message, MessageType},
    participant::{run_only_once, InnerProtocolParticipant, ProcessOutcome, ProtocolParticipant},
    protocol::{Identifier, ParticipantIdentifier, PartyRoster},
    schnorr::{SchnorrContext, SchnorrProof},
    sharing::{FeldmanCommitment, HashCommitment, Polynomial},
    utils::{random_nonzero_scalar, CurvePoint},
};
use generic_array::GenericArray;
use k256::{elliptic_curve::group::ff::PrimeField, Scalar};
use rand::{CryptoRng, RngCore};
use std::collections::{HashMap, HashSet};
use tracing::{error, info, instrument};
use zeroize::Zeroize;

mod storage {
    use super::*;

    pub(super) struct Ready;
    impl TypeTag for Ready {
        type Value = ();
    }
    pub(super) struct Commit;
    impl TypeTag for Commit {
        type Value = DkgCommit;
    }
    pub(super) struct Decommit;
    impl TypeTag for Decommit {
        type Value = DkgDecommit;
    }
    pub(super) struct SecretPolynomial;
    impl TypeTag for SecretPolynomial {
        type Value = Polynomial;
    }
    pub(super) struct ReceivedShare;
    impl TypeTag for ReceivedShare {
        type Value = Scalar;
    }
    pub(super) struct MyShare;
    impl TypeTag for MyShare {
        type Value = KeySharePrivate;
    }
    pub(super) struct Confirmation;
    impl TypeTag for Confirmation {
        type Value = DkgPublicShare;
    }
}

/// Protocol status for [`DkgParticipant`].
///
/// Rounds are reserved synchronously before any message for them leaves, so
/// an inbound message always observes the post-transition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The ceremony has been initialized but not all parties are ready.
    Initialized,
    /// Commitments are being exchanged.
    Round1,
    /// Commitment openings and proofs of knowledge are being exchanged.
    Round2,
    /// Encrypted Shamir shares are being exchanged.
    Round3,
    /// Public shares and confirmations are being exchanged.
    Round4,
    /// The ceremony terminated successfully.
    TerminatedSuccessfully,
    /// The ceremony aborted; all in-memory material has been discarded.
    Aborted,
}

/// Input for a key generation ceremony.
#[derive(Debug)]
pub struct Input {
    threshold: usize,
    roster: PartyRoster,
    identity: IdentityKeypair,
    peer_identities: HashMap<ParticipantIdentifier, CurvePoint>,
}

impl Input {
    /// Assemble the ceremony input.
    ///
    /// `roster` fixes party indices by proposal order; `peer_identities`
    /// must contain an identity public key for every other roster member.
    pub fn new(
        threshold: usize,
        roster: PartyRoster,
        identity: IdentityKeypair,
        peer_identities: HashMap<ParticipantIdentifier, CurvePoint>,
    ) -> Result<Self> {
        if threshold < 2 || threshold > roster.count() {
            Err(CallerError::InvalidArgument(String::from(
                "threshold must be in [2, total parties]",
            )))?;
        }
        Ok(Self {
            threshold,
            roster,
            identity,
            peer_identities,
        })
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    pub(crate) fn roster(&self) -> &PartyRoster {
        &self.roster
    }

    fn peer_identity(&self, id: ParticipantIdentifier) -> Result<&CurvePoint> {
        self.peer_identities.get(&id).ok_or_else(|| {
            CallerError::InvalidArgument(String::from("missing peer identity key")).into()
        })
    }
}

/// A [`ProtocolParticipant`] that runs the four-round key generation
/// ceremony.
///
/// # Protocol input
/// The ceremony [`Input`]: threshold, roster, this node's identity keypair,
/// and the peers' identity public keys.
///
/// # Protocol output
/// Upon successful completion, the participant produces a [`KeyShare`]: its
/// Shamir share of the never-materialized master secret, every party's
/// public share, the master public key, and the chain code.
///
/// # 🔒 Storage requirements
/// The [`KeyShare`] requires secure persistent storage; hand it to the
/// key-share store rather than writing it yourself.
///
/// # High-level protocol description
/// - In round one, each party samples a secret polynomial and broadcasts a
///   hash commitment to its Feldman coefficient commitments.
/// - In round two, each party opens its commitment and proves knowledge of
///   its polynomial intercept.
/// - In round three, each party sends every peer its Shamir share, encrypted
///   under the peer's identity key; receivers verify shares against the
///   opened Feldman commitments.
/// - In round four, each party broadcasts its aggregated public share. Once
///   all confirmations arrive, every node independently assembles the master
///   public key and chain code and persists its share.
#[derive(Debug)]
pub struct DkgParticipant {
    /// The current ceremony identifier.
    sid: Identifier,
    /// A unique identifier for this participant.
    id: ParticipantIdentifier,
    /// A list of all other participant identifiers participating in the
    /// ceremony.
    other_participant_ids: Vec<ParticipantIdentifier>,
    /// Local storage for this participant to store state of the run.
    local_storage: LocalStorage,
    /// Stash for messages that arrive ahead of the local round.
    message_queue: MessageQueue,
    /// Guards for once-only round initiation.
    progress: HashSet<&'static str>,
    /// Ceremony input.
    input: Input,
    /// Status of the protocol execution.
    status: Status,
}

impl ProtocolParticipant for DkgParticipant {
    type Input = Input;
    type Output = KeyShare;
    type Status = Status;

    fn new(
        sid: Identifier,
        id: ParticipantIdentifier,
        other_participant_ids: Vec<ParticipantIdentifier>,
        input: Self::Input,
    ) -> Result<Self> {
        input.roster.index_of(id)?;
        for other in &other_participant_ids {
            input.roster.index_of(*other)?;
            input.peer_identity(*other)?;
        }
        if other_participant_ids.len() + 1 != input.roster.count() {
            Err(CallerError::InvalidArgument(String::from(
                "roster does not match the participant list",
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
        MessageType::Keygen(KeygenMessageType::Ready)
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
        info!("Processing keygen message.");

        if matches!(
            self.status,
            Status::TerminatedSuccessfully | Status::Aborted
        ) {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }

        match message.message_type() {
            MessageType::Keygen(KeygenMessageType::Ready) => self.handle_ready_msg(rng, message),
            MessageType::Keygen(KeygenMessageType::R1CommitHash) => {
                self.handle_round_one_msg(rng, message)
            }
            MessageType::Keygen(KeygenMessageType::R2Decommit) => {
                self.handle_round_two_msg(rng, message)
            }
            MessageType::Keygen(KeygenMessageType::R3EncryptedShare) => {
                self.handle_round_three_msg(rng, message)
            }
            MessageType::Keygen(KeygenMessageType::R4PublicShare) => {
                self.handle_round_four_msg(message)
            }
            message_type => {
                error!(
                    "Incorrect MessageType given to DkgParticipant. Got: {:?}",
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

impl InnerProtocolParticipant for DkgParticipant {
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

impl DkgParticipant {
    /// The message that signals this participant to start the ceremony.
    pub fn ready_message(&self) -> Message {
        Message::new(Self::ready_type(), self.sid, self.id, self.id, &[])
    }

    /// This node's party index in the ceremony roster.
    pub fn party_index(&self) -> Result<u32> {
        self.input.roster.index_of(self.id)
    }

    /// The ceremony roster.
    pub fn roster(&self) -> &PartyRoster {
        self.input.roster()
    }

    fn abort<T>(&mut self, reason: DkgError) -> Result<T> {
        error!("Aborting key generation ceremony: {reason}");
        self.status = Status::Aborted;
        self.local_storage = Default::default();
        Err(reason.into())
    }

    /// Handle "Ready" messages from the ceremony participants.
    #[instrument(skip_all, err(Debug))]
    fn handle_ready_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling ready keygen message.");

        let (ready_messages, is_ready) = self.process_ready_message::<storage::Ready>(message)?;
        if !is_ready {
            return Ok(ProcessOutcome::from_messages(ready_messages));
        }

        let round_one_messages = run_only_once!(self.gen_round_one_msgs(rng))?;

        // Peers may all have committed before we were ready.
        let outcome = self.advance_if_round_one_complete(rng)?;
        Ok(outcome
            .with_messages(ready_messages)
            .with_messages(round_one_messages))
    }

    /// Generate the ceremony's round one message: a hash commitment binding
    /// this party's Feldman vector and proof of knowledge.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_one_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round one keygen messages.");

        // Reserve the round before anything leaves this node.
        self.status = Status::Round1;

        let my_index = self.party_index()?;
        let intercept = random_nonzero_scalar(rng)?;
        let polynomial = Polynomial::sample(intercept, self.input.threshold(), rng)?;
        let feldman = FeldmanCommitment::commit(&polynomial);
        let blinding = HashCommitment::random_blinding(rng);
        let commitment = HashCommitment::commit(feldman.points(), &blinding);

        let proof = SchnorrProof::prove(
            polynomial.intercept(),
            &feldman.intercept_commitment()?,
            &SchnorrContext::dkg_party(self.sid, my_index),
            rng,
        )?;

        let commit = DkgCommit {
            party_index: my_index,
            commitment,
        };
        let decommit = DkgDecommit {
            party_index: my_index,
            feldman,
            blinding,
            proof,
        };

        self.local_storage
            .store::<storage::SecretPolynomial>(self.id, polynomial);
        self.local_storage
            .store::<storage::Commit>(self.id, commit.clone());
        self.local_storage
            .store::<storage::Decommit>(self.id, decommit);

        self.message_for_other_participants(
            MessageType::Keygen(KeygenMessageType::R1CommitHash),
            &commit,
        )
    }

    /// Handle a peer's round one commitment.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_one_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round one keygen message.");

        let commit = DkgCommit::from_message(message)?;
        if commit.party_index != self.input.roster.index_of(message.from())? {
            return self.abort(DkgError::CommitmentMismatch);
        }
        if !self
            .local_storage
            .store_once::<storage::Commit>(message.from(), commit)
        {
            return self.abort(DkgError::DuplicateMessage("R1CommitHash"));
        }

        self.advance_if_round_one_complete(rng)
    }

    fn advance_if_round_one_complete<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        let r1_done = self
            .local_storage
            .contains_for_all_ids::<storage::Commit>(&self.all_participants());
        if !r1_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let round_two_messages = run_only_once!(self.gen_round_two_msgs())?;

        // Process any round two messages we may have received early.
        let stashed = self.fetch_messages(MessageType::Keygen(KeygenMessageType::R2Decommit))?;
        let outcomes = stashed
            .iter()
            .map(|msg| self.handle_round_two_msg(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        ProcessOutcome::collect_with_messages(outcomes, round_two_messages)
    }

    /// Generate the ceremony's round two messages: the opening of the round
    /// one commitment.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_two_msgs(&mut self) -> Result<Vec<Message>> {
        info!("Generating round two keygen messages.");

        self.status = Status::Round2;
        let decommit = self
            .local_storage
            .retrieve::<storage::Decommit>(self.id)?
            .clone();
        self.message_for_other_participants(
            MessageType::Keygen(KeygenMessageType::R2Decommit),
            &decommit,
        )
    }

    /// Handle a peer's round two opening: check it against the round one
    /// commitment and verify the proof of knowledge.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_two_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round two keygen message.");

        // We must receive all commitments in round one before we start
        // processing openings in round two.
        let r1_done = self
            .local_storage
            .contains_for_all_ids::<storage::Commit>(&self.all_participants());
        if !r1_done {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        if self.local_storage.contains::<storage::Decommit>(message.from()) {
            return self.abort(DkgError::DuplicateMessage("R2Decommit"));
        }

        let decommit = DkgDecommit::from_message(message)?;
        let expected_index = self.input.roster.index_of(message.from())?;
        let commit = self.local_storage.retrieve::<storage::Commit>(message.from())?;
        if let Err(reason) =
            decommit.verify(self.sid, expected_index, self.input.threshold(), commit)
        {
            self.status = Status::Aborted;
            self.local_storage = Default::default();
            return Err(reason);
        }
        self.local_storage
            .store::<storage::Decommit>(message.from(), decommit);

        let r2_done = self
            .local_storage
            .contains_for_all_ids::<storage::Decommit>(&self.all_participants());
        if !r2_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let round_three_messages = run_only_once!(self.gen_round_three_msgs(rng))?;

        let stashed =
            self.fetch_messages(MessageType::Keygen(KeygenMessageType::R3EncryptedShare))?;
        let outcomes = stashed
            .iter()
            .map(|msg| self.handle_round_three_msg(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        ProcessOutcome::collect_with_messages(outcomes, round_three_messages)
    }

    /// Generate the ceremony's round three messages: per-peer Shamir shares,
    /// each encrypted under the recipient's identity key.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_three_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round three keygen messages.");

        self.status = Status::Round3;

        let shares: Vec<(ParticipantIdentifier, Scalar)> = {
            let polynomial = self
                .local_storage
                .retrieve::<storage::SecretPolynomial>(self.id)?;
            self.other_participant_ids
                .iter()
                .map(|&peer| {
                    let index = self.input.roster.index_of(peer)?;
                    Ok((peer, polynomial.evaluate(index)))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let mut messages = Vec::with_capacity(shares.len());
        for (peer, mut share) in shares {
            let peer_identity = self.input.peer_identity(peer)?;
            let mut plaintext: [u8; 32] = share.to_bytes().into();
            let ciphertext = hybrid::encrypt(rng, peer_identity, &plaintext)?;
            plaintext.zeroize();
            share.zeroize();

            let payload = DkgEncryptedShare { ciphertext };
            messages.push(Message::new(
                MessageType::Keygen(KeygenMessageType::R3EncryptedShare),
                self.sid,
                self.id,
                peer,
                &serialize!(&payload)?,
            ));
        }
        Ok(messages)
    }

    /// Handle an encrypted share addressed to this participant: decrypt it
    /// and verify it against the sender's opened Feldman commitments. A
    /// failure here indicates a cheating sender and aborts the ceremony.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_three_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round three keygen message.");

        if message.to() != self.id {
            return Err(InternalError::WrongMessageRecipient);
        }

        // Shares can only be verified after the sender's opening arrived;
        // hold early messages until our own round three has fired.
        if !matches!(self.status, Status::Round3 | Status::Round4) {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        if self
            .local_storage
            .contains::<storage::ReceivedShare>(message.from())
        {
            return self.abort(DkgError::DuplicateMessage("R3EncryptedShare"));
        }

        let payload = DkgEncryptedShare::from_message(message)?;
        let plaintext = match hybrid::decrypt(&self.input.identity, &payload.ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => return self.abort(DkgError::ShareDecryptionFailed),
        };
        if plaintext.len() != 32 {
            return self.abort(DkgError::ShareDecryptionFailed);
        }
        let share: Option<Scalar> = Option::from(Scalar::from_repr(
            GenericArray::clone_from_slice(&plaintext),
        ));
        let share = match share {
            Some(share) => share,
            None => return self.abort(DkgError::ShareDecryptionFailed),
        };

        let my_index = self.party_index()?;
        let sender_feldman = &self
            .local_storage
            .retrieve::<storage::Decommit>(message.from())?
            .feldman;
        if !sender_feldman.verify_share(&share, my_index) {
            return self.abort(DkgError::ShareVerificationFailed);
        }
        self.local_storage
            .store::<storage::ReceivedShare>(message.from(), share);

        let r3_done = self
            .local_storage
            .contains_for_all_ids::<storage::ReceivedShare>(&self.other_participant_ids);
        if !r3_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let round_four_messages = run_only_once!(self.gen_round_four_msgs(rng))?;

        let stashed = self.fetch_messages(MessageType::Keygen(KeygenMessageType::R4PublicShare))?;
        let outcomes = stashed
            .iter()
            .map(|msg| self.handle_round_four_msg(msg))
            .collect::<Result<Vec<_>>>()?;
        ProcessOutcome::collect_with_messages(outcomes, round_four_messages)
    }

    /// Generate the ceremony's round four message: the aggregated public
    /// share and share-verification confirmation.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_four_msgs<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
    ) -> Result<Vec<Message>> {
        info!("Generating round four keygen messages.");

        self.status = Status::Round4;

        let my_index = self.party_index()?;
        // x_i = f_i(i) + sum_j f_j(i); the polynomial is erased afterwards.
        let polynomial = self
            .local_storage
            .remove::<storage::SecretPolynomial>(self.id)?;
        let mut x = polynomial.evaluate(my_index);
        drop(polynomial);
        for peer in &self.other_participant_ids {
            x += self.local_storage.retrieve::<storage::ReceivedShare>(*peer)?;
        }

        let public_share = CurvePoint::GENERATOR.multiply_by_scalar(&x);
        self.local_storage
            .store::<storage::MyShare>(self.id, KeySharePrivate::new(x));
        x.zeroize();

        let payload = DkgPublicShare {
            party_index: my_index,
            public_share,
            share_verified: true,
        };
        self.local_storage
            .store::<storage::Confirmation>(self.id, payload.clone());

        self.message_for_other_participants(
            MessageType::Keygen(KeygenMessageType::R4PublicShare),
            &payload,
        )
    }

    /// Handle a peer's round four confirmation: check the reported public
    /// share against the Feldman commitments, and assemble the ceremony
    /// output once every confirmation has arrived.
    #[instrument(skip_all, err(Debug))]
    fn handle_round_four_msg(
        &mut self,
        message: &Message,
    ) -> Result<ProcessOutcome<<Self as ProtocolParticipant>::Output>> {
        info!("Handling round four keygen message.");

        if self.status != Status::Round4 {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        if self
            .local_storage
            .contains::<storage::Confirmation>(message.from())
        {
            return self.abort(DkgError::DuplicateMessage("R4PublicShare"));
        }

        let payload = DkgPublicShare::from_message(message)?;
        let sender_index = self.input.roster.index_of(message.from())?;
        if payload.party_index != sender_index || !payload.share_verified {
            return self.abort(DkgError::PublicShareMismatch);
        }
        if payload.public_share != self.expected_public_share(sender_index)? {
            return self.abort(DkgError::PublicShareMismatch);
        }
        self.local_storage
            .store::<storage::Confirmation>(message.from(), payload);

        let all_confirmed = self
            .local_storage
            .contains_for_all_ids::<storage::Confirmation>(&self.all_participants());
        if !all_confirmed {
            return Ok(ProcessOutcome::Incomplete);
        }

        let key_share = self.assemble()?;
        // The ceremony's working state is no longer needed.
        self.local_storage = Default::default();
        self.status = Status::TerminatedSuccessfully;
        Ok(ProcessOutcome::Terminated(key_share))
    }

    /// `x_j * G` as implied by every party's Feldman commitments.
    fn expected_public_share(&self, party_index: u32) -> Result<CurvePoint> {
        let mut expected = CurvePoint::IDENTITY;
        for participant in self.all_participants() {
            let feldman = &self
                .local_storage
                .retrieve::<storage::Decommit>(participant)?
                .feldman;
            expected = expected + feldman.expected_public_share(party_index);
        }
        Ok(expected)
    }

    /// Assemble the ceremony output. Every node runs this locally; the
    /// ceremony-wide completion broadcast is informational.
    fn assemble(&mut self) -> Result<KeyShare> {
        let mut public_key = CurvePoint::IDENTITY;
        for participant in self.all_participants() {
            let feldman = &self
                .local_storage
                .retrieve::<storage::Decommit>(participant)?
                .feldman;
            public_key = public_key + feldman.intercept_commitment()?;
        }
        let chain_code = derive_chain_code(&public_key);

        let roster = self.input.roster.clone();
        let public_key_shares = roster
            .entries()
            .keys()
            .map(|&index| {
                Ok(PublicKeyShare::new(
                    index,
                    self.expected_public_share(index)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let private_share = self.local_storage.remove::<storage::MyShare>(self.id)?;
        let my_index = self.party_index()?;
        let my_public = public_key_shares
            .iter()
            .find(|share| share.party_index() == my_index)
            .ok_or(InternalError::InternalInvariantFailed)?;
        if CurvePoint::GENERATOR.multiply_by_scalar(private_share.as_scalar())
            != *my_public.share()
        {
            return Err(InternalError::InternalInvariantFailed);
        }

        Ok(KeyShare::new(
            my_index,
            private_share,
            public_key_shares,
            public_key,
            chain_code,
            self.sid,
            self.input.threshold(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sharing::lagrange_at_zero, utils::testing::init_testing};
    use k256::elliptic_curve::Field;
    use rand::{rngs::StdRng, Rng};
    use std::collections::HashMap;
    use tracing::debug;

    struct TestNode {
        participant: DkgParticipant,
        identity: IdentityKeypair,
    }

    fn new_quorum(
        quorum_size: usize,
        threshold: usize,
        sid: Identifier,
        rng: &mut StdRng,
    ) -> Result<Vec<TestNode>> {
        let ids = (0..quorum_size)
            .map(|_| ParticipantIdentifier::random(rng))
            .collect::<Vec<_>>();
        let identities = ids
            .iter()
            .map(|&id| Ok((id, IdentityKeypair::generate(rng)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let roster = PartyRoster::new(ids.clone())?;

        ids.iter()
            .map(|&id| {
                let other_ids = ids.iter().copied().filter(|&o| o != id).collect::<Vec<_>>();
                let peer_identities = other_ids
                    .iter()
                    .map(|&peer| (peer, identities[&peer].public()))
                    .collect();
                let identity = identities[&id].clone();
                let input = Input::new(
                    threshold,
                    roster.clone(),
                    identity.clone(),
                    peer_identities,
                )?;
                Ok(TestNode {
                    participant: DkgParticipant::new(sid, id, other_ids, input)?,
                    identity,
                })
            })
            .collect()
    }

    fn deliver_all(
        messages: &[Message],
        inboxes: &mut HashMap<ParticipantIdentifier, Vec<Message>>,
    ) {
        for message in messages {
            inboxes
                .get_mut(&message.to())
                .expect("recipient exists")
                .push(message.clone());
        }
    }

    fn is_dkg_done(quorum: &[TestNode]) -> bool {
        quorum
            .iter()
            .all(|node| *node.participant.status() == Status::TerminatedSuccessfully)
    }

    fn run_dkg_to_completion(
        quorum: &mut Vec<TestNode>,
        rng: &mut StdRng,
    ) -> Vec<KeyShare> {
        let mut inboxes: HashMap<_, Vec<Message>> = quorum
            .iter()
            .map(|node| (node.participant.id(), vec![]))
            .collect();
        let mut outputs: HashMap<ParticipantIdentifier, KeyShare> = HashMap::new();

        for node in quorum.iter() {
            inboxes
                .get_mut(&node.participant.id())
                .unwrap()
                .push(node.participant.ready_message());
        }

        while !is_dkg_done(quorum) {
            let index = rng.gen_range(0..quorum.len());
            let node = quorum.get_mut(index).unwrap();
            let inbox = inboxes.get_mut(&node.participant.id()).unwrap();
            if inbox.is_empty() {
                continue;
            }
            let message = inbox.remove(rng.gen_range(0..inbox.len()));
            debug!(
                "processing participant: {}, with message type: {:?} from {}",
                &node.participant.id(),
                &message.message_type(),
                &message.from(),
            );
            let outcome = node.participant.process_message(rng, &message).unwrap();
            match outcome {
                ProcessOutcome::Incomplete => {}
                ProcessOutcome::Processed(messages) => deliver_all(&messages, &mut inboxes),
                ProcessOutcome::Terminated(output) => {
                    let _ = outputs.insert(node.participant.id(), output);
                }
                ProcessOutcome::TerminatedForThisParticipant(output, messages) => {
                    deliver_all(&messages, &mut inboxes);
                    let _ = outputs.insert(node.participant.id(), output);
                }
            }
        }

        quorum
            .iter()
            .map(|node| outputs.remove(&node.participant.id()).unwrap())
            .collect()
    }

    #[test]
    fn two_of_three_dkg_produces_consistent_outputs() {
        let mut rng = init_testing();
        let sid = Identifier::random(&mut rng);
        let mut quorum = new_quorum(3, 2, sid, &mut rng).unwrap();
        let outputs = run_dkg_to_completion(&mut quorum, &mut rng);

        // Every node derives the same master key and chain code.
        let public_key = *outputs[0].public_key();
        let chain_code = *outputs[0].chain_code();
        for output in &outputs {
            assert_eq!(*output.public_key(), public_key);
            assert_eq!(*output.chain_code(), chain_code);
            assert_eq!(output.ceremony(), sid);
            assert_eq!(output.threshold(), 2);
            assert_eq!(output.public_key_shares(), outputs[0].public_key_shares());
        }

        // Each private share matches its public image.
        for output in &outputs {
            let expected = output
                .public_key_shares()
                .iter()
                .find(|share| share.party_index() == output.party_index())
                .unwrap();
            assert_eq!(
                CurvePoint::GENERATOR.multiply_by_scalar(output.private_share().as_scalar()),
                *expected.share()
            );
        }

        // Any two shares interpolate to the same secret, and d * G = P.
        for subset in [[1u32, 2], [1, 3], [2, 3]] {
            let mut d = Scalar::ZERO;
            for &i in &subset {
                let output = outputs
                    .iter()
                    .find(|output| output.party_index() == i)
                    .unwrap();
                let weight = lagrange_at_zero(i, &subset).unwrap();
                d += weight * output.private_share().as_scalar();
            }
            assert_eq!(CurvePoint::GENERATOR.multiply_by_scalar(&d), public_key);
        }
    }

    #[test]
    fn tampered_round_three_share_aborts_the_ceremony() {
        let mut rng = init_testing();
        let sid = Identifier::random(&mut rng);
        let mut quorum = new_quorum(3, 2, sid, &mut rng).unwrap();

        let mut inboxes: HashMap<_, Vec<Message>> = quorum
            .iter()
            .map(|node| (node.participant.id(), vec![]))
            .collect();
        for node in quorum.iter() {
            inboxes
                .get_mut(&node.participant.id())
                .unwrap()
                .push(node.participant.ready_message());
        }

        let cheater = quorum[1].participant.id();
        let victim = quorum[2].participant.id();
        let victim_identity = quorum[2].identity.clone();
        let victim_pub = victim_identity.public();

        let mut abort_seen = false;
        'outer: for _ in 0..10_000 {
            let index = rng.gen_range(0..quorum.len());
            let node = quorum.get_mut(index).unwrap();
            let inbox = inboxes.get_mut(&node.participant.id()).unwrap();
            if inbox.is_empty() {
                continue;
            }
            let message = inbox.remove(rng.gen_range(0..inbox.len()));
            let outcome = match node.participant.process_message(&mut rng, &message) {
                Ok(outcome) => outcome,
                Err(error) => {
                    // Only the victim should fail, and only on the tampered
                    // share.
                    assert_eq!(node.participant.id(), victim);
                    assert_eq!(
                        error,
                        InternalError::Dkg(DkgError::ShareVerificationFailed)
                    );
                    assert_eq!(*node.participant.status(), Status::Aborted);
                    abort_seen = true;
                    break 'outer;
                }
            };
            let (output, messages) = outcome.into_parts();
            assert!(output.is_none(), "ceremony must not complete");

            // Tamper with the cheater's encrypted share to the victim by
            // adding one to the scalar inside.
            let messages = messages
                .into_iter()
                .map(|message| {
                    if message.message_type()
                        == MessageType::Keygen(KeygenMessageType::R3EncryptedShare)
                        && message.from() == cheater
                        && message.to() == victim
                    {
                        let payload = DkgEncryptedShare::from_message(&message).unwrap();
                        let plaintext =
                            hybrid::decrypt(&victim_identity, &payload.ciphertext).unwrap();
                        let share: Scalar = Option::from(Scalar::from_repr(
                            GenericArray::clone_from_slice(&plaintext),
                        ))
                        .unwrap();
                        let tampered = share + Scalar::ONE;
                        let ciphertext =
                            hybrid::encrypt(&mut rng, &victim_pub, &tampered.to_bytes())
                                .unwrap();
                        Message::new(
                            message.message_type(),
                            message.id(),
                            message.from(),
                            message.to(),
                            &serialize!(&DkgEncryptedShare { ciphertext }).unwrap(),
                        )
                    } else {
                        message
                    }
                })
                .collect::<Vec<_>>();
            deliver_all(&messages, &mut inboxes);
        }

        assert!(abort_seen, "victim never saw the tampered share");
    }

    #[test]
    fn duplicate_round_one_commit_is_an_equivocation() {
        let mut rng = init_testing();
        let sid = Identifier::random(&mut rng);
        let mut quorum = new_quorum(3, 2, sid, &mut rng).unwrap();

        // Drive node 0 to generate its round one commitment.
        let ready = quorum[0].participant.ready_message();
        let (_, first_round) = quorum[0]
            .participant
            .process_message(&mut rng, &ready)
            .unwrap()
            .into_parts();
        // Not ready until peers signal: only readiness relays go out.
        assert!(first_round
            .iter()
            .all(|message| message.message_type() == DkgParticipant::ready_type()));

        // Feed peer ready signals.
        let peer_ready: Vec<Message> = quorum[1..]
            .iter()
            .map(|node| {
                Message::new(
                    DkgParticipant::ready_type(),
                    sid,
                    node.participant.id(),
                    quorum[0].participant.id(),
                    &[],
                )
            })
            .collect();
        for message in &peer_ready {
            let _ = quorum[0]
                .participant
                .process_message(&mut rng, message)
                .unwrap();
        }
        assert_eq!(*quorum[0].participant.status(), Status::Round1);

        // Build a commit from node 1 and deliver it twice to node 0.
        let ready1 = quorum[1].participant.ready_message();
        let _ = quorum[1]
            .participant
            .process_message(&mut rng, &ready1)
            .unwrap();
        let others_ready: Vec<Message> = [&quorum[0], &quorum[2]]
            .iter()
            .map(|node| {
                Message::new(
                    DkgParticipant::ready_type(),
                    sid,
                    node.participant.id(),
                    quorum[1].participant.id(),
                    &[],
                )
            })
            .collect();
        let mut commits = vec![];
        for message in &others_ready {
            let (_, messages) = quorum[1]
                .participant
                .process_message(&mut rng, message)
                .unwrap()
                .into_parts();
            commits.extend(messages);
        }
        let commit_to_zero = commits
            .iter()
            .find(|message| {
                message.to() == quorum[0].participant.id()
                    && message.message_type()
                        == MessageType::Keygen(KeygenMessageType::R1CommitHash)
            })
            .unwrap()
            .clone();

        let _ = quorum[0]
            .participant
            .process_message(&mut rng, &commit_to_zero)
            .unwrap();
        let error = quorum[0]
            .participant
            .process_message(&mut rng, &commit_to_zero)
            .unwrap_err();
        assert_eq!(
            error,
            InternalError::Dkg(DkgError::DuplicateMessage("R1CommitHash"))
        );
        assert_eq!(*quorum[0].participant.status(), Status::Aborted);
    }
}
