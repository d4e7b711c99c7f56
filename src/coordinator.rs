// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The per-node ceremony coordinator.
//!
//! A node runs at most one ceremony at a time; the coordinator owns it as an
//! `Option`, applies inbound messages serially, enforces the session
//! deadline, deduplicates completion notices, and persists the key share
//! when a key generation ceremony terminates. Terminal transitions consume
//! the ceremony, dropping (and thereby zeroing) all session secrets.

use crate::{
    errors::{CallerError, DkgError, InternalError, Result, SigningError},
    hybrid::IdentityKeypair,
    keygen::{self, DkgParticipant},
    keystore::{CeremonyMetadata, KeyShareStore, Protection},
    messages::Message,
    participant::{ProcessOutcome, ProtocolParticipant},
    protocol::{Identifier, ParticipantIdentifier, PartyRoster},
    sign::{self, SignParticipant, SignRequest, Signature, SignerSet},
    utils::CurvePoint,
};
use rand::{CryptoRng, RngCore};
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument, warn};

/// The ceremony a coordinator is currently running.
enum ActiveCeremony {
    Dkg(Box<DkgParticipant>),
    Sign(Box<SignParticipant>),
}

struct Active {
    deadline_ms: u64,
    ceremony: ActiveCeremony,
}

/// What a processed message produced.
#[derive(Debug)]
pub enum Outcome {
    /// The ceremony continues; send these messages.
    Continue(Vec<Message>),
    /// Key generation finished and the share has been durably persisted.
    DkgComplete {
        /// Metadata written alongside the encrypted share.
        metadata: Box<CeremonyMetadata>,
        /// Final messages to deliver before the ceremony winds down.
        messages: Vec<Message>,
    },
    /// Signing finished; the signature has already been verified against
    /// the derived child key.
    Signed {
        signature: Signature,
        messages: Vec<Message>,
    },
    /// The message was dropped without touching ceremony state.
    Dropped,
}

/// The per-node coordinator owning the current ceremony.
pub struct Coordinator {
    node_id: ParticipantIdentifier,
    identity: IdentityKeypair,
    /// Peer identity public keys; immutable once learned.
    peer_identities: HashMap<ParticipantIdentifier, CurvePoint>,
    store: KeyShareStore,
    protection: Protection,
    active: Option<Active>,
    /// Sessions for which a completion has already been observed;
    /// completion notices are deduplicated by session identifier.
    finished_sessions: HashSet<Identifier>,
}

impl Coordinator {
    /// Build a coordinator for this node.
    pub fn new(
        node_id: ParticipantIdentifier,
        identity: IdentityKeypair,
        store: KeyShareStore,
        protection: Protection,
    ) -> Self {
        Self {
            node_id,
            identity,
            peer_identities: HashMap::new(),
            store,
            protection,
            active: None,
            finished_sessions: HashSet::new(),
        }
    }

    /// This node's identifier.
    pub fn node_id(&self) -> ParticipantIdentifier {
        self.node_id
    }

    /// This node's identity public key, shared with peers out of band.
    pub fn identity_public_key(&self) -> CurvePoint {
        self.identity.public()
    }

    /// Record a peer's identity key. Keys are immutable after learning; a
    /// conflicting registration is an error.
    pub fn register_peer(
        &mut self,
        peer: ParticipantIdentifier,
        identity_key: CurvePoint,
    ) -> Result<()> {
        match self.peer_identities.get(&peer) {
            Some(existing) if *existing != identity_key => Err(CallerError::InvalidArgument(
                String::from("peer identity key conflicts with the registered one"),
            ))?,
            _ => {
                let _ = self.peer_identities.insert(peer, identity_key);
                Ok(())
            }
        }
    }

    /// Whether a ceremony is currently running.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Start a key generation ceremony from an accepted proposal.
    #[instrument(skip_all, err(Debug))]
    pub fn begin_dkg<R: RngCore + CryptoRng>(
        &mut self,
        ceremony_id: Identifier,
        roster: PartyRoster,
        threshold: usize,
        deadline_ms: u64,
        rng: &mut R,
    ) -> Result<Vec<Message>> {
        if self.active.is_some() {
            Err(CallerError::CeremonyInProgress)?;
        }

        let other_ids: Vec<ParticipantIdentifier> = roster
            .entries()
            .values()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect();
        let peer_identities = other_ids
            .iter()
            .map(|&peer| {
                let key = self.peer_identities.get(&peer).copied().ok_or_else(|| {
                    InternalError::from(CallerError::InvalidArgument(String::from(
                        "no identity key registered for a roster member",
                    )))
                })?;
                Ok((peer, key))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let input = keygen::Input::new(threshold, roster, self.identity.clone(), peer_identities)?;
        let mut participant =
            DkgParticipant::new(ceremony_id, self.node_id, other_ids, input)?;

        let ready = participant.ready_message();
        // Reserve the ceremony slot before processing anything, so a
        // re-entrant message routed to this session observes it.
        self.active = Some(Active {
            deadline_ms,
            ceremony: ActiveCeremony::Dkg(Box::new(participant)),
        });

        info!("Starting key generation ceremony {ceremony_id}");
        match self.handle_message(&ready, 0, rng)? {
            Outcome::Continue(messages) => Ok(messages),
            _ => Err(InternalError::InternalInvariantFailed),
        }
    }

    /// Evaluate a signing request as a potential signer.
    ///
    /// The transaction hash is recomputed from the raw transaction; on
    /// mismatch the request is silently declined (no reject is sent, the
    /// initiator's session times out). Returns whether to send
    /// `SIGN_ACCEPT`.
    #[instrument(skip_all)]
    pub fn evaluate_sign_request(&self, request: &SignRequest, now_ms: u64) -> bool {
        if self.active.is_some() {
            warn!("Declining signing request: a ceremony is already running");
            return false;
        }
        if now_ms >= request.deadline_ms {
            warn!("Declining signing request: deadline already passed");
            return false;
        }
        if request.validate().is_err() {
            // A mismatch means the initiator lied about what is being
            // signed. Do not even answer.
            warn!("Declining signing request: declared hash does not match the raw transaction");
            return false;
        }
        if !self.store.exists() {
            warn!("Declining signing request: no key share persisted");
            return false;
        }
        true
    }

    /// Start a signing session once the signer subset has been fixed by the
    /// acceptance round.
    #[instrument(skip_all, err(Debug))]
    pub fn begin_signing<R: RngCore + CryptoRng>(
        &mut self,
        request: &SignRequest,
        signers: SignerSet,
        rng: &mut R,
    ) -> Result<Vec<Message>> {
        if self.active.is_some() {
            Err(CallerError::CeremonyInProgress)?;
        }

        // The share is decrypted only to be folded into the session.
        let key_share = self.store.load(&self.protection)?;
        let input = sign::Input::from_request(key_share, signers.clone(), request)?;

        let other_ids: Vec<ParticipantIdentifier> = signers
            .ids()
            .into_iter()
            .filter(|&id| id != self.node_id)
            .collect();
        let mut participant =
            SignParticipant::new(request.session_id, self.node_id, other_ids, input)?;

        let ready = participant.ready_message();
        self.active = Some(Active {
            deadline_ms: request.deadline_ms,
            ceremony: ActiveCeremony::Sign(Box::new(participant)),
        });

        info!("Starting signing session {}", request.session_id);
        match self.handle_message(&ready, 0, rng)? {
            Outcome::Continue(messages) => Ok(messages),
            _ => Err(InternalError::InternalInvariantFailed),
        }
    }

    /// Apply one inbound protocol message to the active ceremony.
    ///
    /// Messages after the deadline are dropped silently (the deadline
    /// itself is enforced by [`Coordinator::check_deadline`]); messages for
    /// an unknown session are dropped; protocol failures tear down the
    /// ceremony and propagate the error after releasing all session state.
    #[instrument(skip_all, err(Debug))]
    pub fn handle_message<R: RngCore + CryptoRng>(
        &mut self,
        message: &Message,
        now_ms: u64,
        rng: &mut R,
    ) -> Result<Outcome> {
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => {
                warn!("Dropping message: no ceremony in progress");
                return Ok(Outcome::Dropped);
            }
        };

        if now_ms > active.deadline_ms {
            // Ceremony expired; release everything and drop the message.
            self.abort_active();
            return Ok(Outcome::Dropped);
        }

        let session_id = match &active.ceremony {
            ActiveCeremony::Dkg(participant) => participant.sid(),
            ActiveCeremony::Sign(participant) => participant.sid(),
        };
        if message.id() != session_id {
            warn!("Dropping message addressed to a different session");
            return Ok(Outcome::Dropped);
        }

        let result = match &mut active.ceremony {
            ActiveCeremony::Dkg(participant) => participant
                .process_message(rng, message)
                .map(DkgOrSignOutcome::Dkg),
            ActiveCeremony::Sign(participant) => participant
                .process_message(rng, message)
                .map(DkgOrSignOutcome::Sign),
        };

        match result {
            Err(error) => {
                // Any protocol failure is terminal for the ceremony.
                self.abort_active();
                Err(error)
            }
            Ok(DkgOrSignOutcome::Dkg(outcome)) => self.finish_dkg_outcome(outcome, now_ms, rng),
            Ok(DkgOrSignOutcome::Sign(outcome)) => self.finish_sign_outcome(outcome),
        }
    }

    /// Enforce the ceremony deadline. Returns `true` when an expiry was
    /// triggered; the caller should broadcast the informational abort.
    pub fn check_deadline(&mut self, now_ms: u64) -> bool {
        match &self.active {
            Some(active) if now_ms > active.deadline_ms => {
                warn!("Ceremony deadline expired; aborting");
                self.abort_active();
                true
            }
            _ => false,
        }
    }

    /// Record a peer's completion notice for a session. Completion notices
    /// are deduplicated by session identifier; the first one returns `true`
    /// and every replay returns `false`.
    pub fn record_completion(&mut self, session_id: Identifier) -> bool {
        self.finished_sessions.insert(session_id)
    }

    /// Handle an inbound abort notice for the active ceremony.
    pub fn handle_peer_abort(&mut self, session_id: Identifier, reason: &str) -> Result<()> {
        let matches = match &self.active {
            Some(Active {
                ceremony: ActiveCeremony::Dkg(participant),
                ..
            }) => participant.sid() == session_id,
            Some(Active {
                ceremony: ActiveCeremony::Sign(participant),
                ..
            }) => participant.sid() == session_id,
            None => false,
        };
        if !matches {
            return Ok(());
        }
        let is_dkg = matches!(
            self.active.as_ref().map(|active| &active.ceremony),
            Some(ActiveCeremony::Dkg(_))
        );
        self.abort_active();
        if is_dkg {
            Err(DkgError::PeerAbort(reason.to_string()))?
        } else {
            Err(SigningError::PeerAbort(reason.to_string()))?
        }
    }

    fn abort_active(&mut self) {
        // Dropping the participant drops (and zeroizes) all session state.
        self.active = None;
    }

    fn finish_dkg_outcome<R: RngCore + CryptoRng>(
        &mut self,
        outcome: ProcessOutcome<keygen::KeyShare>,
        now_ms: u64,
        rng: &mut R,
    ) -> Result<Outcome> {
        let (output, messages) = outcome.into_parts();
        let key_share = match output {
            None => return Ok(Outcome::Continue(messages)),
            Some(key_share) => key_share,
        };

        let roster = match self.active.as_ref().map(|active| &active.ceremony) {
            Some(ActiveCeremony::Dkg(participant)) => participant.roster().clone(),
            _ => return Err(InternalError::InternalInvariantFailed),
        };

        let metadata = CeremonyMetadata::new(&key_share, &roster, now_ms)?;
        // Storage failure surfaces as a ceremony failure: the share has not
        // been durably kept.
        if let Err(error) = self.store.save(
            self.node_id,
            &key_share,
            &metadata,
            &self.protection,
            rng,
        ) {
            self.abort_active();
            return Err(error);
        }

        let _ = self.finished_sessions.insert(key_share.ceremony());
        self.active = None;
        Ok(Outcome::DkgComplete {
            metadata: Box::new(metadata),
            messages,
        })
    }

    fn finish_sign_outcome(&mut self, outcome: ProcessOutcome<Signature>) -> Result<Outcome> {
        let (output, messages) = outcome.into_parts();
        match output {
            None => Ok(Outcome::Continue(messages)),
            Some(signature) => {
                let session_id = match self.active.as_ref().map(|active| &active.ceremony) {
                    Some(ActiveCeremony::Sign(participant)) => participant.sid(),
                    _ => return Err(InternalError::InternalInvariantFailed),
                };
                let _ = self.finished_sessions.insert(session_id);
                self.active = None;
                Ok(Outcome::Signed {
                    signature,
                    messages,
                })
            }
        }
    }
}

enum DkgOrSignOutcome {
    Dkg(ProcessOutcome<keygen::KeyShare>),
    Sign(ProcessOutcome<Signature>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        eth::Eip1559Transaction,
        sharing::lagrange_at_zero,
        utils::{scalar_is_high, testing::init_testing},
    };
    use k256::{elliptic_curve::Field, Scalar};
    use rand::{rngs::StdRng, Rng};

    const PASSPHRASE: &str = "a passphrase comfortably over the thirty-two character floor";

    fn sample_tx() -> Eip1559Transaction {
        Eip1559Transaction {
            chain_id: 5,
            nonce: 3,
            max_priority_fee_per_gas: 1_000_000_000,
            max_fee_per_gas: 40_000_000_000,
            gas: 21_000,
            to: Some([0x77; 20]),
            value: 5_000_000_000_000_000,
            data: vec![],
        }
    }

    struct TestCluster {
        coordinators: Vec<Coordinator>,
        roster: PartyRoster,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn new_cluster(total: usize, rng: &mut StdRng) -> TestCluster {
        let ids = (0..total)
            .map(|_| ParticipantIdentifier::random(rng))
            .collect::<Vec<_>>();
        let roster = PartyRoster::new(ids.clone()).unwrap();

        let dirs = (0..total).map(|_| tempfile::tempdir().unwrap()).collect::<Vec<_>>();
        let mut coordinators = ids
            .iter()
            .zip(&dirs)
            .map(|(&id, dir)| {
                Coordinator::new(
                    id,
                    IdentityKeypair::generate(rng).unwrap(),
                    KeyShareStore::new(dir.path()),
                    Protection::Passphrase(PASSPHRASE.to_string()),
                )
            })
            .collect::<Vec<_>>();

        let publics: Vec<(ParticipantIdentifier, CurvePoint)> = coordinators
            .iter()
            .map(|coordinator| (coordinator.node_id(), coordinator.identity_public_key()))
            .collect();
        for coordinator in &mut coordinators {
            for &(peer, key) in &publics {
                if peer != coordinator.node_id() {
                    coordinator.register_peer(peer, key).unwrap();
                }
            }
        }

        TestCluster {
            coordinators,
            roster,
            _dirs: dirs,
        }
    }

    /// Drive every pending message to quiescence, collecting terminal
    /// outcomes per node.
    fn drive(
        cluster: &mut TestCluster,
        initial: Vec<Message>,
        now_ms: u64,
        rng: &mut StdRng,
    ) -> HashMap<ParticipantIdentifier, Outcome> {
        let mut pending = initial;
        let mut terminal = HashMap::new();

        while !pending.is_empty() {
            let message = pending.remove(rng.gen_range(0..pending.len()));
            let coordinator = cluster
                .coordinators
                .iter_mut()
                .find(|coordinator| coordinator.node_id() == message.to())
                .unwrap();
            match coordinator.handle_message(&message, now_ms, rng).unwrap() {
                Outcome::Continue(messages) => pending.extend(messages),
                Outcome::Dropped => {}
                outcome @ (Outcome::DkgComplete { .. } | Outcome::Signed { .. }) => {
                    let (messages, keyed) = match outcome {
                        Outcome::DkgComplete { metadata, messages } => {
                            (messages.clone(), Outcome::DkgComplete { metadata, messages })
                        }
                        Outcome::Signed {
                            signature,
                            messages,
                        } => (
                            messages.clone(),
                            Outcome::Signed {
                                signature,
                                messages,
                            },
                        ),
                        _ => unreachable!(),
                    };
                    pending.extend(messages);
                    let _ = terminal.insert(message.to(), keyed);
                }
            }
        }
        terminal
    }

    fn run_dkg(cluster: &mut TestCluster, rng: &mut StdRng) -> Identifier {
        let ceremony_id = Identifier::random(rng);
        let mut initial = vec![];
        for position in 0..cluster.coordinators.len() {
            let roster = cluster.roster.clone();
            let coordinator = &mut cluster.coordinators[position];
            initial.extend(
                coordinator
                    .begin_dkg(ceremony_id, roster, 2, 10_000, rng)
                    .unwrap(),
            );
        }
        let terminal = drive(cluster, initial, 1_000, rng);
        assert_eq!(terminal.len(), cluster.coordinators.len());
        ceremony_id
    }

    #[test]
    fn dkg_then_signing_end_to_end() {
        let mut rng = init_testing();
        let mut cluster = new_cluster(3, &mut rng);

        run_dkg(&mut cluster, &mut rng);

        // Every node persisted a share and consistent metadata.
        let metadata: Vec<CeremonyMetadata> = cluster
            .coordinators
            .iter()
            .map(|coordinator| coordinator.store.load_metadata().unwrap())
            .collect();
        assert!(metadata.windows(2).all(|pair| {
            pair[0].pk_master == pair[1].pk_master && pair[0].chain_code == pair[1].chain_code
        }));
        assert_eq!(metadata[0].threshold, 2);
        assert_eq!(metadata[0].total_parties, 3);

        // Reconstructing from any two shares gives the master key.
        let shares: Vec<keygen::KeyShare> = cluster
            .coordinators
            .iter()
            .map(|coordinator| {
                coordinator
                    .store
                    .load(&Protection::Passphrase(PASSPHRASE.to_string()))
                    .unwrap()
            })
            .collect();
        let mut d = Scalar::ZERO;
        for &index in &[1u32, 3] {
            let share = shares.iter().find(|share| share.party_index() == index).unwrap();
            d += lagrange_at_zero(index, &[1, 3]).unwrap() * share.private_share().as_scalar();
        }
        let master = CurvePoint::GENERATOR.multiply_by_scalar(&d);
        assert_eq!(
            hex::encode(master.to_compressed_bytes()),
            metadata[0].pk_master
        );

        // Now sign with the subset {1, 3}. The request travels inside a
        // wire envelope, exactly as the transport would deliver it.
        let request = SignRequest::new(
            Identifier::random(&mut rng),
            cluster.coordinators[0].node_id(),
            1,
            sample_tx(),
            Some(crate::derive::DerivationPath::for_index(2).unwrap()),
            60_000,
        );
        let sealed = crate::envelope::Envelope::seal(
            crate::envelope::EnvelopeType::SignRequest,
            &request,
            500,
            &mut rng,
        )
        .unwrap()
        .to_json()
        .unwrap();
        let request: SignRequest = crate::envelope::Envelope::open(&sealed, 1_000)
            .unwrap()
            .payload_as()
            .unwrap();

        let signer_ids = [
            cluster.roster.id_at(1).unwrap(),
            cluster.roster.id_at(3).unwrap(),
        ];
        let signers = SignerSet::new([(1, signer_ids[0]), (3, signer_ids[1])]).unwrap();

        // Non-initiators evaluate and accept the request first.
        for coordinator in cluster
            .coordinators
            .iter()
            .filter(|coordinator| signer_ids.contains(&coordinator.node_id()))
        {
            assert!(coordinator.evaluate_sign_request(&request, 1_000));
        }

        let mut initial = vec![];
        for position in [0usize, 2] {
            initial.extend(
                cluster.coordinators[position]
                    .begin_signing(&request, signers.clone(), &mut rng)
                    .unwrap(),
            );
        }
        let terminal = drive(&mut cluster, initial, 2_000, &mut rng);

        let signatures: Vec<Signature> = terminal
            .values()
            .map(|outcome| match outcome {
                Outcome::Signed { signature, .. } => *signature,
                other => panic!("expected a signature, got {other:?}"),
            })
            .collect();
        assert_eq!(signatures.len(), 2);
        assert_eq!(signatures[0], signatures[1]);
        assert!(!scalar_is_high(signatures[0].s()));

        // The signature verifies under the derived child key.
        let child = crate::derive::child_public_key(
            &master,
            &shares[0].chain_code().to_owned(),
            2,
        )
        .unwrap();
        assert!(signatures[0].verify(&child, &sample_tx().tx_hash()).unwrap());

        // Completion notices are deduplicated by session id.
        assert!(!cluster.coordinators[0].record_completion(request.session_id));
    }

    #[test]
    fn hash_substitution_is_silently_declined() {
        let mut rng = init_testing();
        let mut cluster = new_cluster(3, &mut rng);
        run_dkg(&mut cluster, &mut rng);

        let mut request = SignRequest::new(
            Identifier::random(&mut rng),
            cluster.coordinators[0].node_id(),
            1,
            sample_tx(),
            None,
            60_000,
        );
        let mut other_tx = sample_tx();
        other_tx.value *= 10;
        request.tx_hash = other_tx.tx_hash_hex();

        for coordinator in &cluster.coordinators {
            assert!(!coordinator.evaluate_sign_request(&request, 1_000));
        }
    }

    #[test]
    fn messages_after_the_deadline_are_dropped_and_the_ceremony_released() {
        let mut rng = init_testing();
        let mut cluster = new_cluster(3, &mut rng);

        let ceremony_id = Identifier::random(&mut rng);
        let roster = cluster.roster.clone();
        let messages = cluster.coordinators[0]
            .begin_dkg(ceremony_id, roster, 2, 5_000, &mut rng)
            .unwrap();
        assert!(cluster.coordinators[0].is_busy());

        // A message arriving after the deadline tears the ceremony down.
        let echo = messages[0].clone();
        let outcome = cluster.coordinators[0]
            .handle_message(&echo, 6_000, &mut rng)
            .unwrap();
        assert!(matches!(outcome, Outcome::Dropped));
        assert!(!cluster.coordinators[0].is_busy());

        // The deadline check alone also releases an expired ceremony.
        let _ = cluster.coordinators[1]
            .begin_dkg(ceremony_id, cluster.roster.clone(), 2, 5_000, &mut rng)
            .unwrap();
        assert!(cluster.coordinators[1].check_deadline(6_000));
        assert!(!cluster.coordinators[1].is_busy());
        assert!(!cluster.coordinators[1].check_deadline(7_000));
    }

    #[test]
    fn only_one_ceremony_may_run_at_a_time() {
        let mut rng = init_testing();
        let mut cluster = new_cluster(3, &mut rng);

        let ceremony_id = Identifier::random(&mut rng);
        let roster = cluster.roster.clone();
        let _ = cluster.coordinators[0]
            .begin_dkg(ceremony_id, roster.clone(), 2, 60_000, &mut rng)
            .unwrap();
        let error = cluster.coordinators[0]
            .begin_dkg(Identifier::random(&mut rng), roster, 2, 60_000, &mut rng)
            .unwrap_err();
        assert_eq!(
            error,
            InternalError::Caller(CallerError::CeremonyInProgress)
        );
    }

    #[test]
    fn peer_abort_releases_the_ceremony() {
        let mut rng = init_testing();
        let mut cluster = new_cluster(3, &mut rng);

        let ceremony_id = Identifier::random(&mut rng);
        let roster = cluster.roster.clone();
        let _ = cluster.coordinators[0]
            .begin_dkg(ceremony_id, roster, 2, 60_000, &mut rng)
            .unwrap();

        // Aborts for other sessions are ignored.
        cluster.coordinators[0]
            .handle_peer_abort(Identifier::random(&mut rng), "nope")
            .unwrap();
        assert!(cluster.coordinators[0].is_busy());

        let error = cluster.coordinators[0]
            .handle_peer_abort(ceremony_id, "verification failure")
            .unwrap_err();
        assert!(matches!(
            error,
            InternalError::Dkg(DkgError::PeerAbort(_))
        ));
        assert!(!cluster.coordinators[0].is_busy());
    }
}
