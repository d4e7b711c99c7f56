// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Traits shared by the message-driven protocol participants.
//!
//! A participant owns the state of one protocol run and is driven entirely by
//! [`Message`]s applied serially. Handlers set round state synchronously
//! before emitting any messages, and messages that arrive ahead of the local
//! round are stashed and re-fetched once the round transition happens, so a
//! run observes monotonic round progression regardless of delivery order.

use crate::{
    errors::Result,
    local_storage::{LocalStorage, TypeTag},
    message_queue::MessageQueue,
    messages::{Message, MessageType},
    protocol::{Identifier, ParticipantIdentifier},
};
use rand::{CryptoRng, RngCore};
use serde::Serialize;
use std::collections::HashSet;

/// Possible outcomes from processing one message.
#[derive(Debug)]
pub enum ProcessOutcome<O> {
    /// The protocol is not finished; no messages need to be sent.
    Incomplete,
    /// The protocol is not finished; messages need to be sent to other
    /// participants.
    Processed(Vec<Message>),
    /// The protocol is finished for this participant; no messages need to be
    /// sent.
    Terminated(O),
    /// The protocol is finished for this participant; messages still need to
    /// be sent to other participants.
    TerminatedForThisParticipant(O, Vec<Message>),
}

impl<O> ProcessOutcome<O> {
    /// Build an outcome from a set of outgoing messages.
    pub(crate) fn from_messages(messages: Vec<Message>) -> Self {
        if messages.is_empty() {
            Self::Incomplete
        } else {
            Self::Processed(messages)
        }
    }

    /// Append additional outgoing messages to this outcome.
    pub(crate) fn with_messages(self, mut more: Vec<Message>) -> Self {
        let (output, mut messages) = self.into_parts();
        messages.append(&mut more);
        Self::assemble(output, messages)
    }

    /// Merge a set of outcomes produced while handling stashed messages,
    /// together with messages generated by the current handler.
    ///
    /// At most one of the outcomes may carry a terminal output.
    pub(crate) fn collect_with_messages(
        outcomes: Vec<Self>,
        messages: Vec<Message>,
    ) -> Result<Self> {
        let mut all_messages = messages;
        let mut output = None;
        for outcome in outcomes {
            let (terminal, mut msgs) = outcome.into_parts();
            if let Some(terminal) = terminal {
                if output.is_some() {
                    return Err(crate::errors::InternalError::InternalInvariantFailed);
                }
                output = Some(terminal);
            }
            all_messages.append(&mut msgs);
        }
        Ok(Self::assemble(output, all_messages))
    }

    /// Split into the optional terminal output and the outgoing messages.
    pub(crate) fn into_parts(self) -> (Option<O>, Vec<Message>) {
        match self {
            Self::Incomplete => (None, Vec::new()),
            Self::Processed(messages) => (None, messages),
            Self::Terminated(output) => (Some(output), Vec::new()),
            Self::TerminatedForThisParticipant(output, messages) => (Some(output), messages),
        }
    }

    fn assemble(output: Option<O>, messages: Vec<Message>) -> Self {
        match (output, messages.is_empty()) {
            (None, true) => Self::Incomplete,
            (None, false) => Self::Processed(messages),
            (Some(output), true) => Self::Terminated(output),
            (Some(output), false) => Self::TerminatedForThisParticipant(output, messages),
        }
    }
}

/// The driving trait implemented by each protocol participant.
pub trait ProtocolParticipant {
    /// Input the participant needs before it can run.
    type Input;
    /// Output produced by a successful run.
    type Output;
    /// Status of the run, inspectable by the owner.
    type Status: std::fmt::Debug;

    /// Construct a participant for the run identified by `sid`.
    fn new(
        sid: Identifier,
        id: ParticipantIdentifier,
        other_participant_ids: Vec<ParticipantIdentifier>,
        input: Self::Input,
    ) -> Result<Self>
    where
        Self: Sized;

    /// The message type that signals readiness for this protocol.
    fn ready_type() -> MessageType;

    /// This participant's identifier.
    fn id(&self) -> ParticipantIdentifier;

    /// The other participants in this run.
    fn other_ids(&self) -> &[ParticipantIdentifier];

    /// All participants, including this one.
    fn all_participants(&self) -> Vec<ParticipantIdentifier> {
        let mut all = self.other_ids().to_vec();
        all.push(self.id());
        all
    }

    /// The run identifier.
    fn sid(&self) -> Identifier;

    /// Process one inbound message and return the outcome.
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>>;

    /// Current status of the run.
    fn status(&self) -> &Self::Status;
}

/// Shared internal machinery: typed local storage, the early-message stash,
/// and once-only round initiation.
pub(crate) trait InnerProtocolParticipant: ProtocolParticipant {
    fn local_storage(&self) -> &LocalStorage;
    fn local_storage_mut(&mut self) -> &mut LocalStorage;
    fn message_queue_mut(&mut self) -> &mut MessageQueue;
    fn progress_mut(&mut self) -> &mut HashSet<&'static str>;

    /// Stash a message that arrived ahead of the local round.
    fn stash_message(&mut self, message: &Message) -> Result<()> {
        self.message_queue_mut().store(message.clone());
        Ok(())
    }

    /// Fetch all stashed messages of the given type.
    fn fetch_messages(&mut self, message_type: MessageType) -> Result<Vec<Message>> {
        Ok(self.message_queue_mut().retrieve_all(message_type))
    }

    /// Serialize `data` into one message per other participant.
    fn message_for_other_participants<T: Serialize>(
        &self,
        message_type: MessageType,
        data: &T,
    ) -> Result<Vec<Message>> {
        let bytes = serialize!(data)?;
        Ok(self
            .other_ids()
            .iter()
            .map(|&other| Message::new(message_type, self.sid(), self.id(), other, &bytes))
            .collect())
    }

    /// Record a ready signal. When the signal comes from this participant,
    /// the readiness is relayed to the other participants. Returns the relay
    /// messages and whether every participant is now ready.
    fn process_ready_message<T: TypeTag<Value = ()>>(
        &mut self,
        message: &Message,
    ) -> Result<(Vec<Message>, bool)> {
        message.check_type(Self::ready_type())?;
        self.local_storage_mut().store::<T>(message.from(), ());

        let messages = if message.from() == self.id() {
            self.message_for_other_participants(Self::ready_type(), &())?
        } else {
            Vec::new()
        };

        let is_ready = self
            .local_storage()
            .contains_for_all_ids::<T>(&self.all_participants());
        Ok((messages, is_ready))
    }
}

/// Run a round-initiation method at most once per participant lifetime.
///
/// Handlers can be re-entered by stashed-message replay; the guard keeps a
/// round from being initiated twice in that case.
macro_rules! run_only_once {
    ($self:ident . $func:ident ($($arg:expr),* $(,)?)) => {{
        if $self.progress_mut().insert(stringify!($func)) {
            $self.$func($($arg),*)
        } else {
            Ok(vec![])
        }
    }};
}

pub(crate) use run_only_once;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_assemble_into_the_smallest_variant() {
        let outcome: ProcessOutcome<u8> = ProcessOutcome::from_messages(vec![]);
        assert!(matches!(outcome, ProcessOutcome::Incomplete));

        let merged =
            ProcessOutcome::<u8>::collect_with_messages(vec![ProcessOutcome::Incomplete], vec![])
                .unwrap();
        assert!(matches!(merged, ProcessOutcome::Incomplete));

        let terminated = ProcessOutcome::collect_with_messages(
            vec![ProcessOutcome::Terminated(3u8), ProcessOutcome::Incomplete],
            vec![],
        )
        .unwrap();
        assert!(matches!(terminated, ProcessOutcome::Terminated(3)));
    }

    #[test]
    fn double_termination_is_an_invariant_failure() {
        let result = ProcessOutcome::collect_with_messages(
            vec![ProcessOutcome::Terminated(1u8), ProcessOutcome::Terminated(2u8)],
            vec![],
        );
        assert!(result.is_err());
    }
}
