// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A stash for messages that arrive before the local state machine is ready
//! to process them.

use crate::messages::{Message, MessageType};
use std::collections::HashMap;

/// Messages stashed for later processing, grouped by type.
#[derive(Debug, Default)]
pub(crate) struct MessageQueue(HashMap<MessageType, Vec<Message>>);

impl MessageQueue {
    /// Store a message in the queue.
    pub(crate) fn store(&mut self, message: Message) {
        self.0.entry(message.message_type()).or_default().push(message);
    }

    /// Retrieve (and remove) all stashed messages of a given type.
    ///
    /// Retrieved messages are deleted from the stash so that they aren't
    /// accidentally processed again.
    pub(crate) fn retrieve_all(&mut self, message_type: MessageType) -> Vec<Message> {
        self.0.remove(&message_type).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::SignMessageType,
        protocol::{Identifier, ParticipantIdentifier},
        utils::testing::init_testing,
    };

    #[test]
    fn retrieval_drains_only_the_requested_type() {
        let mut rng = init_testing();
        let sid = Identifier::random(&mut rng);
        let from = ParticipantIdentifier::random(&mut rng);
        let to = ParticipantIdentifier::random(&mut rng);

        let mut queue = MessageQueue::default();
        queue.store(Message::new(
            MessageType::Sign(SignMessageType::R1Commit),
            sid,
            from,
            to,
            &[],
        ));
        queue.store(Message::new(
            MessageType::Sign(SignMessageType::R2MtA),
            sid,
            from,
            to,
            &[],
        ));

        let drained = queue.retrieve_all(MessageType::Sign(SignMessageType::R1Commit));
        assert_eq!(drained.len(), 1);
        assert!(queue
            .retrieve_all(MessageType::Sign(SignMessageType::R1Commit))
            .is_empty());
        assert_eq!(
            queue
                .retrieve_all(MessageType::Sign(SignMessageType::R2MtA))
                .len(),
            1
        );
    }
}
