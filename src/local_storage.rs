// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The `LocalStorage` type for storing data local to a protocol run.
//!
//! [`LocalStorage`] provides a means for storing values associated with a
//! [`TypeTag`] and [`ParticipantIdentifier`] pair. A participant owns exactly
//! one protocol run at a time, so the run identifier is not part of the key;
//! the storage is dropped wholesale with the participant on terminal
//! transitions.

use crate::{
    errors::{InternalError, Result},
    ParticipantIdentifier,
};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

/// A type implementing `TypeTag` can be used to store and retrieve values of
/// type `<T as TypeTag>::Value`.
pub(crate) trait TypeTag: 'static {
    type Value: Send + Sync;
}

/// A type for storing values local to a protocol run.
#[derive(Debug, Default)]
pub(crate) struct LocalStorage {
    storage: HashMap<(ParticipantIdentifier, TypeId), Box<dyn Any + Send + Sync>>,
}

impl LocalStorage {
    /// Stores `value` via a [`TypeTag`] and [`ParticipantIdentifier`] pair,
    /// overwriting any existing entry.
    pub(crate) fn store<T: TypeTag>(
        &mut self,
        participant_id: ParticipantIdentifier,
        value: T::Value,
    ) {
        let _ = self
            .storage
            .insert((participant_id, TypeId::of::<T>()), Box::new(value));
    }

    /// Stores `value` only if no entry exists yet; returns `false` if an
    /// entry was already present. Protocols use this to detect equivocation.
    pub(crate) fn store_once<T: TypeTag>(
        &mut self,
        participant_id: ParticipantIdentifier,
        value: T::Value,
    ) -> bool {
        if self.contains::<T>(participant_id) {
            return false;
        }
        self.store::<T>(participant_id, value);
        true
    }

    /// Retrieves a reference to a value via its [`TypeTag`] and
    /// [`ParticipantIdentifier`].
    pub(crate) fn retrieve<T: TypeTag>(
        &self,
        participant_id: ParticipantIdentifier,
    ) -> Result<&T::Value> {
        self.storage
            .get(&(participant_id, TypeId::of::<T>()))
            .map(|any| {
                any.downcast_ref::<T::Value>()
                    .ok_or(InternalError::InternalInvariantFailed)
            })
            .unwrap_or(Err(InternalError::StorageItemNotFound))
    }

    /// Retrieves a mutable reference to a value via its [`TypeTag`] and
    /// [`ParticipantIdentifier`].
    pub(crate) fn retrieve_mut<T: TypeTag>(
        &mut self,
        participant_id: ParticipantIdentifier,
    ) -> Result<&mut T::Value> {
        self.storage
            .get_mut(&(participant_id, TypeId::of::<T>()))
            .map(|any| {
                any.downcast_mut::<T::Value>()
                    .ok_or(InternalError::InternalInvariantFailed)
            })
            .unwrap_or(Err(InternalError::StorageItemNotFound))
    }

    /// Removes and returns a value, if present.
    pub(crate) fn remove<T: TypeTag>(
        &mut self,
        participant_id: ParticipantIdentifier,
    ) -> Result<T::Value> {
        self.storage
            .remove(&(participant_id, TypeId::of::<T>()))
            .map(|any| {
                any.downcast::<T::Value>()
                    .map(|boxed| *boxed)
                    .map_err(|_| InternalError::InternalInvariantFailed)
            })
            .unwrap_or(Err(InternalError::StorageItemNotFound))
    }

    /// Checks whether values exist for the given [`TypeTag`] and each of the
    /// `participant_ids` provided.
    pub(crate) fn contains_for_all_ids<T: TypeTag>(
        &self,
        participant_ids: &[ParticipantIdentifier],
    ) -> bool {
        participant_ids.iter().all(|pid| self.contains::<T>(*pid))
    }

    /// Returns `true` if a value exists for the given [`TypeTag`] and
    /// [`ParticipantIdentifier`].
    pub(crate) fn contains<T: TypeTag>(&self, participant_id: ParticipantIdentifier) -> bool {
        self.storage
            .contains_key(&(participant_id, TypeId::of::<T>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::init_testing;

    struct Marker;
    impl TypeTag for Marker {
        type Value = u64;
    }

    #[test]
    fn store_once_reports_duplicates() {
        let mut rng = init_testing();
        let pid = ParticipantIdentifier::random(&mut rng);
        let mut storage = LocalStorage::default();

        assert!(storage.store_once::<Marker>(pid, 7));
        assert!(!storage.store_once::<Marker>(pid, 8));
        assert_eq!(*storage.retrieve::<Marker>(pid).unwrap(), 7);
    }

    #[test]
    fn retrieve_missing_item_fails() {
        let mut rng = init_testing();
        let pid = ParticipantIdentifier::random(&mut rng);
        let storage = LocalStorage::default();
        assert!(storage.retrieve::<Marker>(pid).is_err());
    }
}
