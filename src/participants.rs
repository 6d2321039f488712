//! This module holds some utilities for working with participants.
//!
//! A round numbers its players `1..=N`, in the order of their verification
//! keys. That numbering decides who shuffles when, and whose keys wrap which
//! layer of encryption, so it is computed once and then never changes.

use std::collections::HashMap;

use crate::scheme::Scheme;

/// Represents a sorted list of participants.
///
/// The advantage of this data structure is that everybody will agree on its
/// order, and so on the index of each player.
#[derive(Debug, Clone)]
pub struct ParticipantList<C: Scheme> {
    participants: Vec<C::VerificationKey>,
    /// This maps each participant to its index in the vector above.
    indices: HashMap<C::VerificationKey, usize>,
}

impl<C: Scheme> ParticipantList<C> {
    /// Create a participant list from a slice of participants.
    ///
    /// This will return None if the participants have duplicates.
    pub fn new(participants: &[C::VerificationKey]) -> Option<Self> {
        let mut out = participants.to_owned();
        out.sort();

        let indices: HashMap<_, _> = out
            .iter()
            .enumerate()
            .map(|(i, x)| (x.clone(), i))
            .collect();

        if indices.len() < out.len() {
            return None;
        }

        Some(Self {
            participants: out,
            indices,
        })
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Check if this list has a given participant.
    pub fn contains(&self, participant: &C::VerificationKey) -> bool {
        self.indices.contains_key(participant)
    }

    /// Return the index of a given participant, starting at 1.
    pub fn index(&self, participant: &C::VerificationKey) -> Option<usize> {
        self.indices.get(participant).map(|i| i + 1)
    }

    /// Return the participant with a given index, starting at 1.
    pub fn get(&self, index: usize) -> Option<&C::VerificationKey> {
        index
            .checked_sub(1)
            .and_then(|i| self.participants.get(i))
    }

    /// Iterate over all participants, in order.
    pub fn iter(&self) -> impl Iterator<Item = &C::VerificationKey> + '_ {
        self.participants.iter()
    }

    /// Iterate over the other participants.
    pub fn others<'a>(
        &'a self,
        me: &'a C::VerificationKey,
    ) -> impl Iterator<Item = &'a C::VerificationKey> + 'a {
        self.participants.iter().filter(move |x| *x != me)
    }

    /// The participants whose index lies in `from..=to`.
    pub fn range(&self, from: usize, to: usize) -> Vec<C::VerificationKey> {
        (from.max(1)..=to.min(self.len()))
            .map(|i| self.participants[i - 1].clone())
            .collect()
    }

    /// The list without some participants, renumbered.
    pub fn without<'a>(
        &self,
        excluded: impl IntoIterator<Item = &'a C::VerificationKey>,
    ) -> Option<Self> {
        let mut remaining = self.participants.clone();
        for x in excluded {
            remaining.retain(|p| p != x);
        }
        Self::new(&remaining)
    }

    pub fn to_vec(&self) -> Vec<C::VerificationKey> {
        self.participants.clone()
    }
}

/// A map from participants to elements.
///
/// The idea is that you have one element for each participant.
#[derive(Debug, Clone)]
pub struct ParticipantMap<'a, C: Scheme, T> {
    participants: &'a ParticipantList<C>,
    data: Vec<Option<T>>,
}

impl<'a, C: Scheme, T> ParticipantMap<'a, C, T> {
    /// Create a new map from a list of participants.
    ///
    /// This map only lives as long as that list of participants.
    pub fn new(participants: &'a ParticipantList<C>) -> Self {
        Self {
            participants,
            data: (0..participants.len()).map(|_| None).collect(),
        }
    }

    pub fn get(&self, participant: &C::VerificationKey) -> Option<&T> {
        let i = *self.participants.indices.get(participant)?;
        self.data[i].as_ref()
    }

    /// Place the data for a participant in this map.
    ///
    /// This returns false, leaving the map untouched, if that participant
    /// isn't in the list, or already has data.
    pub fn put(&mut self, participant: &C::VerificationKey, data: T) -> bool {
        let Some(&i) = self.participants.indices.get(participant) else {
            return false;
        };
        if self.data[i].is_some() {
            return false;
        }
        self.data[i] = Some(data);
        true
    }

    /// Iterate over the filled entries, in participant order.
    pub fn iter(&self) -> impl Iterator<Item = (&C::VerificationKey, &T)> + '_ {
        self.participants
            .iter()
            .zip(self.data.iter())
            .filter_map(|(p, x)| x.as_ref().map(|x| (p, x)))
    }
}

#[cfg(all(test, feature = "k256"))]
mod test {
    use k256::Secp256k1;
    use rand_core::OsRng;

    use super::*;

    fn keys(n: usize) -> Vec<<Secp256k1 as Scheme>::VerificationKey> {
        (0..n)
            .map(|_| Secp256k1::verification_key(&Secp256k1::generate_signing_key(&mut OsRng)))
            .collect()
    }

    #[test]
    fn test_indices_follow_key_order() {
        let mut keys = keys(4);
        let list = ParticipantList::<Secp256k1>::new(&keys).unwrap();
        keys.sort();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(list.index(key), Some(i + 1));
            assert_eq!(list.get(i + 1), Some(key));
        }
        assert_eq!(list.get(0), None);
        assert_eq!(list.get(5), None);
        assert_eq!(list.range(2, 4), keys[1..].to_vec());
        assert_eq!(list.range(3, 2), vec![]);
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mut keys = keys(3);
        keys.push(keys[0].clone());
        assert!(ParticipantList::<Secp256k1>::new(&keys).is_none());
    }

    #[test]
    fn test_without_renumbers() {
        let keys = keys(4);
        let list = ParticipantList::<Secp256k1>::new(&keys).unwrap();
        let first = list.get(1).unwrap().clone();
        let smaller = list.without([&first]).unwrap();
        assert_eq!(smaller.len(), 3);
        assert!(!smaller.contains(&first));
        assert_eq!(smaller.get(1), list.get(2));
    }

    #[test]
    fn test_map_refuses_second_entry() {
        let keys = keys(2);
        let list = ParticipantList::<Secp256k1>::new(&keys).unwrap();
        let mut map = ParticipantMap::new(&list);
        assert!(map.put(&keys[0], 1));
        assert!(!map.put(&keys[0], 2));
        assert_eq!(map.get(&keys[0]), Some(&1));
        assert_eq!(map.get(&keys[1]), None);
        assert!(map.put(&keys[1], 3));
        let values: Vec<_> = map.iter().map(|(_, x)| *x).collect();
        assert_eq!(values.len(), 2);
    }
}
