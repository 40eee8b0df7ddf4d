//! Id-keyed storage for live objects, with stable id allocation.

use std::{collections::BTreeMap, marker::PhantomData};

use serde::{Deserialize, Serialize};

/// Ordered storage keyed by an id type. Iteration runs in id order so that
/// anything driven from it (tick order, reports) is deterministic.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Arena<Id: IdLike, T> {
    inner: BTreeMap<Id, T>,
    #[serde(skip)]
    next_id: u64,
    _phantom: PhantomData<Id>,
}

impl<Id: IdLike, T> Arena<Id, T> {
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
            next_id: 0,
            _phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Store a value under a freshly allocated id.
    pub fn push(&mut self, x: T) -> Id {
        let id = Id::from_raw(self.next_id);
        self.next_id += 1;
        self.inner.insert(id, x);
        id
    }

    /// Store a value under a caller-chosen id, replacing what was there.
    pub fn insert(&mut self, id: Id, x: T) -> Option<T> {
        self.next_id = self.next_id.max(id.into_raw() + 1);
        self.inner.insert(id, x)
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        self.inner.remove(&id)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.inner.get(&id)
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.inner.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.inner.iter().map(|(i, v)| (*i, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id, &mut T)> {
        self.inner.iter_mut().map(|(i, v)| (*i, v))
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<Id: IdLike, T> Default for Arena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: IdLike, T> FromIterator<(Id, T)> for Arena<Id, T> {
    fn from_iter<I: IntoIterator<Item = (Id, T)>>(iter: I) -> Self {
        let mut arena = Self::new();
        for (id, x) in iter {
            arena.insert(id, x);
        }
        arena
    }
}

pub trait IdLike: Copy + Ord {
    fn from_raw(index: u64) -> Self;
    fn into_raw(self) -> u64;
}
