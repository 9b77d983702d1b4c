//! Index-based arenas and id sets.
//!
//! Simulation graphs here are cyclic (docking rings), so segments refer
//! to each other by arena index rather than by reference. [`IdSet`] is
//! the visited-set threaded through every recursive graph search.

use std::{
    marker::PhantomData,
    ops::{Index, IndexMut},
};

use serde::{Deserialize, Serialize};

pub trait IdLike: Copy + Eq {
    fn from_raw(index: usize) -> Self;
    fn into_raw(self) -> usize;
}

/// A dense, append-only arena keyed by an [`IdLike`] newtype.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Arena<Id: IdLike, T> {
    inner: Vec<T>,
    _phantom: PhantomData<Id>,
}

impl<Id: IdLike, T> Arena<Id, T> {
    pub fn new() -> Self {
        Self {
            inner: Vec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn push(&mut self, x: T) -> Id {
        let id = Id::from_raw(self.inner.len());
        self.inner.push(x);
        id
    }

    pub fn contains(&self, id: Id) -> bool {
        id.into_raw() < self.inner.len()
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.inner.get(id.into_raw())
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> {
        (0..self.inner.len()).map(Id::from_raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.inner
            .iter()
            .enumerate()
            .map(|(i, v)| (Id::from_raw(i), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id, &mut T)> {
        self.inner
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (Id::from_raw(i), v))
    }
}

impl<Id: IdLike, T> Default for Arena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: IdLike, T> Index<Id> for Arena<Id, T> {
    type Output = T;

    fn index(&self, index: Id) -> &Self::Output {
        &self.inner[index.into_raw()]
    }
}

impl<Id: IdLike, T> IndexMut<Id> for Arena<Id, T> {
    fn index_mut(&mut self, index: Id) -> &mut Self::Output {
        &mut self.inner[index.into_raw()]
    }
}

/// A bitset over arena indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdSet<Id: IdLike> {
    blocks: Vec<u64>,
    _phantom: PhantomData<Id>,
}

impl<Id: IdLike> IdSet<Id> {
    pub fn with_capacity(len: usize) -> Self {
        Self {
            blocks: vec![0; len.div_ceil(64)],
            _phantom: PhantomData,
        }
    }

    pub fn insert(&mut self, id: Id) {
        let raw = id.into_raw();
        let block = raw / 64;
        if block >= self.blocks.len() {
            self.blocks.resize(block + 1, 0);
        }
        self.blocks[block] |= 1 << (raw % 64);
    }

    pub fn remove(&mut self, id: Id) {
        let raw = id.into_raw();
        if let Some(block) = self.blocks.get_mut(raw / 64) {
            *block &= !(1 << (raw % 64));
        }
    }

    pub fn contains(&self, id: Id) -> bool {
        let raw = id.into_raw();
        self.blocks
            .get(raw / 64)
            .is_some_and(|block| block & (1 << (raw % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.blocks.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct TestId(u32);

    impl IdLike for TestId {
        fn from_raw(index: usize) -> Self {
            Self(index as u32)
        }

        fn into_raw(self) -> usize {
            self.0 as usize
        }
    }

    #[test]
    fn arena_push_and_index() {
        let mut arena: Arena<TestId, &str> = Arena::new();
        let a = arena.push("a");
        let b = arena.push("b");
        assert_eq!(arena[a], "a");
        assert_eq!(arena[b], "b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.iter().count(), 2);
    }

    #[test]
    fn id_set_insert_remove() {
        let mut set: IdSet<TestId> = IdSet::with_capacity(4);
        assert!(!set.contains(TestId(3)));
        set.insert(TestId(3));
        // Past the preallocated capacity: the set must grow.
        set.insert(TestId(130));
        assert!(set.contains(TestId(3)));
        assert!(set.contains(TestId(130)));
        set.remove(TestId(3));
        assert!(!set.contains(TestId(3)));
        assert!(set.contains(TestId(130)));
    }
}
