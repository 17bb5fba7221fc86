//! # Control block store
//!
//! An indexed store of control blocks with monotonically assigned ids. The
//! map lock is held only for insert, lookup and removal; the blocks
//! themselves carry their own lock so that mutating one thread or process
//! never serializes against unrelated ones.

use crate::error::KernelError;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::SpinLock;

/// Identifier types issued by a [`ControlBlockStore`].
pub trait StoreId: Copy + Ord + core::fmt::Debug {
    fn from_raw(raw: u64) -> Self;
}

pub struct ControlBlockStore<I, T> {
    next: AtomicU64,
    capacity: usize,
    entries: SpinLock<BTreeMap<I, Arc<SpinLock<T>>>>,
}

impl<I: StoreId, T> ControlBlockStore<I, T> {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            next: AtomicU64::new(0),
            capacity,
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Issues the next id and stores the block built for it.
    ///
    /// Ids are never reused, also not after a failed insert.
    pub fn insert_with(
        &self,
        build: impl FnOnce(I) -> T,
    ) -> Result<(I, Arc<SpinLock<T>>), KernelError> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(KernelError::OutOfMemory);
        }
        let id = I::from_raw(self.next.fetch_add(1, Ordering::Relaxed));
        let block = Arc::new(SpinLock::new(build(id)));
        entries.insert(id, Arc::clone(&block));
        Ok((id, block))
    }

    pub fn get(&self, id: I) -> Result<Arc<SpinLock<T>>, KernelError> {
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or(KernelError::NoSuchEntity)
    }

    /// Removes the block. A second removal of the same id fails with
    /// [`KernelError::NoSuchEntity`].
    pub fn remove(&self, id: I) -> Result<Arc<SpinLock<T>>, KernelError> {
        self.entries
            .lock()
            .remove(&id)
            .ok_or(KernelError::NoSuchEntity)
    }

    /// Runs `f` with the locked block.
    pub fn with<R>(&self, id: I, f: impl FnOnce(&mut T) -> R) -> Result<R, KernelError> {
        Ok(self.get(id)?.with_lock(f))
    }

    #[must_use]
    pub fn contains(&self, id: I) -> bool {
        self.entries.lock().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Snapshot of all live ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<I> {
        self.entries.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
    struct Id(u64);

    impl StoreId for Id {
        fn from_raw(raw: u64) -> Self {
            Self(raw)
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let store = ControlBlockStore::<Id, &str>::new(8);
        let (a, _) = store.insert_with(|_| "a").unwrap();
        let (b, _) = store.insert_with(|_| "b").unwrap();
        store.remove(a).unwrap();
        let (c, _) = store.insert_with(|_| "c").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn exactly_once_removal() {
        let store = ControlBlockStore::<Id, u32>::new(8);
        let (id, _) = store.insert_with(|_| 1).unwrap();
        assert!(store.remove(id).is_ok());
        assert_eq!(store.remove(id).err(), Some(KernelError::NoSuchEntity));
        assert_eq!(store.get(id).err(), Some(KernelError::NoSuchEntity));
    }

    #[test]
    fn capacity_is_enforced() {
        let store = ControlBlockStore::<Id, u32>::new(1);
        store.insert_with(|_| 1).unwrap();
        assert!(store.is_full());
        assert_eq!(store.insert_with(|_| 2).err(), Some(KernelError::OutOfMemory));
    }

    #[test]
    fn blocks_see_their_id() {
        let store = ControlBlockStore::<Id, Id>::new(4);
        let (id, block) = store.insert_with(|id| id).unwrap();
        assert_eq!(*block.lock(), id);
        assert_eq!(store.with(id, |v| *v), Ok(id));
    }
}
