use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// A fixed set of locks handed out round-robin.
///
/// Entries that need a lock of their own only store the slot index, which keeps them small and
/// bounds the number of locks no matter how many entries exist. Unrelated entries that share a
/// slot occasionally contend, which is fine as long as the pool is larger than the number of
/// threads.
pub struct MutexPool {
    mutexes: Box<[RwLock<()>]>,
    next_slot: AtomicU32,
}

impl MutexPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "A mutex pool needs at least one mutex");
        Self {
            mutexes: (0..size).map(|_| RwLock::new(())).collect(),
            next_slot: AtomicU32::new(0),
        }
    }

    pub fn new_mutex_slot(&self) -> u32 {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        slot % self.mutexes.len() as u32
    }

    /// # Panics
    /// If `slot` wasn't handed out by this pool.
    pub fn get(&self, slot: u32) -> &RwLock<()> {
        &self.mutexes[slot as usize]
    }

    pub fn len(&self) -> usize {
        self.mutexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutexes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn slots_wrap_around() {
        let pool = MutexPool::new(4);
        let slots = (0..9)
            .map(|_| pool.new_mutex_slot())
            .collect::<Vec<_>>();
        assert_eq!(slots, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
        assert!(pool.get(3).try_write().is_ok());
    }
}
