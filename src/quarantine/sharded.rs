//! Hash-sharded quarantine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{fits, over_budget, Quarantine, QuarantineObject, UNBOUNDED};
use crate::sync::mutex::Mutex;

/// Full-avalanche integer mix (Bob Jenkins) reduced to a shard index.
fn shard_for(hash: usize, shards: usize) -> usize {
    let mut a = hash as u64;
    a = a.wrapping_sub(a << 6);
    a ^= a >> 17;
    a = a.wrapping_sub(a << 9);
    a ^= a << 4;
    a = a.wrapping_sub(a << 3);
    a ^= a << 10;
    a ^= a >> 15;
    (a % shards as u64) as usize
}

/// One FIFO and the bytes it holds.
struct Shard<T> {
    fifo: VecDeque<T>,
    size: usize,
}

/// Quarantine split into independently locked FIFOs.
///
/// Each shard holds at most `max_quarantine_size / shards` bytes, so the
/// aggregate never exceeds the maximum. `pop` takes the oldest object of the
/// next over-budget shard in round robin order.
pub struct ShardedQuarantine<T> {
    shards: Box<[Mutex<Shard<T>>]>,
    size: AtomicUsize,
    count: AtomicUsize,
    cursor: AtomicUsize,
    max_quarantine_size: AtomicUsize,
    max_object_size: AtomicUsize,
}

impl<T: QuarantineObject> ShardedQuarantine<T> {
    /// Create a quarantine with `shards` FIFOs.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is 0.
    pub fn new(shards: usize, max_quarantine_size: usize, max_object_size: usize) -> Self {
        assert!(shards >= 1, "a quarantine needs at least one shard");
        Self {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(Shard {
                        fifo: VecDeque::new(),
                        size: 0,
                    })
                })
                .collect(),
            size: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            max_quarantine_size: AtomicUsize::new(max_quarantine_size),
            max_object_size: AtomicUsize::new(max_object_size),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Bytes a single shard may hold.
    pub fn shard_budget(&self) -> usize {
        match self.max_quarantine_size.load(Ordering::Relaxed) {
            UNBOUNDED => UNBOUNDED,
            max => max / self.shards.len(),
        }
    }

    fn take_one(&self) -> Option<T> {
        let budget = self.shard_budget();
        let n = self.shards.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let mut shard = self.shards[(start + offset) % n].lock();
            if !over_budget(shard.size, shard.fifo.len(), budget) {
                continue;
            }
            if let Some(object) = shard.fifo.pop_front() {
                let size = object.quarantine_size();
                shard.size -= size;
                self.size.fetch_sub(size, Ordering::Relaxed);
                self.count.fetch_sub(1, Ordering::Relaxed);
                return Some(object);
            }
        }
        None
    }
}

impl<T: QuarantineObject + Send> Quarantine<T> for ShardedQuarantine<T> {
    fn push(&self, object: T) -> Result<(), T> {
        let size = object.quarantine_size();
        if !fits(size, self.shard_budget(), self.max_object_size()) {
            return Err(object);
        }
        let index = shard_for(object.quarantine_hash(), self.shards.len());
        let mut shard = self.shards[index].lock();
        shard.fifo.push_back(object);
        shard.size += size;
        self.size.fetch_add(size, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        if self.count() == 0 {
            return None;
        }
        self.take_one()
    }

    fn empty(&self) -> Vec<T> {
        let mut objects = Vec::with_capacity(self.count());
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            shard.size = 0;
            for object in shard.fifo.drain(..) {
                self.size
                    .fetch_sub(object.quarantine_size(), Ordering::Relaxed);
                self.count.fetch_sub(1, Ordering::Relaxed);
                objects.push(object);
            }
        }
        objects
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn max_quarantine_size(&self) -> usize {
        self.max_quarantine_size.load(Ordering::Relaxed)
    }

    fn set_max_quarantine_size(&self, size: usize) {
        self.max_quarantine_size.store(size, Ordering::Relaxed);
    }

    fn max_object_size(&self) -> usize {
        self.max_object_size.load(Ordering::Relaxed)
    }

    fn set_max_object_size(&self, size: usize) {
        self.max_object_size.store(size, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarantine::test_support::Token;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_shard_spread() {
        let used: HashSet<_> = (0..256).map(|h| shard_for(h * 64, 8)).collect();
        assert!(used.len() > 4);
        assert!(used.iter().all(|&s| s < 8));
    }

    #[test]
    fn test_bound_holds_after_trim() {
        let q = ShardedQuarantine::new(4, 1000, UNBOUNDED);
        for id in 0..50 {
            q.push(Token::new(id, 64)).unwrap();
            q.trim(|_| {});
            assert!(q.size() <= 1000);
        }
        assert_eq!(q.shard_budget(), 250);
        assert!(q.count() <= 4 * (250 / 64));
    }

    #[test]
    fn test_object_must_fit_one_shard() {
        let q = ShardedQuarantine::new(4, 1000, UNBOUNDED);
        assert!(q.push(Token::new(0, 300)).is_err());
        assert!(q.push(Token::new(1, 250)).is_ok());

        let single = ShardedQuarantine::new(1, 1000, UNBOUNDED);
        assert!(single.push(Token::new(0, 300)).is_ok());
    }

    #[test]
    fn test_unbounded_shards_never_evict() {
        let q = ShardedQuarantine::new(8, UNBOUNDED, UNBOUNDED);
        for id in 0..64 {
            q.push(Token::new(id, 4096)).unwrap();
        }
        assert_eq!(q.trim(|_| {}), 0);
        assert_eq!(q.count(), 64);
    }

    #[test]
    fn test_single_shard_is_fifo() {
        let q = ShardedQuarantine::new(1, 100, UNBOUNDED);
        for id in 0..5 {
            q.push(Token::new(id, 40)).unwrap();
        }
        let mut evicted = Vec::new();
        q.trim(|t| evicted.push(t.id));
        assert_eq!(evicted, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_drains_all_shards() {
        let q = ShardedQuarantine::new(8, UNBOUNDED, UNBOUNDED);
        for id in 0..32 {
            q.push(Token::new(id, 1)).unwrap();
        }
        let mut ids: Vec<_> = q.empty().into_iter().map(|t| t.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..32).collect::<Vec<_>>());
        assert_eq!(q.size(), 0);
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn test_zero_max_evicts_everything() {
        let q = ShardedQuarantine::new(4, 100, UNBOUNDED);
        for id in 0..3 {
            q.push(Token::new(id, 10)).unwrap();
        }
        q.set_max_quarantine_size(0);
        assert!(q.push(Token::new(9, 1)).is_err());
        assert_eq!(q.trim(|_| {}), 3);
    }

    #[test]
    fn test_concurrent_push_and_trim() {
        let q = Arc::new(ShardedQuarantine::new(16, 4096, UNBOUNDED));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        q.push(Token::new(t * 1000 + i, 16)).unwrap();
                        q.trim(|_| {});
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        q.trim(|_| {});
        assert!(q.size() <= 4096);
        assert_eq!(q.size(), q.count() * 16);
    }
}
