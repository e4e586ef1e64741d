//! Bounded holding pen for freed blocks.
//!
//! A freed block stays poisoned in the quarantine until enough newer frees
//! push it out, so dangling accesses made shortly after a free still hit
//! FREED shadow.
//!
//! Two implementations share the [`Quarantine`] trait:
//!
//! - [`SizeLimitedQuarantine`]: one lock around one FIFO.
//! - [`ShardedQuarantine`]: several FIFOs picked by object hash, so
//!   concurrent frees rarely contend. Each shard holds a fraction of the
//!   budget and eviction order is only FIFO per shard.
//!
//! A maximum of 0 always means "no capacity": every push is rejected and a
//! trim evicts everything. [`UNBOUNDED`] disables a limit.

mod sharded;
mod size_limited;

pub use sharded::ShardedQuarantine;
pub use size_limited::SizeLimitedQuarantine;

/// Limit value that disables a bound.
pub const UNBOUNDED: usize = usize::MAX;

/// Something the quarantine can hold.
pub trait QuarantineObject {
    /// Bytes charged against the quarantine budget.
    fn quarantine_size(&self) -> usize;

    /// Hash used to spread objects across shards.
    fn quarantine_hash(&self) -> usize;
}

/// A bounded FIFO of freed objects.
pub trait Quarantine<T: QuarantineObject>: Send + Sync {
    /// Add an object.
    ///
    /// Returns the object back if it is larger than either maximum; the
    /// caller must then release it immediately.
    fn push(&self, object: T) -> Result<(), T>;

    /// Remove the oldest object, but only while the quarantine is over its
    /// budget.
    fn pop(&self) -> Option<T>;

    /// Remove and return every object, oldest first.
    fn empty(&self) -> Vec<T>;

    /// Number of objects held.
    fn count(&self) -> usize;

    /// Aggregate size of the objects held.
    fn size(&self) -> usize;

    /// Budget for the aggregate size.
    fn max_quarantine_size(&self) -> usize;

    /// Change the aggregate budget. Takes effect at the next trim.
    fn set_max_quarantine_size(&self, size: usize);

    /// Largest single object accepted.
    fn max_object_size(&self) -> usize;

    /// Change the largest single object accepted.
    fn set_max_object_size(&self, size: usize);

    /// Pop until the aggregate fits the budget, handing each object to
    /// `evict`. Returns the number evicted.
    fn trim<F>(&self, mut evict: F) -> usize
    where
        F: FnMut(T),
        Self: Sized,
    {
        let mut evicted = 0;
        while let Some(object) = self.pop() {
            evict(object);
            evicted += 1;
        }
        evicted
    }
}

/// Whether `size` may enter a quarantine with these limits.
#[inline]
pub(crate) fn fits(size: usize, max_quarantine: usize, max_object: usize) -> bool {
    max_quarantine != 0 && max_object != 0 && size <= max_quarantine && size <= max_object
}

/// Whether a quarantine holding `size` bytes in `count` objects is over budget.
#[inline]
pub(crate) fn over_budget(size: usize, count: usize, max_quarantine: usize) -> bool {
    if count == 0 {
        return false;
    }
    max_quarantine == 0 || size > max_quarantine
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_means_no_capacity() {
        assert!(!fits(1, 0, UNBOUNDED));
        assert!(!fits(1, UNBOUNDED, 0));
        assert!(fits(10, 10, 10));
        assert!(!fits(11, 10, UNBOUNDED));

        assert!(over_budget(0, 1, 0));
        assert!(!over_budget(0, 0, 0));
        assert!(!over_budget(10, 2, 10));
        assert!(over_budget(11, 2, 10));
    }
}
