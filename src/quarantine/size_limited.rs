//! Single-lock quarantine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{fits, over_budget, Quarantine, QuarantineObject};
use crate::sync::mutex::Mutex;

struct Fifo<T> {
    objects: VecDeque<T>,
    size: usize,
}

/// One FIFO behind one lock. Eviction order is insertion order.
pub struct SizeLimitedQuarantine<T> {
    fifo: Mutex<Fifo<T>>,
    max_quarantine_size: AtomicUsize,
    max_object_size: AtomicUsize,
}

impl<T: QuarantineObject> SizeLimitedQuarantine<T> {
    /// Create a quarantine with the given budgets.
    pub fn new(max_quarantine_size: usize, max_object_size: usize) -> Self {
        Self {
            fifo: Mutex::new(Fifo {
                objects: VecDeque::new(),
                size: 0,
            }),
            max_quarantine_size: AtomicUsize::new(max_quarantine_size),
            max_object_size: AtomicUsize::new(max_object_size),
        }
    }
}

impl<T: QuarantineObject + Send> Quarantine<T> for SizeLimitedQuarantine<T> {
    fn push(&self, object: T) -> Result<(), T> {
        let size = object.quarantine_size();
        if !fits(size, self.max_quarantine_size(), self.max_object_size()) {
            return Err(object);
        }
        let mut fifo = self.fifo.lock();
        fifo.objects.push_back(object);
        fifo.size += size;
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        let max = self.max_quarantine_size();
        let mut fifo = self.fifo.lock();
        if !over_budget(fifo.size, fifo.objects.len(), max) {
            return None;
        }
        let object = fifo.objects.pop_front()?;
        fifo.size -= object.quarantine_size();
        Some(object)
    }

    fn empty(&self) -> Vec<T> {
        let mut fifo = self.fifo.lock();
        fifo.size = 0;
        fifo.objects.drain(..).collect()
    }

    fn count(&self) -> usize {
        self.fifo.lock().objects.len()
    }

    fn size(&self) -> usize {
        self.fifo.lock().size
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
    use crate::quarantine::UNBOUNDED;

    #[test]
    fn test_fifo_order_and_bound() {
        let q = SizeLimitedQuarantine::new(100, UNBOUNDED);
        for id in 0..5 {
            q.push(Token::new(id, 30)).unwrap();
        }
        assert_eq!(q.count(), 5);
        assert_eq!(q.size(), 150);

        let mut evicted = Vec::new();
        assert_eq!(q.trim(|t| evicted.push(t.id)), 2);
        assert_eq!(evicted, vec![0, 1]);
        assert_eq!(q.size(), 90);
        assert!(q.size() <= q.max_quarantine_size());
    }

    #[test]
    fn test_pop_only_when_over_budget() {
        let q = SizeLimitedQuarantine::new(100, UNBOUNDED);
        q.push(Token::new(1, 60)).unwrap();
        assert_eq!(q.pop(), None);
        q.push(Token::new(2, 60)).unwrap();
        assert_eq!(q.pop(), Some(Token::new(1, 60)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_oversized_objects_are_rejected() {
        let q = SizeLimitedQuarantine::new(100, 50);
        assert_eq!(q.push(Token::new(1, 51)), Err(Token::new(1, 51)));
        assert_eq!(q.push(Token::new(2, 101)), Err(Token::new(2, 101)));
        assert!(q.push(Token::new(3, 50)).is_ok());
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn test_shrinking_max_evicts_on_trim() {
        let q = SizeLimitedQuarantine::new(1000, UNBOUNDED);
        for id in 0..10 {
            q.push(Token::new(id, 100)).unwrap();
        }
        q.set_max_quarantine_size(250);
        let mut evicted = Vec::new();
        q.trim(|t| evicted.push(t.id));
        assert_eq!(evicted, (0..8).collect::<Vec<_>>());
        assert_eq!(q.size(), 200);
    }

    #[test]
    fn test_zero_max_rejects_and_drains() {
        let q = SizeLimitedQuarantine::new(1000, UNBOUNDED);
        q.push(Token::new(1, 10)).unwrap();
        q.push(Token::new(2, 0)).unwrap();
        q.set_max_quarantine_size(0);
        assert!(q.push(Token::new(3, 1)).is_err());
        assert_eq!(q.trim(|_| {}), 2);
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn test_empty_returns_everything_in_order() {
        let q = SizeLimitedQuarantine::new(UNBOUNDED, UNBOUNDED);
        for id in 0..4 {
            q.push(Token::new(id, 8)).unwrap();
        }
        let all: Vec<_> = q.empty().into_iter().map(|t| t.id).collect();
        assert_eq!(all, vec![0, 1, 2, 3]);
        assert_eq!(q.size(), 0);
        assert_eq!(q.count(), 0);
    }
}
