//! Monotonic ticks and compact thread identifiers for block metadata.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

static NEXT_THREAD_SERIAL: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_SERIAL: Cell<u32> = const { Cell::new(0) };
}

/// Nanoseconds elapsed since the process epoch.
///
/// The epoch is fixed the first time any tick is read, so tick values are
/// only comparable with each other.
pub fn ticks() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Time elapsed since `then`, a value previously returned by [`ticks`].
pub fn since(then: u64) -> Duration {
    Duration::from_nanos(ticks().saturating_sub(then))
}

/// A small serial number for the calling thread. Never 0.
pub fn current_thread_serial() -> u32 {
    THREAD_SERIAL.with(|serial| {
        let current = serial.get();
        if current != 0 {
            return current;
        }
        let assigned = NEXT_THREAD_SERIAL.fetch_add(1, Ordering::Relaxed);
        serial.set(assigned);
        assigned
    })
}
