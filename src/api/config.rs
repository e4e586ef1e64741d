//! Heap configuration.

use crate::diagnostics::FailurePolicy;
use crate::error::SetupError;
use crate::quarantine::UNBOUNDED;
use crate::shadow::GUARD_SIZE;
use crate::stack::DEFAULT_MAX_FRAMES;
use crate::util::size::mib;

/// Configuration for a [`GuardedHeap`](crate::GuardedHeap).
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Size of the monitored arena, guard page included (default: 64 MiB)
    pub arena_size: usize,

    /// Budget of the quarantine in bytes (default: 16 MiB, 0 = no quarantine)
    pub quarantine_size: usize,

    /// Largest block that enters the quarantine (default: 4 MiB)
    pub quarantine_block_size: usize,

    /// Number of quarantine shards (default: 4)
    ///
    /// Each shard holds `quarantine_size / quarantine_shards` bytes.
    pub quarantine_shards: usize,

    /// Extra right redzone bytes past the trailer minimum (default: 0)
    pub trailer_padding_size: usize,

    /// Fraction of allocations that get redzones, 0.0 to 1.0 (default: 1.0)
    pub allocation_guard_rate: f64,

    /// Reaction to a reported memory error
    pub failure_policy: FailurePolicy,

    /// Walk the heap for corruption whenever an error is reported
    pub check_heap_on_failure: bool,

    /// Frames kept per allocation and free stack
    pub max_stack_frames: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_size: mib(64),
            quarantine_size: mib(16),
            quarantine_block_size: mib(4),
            quarantine_shards: 4,
            trailer_padding_size: 0,
            allocation_guard_rate: 1.0,
            failure_policy: FailurePolicy::Continue,
            check_heap_on_failure: true,
            max_stack_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

impl HeapConfig {
    /// Create a minimal config for testing or constrained environments.
    ///
    /// A single quarantine shard keeps eviction strictly FIFO.
    pub fn minimal() -> Self {
        Self {
            arena_size: mib(4),
            quarantine_size: mib(1),
            quarantine_block_size: mib(1),
            quarantine_shards: 1,
            trailer_padding_size: 0,
            allocation_guard_rate: 1.0,
            failure_policy: FailurePolicy::Continue,
            check_heap_on_failure: true,
            max_stack_frames: 16,
        }
    }

    /// Default config with the failure policy taken from the environment.
    pub fn from_env() -> Self {
        Self::default().with_failure_policy(FailurePolicy::from_env())
    }

    /// Builder pattern: set the arena size.
    pub fn with_arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Builder pattern: set the quarantine budget.
    pub fn with_quarantine_size(mut self, size: usize) -> Self {
        self.quarantine_size = size;
        self
    }

    /// Builder pattern: set the largest quarantined block.
    pub fn with_quarantine_block_size(mut self, size: usize) -> Self {
        self.quarantine_block_size = size;
        self
    }

    /// Builder pattern: lift both quarantine limits.
    pub fn with_unbounded_quarantine(mut self) -> Self {
        self.quarantine_size = UNBOUNDED;
        self.quarantine_block_size = UNBOUNDED;
        self
    }

    /// Builder pattern: set the number of quarantine shards.
    pub fn with_quarantine_shards(mut self, shards: usize) -> Self {
        self.quarantine_shards = shards;
        self
    }

    /// Builder pattern: set the extra trailer padding.
    pub fn with_trailer_padding_size(mut self, size: usize) -> Self {
        self.trailer_padding_size = size;
        self
    }

    /// Builder pattern: set the guarded fraction of allocations.
    pub fn with_allocation_guard_rate(mut self, rate: f64) -> Self {
        self.allocation_guard_rate = rate;
        self
    }

    /// Builder pattern: set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Builder pattern: enable or disable the heap walk on failure.
    pub fn with_check_heap_on_failure(mut self, enable: bool) -> Self {
        self.check_heap_on_failure = enable;
        self
    }

    /// Builder pattern: set the stack frame limit.
    pub fn with_max_stack_frames(mut self, frames: usize) -> Self {
        self.max_stack_frames = frames;
        self
    }

    /// Reject values no heap can work with.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.arena_size <= GUARD_SIZE {
            return Err(SetupError::InvalidConfig("arena_size must exceed one page"));
        }
        if self.quarantine_shards == 0 {
            return Err(SetupError::InvalidConfig("quarantine_shards must be at least 1"));
        }
        let shard_budget = match self.quarantine_size {
            0 | UNBOUNDED => UNBOUNDED,
            size => size / self.quarantine_shards,
        };
        if self.quarantine_block_size > shard_budget {
            return Err(SetupError::InvalidConfig(
                "quarantine_block_size must fit in one quarantine shard",
            ));
        }
        if !(0.0..=1.0).contains(&self.allocation_guard_rate) {
            return Err(SetupError::InvalidConfig(
                "allocation_guard_rate must be between 0.0 and 1.0",
            ));
        }
        if self.trailer_padding_size > self.arena_size {
            return Err(SetupError::InvalidConfig(
                "trailer_padding_size must fit in the arena",
            ));
        }
        Ok(())
    }
}
