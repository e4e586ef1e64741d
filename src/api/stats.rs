//! Heap statistics.

use crate::util::size::format_bytes;

/// Snapshot of heap activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// User bytes in allocated blocks.
    pub live_bytes: usize,

    /// Peak of `live_bytes`.
    pub peak_live_bytes: usize,

    /// Allocated blocks and pass-through chunks.
    pub live_blocks: usize,

    /// Successful allocations.
    pub allocation_count: u64,

    /// Successful frees.
    pub free_count: u64,

    /// Allocations served without redzones.
    pub unguarded_allocations: u64,

    /// Blocks held in the quarantine.
    pub quarantine_count: usize,

    /// Bytes held in the quarantine.
    pub quarantine_bytes: usize,

    /// Blocks evicted from the quarantine or refused by it.
    pub quarantine_evictions: u64,

    /// Arena bytes handed out, redzones and quarantine included.
    pub arena_bytes: usize,

    /// Memory errors reported.
    pub errors_reported: u64,

    /// Distinct stack captures currently cached.
    pub cached_stacks: usize,
}

impl HeapStats {
    /// Create empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes the arena spends on redzones and quarantined blocks.
    pub fn overhead_bytes(&self) -> usize {
        self.arena_bytes.saturating_sub(self.live_bytes)
    }
}

impl std::fmt::Display for HeapStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap Statistics:")?;
        writeln!(f, "  Live:            {} in {} blocks", format_bytes(self.live_bytes), self.live_blocks)?;
        writeln!(f, "  Peak live:       {}", format_bytes(self.peak_live_bytes))?;
        writeln!(f, "  Allocations:     {}", self.allocation_count)?;
        writeln!(f, "  Frees:           {}", self.free_count)?;
        writeln!(f, "  Unguarded:       {}", self.unguarded_allocations)?;
        writeln!(
            f,
            "  Quarantine:      {} in {} blocks",
            format_bytes(self.quarantine_bytes),
            self.quarantine_count
        )?;
        writeln!(f, "  Evictions:       {}", self.quarantine_evictions)?;
        writeln!(f, "  Arena:           {}", format_bytes(self.arena_bytes))?;
        writeln!(f, "  Errors reported: {}", self.errors_reported)?;
        Ok(())
    }
}
