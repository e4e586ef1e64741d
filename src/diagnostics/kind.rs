//! Bad access kinds and diagnostic codes.

use std::fmt;

/// Kind of memory error found at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BadAccessKind {
    /// The address is poisoned but no block explains it.
    UnknownBadAccess,
    /// The address is above the monitored window or in detector memory.
    WildAccess,
    /// The address is in a region that is never valid.
    InvalidAddress,
    /// The metadata of the owning block failed validation.
    CorruptBlock,
    /// A heap walk found corrupt blocks.
    CorruptHeap,
    /// The block was freed.
    UseAfterFree,
    /// The access went past the end of the body.
    HeapBufferOverflow,
    /// The access went before the start of the body.
    HeapBufferUnderflow,
    /// The block was freed twice.
    DoubleFree,
}

impl BadAccessKind {
    /// Name used in reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownBadAccess => "heap-unknown-error",
            Self::WildAccess => "wild-access",
            Self::InvalidAddress => "invalid-address",
            Self::CorruptBlock => "corrupt-block",
            Self::CorruptHeap => "corrupt-heap",
            Self::UseAfterFree => "heap-use-after-free",
            Self::HeapBufferOverflow => "heap-buffer-overflow",
            Self::HeapBufferUnderflow => "heap-buffer-underflow",
            Self::DoubleFree => "attempting double-free",
        }
    }

    /// The predefined diagnostic for this kind.
    pub const fn diagnostic(self) -> &'static Diagnostic {
        match self {
            Self::UnknownBadAccess => &SH000,
            Self::WildAccess => &SH001,
            Self::InvalidAddress => &SH002,
            Self::CorruptBlock => &SH003,
            Self::CorruptHeap => &SH004,
            Self::UseAfterFree => &SH005,
            Self::HeapBufferOverflow => &SH006,
            Self::HeapBufferUnderflow => &SH007,
            Self::DoubleFree => &SH008,
        }
    }

    /// Diagnostic code of this kind.
    pub const fn code(self) -> &'static str {
        self.diagnostic().code
    }
}

impl fmt::Display for BadAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of the faulting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    /// A load.
    Read,
    /// A store.
    Write,
    /// Not known, e.g. a free.
    #[default]
    Unknown,
}

impl AccessMode {
    /// Name used in reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A memory error or refused operation.
    Error,
    /// Degraded operation, e.g. the arena ran out.
    Warning,
}

impl DiagnosticKind {
    /// Display prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
        }
    }
}

/// A diagnostic with code, message and optional help.
///
/// Codes follow the pattern:
/// - `SH0xx` - bad accesses, one per [`BadAccessKind`]
/// - `SH1xx` - refused heap operations
/// - `SH2xx` - resource exhaustion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "SH005").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// SH0xx - bad accesses
// =============================================================================

/// SH000: poisoned memory with no owning block.
pub const SH000: Diagnostic = Diagnostic::error("SH000", "heap-unknown-error")
    .with_note("the address is poisoned but lies in no block");

/// SH001: access outside the monitored window.
pub const SH001: Diagnostic = Diagnostic::error("SH001", "wild-access")
    .with_note("the address is outside any memory the heap manages");

/// SH002: access to a never-valid region.
pub const SH002: Diagnostic = Diagnostic::error("SH002", "invalid-address")
    .with_note("the address is in the guard region of the arena");

/// SH003: corrupt block metadata.
pub const SH003: Diagnostic = Diagnostic::error("SH003", "corrupt-block")
    .with_note("the block header, padding or trailer was overwritten")
    .with_help("look for an earlier overflow or underflow into this block");

/// SH004: corrupt heap.
pub const SH004: Diagnostic = Diagnostic::error("SH004", "corrupt-heap")
    .with_note("a heap walk found blocks with invalid metadata");

/// SH005: use after free.
pub const SH005: Diagnostic = Diagnostic::error("SH005", "heap-use-after-free")
    .with_help("the free stack shows where the block was released");

/// SH006: overflow.
pub const SH006: Diagnostic = Diagnostic::error("SH006", "heap-buffer-overflow")
    .with_note("the access is in the right redzone of the block");

/// SH007: underflow.
pub const SH007: Diagnostic = Diagnostic::error("SH007", "heap-buffer-underflow")
    .with_note("the access is in the left redzone of the block");

/// SH008: double free.
pub const SH008: Diagnostic = Diagnostic::error("SH008", "attempting double-free")
    .with_help("the free stack shows the first free of this block");

// =============================================================================
// SH1xx - refused operations
// =============================================================================

/// SH101: free of a pointer the heap never returned.
pub const SH101: Diagnostic = Diagnostic::warning(
    "SH101",
    "attempt to free a pointer not allocated by this heap",
)
.with_help("only pass pointers returned by allocate or resize");

/// SH102: logical heap mismatch.
pub const SH102: Diagnostic = Diagnostic::warning(
    "SH102",
    "pointer freed through a heap that does not own it",
);

// =============================================================================
// SH2xx - exhaustion
// =============================================================================

/// SH201: the arena could not satisfy a request.
pub const SH201: Diagnostic = Diagnostic::warning("SH201", "arena exhausted, allocation failed")
    .with_help("increase arena_size in HeapConfig or lower the quarantine size");
