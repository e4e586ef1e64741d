//! Bad access classification and reporting.
//!
//! This module provides:
//! - **Classification**: faulting address to [`ErrorInfo`]
//! - **Emission**: reports to the `log` facade or stderr, custom sinks
//! - **Failure policy**: continue, panic or abort after a report
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | SH0xx | Bad accesses                   |
//! | SH1xx | Refused heap operations        |
//! | SH2xx | Resource exhaustion            |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shadowheap::diagnostics::{suppress_diagnostics, CollectingSink};
//!
//! suppress_diagnostics(true);
//! let sink = std::sync::Arc::new(CollectingSink::new());
//! heap.set_heap_error_sink(sink.clone());
//! ```

pub mod classify;
pub mod emit;
pub mod info;
pub mod kind;
pub mod macros;
pub mod policy;

pub use classify::BadAccessClassifier;
pub use emit::{emit, emit_report, emit_with_context, suppress_diagnostics, CollectingSink, DiagnosticSink};
pub use info::{BlockDescription, CorruptRange, ErrorInfo};
pub use kind::{AccessMode, BadAccessKind, Diagnostic, DiagnosticKind};
pub use policy::FailurePolicy;

pub use kind::{SH000, SH001, SH002, SH003, SH004, SH005, SH006, SH007, SH008, SH101, SH102, SH201};
