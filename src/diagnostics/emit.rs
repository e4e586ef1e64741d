//! Diagnostic emission backend.
//!
//! Reports go to the `log` facade when the `log` feature is enabled, and to
//! stderr otherwise (debug builds, or release builds with `diagnostics`).

use std::sync::atomic::{AtomicBool, Ordering};

use super::info::ErrorInfo;
use super::kind::{BadAccessKind, Diagnostic};
use crate::sync::mutex::Mutex;

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Suppress all diagnostic output.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Emit a predefined diagnostic.
pub fn emit(diag: &Diagnostic) {
    emit_with_context(diag, "");
}

/// Emit a predefined diagnostic with runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    if is_suppressed() {
        return;
    }

    #[cfg(feature = "log")]
    emit_to_log(diag, context);

    #[cfg(all(not(feature = "log"), any(debug_assertions, feature = "diagnostics")))]
    emit_to_stderr(diag, context);

    #[cfg(all(not(feature = "log"), not(any(debug_assertions, feature = "diagnostics"))))]
    let _ = (diag, context);
}

/// Emit a full bad access report.
pub fn emit_report(info: &ErrorInfo) {
    if is_suppressed() {
        return;
    }

    #[cfg(feature = "log")]
    log::error!("{}", info);

    #[cfg(all(not(feature = "log"), any(debug_assertions, feature = "diagnostics")))]
    {
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), "{}", info);
    }

    #[cfg(all(not(feature = "log"), not(any(debug_assertions, feature = "diagnostics"))))]
    let _ = info;
}

#[cfg(feature = "log")]
fn emit_to_log(diag: &Diagnostic, context: &str) {
    use super::kind::DiagnosticKind;

    match diag.kind {
        DiagnosticKind::Error => log::error!("[{}] {}", diag.code, diag.message),
        DiagnosticKind::Warning => log::warn!("[{}] {}", diag.code, diag.message),
    }
    if !context.is_empty() {
        log::info!("  context: {}", context);
    }
    if let Some(note) = diag.note {
        log::info!("  note: {}", note);
    }
    if let Some(help) = diag.help {
        log::info!("  help: {}", help);
    }
}

#[cfg(all(not(feature = "log"), any(debug_assertions, feature = "diagnostics")))]
fn emit_to_stderr(diag: &Diagnostic, context: &str) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(
        stderr,
        "[shadowheap][{}] {}: {}",
        diag.code,
        diag.kind.prefix(),
        diag.message
    );
    if !context.is_empty() {
        let _ = writeln!(stderr, "  context: {}", context);
    }
    if let Some(note) = diag.note {
        let _ = writeln!(stderr, "  note: {}", note);
    }
    if let Some(help) = diag.help {
        let _ = writeln!(stderr, "  help: {}", help);
    }
    let _ = writeln!(stderr);
}

/// Receiver of bad access reports.
///
/// Closures taking `&ErrorInfo` are sinks, so a heap error callback is
/// just a sink.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a report.
    fn report(&self, info: &ErrorInfo);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&ErrorInfo) + Send + Sync,
{
    fn report(&self, info: &ErrorInfo) {
        self(info)
    }
}

/// A sink that keeps every report.
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<ErrorInfo>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every report received so far.
    pub fn reports(&self) -> Vec<ErrorInfo> {
        self.reports.lock().clone()
    }

    /// Kinds of every report received so far.
    pub fn kinds(&self) -> Vec<BadAccessKind> {
        self.reports.lock().iter().map(|info| info.kind).collect()
    }

    /// The most recent report.
    pub fn last(&self) -> Option<ErrorInfo> {
        self.reports.lock().last().cloned()
    }

    /// Number of reports received.
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Whether nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every report.
    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, info: &ErrorInfo) {
        self.reports.lock().push(info.clone());
    }
}
