//! Diagnostic and logging macros.

/// Emit a predefined diagnostic by code, optionally with formatted context.
///
/// # Example
///
/// ```rust,ignore
/// sh_emit!(SH201);
/// sh_emit!(SH201, "requested {} bytes", size);
/// ```
#[macro_export]
macro_rules! sh_emit {
    ($code:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$code);
    }};
    ($code:ident, $($ctx:tt)+) => {{
        $crate::diagnostics::emit::emit_with_context(
            &$crate::diagnostics::$code,
            &format!($($ctx)+),
        );
    }};
}

/// Log through the `log` facade when the feature is on; otherwise the
/// arguments are type checked and dropped.
macro_rules! sh_log {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "log")]
        {
            log::$level!($($arg)+);
        }
        #[cfg(not(feature = "log"))]
        {
            if false {
                let _ = format!($($arg)+);
            }
        }
    }};
}

macro_rules! sh_trace {
    ($($arg:tt)+) => { $crate::diagnostics::macros::sh_log!(trace, $($arg)+) };
}

macro_rules! sh_debug {
    ($($arg:tt)+) => { $crate::diagnostics::macros::sh_log!(debug, $($arg)+) };
}

macro_rules! sh_warn {
    ($($arg:tt)+) => { $crate::diagnostics::macros::sh_log!(warn, $($arg)+) };
}

pub(crate) use {sh_debug, sh_log, sh_trace, sh_warn};

pub use crate::sh_emit;
