//! What happens after a memory error has been reported.
//!
//! The policy is part of [`HeapConfig`](crate::HeapConfig). It can also be
//! taken from the `SHADOWHEAP_ON_ERROR` environment variable:
//! - "continue" or "0" -> Continue
//! - "panic" or "1" -> Panic
//! - "abort" or "2" -> Abort

use super::info::ErrorInfo;

/// Environment variable read by [`FailurePolicy::from_env`].
pub const POLICY_ENV_VAR: &str = "SHADOWHEAP_ON_ERROR";

/// Reaction to a reported memory error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Report and keep going.
    #[default]
    Continue,
    /// Report, then panic with the summary.
    Panic,
    /// Report, then abort the process.
    Abort,
}

impl FailurePolicy {
    /// Parse a policy name. Unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "0" | "continue" | "warn" => Some(Self::Continue),
            "1" | "panic" => Some(Self::Panic),
            "2" | "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    /// The policy named by `SHADOWHEAP_ON_ERROR`, or `Continue`.
    pub fn from_env() -> Self {
        std::env::var(POLICY_ENV_VAR)
            .ok()
            .and_then(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    /// Apply the policy to a report that has already been emitted.
    pub fn apply(self, info: &ErrorInfo) {
        match self {
            Self::Continue => {}
            Self::Panic => panic!(
                "[shadowheap][{}] {}\nthe failure policy makes memory errors fatal",
                info.code(),
                info.summary()
            ),
            Self::Abort => std::process::abort(),
        }
    }
}
