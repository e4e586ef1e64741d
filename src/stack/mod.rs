//! Stack captures for allocation and free sites.
//!
//! Capturing is an opaque synchronous call; symbolization is left to the
//! consumer of a report. Block headers only store a [`StackId`]; the
//! captures themselves live in a [`StackCaptureCache`].

mod cache;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

pub use cache::StackCaptureCache;

/// Default frame limit for a capture.
pub const DEFAULT_MAX_FRAMES: usize = 62;

/// Compact identifier of a cached capture. 0 means "no stack".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct StackId(u32);

impl StackId {
    /// The empty slot.
    pub const NONE: Self = Self(0);

    /// Whether this is the empty slot.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Raw value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Next candidate id when probing past a collision.
    pub(crate) fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}

/// Instruction pointers of one call stack, innermost first.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct StackCapture {
    frames: Vec<usize>,
}

impl StackCapture {
    /// Capture the current call stack.
    ///
    /// The first `skip` frames (this function and its callers inside the
    /// heap) are dropped, then at most `max_frames` are kept.
    #[inline(never)]
    pub fn capture(skip: usize, max_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(max_frames.min(DEFAULT_MAX_FRAMES));
        let mut seen = 0usize;
        backtrace::trace(|frame| {
            seen += 1;
            if seen <= skip {
                return true;
            }
            frames.push(frame.ip() as usize);
            frames.len() < max_frames
        });
        Self { frames }
    }

    /// A capture from known frames.
    pub fn from_frames(frames: Vec<usize>) -> Self {
        Self { frames }
    }

    /// The frames, innermost first.
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame was recorded.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Content-derived id, never [`StackId::NONE`].
    pub fn relative_id(&self) -> StackId {
        let mut hasher = DefaultHasher::new();
        self.frames.hash(&mut hasher);
        let hash = hasher.finish();
        let folded = (hash ^ (hash >> 32)) as u32;
        if folded == 0 {
            StackId(1)
        } else {
            StackId(folded)
        }
    }
}

impl fmt::Debug for StackCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackCapture")
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl fmt::Display for StackCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ip) in self.frames.iter().enumerate() {
            writeln!(f, "    #{} {:#x}", i, ip)?;
        }
        Ok(())
    }
}
