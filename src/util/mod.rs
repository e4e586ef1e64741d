//! Small helpers shared by every layer.

pub(crate) mod clock;
pub(crate) mod layout;
pub(crate) mod size;
