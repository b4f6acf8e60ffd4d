#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

#[cfg(any(test, feature = "harness"))]
pub mod harness;
pub mod layout;
pub mod patcher;
pub mod runtime;
pub mod sentinel;
pub mod surface;

pub use layout::{probe_header_size, require_header_size, verify_header_size, LayoutError};
pub use patcher::{patch_attr, patch_slot, PatchError};
pub use sentinel::{get_sentinel, SentinelKind};
pub use surface::{dir, extend, extend_with, extended, reverse, ExtendOptions, SurfaceError};

/// Routes `log` output through the test harness
#[cfg(test)]
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
