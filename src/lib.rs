//! Binary deltas between directory trees.
//!
//! [`diff`] compares an old and a new tree and produces a [`Patch`]: literal
//! bytes for new content, block references for content the old tree already
//! has, plus the directory, symlink and deletion steps. [`apply`] rebuilds
//! the new tree from the old tree and a patch in a private staging directory
//! and swaps it in only once it is complete and verified.

pub mod apply;
pub mod block_matcher;
pub mod codec;
pub mod config;
pub mod error;
pub mod file_diff;
pub mod patch;
pub mod rolling_hash;
pub mod tree_diff;
pub mod util;

use std::path::Path;

pub use apply::{Applier, ApplyState, ApplySummary, CancelFlag};
pub use block_matcher::{find_match, BlockLibrary, BlockMatch};
pub use config::{Config, DEFAULT_BLOCK_SIZE};
pub use error::{ApplyError, Error, Result};
pub use patch::{FileDigest, OpKind, Operation, Patch, PatchStats};

/// Build the patch that turns `old_root` into `new_root`.
pub fn diff(old_root: &Path, new_root: &Path, config: &Config) -> Result<Patch> {
    tree_diff::diff(old_root, new_root, config)
}

/// Rebuild the new tree from `old_root` and `patch`, then replace `target_root` with it.
///
/// `target_root` may be `old_root` itself. On error the target is untouched.
pub fn apply(
    patch: &Patch,
    old_root: &Path,
    target_root: &Path,
    config: &Config,
) -> Result<ApplySummary, ApplyError> {
    Applier::new(*config).apply(patch, old_root, target_root)
}
