use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::file_diff::block_slice;
use crate::patch::{FileDigest, OpKind, Patch};
use crate::util::{self, EntryKind};

/// Where an apply run is. Any state can move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Idle,
    Staging,
    Finalizing,
    Publishing,
    Done,
    Failed,
}

/// Shared flag a caller sets to abandon an apply run before it publishes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub dirs_created: usize,
    pub files_added: usize,
    pub files_modified: usize,
    /// Unchanged files and symlinks copied over from the old tree.
    pub entries_carried: usize,
    pub symlinks_created: usize,
    pub paths_deleted: usize,
}

/// One unit of per-file work in the staging phase.
enum FileJob<'p> {
    Rebuild { path: &'p str, steps: Vec<&'p OpKind> },
    CarryFile { path: &'p str },
    CarryLink { path: &'p str },
}

#[derive(Clone, Copy)]
enum Outcome {
    Added,
    Modified,
    Carried,
}

/// Rebuilds a new tree from an old tree and a patch, then swaps it in.
///
/// The new tree is staged in a private directory next to the target and only
/// replaces the target once every file is written and verified. On any error
/// the target is left as it was and the staging directory is removed.
pub struct Applier {
    config: Config,
    cancel: CancelFlag,
    state: ApplyState,
}

impl Applier {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancelFlag::new(),
            state: ApplyState::Idle,
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ApplyState {
        self.state
    }

    pub fn apply(&mut self, patch: &Patch, old_root: &Path, target_root: &Path) -> Result<ApplySummary> {
        match self.run(patch, old_root, target_root) {
            Ok(summary) => {
                self.state = ApplyState::Done;
                tracing::info!(root = %target_root.display(), ?summary, "patch applied");
                Ok(summary)
            }
            Err(err) => {
                tracing::warn!(state = ?self.state, error = %err, "apply failed, target left untouched");
                self.state = ApplyState::Failed;
                Err(err)
            }
        }
    }

    fn run(&mut self, patch: &Patch, old_root: &Path, target_root: &Path) -> Result<ApplySummary> {
        self.state = ApplyState::Staging;
        self.config.validate()?;
        if patch.block_size != self.config.block_size {
            return Err(Error::BlockSizeMismatch {
                patch: patch.block_size,
                config: self.config.block_size,
            });
        }
        validate_paths(patch)?;

        let old_root = old_root.canonicalize().map_err(|e| Error::io(old_root, e))?;
        let (parent, name) = split_target(target_root)?;

        let area = tempfile::Builder::new()
            .prefix(&format!(".{name}.dirpatch-"))
            .tempdir_in(&parent)
            .map_err(|e| Error::io(&parent, e))?;
        let staged = area.path().join("tree");
        fs::create_dir(&staged).map_err(|e| Error::io(&staged, e))?;
        tracing::debug!(staging = %staged.display(), "staging new tree");

        let summary = self.stage(patch, &old_root, &staged)?;

        self.state = ApplyState::Finalizing;
        verify_staged(patch, &staged)?;
        self.check_cancelled()?;

        self.state = ApplyState::Publishing;
        let backup = parent.join(format!(
            "{}.previous",
            area.path().file_name().and_then(|n| n.to_str()).unwrap_or(".dirpatch")
        ));
        publish(&staged, target_root, &backup)?;

        Ok(summary)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Write the whole new tree into `staged`.
    fn stage(&self, patch: &Patch, old_root: &Path, staged: &Path) -> Result<ApplySummary> {
        let mut summary = ApplySummary {
            dirs_created: patch.new_dirs.len(),
            ..ApplySummary::default()
        };
        summary.paths_deleted = apply_structure(patch, staged)?;

        let mut linked = BTreeSet::new();
        for op in &patch.operations {
            if let OpKind::Symlink { link_target } = &op.kind {
                let at = util::join_relative(staged, &op.target_path)?;
                util::create_symlink(link_target, &at)?;
                linked.insert(op.target_path.as_str());
                summary.symlinks_created += 1;
            }
        }

        let groups = patch.content_groups();
        let rebuilt: BTreeSet<&str> = groups.keys().copied().collect();
        let mut jobs: Vec<FileJob<'_>> = Vec::with_capacity(patch.new_files.len());
        for (path, steps) in groups {
            jobs.push(FileJob::Rebuild { path, steps });
        }
        for path in patch.new_files.keys() {
            let path = path.as_str();
            if !patch.extra_paths.contains(path) && !rebuilt.contains(path) {
                jobs.push(FileJob::CarryFile { path });
            }
        }
        for path in &patch.new_links {
            let path = path.as_str();
            if !linked.contains(path) && !patch.extra_paths.contains(path) {
                jobs.push(FileJob::CarryLink { path });
            }
        }

        let pool = self.config.thread_pool()?;
        let outcomes = pool.install(|| {
            jobs.par_iter()
                .map(|job| -> Result<Outcome> {
                    self.check_cancelled()?;
                    self.run_job(job, patch, old_root, staged)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        for outcome in outcomes {
            match outcome {
                Outcome::Added => summary.files_added += 1,
                Outcome::Modified => summary.files_modified += 1,
                Outcome::Carried => summary.entries_carried += 1,
            }
        }
        Ok(summary)
    }

    fn run_job(&self, job: &FileJob<'_>, patch: &Patch, old_root: &Path, staged: &Path) -> Result<Outcome> {
        match job {
            FileJob::Rebuild { path, steps } => {
                let dest = util::join_relative(staged, path)?;
                let old_path = util::join_relative(old_root, path)?;
                rebuild_file(path, steps, &old_path, &dest, patch.block_size, patch.new_files.get(*path))?;
                if patch.extra_paths.contains(*path) {
                    Ok(Outcome::Added)
                } else {
                    Ok(Outcome::Modified)
                }
            }
            FileJob::CarryFile { path } => {
                let src = util::join_relative(old_root, path)?;
                let dest = util::join_relative(staged, path)?;
                let map = util::mmap_file(&src).map_err(|e| missing_source(path, e))?;
                let data: &[u8] = map.as_deref().unwrap_or_default();
                if let Some(expected) = patch.new_files.get(*path) {
                    if FileDigest::of(data) != *expected {
                        return Err(Error::source_mismatch(path, "unchanged file differs from the diffed tree"));
                    }
                }
                create_staged_file(&dest)?
                    .write_all(data)
                    .map_err(|e| Error::io(&dest, e))?;
                Ok(Outcome::Carried)
            }
            FileJob::CarryLink { path } => {
                let src = util::join_relative(old_root, path)?;
                let dest = util::join_relative(staged, path)?;
                let link_target = util::read_link_text(&src).map_err(|e| missing_source(path, e))?;
                util::create_symlink(&link_target, &dest)?;
                Ok(Outcome::Carried)
            }
        }
    }
}

/// Materialize `new_dirs` and run the `Mkdir`/`Delete` operations against `staged`.
///
/// Deletes are only counted: the staging tree starts empty, so there is nothing
/// of the old tree in it to remove. Running this twice leaves the same structure.
pub(crate) fn apply_structure(patch: &Patch, staged: &Path) -> Result<usize> {
    for dir in &patch.new_dirs {
        let full = util::join_relative(staged, dir)?;
        fs::create_dir_all(&full).map_err(|e| Error::io(&full, e))?;
    }

    let mut deleted = 0;
    for op in &patch.operations {
        match op.kind {
            OpKind::Mkdir => {
                let full = util::join_relative(staged, &op.target_path)?;
                fs::create_dir_all(&full).map_err(|e| Error::io(&full, e))?;
            }
            OpKind::Delete => deleted += 1,
            _ => {}
        }
    }
    Ok(deleted)
}

/// Write one file by running its steps in order, checking it against `expected`.
fn rebuild_file(
    path: &str,
    steps: &[&OpKind],
    old_path: &Path,
    dest: &Path,
    block_size: usize,
    expected: Option<&FileDigest>,
) -> Result<()> {
    let needs_old = steps.iter().any(|step| matches!(step, OpKind::BlockRange { .. }));
    let old_map = if needs_old {
        util::mmap_file(old_path).map_err(|e| missing_source(path, e))?
    } else {
        None
    };
    let old: &[u8] = old_map.as_deref().unwrap_or_default();

    let mut out = BufWriter::with_capacity(256 * 1024, create_staged_file(dest)?);
    let mut hasher = blake3::Hasher::new();
    let mut len = 0u64;

    for step in steps {
        let bytes: &[u8] = match step {
            OpKind::Data(data) => data.as_slice(),
            OpKind::BlockRange {
                block_index,
                block_span,
            } => block_slice(old, *block_index, *block_span, block_size).ok_or_else(|| {
                Error::source_mismatch(
                    path,
                    format!(
                        "blocks {block_index}..{} of size {block_size} lie beyond the old file ({} bytes)",
                        block_index.saturating_add(*block_span),
                        old.len()
                    ),
                )
            })?,
            OpKind::Symlink { .. } | OpKind::Delete | OpKind::Mkdir => continue,
        };
        out.write_all(bytes).map_err(|e| Error::io(dest, e))?;
        hasher.update(bytes);
        len += bytes.len() as u64;
    }
    out.flush().map_err(|e| Error::io(dest, e))?;

    if let Some(expected) = expected {
        let actual = FileDigest {
            len,
            blake3: *hasher.finalize().as_bytes(),
        };
        if actual != *expected {
            return Err(Error::source_mismatch(
                path,
                format!("rebuilt {len} bytes do not match the diffed file ({} bytes)", expected.len),
            ));
        }
    }
    Ok(())
}

/// Open a new staged file. Anything already at `dest`, a symlink included, is an error.
fn create_staged_file(dest: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .map_err(|e| Error::io(dest, e))
}

/// An old-tree entry the patch relies on is gone.
fn missing_source(path: &str, err: Error) -> Error {
    match err {
        Error::PathNotFound { .. } => Error::source_mismatch(path, "missing from the old tree"),
        other => other,
    }
}

fn validate_paths(patch: &Patch) -> Result<()> {
    let root = Path::new("");
    let mut all = patch
        .operations
        .iter()
        .map(|op| op.target_path.as_str())
        .chain(patch.expected_paths());
    all.try_for_each(|path| util::join_relative(root, path).map(drop))
}

/// Compare the staged tree with the paths and kinds the patch promises.
fn verify_staged(patch: &Patch, staged: &Path) -> Result<()> {
    let mut expected: BTreeMap<&str, EntryKind> = BTreeMap::new();
    expected.extend(patch.new_dirs.iter().map(|p| (p.as_str(), EntryKind::Dir)));
    expected.extend(patch.new_files.keys().map(|p| (p.as_str(), EntryKind::File)));
    expected.extend(patch.new_links.iter().map(|p| (p.as_str(), EntryKind::Symlink)));

    let scan = util::walk_tree(staged)?;
    let mut missing = Vec::new();
    let mut unexpected: Vec<String> = scan.unsupported.clone();

    for (path, kind) in &expected {
        match scan.entries.get(*path) {
            Some(entry) if entry.kind == *kind => {}
            _ => missing.push(path.to_string()),
        }
    }
    for (path, entry) in &scan.entries {
        if expected.get(path.as_str()) != Some(&entry.kind) {
            unexpected.push(path.clone());
        }
    }

    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(Error::IncompletePatch { missing, unexpected })
    }
}

/// Parent directory and final component of the target.
fn split_target(target: &Path) -> Result<(PathBuf, String)> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidConfig(format!("target {} has no usable name", target.display())))?;
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, name.to_string()))
}

/// Swap `staged` in at `target`, keeping the previous tree until the swap succeeds.
fn publish(staged: &Path, target: &Path, backup: &Path) -> Result<()> {
    if fs::symlink_metadata(target).is_err() {
        return fs::rename(staged, target).map_err(|e| Error::io(target, e));
    }

    fs::rename(target, backup).map_err(|e| Error::io(target, e))?;
    if let Err(err) = fs::rename(staged, target) {
        if let Err(restore) = fs::rename(backup, target) {
            tracing::error!(
                previous = %backup.display(),
                error = %restore,
                "could not restore the previous tree; it is kept at the backup path"
            );
        }
        return Err(Error::io(target, err));
    }

    if let Err(err) = remove_entry(backup) {
        tracing::warn!(previous = %backup.display(), error = %err, "failed to remove previous tree");
    }
    Ok(())
}

/// Remove `path` whatever it is: a directory tree, a file or a symlink.
fn remove_entry(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
