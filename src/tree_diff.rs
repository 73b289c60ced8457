use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;

use crate::config::Config;
use crate::error::Result;
use crate::file_diff;
use crate::patch::{FileDigest, OpKind, Operation, Patch};
use crate::util::{self, DirEntry, EntryKind, TreeScan};

/// Compare `old_root` with `new_root` and build the patch that turns one into the other.
///
/// Any unreadable entry aborts the whole diff; no partial patch is returned.
pub fn diff(old_root: &Path, new_root: &Path, config: &Config) -> Result<Patch> {
    config.validate()?;
    let pool = config.thread_pool()?;

    // Walk both trees concurrently.
    let (old_scan, new_scan) = pool.join(|| util::walk_tree(old_root), || util::walk_tree(new_root));
    let old_scan = old_scan?;
    let new_scan = new_scan?;

    tracing::debug!(
        old_entries = old_scan.entries.len(),
        new_entries = new_scan.entries.len(),
        "scanned trees"
    );

    let mut patch = Patch {
        block_size: config.block_size,
        old_dirs: dirs_of(&old_scan),
        new_dirs: dirs_of(&new_scan),
        new_links: paths_of_kind(&new_scan, EntryKind::Symlink),
        unsupported: old_scan
            .unsupported
            .iter()
            .chain(&new_scan.unsupported)
            .cloned()
            .collect(),
        ..Patch::default()
    };

    let mut common_files: Vec<(&str, &DirEntry, &DirEntry)> = Vec::new();
    let mut common_links: Vec<(&str, &DirEntry, &DirEntry)> = Vec::new();

    for (path, old_entry) in &old_scan.entries {
        match new_scan.entries.get(path) {
            None => {
                patch.deleted_paths.insert(path.clone());
            }
            Some(new_entry) if new_entry.kind != old_entry.kind => {
                patch.deleted_paths.insert(path.clone());
                patch.extra_paths.insert(path.clone());
            }
            Some(new_entry) => match new_entry.kind {
                EntryKind::File => common_files.push((path.as_str(), old_entry, new_entry)),
                EntryKind::Symlink => common_links.push((path.as_str(), old_entry, new_entry)),
                EntryKind::Dir => {}
            },
        }
    }
    for path in new_scan.entries.keys() {
        if !old_scan.entries.contains_key(path) {
            patch.extra_paths.insert(path.clone());
        }
    }

    // Deletions first so a reused name never collides with its old entry.
    let mut deleted: Vec<String> = patch.deleted_paths.iter().cloned().collect();
    util::sort_deepest_first(&mut deleted);
    patch
        .operations
        .extend(deleted.into_iter().map(|path| Operation::new(path, OpKind::Delete)));

    // Additions, parents before children.
    let added: Vec<&str> = patch.extra_paths.iter().map(String::as_str).collect();
    let additions = pool.install(|| {
        added
            .par_iter()
            .map(|&path| addition(path, &new_scan.entries[path]))
            .collect::<Result<Vec<_>>>()
    })?;
    for (path, kind, digest) in additions {
        if let Some(digest) = digest {
            patch.new_files.insert(path.to_string(), digest);
        }
        patch.operations.push(Operation::new(path, kind));
    }

    for (path, old_entry, new_entry) in common_links {
        let old_target = util::read_link_text(&old_entry.full_path)?;
        let new_target = util::read_link_text(&new_entry.full_path)?;
        if old_target != new_target {
            patch.operations.push(Operation::new(
                path,
                OpKind::Symlink {
                    link_target: new_target,
                },
            ));
        }
    }

    let block_size = config.block_size;
    let modifications = pool.install(|| {
        common_files
            .par_iter()
            .map(|&(path, old_entry, new_entry)| -> Result<_> {
                let (ops, digest) = diff_file(&old_entry.full_path, &new_entry.full_path, block_size)?;
                Ok((path, ops, digest))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    for (path, ops, digest) in modifications {
        patch.new_files.insert(path.to_string(), digest);
        if !ops.is_empty() {
            tracing::debug!(path, steps = ops.len(), "file modified");
        }
        patch
            .operations
            .extend(ops.into_iter().map(|kind| Operation::new(path, kind)));
    }

    let stats = patch.stats();
    tracing::info!(
        deleted = stats.deleted_paths,
        added = stats.extra_paths,
        modified = stats.files_modified,
        literal_bytes = stats.literal_bytes,
        reused_bytes = stats.reused_bytes,
        unsupported = stats.unsupported,
        "diff complete"
    );

    Ok(patch)
}

/// The single operation that creates a path with no old counterpart.
fn addition<'a>(path: &'a str, entry: &DirEntry) -> Result<(&'a str, OpKind, Option<FileDigest>)> {
    match entry.kind {
        EntryKind::Dir => Ok((path, OpKind::Mkdir, None)),
        EntryKind::Symlink => {
            let link_target = util::read_link_text(&entry.full_path)?;
            Ok((path, OpKind::Symlink { link_target }, None))
        }
        EntryKind::File => {
            let map = util::mmap_file(&entry.full_path)?;
            let data: &[u8] = map.as_deref().unwrap_or_default();
            Ok((path, OpKind::Data(data.to_vec()), Some(FileDigest::of(data))))
        }
    }
}

/// Steps for one file present in both trees, plus the new file's digest.
fn diff_file(old_path: &Path, new_path: &Path, block_size: usize) -> Result<(Vec<OpKind>, FileDigest)> {
    let old_map = util::mmap_file(old_path)?;
    let new_map = util::mmap_file(new_path)?;
    let old: &[u8] = old_map.as_deref().unwrap_or_default();
    let new: &[u8] = new_map.as_deref().unwrap_or_default();

    let ops = file_diff::diff_bytes(old, new, block_size)?;
    debug_assert_eq!(file_diff::rebuild(old, &ops, block_size).as_deref(), Some(new));
    Ok((ops, FileDigest::of(new)))
}

fn dirs_of(scan: &TreeScan) -> BTreeSet<String> {
    paths_of_kind(scan, EntryKind::Dir)
}

fn paths_of_kind(scan: &TreeScan, kind: EntryKind) -> BTreeSet<String> {
    scan.entries
        .iter()
        .filter(|(_, entry)| entry.kind == kind)
        .map(|(path, _)| path.clone())
        .collect()
}
