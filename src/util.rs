use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    /// Classify an entry without following symlinks.
    pub fn from_file_type(file_type: fs::FileType, path: &Path) -> Result<Self> {
        if file_type.is_symlink() {
            Ok(EntryKind::Symlink)
        } else if file_type.is_dir() {
            Ok(EntryKind::Dir)
        } else if file_type.is_file() {
            Ok(EntryKind::File)
        } else {
            Err(Error::UnsupportedEntryKind {
                path: path.to_path_buf(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub full_path: PathBuf,
}

/// Entries of one tree keyed by relative path, plus what the scan skipped.
#[derive(Debug, Default)]
pub struct TreeScan {
    pub entries: BTreeMap<String, DirEntry>,
    pub unsupported: Vec<String>,
}

/// Walk a directory tree without following symlinks.
///
/// Paths use forward slashes for cross-platform consistency in the patch format.
/// Entries of unsupported kinds are logged and listed in [`TreeScan::unsupported`].
pub fn walk_tree(root: &Path) -> Result<TreeScan> {
    let root = root.canonicalize().map_err(|e| Error::io(root, e))?;
    let mut scan = TreeScan::default();

    for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(&root).to_path_buf();
            match e.into_io_error() {
                Some(io) => Error::io(&path, io),
                None => Error::InvalidPatch(format!("filesystem loop at {}", path.display())),
            }
        })?;

        let full_path = entry.path().to_path_buf();
        let relative = relative_path(&root, &full_path)?;

        match EntryKind::from_file_type(entry.file_type(), &full_path) {
            Ok(kind) => {
                scan.entries.insert(relative, DirEntry { kind, full_path });
            }
            Err(err @ Error::UnsupportedEntryKind { .. }) => {
                tracing::warn!(path = %relative, "{err}, skipping");
                scan.unsupported.push(relative);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(scan)
}

fn relative_path(root: &Path, full_path: &Path) -> Result<String> {
    let relative = full_path
        .strip_prefix(root)
        .map_err(|_| Error::InvalidPath {
            path: full_path.display().to_string(),
        })?;
    let relative = relative.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: full_path.to_path_buf(),
    })?;
    Ok(relative.replace('\\', "/"))
}

/// Resolve a patch-relative path under `root`, refusing anything that could escape it.
pub fn join_relative(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let safe = !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(Error::InvalidPath {
            path: relative.to_string(),
        });
    }
    Ok(root.join(path))
}

/// Memory-map a file for read-only access. Empty files map to `None`.
///
/// Callers must not truncate or replace the file while the map is live.
pub fn mmap_file(path: &Path) -> Result<Option<Mmap>> {
    let file = fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: the mapping is only read, and the trees are not mutated during a run.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
    Ok(Some(map))
}

/// Textual target of the symlink at `path`.
pub fn read_link_text(path: &Path) -> Result<String> {
    let target = fs::read_link(path).map_err(|e| Error::io(path, e))?;
    target
        .into_os_string()
        .into_string()
        .map_err(|_| Error::NonUtf8Path {
            path: path.to_path_buf(),
        })
}

#[cfg(unix)]
pub fn create_symlink(link_target: &str, at: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link_target, at).map_err(|e| Error::io(at, e))
}

#[cfg(windows)]
pub fn create_symlink(link_target: &str, at: &Path) -> Result<()> {
    let resolved = at.parent().unwrap_or(Path::new("")).join(link_target);
    let result = if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(link_target, at)
    } else {
        std::os::windows::fs::symlink_file(link_target, at)
    };
    result.map_err(|e| Error::io(at, e))
}

/// Sort paths so children come before parents (for deletion).
pub fn sort_deepest_first(paths: &mut [String]) {
    paths.sort();
    paths.reverse();
}
