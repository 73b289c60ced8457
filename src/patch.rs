use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What one operation does. Only the payload of its own kind exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Literal bytes appended to the file being rebuilt.
    Data(Vec<u8>),
    /// `block_span` whole blocks copied from the old file, starting at block `block_index`.
    BlockRange { block_index: u64, block_span: u64 },
    Symlink { link_target: String },
    Delete,
    Mkdir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Relative, `/`-separated path under the tree root.
    pub target_path: String,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(target_path: impl Into<String>, kind: OpKind) -> Self {
        Self {
            target_path: target_path.into(),
            kind,
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self.kind, OpKind::Data(_) | OpKind::BlockRange { .. })
    }
}

/// Length and BLAKE3 hash of a file in the new tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub len: u64,
    pub blake3: [u8; 32],
}

impl FileDigest {
    pub fn of(data: &[u8]) -> Self {
        Self {
            len: data.len() as u64,
            blake3: *blake3::hash(data).as_bytes(),
        }
    }
}

/// The result of one diff run. Read-only once built.
///
/// `operations` are serialized as separate records by the codec, so the
/// header form of a patch skips them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Block size every `BlockRange` is expressed in.
    pub block_size: usize,
    pub old_dirs: BTreeSet<String>,
    pub new_dirs: BTreeSet<String>,
    /// In old but not in new, or of a different kind in new.
    pub deleted_paths: BTreeSet<String>,
    /// In new but not in old, or of a different kind in old.
    pub extra_paths: BTreeSet<String>,
    /// Every regular file of the new tree.
    pub new_files: BTreeMap<String, FileDigest>,
    /// Every symlink of the new tree.
    pub new_links: BTreeSet<String>,
    /// Entries skipped by the scan because of their kind.
    pub unsupported: BTreeSet<String>,
    #[serde(skip)]
    pub operations: Vec<Operation>,
}

impl Patch {
    /// True when applying the patch would reproduce the old tree as is.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.deleted_paths.is_empty() && self.extra_paths.is_empty()
    }

    pub fn operations_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a Operation> + 'a {
        self.operations.iter().filter(move |op| op.target_path == path)
    }

    /// Content steps grouped by path, in emission order within each path.
    pub fn content_groups(&self) -> BTreeMap<&str, Vec<&OpKind>> {
        let mut groups: BTreeMap<&str, Vec<&OpKind>> = BTreeMap::new();
        for op in self.operations.iter().filter(|op| op.is_content()) {
            groups.entry(op.target_path.as_str()).or_default().push(&op.kind);
        }
        groups
    }

    /// Every path the new tree holds.
    pub fn expected_paths(&self) -> BTreeSet<&str> {
        self.new_dirs
            .iter()
            .chain(self.new_files.keys())
            .chain(self.new_links.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn stats(&self) -> PatchStats {
        let mut stats = PatchStats {
            deleted_paths: self.deleted_paths.len(),
            extra_paths: self.extra_paths.len(),
            unsupported: self.unsupported.len(),
            ..PatchStats::default()
        };
        let mut touched = BTreeSet::new();
        for op in &self.operations {
            match &op.kind {
                OpKind::Data(data) => {
                    stats.data_ops += 1;
                    stats.literal_bytes += data.len() as u64;
                }
                OpKind::BlockRange { block_span, .. } => {
                    stats.block_ranges += 1;
                    stats.reused_bytes += block_span * self.block_size as u64;
                }
                OpKind::Symlink { .. } => stats.symlinks += 1,
                OpKind::Delete => stats.deletes += 1,
                OpKind::Mkdir => stats.mkdirs += 1,
            }
            if op.is_content() && !self.extra_paths.contains(&op.target_path) {
                touched.insert(op.target_path.as_str());
            }
        }
        stats.files_modified = touched.len();
        stats
    }
}

/// Size and shape of a patch, for dry runs and reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub data_ops: usize,
    pub block_ranges: usize,
    pub symlinks: usize,
    pub deletes: usize,
    pub mkdirs: usize,
    pub files_modified: usize,
    pub deleted_paths: usize,
    pub extra_paths: usize,
    pub unsupported: usize,
    /// Bytes carried literally in the patch.
    pub literal_bytes: u64,
    /// Bytes referenced from the old tree.
    pub reused_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Patch {
        let mut patch = Patch {
            block_size: 4,
            ..Patch::default()
        };
        patch.new_dirs.insert("sub".into());
        patch.extra_paths.insert("sub/new.txt".into());
        patch.new_files.insert("sub/new.txt".into(), FileDigest::of(b"abc"));
        patch.new_files.insert("a.txt".into(), FileDigest::of(b"xxxxyyyy!"));
        patch.new_links.insert("link".into());
        patch.operations = vec![
            Operation::new("sub/new.txt", OpKind::Data(b"abc".to_vec())),
            Operation::new(
                "a.txt",
                OpKind::BlockRange {
                    block_index: 0,
                    block_span: 2,
                },
            ),
            Operation::new("a.txt", OpKind::Data(b"!".to_vec())),
        ];
        patch
    }

    #[test]
    fn test_default_patch_is_empty() {
        assert!(Patch::default().is_empty());
        assert!(!sample().is_empty());
    }

    #[test]
    fn test_content_groups_keep_order() {
        let patch = sample();
        let groups = patch.content_groups();
        assert_eq!(groups.len(), 2);
        let a = &groups["a.txt"];
        assert!(matches!(a[0], OpKind::BlockRange { .. }));
        assert_eq!(*a[1], OpKind::Data(b"!".to_vec()));
    }

    #[test]
    fn test_expected_paths() {
        let patch = sample();
        let expected: Vec<_> = patch.expected_paths().into_iter().collect();
        assert_eq!(expected, vec!["a.txt", "link", "sub", "sub/new.txt"]);
    }

    #[test]
    fn test_stats() {
        let stats = sample().stats();
        assert_eq!(stats.data_ops, 2);
        assert_eq!(stats.block_ranges, 1);
        assert_eq!(stats.literal_bytes, 4);
        assert_eq!(stats.reused_bytes, 8);
        assert_eq!(stats.files_modified, 1);
        assert_eq!(stats.extra_paths, 1);
    }

    #[test]
    fn test_operations_for() {
        let patch = sample();
        assert_eq!(patch.operations_for("a.txt").count(), 2);
        assert_eq!(patch.operations_for("missing").count(), 0);
    }
}
