use std::io;
use std::path::{Path, PathBuf};

/// Result type for diff, apply and codec operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by [`crate::apply`].
pub type ApplyError = Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A root is missing, or an entry vanished while it was being read.
    #[error("path not found: {}", .path.display())]
    PathNotFound { path: PathBuf },

    /// Device nodes, FIFOs, sockets and the like. Recorded and skipped by scans.
    #[error("unsupported entry kind: {}", .path.display())]
    UnsupportedEntryKind { path: PathBuf },

    /// The old tree does not hold the content the patch was computed against.
    #[error("source mismatch for {path}: {reason}")]
    SourceMismatch { path: String, reason: String },

    /// The staged tree differs from the path set the patch promises.
    #[error(
        "incomplete patch: {} missing, {} unexpected (first: {})",
        .missing.len(),
        .unexpected.len(),
        first_path(.missing, .unexpected)
    )]
    IncompletePatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("I/O failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The byte sink or source of a patch stream failed.
    #[error("I/O failure on patch stream: {0}")]
    Stream(#[source] io::Error),

    #[error("non-UTF-8 path: {}", .path.display())]
    NonUtf8Path { path: PathBuf },

    /// A patch path that is absolute or climbs out of its root.
    #[error("invalid relative path in patch: {path}")]
    InvalidPath { path: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("patch was built with block size {patch}, applier is configured for {config}")]
    BlockSizeMismatch { patch: usize, config: usize },

    #[error("invalid patch stream: {0}")]
    InvalidPatch(String),

    #[error("patch encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("operation cancelled")]
    Cancelled,
}

fn first_path<'a>(missing: &'a [String], unexpected: &'a [String]) -> &'a str {
    missing
        .first()
        .or(unexpected.first())
        .map_or("-", String::as_str)
}

impl Error {
    /// Wrap an I/O error for `path`, promoting `NotFound` to [`Error::PathNotFound`].
    pub fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Error::PathNotFound {
                path: path.to_path_buf(),
            }
        } else {
            Error::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn source_mismatch(path: &str, reason: impl Into<String>) -> Self {
        Error::SourceMismatch {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_path_not_found() {
        let err = Error::io(
            Path::new("gone.txt"),
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert!(matches!(err, Error::PathNotFound { .. }));
    }

    #[test]
    fn test_other_io_kinds_are_wrapped() {
        let err = Error::io(
            Path::new("locked.txt"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, Error::Io { .. }));
        assert!(err.to_string().contains("locked.txt"));
    }

    #[test]
    fn test_incomplete_patch_message_names_first_path() {
        let err = Error::IncompletePatch {
            missing: vec!["a/b.txt".into()],
            unexpected: vec![],
        };
        assert_eq!(
            err.to_string(),
            "incomplete patch: 1 missing, 0 unexpected (first: a/b.txt)"
        );
    }
}
