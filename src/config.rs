use crate::error::{Error, Result};

/// Block size used when nothing else is configured.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// Tuning shared by the differ and the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bytes per comparison unit. Every `BlockRange` in a patch is expressed in these.
    pub block_size: usize,
    /// Worker threads for per-file work. Bounds how many files are open at once.
    pub jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            jobs: std::thread::available_parallelism().map_or(1, usize::from),
        }
    }
}

impl Config {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block size must be at least 1".into()));
        }
        if self.jobs == 0 {
            return Err(Error::InvalidConfig("jobs must be at least 1".into()));
        }
        Ok(())
    }

    /// Build the bounded rayon pool that per-file work runs on.
    pub(crate) fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|i| format!("dirpatch-{i}"))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build worker pool: {e}")))
    }
}
