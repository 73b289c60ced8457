use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::rolling_hash::RollingHash;

/// A verified match of old content inside the new stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    /// Byte offset in the new stream where the match starts.
    pub new_offset: usize,
    /// First old block of the run.
    pub old_block_index: usize,
    /// Length of the run of consecutive old blocks that match, a multiple of the block size.
    pub matched_len: usize,
}

/// Index of the full, non-overlapping blocks of an old file.
///
/// Buckets are keyed by rolling hash and hold block indices in ascending order.
/// Each distinct block content is indexed once, at its lowest index, so a bucket
/// never grows with repeats of the same bytes. A trailing partial block is not
/// indexed.
pub struct BlockLibrary<'a> {
    old: &'a [u8],
    block_size: usize,
    table: HashMap<u32, Vec<usize>>,
}

impl<'a> BlockLibrary<'a> {
    /// Index `old` in blocks of `block_size` bytes. A zero block size is rejected.
    pub fn new(old: &'a [u8], block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig("block size must be non-zero".into()));
        }
        let mut table: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut seen: HashSet<&[u8]> = HashSet::new();

        for (idx, block) in old.chunks_exact(block_size).enumerate() {
            if seen.insert(block) {
                table.entry(RollingHash::of(block)).or_default().push(idx);
            }
        }

        Ok(Self {
            old,
            block_size,
            table,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of indexed (full) blocks.
    pub fn num_blocks(&self) -> usize {
        self.old.len() / self.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks() == 0
    }

    fn block(&self, index: usize) -> &'a [u8] {
        let start = index * self.block_size;
        &self.old[start..start + self.block_size]
    }

    /// Lowest old block whose bytes equal `window`, given its rolling digest.
    fn lookup(&self, digest: u32, window: &[u8]) -> Option<usize> {
        self.table
            .get(&digest)?
            .iter()
            .copied()
            .find(|&idx| self.block(idx) == window)
    }

    /// Count the old blocks from `index` on that keep matching `new` from `new_offset`.
    fn run_length(&self, index: usize, new: &[u8], new_offset: usize) -> usize {
        let b = self.block_size;
        let mut span = 1;
        while index + span < self.num_blocks() {
            let start = new_offset + span * b;
            match new.get(start..start + b) {
                Some(window) if window == self.block(index + span) => span += 1,
                _ => break,
            }
        }
        span
    }

    /// First verified match at or after `start_offset` in `new`.
    ///
    /// The rolling hash only nominates candidates; a candidate is accepted
    /// after its bytes compare equal to the old block.
    pub fn find_match(&self, new: &[u8], start_offset: usize) -> Option<BlockMatch> {
        let b = self.block_size;
        if self.is_empty() || start_offset.checked_add(b)? > new.len() {
            return None;
        }

        let mut rolling = RollingHash::new();
        rolling.init(&new[start_offset..start_offset + b]);
        let mut pos = start_offset;

        loop {
            if let Some(index) = self.lookup(rolling.digest(), &new[pos..pos + b]) {
                let span = self.run_length(index, new, pos);
                return Some(BlockMatch {
                    new_offset: pos,
                    old_block_index: index,
                    matched_len: span * b,
                });
            }
            if pos + b >= new.len() {
                return None;
            }
            rolling.rotate(new[pos], new[pos + b]);
            pos += 1;
        }
    }
}

/// Free-function form of [`BlockLibrary::find_match`].
pub fn find_match(library: &BlockLibrary<'_>, new: &[u8], start_offset: usize) -> Option<BlockMatch> {
    library.find_match(new, start_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: usize = 8;

    #[test]
    fn test_aligned_match_at_start() {
        let old = b"AAAAAAAABBBBBBBBCCCCCCCC";
        let lib = BlockLibrary::new(old, B).unwrap();
        let m = lib.find_match(old, 0).unwrap();
        assert_eq!(
            m,
            BlockMatch {
                new_offset: 0,
                old_block_index: 0,
                matched_len: 24
            }
        );
    }

    #[test]
    fn test_unaligned_match() {
        let old = b"AAAAAAAABBBBBBBB";
        let new = b"xyzBBBBBBBBq";
        let lib = BlockLibrary::new(old, B).unwrap();
        let m = lib.find_match(new, 0).unwrap();
        assert_eq!(m.new_offset, 3);
        assert_eq!(m.old_block_index, 1);
        assert_eq!(m.matched_len, B);
    }

    #[test]
    fn test_respects_start_offset() {
        let old = b"AAAAAAAA";
        let new = b"AAAAAAAA--AAAAAAAA";
        let lib = BlockLibrary::new(old, B).unwrap();
        assert_eq!(lib.find_match(new, 1).unwrap().new_offset, 10);
    }

    #[test]
    fn test_duplicate_blocks_lowest_index_wins() {
        let old = b"ZZZZZZZZQQQQQQQQQQQQQQQQ";
        let new = b"QQQQQQQQ";
        let lib = BlockLibrary::new(old, B).unwrap();
        let m = lib.find_match(new, 0).unwrap();
        assert_eq!(m.old_block_index, 1);
        assert_eq!(m.matched_len, B);
    }

    #[test]
    fn test_run_stops_at_divergence() {
        let old = b"AAAAAAAABBBBBBBBCCCCCCCC";
        let new = b"AAAAAAAABBBBBBBBXXXXXXXX";
        let lib = BlockLibrary::new(old, B).unwrap();
        let m = lib.find_match(new, 0).unwrap();
        assert_eq!(m.matched_len, 2 * B);
    }

    #[test]
    fn test_partial_trailing_block_not_indexed() {
        let old = b"AAAAAAAAtail";
        let lib = BlockLibrary::new(old, B).unwrap();
        assert_eq!(lib.num_blocks(), 1);
        assert!(lib.find_match(b"tailtail", 0).is_none());
    }

    #[test]
    fn test_no_match_in_short_or_foreign_stream() {
        let lib = BlockLibrary::new(b"AAAAAAAA", B).unwrap();
        assert!(lib.find_match(b"AAAA", 0).is_none());
        assert!(lib.find_match(b"BBBBBBBBBBBBBBBB", 0).is_none());
        assert!(lib.find_match(b"AAAAAAAA", usize::MAX).is_none());
    }

    #[test]
    fn test_rolling_collision_is_not_a_match() {
        // Plant old block 0 in the impostor's bucket.
        let old = b"AAAAAAAA";
        let mut lib = BlockLibrary::new(old, B).unwrap();
        let impostor = b"BBBBBBBB";
        let digest = RollingHash::of(impostor);
        lib.table.entry(digest).or_default().push(0);
        assert!(lib.find_match(impostor, 0).is_none());
    }

    #[test]
    fn test_empty_library() {
        let lib = BlockLibrary::new(b"", B).unwrap();
        assert!(lib.is_empty());
        assert!(find_match(&lib, b"anything at all", 0).is_none());
    }

    #[test]
    fn test_repeated_blocks_share_one_entry() {
        let old = b"ABABABAB".repeat(64 * 1024);
        let lib = BlockLibrary::new(&old, B).unwrap();
        assert_eq!(lib.num_blocks(), 64 * 1024);
        assert_eq!(lib.table.values().map(Vec::len).sum::<usize>(), 1);

        // Same digest as the old block, different bytes: every window is a collision.
        let impostor = [66u8, 64, 66, 66, 65, 66, 65, 66];
        assert_eq!(RollingHash::of(&impostor), RollingHash::of(b"ABABABAB"));
        let new = impostor.repeat(8 * 1024);
        assert!(lib.find_match(&new, 0).is_none());

        let m = lib.find_match(b"--ABABABABABABABAB", 0).unwrap();
        assert_eq!(m.old_block_index, 0);
        assert_eq!(m.matched_len, 2 * B);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(matches!(BlockLibrary::new(b"AAAAAAAA", 0), Err(Error::InvalidConfig(_))));
    }
}
