use crate::block_matcher::BlockLibrary;
use crate::error::{Error, Result};
use crate::patch::OpKind;

/// Compute the steps that rebuild `new` from `old`.
///
/// Scans `new` left to right. Regions found in the old block library become
/// `BlockRange` steps, the bytes between them become `Data` steps. An empty
/// result means the file is unchanged. A zero `block_size` is `InvalidConfig`.
pub fn diff_bytes(old: &[u8], new: &[u8], block_size: usize) -> Result<Vec<OpKind>> {
    if block_size == 0 {
        return Err(Error::InvalidConfig("block size must be non-zero".into()));
    }
    if old == new {
        return Ok(vec![]);
    }
    if new.is_empty() {
        return Ok(vec![OpKind::Data(Vec::new())]);
    }

    let library = BlockLibrary::new(old, block_size)?;
    if library.is_empty() {
        return Ok(vec![OpKind::Data(new.to_vec())]);
    }

    let mut ops = Vec::new();
    let mut cursor = 0;

    while cursor < new.len() {
        let Some(m) = library.find_match(new, cursor) else {
            ops.push(OpKind::Data(new[cursor..].to_vec()));
            break;
        };

        if m.new_offset > cursor {
            ops.push(OpKind::Data(new[cursor..m.new_offset].to_vec()));
        }
        ops.push(OpKind::BlockRange {
            block_index: m.old_block_index as u64,
            block_span: (m.matched_len / block_size) as u64,
        });
        cursor = m.new_offset + m.matched_len;
    }

    Ok(ops)
}

/// Reconstruct a file from its old bytes and its steps. Empty steps leave it unchanged.
///
/// Returns `None` when a `BlockRange` reaches past the end of `old`.
pub fn rebuild(old: &[u8], ops: &[OpKind], block_size: usize) -> Option<Vec<u8>> {
    if ops.is_empty() {
        return Some(old.to_vec());
    }

    let mut result = Vec::new();
    for op in ops {
        match op {
            OpKind::Data(data) => result.extend_from_slice(data),
            OpKind::BlockRange {
                block_index,
                block_span,
            } => result.extend_from_slice(block_slice(old, *block_index, *block_span, block_size)?),
            OpKind::Symlink { .. } | OpKind::Delete | OpKind::Mkdir => return None,
        }
    }
    Some(result)
}

/// The bytes a `BlockRange` refers to, or `None` if `old` is too short.
pub fn block_slice(old: &[u8], block_index: u64, block_span: u64, block_size: usize) -> Option<&[u8]> {
    let b = block_size as u64;
    let start = usize::try_from(block_index.checked_mul(b)?).ok()?;
    let len = usize::try_from(block_span.checked_mul(b)?).ok()?;
    old.get(start..start.checked_add(len)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const B: usize = 8;

    fn pattern(len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(len as u64);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn check(old: &[u8], new: &[u8]) -> Vec<OpKind> {
        let ops = diff_bytes(old, new, B).unwrap();
        assert_eq!(rebuild(old, &ops, B).unwrap(), new);
        ops
    }

    fn literal_bytes(ops: &[OpKind]) -> usize {
        ops.iter()
            .map(|op| match op {
                OpKind::Data(d) => d.len(),
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn test_identical_data() {
        let data = pattern(B * 3);
        assert!(check(&data, &data).is_empty());
    }

    #[test]
    fn test_completely_different() {
        let old = vec![0u8; B * 2];
        let new = vec![1u8; B * 2];
        assert_eq!(check(&old, &new), vec![OpKind::Data(new.clone())]);
    }

    #[test]
    fn test_append_reuses_all_blocks() {
        let k = 5;
        let old = pattern(k * B);
        let mut new = old.clone();
        new.extend_from_slice(b"appended!");
        assert_eq!(
            check(&old, &new),
            vec![
                OpKind::BlockRange {
                    block_index: 0,
                    block_span: k as u64
                },
                OpKind::Data(b"appended!".to_vec()),
            ]
        );
    }

    #[test]
    fn test_prepend_one_byte_detects_shift() {
        let old = pattern(B * 16);
        let mut new = vec![0xEE];
        new.extend_from_slice(&old);
        assert_eq!(
            check(&old, &new),
            vec![
                OpKind::Data(vec![0xEE]),
                OpKind::BlockRange {
                    block_index: 0,
                    block_span: 16
                },
            ]
        );
    }

    #[test]
    fn test_insertion_in_middle() {
        let old = pattern(B * 8);
        let mut new = old.clone();
        new.splice(B * 3 + 2..B * 3 + 2, vec![0xAA; 5]);
        let ops = check(&old, &new);
        // Only the block split by the insertion and the insert itself go literal.
        assert!(literal_bytes(&ops) <= B + 5 + B, "ops: {ops:?}");
    }

    #[test]
    fn test_prefix_changed() {
        let old = pattern(B * 4);
        let mut new = old.clone();
        for b in new[..B].iter_mut() {
            *b = 0xFF;
        }
        let ops = check(&old, &new);
        assert_eq!(
            ops,
            vec![
                OpKind::Data(vec![0xFF; B]),
                OpKind::BlockRange {
                    block_index: 1,
                    block_span: 3
                },
            ]
        );
    }

    #[test]
    fn test_empty_old() {
        let new = vec![1u8; 100];
        assert_eq!(check(&[], &new), vec![OpKind::Data(new.clone())]);
    }

    #[test]
    fn test_empty_new() {
        let old = vec![1u8; 100];
        assert_eq!(check(&old, &[]), vec![OpKind::Data(vec![])]);
    }

    #[test]
    fn test_small_files() {
        check(b"Hello, World!", b"Hello, Rust!");
    }

    #[test]
    fn test_truncated_file_reuses_prefix() {
        let old = pattern(B * 6 + 3);
        let new = old[..B * 4].to_vec();
        assert_eq!(
            check(&old, &new),
            vec![OpKind::BlockRange {
                block_index: 0,
                block_span: 4
            }]
        );
    }

    #[test]
    fn test_block_slice_out_of_range() {
        let old = pattern(B * 2);
        assert!(block_slice(&old, 1, 2, B).is_none());
        assert!(block_slice(&old, u64::MAX, 1, B).is_none());
        assert_eq!(block_slice(&old, 1, 1, B).unwrap(), &old[B..2 * B]);
    }

    #[test]
    fn test_zero_block_size_is_an_error() {
        assert!(matches!(diff_bytes(b"same", b"same", 0), Err(Error::InvalidConfig(_))));
    }
}
