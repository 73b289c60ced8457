//! Patch file format.
//!
//! An 8-byte magic, a little-endian `u32` format version, then a stream of
//! bincode records: one `Header` (the patch without its operations), any
//! number of `Operation`s, and a closing `End`. Operations are written and
//! read one at a time, so large `Data` payloads never need to be held
//! together in memory by the codec itself.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::patch::{Operation, Patch};

pub const MAGIC: &[u8; 8] = b"DPATCH01";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
enum RecordRef<'a> {
    Header(&'a Patch),
    Operation(&'a Operation),
    End,
}

#[derive(Deserialize)]
enum Record {
    Header(Patch),
    Operation(Operation),
    End,
}

/// Appends a patch to a byte sink record by record.
pub struct PatchWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> PatchWriter<W> {
    /// Write the file header and the patch metadata. `header.operations` is ignored.
    pub fn new(mut inner: W, header: &Patch) -> Result<Self> {
        inner
            .write_all(MAGIC)
            .and_then(|()| inner.write_all(&FORMAT_VERSION.to_le_bytes()))
            .map_err(Error::Stream)?;
        bincode::serialize_into(&mut inner, &RecordRef::Header(header))?;
        Ok(Self { inner, written: 0 })
    }

    pub fn push(&mut self, op: &Operation) -> Result<()> {
        bincode::serialize_into(&mut self.inner, &RecordRef::Operation(op))?;
        self.written += 1;
        Ok(())
    }

    pub fn operations_written(&self) -> u64 {
        self.written
    }

    /// Close the record stream and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        bincode::serialize_into(&mut self.inner, &RecordRef::End)?;
        self.inner.flush().map_err(Error::Stream)?;
        Ok(self.inner)
    }
}

/// Reads a patch stream; iterating yields its operations in order.
pub struct PatchReader<R: Read> {
    inner: R,
    header: Patch,
    done: bool,
}

impl<R: Read> PatchReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        inner
            .read_exact(&mut magic)
            .map_err(|_| Error::InvalidPatch("missing magic header".into()))?;
        if &magic != MAGIC {
            return Err(Error::InvalidPatch("missing magic header".into()));
        }

        let mut version = [0u8; 4];
        inner
            .read_exact(&mut version)
            .map_err(|_| Error::InvalidPatch("truncated version field".into()))?;
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(Error::InvalidPatch(format!(
                "unsupported patch version: {version} (expected {FORMAT_VERSION})"
            )));
        }

        match bincode::deserialize_from(&mut inner)? {
            Record::Header(header) => Ok(Self {
                inner,
                header,
                done: false,
            }),
            _ => Err(Error::InvalidPatch("first record is not a header".into())),
        }
    }

    /// Patch metadata; its `operations` are empty.
    pub fn header(&self) -> &Patch {
        &self.header
    }

    /// Drain the remaining operations into a complete patch.
    pub fn into_patch(mut self) -> Result<Patch> {
        let mut operations = Vec::new();
        for op in self.by_ref() {
            operations.push(op?);
        }
        let mut patch = self.header;
        patch.operations = operations;
        Ok(patch)
    }
}

impl<R: Read> Iterator for PatchReader<R> {
    type Item = Result<Operation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match bincode::deserialize_from(&mut self.inner) {
            Ok(Record::Operation(op)) => Some(Ok(op)),
            Ok(Record::End) => {
                self.done = true;
                None
            }
            Ok(Record::Header(_)) => {
                self.done = true;
                Some(Err(Error::InvalidPatch("duplicate header record".into())))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }
}

/// Write `patch` to `out` in the patch file format.
pub fn encode<W: Write>(patch: &Patch, out: W) -> Result<W> {
    let mut writer = PatchWriter::new(out, patch)?;
    for op in &patch.operations {
        writer.push(op)?;
    }
    writer.finish()
}

/// Read a complete patch from `input`.
pub fn decode<R: Read>(input: R) -> Result<Patch> {
    PatchReader::new(input)?.into_patch()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{FileDigest, OpKind};

    fn sample() -> Patch {
        let mut patch = Patch {
            block_size: 8,
            ..Patch::default()
        };
        patch.old_dirs.insert("lib".into());
        patch.new_dirs.insert("bin".into());
        patch.deleted_paths.insert("lib".into());
        patch.extra_paths.insert("bin".into());
        patch.new_files.insert("readme".into(), FileDigest::of(b"hello, world"));
        patch.new_links.insert("current".into());
        patch.unsupported.insert("fifo".into());
        patch.operations = vec![
            Operation::new("lib", OpKind::Delete),
            Operation::new("bin", OpKind::Mkdir),
            Operation::new(
                "current",
                OpKind::Symlink {
                    link_target: "bin".into(),
                },
            ),
            Operation::new(
                "readme",
                OpKind::BlockRange {
                    block_index: 0,
                    block_span: 1,
                },
            ),
            Operation::new("readme", OpKind::Data(b"orld".to_vec())),
        ];
        patch
    }

    #[test]
    fn test_round_trip() {
        let patch = sample();
        let bytes = encode(&patch, Vec::new()).unwrap();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(decode(bytes.as_slice()).unwrap(), patch);
    }

    #[test]
    fn test_streaming_writer_and_reader() {
        let patch = sample();
        let mut writer = PatchWriter::new(Vec::new(), &patch).unwrap();
        for op in &patch.operations {
            writer.push(op).unwrap();
        }
        assert_eq!(writer.operations_written(), 5);
        let bytes = writer.finish().unwrap();

        let reader = PatchReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.header().block_size, 8);
        assert!(reader.header().operations.is_empty());
        let ops: Vec<_> = reader.map(Result::unwrap).collect();
        assert_eq!(ops, patch.operations);
    }

    #[test]
    fn test_bad_magic() {
        let err = decode(&b"NOTAPATCH-------"[..]).unwrap_err();
        assert!(matches!(err, Error::InvalidPatch(_)));
    }

    #[test]
    fn test_wrong_version() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        let err = decode(bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("unsupported patch version: 99"));
    }

    #[test]
    fn test_truncated_stream_fails() {
        let bytes = encode(&sample(), Vec::new()).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(decode(cut).is_err());
    }

    /// Accepts `capacity` bytes, then fails every write; flushing always fails.
    struct BrokenSink {
        capacity: usize,
    }

    impl Write for BrokenSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.capacity == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink closed"));
            }
            let n = buf.len().min(self.capacity);
            self.capacity -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink closed"))
        }
    }

    #[test]
    fn test_sink_failures_are_stream_errors() {
        let patch = sample();
        let err = PatchWriter::new(BrokenSink { capacity: 4 }, &patch).err().unwrap();
        assert!(matches!(err, Error::Stream(_)), "{err:?}");

        let writer = PatchWriter::new(BrokenSink { capacity: usize::MAX }, &patch).unwrap();
        let err = writer.finish().err().unwrap();
        assert!(matches!(err, Error::Stream(_)), "{err:?}");
    }
}
