//! Log segment implementation
//!
//! A segment holds a contiguous run of offsets starting at `base_offset`.
//! Entries are kept in memory as length-prefixed, CRC-checked frames and,
//! when the partition has a directory, mirrored to a segment file with the
//! same framing:
//!
//! ```text
//! [len: u32 LE][crc32: u32 LE][payload: len bytes]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use rollup_common::error::{Error, Result, StorageError};
use rollup_common::types::Offset;

pub(crate) const FRAME_HEADER: usize = 8;

/// A segment of the partition log
pub struct Segment {
    /// Base offset of this segment
    base_offset: Offset,
    /// Start position of each entry in `data`; entry `i` has offset `base_offset + i`
    positions: Vec<usize>,
    /// Framed entries
    data: Vec<u8>,
    /// Backing file, if the log is durable
    file: Option<SegmentFile>,
    /// Set when a failed append could not be rolled back; the file no
    /// longer matches `data` and must not be appended to
    poisoned: bool,
}

struct SegmentFile {
    path: PathBuf,
    handle: Box<dyn FrameSink>,
    fsync: bool,
}

/// Writes an append needs from the backing file
trait FrameSink: Send + Sync {
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;

    fn sync(&mut self) -> std::io::Result<()>;

    /// Cut the file back to `len` bytes and continue writing there
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
}

impl FrameSink for File {
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.write_all(frame)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }

    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::End(0)).map(|_| ())
    }
}

impl Segment {
    /// Create an in-memory segment
    pub fn new(base_offset: Offset) -> Self {
        Self {
            base_offset,
            positions: Vec::new(),
            data: Vec::new(),
            file: None,
            poisoned: false,
        }
    }

    /// Create a segment backed by a new file in `dir`
    pub fn create(dir: &Path, base_offset: Offset, fsync: bool) -> Result<Self> {
        let path = segment_path(dir, base_offset);
        debug!("Creating segment file {:?}", path);

        let handle = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            file: Some(SegmentFile {
                path,
                handle: Box::new(handle),
                fsync,
            }),
            ..Self::new(base_offset)
        })
    }

    /// Load a segment file, dropping a torn or corrupt tail
    pub fn open(path: &Path, base_offset: Offset, fsync: bool) -> Result<Self> {
        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;

        let mut segment = Self::new(base_offset);
        let mut pos = 0;
        while pos + FRAME_HEADER <= raw.len() {
            let len = u32::from_le_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]])
                as usize;
            let crc = u32::from_le_bytes([raw[pos + 4], raw[pos + 5], raw[pos + 6], raw[pos + 7]]);
            let end = pos + FRAME_HEADER + len;
            if end > raw.len() || crc32fast::hash(&raw[pos + FRAME_HEADER..end]) != crc {
                break;
            }
            segment.positions.push(pos);
            pos = end;
        }

        if pos < raw.len() {
            warn!(
                "Truncating {} trailing bytes of segment {:?}",
                raw.len() - pos,
                path
            );
        }
        raw.truncate(pos);

        let mut handle = OpenOptions::new().write(true).open(path)?;
        handle.set_len(pos as u64)?;
        // Appends continue after the last valid frame
        handle.seek(SeekFrom::End(0))?;

        segment.data = raw;
        segment.file = Some(SegmentFile {
            path: path.to_path_buf(),
            handle: Box::new(handle),
            fsync,
        });
        Ok(segment)
    }

    /// Append the next entry, returning the framed size in bytes.
    ///
    /// The file write (and fsync) happens before the entry becomes visible.
    /// A failed write is cut off the file again so the next frame starts
    /// right after the last acknowledged one.
    pub fn append(&mut self, payload: &[u8]) -> Result<usize> {
        if self.poisoned {
            return Err(Error::Storage(StorageError::WriteFailed(format!(
                "segment {} is unusable after a failed rollback",
                self.base_offset
            ))));
        }

        let len = u32::try_from(payload.len()).map_err(|_| {
            Error::Storage(StorageError::WriteFailed("entry larger than 4GiB".to_string()))
        })?;
        let crc = crc32fast::hash(payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(payload);

        if let Some(file) = self.file.as_mut() {
            let written = file.handle.write_frame(&frame).and_then(|()| {
                if file.fsync {
                    file.handle.sync()
                } else {
                    Ok(())
                }
            });

            if let Err(e) = written {
                if let Err(rollback) = file.handle.truncate_to(self.data.len() as u64) {
                    warn!(
                        "Failed to roll back segment {:?} after write error: {}",
                        file.path, rollback
                    );
                    self.poisoned = true;
                }
                return Err(e.into());
            }
        }

        self.positions.push(self.data.len());
        self.data.extend_from_slice(&frame);
        Ok(frame.len())
    }

    /// Payload stored at `offset`, if it belongs to this segment
    pub fn read(&self, offset: Offset) -> Option<&[u8]> {
        let index = usize::try_from(offset - self.base_offset).ok()?;
        let position = *self.positions.get(index)?;
        let len = u32::from_le_bytes([
            self.data[position],
            self.data[position + 1],
            self.data[position + 2],
            self.data[position + 3],
        ]) as usize;
        let start = position + FRAME_HEADER;
        Some(&self.data[start..start + len])
    }

    /// Delete the backing file
    pub fn remove_file(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            drop(file.handle);
            std::fs::remove_file(&file.path)?;
        }
        Ok(())
    }

    /// Get segment size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Get base offset
    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    /// Offset the next append will receive
    pub fn next_offset(&self) -> Offset {
        self.base_offset + self.positions.len() as Offset
    }

    /// Get highest offset in segment
    pub fn highest_offset(&self) -> Option<Offset> {
        if self.positions.is_empty() {
            None
        } else {
            Some(self.next_offset() - 1)
        }
    }
}

/// File name of the segment starting at `base_offset`
pub fn segment_path(dir: &Path, base_offset: Offset) -> PathBuf {
    dir.join(format!("{:020}.seg", base_offset))
}

/// Base offset encoded in a segment file name
pub fn parse_segment_name(name: &str) -> Option<Offset> {
    name.strip_suffix(".seg")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let mut segment = Segment::new(10);
        segment.append(b"first").unwrap();
        segment.append(b"second").unwrap();

        assert_eq!(segment.read(10), Some(&b"first"[..]));
        assert_eq!(segment.read(11), Some(&b"second"[..]));
        assert_eq!(segment.read(12), None);
        assert_eq!(segment.read(9), None);
        assert_eq!(segment.highest_offset(), Some(11));
        assert_eq!(segment.size(), 2 * FRAME_HEADER + 11);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut segment = Segment::create(dir.path(), 0, false).unwrap();
            segment.append(b"one").unwrap();
            segment.append(b"two").unwrap();
        }

        // Simulate a crash in the middle of a third write
        let path = segment_path(dir.path(), 0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let mut segment = Segment::open(&path, 0, false).unwrap();
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.read(1), Some(&b"two"[..]));

        segment.append(b"three").unwrap();
        drop(segment);

        let segment = Segment::open(&path, 0, false).unwrap();
        assert_eq!(segment.len(), 3);
        assert_eq!(segment.read(2), Some(&b"three"[..]));
    }

    /// In-memory file that can fail its next write, sync or truncate
    #[derive(Clone, Default)]
    struct FlakyFile {
        bytes: std::sync::Arc<parking_lot::Mutex<Vec<u8>>>,
        fail_write: std::sync::Arc<std::sync::atomic::AtomicBool>,
        fail_sync: std::sync::Arc<std::sync::atomic::AtomicBool>,
        fail_truncate: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    fn io_error(msg: &str) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, msg.to_string())
    }

    impl FrameSink for FlakyFile {
        fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            use std::sync::atomic::Ordering;
            if self.fail_write.swap(false, Ordering::SeqCst) {
                // Part of the frame reaches the disk
                self.bytes.lock().extend_from_slice(&frame[..3]);
                return Err(io_error("disk full"));
            }
            self.bytes.lock().extend_from_slice(frame);
            Ok(())
        }

        fn sync(&mut self) -> std::io::Result<()> {
            if self.fail_sync.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(io_error("sync failed"));
            }
            Ok(())
        }

        fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
            if self.fail_truncate.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(io_error("read-only filesystem"));
            }
            self.bytes.lock().truncate(len as usize);
            Ok(())
        }
    }

    fn flaky_segment(file: &FlakyFile) -> Segment {
        Segment {
            file: Some(SegmentFile {
                path: PathBuf::from("flaky.seg"),
                handle: Box::new(file.clone()),
                fsync: true,
            }),
            ..Segment::new(0)
        }
    }

    #[test]
    fn test_failed_writes_leave_no_frame_behind() {
        use std::sync::atomic::Ordering;
        let file = FlakyFile::default();
        let mut segment = flaky_segment(&file);
        segment.append(b"one").unwrap();

        file.fail_write.store(true, Ordering::SeqCst);
        assert!(segment.append(b"torn").is_err());
        file.fail_sync.store(true, Ordering::SeqCst);
        assert!(segment.append(b"unsynced").is_err());

        segment.append(b"two").unwrap();
        assert_eq!(segment.len(), 2);
        assert_eq!(*file.bytes.lock(), segment.data);

        // Every acknowledged entry survives a reopen at its original offset
        let dir = tempfile::tempdir().unwrap();
        let path = segment_path(dir.path(), 0);
        std::fs::write(&path, &*file.bytes.lock()).unwrap();
        let reopened = Segment::open(&path, 0, false).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.read(1), Some(&b"two"[..]));
    }

    #[test]
    fn test_segment_refuses_appends_after_failed_rollback() {
        use std::sync::atomic::Ordering;
        let file = FlakyFile::default();
        let mut segment = flaky_segment(&file);
        segment.append(b"one").unwrap();

        file.fail_truncate.store(true, Ordering::SeqCst);
        file.fail_write.store(true, Ordering::SeqCst);
        assert!(segment.append(b"torn").is_err());

        file.fail_truncate.store(false, Ordering::SeqCst);
        assert!(segment.append(b"two").is_err());
        assert_eq!(segment.len(), 1);
        assert_eq!(segment.read(0), Some(&b"one"[..]));
    }

    #[test]
    fn test_segment_name_roundtrip() {
        let path = segment_path(Path::new("/tmp"), 42);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_segment_name(name), Some(42));
        assert_eq!(parse_segment_name("garbage"), None);
    }
}
