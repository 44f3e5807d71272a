use super::record::Record;
use crate::{Error, Result};
use core::ops::{Deref, DerefMut};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, MutexGuard};
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

/// Bytes per independently locked segment. A multiple of every common page
/// size so each segment can be its own mapping.
pub(crate) const SEGMENT_BYTES: usize = 1 << 22;
pub(crate) const RECORDS_PER_SEGMENT: usize = SEGMENT_BYTES / Record::SIZE;

enum Buffer {
    Mapped(MmapMut),
    Heap(Box<[u8]>),
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Heap(h) => h,
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Heap(h) => h,
        }
    }
}

/// One contiguous run of records guarded by a single lock.
pub(crate) struct Segment {
    buf: Buffer,
}

impl Segment {
    pub(crate) fn load(&self, slot: usize) -> Record {
        let at = slot * Record::SIZE;
        let mut bytes = [0; Record::SIZE];
        bytes.copy_from_slice(&self.buf[at..at + Record::SIZE]);
        Record::from_be_bytes(bytes)
    }

    pub(crate) fn store(&mut self, slot: usize, record: Record) {
        let at = slot * Record::SIZE;
        self.buf[at..at + Record::SIZE].copy_from_slice(&record.to_be_bytes());
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len() / Record::SIZE
    }

    fn flush(&self) -> io::Result<()> {
        match &self.buf {
            Buffer::Mapped(m) => m.flush(),
            Buffer::Heap(_) => Ok(()),
        }
    }
}

/// The record array, split into fixed-size segments.
///
/// A file-backed store maps each segment separately; an in-memory store
/// keeps each segment on the heap. Either way, writes to different segments
/// never contend.
pub(crate) struct Storage {
    segments: Vec<Mutex<Segment>>,
    len: usize,
    _file: Option<File>,
}

impl Storage {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let bytes = file.metadata()?.len();
        if bytes == 0 || bytes % Record::SIZE as u64 != 0 {
            return Err(Error::TruncatedLedger { len: bytes });
        }
        let total = usize::try_from(bytes).map_err(|_| Error::TruncatedLedger { len: bytes })?;

        let mut segments = Vec::with_capacity(total.div_ceil(SEGMENT_BYTES));
        let mut offset = 0;
        while offset < total {
            let len = SEGMENT_BYTES.min(total - offset);
            // SAFETY: the file is opened read-write and is expected to be
            // modified only through this mapping while the ledger is open.
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(offset as u64)
                    .len(len)
                    .map_mut(&file)?
            };
            segments.push(Mutex::new(Segment {
                buf: Buffer::Mapped(mmap),
            }));
            offset += len;
        }

        Ok(Self {
            segments,
            len: total / Record::SIZE,
            _file: Some(file),
        })
    }

    pub(crate) fn in_memory(records: impl IntoIterator<Item = Record>) -> Self {
        let mut segments = Vec::new();
        let mut current: Vec<u8> = Vec::with_capacity(SEGMENT_BYTES);
        let mut len = 0;
        for record in records {
            if current.len() == SEGMENT_BYTES {
                segments.push(heap_segment(core::mem::take(&mut current)));
            }
            current.extend_from_slice(&record.to_be_bytes());
            len += 1;
        }
        if !current.is_empty() {
            segments.push(heap_segment(current));
        }
        Self {
            segments,
            len,
            _file: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Splits a record index into (segment, slot).
    pub(crate) const fn locate(index: usize) -> (usize, usize) {
        (index / RECORDS_PER_SEGMENT, index % RECORDS_PER_SEGMENT)
    }

    pub(crate) fn segment(&self, segment: usize) -> MutexGuard<'_, Segment> {
        self.segments[segment].lock()
    }

    pub(crate) fn load(&self, index: usize) -> Option<Record> {
        if index >= self.len {
            return None;
        }
        let (segment, slot) = Self::locate(index);
        Some(self.segment(segment).load(slot))
    }

    pub(crate) fn flush(&self) -> io::Result<()> {
        for segment in &self.segments {
            segment.lock().flush()?;
        }
        Ok(())
    }
}

fn heap_segment(bytes: Vec<u8>) -> Mutex<Segment> {
    Mutex::new(Segment {
        buf: Buffer::Heap(bytes.into_boxed_slice()),
    })
}
