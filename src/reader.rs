use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

use memmap2::{Mmap, MmapOptions};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::header::Header;
use crate::ring::*;
use crate::store::{SharedMemory, STORE_SIZE};

/// Read-only view of a tracking store, for renderers and other consumers.
pub struct StoreReader {
    path: PathBuf,
    _file: File,
    mmap: Mmap,
}

impl StoreReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::store(path, e))?;
        let len = file.metadata().map_err(|e| Error::store(path, e))?.len();
        if len != STORE_SIZE as u64 {
            return Err(Error::LayoutMismatch {
                path: path.to_path_buf(),
            });
        }
        // Safety: size checked above; the producer keeps writing through its
        // own mapping, which readers only observe through the counter protocol.
        let mmap = unsafe {
            MmapOptions::new()
                .len(STORE_SIZE)
                .map(&file)
                .map_err(|e| Error::store(path, e))?
        };
        let reader = StoreReader {
            path: path.to_path_buf(),
            _file: file,
            mmap,
        };
        if !reader.header().is_initialized() {
            return Err(Error::LayoutMismatch {
                path: path.to_path_buf(),
            });
        }
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> &SharedMemory {
        // Safety: page aligned, exactly STORE_SIZE bytes, any bit pattern valid.
        unsafe { &*(self.mmap.as_ptr() as *const SharedMemory) }
    }

    pub fn header(&self) -> &Header {
        &self.data().header
    }

    /// Load the frame counter once and derive slot validity from it.
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot::new(self.data())
    }
}

/// Slots as seen by one load of the frame counter.
pub struct Snapshot<'a> {
    memory: &'a SharedMemory,
    counter: u64,
}

impl<'a> Snapshot<'a> {
    pub fn new(memory: &'a SharedMemory) -> Self {
        let counter = memory.header.frame_counter();
        Snapshot { memory, counter }
    }

    pub fn frame_counter(&self) -> u64 {
        self.counter
    }

    /// Borrow published frame `sequence` in place.
    pub fn frame(&self, sequence: u64) -> std::result::Result<&'a Frame, SlotState> {
        match slot_state(sequence, self.counter) {
            SlotState::Readable(index) => Ok(&self.memory.frames[index]),
            other => Err(other),
        }
    }

    pub fn latest(&self) -> Option<(u64, &'a Frame)> {
        let sequence = self.counter.checked_sub(1)?;
        self.frame(sequence).ok().map(|frame| (sequence, frame))
    }

    /// Sequences that can be read under this snapshot, oldest first.
    pub fn readable(&self) -> Range<u64> {
        oldest_readable(self.counter)..self.counter
    }

    /// The last up to `NUM_FRAMES - 1` published frames, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = (u64, &'a Frame)> + '_ {
        self.readable()
            .filter_map(move |sequence| self.frame(sequence).ok().map(|f| (sequence, f)))
    }

    /// Copy frame `sequence` into `out`, then check that the producer did not
    /// reach the slot while the copy was in progress.
    pub fn copy_frame(&self, sequence: u64, out: &mut Frame) -> std::result::Result<(), SlotState> {
        let frame = self.frame(sequence)?;
        *out = *frame;
        fence(Ordering::Acquire);
        match slot_state(sequence, self.memory.header.frame_counter()) {
            SlotState::Readable(_) => Ok(()),
            other => Err(other),
        }
    }
}

/// What a reader should do after polling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Poll {
    /// Nothing new since the last poll.
    Idle,
    /// These sequences are newly published and readable.
    Fresh(Range<u64>),
    /// The reader fell a full ring behind; `skipped` frames were lost and
    /// reading resumes with `resume`.
    Overrun { skipped: u64, resume: Range<u64> },
}

/// A reader's position in the frame sequence.
#[derive(Clone, Debug, Default)]
pub struct FrameCursor {
    next: u64,
}

impl FrameCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after a frame that was seen earlier.
    pub fn after(last_seen: u64) -> Self {
        FrameCursor {
            next: last_seen + 1,
        }
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.next.checked_sub(1)
    }

    /// Start with the next frame to be published, skipping history.
    pub fn from_now(snapshot: &Snapshot<'_>) -> Self {
        FrameCursor {
            next: snapshot.frame_counter(),
        }
    }

    pub fn poll(&mut self, snapshot: &Snapshot<'_>) -> Poll {
        let counter = snapshot.frame_counter();
        if counter <= self.next {
            return Poll::Idle;
        }
        let start = self.next;
        self.next = counter;
        let oldest = oldest_readable(counter);
        if start < oldest {
            Poll::Overrun {
                skipped: oldest - start,
                resume: oldest..counter,
            }
        } else {
            Poll::Fresh(start..counter)
        }
    }
}
