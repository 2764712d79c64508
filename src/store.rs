use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::header::Header;
use crate::params::{CameraParam, CameraSettings};
use crate::ring::*;

/// The whole mapped region: header followed by the frame ring.
#[repr(C)]
pub struct SharedMemory {
    pub header: Header,
    pub frames: [Frame; NUM_FRAMES],
}

pub const STORE_SIZE: usize = std::mem::size_of::<SharedMemory>();

/// Open `path` read-write, creating it if needed. Returns whether an
/// existing file of exactly the store size was found.
fn open_backing_file(path: &Path) -> Result<(File, bool)> {
    let existing = std::fs::metadata(path)
        .map(|meta| meta.len() == STORE_SIZE as u64)
        .unwrap_or(false);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| Error::store(path, e))?;
    if !existing {
        // truncating first guarantees the region is zero-filled
        file.set_len(0).map_err(|e| Error::store(path, e))?;
        file.set_len(STORE_SIZE as u64)
            .map_err(|e| Error::store(path, e))?;
    }
    Ok((file, existing))
}

fn map_mut(path: &Path, file: &File) -> Result<MmapMut> {
    // Safety: the file is sized to STORE_SIZE above. Other processes may
    // write the mapping concurrently, which the publication protocol allows for.
    unsafe {
        MmapOptions::new()
            .len(STORE_SIZE)
            .map_mut(file)
            .map_err(|e| Error::store(path, e))
    }
}

/// Producer handle on the shared tracking buffer.
///
/// This is the only handle that can hand out `&mut Frame` and advance the
/// frame counter. There must be at most one per backing file.
pub struct TrackingStore {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
}

impl TrackingStore {
    /// Map the store at `path`, creating and initialising it when absent or
    /// when the existing file is not a compatible store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, existing) = open_backing_file(path)?;
        let mut mmap = map_mut(path, &file)?;

        let reuse = existing && header_of(&mmap).is_initialized();
        if !reuse {
            mmap.fill(0);
        }
        let store = TrackingStore {
            path: path.to_path_buf(),
            _file: file,
            mmap,
        };
        if reuse {
            info!(
                "reusing tracking store {:?} at frame {}",
                path,
                store.frame_counter()
            );
        } else {
            store.header().install_defaults();
            info!("created tracking store {:?} ({} bytes)", path, STORE_SIZE);
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Direct access to the mapped structure. No field access is serialised.
    pub fn data(&self) -> &SharedMemory {
        // Safety: the mapping is page aligned and exactly STORE_SIZE bytes,
        // and every bit pattern is a valid SharedMemory.
        unsafe { &*(self.mmap.as_ptr() as *const SharedMemory) }
    }

    pub fn data_mut(&mut self) -> &mut SharedMemory {
        // Safety: as in `data`; `&mut self` makes this the only borrow in-process.
        unsafe { &mut *(self.mmap.as_mut_ptr() as *mut SharedMemory) }
    }

    pub fn header(&self) -> &Header {
        &self.data().header
    }

    pub fn frame_counter(&self) -> u64 {
        self.header().frame_counter()
    }

    /// Physical slot the next frame goes into. Does not advance anything.
    pub fn next_slot(&self) -> usize {
        slot_index(self.frame_counter())
    }

    /// The most recently published frame, if any, and the slot to write next.
    pub fn frame_pair(&mut self) -> (Option<&Frame>, &mut Frame) {
        let counter = self.frame_counter();
        let current = slot_index(counter);
        let frames = &mut self.data_mut().frames;
        if counter == 0 {
            return (None, &mut frames[current]);
        }
        let previous = slot_index(counter - 1);
        if previous < current {
            let (head, tail) = frames.split_at_mut(current);
            (Some(&head[previous]), &mut tail[0])
        } else {
            let (head, tail) = frames.split_at_mut(previous);
            (Some(&tail[0]), &mut head[current])
        }
    }

    /// Announce the slot returned by `next_slot`. Call only once every field
    /// of that slot is written.
    pub fn publish(&mut self) -> u64 {
        let counter = self.header().publish();
        debug!("published frame {}", counter - 1);
        counter
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| Error::store(&self.path, e))
    }
}

fn header_of(mmap: &MmapMut) -> &Header {
    // Safety: Header sits at offset 0 of a page aligned mapping.
    unsafe { &*(mmap.as_ptr() as *const Header) }
}

/// Handle for a settings front end: it may change tunables but never
/// touches frames or the frame counter.
pub struct SettingsStore {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
}

impl SettingsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|e| Error::store(path, e))?;
        if meta.len() != STORE_SIZE as u64 {
            return Err(Error::LayoutMismatch {
                path: path.to_path_buf(),
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::store(path, e))?;
        let mmap = map_mut(path, &file)?;
        if !header_of(&mmap).is_initialized() {
            return Err(Error::LayoutMismatch {
                path: path.to_path_buf(),
            });
        }
        Ok(SettingsStore {
            path: path.to_path_buf(),
            _file: file,
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        header_of(&self.mmap)
    }

    pub fn set_camera_param(&self, param: CameraParam, value: u8) {
        self.header()
            .set_camera_param(param, param.spec().clamp(value));
    }

    pub fn set_min_point_quality(&self, quality: f32) {
        self.header().set_min_point_quality(quality);
    }

    pub fn set_tracking_point_limit(&self, limit: u32) {
        self.header().set_tracking_point_limit(limit);
    }

    pub fn apply(&self, settings: &CameraSettings) {
        self.header().apply_settings(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Point;
    use crate::frame::Pixel;
    use tempfile::TempDir;

    #[test]
    fn test_store_size() {
        assert_eq!(
            STORE_SIZE,
            std::mem::size_of::<Header>() + NUM_FRAMES * std::mem::size_of::<Frame>()
        );
    }

    #[test]
    fn test_fresh_store_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tracking.buf");
        let store = TrackingStore::open(&path).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), STORE_SIZE as u64);
        assert_eq!(store.frame_counter(), 0);
        assert_eq!(store.next_slot(), 0);
        assert_eq!(store.header().min_point_quality(), 0.1);
        assert_eq!(store.header().camera_param(CameraParam::Gain), 20);
        assert!(store.data().frames.iter().all(|f| f.num_points == 0));
    }

    #[test]
    fn test_publish_advances_slot() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = TrackingStore::open(temp_dir.path().join("t.buf")).unwrap();

        for k in 0..(NUM_FRAMES as u64 + 3) {
            assert_eq!(store.next_slot(), slot_index(k));
            let (previous, current) = store.frame_pair();
            assert_eq!(previous.is_some(), k > 0);
            if let Some(previous) = previous {
                assert_eq!(previous.timestamp, (k - 1) as f64);
            }
            current.reset(k as f64);
            assert_eq!(store.publish(), k + 1);
        }
    }

    #[test]
    fn test_reopen_keeps_header_and_frames() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.buf");
        {
            let mut store = TrackingStore::open(&path).unwrap();
            let (_, current) = store.frame_pair();
            current.reset(3.0);
            current.pixels[0] = Pixel::gray(77);
            current.push_point(Point::new(4., 5.));
            store.publish();
            store.flush().unwrap();
        }
        let store = TrackingStore::open(&path).unwrap();
        assert_eq!(store.frame_counter(), 1);
        assert_eq!(store.data().frames[0].pixels[0], Pixel::gray(77));
        assert_eq!(store.data().frames[0].points()[0], Point::new(4., 5.));
    }

    #[test]
    fn test_foreign_file_is_reinitialised() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.buf");
        std::fs::write(&path, b"not a tracking store").unwrap();
        assert!(matches!(
            SettingsStore::open(&path),
            Err(Error::LayoutMismatch { .. })
        ));

        let store = TrackingStore::open(&path).unwrap();
        assert!(store.header().is_initialized());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), STORE_SIZE as u64);
    }

    #[test]
    fn test_unwritable_location_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing-dir").join("t.buf");
        assert!(matches!(
            TrackingStore::open(&path),
            Err(Error::StoreCreationFailed { .. })
        ));
    }

    #[test]
    fn test_settings_store_is_seen_by_producer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.buf");
        let store = TrackingStore::open(&path).unwrap();
        let settings = SettingsStore::open(&path).unwrap();

        settings.set_camera_param(CameraParam::Exposure, 33);
        settings.set_camera_param(CameraParam::FlipH, 9);
        settings.set_tracking_point_limit(64);

        assert_eq!(store.header().camera_param(CameraParam::Exposure), 33);
        assert_eq!(store.header().camera_param(CameraParam::FlipH), 1);
        assert_eq!(store.header().tracking_point_limit(), 64);
    }
}
