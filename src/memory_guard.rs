//! Scratch spilling for volumes too large to hand to a worker by value.

use crate::error::{Result, SegmentationError};
use crate::metrics::VOLUMES_SPILLED;
use crate::volume::write_atomic_with;
use anyhow::{anyhow, Context};
use ndarray::Array4;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const BYTES_PER_VOXEL: usize = 4;
/// Payload size that is still cheap to move between workers.
pub const TRANSFER_LIMIT_BYTES: f64 = 2e9;
pub const SAFETY_MARGIN: f64 = 0.85;

/// Element count above which volumes are spilled: `0.85 * 2e9 / 4`.
pub fn default_cutoff_voxels() -> usize {
    (TRANSFER_LIMIT_BYTES / BYTES_PER_VOXEL as f64 * SAFETY_MARGIN) as usize
}

/// A scratch file owned by exactly one handle. Dropping it unconsumed
/// deletes the file.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the volume back and delete the file.
    fn consume(mut self) -> Result<Array4<f32>> {
        let path = std::mem::take(&mut self.path);
        let volume = read_spill(&path);
        let removed = fs::remove_file(&path);
        let volume = volume?;
        removed.map_err(|e| SegmentationError::io(&path, e))?;
        debug!(path = %path.display(), "Consumed scratch spill");
        Ok(volume)
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed unconsumed scratch spill"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove scratch spill: {}", e),
        }
    }
}

/// A volume either held in memory or persisted to a scratch file.
#[derive(Debug)]
pub enum ArrayHandle {
    Inline(Array4<f32>),
    Spilled(SpillFile),
}

/// Handle carried by an export task.
pub type ExportHandle = ArrayHandle;

impl ArrayHandle {
    /// Take the volume, reading back and deleting a spilled file.
    pub fn resolve(self) -> Result<Array4<f32>> {
        match self {
            ArrayHandle::Inline(volume) => Ok(volume),
            ArrayHandle::Spilled(file) => file.consume(),
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, ArrayHandle::Spilled(_))
    }

    pub fn spill_path(&self) -> Option<&Path> {
        match self {
            ArrayHandle::Inline(_) => None,
            ArrayHandle::Spilled(file) => Some(file.path()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryGuard {
    cutoff_voxels: usize,
}

impl Default for MemoryGuard {
    fn default() -> Self {
        Self::new(default_cutoff_voxels())
    }
}

impl MemoryGuard {
    pub fn new(cutoff_voxels: usize) -> Self {
        Self { cutoff_voxels }
    }

    pub fn cutoff_voxels(&self) -> usize {
        self.cutoff_voxels
    }

    pub fn exceeds(&self, shape: &[usize]) -> bool {
        shape.iter().product::<usize>() > self.cutoff_voxels
    }

    /// Keep `volume` inline, or spill it to `spill_path` when it is over the cutoff.
    pub fn guard(&self, volume: Array4<f32>, spill_path: PathBuf) -> Result<ArrayHandle> {
        if !self.exceeds(volume.shape()) {
            return Ok(ArrayHandle::Inline(volume));
        }

        info!(
            path = %spill_path.display(),
            voxels = volume.len(),
            "Volume too large to hand over in memory, spilling to disk"
        );
        write_spill(&spill_path, &volume)?;
        VOLUMES_SPILLED.inc();
        Ok(ArrayHandle::Spilled(SpillFile::new(spill_path)))
    }
}

pub fn write_spill(path: &Path, volume: &Array4<f32>) -> Result<()> {
    write_atomic_with(path, |writer| {
        bincode::serialize_into(writer, volume).map_err(|e| anyhow!(e))
    })
    .map_err(|source| SegmentationError::Spill {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_spill(path: &Path) -> Result<Array4<f32>> {
    let read = || -> anyhow::Result<Array4<f32>> {
        let file = File::open(path).context("opening spill")?;
        bincode::deserialize_from(BufReader::new(file)).context("decoding spill")
    };
    read().map_err(|source| SegmentationError::Spill {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn volume(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_fn(shape, |(c, z, y, x)| (c + 2 * z + 3 * y + 5 * x) as f32 * 0.25)
    }

    #[test]
    fn test_default_cutoff() {
        assert_eq!(default_cutoff_voxels(), 425_000_000);
    }

    #[test]
    fn test_volume_at_cutoff_stays_inline() {
        let dir = TempDir::new().unwrap();
        let spill = dir.path().join("case.spill");
        // 2 * 3 * 4 * 5 = 120 elements
        let guard = MemoryGuard::new(120);

        let handle = guard.guard(volume((2, 3, 4, 5)), spill.clone()).unwrap();
        assert!(!handle.is_spilled());
        assert!(!spill.exists());

        let guard = MemoryGuard::new(121);
        let handle = guard.guard(volume((2, 3, 4, 5)), spill.clone()).unwrap();
        assert!(!handle.is_spilled());
    }

    #[test]
    fn test_volume_above_cutoff_spills() {
        let dir = TempDir::new().unwrap();
        let spill = dir.path().join("case.spill");
        let guard = MemoryGuard::new(119);
        let original = volume((2, 3, 4, 5));

        let handle = guard.guard(original.clone(), spill.clone()).unwrap();
        assert!(handle.is_spilled());
        assert_eq!(handle.spill_path(), Some(spill.as_path()));
        assert!(spill.exists());
        assert_eq!(read_spill(&spill).unwrap(), original);

        // Resolving consumes the scratch file
        assert_eq!(handle.resolve().unwrap(), original);
        assert!(!spill.exists());
    }

    #[test]
    fn test_resolve_missing_spill_fails() {
        let dir = TempDir::new().unwrap();
        let handle = ArrayHandle::Spilled(SpillFile::new(dir.path().join("gone.spill")));
        assert!(matches!(
            handle.resolve(),
            Err(SegmentationError::Spill { .. })
        ));
    }

    #[test]
    fn test_dropping_unconsumed_spill_removes_file() {
        let dir = TempDir::new().unwrap();
        let spill = dir.path().join("case.spill");
        let handle = MemoryGuard::new(0).guard(volume((1, 2, 2, 2)), spill.clone()).unwrap();
        assert!(spill.exists());

        drop(handle);
        assert!(!spill.exists());
    }

    #[test]
    fn test_corrupt_spill_is_removed_on_resolve() {
        let dir = TempDir::new().unwrap();
        let spill = dir.path().join("case.spill");
        fs::write(&spill, b"not bincode").unwrap();

        let handle = ArrayHandle::Spilled(SpillFile::new(spill.clone()));
        assert!(matches!(handle.resolve(), Err(SegmentationError::Spill { .. })));
        assert!(!spill.exists());
    }
}
