//! Volume reader/writer seam and atomic file writes
//!
//! `VolumeIo` is the collaborator that reads scans and writes label maps.
//! `BincodeVolumeIo` stores both as bincode-encoded `ndarray` volumes.

use crate::plan::ExportParams;
use anyhow::{anyhow, Context};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// One modality of one case, in `[z, y, x]` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanVolume {
    pub spacing: [f64; 3],
    pub data: Array3<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelMap {
    pub spacing: [f64; 3],
    pub labels: Array3<u8>,
}

impl LabelMap {
    pub fn shape(&self) -> [usize; 3] {
        let s = self.labels.shape();
        [s[0], s[1], s[2]]
    }
}

pub trait VolumeIo: Send + Sync {
    fn read_scan(&self, path: &Path) -> anyhow::Result<ScanVolume>;

    /// Must be atomic: a partially written label map never appears at `path`.
    fn write_labels(
        &self,
        path: &Path,
        labels: &LabelMap,
        params: &ExportParams,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeVolumeIo;

impl BincodeVolumeIo {
    pub fn write_scan(&self, path: &Path, scan: &ScanVolume) -> anyhow::Result<()> {
        write_atomic_with(path, |writer| {
            bincode::serialize_into(writer, scan).map_err(|e| anyhow!(e))
        })
    }

    pub fn read_labels(&self, path: &Path) -> anyhow::Result<LabelMap> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("decoding label map {}", path.display()))
    }
}

impl VolumeIo for BincodeVolumeIo {
    fn read_scan(&self, path: &Path) -> anyhow::Result<ScanVolume> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("decoding scan {}", path.display()))
    }

    fn write_labels(
        &self,
        path: &Path,
        labels: &LabelMap,
        params: &ExportParams,
    ) -> anyhow::Result<()> {
        // Labels arrive on the original grid; interpolation settings are informational here.
        debug!(
            path = %path.display(),
            interpolation_order = params.interpolation_order,
            interpolation_order_z = params.interpolation_order_z,
            force_separate_z = ?params.force_separate_z,
            "Writing label map"
        );
        write_atomic_with(path, |writer| {
            bincode::serialize_into(writer, labels).map_err(|e| anyhow!(e))
        })
    }
}

/// Write `path` through a hidden temporary sibling, fsync, then rename.
///
/// Parent directories are created as needed. The temporary file is removed
/// if any step fails.
pub fn write_atomic_with<F>(path: &Path, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> anyhow::Result<()>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
        .to_string_lossy();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result: anyhow::Result<()> = (|| {
        let file = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("case_0000.vol");
        let scan = ScanVolume {
            spacing: [1.0, 0.5, 0.5],
            data: Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 100 + y * 10 + x) as f32),
        };

        BincodeVolumeIo.write_scan(&path, &scan).unwrap();
        assert_eq!(BincodeVolumeIo.read_scan(&path).unwrap(), scan);
    }

    #[test]
    fn test_failed_write_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("case.vol");

        let result = write_atomic_with(&path, |writer| {
            writer.write_all(b"partial")?;
            Err(anyhow!("encoder failed"))
        });

        assert!(result.is_err());
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("case.vol");
        fs::write(&path, b"old").unwrap();

        write_atomic_with(&path, |writer| Ok(writer.write_all(b"new")?)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }
}
