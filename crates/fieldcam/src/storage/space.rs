//! Free-space sampling.

use std::fmt;
use std::io;
use std::path::Path;

use serde::Serialize;

/// One reading of a volume's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceSample {
    /// Bytes available to this process.
    pub free_bytes: u64,
    /// Total size of the volume.
    pub total_bytes: u64,
}

impl SpaceSample {
    /// Used share of the volume, 0-100.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        let used = self.total_bytes.saturating_sub(self.free_bytes);
        used as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Reads free space for a path. Always re-samples; never caches.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// Sample the volume holding `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be queried.
    fn sample(&self, path: &Path) -> io::Result<SpaceSample>;
}

/// Queries the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn sample(&self, path: &Path) -> io::Result<SpaceSample> {
        Ok(SpaceSample {
            free_bytes: fs2::available_space(path)?,
            total_bytes: fs2::total_space(path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_percentage() {
        let sample = SpaceSample {
            free_bytes: 25,
            total_bytes: 100,
        };
        assert!((sample.used_percentage() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_used_percentage_empty_volume() {
        let sample = SpaceSample {
            free_bytes: 0,
            total_bytes: 0,
        };
        assert!((sample.used_percentage() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_fs_probe_reads_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sample = FsSpaceProbe.sample(dir.path()).unwrap();
        assert!(sample.total_bytes > 0);
        assert!(sample.free_bytes <= sample.total_bytes);
    }
}
