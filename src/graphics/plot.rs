//! A single cached plot and its backing files.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static PLOT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque storage id, unique within and across processes sharing a plots
/// directory.
pub fn next_storage_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let counter = PLOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{millis}-{}-{counter}", process::id())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plot {
    pub id: String,
    pub width: f64,
    pub height: f64,
    /// True once the image file reflects the current display list.
    pub rendered: bool,
}

impl Plot {
    pub fn new(width: f64, height: f64) -> Plot {
        Plot {
            id: next_storage_id(),
            width,
            height,
            rendered: false,
        }
    }

    pub fn with_id(id: impl Into<String>, width: f64, height: f64) -> Plot {
        Plot {
            id: id.into(),
            width,
            height,
            rendered: false,
        }
    }

    pub fn snapshot_file(&self, plots_dir: &Path) -> PathBuf {
        plots_dir.join(format!("{}.snapshot", self.id))
    }

    pub fn image_file(&self, plots_dir: &Path) -> PathBuf {
        plots_dir.join(format!("{}.png", self.id))
    }

    pub fn manipulator_file(&self, plots_dir: &Path) -> PathBuf {
        plots_dir.join(format!("{}.manip", self.id))
    }

    /// At least one backing file survives on disk. Used on restore to drop
    /// entries whose files were lost to an interrupted save.
    pub fn has_backing_files(&self, plots_dir: &Path) -> bool {
        self.snapshot_file(plots_dir).exists() || self.image_file(plots_dir).exists()
    }

    /// Delete backing files. Failures are logged, never propagated; the
    /// in-memory removal this supports proceeds regardless.
    pub fn remove_files(&self, plots_dir: &Path) {
        for file in [
            self.snapshot_file(plots_dir),
            self.image_file(plots_dir),
            self.manipulator_file(plots_dir),
        ] {
            if file.exists()
                && let Err(err) = fs::remove_file(&file)
            {
                crate::event_log::log(
                    "plot_file_remove_error",
                    serde_json::json!({
                        "file": file.display().to_string(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn storage_ids_are_unique() {
        let a = next_storage_id();
        let b = next_storage_id();
        assert_ne!(a, b);
    }

    #[test]
    fn remove_files_tolerates_missing_files() {
        let dir = TempDir::new().expect("tempdir");
        let plot = Plot::new(640.0, 480.0);
        plot.remove_files(dir.path());

        fs::write(plot.image_file(dir.path()), b"png").expect("write image");
        assert!(plot.has_backing_files(dir.path()));
        plot.remove_files(dir.path());
        assert!(!plot.has_backing_files(dir.path()));
    }
}
