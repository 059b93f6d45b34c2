//! Bounded plot cache with FIFO eviction and a persisted index.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::graphics::plot::Plot;

/// Upper bound on cached plots. Inserting past this evicts the oldest entry
/// and removes its backing files.
pub const MAX_PLOTS: usize = 100;

/// Re-derive the active index after removing `removed` from a buffer that
/// now has `new_len` entries. Pure so the invariant is testable without any
/// filesystem: the result is either `None` or a valid index, and it never
/// points at the removed slot's successor by accident.
pub fn repair_active_index(
    removed: usize,
    active: Option<usize>,
    new_len: usize,
) -> Option<usize> {
    let active = active?;
    if removed == active {
        // prefer the next plot, else the previous, else nothing
        if removed < new_len {
            Some(removed)
        } else if new_len > 0 {
            Some(new_len - 1)
        } else {
            None
        }
    } else if removed < active {
        Some(active - 1)
    } else {
        Some(active)
    }
}

pub struct PlotManager {
    plots_dir: PathBuf,
    plots: VecDeque<Plot>,
    active: Option<usize>,
    /// Set when the visible display no longer matches the active plot's
    /// rendered files.
    display_dirty: bool,
}

impl PlotManager {
    pub fn new(plots_dir: PathBuf) -> io::Result<PlotManager> {
        fs::create_dir_all(&plots_dir)?;
        Ok(PlotManager {
            plots_dir,
            plots: VecDeque::new(),
            active: None,
            display_dirty: false,
        })
    }

    pub fn plots_dir(&self) -> &Path {
        &self.plots_dir
    }

    pub fn len(&self) -> usize {
        self.plots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plots.is_empty()
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_plot(&self) -> Option<&Plot> {
        self.active.and_then(|i| self.plots.get(i))
    }

    pub fn plot(&self, index: usize) -> Option<&Plot> {
        self.plots.get(index)
    }

    pub fn ids(&self) -> Vec<String> {
        self.plots.iter().map(|p| p.id.clone()).collect()
    }

    pub fn display_dirty(&self) -> bool {
        self.display_dirty
    }

    pub fn clear_display_dirty(&mut self) {
        self.display_dirty = false;
    }

    /// New-page event from the device. If the active plot has unrendered
    /// changes, snapshot it from the previous-page capture first; a missing
    /// capture is logged, not fatal. Evicts the oldest plot when full. The
    /// new plot becomes active.
    pub fn on_device_new_page(
        &mut self,
        width: f64,
        height: f64,
        previous_capture: Option<&Path>,
    ) {
        self.snapshot_active_from_capture(previous_capture);

        if self.plots.len() >= MAX_PLOTS
            && let Some(evicted) = self.plots.pop_front()
        {
            evicted.remove_files(&self.plots_dir);
            self.active = self.active.and_then(|a| a.checked_sub(1));
        }

        self.plots.push_back(Plot::new(width, height));
        self.active = Some(self.plots.len() - 1);
        self.display_dirty = true;
    }

    /// Capture the active plot's snapshot from a device capture file if it
    /// still has unrendered changes. A missing capture is logged, not fatal.
    pub fn snapshot_active_from_capture(&mut self, capture: Option<&Path>) {
        let Some(plot) = self.active.and_then(|i| self.plots.get_mut(i)) else {
            return;
        };
        if plot.rendered {
            return;
        }
        match capture {
            Some(capture) if capture.exists() => {
                let snapshot = plot.snapshot_file(&self.plots_dir);
                match fs::copy(capture, &snapshot) {
                    Ok(_) => plot.rendered = true,
                    Err(err) => crate::event_log::log(
                        "plot_snapshot_error",
                        serde_json::json!({
                            "plot": plot.id,
                            "error": err.to_string(),
                        }),
                    ),
                }
            }
            _ => crate::event_log::log(
                "plot_snapshot_missing_capture",
                serde_json::json!({ "plot": plot.id }),
            ),
        }
    }

    /// Remove a plot by index. Backing-file deletion failures are logged
    /// inside `remove_files` and never block the in-memory removal.
    pub fn remove_plot(&mut self, index: usize) -> Result<(), String> {
        if index >= self.plots.len() {
            return Err(format!(
                "plot index {index} out of range ({} plots)",
                self.plots.len()
            ));
        }
        let plot = self
            .plots
            .remove(index)
            .ok_or_else(|| "plot index vanished".to_string())?;
        plot.remove_files(&self.plots_dir);
        self.active = repair_active_index(index, self.active, self.plots.len());
        self.display_dirty = true;
        Ok(())
    }

    /// Switch the active plot. A no-op when already active; otherwise the
    /// previously-active plot's in-memory resources are dropped (its files
    /// stay) and the display is marked dirty for re-render.
    pub fn set_active_plot(&mut self, index: usize) -> Result<(), String> {
        if index >= self.plots.len() {
            return Err(format!(
                "plot index {index} out of range ({} plots)",
                self.plots.len()
            ));
        }
        if self.active == Some(index) {
            return Ok(());
        }
        if let Some(previous) = self.active.and_then(|i| self.plots.get_mut(i)) {
            previous.rendered = false;
        }
        self.active = Some(index);
        self.display_dirty = true;
        Ok(())
    }

    /// Record that the active plot's image file is current.
    pub fn mark_active_rendered(&mut self) {
        if let Some(plot) = self.active.and_then(|i| self.plots.get_mut(i)) {
            plot.rendered = true;
        }
    }

    /// Mark the active plot as having unrendered display-list changes.
    pub fn invalidate_active(&mut self) {
        if let Some(plot) = self.active.and_then(|i| self.plots.get_mut(i)) {
            plot.rendered = false;
        }
        self.display_dirty = true;
    }

    /// Persist the index: first line is the active plot's id, then one
    /// `id:width,height` line per plot in order.
    pub fn save_state(&self, index_file: &Path) -> Result<(), String> {
        let mut out = String::new();
        if let Some(active) = self.active_plot() {
            out.push_str(&active.id);
        }
        out.push('\n');
        for plot in &self.plots {
            out.push_str(&format!("{}:{},{}\n", plot.id, plot.width, plot.height));
        }
        fs::write(index_file, out)
            .map_err(|e| format!("error writing plots index {}: {e}", index_file.display()))
    }

    /// Rebuild the buffer from a saved index. Only plots whose backing files
    /// still exist are reinstated; an unknown or out-of-range active id
    /// falls back to the last plot. A missing index file is an empty cache,
    /// not an error.
    pub fn restore_state(&mut self, index_file: &Path) -> Result<(), String> {
        self.plots.clear();
        self.active = None;

        let contents = match fs::read_to_string(index_file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(format!(
                    "error reading plots index {}: {err}",
                    index_file.display()
                ));
            }
        };

        let mut lines = contents.lines();
        let active_id = lines.next().unwrap_or("").to_string();
        for line in lines {
            let Some((id, dims)) = line.split_once(':') else {
                continue;
            };
            let Some((width, height)) = dims.split_once(',') else {
                continue;
            };
            let (Ok(width), Ok(height)) = (width.parse::<f64>(), height.parse::<f64>()) else {
                continue;
            };
            let mut plot = Plot::with_id(id, width, height);
            if plot.has_backing_files(&self.plots_dir) {
                plot.rendered = true;
                self.plots.push_back(plot);
            }
        }

        if !self.plots.is_empty() {
            let found = self.plots.iter().position(|p| p.id == active_id);
            self.active = Some(found.unwrap_or(self.plots.len() - 1));
        }
        Ok(())
    }

    /// Drop everything, including backing files. Used when the display is
    /// cleared ahead of a minimal checkpoint.
    pub fn clear(&mut self) {
        for plot in &self.plots {
            plot.remove_files(&self.plots_dir);
        }
        self.plots.clear();
        self.active = None;
        self.display_dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> PlotManager {
        PlotManager::new(dir.path().join("plots")).expect("create manager")
    }

    #[test]
    fn repair_prefers_next_then_previous_then_none() {
        // removed the active plot
        assert_eq!(repair_active_index(1, Some(1), 3), Some(1));
        assert_eq!(repair_active_index(2, Some(2), 2), Some(1));
        assert_eq!(repair_active_index(0, Some(0), 0), None);
        // removed before the active plot shifts it down
        assert_eq!(repair_active_index(0, Some(2), 3), Some(1));
        // removed after the active plot leaves it alone
        assert_eq!(repair_active_index(2, Some(1), 3), Some(1));
        assert_eq!(repair_active_index(0, None, 0), None);
    }

    #[test]
    fn buffer_never_exceeds_cap_and_evicts_fifo() {
        let dir = TempDir::new().expect("tempdir");
        let mut mgr = manager(&dir);
        for _ in 0..(MAX_PLOTS + 5) {
            mgr.on_device_new_page(640.0, 480.0, None);
        }
        assert_eq!(mgr.len(), MAX_PLOTS);
        assert_eq!(mgr.active_index(), Some(MAX_PLOTS - 1));
    }

    #[test]
    fn eviction_removes_backing_files_of_oldest() {
        let dir = TempDir::new().expect("tempdir");
        let mut mgr = manager(&dir);
        for _ in 0..MAX_PLOTS {
            mgr.on_device_new_page(640.0, 480.0, None);
        }
        let oldest = mgr.plot(0).expect("oldest plot").clone();
        let image = oldest.image_file(mgr.plots_dir());
        fs::write(&image, b"png").expect("write image");

        mgr.on_device_new_page(640.0, 480.0, None);
        assert!(!image.exists());
        assert!(!mgr.ids().contains(&oldest.id));
    }

    #[test]
    fn remove_plot_repairs_active_index() {
        let dir = TempDir::new().expect("tempdir");
        let mut mgr = manager(&dir);
        for _ in 0..3 {
            mgr.on_device_new_page(640.0, 480.0, None);
        }
        assert_eq!(mgr.active_index(), Some(2));

        mgr.remove_plot(0).expect("remove first");
        assert_eq!(mgr.active_index(), Some(1));
        mgr.remove_plot(1).expect("remove active");
        assert_eq!(mgr.active_index(), Some(0));
        mgr.remove_plot(0).expect("remove last");
        assert_eq!(mgr.active_index(), None);
        assert!(mgr.remove_plot(0).is_err());
    }

    #[test]
    fn new_page_snapshots_pending_active_plot_from_capture() {
        let dir = TempDir::new().expect("tempdir");
        let mut mgr = manager(&dir);
        mgr.on_device_new_page(640.0, 480.0, None);

        let capture = dir.path().join("capture.png");
        fs::write(&capture, b"captured").expect("write capture");
        mgr.on_device_new_page(640.0, 480.0, Some(&capture));

        let first = mgr.plot(0).expect("first plot");
        let snapshot = first.snapshot_file(mgr.plots_dir());
        assert!(first.rendered);
        assert_eq!(fs::read(snapshot).expect("read snapshot"), b"captured");
    }

    #[test]
    fn state_round_trips_and_skips_lost_files() {
        let dir = TempDir::new().expect("tempdir");
        let mut mgr = manager(&dir);
        for _ in 0..3 {
            mgr.on_device_new_page(640.0, 480.0, None);
        }
        mgr.set_active_plot(1).expect("set active");
        // back the first two plots with files; the third is "lost"
        for i in 0..2 {
            let plot = mgr.plot(i).expect("plot").clone();
            fs::write(plot.image_file(mgr.plots_dir()), b"png").expect("write image");
        }
        let index_file = dir.path().join("plots_index");
        mgr.save_state(&index_file).expect("save state");

        let mut restored = manager(&dir);
        restored.restore_state(&index_file).expect("restore state");
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.active_index(), Some(1));
    }

    #[test]
    fn restore_falls_back_to_last_when_active_id_unknown() {
        let dir = TempDir::new().expect("tempdir");
        let mut mgr = manager(&dir);
        mgr.on_device_new_page(640.0, 480.0, None);
        mgr.on_device_new_page(640.0, 480.0, None);
        for i in 0..2 {
            let plot = mgr.plot(i).expect("plot").clone();
            fs::write(plot.image_file(mgr.plots_dir()), b"png").expect("write image");
        }
        let index_file = dir.path().join("plots_index");
        let mut body = String::from("no-such-id\n");
        for plot in [mgr.plot(0).unwrap(), mgr.plot(1).unwrap()] {
            body.push_str(&format!("{}:{},{}\n", plot.id, plot.width, plot.height));
        }
        fs::write(&index_file, body).expect("write index");

        let mut restored = manager(&dir);
        restored.restore_state(&index_file).expect("restore state");
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.active_index(), Some(1));
    }

    #[test]
    fn restore_of_missing_index_is_empty_cache() {
        let dir = TempDir::new().expect("tempdir");
        let mut mgr = manager(&dir);
        mgr.restore_state(&dir.path().join("nope"))
            .expect("restore missing index");
        assert!(mgr.is_empty());
        assert_eq!(mgr.active_index(), None);
    }
}
