//! Shadow device: an off-screen bitmap that mirrors the interactive
//! display's draw calls.
//!
//! The interactive device has no stable pixel buffer of its own, so plot
//! snapshots are produced by replaying the recorded display list onto a
//! hidden bitmap surface and flushing that surface to disk. The surface is
//! created lazily on first draw and recreated after every snapshot or
//! resize.

use std::fs;
use std::path::{Path, PathBuf};

use crate::graphics::dev_desc::GraphicsContext;

/// One recorded drawing primitive. The list of these is the replay source
/// for snapshots and resizes.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    NewPage {
        gc: GraphicsContext,
    },
    Clip {
        x0: f64,
        x1: f64,
        y0: f64,
        y1: f64,
    },
    Circle {
        x: f64,
        y: f64,
        r: f64,
        gc: GraphicsContext,
    },
    Line {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        gc: GraphicsContext,
    },
    Rect {
        x0: f64,
        y0: f64,
        x1: f64,
        y1: f64,
        gc: GraphicsContext,
    },
    Polygon {
        points: Vec<(f64, f64)>,
        gc: GraphicsContext,
    },
    Polyline {
        points: Vec<(f64, f64)>,
        gc: GraphicsContext,
    },
    Path {
        points: Vec<(f64, f64)>,
        subpaths: Vec<usize>,
        winding: bool,
        gc: GraphicsContext,
    },
    Text {
        x: f64,
        y: f64,
        value: String,
        rot: f64,
        gc: GraphicsContext,
    },
    Raster {
        pixels: Vec<u32>,
        w: u32,
        h: u32,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
}

/// A live bitmap render target. `complete` consumes the surface, flushing
/// its pixels to the file it was created with.
pub trait BitmapSurface {
    fn draw(&mut self, op: &DrawOp) -> Result<(), String>;
    fn complete(self: Box<Self>) -> Result<PathBuf, String>;
}

/// Factory for bitmap surfaces. Creation failure is fatal to the device
/// being constructed.
pub trait BitmapBackend {
    fn create_surface(
        &mut self,
        file: &Path,
        width: f64,
        height: f64,
        pixel_ratio: f64,
    ) -> Result<Box<dyn BitmapSurface>, String>;
}

pub struct ShadowDevice {
    backend: Box<dyn BitmapBackend>,
    surface: Option<Box<dyn BitmapSurface>>,
    scratch_file: PathBuf,
    width: f64,
    height: f64,
    pixel_ratio: f64,
    display_list: Vec<DrawOp>,
    /// Index into `display_list` of the first op not yet drawn onto the
    /// current surface.
    synced: usize,
    /// While true, event callbacks driven by draw replay must be swallowed
    /// so a snapshot or resize cannot re-enter the engine.
    events_suppressed: bool,
}

impl ShadowDevice {
    /// Creating the device does not allocate a surface; that happens on the
    /// first draw. The scratch file is where the backing bitmap flushes.
    pub fn new(
        backend: Box<dyn BitmapBackend>,
        scratch_file: PathBuf,
        width: f64,
        height: f64,
        pixel_ratio: f64,
    ) -> ShadowDevice {
        ShadowDevice {
            backend,
            surface: None,
            scratch_file,
            width,
            height,
            pixel_ratio,
            display_list: Vec::new(),
            synced: 0,
            events_suppressed: false,
        }
    }

    pub fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    pub fn pixel_ratio(&self) -> f64 {
        self.pixel_ratio
    }

    pub fn events_suppressed(&self) -> bool {
        self.events_suppressed
    }

    pub fn display_list_len(&self) -> usize {
        self.display_list.len()
    }

    /// Whether there are recorded ops not yet flushed to a snapshot since
    /// the last new page.
    pub fn has_pending_changes(&self) -> bool {
        !self.display_list.is_empty()
    }

    fn ensure_surface(&mut self) -> Result<(), String> {
        if self.surface.is_none() {
            let surface = self.backend.create_surface(
                &self.scratch_file,
                self.width,
                self.height,
                self.pixel_ratio,
            )?;
            self.surface = Some(surface);
            self.synced = 0;
        }
        Ok(())
    }

    /// Record a primitive and mirror it onto the surface. Draw failures are
    /// logged and swallowed; allocation failures propagate.
    pub fn record(&mut self, op: DrawOp) -> Result<(), String> {
        if matches!(op, DrawOp::NewPage { .. }) {
            self.display_list.clear();
            self.synced = 0;
            self.surface = None;
        }
        self.display_list.push(op);
        self.ensure_surface()?;
        self.sync();
        Ok(())
    }

    /// Draw any not-yet-mirrored ops onto the current surface.
    fn sync(&mut self) {
        if let Some(surface) = self.surface.as_mut() {
            for op in &self.display_list[self.synced..] {
                if let Err(err) = surface.draw(op) {
                    crate::event_log::log(
                        "graphics_draw_error",
                        serde_json::json!({ "error": err }),
                    );
                }
            }
            self.synced = self.display_list.len();
        }
    }

    /// Flush the current page to `target` as a finished bitmap file, then
    /// reallocate a fresh surface so subsequent drawing has somewhere to go.
    pub fn write_to_png(&mut self, target: &Path) -> Result<(), String> {
        self.events_suppressed = true;
        let result = self.write_to_png_inner(target);
        self.events_suppressed = false;
        result
    }

    fn write_to_png_inner(&mut self, target: &Path) -> Result<(), String> {
        self.ensure_surface()?;
        self.sync();
        let surface = match self.surface.take() {
            Some(surface) => surface,
            None => return Err("no bitmap surface allocated".to_string()),
        };
        let produced = surface.complete()?;
        move_file(&produced, target)?;
        // fresh surface for whatever draws next
        let surface = self.backend.create_surface(
            &self.scratch_file,
            self.width,
            self.height,
            self.pixel_ratio,
        )?;
        self.surface = Some(surface);
        self.synced = 0;
        self.sync();
        Ok(())
    }

    /// Destroy the surface and re-render the entire display list at the new
    /// geometry. There is no incremental resize: correctness requires a full
    /// replay, with event callbacks suppressed for its duration.
    pub fn resize(&mut self, width: f64, height: f64, pixel_ratio: f64) -> Result<(), String> {
        self.events_suppressed = true;
        self.width = width;
        self.height = height;
        self.pixel_ratio = pixel_ratio;
        self.surface = None;
        self.synced = 0;
        let result = self.ensure_surface();
        if result.is_ok() {
            self.sync();
        }
        self.events_suppressed = false;
        result
    }

    /// Drop all recorded state without flushing anything.
    pub fn clear(&mut self) {
        self.display_list.clear();
        self.synced = 0;
        self.surface = None;
    }
}

/// Rename, falling back to copy-and-remove for cross-device targets.
fn move_file(from: &Path, to: &Path) -> Result<(), String> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .map_err(|e| format!("error copying {} to {}: {e}", from.display(), to.display()))?;
    if let Err(err) = fs::remove_file(from) {
        crate::event_log::log(
            "graphics_scratch_cleanup_error",
            serde_json::json!({ "file": from.display().to_string(), "error": err.to_string() }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingBackend, SharedOps};
    use tempfile::TempDir;

    fn simple_op() -> DrawOp {
        DrawOp::Line {
            x1: 0.0,
            y1: 0.0,
            x2: 1.0,
            y2: 1.0,
            gc: GraphicsContext::default(),
        }
    }

    #[test]
    fn surface_is_created_lazily_on_first_draw() {
        let dir = TempDir::new().expect("tempdir");
        let (backend, ops) = RecordingBackend::new();
        let mut shadow = ShadowDevice::new(
            Box::new(backend),
            dir.path().join("scratch.png"),
            640.0,
            480.0,
            1.0,
        );
        assert_eq!(ops.surfaces_created(), 0);
        shadow.record(simple_op()).expect("record");
        assert_eq!(ops.surfaces_created(), 1);
        shadow.record(simple_op()).expect("record");
        assert_eq!(ops.surfaces_created(), 1);
    }

    #[test]
    fn write_to_png_flushes_moves_and_reallocates() {
        let dir = TempDir::new().expect("tempdir");
        let (backend, ops) = RecordingBackend::new();
        let mut shadow = ShadowDevice::new(
            Box::new(backend),
            dir.path().join("scratch.png"),
            640.0,
            480.0,
            1.0,
        );
        shadow.record(simple_op()).expect("record");

        let target = dir.path().join("plot.png");
        shadow.write_to_png(&target).expect("write png");
        assert!(target.exists());
        assert!(!dir.path().join("scratch.png").exists());
        // a fresh surface replaces the completed one
        assert_eq!(ops.surfaces_created(), 2);
        assert!(!shadow.events_suppressed());
    }

    #[test]
    fn resize_replays_the_whole_display_list() {
        let dir = TempDir::new().expect("tempdir");
        let (backend, ops) = RecordingBackend::new();
        let mut shadow = ShadowDevice::new(
            Box::new(backend),
            dir.path().join("scratch.png"),
            640.0,
            480.0,
            1.0,
        );
        shadow.record(simple_op()).expect("record");
        shadow.record(simple_op()).expect("record");
        let drawn_before = ops.ops_drawn();

        shadow.resize(800.0, 600.0, 2.0).expect("resize");
        assert_eq!(shadow.size(), (800.0, 600.0));
        // the full list was drawn again on the new surface
        assert_eq!(ops.ops_drawn(), drawn_before + 2);
    }

    #[test]
    fn new_page_resets_the_display_list() {
        let dir = TempDir::new().expect("tempdir");
        let (backend, _ops) = RecordingBackend::new();
        let mut shadow = ShadowDevice::new(
            Box::new(backend),
            dir.path().join("scratch.png"),
            640.0,
            480.0,
            1.0,
        );
        shadow.record(simple_op()).expect("record");
        shadow.record(simple_op()).expect("record");
        assert_eq!(shadow.display_list_len(), 2);
        shadow
            .record(DrawOp::NewPage {
                gc: GraphicsContext::default(),
            })
            .expect("record");
        assert_eq!(shadow.display_list_len(), 1);
    }

    #[test]
    fn allocation_failure_is_fatal_to_the_draw() {
        let dir = TempDir::new().expect("tempdir");
        let (backend, ops) = RecordingBackend::new();
        ops.fail_next_create();
        let mut shadow = ShadowDevice::new(
            Box::new(backend),
            dir.path().join("scratch.png"),
            640.0,
            480.0,
            1.0,
        );
        assert!(shadow.record(simple_op()).is_err());
    }
}
