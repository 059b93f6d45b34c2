//! Graphics display: a visible device descriptor kept in sync with a
//! shadow bitmap device, plus the bounded plot cache.

pub mod dev_desc;
pub mod plot;
pub mod plot_manager;
pub mod shadow;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dev_desc::{
    DevDescCommon, DeviceContext, GraphicsContext, VersionedDevDesc, allocate,
    sync_device_attributes,
};
use plot_manager::PlotManager;
use shadow::{BitmapBackend, DrawOp, ShadowDevice};

pub struct Display {
    engine_version: u32,
    visible: VersionedDevDesc,
    visible_ctx: DeviceContext,
    shadow_desc: VersionedDevDesc,
    shadow: ShadowDevice,
    plots: PlotManager,
    /// Id of the plot whose display list the shadow currently holds. Older
    /// plots selected from the cache render from their snapshots instead.
    shadow_plot_id: Option<String>,
}

impl Display {
    /// Allocates descriptors for the running engine version and prepares
    /// the plot cache. Descriptor allocation failure (engine too old) or an
    /// unusable plots directory aborts device creation.
    pub fn new(
        engine_version: u32,
        backend: Box<dyn BitmapBackend>,
        plots_dir: PathBuf,
        width: f64,
        height: f64,
        pixel_ratio: f64,
    ) -> Result<Display, String> {
        let common = DevDescCommon::with_size(width, height);
        let visible = allocate(&common, engine_version)?;
        let shadow_desc = allocate(&common, engine_version)?;
        let scratch = plots_dir.join("shadow-scratch.png");
        let plots = PlotManager::new(plots_dir)
            .map_err(|e| format!("error preparing plots directory: {e}"))?;
        Ok(Display {
            engine_version,
            visible,
            visible_ctx: DeviceContext::new(width, height, pixel_ratio, scratch.clone()),
            shadow_desc,
            shadow: ShadowDevice::new(backend, scratch, width, height, pixel_ratio),
            plots,
            shadow_plot_id: None,
        })
    }

    pub fn engine_version(&self) -> u32 {
        self.engine_version
    }

    pub fn size(&self) -> (f64, f64) {
        self.shadow.size()
    }

    pub fn plots(&self) -> &PlotManager {
        &self.plots
    }

    pub fn plots_mut(&mut self) -> &mut PlotManager {
        &mut self.plots
    }

    pub fn events_suppressed(&self) -> bool {
        self.shadow.events_suppressed()
    }

    /// Record one primitive: shadow first, then the visible device with its
    /// attributes refreshed from the shadow's.
    pub fn draw(&mut self, op: DrawOp) -> Result<(), String> {
        self.shadow.record(op.clone())?;
        sync_device_attributes(&self.shadow_desc, &mut self.visible);
        self.replay_on_visible(&op);
        self.plots.invalidate_active();
        Ok(())
    }

    fn replay_on_visible(&mut self, op: &DrawOp) {
        let dd = &self.visible;
        let ctx = &mut self.visible_ctx;
        match op {
            DrawOp::NewPage { gc } => dev_desc::new_page(dd, ctx, gc),
            DrawOp::Clip { x0, x1, y0, y1 } => dev_desc::clip(dd, ctx, *x0, *x1, *y0, *y1),
            DrawOp::Circle { x, y, r, gc } => dev_desc::circle(dd, ctx, *x, *y, *r, gc),
            DrawOp::Line { x1, y1, x2, y2, gc } => dev_desc::line(dd, ctx, *x1, *y1, *x2, *y2, gc),
            DrawOp::Rect { x0, y0, x1, y1, gc } => dev_desc::rect(dd, ctx, *x0, *y0, *x1, *y1, gc),
            DrawOp::Polygon { points, gc } => dev_desc::polygon(dd, ctx, points, gc),
            DrawOp::Polyline { points, gc } => dev_desc::polyline(dd, ctx, points, gc),
            DrawOp::Path {
                points,
                subpaths,
                winding,
                gc,
            } => {
                if let Err(err) = dev_desc::path(dd, ctx, points, subpaths, *winding, gc) {
                    crate::event_log::log(
                        "graphics_primitive_unsupported",
                        serde_json::json!({ "error": err }),
                    );
                }
            }
            DrawOp::Text {
                x, y, value, rot, gc,
            } => dev_desc::text(dd, ctx, *x, *y, value, *rot, 0.0, gc),
            DrawOp::Raster {
                pixels,
                w,
                h,
                x,
                y,
                width,
                height,
            } => {
                if let Err(err) = dev_desc::raster(
                    dd,
                    ctx,
                    pixels,
                    *w,
                    *h,
                    *x,
                    *y,
                    *width,
                    *height,
                    0.0,
                    &GraphicsContext::default(),
                ) {
                    crate::event_log::log(
                        "graphics_primitive_unsupported",
                        serde_json::json!({ "error": err }),
                    );
                }
            }
        }
    }

    /// Device new-page event: opens a slot in the plot cache, snapshotting
    /// the outgoing plot from the shadow if it had pending changes.
    pub fn new_page(&mut self, gc: GraphicsContext) -> Result<(), String> {
        self.snapshot_shadow_plot();
        let (width, height) = self.shadow.size();
        self.plots.on_device_new_page(width, height, None);
        self.shadow_plot_id = self.plots.active_plot().map(|p| p.id.clone());
        self.shadow.record(DrawOp::NewPage { gc })
    }

    /// Switch the selected plot and mark it for re-render to the live
    /// display. The shadow's plot is snapshotted first if it still has
    /// unrendered changes, so switching away never loses it.
    pub fn set_active_plot(&mut self, index: usize) -> Result<(), String> {
        if self.plots.active_index() == Some(index) {
            return Ok(());
        }
        if self.plots.active_plot().map(|p| &p.id) == self.shadow_plot_id.as_ref() {
            self.snapshot_shadow_plot();
        }
        self.plots.set_active_plot(index)
    }

    /// Write the shadow's plot to its snapshot file if it has pending
    /// changes. Capture failures are logged; the plot stays unrendered.
    fn snapshot_shadow_plot(&mut self) {
        if !self.shadow.has_pending_changes() {
            return;
        }
        let file = self.plots.plots_dir().join("previous-page.png");
        let capture = match self.shadow.write_to_png(&file) {
            Ok(()) => Some(file),
            Err(err) => {
                crate::event_log::log("plot_capture_error", serde_json::json!({ "error": err }));
                None
            }
        };
        self.plots.snapshot_active_from_capture(capture.as_deref());
        if let Some(file) = capture
            && file.exists()
            && let Err(err) = fs::remove_file(&file)
        {
            crate::event_log::log(
                "plot_capture_cleanup_error",
                serde_json::json!({ "error": err.to_string() }),
            );
        }
    }

    /// Materialize the active plot's image file. The shadow's plot renders
    /// from the live display list; an older selection replays from its
    /// snapshot so re-rendering never overwrites it with the current page.
    pub fn render_active_plot(&mut self) -> Result<Option<PathBuf>, String> {
        let Some(plot) = self.plots.active_plot().cloned() else {
            return Ok(None);
        };
        let image = plot.image_file(self.plots.plots_dir());
        if Some(&plot.id) == self.shadow_plot_id.as_ref() {
            self.shadow.write_to_png(&image)?;
        } else {
            let snapshot = plot.snapshot_file(self.plots.plots_dir());
            if snapshot.is_file() {
                fs::copy(&snapshot, &image).map_err(|e| {
                    format!("error rendering plot {} from its snapshot: {e}", plot.id)
                })?;
            } else if !image.is_file() {
                return Err(format!("plot {} has no snapshot to render from", plot.id));
            }
        }
        self.plots.mark_active_rendered();
        self.plots.clear_display_dirty();
        Ok(Some(image))
    }

    pub fn resize(&mut self, width: f64, height: f64, pixel_ratio: f64) -> Result<(), String> {
        self.shadow.resize(width, height, pixel_ratio)?;
        self.visible_ctx.width = width;
        self.visible_ctx.height = height;
        self.visible_ctx.pixel_ratio = pixel_ratio;
        self.plots.invalidate_active();
        Ok(())
    }

    /// Drop all plots and recorded drawing. Used before minimal
    /// checkpoints.
    pub fn clear(&mut self) {
        self.plots.clear();
        self.shadow.clear();
        self.shadow_plot_id = None;
    }

    /// Persist plot state. In server mode the plots directory itself is
    /// stable across processes, so only the index is written; otherwise the
    /// backing files are copied under the state directory too.
    pub fn save_state(&self, index_file: &Path, serialized_dir: Option<&Path>) -> Result<(), String> {
        if let Some(dir) = serialized_dir {
            copy_dir_files(self.plots.plots_dir(), dir)
                .map_err(|e| format!("error serializing plots directory: {e}"))?;
        }
        self.plots.save_state(index_file)
    }

    /// Inverse of `save_state`; tolerates both a missing index and missing
    /// serialized files.
    pub fn restore_state(
        &mut self,
        index_file: &Path,
        serialized_dir: Option<&Path>,
    ) -> Result<(), String> {
        if let Some(dir) = serialized_dir
            && dir.is_dir()
        {
            copy_dir_files(dir, self.plots.plots_dir())
                .map_err(|e| format!("error restoring plots directory: {e}"))?;
        }
        // restored plots render from their snapshots until a new page opens
        self.shadow_plot_id = None;
        self.plots.restore_state(index_file)
    }
}

fn copy_dir_files(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingBackend;
    use tempfile::TempDir;

    fn display(dir: &TempDir) -> Display {
        let (backend, _ops) = RecordingBackend::new();
        Display::new(
            14,
            Box::new(backend),
            dir.path().join("plots"),
            640.0,
            480.0,
            1.0,
        )
        .expect("create display")
    }

    fn line() -> DrawOp {
        DrawOp::Line {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
            gc: GraphicsContext::default(),
        }
    }

    #[test]
    fn new_page_adds_a_plot_and_render_materializes_it() {
        let dir = TempDir::new().expect("tempdir");
        let mut display = display(&dir);
        display.new_page(GraphicsContext::default()).expect("new page");
        display.draw(line()).expect("draw");
        assert_eq!(display.plots().len(), 1);

        let image = display
            .render_active_plot()
            .expect("render")
            .expect("active plot");
        assert!(image.exists());
    }

    #[test]
    fn second_page_snapshots_the_first() {
        let dir = TempDir::new().expect("tempdir");
        let mut display = display(&dir);
        display.new_page(GraphicsContext::default()).expect("new page");
        display.draw(line()).expect("draw");
        display.new_page(GraphicsContext::default()).expect("new page");

        let first = display.plots().plot(0).expect("first plot").clone();
        assert!(first.rendered);
        assert!(first.snapshot_file(display.plots().plots_dir()).exists());
        assert_eq!(display.plots().active_index(), Some(1));
    }

    fn circle() -> DrawOp {
        DrawOp::Circle {
            x: 5.0,
            y: 5.0,
            r: 2.0,
            gc: GraphicsContext::default(),
        }
    }

    #[test]
    fn selecting_an_older_plot_rerenders_it_from_its_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let mut display = display(&dir);
        display.new_page(GraphicsContext::default()).expect("new page");
        display.draw(line()).expect("draw line");
        display.new_page(GraphicsContext::default()).expect("new page");
        display.draw(circle()).expect("draw circle");

        display.set_active_plot(0).expect("select first plot");
        let image = display
            .render_active_plot()
            .expect("render")
            .expect("active plot");
        let body = fs::read_to_string(&image).expect("read image");
        assert!(body.contains("Line"));
        assert!(!body.contains("Circle"));

        // the latest plot still renders from the live display list
        display.set_active_plot(1).expect("select second plot");
        let image = display
            .render_active_plot()
            .expect("render")
            .expect("active plot");
        let body = fs::read_to_string(&image).expect("read image");
        assert!(body.contains("Circle"));
        assert!(!body.contains("Line"));
    }

    #[test]
    fn switching_away_snapshots_the_current_page_first() {
        let dir = TempDir::new().expect("tempdir");
        let mut display = display(&dir);
        display.new_page(GraphicsContext::default()).expect("new page");
        display.draw(line()).expect("draw line");
        display.new_page(GraphicsContext::default()).expect("new page");
        display.draw(circle()).expect("draw circle");

        display.set_active_plot(0).expect("select first plot");
        let second = display.plots().plot(1).expect("second plot").clone();
        let snapshot = second.snapshot_file(display.plots().plots_dir());
        let body = fs::read_to_string(&snapshot).expect("read snapshot");
        assert!(body.contains("Circle"));
    }

    #[test]
    fn state_survives_save_and_restore_via_serialized_dir() {
        let dir = TempDir::new().expect("tempdir");
        let state = TempDir::new().expect("state dir");
        let mut display = display(&dir);
        display.new_page(GraphicsContext::default()).expect("new page");
        display.draw(line()).expect("draw");
        display.render_active_plot().expect("render");

        let index = state.path().join("plots");
        let serialized = state.path().join("plots_dir");
        display
            .save_state(&index, Some(&serialized))
            .expect("save state");

        let fresh_dir = TempDir::new().expect("fresh dir");
        let mut fresh = display_at(&fresh_dir);
        fresh
            .restore_state(&index, Some(&serialized))
            .expect("restore state");
        assert_eq!(fresh.plots().len(), 1);
        assert_eq!(fresh.plots().ids(), display.plots().ids());
    }

    fn display_at(dir: &TempDir) -> Display {
        let (backend, _ops) = RecordingBackend::new();
        Display::new(
            14,
            Box::new(backend),
            dir.path().join("plots"),
            640.0,
            480.0,
            1.0,
        )
        .expect("create display")
    }
}
