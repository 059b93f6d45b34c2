//! Bounded plot cache behavior driven through the display device.

use repl_host::graphics::Display;
use repl_host::graphics::dev_desc::GraphicsContext;
use repl_host::graphics::plot_manager::MAX_PLOTS;
use repl_host::graphics::shadow::DrawOp;
use repl_host::testing::RecordingBackend;
use tempfile::TempDir;

fn display(dir: &TempDir, plots_dir: &str) -> Display {
    let (backend, _ops) = RecordingBackend::new();
    Display::new(
        14,
        Box::new(backend),
        dir.path().join(plots_dir),
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
fn cache_is_bounded_and_evicts_oldest_with_files() {
    let dir = TempDir::new().expect("tempdir");
    let mut display = display(&dir, "plots");

    for _ in 0..MAX_PLOTS + 3 {
        display
            .new_page(GraphicsContext::default())
            .expect("new page");
        display.draw(line()).expect("draw");
    }

    assert_eq!(display.plots().len(), MAX_PLOTS);
    assert_eq!(display.plots().active_index(), Some(MAX_PLOTS - 1));

    // only the surviving plots keep backing files on disk
    let plots_dir = display.plots().plots_dir().to_path_buf();
    let snapshots = std::fs::read_dir(&plots_dir)
        .expect("read plots dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "snapshot"))
        .count();
    assert!(
        snapshots <= MAX_PLOTS,
        "evicted snapshots left behind: {snapshots}"
    );
}

#[test]
fn removing_a_plot_repairs_the_active_selection() {
    let dir = TempDir::new().expect("tempdir");
    let mut display = display(&dir, "plots");
    for _ in 0..3 {
        display
            .new_page(GraphicsContext::default())
            .expect("new page");
        display.draw(line()).expect("draw");
    }
    assert_eq!(display.plots().active_index(), Some(2));

    display.plots_mut().remove_plot(0).expect("remove plot");
    assert_eq!(display.plots().len(), 2);
    assert_eq!(display.plots().active_index(), Some(1));

    display
        .plots_mut()
        .remove_plot(1)
        .expect("remove active plot");
    assert_eq!(display.plots().active_index(), Some(0));
}

#[test]
fn index_survives_a_process_boundary() {
    let dir = TempDir::new().expect("tempdir");
    let state = TempDir::new().expect("state");
    let index = state.path().join("plots");
    let serialized = state.path().join("plots_dir");

    let ids = {
        let mut display = display(&dir, "plots-a");
        for _ in 0..4 {
            display
                .new_page(GraphicsContext::default())
                .expect("new page");
            display.draw(line()).expect("draw");
        }
        display.render_active_plot().expect("render");
        display
            .save_state(&index, Some(&serialized))
            .expect("save state");
        display.plots().ids()
    };

    let fresh_dir = TempDir::new().expect("fresh tempdir");
    let mut fresh = display(&fresh_dir, "plots-b");
    fresh
        .restore_state(&index, Some(&serialized))
        .expect("restore state");
    assert_eq!(fresh.plots().ids(), ids);
    assert_eq!(fresh.plots().active_index(), Some(3));
}

#[test]
fn restore_without_an_index_is_empty_not_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let state = TempDir::new().expect("state");
    let mut display = display(&dir, "plots");
    display
        .restore_state(&state.path().join("plots"), None)
        .expect("restore state");
    assert!(display.plots().is_empty());
}
