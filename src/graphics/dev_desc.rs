//! Engine device-descriptor versioning.
//!
//! The external graphics engine has shipped at least eleven incompatible
//! revisions of its device-descriptor layout, each appending capability
//! fields and callbacks to the end of the previous one. A device compiled
//! against one layout must never be invoked through another, so the
//! descriptor is modeled as a sum type over the known layouts and every
//! drawing primitive dispatches through an exhaustive match on the active
//! variant. Engine versions newer than the newest modeled layout get a
//! best-effort wrapping of the newest layout.

use std::any::Any;
use std::path::PathBuf;

/// Per-device mutable state handed to every descriptor callback. Owned by
/// exactly one device and destroyed when that device closes.
pub struct DeviceContext {
    pub width: f64,
    pub height: f64,
    pub pixel_ratio: f64,
    pub target_file: PathBuf,
    /// Backend-private payload; only the backend that created the context
    /// downcasts it.
    pub payload: Box<dyn Any>,
}

impl DeviceContext {
    pub fn new(width: f64, height: f64, pixel_ratio: f64, target_file: PathBuf) -> DeviceContext {
        DeviceContext {
            width,
            height,
            pixel_ratio,
            target_file,
            payload: Box::new(()),
        }
    }
}

/// Pen/brush state accompanying each primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphicsContext {
    pub color: u32,
    pub fill: u32,
    pub line_width: f64,
    pub line_type: i32,
    pub font_size: f64,
}

impl Default for GraphicsContext {
    fn default() -> GraphicsContext {
        GraphicsContext {
            color: 0xff00_0000,
            fill: 0x0000_0000,
            line_width: 1.0,
            line_type: 0,
            font_size: 12.0,
        }
    }
}

pub type ActivateFn = fn(&mut DeviceContext);
pub type CircleFn = fn(&mut DeviceContext, f64, f64, f64, &GraphicsContext);
pub type ClipFn = fn(&mut DeviceContext, f64, f64, f64, f64);
pub type CloseFn = fn(&mut DeviceContext);
pub type LineFn = fn(&mut DeviceContext, f64, f64, f64, f64, &GraphicsContext);
pub type MetricInfoFn = fn(&mut DeviceContext, i32, &GraphicsContext) -> (f64, f64, f64);
pub type ModeFn = fn(&mut DeviceContext, i32);
pub type NewPageFn = fn(&mut DeviceContext, &GraphicsContext);
pub type PolygonFn = fn(&mut DeviceContext, &[(f64, f64)], &GraphicsContext);
pub type RectFn = fn(&mut DeviceContext, f64, f64, f64, f64, &GraphicsContext);
pub type SizeFn = fn(&mut DeviceContext) -> (f64, f64, f64, f64);
pub type StrWidthFn = fn(&mut DeviceContext, &str, &GraphicsContext) -> f64;
pub type TextFn = fn(&mut DeviceContext, f64, f64, &str, f64, f64, &GraphicsContext);
pub type RasterFn = fn(&mut DeviceContext, &[u32], u32, u32, f64, f64, f64, f64, f64, &GraphicsContext);
pub type PathFn = fn(&mut DeviceContext, &[(f64, f64)], &[usize], bool, &GraphicsContext);
pub type HoldflushFn = fn(&mut DeviceContext, i32) -> i32;
pub type PatternFn = fn(&mut DeviceContext, &GraphicsContext) -> i32;
pub type MaskFn = fn(&mut DeviceContext, i32) -> i32;
pub type GroupFn = fn(&mut DeviceContext, i32, i32) -> i32;

fn noop_activate(_: &mut DeviceContext) {}
fn noop_mode(_: &mut DeviceContext, _: i32) {}

/// Version-independent descriptor prefix plus the callbacks for every
/// modeled revision. A backend fills in what it supports; `allocate` copies
/// only the fields the running engine's layout actually has.
pub struct DevDescCommon {
    // bounding box and clip region, device units
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
    pub clip_left: f64,
    pub clip_right: f64,
    pub clip_bottom: f64,
    pub clip_top: f64,
    pub can_clip: bool,
    pub can_change_gamma: bool,
    pub display_list_on: bool,

    pub activate: ActivateFn,
    pub circle: CircleFn,
    pub clip: ClipFn,
    pub close: CloseFn,
    pub deactivate: ActivateFn,
    pub line: LineFn,
    pub metric_info: MetricInfoFn,
    pub mode: ModeFn,
    pub new_page: NewPageFn,
    pub polygon: PolygonFn,
    pub polyline: PolygonFn,
    pub rect: RectFn,
    pub size: SizeFn,
    pub str_width: StrWidthFn,
    pub text: TextFn,

    // version 6+
    pub raster: Option<RasterFn>,

    // version 8+
    pub path: Option<PathFn>,
    pub have_event_loop: bool,

    // version 9+
    pub holdflush: Option<HoldflushFn>,
    pub have_transparency: bool,
    pub have_raster: bool,
    pub have_capture: bool,

    // version 12+
    pub can_generate_events: bool,

    // version 14+
    pub set_pattern: Option<PatternFn>,
    pub set_clip_path: Option<MaskFn>,
    pub set_mask: Option<MaskFn>,

    // version 15+
    pub define_group: Option<GroupFn>,
    pub use_group: Option<MaskFn>,
}

impl DevDescCommon {
    /// A descriptor whose geometry is set but whose optional capabilities
    /// are all absent. Backends start from this and override what they
    /// implement.
    pub fn with_size(width: f64, height: f64) -> DevDescCommon {
        DevDescCommon {
            left: 0.0,
            right: width,
            bottom: height,
            top: 0.0,
            clip_left: 0.0,
            clip_right: width,
            clip_bottom: height,
            clip_top: 0.0,
            can_clip: true,
            can_change_gamma: false,
            display_list_on: true,
            activate: noop_activate,
            circle: |_, _, _, _, _| {},
            clip: |_, _, _, _, _| {},
            close: noop_activate,
            deactivate: noop_activate,
            line: |_, _, _, _, _, _| {},
            metric_info: |_, _, _| (0.0, 0.0, 0.0),
            mode: noop_mode,
            new_page: |_, _| {},
            polygon: |_, _, _| {},
            polyline: |_, _, _| {},
            rect: |_, _, _, _, _, _| {},
            size: |ctx| (0.0, ctx.width, ctx.height, 0.0),
            str_width: |_, text, gc| text.len() as f64 * gc.font_size * 0.6,
            text: |_, _, _, _, _, _, _| {},
            raster: None,
            path: None,
            have_event_loop: false,
            holdflush: None,
            have_transparency: true,
            have_raster: false,
            have_capture: false,
            can_generate_events: false,
            set_pattern: None,
            set_clip_path: None,
            set_mask: None,
            define_group: None,
            use_group: None,
        }
    }
}

/// Base layout shared by every revision.
pub struct DevDescV5 {
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
    pub clip_left: f64,
    pub clip_right: f64,
    pub clip_bottom: f64,
    pub clip_top: f64,
    pub can_clip: bool,
    pub can_change_gamma: bool,
    pub display_list_on: bool,
    pub activate: ActivateFn,
    pub circle: CircleFn,
    pub clip: ClipFn,
    pub close: CloseFn,
    pub deactivate: ActivateFn,
    pub line: LineFn,
    pub metric_info: MetricInfoFn,
    pub mode: ModeFn,
    pub new_page: NewPageFn,
    pub polygon: PolygonFn,
    pub polyline: PolygonFn,
    pub rect: RectFn,
    pub size: SizeFn,
    pub str_width: StrWidthFn,
    pub text: TextFn,
}

pub struct DevDescV6 {
    pub base: DevDescV5,
    pub raster: Option<RasterFn>,
}

/// Version 7 reshuffled internals without adding callbacks the shim uses;
/// the layout is tracked separately so version checks stay exact.
pub struct DevDescV7 {
    pub base: DevDescV6,
}

pub struct DevDescV8 {
    pub base: DevDescV7,
    pub path: Option<PathFn>,
    pub have_event_loop: bool,
}

/// Versions 9 through 11 share one layout.
pub struct DevDescV9 {
    pub base: DevDescV8,
    pub holdflush: Option<HoldflushFn>,
    pub have_transparency: bool,
    pub have_raster: bool,
    pub have_capture: bool,
}

/// Versions 12 and 13 share one layout.
pub struct DevDescV12 {
    pub base: DevDescV9,
    pub can_generate_events: bool,
}

pub struct DevDescV14 {
    pub base: DevDescV12,
    pub set_pattern: Option<PatternFn>,
    pub set_clip_path: Option<MaskFn>,
    pub set_mask: Option<MaskFn>,
}

pub struct DevDescV15 {
    pub base: DevDescV14,
    pub define_group: Option<GroupFn>,
    pub use_group: Option<MaskFn>,
}

pub enum VersionedDevDesc {
    V5(DevDescV5),
    V6(DevDescV6),
    V7(DevDescV7),
    V8(DevDescV8),
    V9(DevDescV9),
    V12(DevDescV12),
    V14(DevDescV14),
    /// Version 15 and, best-effort, anything newer: unmodeled future
    /// revisions are wrapped at this layout with the actual engine version
    /// recorded alongside.
    V15Plus(DevDescV15, u32),
}

/// Lowest engine version the shim can drive at all.
pub const MIN_ENGINE_VERSION: u32 = 5;
/// Newest layout the shim models exactly.
pub const MAX_MODELED_VERSION: u32 = 15;

fn base_v5(common: &DevDescCommon) -> DevDescV5 {
    DevDescV5 {
        left: common.left,
        right: common.right,
        bottom: common.bottom,
        top: common.top,
        clip_left: common.clip_left,
        clip_right: common.clip_right,
        clip_bottom: common.clip_bottom,
        clip_top: common.clip_top,
        can_clip: common.can_clip,
        can_change_gamma: common.can_change_gamma,
        display_list_on: common.display_list_on,
        activate: common.activate,
        circle: common.circle,
        clip: common.clip,
        close: common.close,
        deactivate: common.deactivate,
        line: common.line,
        metric_info: common.metric_info,
        mode: common.mode,
        new_page: common.new_page,
        polygon: common.polygon,
        polyline: common.polyline,
        rect: common.rect,
        size: common.size,
        str_width: common.str_width,
        text: common.text,
    }
}

fn base_v9(common: &DevDescCommon) -> DevDescV9 {
    DevDescV9 {
        base: DevDescV8 {
            base: DevDescV7 {
                base: DevDescV6 {
                    base: base_v5(common),
                    raster: common.raster,
                },
            },
            path: common.path,
            have_event_loop: common.have_event_loop,
        },
        holdflush: common.holdflush,
        have_transparency: common.have_transparency,
        have_raster: common.have_raster,
        have_capture: common.have_capture,
    }
}

fn base_v15(common: &DevDescCommon) -> DevDescV15 {
    DevDescV15 {
        base: DevDescV14 {
            base: DevDescV12 {
                base: base_v9(common),
                can_generate_events: common.can_generate_events,
            },
            set_pattern: common.set_pattern,
            set_clip_path: common.set_clip_path,
            set_mask: common.set_mask,
        },
        define_group: common.define_group,
        use_group: common.use_group,
    }
}

/// Build the descriptor layout matching the running engine version. Copies
/// the common prefix field by field, then only the capability fields that
/// exist at that revision.
pub fn allocate(common: &DevDescCommon, engine_version: u32) -> Result<VersionedDevDesc, String> {
    match engine_version {
        0..=4 => Err(format!(
            "graphics engine version {engine_version} is older than the oldest supported ({MIN_ENGINE_VERSION})"
        )),
        5 => Ok(VersionedDevDesc::V5(base_v5(common))),
        6 => Ok(VersionedDevDesc::V6(DevDescV6 {
            base: base_v5(common),
            raster: common.raster,
        })),
        7 => Ok(VersionedDevDesc::V7(DevDescV7 {
            base: DevDescV6 {
                base: base_v5(common),
                raster: common.raster,
            },
        })),
        8 => Ok(VersionedDevDesc::V8(DevDescV8 {
            base: DevDescV7 {
                base: DevDescV6 {
                    base: base_v5(common),
                    raster: common.raster,
                },
            },
            path: common.path,
            have_event_loop: common.have_event_loop,
        })),
        9..=11 => Ok(VersionedDevDesc::V9(base_v9(common))),
        12 | 13 => Ok(VersionedDevDesc::V12(DevDescV12 {
            base: base_v9(common),
            can_generate_events: common.can_generate_events,
        })),
        14 => Ok(VersionedDevDesc::V14(DevDescV14 {
            base: DevDescV12 {
                base: base_v9(common),
                can_generate_events: common.can_generate_events,
            },
            set_pattern: common.set_pattern,
            set_clip_path: common.set_clip_path,
            set_mask: common.set_mask,
        })),
        version => Ok(VersionedDevDesc::V15Plus(base_v15(common), version)),
    }
}

impl VersionedDevDesc {
    pub fn engine_version(&self) -> u32 {
        match self {
            VersionedDevDesc::V5(_) => 5,
            VersionedDevDesc::V6(_) => 6,
            VersionedDevDesc::V7(_) => 7,
            VersionedDevDesc::V8(_) => 8,
            VersionedDevDesc::V9(_) => 9,
            VersionedDevDesc::V12(_) => 12,
            VersionedDevDesc::V14(_) => 14,
            VersionedDevDesc::V15Plus(_, version) => *version,
        }
    }

    fn v5(&self) -> &DevDescV5 {
        match self {
            VersionedDevDesc::V5(d) => d,
            VersionedDevDesc::V6(d) => &d.base,
            VersionedDevDesc::V7(d) => &d.base.base,
            VersionedDevDesc::V8(d) => &d.base.base.base,
            VersionedDevDesc::V9(d) => &d.base.base.base.base,
            VersionedDevDesc::V12(d) => &d.base.base.base.base.base,
            VersionedDevDesc::V14(d) => &d.base.base.base.base.base.base,
            VersionedDevDesc::V15Plus(d, _) => &d.base.base.base.base.base.base.base,
        }
    }

    fn v5_mut(&mut self) -> &mut DevDescV5 {
        match self {
            VersionedDevDesc::V5(d) => d,
            VersionedDevDesc::V6(d) => &mut d.base,
            VersionedDevDesc::V7(d) => &mut d.base.base,
            VersionedDevDesc::V8(d) => &mut d.base.base.base,
            VersionedDevDesc::V9(d) => &mut d.base.base.base.base,
            VersionedDevDesc::V12(d) => &mut d.base.base.base.base.base,
            VersionedDevDesc::V14(d) => &mut d.base.base.base.base.base.base,
            VersionedDevDesc::V15Plus(d, _) => &mut d.base.base.base.base.base.base.base,
        }
    }

    fn raster_fn(&self) -> Option<RasterFn> {
        match self {
            VersionedDevDesc::V5(_) => None,
            VersionedDevDesc::V6(d) => d.raster,
            VersionedDevDesc::V7(d) => d.base.raster,
            VersionedDevDesc::V8(d) => d.base.base.raster,
            VersionedDevDesc::V9(d) => d.base.base.base.raster,
            VersionedDevDesc::V12(d) => d.base.base.base.base.raster,
            VersionedDevDesc::V14(d) => d.base.base.base.base.base.raster,
            VersionedDevDesc::V15Plus(d, _) => d.base.base.base.base.base.base.raster,
        }
    }

    fn path_fn(&self) -> Option<PathFn> {
        match self {
            VersionedDevDesc::V5(_) | VersionedDevDesc::V6(_) | VersionedDevDesc::V7(_) => None,
            VersionedDevDesc::V8(d) => d.path,
            VersionedDevDesc::V9(d) => d.base.path,
            VersionedDevDesc::V12(d) => d.base.base.path,
            VersionedDevDesc::V14(d) => d.base.base.base.path,
            VersionedDevDesc::V15Plus(d, _) => d.base.base.base.base.path,
        }
    }

    fn holdflush_fn(&self) -> Option<HoldflushFn> {
        match self {
            VersionedDevDesc::V5(_)
            | VersionedDevDesc::V6(_)
            | VersionedDevDesc::V7(_)
            | VersionedDevDesc::V8(_) => None,
            VersionedDevDesc::V9(d) => d.holdflush,
            VersionedDevDesc::V12(d) => d.base.holdflush,
            VersionedDevDesc::V14(d) => d.base.base.holdflush,
            VersionedDevDesc::V15Plus(d, _) => d.base.base.base.holdflush,
        }
    }
}

/// Copy geometry and capability attributes from one descriptor to another.
/// Used to keep a visible device's engine-facing attributes mirroring its
/// shadow surface before each draw.
pub fn sync_device_attributes(from: &VersionedDevDesc, to: &mut VersionedDevDesc) {
    let src = from.v5();
    let (left, right, bottom, top) = (src.left, src.right, src.bottom, src.top);
    let (cl, cr, cb, ct) = (src.clip_left, src.clip_right, src.clip_bottom, src.clip_top);
    let can_clip = src.can_clip;
    let dst = to.v5_mut();
    dst.left = left;
    dst.right = right;
    dst.bottom = bottom;
    dst.top = top;
    dst.clip_left = cl;
    dst.clip_right = cr;
    dst.clip_bottom = cb;
    dst.clip_top = ct;
    dst.can_clip = can_clip;
}

// Primitive dispatch. Each free function selects the correctly-typed view of
// the descriptor for its version and invokes the callback through it.
// Primitives that only exist at newer revisions return an error when the
// active layout predates them.

pub fn activate(dd: &VersionedDevDesc, ctx: &mut DeviceContext) {
    (dd.v5().activate)(ctx)
}

pub fn deactivate(dd: &VersionedDevDesc, ctx: &mut DeviceContext) {
    (dd.v5().deactivate)(ctx)
}

pub fn circle(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    x: f64,
    y: f64,
    r: f64,
    gc: &GraphicsContext,
) {
    (dd.v5().circle)(ctx, x, y, r, gc)
}

pub fn clip(dd: &VersionedDevDesc, ctx: &mut DeviceContext, x0: f64, x1: f64, y0: f64, y1: f64) {
    (dd.v5().clip)(ctx, x0, x1, y0, y1)
}

pub fn close(dd: &VersionedDevDesc, ctx: &mut DeviceContext) {
    (dd.v5().close)(ctx)
}

pub fn line(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    gc: &GraphicsContext,
) {
    (dd.v5().line)(ctx, x1, y1, x2, y2, gc)
}

pub fn metric_info(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    c: i32,
    gc: &GraphicsContext,
) -> (f64, f64, f64) {
    (dd.v5().metric_info)(ctx, c, gc)
}

pub fn mode(dd: &VersionedDevDesc, ctx: &mut DeviceContext, on: i32) {
    (dd.v5().mode)(ctx, on)
}

pub fn new_page(dd: &VersionedDevDesc, ctx: &mut DeviceContext, gc: &GraphicsContext) {
    (dd.v5().new_page)(ctx, gc)
}

pub fn polygon(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    points: &[(f64, f64)],
    gc: &GraphicsContext,
) {
    (dd.v5().polygon)(ctx, points, gc)
}

pub fn polyline(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    points: &[(f64, f64)],
    gc: &GraphicsContext,
) {
    (dd.v5().polyline)(ctx, points, gc)
}

pub fn rect(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
    gc: &GraphicsContext,
) {
    (dd.v5().rect)(ctx, x0, y0, x1, y1, gc)
}

pub fn size(dd: &VersionedDevDesc, ctx: &mut DeviceContext) -> (f64, f64, f64, f64) {
    (dd.v5().size)(ctx)
}

pub fn str_width(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    text: &str,
    gc: &GraphicsContext,
) -> f64 {
    (dd.v5().str_width)(ctx, text, gc)
}

pub fn text(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    x: f64,
    y: f64,
    value: &str,
    rot: f64,
    hadj: f64,
    gc: &GraphicsContext,
) {
    (dd.v5().text)(ctx, x, y, value, rot, hadj, gc)
}

#[allow(clippy::too_many_arguments)]
pub fn raster(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    pixels: &[u32],
    w: u32,
    h: u32,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    rot: f64,
    gc: &GraphicsContext,
) -> Result<(), String> {
    match dd.raster_fn() {
        Some(f) => {
            f(ctx, pixels, w, h, x, y, width, height, rot, gc);
            Ok(())
        }
        None => Err(format!(
            "raster is not supported by engine version {}",
            dd.engine_version()
        )),
    }
}

pub fn path(
    dd: &VersionedDevDesc,
    ctx: &mut DeviceContext,
    points: &[(f64, f64)],
    subpaths: &[usize],
    winding: bool,
    gc: &GraphicsContext,
) -> Result<(), String> {
    match dd.path_fn() {
        Some(f) => {
            f(ctx, points, subpaths, winding, gc);
            Ok(())
        }
        None => Err(format!(
            "path is not supported by engine version {}",
            dd.engine_version()
        )),
    }
}

pub fn holdflush(dd: &VersionedDevDesc, ctx: &mut DeviceContext, level: i32) -> Result<i32, String> {
    match dd.holdflush_fn() {
        Some(f) => Ok(f(ctx, level)),
        None => Err(format!(
            "holdflush is not supported by engine version {}",
            dd.engine_version()
        )),
    }
}
