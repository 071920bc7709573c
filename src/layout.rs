//! Geometry planning: rotation, decimation, placement.
//!
//! Given an image's intrinsic size and the panel's dimensions, decide how
//! the image lands on the screen before a single pixel is decoded. The
//! planner is pure; applying the rotation and programming the decoder's
//! decimation is the controller's job.

use log::debug;

use crate::display::Rotation;

/// Largest supported decimation factor (factors are powers of two).
pub const MAX_SCALE: u8 = 8;

/// Coarse shape classification of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrientation {
    /// width / height > 1.2
    Landscape,
    /// width / height < 0.8
    Portrait,
    /// anything in between, both thresholds inclusive
    Square,
}

/// Policy for reconciling image and screen aspect ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    /// Rely on rotation alone; no decimation.
    AutoRotate,
    /// Contain: decimate until the image fits entirely on screen.
    #[default]
    SmartScale,
    /// Cover: decimate only until the image still fills the screen,
    /// cropping whatever overflows.
    CenterCrop,
    /// Contain, but the top-left corner is pinned on-screen.
    FitScreen,
}

/// Everything the decoders need to place their output.
///
/// Computed fresh for every render, never persisted. `x`/`y` may be
/// negative when a cover policy deliberately lets edges hang off screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPlan {
    pub rotation: Rotation,
    /// Power-of-two decimation factor, 1..=8.
    pub scale: u8,
    /// Image width after decimation.
    pub width: u16,
    /// Image height after decimation.
    pub height: u16,
    pub x: i32,
    pub y: i32,
}

/// Classify an image by its aspect ratio.
///
/// The 1.2 and 0.8 thresholds are strict, so ratios exactly on a
/// threshold classify as [`ImageOrientation::Square`].
pub fn classify(width: u16, height: u16) -> ImageOrientation {
    let aspect = width as f32 / height as f32;
    if aspect > 1.2 {
        ImageOrientation::Landscape
    } else if aspect < 0.8 {
        ImageOrientation::Portrait
    } else {
        ImageOrientation::Square
    }
}

/// Compute a render plan for an image on a panel.
///
/// `panel_long`/`panel_short` are the panel's physical dimensions
/// independent of rotation (e.g. 320/240). Zero image dimensions are a
/// caller bug; the format probes reject them before planning.
pub fn plan(
    img_w: u16,
    img_h: u16,
    panel_long: u16,
    panel_short: u16,
    mode: DisplayMode,
    auto_rotate: bool,
) -> RenderPlan {
    let orientation = classify(img_w, img_h);

    // Portrait images get the portrait rotation when allowed; square and
    // landscape images always render on the default landscape viewport.
    let rotation = if auto_rotate && orientation == ImageOrientation::Portrait {
        Rotation::Portrait
    } else {
        Rotation::Landscape
    };
    let (screen_w, screen_h) = match rotation {
        Rotation::Landscape => (panel_long, panel_short),
        Rotation::Portrait => (panel_short, panel_long),
    };

    let img_aspect = img_w as f32 / img_h as f32;
    let screen_aspect = screen_w as f32 / screen_h as f32;

    let scale = match mode {
        DisplayMode::SmartScale | DisplayMode::FitScreen => {
            // Contain: halve along the relatively longer dimension until
            // it fits, capped at MAX_SCALE.
            let mut s: u8 = 1;
            if img_aspect > screen_aspect {
                while img_w / s as u16 > screen_w && s < MAX_SCALE {
                    s *= 2;
                }
            } else {
                while img_h / s as u16 > screen_h && s < MAX_SCALE {
                    s *= 2;
                }
            }
            s
        }
        DisplayMode::CenterCrop => {
            // Cover: size the filling dimension, then quantize *down* to a
            // supported factor. Overshooting here keeps that dimension at
            // or above screen size; the other dimension gets cropped.
            let fill = if img_aspect > screen_aspect {
                img_h as f32 / screen_h as f32
            } else {
                img_w as f32 / screen_w as f32
            };
            if fill >= 8.0 {
                8
            } else if fill >= 4.0 {
                4
            } else if fill >= 2.0 {
                2
            } else {
                1
            }
        }
        DisplayMode::AutoRotate => 1,
    };

    let width = img_w / scale as u16;
    let height = img_h / scale as u16;

    let mut x = (screen_w as i32 - width as i32) / 2;
    let mut y = (screen_h as i32 - height as i32) / 2;

    // FitScreen keeps the top-left corner on-screen; overflow (if any)
    // crops on the bottom/right only. Every other mode centers truly and
    // accepts negative offsets.
    if mode == DisplayMode::FitScreen {
        x = x.max(0);
        y = y.max(0);
    }

    debug!(
        "layout: {img_w}x{img_h} -> {:?} scale {scale} at ({x},{y}) on {screen_w}x{screen_h}",
        rotation
    );

    RenderPlan {
        rotation,
        scale,
        width,
        height,
        x,
        y,
    }
}
