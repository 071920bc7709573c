//! Image pipeline controller.
//!
//! Top of the rendering stack: picks a decoder from the filename, probes
//! dimensions, asks the planner for geometry, applies rotation, clears the
//! viewport and runs the decode. Every failure becomes both an on-screen
//! overlay and a typed error for the caller.

extern crate alloc;

use embedded_graphics_core::geometry::Point;
use embedded_graphics_core::pixelcolor::{Rgb565, RgbColor};
use log::{info, warn};

use crate::bmp;
use crate::display::{DisplaySink, OverlayPosition, Rotation};
use crate::error::ImageError;
use crate::jpeg::JpegAdapter;
use crate::layout::{self, DisplayMode, RenderPlan};
use crate::storage::Storage;

/// Image format, decided by filename extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Unknown,
    Jpeg,
    Bmp,
}

/// Pipeline configuration. Mutated through the setters, consulted on
/// every render; nothing here is persisted across reboots.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Center the decoded image on the viewport.
    pub center_image: bool,
    /// Legacy flag kept for the control protocol; geometry is governed
    /// by `orientation_mode` instead.
    pub scale_to_fit: bool,
    /// Reserved: decoded-image caching is not implemented.
    pub cache_enabled: bool,
    pub orientation_mode: DisplayMode,
    /// Allow the planner to rotate the panel for portrait images.
    pub auto_rotation: bool,
    /// Rotation most recently applied to the sink.
    pub current_rotation: Rotation,
}

impl PipelineConfig {
    const fn defaults() -> Self {
        Self {
            center_image: true,
            scale_to_fit: false,
            cache_enabled: false,
            orientation_mode: DisplayMode::SmartScale,
            auto_rotation: true,
            current_rotation: Rotation::Landscape,
        }
    }
}

/// The rendering pipeline. One instance per device.
pub struct ImagePipeline {
    initialized: bool,
    config: PipelineConfig,
    jpeg: JpegAdapter,
}

impl ImagePipeline {
    pub const fn new() -> Self {
        Self {
            initialized: false,
            config: PipelineConfig::defaults(),
            jpeg: JpegAdapter::new(),
        }
    }

    /// Reset configuration to defaults and arm the pipeline. Idempotent;
    /// calling it again just restores defaults.
    pub fn begin(&mut self) {
        self.config = PipelineConfig::defaults();
        self.jpeg = JpegAdapter::new();
        self.initialized = true;
        info!("pipeline: ready");
    }

    /// Classify a path by its extension, case-insensitively.
    pub fn detect_image_format(filename: &str) -> ImageFormat {
        let ext = match filename.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => return ImageFormat::Unknown,
        };
        if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") {
            ImageFormat::Jpeg
        } else if ext.eq_ignore_ascii_case("bmp") {
            ImageFormat::Bmp
        } else {
            ImageFormat::Unknown
        }
    }

    pub fn is_image_file(filename: &str) -> bool {
        Self::detect_image_format(filename) != ImageFormat::Unknown
    }

    /// Render one file onto the sink.
    ///
    /// Cheap argument checks run before the storage layer is touched.
    /// On success the basename is overlaid at the bottom of the screen;
    /// on failure the error text is shown instead and the error returned.
    pub fn display_image<F, D>(
        &mut self,
        storage: &mut F,
        sink: &mut D,
        filename: &str,
    ) -> Result<(), ImageError>
    where
        F: Storage,
        D: DisplaySink,
    {
        if !self.initialized {
            return Err(ImageError::NotInitialized);
        }
        if filename.is_empty() {
            sink.show_error("no file selected");
            return Err(ImageError::InvalidArgument("empty filename"));
        }

        sink.show_loading();

        let result = self.render(storage, sink, filename);
        match &result {
            Ok(()) => {
                let basename = filename.rsplit('/').next().unwrap_or(filename);
                sink.overlay_text(basename, OverlayPosition::Bottom);
                info!("pipeline: rendered {filename}");
            }
            Err(e) => {
                warn!("pipeline: {filename}: {e}");
                sink.show_error(&alloc::format!("{e}"));
            }
        }
        result
    }

    fn render<F, D>(
        &mut self,
        storage: &mut F,
        sink: &mut D,
        filename: &str,
    ) -> Result<(), ImageError>
    where
        F: Storage,
        D: DisplaySink,
    {
        let format = Self::detect_image_format(filename);
        if format == ImageFormat::Unknown {
            return Err(ImageError::UnsupportedFormat);
        }
        if !storage.exists(filename) {
            return Err(ImageError::Storage("file not found"));
        }
        let mut file = storage.open(filename).map_err(ImageError::Storage)?;

        match format {
            ImageFormat::Jpeg => {
                let (w, h) = self.jpeg.probe_size(&mut file)?;
                let plan = self.plan(sink, w, h);
                self.apply(sink, &plan);
                self.jpeg.set_scale(plan.scale);
                let r = self
                    .jpeg
                    .draw(&mut file, sink, Point::new(plan.x, plan.y));
                self.jpeg.set_scale(1);
                r.map_err(ImageError::from)
            }
            ImageFormat::Bmp => {
                let (w, h) = bmp::probe_size(&mut file)?;
                let plan = self.plan(sink, w, h);
                self.apply(sink, &plan);
                bmp::decode(&mut file, sink, &plan).map_err(ImageError::from)
            }
            ImageFormat::Unknown => unreachable!(),
        }
    }

    fn plan<D: DisplaySink>(&self, sink: &D, img_w: u16, img_h: u16) -> RenderPlan {
        // physical panel dimensions are rotation-independent
        let size = sink.size();
        let long = size.width.max(size.height) as u16;
        let short = size.width.min(size.height) as u16;
        layout::plan(
            img_w,
            img_h,
            long,
            short,
            self.config.orientation_mode,
            self.config.auto_rotation,
        )
    }

    // rotate the panel and clear the viewport before any tile lands
    fn apply<D: DisplaySink>(&mut self, sink: &mut D, plan: &RenderPlan) {
        sink.set_rotation(plan.rotation);
        self.config.current_rotation = plan.rotation;
        sink.fill_rect(Point::zero(), sink.size(), Rgb565::BLACK);
    }

    pub fn set_orientation_mode(&mut self, mode: DisplayMode) {
        self.config.orientation_mode = mode;
    }

    pub fn set_auto_rotation(&mut self, enabled: bool) {
        self.config.auto_rotation = enabled;
    }

    /// Legacy knob from the control protocol.
    pub fn set_display_mode(&mut self, center: bool, scale_to_fit: bool) {
        self.config.center_image = center;
        self.config.scale_to_fit = scale_to_fit;
    }

    pub fn enable_cache(&mut self, enabled: bool) {
        self.config.cache_enabled = enabled;
    }

    /// Byte order of the RGB565 tiles pushed during JPEG renders, for
    /// sinks that feed a big-endian bus without converting. Reset to
    /// native order by [`begin`](Self::begin).
    pub fn set_swap_bytes(&mut self, swap: bool) {
        self.jpeg.set_swap_bytes(swap);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Default for ImagePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::vec::Vec;

    use embedded_graphics_core::geometry::Size;
    use embedded_graphics_core::pixelcolor::IntoStorage;

    use super::*;
    use crate::storage::mem::MemStorage;

    #[derive(Default)]
    struct MockSink {
        rotation: Rotation,
        loading_shown: usize,
        errors: Vec<String>,
        overlays: Vec<(String, OverlayPosition)>,
        fills: usize,
        blocks: Vec<(Point, Size, Vec<u16>)>,
        pixels: Vec<(i32, i32, u16)>,
    }

    impl DisplaySink for MockSink {
        fn set_rotation(&mut self, rotation: Rotation) {
            self.rotation = rotation;
        }

        fn size(&self) -> Size {
            match self.rotation {
                Rotation::Landscape => Size::new(320, 240),
                Rotation::Portrait => Size::new(240, 320),
            }
        }

        fn draw_pixel(&mut self, p: Point, color: Rgb565) {
            let s = self.size();
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < s.width && (p.y as u32) < s.height {
                self.pixels.push((p.x, p.y, color.into_storage()));
            }
        }

        fn draw_block(&mut self, p: Point, size: Size, pixels: &[Rgb565]) {
            let raw = pixels.iter().map(|c| c.into_storage()).collect();
            self.blocks.push((p, size, raw));
        }

        fn fill_rect(&mut self, _p: Point, _size: Size, _color: Rgb565) {
            self.fills += 1;
        }

        fn show_loading(&mut self) {
            self.loading_shown += 1;
        }

        fn show_error(&mut self, message: &str) {
            self.errors.push(String::from(message));
        }

        fn overlay_text(&mut self, text: &str, position: OverlayPosition) {
            self.overlays.push((String::from(text), position));
        }
    }

    /// 2x2 24-bit BMP, rows stored bottom-up. Top row red/white, bottom
    /// row blue/green.
    fn tiny_bmp() -> Vec<u8> {
        let width: u32 = 2;
        let height: u32 = 2;
        let stride = 8u32;
        let data_size = stride * height;
        let mut v = Vec::new();
        v.extend(b"BM");
        v.extend((54 + data_size).to_le_bytes());
        v.extend([0u8; 4]);
        v.extend(54u32.to_le_bytes());
        v.extend(40u32.to_le_bytes());
        v.extend(width.to_le_bytes());
        v.extend((height as i32).to_le_bytes());
        v.extend(1u16.to_le_bytes());
        v.extend(24u16.to_le_bytes());
        v.extend(0u32.to_le_bytes());
        v.extend(data_size.to_le_bytes());
        v.extend([0u8; 16]);
        // bottom row: blue, green (BGR), padded to stride
        v.extend([0xFF, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00]);
        // top row: red, white
        v.extend([0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00]);
        v
    }

    fn pipeline() -> ImagePipeline {
        let mut p = ImagePipeline::new();
        p.begin();
        p
    }

    #[test]
    fn format_detection_is_case_insensitive() {
        assert_eq!(
            ImagePipeline::detect_image_format("Photo.JPG"),
            ImageFormat::Jpeg
        );
        assert_eq!(
            ImagePipeline::detect_image_format("a/b/c.jpeg"),
            ImageFormat::Jpeg
        );
        assert_eq!(ImagePipeline::detect_image_format("x.bmp"), ImageFormat::Bmp);
        assert_eq!(
            ImagePipeline::detect_image_format("x.gif"),
            ImageFormat::Unknown
        );
        assert_eq!(
            ImagePipeline::detect_image_format("no_extension"),
            ImageFormat::Unknown
        );
        assert!(ImagePipeline::is_image_file("x.BMP"));
        assert!(!ImagePipeline::is_image_file("x.txt"));
    }

    #[test]
    fn uninitialized_pipeline_rejects_without_touching_the_sink() {
        let mut p = ImagePipeline::new();
        let mut storage = MemStorage {
            name: "a.bmp",
            data: tiny_bmp(),
            queries: 0,
        };
        let mut sink = MockSink::default();
        let err = p.display_image(&mut storage, &mut sink, "a.bmp").unwrap_err();
        assert_eq!(err, ImageError::NotInitialized);
        assert_eq!(sink.loading_shown, 0);
        assert!(sink.errors.is_empty());
    }

    #[test]
    fn empty_filename_fails_before_any_storage_query() {
        let mut p = pipeline();
        let mut storage = MemStorage {
            name: "a.bmp",
            data: tiny_bmp(),
            queries: 0,
        };
        let mut sink = MockSink::default();
        let err = p.display_image(&mut storage, &mut sink, "").unwrap_err();
        assert_eq!(err, ImageError::InvalidArgument("empty filename"));
        assert_eq!(storage.queries, 0);
        assert_eq!(sink.errors.len(), 1);
    }

    #[test]
    fn unknown_extension_is_reported_on_screen() {
        let mut p = pipeline();
        let mut storage = MemStorage {
            name: "a.bmp",
            data: tiny_bmp(),
            queries: 0,
        };
        let mut sink = MockSink::default();
        let err = p.display_image(&mut storage, &mut sink, "movie.gif").unwrap_err();
        assert_eq!(err, ImageError::UnsupportedFormat);
        assert_eq!(sink.errors.as_slice(), ["unsupported image format"]);
    }

    #[test]
    fn missing_file_is_a_storage_error() {
        let mut p = pipeline();
        let mut storage = MemStorage {
            name: "a.bmp",
            data: tiny_bmp(),
            queries: 0,
        };
        let mut sink = MockSink::default();
        let err = p
            .display_image(&mut storage, &mut sink, "other.bmp")
            .unwrap_err();
        assert_eq!(err, ImageError::Storage("file not found"));
    }

    #[test]
    fn bmp_renders_end_to_end() {
        let mut p = pipeline();
        let mut storage = MemStorage {
            name: "pics/tiny.bmp",
            data: tiny_bmp(),
            queries: 0,
        };
        let mut sink = MockSink::default();
        p.display_image(&mut storage, &mut sink, "pics/tiny.bmp")
            .unwrap();

        assert_eq!(sink.loading_shown, 1);
        // viewport cleared once before the decode
        assert_eq!(sink.fills, 1);
        // 2x2 image centered on 320x240
        assert_eq!(sink.pixels.len(), 4);
        assert!(sink.pixels.contains(&(159, 119, 0xF800)));
        assert!(sink.pixels.contains(&(160, 119, 0xFFFF)));
        assert!(sink.pixels.contains(&(159, 120, 0x001F)));
        assert!(sink.pixels.contains(&(160, 120, 0x07E0)));
        // overlay carries the basename only
        assert_eq!(sink.overlays.len(), 1);
        assert_eq!(sink.overlays[0].0, "tiny.bmp");
        assert_eq!(sink.overlays[0].1, OverlayPosition::Bottom);
        assert!(sink.errors.is_empty());
        assert_eq!(p.config().current_rotation, Rotation::Landscape);
    }

    #[test]
    fn jpeg_renders_end_to_end() {
        let mut p = pipeline();
        let mut storage = MemStorage {
            name: "photos/grey.jpg",
            data: crate::jpeg::fixtures::tiny_gray_jpeg(),
            queries: 0,
        };
        let mut sink = MockSink::default();
        p.display_image(&mut storage, &mut sink, "photos/grey.jpg")
            .unwrap();

        assert_eq!(sink.loading_shown, 1);
        assert_eq!(sink.fills, 1);
        // one 8x8 MCU centered on 320x240
        assert_eq!(sink.blocks.len(), 1);
        let (at, size, raw) = &sink.blocks[0];
        assert_eq!((at.x, at.y), (156, 116));
        assert_eq!((size.width, size.height), (8, 8));
        assert!(raw.iter().all(|&c| c == 0x8410));
        assert_eq!(sink.overlays[0].0, "grey.jpg");
    }

    #[test]
    fn swap_bytes_reaches_the_jpeg_tiles() {
        let mut p = pipeline();
        p.set_swap_bytes(true);
        let mut storage = MemStorage {
            name: "grey.jpg",
            data: crate::jpeg::fixtures::tiny_gray_jpeg(),
            queries: 0,
        };
        let mut sink = MockSink::default();
        p.display_image(&mut storage, &mut sink, "grey.jpg").unwrap();
        assert!(sink.blocks[0].2.iter().all(|&c| c == 0x1084));

        // begin() restores native byte order
        p.begin();
        let mut sink = MockSink::default();
        p.display_image(&mut storage, &mut sink, "grey.jpg").unwrap();
        assert!(sink.blocks[0].2.iter().all(|&c| c == 0x8410));
    }

    #[test]
    fn decode_failure_surfaces_on_screen_and_in_the_result() {
        let mut data = tiny_bmp();
        data[28] = 16; // depth field
        let mut p = pipeline();
        let mut storage = MemStorage {
            name: "bad.bmp",
            data,
            queries: 0,
        };
        let mut sink = MockSink::default();
        let err = p.display_image(&mut storage, &mut sink, "bad.bmp").unwrap_err();
        assert!(matches!(err, ImageError::Bmp(_)));
        assert_eq!(sink.errors.as_slice(), ["unsupported BMP depth: 16 bpp"]);
        assert!(sink.overlays.is_empty());
    }

    #[test]
    fn setters_update_the_config() {
        let mut p = pipeline();
        p.set_orientation_mode(DisplayMode::CenterCrop);
        p.set_auto_rotation(false);
        p.set_display_mode(false, true);
        p.enable_cache(true);
        let c = p.config();
        assert_eq!(c.orientation_mode, DisplayMode::CenterCrop);
        assert!(!c.auto_rotation);
        assert!(!c.center_image);
        assert!(c.scale_to_fit);
        assert!(c.cache_enabled);
    }

    #[test]
    fn begin_restores_defaults() {
        let mut p = pipeline();
        p.set_orientation_mode(DisplayMode::AutoRotate);
        p.begin();
        assert_eq!(p.config().orientation_mode, DisplayMode::SmartScale);
        assert!(p.config().auto_rotation);
    }
}
