// pixframe: image rendering pipeline for a networked picture frame.
// color:    RGB888 -> RGB565 panel color conversion
// display:  panel abstraction (rotation, tiles, overlays)
// storage:  byte-source abstraction over the image store
// layout:   geometry planner (rotation, decimation, placement)
// bmp:      24-bit uncompressed BMP decoder, row streaming
// jpeg:     baseline JPEG decoder, MCU-tile streaming
// pipeline: top-level controller wiring it all together
// error:    error taxonomy shared across the pipeline

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bmp;
pub mod color;
pub mod display;
pub mod error;
pub mod jpeg;
pub mod layout;
pub mod pipeline;
pub mod storage;

pub use display::{DisplaySink, OverlayPosition, Rotation};
pub use error::{BmpError, ImageError, JpegError};
pub use jpeg::{JpegAdapter, TileAction};
pub use layout::{DisplayMode, ImageOrientation, RenderPlan, MAX_SCALE};
pub use pipeline::{ImageFormat, ImagePipeline, PipelineConfig};
pub use storage::{ImageSource, Storage};
