// THEORY:
// This file is the main entry point for the `kernel_relay` library crate.
// It exposes the filter engine as a small public API: the `FilterPipeline`
// and its data model (`ImageRequest`, `ImageResponse`, `PixelMatrix`, ...).
// The server crate consumes this API; it never reaches into the convolution
// internals directly.
//
// Layering, leaf to root:
//   pixel / pixel_matrix -> codec -> kernel -> convolution -> pipeline

pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use crate::core_modules::codec::{AnimatedImage, AnimationFrame, DecodedImage, ImageFormat, Looping};
pub use crate::core_modules::kernel::{FilterSpec, Kernel};
pub use crate::core_modules::pixel::pixel::Pixel;
pub use crate::core_modules::pixel_matrix::PixelMatrix;
pub use crate::error::FilterError;
pub use crate::pipeline::{FilterPipeline, FilteredImage, ImageRequest, ImageResponse, OutputFormat, PipelineConfig};
