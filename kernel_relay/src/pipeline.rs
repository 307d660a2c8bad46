// THEORY:
// The `pipeline` module is the top-level API of the filter engine. It takes a
// request (compressed bytes plus a filter id), runs every stage, and returns
// compressed bytes. Callers never touch kernels or matrices directly.
//
// The pipeline is stateless apart from its configuration. One instance is shared
// by every connection, so `process` takes `&self` and is safe to call from many
// threads at once.

use std::time::Instant;

use tracing::debug;

use crate::core_modules::codec::{self, AnimatedImage, AnimationFrame, DecodedImage, ImageFormat};
use crate::core_modules::convolution;
use crate::core_modules::kernel::{self, FilterSpec};
use crate::core_modules::pixel_matrix::PixelMatrix;
use crate::error::FilterError;

const DEFAULT_PARTITIONS: usize = 4;

/// Configuration for the FilterPipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Row partitions computed concurrently inside one filter call. This is the
    /// intra-request parallelism degree and has nothing to do with how many
    /// connections the server handles at once.
    pub partitions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
        }
    }
}

/// A client's upload: the image bytes and the filter to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub name: String,
    pub data: Vec<u8>,
    pub filter_id: i64,
}

/// The filtered image, under the name it was uploaded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResponse {
    pub name: String,
    pub data: Vec<u8>,
}

/// A decoded, filtered image that has not been re-encoded yet.
#[derive(Debug, Clone)]
pub struct FilteredImage {
    pub name: String,
    pub image: DecodedImage,
}

/// Which container a still image is written back as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    SameAsInput,
    Exactly(ImageFormat),
}

/// The main, top-level struct for the filter engine.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    config: PipelineConfig,
}

impl FilterPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Applies one filter to one matrix.
    pub fn apply(&self, spec: &FilterSpec, matrix: &PixelMatrix) -> PixelMatrix {
        match spec {
            FilterSpec::Grayscale => convolution::grayscale(matrix, self.config.partitions),
            FilterSpec::Convolve { kernel, .. } => convolution::apply(matrix, kernel, self.config.partitions),
        }
    }

    /// Applies one filter to every frame, keeping delay, offset and loop count.
    /// The first failing frame aborts the whole animation.
    pub fn apply_animation(&self, spec: &FilterSpec, animation: AnimatedImage) -> Result<AnimatedImage, FilterError> {
        let frames = animation
            .frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                self.apply_frame(spec, frame).map_err(|source| FilterError::Frame {
                    index,
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, FilterError>>()?;

        Ok(AnimatedImage {
            frames,
            looping: animation.looping,
        })
    }

    fn apply_frame(&self, spec: &FilterSpec, frame: AnimationFrame) -> Result<AnimationFrame, FilterError> {
        if frame.matrix.is_empty() {
            return Err(FilterError::InvalidMatrix("frame has no pixels".into()));
        }
        Ok(AnimationFrame {
            matrix: self.apply(spec, &frame.matrix),
            ..frame
        })
    }

    /// Runs a full request: resolve the filter, decode, filter, encode.
    pub fn process(&self, request: &ImageRequest, output: OutputFormat) -> Result<ImageResponse, FilterError> {
        let filtered = self.filter(request)?;
        self.encode(filtered, output)
    }

    /// The first half of `process`: everything up to, but not including,
    /// re-encoding.
    pub fn filter(&self, request: &ImageRequest) -> Result<FilteredImage, FilterError> {
        // Stage 1: Filter Resolution (cheapest check first)
        let spec = kernel::resolve(request.filter_id)?;

        // Stage 2: Decode
        let started = Instant::now();
        let decoded = codec::decode(&request.data)?;
        debug!(name = %request.name, format = ?decoded.format(), elapsed = ?started.elapsed(), "decoded");

        // Stage 3: Filter
        let started = Instant::now();
        let image = match decoded {
            DecodedImage::Still { matrix, format } => {
                let matrix = self.apply(&spec, &matrix);
                let partitions = self.config.partitions;
                debug!(filter = spec.name(), partitions, elapsed = ?started.elapsed(), "filtered");
                DecodedImage::Still { matrix, format }
            }
            DecodedImage::Animated(animation) => {
                let frames = animation.frames.len();
                let filtered = self.apply_animation(&spec, animation)?;
                debug!(filter = spec.name(), frames, elapsed = ?started.elapsed(), "filtered animation");
                DecodedImage::Animated(filtered)
            }
        };

        Ok(FilteredImage {
            name: request.name.clone(),
            image,
        })
    }

    /// The second half of `process`. Animations are always written as GIF;
    /// `output` only picks the container of a still image.
    pub fn encode(&self, filtered: FilteredImage, output: OutputFormat) -> Result<ImageResponse, FilterError> {
        // Stage 4: Encode
        let data = match filtered.image {
            DecodedImage::Still { matrix, format } => {
                let target = match output {
                    OutputFormat::SameAsInput => format,
                    OutputFormat::Exactly(format) => format,
                };
                codec::encode(&matrix, target)?
            }
            DecodedImage::Animated(animation) => codec::encode_animation(&animation)?,
        };

        Ok(ImageResponse {
            name: filtered.name,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::codec::Looping;
    use crate::core_modules::pixel::pixel::Pixel;
    use image::Delay;

    fn png_request(matrix: &PixelMatrix, filter_id: i64) -> ImageRequest {
        ImageRequest {
            name: "sample.png".into(),
            data: codec::encode(matrix, ImageFormat::Png).unwrap(),
            filter_id,
        }
    }

    fn decode_still(bytes: &[u8]) -> (PixelMatrix, ImageFormat) {
        match codec::decode(bytes).unwrap() {
            DecodedImage::Still { matrix, format } => (matrix, format),
            DecodedImage::Animated(_) => panic!("expected a still image"),
        }
    }

    #[test]
    fn grayscale_request_round_trips_through_png() {
        let input = PixelMatrix::filled(3, 2, Pixel::new(200, 100, 50, 255));
        let pipeline = FilterPipeline::default();
        let response = pipeline.process(&png_request(&input, 1), OutputFormat::SameAsInput).unwrap();

        assert_eq!(response.name, "sample.png");
        let (output, format) = decode_still(&response.data);
        assert_eq!(format, ImageFormat::Png);
        assert!(output.pixels().iter().all(|p| *p == Pixel::new(124, 124, 124, 255)));
    }

    #[test]
    fn every_catalog_filter_preserves_dimensions() {
        let input = PixelMatrix::filled(7, 5, Pixel::new(30, 60, 90, 200));
        let pipeline = FilterPipeline::new(PipelineConfig { partitions: 3 });
        for (id, _) in kernel::CATALOG {
            let response = pipeline.process(&png_request(&input, id), OutputFormat::SameAsInput).unwrap();
            let (output, _) = decode_still(&response.data);
            assert_eq!((output.width(), output.height()), (7, 5), "filter {id}");
        }
    }

    #[test]
    fn unknown_filter_produces_no_output() {
        let input = PixelMatrix::filled(2, 2, Pixel::new(1, 2, 3, 4));
        let err = FilterPipeline::default()
            .process(&png_request(&input, 99), OutputFormat::SameAsInput)
            .unwrap_err();
        assert!(matches!(err, FilterError::UnknownFilter(99)));
    }

    #[test]
    fn unknown_filter_is_reported_before_decoding() {
        let request = ImageRequest {
            name: "junk".into(),
            data: b"not an image".to_vec(),
            filter_id: 42,
        };
        let err = FilterPipeline::default().process(&request, OutputFormat::SameAsInput).unwrap_err();
        assert!(matches!(err, FilterError::UnknownFilter(42)));
    }

    #[test]
    fn corrupt_input_is_a_decode_error() {
        let request = ImageRequest {
            name: "junk".into(),
            data: b"not an image".to_vec(),
            filter_id: 2,
        };
        let err = FilterPipeline::default().process(&request, OutputFormat::SameAsInput).unwrap_err();
        assert!(matches!(err, FilterError::Decode(_)));
    }

    #[test]
    fn explicit_output_format_wins() {
        let input = PixelMatrix::filled(4, 4, Pixel::new(10, 20, 30, 255));
        let response = FilterPipeline::default()
            .process(&png_request(&input, 4), OutputFormat::Exactly(ImageFormat::Jpeg))
            .unwrap();
        let (_, format) = decode_still(&response.data);
        assert_eq!(format, ImageFormat::Jpeg);
    }

    #[test]
    fn animation_keeps_its_envelope() {
        let delay = Delay::from_numer_denom_ms(80, 1);
        let animation = AnimatedImage {
            frames: (0..3)
                .map(|i| AnimationFrame {
                    matrix: PixelMatrix::filled(5, 5, Pixel::new(40 * i, 90, 200, 255)),
                    delay,
                    left: 0,
                    top: 0,
                })
                .collect(),
            looping: Some(Looping::Infinite),
        };

        let filtered = FilterPipeline::default()
            .apply_animation(&FilterSpec::Grayscale, animation)
            .unwrap();
        assert_eq!(filtered.frames.len(), 3);
        assert_eq!(filtered.looping, Some(Looping::Infinite));
        for frame in &filtered.frames {
            assert_eq!(frame.delay.numer_denom_ms(), (80, 1));
            assert!(frame.matrix.pixels().iter().all(|p| p.red == p.green && p.green == p.blue));
        }
    }

    #[test]
    fn one_bad_frame_aborts_the_animation() {
        let good = AnimationFrame {
            matrix: PixelMatrix::filled(2, 2, Pixel::default()),
            delay: Delay::from_numer_denom_ms(10, 1),
            left: 0,
            top: 0,
        };
        let bad = AnimationFrame {
            matrix: PixelMatrix::from_rows(Vec::new()).unwrap(),
            ..good.clone()
        };
        let animation = AnimatedImage {
            frames: vec![good.clone(), bad, good],
            looping: None,
        };
        let err = FilterPipeline::default()
            .apply_animation(&FilterSpec::Grayscale, animation)
            .unwrap_err();
        assert!(matches!(err, FilterError::Frame { index: 1, .. }), "{err:?}");
    }

    #[test]
    fn gif_request_comes_back_animated() {
        let animation = AnimatedImage {
            frames: (0..2)
                .map(|i| AnimationFrame {
                    matrix: PixelMatrix::filled(4, 3, Pixel::new(250, 10 + 100 * i, 10, 255)),
                    delay: Delay::from_numer_denom_ms(120, 1),
                    left: 0,
                    top: 0,
                })
                .collect(),
            looping: Some(Looping::Finite(2)),
        };
        let request = ImageRequest {
            name: "clip.gif".into(),
            data: codec::encode_animation(&animation).unwrap(),
            filter_id: 3,
        };
        // Even an explicit still format keeps an animation as GIF.
        let response = FilterPipeline::default()
            .process(&request, OutputFormat::Exactly(ImageFormat::Png))
            .unwrap();
        let DecodedImage::Animated(decoded) = codec::decode(&response.data).unwrap() else {
            panic!("expected an animation");
        };
        assert_eq!(decoded.frames.len(), 2);
        assert_eq!(decoded.looping, Some(Looping::Finite(2)));
    }

    #[test]
    fn filter_then_encode_matches_process() {
        let input = PixelMatrix::filled(5, 4, Pixel::new(12, 140, 220, 255));
        let request = png_request(&input, 3);
        let pipeline = FilterPipeline::default();

        let filtered = pipeline.filter(&request).unwrap();
        assert_eq!(filtered.name, "sample.png");
        let DecodedImage::Still { matrix, format } = &filtered.image else {
            panic!("expected a still image");
        };
        assert_eq!(*format, ImageFormat::Png);
        assert_eq!(*matrix, pipeline.apply(&kernel::resolve(3).unwrap(), &input));

        let split = pipeline.encode(filtered, OutputFormat::SameAsInput).unwrap();
        let whole = pipeline.process(&request, OutputFormat::SameAsInput).unwrap();
        assert_eq!(split, whole);
    }
}
