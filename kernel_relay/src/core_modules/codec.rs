// THEORY:
// The codec module is the boundary between compressed containers and the
// `PixelMatrix` world. It treats the `image` crate as an opaque capability:
// bytes in, a rectangular grid of RGBA samples out, and back again.
//
// Key principles:
// 1.  **Sniff, don't trust names**: the container is detected from its magic
//     bytes, never from a file name supplied by a client.
// 2.  **Expand palettes up front**: GIF frames are expanded to full RGBA before
//     any filter sees them, and re-quantized on the way out. Quantization loss
//     is accepted.
// 3.  **Keep the animation envelope**: per-frame delay and offset, and the loop
//     count, survive a decode/encode cycle untouched.

use std::io::Cursor;
use std::path::Path;

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::error::{ParameterError, ParameterErrorKind};
use image::{AnimationDecoder, Delay, ExtendedColorType, Frame, ImageEncoder, ImageError, RgbaImage};

use crate::core_modules::pixel_matrix::PixelMatrix;
use crate::error::FilterError;

const JPEG_QUALITY: u8 = 90;
// 1 is the slowest, best-looking quantizer; 10 is the encoder's own recommended trade-off.
const GIF_QUANTIZER_SPEED: i32 = 10;
const NETSCAPE_APPLICATION: &[u8] = b"NETSCAPE2.0";

/// The container formats the service reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
}

impl ImageFormat {
    /// Picks a format from a path's extension (`.png`, `.jpg`/`.jpeg`, `.gif`).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FilterError> {
        let path = path.as_ref();
        match image::ImageFormat::from_path(path) {
            Ok(format) => Self::from_image_format(format),
            Err(_) => Err(FilterError::UnsupportedFormat(format!(
                "cannot infer an image format from {}",
                path.display()
            ))),
        }
    }

    fn from_image_format(format: image::ImageFormat) -> Result<Self, FilterError> {
        match format {
            image::ImageFormat::Png => Ok(ImageFormat::Png),
            image::ImageFormat::Jpeg => Ok(ImageFormat::Jpeg),
            image::ImageFormat::Gif => Ok(ImageFormat::Gif),
            other => Err(FilterError::UnsupportedFormat(format!("{other:?}"))),
        }
    }
}

/// How many times an animation plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Looping {
    Infinite,
    Finite(u16),
}

/// A single frame of an animation together with its timing and placement.
#[derive(Debug, Clone)]
pub struct AnimationFrame {
    pub matrix: PixelMatrix,
    pub delay: Delay,
    pub left: u32,
    pub top: u32,
}

/// An ordered sequence of frames plus the loop count, when the source had one.
#[derive(Debug, Clone)]
pub struct AnimatedImage {
    pub frames: Vec<AnimationFrame>,
    pub looping: Option<Looping>,
}

/// The result of decoding a container.
#[derive(Debug, Clone)]
pub enum DecodedImage {
    Still { matrix: PixelMatrix, format: ImageFormat },
    Animated(AnimatedImage),
}

impl DecodedImage {
    pub fn format(&self) -> ImageFormat {
        match self {
            DecodedImage::Still { format, .. } => *format,
            DecodedImage::Animated(_) => ImageFormat::Gif,
        }
    }
}

/// Decodes compressed bytes into pixel samples.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, FilterError> {
    let format = ImageFormat::from_image_format(image::guess_format(bytes).map_err(FilterError::Decode)?)?;

    match format {
        ImageFormat::Gif => decode_animation(bytes).map(DecodedImage::Animated),
        ImageFormat::Png | ImageFormat::Jpeg => {
            let image = image::load_from_memory_with_format(bytes, image::ImageFormat::from(format))
                .map_err(FilterError::Decode)?
                .into_rgba8();
            Ok(DecodedImage::Still {
                matrix: matrix_from_rgba(image)?,
                format,
            })
        }
    }
}

fn decode_animation(bytes: &[u8]) -> Result<AnimatedImage, FilterError> {
    let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(FilterError::Decode)?;
    let frames = decoder
        .into_frames()
        .collect_frames()
        .map_err(FilterError::Decode)?
        .into_iter()
        .enumerate()
        .map(|(index, frame)| {
            let delay = frame.delay();
            let (left, top) = (frame.left(), frame.top());
            let matrix = matrix_from_rgba(frame.into_buffer()).map_err(|source| FilterError::Frame {
                index,
                source: Box::new(source),
            })?;
            Ok(AnimationFrame {
                matrix,
                delay,
                left,
                top,
            })
        })
        .collect::<Result<Vec<_>, FilterError>>()?;

    Ok(AnimatedImage {
        frames,
        looping: loop_count(bytes),
    })
}

/// Encodes a single matrix into the requested container.
pub fn encode(matrix: &PixelMatrix, format: ImageFormat) -> Result<Vec<u8>, FilterError> {
    let (width, height) = encodable_dimensions(matrix)?;
    let mut buffer = Vec::new();

    match format {
        ImageFormat::Png => {
            PngEncoder::new(&mut buffer)
                .write_image(&matrix.to_rgba_bytes(), width, height, ExtendedColorType::Rgba8)
                .map_err(FilterError::Encode)?;
        }
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb: Vec<u8> = matrix
                .pixels()
                .iter()
                .flat_map(|pixel| [pixel.red, pixel.green, pixel.blue])
                .collect();
            JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
                .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
                .map_err(FilterError::Encode)?;
        }
        ImageFormat::Gif => {
            let frame = Frame::new(rgba_from_matrix(matrix)?);
            let mut encoder = GifEncoder::new_with_speed(&mut buffer, GIF_QUANTIZER_SPEED);
            encoder.encode_frame(frame).map_err(FilterError::Encode)?;
        }
    }

    Ok(buffer)
}

/// Encodes an animation as a GIF, re-quantizing every frame to a palette.
pub fn encode_animation(animation: &AnimatedImage) -> Result<Vec<u8>, FilterError> {
    if animation.frames.is_empty() {
        return Err(FilterError::Encode(dimension_error()));
    }

    let frames = animation
        .frames
        .iter()
        .map(|frame| {
            Ok(Frame::from_parts(
                rgba_from_matrix(&frame.matrix)?,
                frame.left,
                frame.top,
                frame.delay,
            ))
        })
        .collect::<Result<Vec<_>, FilterError>>()?;

    let mut buffer = Vec::new();
    {
        // The encoder writes the GIF trailer when it is dropped.
        let mut encoder = GifEncoder::new_with_speed(&mut buffer, GIF_QUANTIZER_SPEED);
        if let Some(looping) = animation.looping {
            let repeat = match looping {
                Looping::Infinite => Repeat::Infinite,
                Looping::Finite(count) => Repeat::Finite(count),
            };
            encoder.set_repeat(repeat).map_err(FilterError::Encode)?;
        }
        encoder.encode_frames(frames).map_err(FilterError::Encode)?;
    }
    Ok(buffer)
}

/// Reads the loop count from the NETSCAPE2.0 application extension, if any.
/// A stored count of zero means "loop forever".
fn loop_count(bytes: &[u8]) -> Option<Looping> {
    let start = bytes
        .windows(NETSCAPE_APPLICATION.len())
        .position(|window| window == NETSCAPE_APPLICATION)?;
    // Sub-block: size (3), id (1), count (u16 little endian).
    match bytes.get(start + NETSCAPE_APPLICATION.len()..start + NETSCAPE_APPLICATION.len() + 4)? {
        [3, 1, low, high] => match u16::from_le_bytes([*low, *high]) {
            0 => Some(Looping::Infinite),
            count => Some(Looping::Finite(count)),
        },
        _ => None,
    }
}

fn matrix_from_rgba(image: RgbaImage) -> Result<PixelMatrix, FilterError> {
    let (width, height) = image.dimensions();
    PixelMatrix::from_rgba_bytes(width as usize, height as usize, image.as_raw())
}

fn rgba_from_matrix(matrix: &PixelMatrix) -> Result<RgbaImage, FilterError> {
    let (width, height) = encodable_dimensions(matrix)?;
    RgbaImage::from_raw(width, height, matrix.to_rgba_bytes()).ok_or_else(|| FilterError::Encode(dimension_error()))
}

fn encodable_dimensions(matrix: &PixelMatrix) -> Result<(u32, u32), FilterError> {
    if matrix.is_empty() {
        return Err(FilterError::Encode(dimension_error()));
    }
    let width = u32::try_from(matrix.width()).map_err(|_| FilterError::Encode(dimension_error()))?;
    let height = u32::try_from(matrix.height()).map_err(|_| FilterError::Encode(dimension_error()))?;
    Ok((width, height))
}

fn dimension_error() -> ImageError {
    ImageError::Parameter(ParameterError::from_kind(ParameterErrorKind::DimensionMismatch))
}

impl From<ImageFormat> for image::ImageFormat {
    fn from(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Gif => image::ImageFormat::Gif,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::pixel::pixel::Pixel;

    fn gradient(width: usize, height: usize) -> PixelMatrix {
        let pixels = (0..width * height)
            .map(|i| Pixel::new((i * 7 % 256) as u8, (i * 13 % 256) as u8, (i * 29 % 256) as u8, (i * 3 % 256) as u8))
            .collect();
        PixelMatrix::new(width, height, pixels).unwrap()
    }

    #[test]
    fn png_round_trip_is_lossless() {
        let matrix = gradient(17, 9);
        let bytes = encode(&matrix, ImageFormat::Png).unwrap();
        match decode(&bytes).unwrap() {
            DecodedImage::Still { matrix: decoded, format } => {
                assert_eq!(format, ImageFormat::Png);
                assert_eq!(decoded, matrix);
            }
            other => panic!("expected a still image, got {other:?}"),
        }
    }

    #[test]
    fn jpeg_keeps_dimensions() {
        let matrix = PixelMatrix::filled(8, 5, Pixel::new(120, 60, 30, 255));
        let bytes = encode(&matrix, ImageFormat::Jpeg).unwrap();
        let DecodedImage::Still { matrix: decoded, format } = decode(&bytes).unwrap() else {
            panic!("expected a still image");
        };
        assert_eq!(format, ImageFormat::Jpeg);
        assert_eq!((decoded.width(), decoded.height()), (8, 5));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, FilterError::Decode(_)), "{err:?}");
    }

    #[test]
    fn truncated_png_fails_to_decode() {
        let bytes = encode(&gradient(4, 4), ImageFormat::Png).unwrap();
        let err = decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, FilterError::Decode(_)), "{err:?}");
    }

    #[test]
    fn bmp_is_recognized_but_unsupported() {
        let err = decode(b"BM\0\0\0\0\0\0\0\0\0\0\0\0").unwrap_err();
        assert!(matches!(err, FilterError::UnsupportedFormat(_)), "{err:?}");
    }

    #[test]
    fn empty_matrix_cannot_be_encoded() {
        let empty = PixelMatrix::from_rows(Vec::new()).unwrap();
        assert!(matches!(encode(&empty, ImageFormat::Png), Err(FilterError::Encode(_))));
    }

    #[test]
    fn format_from_path() {
        assert_eq!(ImageFormat::from_path("out/result.PNG").unwrap(), ImageFormat::Png);
        assert_eq!(ImageFormat::from_path("a.jpeg").unwrap(), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::from_path("a.gif").unwrap(), ImageFormat::Gif);
        assert!(matches!(ImageFormat::from_path("a.txt"), Err(FilterError::UnsupportedFormat(_))));
        assert!(matches!(ImageFormat::from_path("a.bmp"), Err(FilterError::UnsupportedFormat(_))));
    }

    #[test]
    fn animation_keeps_frames_delay_and_loop_count() {
        let delay = Delay::from_numer_denom_ms(100, 1);
        let animation = AnimatedImage {
            frames: vec![
                AnimationFrame {
                    matrix: PixelMatrix::filled(6, 4, Pixel::new(255, 0, 0, 255)),
                    delay,
                    left: 0,
                    top: 0,
                },
                AnimationFrame {
                    matrix: PixelMatrix::filled(6, 4, Pixel::new(0, 0, 255, 255)),
                    delay,
                    left: 0,
                    top: 0,
                },
            ],
            looping: Some(Looping::Finite(3)),
        };

        let bytes = encode_animation(&animation).unwrap();
        let DecodedImage::Animated(decoded) = decode(&bytes).unwrap() else {
            panic!("expected an animation");
        };
        assert_eq!(decoded.frames.len(), 2);
        assert_eq!(decoded.looping, Some(Looping::Finite(3)));
        for frame in &decoded.frames {
            assert_eq!(frame.delay.numer_denom_ms(), (100, 1));
            assert_eq!((frame.matrix.width(), frame.matrix.height()), (6, 4));
        }
    }

    #[test]
    fn infinite_loop_survives() {
        let animation = AnimatedImage {
            frames: vec![AnimationFrame {
                matrix: PixelMatrix::filled(2, 2, Pixel::new(0, 0, 0, 255)),
                delay: Delay::from_numer_denom_ms(50, 1),
                left: 0,
                top: 0,
            }],
            looping: Some(Looping::Infinite),
        };
        let bytes = encode_animation(&animation).unwrap();
        assert_eq!(loop_count(&bytes), Some(Looping::Infinite));
    }

    #[test]
    fn empty_animation_cannot_be_encoded() {
        let animation = AnimatedImage {
            frames: Vec::new(),
            looping: None,
        };
        assert!(matches!(encode_animation(&animation), Err(FilterError::Encode(_))));
    }

    #[test]
    fn loop_count_absent_without_extension() {
        assert_eq!(loop_count(b"GIF89a no extension here"), None);
    }
}
