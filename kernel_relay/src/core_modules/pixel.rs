// THEORY (Pixel):
// The `Pixel` module is the most fundamental unit of the filter engine. It is a
// "dumb" data container for one RGBA sample plus the single-pixel math the
// filters need. Anything that needs neighbours (convolution) belongs in the
// `convolution` module; anything that needs a whole image belongs in
// `pixel_matrix` or `codec`.
//
// What lives here:
// - Raw channels (RGBA, 8 bits each).
// - Rec. 601 luma, the weighting used by the grayscale filter.
// - Saturation of an accumulated channel sum back into the 0..=255 range.
//
// Alpha is never touched by a filter; helpers here take care to pass it through.

pub mod pixel {
    pub type Byte = u8;
    pub type Bytes = Vec<Byte>;
    pub type Channel = Byte;
    pub type Luminance = f64;

    pub const CHANNELS: usize = 4;

    const LUMA_RED: f64 = 0.299;
    const LUMA_GREEN: f64 = 0.587;
    const LUMA_BLUE: f64 = 0.114;

    /// A "dumb" data container representing a single RGBA pixel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Pixel {
        /// The red channel value (0-255).
        pub red: Channel,
        /// The green channel value (0-255).
        pub green: Channel,
        /// The blue channel value (0-255).
        pub blue: Channel,
        /// The alpha (transparency) channel value (0-255).
        pub alpha: Channel,
    }

    impl Pixel {
        pub const fn new(red: Channel, green: Channel, blue: Channel, alpha: Channel) -> Self {
            Pixel {
                red,
                green,
                blue,
                alpha,
            }
        }

        /// Rec. 601 luma over the 0..255 channels.
        pub fn luminance(&self) -> Luminance {
            LUMA_RED * self.red as f64 + LUMA_GREEN * self.green as f64 + LUMA_BLUE * self.blue as f64
        }

        /// The grayscale version of this pixel: luma truncated into every colour
        /// channel, alpha untouched.
        pub fn grayscale(&self) -> Pixel {
            let gray = saturate(self.luminance());
            Pixel::new(gray, gray, gray, self.alpha)
        }

        pub fn to_bytes(self) -> [Byte; CHANNELS] {
            [self.red, self.green, self.blue, self.alpha]
        }
    }

    /// Clamps an accumulated channel sum into 0..=255 and truncates the
    /// fractional part. NaN saturates to 0.
    pub fn saturate(value: f64) -> Channel {
        if value.is_nan() {
            return 0;
        }
        value.clamp(0.0, 255.0) as Channel
    }

    impl From<[Byte; CHANNELS]> for Pixel {
        fn from(bytes: [Byte; CHANNELS]) -> Self {
            Pixel::new(bytes[0], bytes[1], bytes[2], bytes[3])
        }
    }

    impl From<Pixel> for Bytes {
        fn from(pixel: Pixel) -> Self {
            pixel.to_bytes().to_vec()
        }
    }
}


// -----------------------------------------------------------------------------
// Glossary
//
// - Luma (Rec. 601): weighted sum 0.299 R + 0.587 G + 0.114 B of the
//   gamma-encoded channels. Not true luminance, but what the grayscale filter
//   is defined to produce.
//
// - Saturate: restrict a computed value to the representable 0..=255 range,
//   discarding the excess rather than wrapping.
