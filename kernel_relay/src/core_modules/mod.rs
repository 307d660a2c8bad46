pub mod codec;
pub mod convolution;
pub mod kernel;
pub mod pixel;
pub mod pixel_matrix;
