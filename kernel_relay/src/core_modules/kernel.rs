// THEORY:
// The kernel catalog is the one place that knows what a filter id means. The
// wire protocols carry a bare integer; `resolve` turns it into a `FilterSpec` or
// rejects it. Nothing downstream re-validates ids.

use crate::error::FilterError;

/// An odd-sided square matrix of weights, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    side: usize,
    weights: Vec<f64>,
}

impl Kernel {
    pub fn new(side: usize, weights: Vec<f64>) -> Result<Self, FilterError> {
        if side % 2 == 0 {
            return Err(FilterError::InvalidKernel(format!("side must be odd, got {side}")));
        }
        if weights.len() != side * side {
            return Err(FilterError::InvalidKernel(format!(
                "a {side}x{side} kernel needs {} weights, got {}",
                side * side,
                weights.len()
            )));
        }
        Ok(Self { side, weights })
    }

    fn from_rows<const N: usize>(rows: [[f64; N]; N]) -> Self {
        debug_assert!(N % 2 == 1);
        Self {
            side: N,
            weights: rows.iter().flatten().copied().collect(),
        }
    }

    /// Laplacian-style edge detection: center 8, every neighbour -1.
    pub fn edge_detection() -> Self {
        Self::from_rows([[-1.0, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]])
    }

    /// Center 5, four-neighbours -1.
    pub fn sharpen() -> Self {
        Self::from_rows([[0.0, -1.0, 0.0], [-1.0, 5.0, -1.0], [0.0, -1.0, 0.0]])
    }

    /// 3x3 Gaussian approximation, weights summing to 1.
    pub fn gaussian_blur() -> Self {
        Self::from_rows([[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]].map(|row| row.map(|w| w / 16.0)))
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn center(&self) -> usize {
        self.side / 2
    }

    #[inline]
    pub fn weight(&self, row: usize, column: usize) -> f64 {
        self.weights[row * self.side + column]
    }
}

/// What a filter id resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    /// Pointwise Rec. 601 luma; not a convolution.
    Grayscale,
    Convolve { name: &'static str, kernel: Kernel },
}

impl FilterSpec {
    pub fn name(&self) -> &'static str {
        match self {
            FilterSpec::Grayscale => "grayscale",
            FilterSpec::Convolve { name, .. } => name,
        }
    }
}

/// The ids a client may ask for, with their names.
pub const CATALOG: [(i64, &str); 4] = [(1, "grayscale"), (2, "edge-detection"), (3, "sharpen"), (4, "gaussian-blur")];

/// Looks up a filter id.
pub fn resolve(id: i64) -> Result<FilterSpec, FilterError> {
    match id {
        1 => Ok(FilterSpec::Grayscale),
        2 => Ok(FilterSpec::Convolve {
            name: "edge-detection",
            kernel: Kernel::edge_detection(),
        }),
        3 => Ok(FilterSpec::Convolve {
            name: "sharpen",
            kernel: Kernel::sharpen(),
        }),
        4 => Ok(FilterSpec::Convolve {
            name: "gaussian-blur",
            kernel: Kernel::gaussian_blur(),
        }),
        other => Err(FilterError::UnknownFilter(other)),
    }
}
