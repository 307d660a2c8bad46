// THEORY:
// The convolution engine is the hot path of the service. It turns one immutable
// input matrix into a new output matrix of the same shape.
//
// Key architectural principles:
// 1.  **Read input, write output**: every output sample is computed from the
//     input matrix only. The output is never read while it is being built, so
//     there are no read-after-write hazards.
// 2.  **Static row partitioning**: rows are cut into a small, fixed number of
//     contiguous ranges. Each range owns a disjoint slice of the output buffer,
//     so partitions never contend and the output needs no lock. The final range
//     absorbs the remainder of the integer division.
// 3.  **Barrier before publication**: `map_rows` returns only after every
//     partition is done; a half-built matrix is never observable.
// 4.  **Zero-padding**: kernel taps that fall outside the matrix contribute
//     nothing. This darkens a one-pixel border under most kernels, and that
//     border is part of the observable behaviour.

use std::ops::Range;

use rayon::prelude::*;

use crate::core_modules::kernel::Kernel;
use crate::core_modules::pixel::pixel::{Pixel, saturate};
use crate::core_modules::pixel_matrix::PixelMatrix;

/// Splits `height` rows into at most `partitions` contiguous ranges.
pub fn row_partitions(height: usize, partitions: usize) -> Vec<Range<usize>> {
    let units = partitions.clamp(1, height.max(1));
    let rows_per_unit = height / units;

    (0..units)
        .map(|unit| {
            let start = unit * rows_per_unit;
            let end = if unit == units - 1 { height } else { start + rows_per_unit };
            start..end
        })
        .collect()
}

/// Convolves the colour channels of `input` with `kernel`. Alpha is copied
/// through unchanged.
pub fn apply(input: &PixelMatrix, kernel: &Kernel, partitions: usize) -> PixelMatrix {
    map_rows(input, partitions, |x, y| convolve_at(input, kernel, x, y))
}

/// Pointwise Rec. 601 grayscale, partitioned exactly like `apply`.
pub fn grayscale(input: &PixelMatrix, partitions: usize) -> PixelMatrix {
    map_rows(input, partitions, |x, y| input.get(x, y).grayscale())
}

/// Weighted sum of the kernel footprint centred on (x, y).
#[inline]
fn convolve_at(input: &PixelMatrix, kernel: &Kernel, x: usize, y: usize) -> Pixel {
    let offset = kernel.center() as isize;
    let (mut red, mut green, mut blue) = (0.0f64, 0.0f64, 0.0f64);

    for ky in 0..kernel.side() {
        let py = y as isize + ky as isize - offset;
        for kx in 0..kernel.side() {
            let px = x as isize + kx as isize - offset;
            if let Some(sample) = input.get_signed(px, py) {
                let weight = kernel.weight(ky, kx);
                red += sample.red as f64 * weight;
                green += sample.green as f64 * weight;
                blue += sample.blue as f64 * weight;
            }
        }
    }

    Pixel::new(saturate(red), saturate(green), saturate(blue), input.get(x, y).alpha)
}

/// Builds a new matrix by evaluating `per_pixel` for every coordinate, one
/// rayon task per row partition.
fn map_rows<F>(input: &PixelMatrix, partitions: usize, per_pixel: F) -> PixelMatrix
where
    F: Fn(usize, usize) -> Pixel + Sync,
{
    let (width, height) = (input.width(), input.height());
    let mut output = vec![Pixel::default(); width * height];
    if output.is_empty() {
        return PixelMatrix::filled(width, height, Pixel::default());
    }

    let fill = |rows: Range<usize>, slice: &mut [Pixel]| {
        for (row_offset, row) in slice.chunks_exact_mut(width).enumerate() {
            let y = rows.start + row_offset;
            for (x, out) in row.iter_mut().enumerate() {
                *out = per_pixel(x, y);
            }
        }
    };

    let ranges = row_partitions(height, partitions);
    if ranges.len() == 1 {
        fill(0..height, &mut output);
    } else {
        split_rows(&mut output, width, ranges)
            .into_par_iter()
            .for_each(|(rows, slice)| fill(rows, slice));
    }

    PixelMatrix::from_buffer(width, height, output)
}

/// Hands out one disjoint mutable slice of `output` per row range.
fn split_rows(output: &mut [Pixel], width: usize, ranges: Vec<Range<usize>>) -> Vec<(Range<usize>, &mut [Pixel])> {
    let mut rest = output;
    let mut parts = Vec::with_capacity(ranges.len());
    for rows in ranges {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(rows.len() * width);
        parts.push((rows, head));
        rest = tail;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::kernel::Kernel;

    fn sample_matrix(width: usize, height: usize) -> PixelMatrix {
        let pixels = (0..width * height)
            .map(|i| {
                Pixel::new(
                    (i * 37 % 256) as u8,
                    (i * 91 % 256) as u8,
                    (i * 53 % 256) as u8,
                    (i * 17 % 256) as u8,
                )
            })
            .collect();
        PixelMatrix::new(width, height, pixels).unwrap()
    }

    fn all_kernels() -> Vec<Kernel> {
        vec![Kernel::edge_detection(), Kernel::sharpen(), Kernel::gaussian_blur()]
    }

    #[test]
    fn partitions_cover_every_row_once() {
        for height in [0usize, 1, 2, 7, 10, 101] {
            for parts in [0usize, 1, 3, 4, 16, 500] {
                let ranges = row_partitions(height, parts);
                assert!(!ranges.is_empty());
                assert_eq!(ranges.first().unwrap().start, 0);
                assert_eq!(ranges.last().unwrap().end, height);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
            }
        }
    }

    #[test]
    fn last_partition_absorbs_the_remainder() {
        assert_eq!(row_partitions(10, 4), vec![0..2, 2..4, 4..6, 6..10]);
        assert_eq!(row_partitions(3, 8), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn partition_count_does_not_change_the_result() {
        let input = sample_matrix(13, 11);
        for kernel in all_kernels() {
            let reference = apply(&input, &kernel, 1);
            for parts in [2, 3, 4, 5, 11, 64] {
                assert_eq!(apply(&input, &kernel, parts), reference, "partitions = {parts}");
            }
        }
        let reference = grayscale(&input, 1);
        for parts in [2, 3, 7] {
            assert_eq!(grayscale(&input, parts), reference);
        }
    }

    #[test]
    fn edge_detection_on_single_pixel_is_zero_padded() {
        let input = PixelMatrix::filled(1, 1, Pixel::new(10, 20, 40, 77));
        let output = apply(&input, &Kernel::edge_detection(), 4);
        assert_eq!(output.get(0, 0), Pixel::new(80, 160, 255, 77));
    }

    #[test]
    fn alpha_is_preserved_for_every_kernel() {
        let input = sample_matrix(9, 6);
        for kernel in all_kernels() {
            let output = apply(&input, &kernel, 3);
            for y in 0..input.height() {
                for x in 0..input.width() {
                    assert_eq!(output.get(x, y).alpha, input.get(x, y).alpha);
                }
            }
        }
    }

    #[test]
    fn dimensions_are_preserved() {
        let input = sample_matrix(5, 8);
        let output = apply(&input, &Kernel::gaussian_blur(), 4);
        assert_eq!((output.width(), output.height()), (5, 8));
        let gray = grayscale(&input, 4);
        assert_eq!((gray.width(), gray.height()), (5, 8));
    }

    #[test]
    fn sums_saturate_at_both_ends() {
        // Centre 50 surrounded by 100s: 8*50 - 8*100 = -400 -> 0.
        let mut rows = vec![vec![Pixel::new(100, 100, 100, 255); 3]; 3];
        rows[1][1] = Pixel::new(50, 50, 50, 255);
        let input = PixelMatrix::from_rows(rows).unwrap();
        let output = apply(&input, &Kernel::edge_detection(), 1);
        assert_eq!(output.get(1, 1), Pixel::new(0, 0, 0, 255));

        // Sharpen on a flat 60 field: 5*60 - 4*60 = 60 in the interior, corner
        // has two missing neighbours: 5*60 - 2*60 = 180, edge: 5*60 - 3*60 = 120.
        let flat = PixelMatrix::filled(3, 3, Pixel::new(60, 60, 60, 255));
        let sharpened = apply(&flat, &Kernel::sharpen(), 2);
        assert_eq!(sharpened.get(1, 1).red, 60);
        assert_eq!(sharpened.get(0, 0).red, 180);
        assert_eq!(sharpened.get(1, 0).red, 120);

        // Sharpen on a bright corner pixel overflows: 5*200 - 2*0 -> 255.
        let mut rows = vec![vec![Pixel::new(0, 0, 0, 255); 3]; 3];
        rows[0][0] = Pixel::new(200, 200, 200, 255);
        let spike = apply(&PixelMatrix::from_rows(rows).unwrap(), &Kernel::sharpen(), 1);
        assert_eq!(spike.get(0, 0).red, 255);
    }

    #[test]
    fn blur_of_a_flat_field_darkens_only_the_border() {
        let input = PixelMatrix::filled(4, 4, Pixel::new(160, 160, 160, 255));
        let output = apply(&input, &Kernel::gaussian_blur(), 2);
        assert_eq!(output.get(1, 1).red, 160);
        assert_eq!(output.get(2, 2).red, 160);
        // Corner keeps 4+2+2+1 = 9 of 16 parts: 160 * 9/16 = 90.
        assert_eq!(output.get(0, 0).red, 90);
        // Edge keeps 12 of 16 parts: 120.
        assert_eq!(output.get(1, 0).red, 120);
    }

    #[test]
    fn input_is_left_untouched() {
        let input = sample_matrix(6, 6);
        let snapshot = input.clone();
        let _ = apply(&input, &Kernel::sharpen(), 3);
        assert_eq!(input, snapshot);
    }

    #[test]
    fn empty_matrix_stays_empty() {
        let input = PixelMatrix::from_rows(Vec::new()).unwrap();
        let output = apply(&input, &Kernel::sharpen(), 4);
        assert!(output.is_empty());
    }

    #[test]
    fn grayscale_matches_luma_exactly() {
        let input = PixelMatrix::filled(2, 3, Pixel::new(200, 100, 50, 255));
        let output = grayscale(&input, 2);
        assert!(output.pixels().iter().all(|p| *p == Pixel::new(124, 124, 124, 255)));
    }
}
