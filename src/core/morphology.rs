//! Binary morphology and disk kernels for mask construction

use ndarray::{Array2, ArrayView2, Zip};

/// Binary dilation with the 4-connected cross, repeated `iterations` times
///
/// Pixels outside the image count as 0.
pub fn binary_dilation(mask: ArrayView2<u8>, iterations: usize) -> Array2<u8> {
    let (rows, cols) = mask.dim();
    let mut current = mask.mapv(|v| u8::from(v != 0));
    for _ in 0..iterations {
        let previous = current.clone();
        Zip::indexed(&mut current).for_each(|(r, c), out| {
            if *out == 1 {
                return;
            }
            let hit = (r > 0 && previous[[r - 1, c]] == 1)
                || (r + 1 < rows && previous[[r + 1, c]] == 1)
                || (c > 0 && previous[[r, c - 1]] == 1)
                || (c + 1 < cols && previous[[r, c + 1]] == 1);
            if hit {
                *out = 1;
            }
        });
    }
    current
}

/// Square minimum filter of side `2 * radius + 1`, reading `cval` outside the image
pub fn minimum_filter(mask: ArrayView2<u8>, radius: usize, cval: u8) -> Array2<u8> {
    if radius == 0 {
        return mask.to_owned();
    }
    let (rows, cols) = mask.dim();
    let r = radius as isize;

    // Separable: rows first, then columns
    let mut horizontal = Array2::<u8>::zeros((rows, cols));
    for i in 0..rows {
        for j in 0..cols {
            let mut m = u8::MAX;
            for dj in -r..=r {
                let jj = j as isize + dj;
                let v = if jj < 0 || jj >= cols as isize {
                    cval
                } else {
                    mask[[i, jj as usize]]
                };
                m = m.min(v);
            }
            horizontal[[i, j]] = m;
        }
    }

    let mut out = Array2::<u8>::zeros((rows, cols));
    for i in 0..rows {
        for j in 0..cols {
            let mut m = u8::MAX;
            for di in -r..=r {
                let ii = i as isize + di;
                let v = if ii < 0 || ii >= rows as isize {
                    cval
                } else {
                    horizontal[[ii as usize, j]]
                };
                m = m.min(v);
            }
            out[[i, j]] = m;
        }
    }
    out
}

/// Disk-shaped structuring element: offsets with `dx² + dy² <= radius²`
pub fn disk(radius: usize) -> Array2<bool> {
    let n = 2 * radius + 1;
    let r = radius as isize;
    Array2::from_shape_fn((n, n), |(i, j)| {
        let dy = i as isize - r;
        let dx = j as isize - r;
        dx * dx + dy * dy <= r * r
    })
}

fn reflect(index: isize, len: usize) -> usize {
    let n = len as isize;
    let mut i = index;
    // Edge pixel repeated: fedcba|abcdef|fedcba
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            return i as usize;
        }
    }
}

/// Mean over a disk of `radius`, with reflected borders
pub fn disk_average(values: ArrayView2<f32>, radius: usize) -> Array2<f32> {
    if radius == 0 {
        return values.to_owned();
    }
    let kernel = disk(radius);
    let offsets: Vec<(isize, isize)> = kernel
        .indexed_iter()
        .filter(|(_, inside)| **inside)
        .map(|((i, j), _)| (i as isize - radius as isize, j as isize - radius as isize))
        .collect();
    let weight = 1.0 / offsets.len() as f32;
    let (rows, cols) = values.dim();

    let mut out = Array2::<f32>::zeros((rows, cols));
    let average = |(r, c): (usize, usize), out: &mut f32| {
        let sum: f32 = offsets
            .iter()
            .map(|(dr, dc)| {
                values[[reflect(r as isize + dr, rows), reflect(c as isize + dc, cols)]]
            })
            .sum();
        *out = sum * weight;
    };

    #[cfg(feature = "parallel")]
    Zip::indexed(&mut out).par_for_each(average);
    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut out).for_each(average);

    out
}

/// Dilation with a disk of `radius`; pixels outside the image do not contribute
pub fn dilate_with_disk(mask: ArrayView2<u8>, radius: usize) -> Array2<u8> {
    if radius == 0 {
        return mask.mapv(|v| u8::from(v != 0));
    }
    let kernel = disk(radius);
    let r = radius as isize;
    let (rows, cols) = mask.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let hit = kernel.indexed_iter().any(|((ki, kj), inside)| {
            if !*inside {
                return false;
            }
            let ii = i as isize + ki as isize - r;
            let jj = j as isize + kj as isize - r;
            ii >= 0
                && jj >= 0
                && (ii as usize) < rows
                && (jj as usize) < cols
                && mask[[ii as usize, jj as usize]] != 0
        });
        u8::from(hit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_dilation_cross() {
        let mut mask = Array2::<u8>::zeros((5, 5));
        mask[[2, 2]] = 1;
        let once = binary_dilation(mask.view(), 1);
        assert_eq!(once.sum(), 5);
        assert_eq!(once[[1, 1]], 0);
        let twice = binary_dilation(mask.view(), 2);
        assert_eq!(twice.sum(), 13);
        assert_eq!(twice[[1, 1]], 1);
    }

    #[test]
    fn test_dilation_border_is_zero() {
        let mask = array![[1u8, 0, 0], [0, 0, 0]];
        let out = binary_dilation(mask.view(), 1);
        assert_eq!(out, array![[1u8, 1, 0], [1, 0, 0]]);
    }

    #[test]
    fn test_minimum_filter_erodes_from_land() {
        let water = array![
            [1u8, 1, 1, 1, 1],
            [1, 1, 1, 1, 1],
            [1, 1, 1, 1, 0],
            [1, 1, 1, 1, 1]
        ];
        let out = minimum_filter(water.view(), 1, 1);
        assert_eq!(
            out,
            array![
                [1u8, 1, 1, 1, 1],
                [1, 1, 1, 0, 0],
                [1, 1, 1, 0, 0],
                [1, 1, 1, 0, 0]
            ]
        );
    }

    #[test]
    fn test_minimum_filter_border_keeps_water() {
        let water = Array2::<u8>::ones((3, 3));
        assert_eq!(minimum_filter(water.view(), 2, 1), water);
    }

    #[test]
    fn test_disk_shape() {
        let d = disk(1);
        assert_eq!(d.iter().filter(|v| **v).count(), 5);
        let d = disk(2);
        assert_eq!(d.iter().filter(|v| **v).count(), 13);
    }

    #[test]
    fn test_disk_average_constant() {
        let values = Array2::<f32>::from_elem((4, 6), 0.3);
        let out = disk_average(values.view(), 2);
        for v in out.iter() {
            assert_relative_eq!(*v, 0.3, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_disk_average_reflects_border() {
        let values = array![[1.0f32, 0.0, 0.0]];
        let out = disk_average(values.view(), 1);
        // (0,0): self, left reflects to itself, right, up/down reflect to itself
        assert_relative_eq!(out[[0, 0]], 4.0 / 5.0, epsilon = 1e-6);
        assert_relative_eq!(out[[0, 1]], 1.0 / 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dilate_with_disk() {
        let mut mask = Array2::<u8>::zeros((5, 5));
        mask[[0, 0]] = 1;
        let out = dilate_with_disk(mask.view(), 1);
        assert_eq!(out.sum(), 3);
    }
}
