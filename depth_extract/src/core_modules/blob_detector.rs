// THEORY:
// The `blob_detector` is the spatial grouping engine. It labels the connected
// components of a binary foreground mask by breadth-first region growing and
// packages each one as a `Blob`.
//
// Key architectural principles & algorithm steps:
// 1.  **Seeding**: The mask is scanned in row-major order. Every foreground pixel
//     not yet visited seeds a new component, so labels are deterministic.
// 2.  **Region Growing**: From each seed the component expands through its
//     neighbours (4- or 8-connected, chosen by the caller) for as long as they are
//     foreground.
// 3.  **Data Aggregation**: The grown region's bounding box is collected along the
//     way and the result is packaged into a `Blob`.
// 4.  **Stateless Utility**: One mask in, the blobs of that mask out.

use crate::core_modules::blob::{Blob, Point};
use ndarray::{Array2, ArrayView2};

pub mod blob_detector {
    use super::*;

    /// Which neighbours count as connected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Connectivity {
        Four,
        Eight,
    }

    impl Connectivity {
        fn offsets(self) -> &'static [(isize, isize)] {
            match self {
                Connectivity::Four => &[(0, 1), (0, -1), (1, 0), (-1, 0)],
                Connectivity::Eight => &[
                    (0, 1),
                    (0, -1),
                    (1, 0),
                    (-1, 0),
                    (1, 1),
                    (1, -1),
                    (-1, 1),
                    (-1, -1),
                ],
            }
        }
    }

    /// Labels every connected component of `mask`.
    pub fn find_blobs(mask: ArrayView2<bool>, connectivity: Connectivity) -> Vec<Blob> {
        let (rows, cols) = mask.dim();
        let mut visited = Array2::from_elem((rows, cols), false);
        let mut blobs = Vec::new();

        for y in 0..rows {
            for x in 0..cols {
                if !mask[[y, x]] || visited[[y, x]] {
                    continue;
                }
                let blob = grow_blob(Point { x, y }, mask, &mut visited, connectivity, blobs.len());
                blobs.push(blob);
            }
        }
        blobs
    }

    /// The component with the most pixels. Ties go to the first in scan order.
    pub fn largest_blob(mask: ArrayView2<bool>, connectivity: Connectivity) -> Option<Blob> {
        find_blobs(mask, connectivity)
            .into_iter()
            .rev()
            .max_by_key(Blob::area)
    }

    /// Keeps only the largest component of `mask`; empty masks stay empty.
    pub fn largest_component_mask(mask: ArrayView2<bool>, connectivity: Connectivity) -> Array2<bool> {
        match largest_blob(mask, connectivity) {
            Some(blob) => blob.to_mask(mask.dim()),
            None => Array2::from_elem(mask.dim(), false),
        }
    }

    /// Breadth-first region growing from `seed`.
    fn grow_blob(
        seed: Point,
        mask: ArrayView2<bool>,
        visited: &mut Array2<bool>,
        connectivity: Connectivity,
        id: usize,
    ) -> Blob {
        let (rows, cols) = mask.dim();
        let mut pixels = Vec::new();
        let mut queue = std::collections::VecDeque::from([seed]);
        visited[[seed.y, seed.x]] = true;

        let (mut min_x, mut min_y) = (seed.x, seed.y);
        let (mut max_x, mut max_y) = (seed.x, seed.y);

        while let Some(current) = queue.pop_front() {
            pixels.push(current);
            min_x = min_x.min(current.x);
            min_y = min_y.min(current.y);
            max_x = max_x.max(current.x);
            max_y = max_y.max(current.y);

            for &(dx, dy) in connectivity.offsets() {
                let nx = current.x as isize + dx;
                let ny = current.y as isize + dy;
                if nx < 0 || ny < 0 || nx >= cols as isize || ny >= rows as isize {
                    continue;
                }
                let (nx, ny) = (nx as usize, ny as usize);
                if mask[[ny, nx]] && !visited[[ny, nx]] {
                    visited[[ny, nx]] = true;
                    queue.push_back(Point { x: nx, y: ny });
                }
            }
        }

        Blob {
            id,
            bounding_box: (Point { x: min_x, y: min_y }, Point { x: max_x, y: max_y }),
            pixels,
        }
    }
}
