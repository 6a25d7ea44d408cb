use std::collections::HashMap;

use tracing::warn;

use crate::{concurrency::ExecutionSurface, floating_type_mod::FT, V3, V3I};

/// Upper bound for the number of cells of the sorted grid. Larger domains get coarser cells.
pub const MAX_GRID_CELLS: usize = 1 << 22;

/**
 * Anything that can enumerate the neighbor candidates of a particle.
 *
 * All implementations report exactly the particles within the kernel radius of the committed
 * positions the structure was built from (the particle itself included).
 */
pub trait Neighborhood: Sync {
    fn for_each_neighbor<F: FnMut(usize)>(&self, i: usize, f: F);

    fn particle_count(&self) -> usize;
}

#[inline(always)]
pub fn cell_coordinates(position: V3, cell_size: FT) -> V3I {
    (position / cell_size).map(|x| x.floor() as i32)
}

#[inline(always)]
pub fn cell_hash(cell: V3I) -> i32 {
    541i32
        .wrapping_mul(cell.x)
        .wrapping_add(79i32.wrapping_mul(cell.y))
        .wrapping_add(31i32.wrapping_mul(cell.z))
}

/**
 * Uniform grid keyed by a hash of the integer cell coordinate.
 *
 * Distinct cells may share a hash; queries filter by exact distance, so a shared bucket only
 * costs time.
 */
pub struct HashedGrid {
    cell_size: FT,
    buckets: HashMap<i32, Vec<u32>>,
}

impl HashedGrid {
    pub fn new(cell_size: FT) -> Self {
        HashedGrid {
            cell_size,
            buckets: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> FT {
        self.cell_size
    }

    pub fn set_cell_size(&mut self, cell_size: FT) {
        self.cell_size = cell_size;
        self.clear();
    }

    pub fn build(&mut self, positions: &[V3]) {
        self.clear();
        for (i, &position) in positions.iter().enumerate() {
            let hash = cell_hash(cell_coordinates(position, self.cell_size));
            self.buckets.entry(hash).or_default().push(i as u32);
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Appends every particle with `|p - position|² <= radius²` to `out`.
    pub fn query(&self, positions: &[V3], position: V3, radius: FT, out: &mut Vec<u32>) {
        let lower = cell_coordinates(position.add_scalar(-radius), self.cell_size);
        let upper = cell_coordinates(position.add_scalar(radius), self.cell_size);
        let radius_sq = radius * radius;

        let mut visited: Vec<i32> = Vec::with_capacity(27);
        for z in lower.z..=upper.z {
            for y in lower.y..=upper.y {
                for x in lower.x..=upper.x {
                    let hash = cell_hash(V3I::new(x, y, z));
                    if visited.contains(&hash) {
                        continue;
                    }
                    visited.push(hash);

                    if let Some(bucket) = self.buckets.get(&hash) {
                        for &j in bucket {
                            if (positions[j as usize] - position).norm_squared() <= radius_sq {
                                out.push(j);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Explicit neighbor lists, one per particle.
pub struct NeighborhoodCache {
    neighs: Vec<Vec<u32>>,
}

impl NeighborhoodCache {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn iter<'a>(&'a self, i: usize) -> impl Iterator<Item = usize> + 'a {
        self.neighs[i].iter().map(|&x| x as usize)
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs[i].len()
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn clear(&mut self) {
        self.neighs.clear();
    }

    /// Rebuilds all lists by querying `grid`, which must have been built from `positions`.
    pub fn build_from_grid<E: ExecutionSurface>(
        &mut self,
        surface: &E,
        grid: &HashedGrid,
        positions: &[V3],
        radius: FT,
    ) {
        self.neighs.resize_with(positions.len(), Vec::new);

        surface.for_each(&mut self.neighs, |i, p_neighs| {
            p_neighs.clear();
            grid.query(positions, positions[i], radius, p_neighs);
        });
    }
}

impl Neighborhood for NeighborhoodCache {
    #[inline(always)]
    fn for_each_neighbor<F: FnMut(usize)>(&self, i: usize, mut f: F) {
        for &j in &self.neighs[i] {
            f(j as usize);
        }
    }

    fn particle_count(&self) -> usize {
        self.neighs.len()
    }
}

/// Bounds and resolution of the sorted cell grid, recomputed from the particle positions every step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    /// added to a position before dividing by the spacing (the negated minimum corner)
    pub offset: V3,
    pub spacing: FT,
    pub size: [u32; 3],
    pub cell_count: u32,
}

impl GridGeometry {
    /**
     * Covers the bounding box of `positions` with cells of at least `min_spacing`. If the box would
     * need more than `MAX_GRID_CELLS` cells the spacing grows until it fits; a 27-cell search stays exact
     * for any spacing not below the kernel radius.
     */
    pub fn from_positions<E: ExecutionSurface>(surface: &E, positions: &[V3], min_spacing: FT) -> GridGeometry {
        let (min, max) = surface.reduce(
            positions,
            || (V3::repeat(FT::MAX), V3::repeat(FT::MIN)),
            |(min_a, max_a), (min_b, max_b)| (min_a.inf(&min_b), max_a.sup(&max_b)),
            |_, &p| (p, p),
        );
        let (min, max) = if positions.is_empty() {
            (V3::zeros(), V3::zeros())
        } else {
            (min, max)
        };
        Self::from_bounds(min, max, min_spacing)
    }

    pub fn from_bounds(min: V3, max: V3, min_spacing: FT) -> GridGeometry {
        let extent = max - min;
        let mut spacing = min_spacing;

        let size_for = |spacing: FT| -> [u64; 3] {
            let mut size = [1u64; 3];
            for d in 0..3 {
                let cells = (extent[d] / spacing).floor();
                // the cast saturates for extents far beyond the cell budget
                size[d] = if cells.is_finite() && cells >= 0. {
                    (cells as u64).saturating_add(1)
                } else {
                    1
                };
            }
            size
        };

        let total = |size: [u64; 3]| size[0].saturating_mul(size[1]).saturating_mul(size[2]);

        let mut size = size_for(spacing);
        let mut coarsened = false;
        while total(size) > MAX_GRID_CELLS as u64 {
            let ratio = total(size) as FT / MAX_GRID_CELLS as FT;
            spacing *= ratio.cbrt().max(1.01);
            size = size_for(spacing);
            coarsened = true;
        }
        if coarsened {
            warn!(
                "particle domain too large for a {} cell grid, cell spacing raised from {} to {}",
                MAX_GRID_CELLS, min_spacing, spacing
            );
        }

        let size = [size[0] as u32, size[1] as u32, size[2] as u32];
        GridGeometry {
            offset: -min,
            spacing,
            size,
            cell_count: size[0] * size[1] * size[2],
        }
    }

    #[inline(always)]
    pub fn cell_of(&self, position: V3) -> [u32; 3] {
        let mut cell = [0u32; 3];
        for d in 0..3 {
            let c = ((position[d] + self.offset[d]) / self.spacing).floor();
            cell[d] = if c > 0. { (c as u32).min(self.size[d].saturating_sub(1)) } else { 0 };
        }
        cell
    }

    #[inline(always)]
    pub fn cell_index(&self, cell: [u32; 3]) -> u32 {
        cell[0] + self.size[0] * (cell[1] + self.size[1] * cell[2])
    }

    #[inline(always)]
    pub fn grid_index(&self, position: V3) -> u32 {
        self.cell_index(self.cell_of(position))
    }
}

/// Writes the cell index of every particle.
pub fn compute_grid_indices<E: ExecutionSurface>(
    surface: &E,
    geometry: &GridGeometry,
    positions: &[V3],
    grid_indices: &mut [u32],
) {
    surface.for_each(grid_indices, |i, grid_index| {
        *grid_index = geometry.grid_index(positions[i]);
    });
}

/// `cell_starts[c]` is the first sorted particle in cell `c`; the last entry is the particle count.
pub fn compute_cell_starts<E: ExecutionSurface>(surface: &E, sorted_grid_indices: &[u32], cell_starts: &mut [u32]) {
    let n = sorted_grid_indices.len() as u32;
    let cell_count = cell_starts.len().saturating_sub(1);
    surface.for_each(cell_starts, |c, start| {
        *start = if c == cell_count {
            n
        } else {
            sorted_grid_indices.partition_point(|&k| k < c as u32) as u32
        };
    });
}

/**
 * Neighbor search over particles that were physically reordered by cell index.
 *
 * The particles of cell `c` are the contiguous range `cell_starts[c]..cell_starts[c + 1]`.
 * Built from bulk primitives only: per particle index computation, a sort by key and a
 * per cell binary search.
 */
pub struct CellListView<'a> {
    pub geometry: GridGeometry,
    pub cell_starts: &'a [u32],
    pub positions: &'a [V3],
    pub radius: FT,
}

impl<'a> Neighborhood for CellListView<'a> {
    #[inline(always)]
    fn for_each_neighbor<F: FnMut(usize)>(&self, i: usize, mut f: F) {
        let position = self.positions[i];
        let cell = self.geometry.cell_of(position);
        let radius_sq = self.radius * self.radius;

        for dz in -1i64..=1 {
            let z = cell[2] as i64 + dz;
            if z < 0 || z >= self.geometry.size[2] as i64 {
                continue;
            }
            for dy in -1i64..=1 {
                let y = cell[1] as i64 + dy;
                if y < 0 || y >= self.geometry.size[1] as i64 {
                    continue;
                }
                for dx in -1i64..=1 {
                    let x = cell[0] as i64 + dx;
                    if x < 0 || x >= self.geometry.size[0] as i64 {
                        continue;
                    }
                    let c = self.geometry.cell_index([x as u32, y as u32, z as u32]) as usize;
                    for j in self.cell_starts[c]..self.cell_starts[c + 1] {
                        let j = j as usize;
                        if (self.positions[j] - position).norm_squared() <= radius_sq {
                            f(j);
                        }
                    }
                }
            }
        }
    }

    fn particle_count(&self) -> usize {
        self.positions.len()
    }
}

/**
 * Host side sorted cell list. Owns the reordering permutation so callers can apply it to all
 * of their particle columns.
 */
#[derive(Default)]
pub struct SortedCellGrid {
    pub geometry: Option<GridGeometry>,
    pub grid_indices: Vec<u32>,
    pub permutation: Vec<u32>,
    pub cell_starts: Vec<u32>,
}

impl SortedCellGrid {
    /// Computes the geometry, sorts the grid indices and returns the permutation
    /// (`sorted[i] = original[permutation[i]]`).
    pub fn build<E: ExecutionSurface>(&mut self, surface: &E, positions: &[V3], kernel_radius: FT) -> &[u32] {
        let geometry = GridGeometry::from_positions(surface, positions, kernel_radius);

        self.grid_indices.resize(positions.len(), 0);
        compute_grid_indices(surface, &geometry, positions, &mut self.grid_indices);

        self.permutation.clear();
        self.permutation.extend(0..positions.len() as u32);
        surface.sort_by_key(&mut self.grid_indices, &mut self.permutation);

        self.cell_starts.resize(geometry.cell_count as usize + 1, 0);
        compute_cell_starts(surface, &self.grid_indices, &mut self.cell_starts);

        self.geometry = Some(geometry);
        &self.permutation
    }

    pub fn view<'a>(&'a self, sorted_positions: &'a [V3], radius: FT) -> Option<CellListView<'a>> {
        self.geometry.map(|geometry| CellListView {
            geometry,
            cell_starts: &self.cell_starts,
            positions: sorted_positions,
            radius,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        concurrency::{ParallelSurface, SerialSurface},
        vec3f,
    };

    fn scattered_positions(n: usize) -> Vec<V3> {
        let mut state: u32 = 12345;
        let mut next = move || {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 8) as FT / (1u32 << 24) as FT
        };
        (0..n)
            .map(|_| vec3f(next() - 0.5, next() * 0.3, next() * 2. - 1.))
            .collect()
    }

    fn brute_force(positions: &[V3], i: usize, radius: FT) -> Vec<usize> {
        (0..positions.len())
            .filter(|&j| (positions[j] - positions[i]).norm_squared() <= radius * radius)
            .collect()
    }

    #[test]
    fn hashed_grid_matches_brute_force() {
        let positions = scattered_positions(800);
        let radius = 0.1;

        let mut grid = HashedGrid::new(radius);
        grid.build(&positions);

        let mut cache = NeighborhoodCache::new(0);
        cache.build_from_grid(&SerialSurface, &grid, &positions, radius);
        assert_eq!(cache.len(), positions.len());

        for i in 0..positions.len() {
            let mut found: Vec<usize> = cache.iter(i).collect();
            found.sort();
            assert_eq!(found, brute_force(&positions, i, radius), "particle {}", i);
        }
    }

    #[test]
    fn hashed_grid_query_with_larger_radius() {
        let positions = scattered_positions(300);
        let mut grid = HashedGrid::new(0.05);
        grid.build(&positions);

        let mut found = Vec::new();
        grid.query(&positions, positions[7], 0.2, &mut found);
        let mut found: Vec<usize> = found.into_iter().map(|j| j as usize).collect();
        found.sort();
        assert_eq!(found, brute_force(&positions, 7, 0.2));
    }

    #[test]
    fn sorted_cell_grid_matches_brute_force() {
        let positions = scattered_positions(2000);
        let radius = 0.08;

        let mut grid = SortedCellGrid::default();
        let permutation = grid.build(&ParallelSurface, &positions, radius).to_vec();

        let sorted: Vec<V3> = permutation.iter().map(|&p| positions[p as usize]).collect();
        let view = grid.view(&sorted, radius).unwrap();

        // cell starts are monotonic and cover all particles
        assert!(grid.cell_starts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*grid.cell_starts.last().unwrap() as usize, positions.len());

        for i in 0..sorted.len() {
            let mut found = Vec::new();
            view.for_each_neighbor(i, |j| found.push(permutation[j] as usize));
            found.sort();
            let original = permutation[i] as usize;
            assert_eq!(found, brute_force(&positions, original, radius), "particle {}", original);
        }
    }

    #[test]
    fn grid_geometry_is_coarsened_for_huge_domains() {
        let geometry = GridGeometry::from_bounds(vec3f(-100., -100., -100.), vec3f(100., 100., 100.), 0.01);
        assert!(geometry.cell_count as usize <= MAX_GRID_CELLS);
        assert!(geometry.spacing > 0.01);

        let far_corner = geometry.cell_of(vec3f(100., 100., 100.));
        for d in 0..3 {
            assert_eq!(far_corner[d], geometry.size[d] - 1);
        }
        assert_eq!(geometry.grid_index(vec3f(-100., -100., -100.)), 0);
    }

    #[test]
    fn far_outliers_keep_the_grid_in_budget() {
        for far in [1e19, 1e30, FT::MAX] {
            let geometry = GridGeometry::from_bounds(V3::zeros(), vec3f(far, 0., 0.), 0.04);
            assert!(geometry.size.iter().all(|&s| s >= 1));
            assert!(geometry.cell_count >= 1 && geometry.cell_count as usize <= MAX_GRID_CELLS);
            assert_eq!(geometry.grid_index(V3::zeros()), 0);
            assert_eq!(geometry.cell_of(vec3f(far, 0., 0.))[0], geometry.size[0] - 1);
        }

        let positions = vec![V3::zeros(), vec3f(0.01, 0., 0.), vec3f(1e19, 0., 0.)];
        let mut grid = SortedCellGrid::default();
        let permutation = grid.build(&SerialSurface, &positions, 0.04).to_vec();
        let sorted: Vec<V3> = permutation.iter().map(|&p| positions[p as usize]).collect();
        let view = grid.view(&sorted, 0.04).unwrap();
        for i in 0..sorted.len() {
            let mut found = Vec::new();
            view.for_each_neighbor(i, |j| found.push(permutation[j] as usize));
            found.sort();
            let original = permutation[i] as usize;
            assert_eq!(found, brute_force(&positions, original, 0.04), "particle {}", original);
        }
    }

    #[test]
    fn dense_clusters_keep_every_neighbor() {
        // all particles within one kernel radius of each other
        let n = 3000;
        let positions: Vec<V3> = (0..n)
            .map(|i| vec3f((i % 10) as FT, ((i / 10) % 10) as FT, (i / 100) as FT) * 1e-4)
            .collect();
        let radius = 0.0272;

        let mut grid = HashedGrid::new(radius);
        grid.build(&positions);
        let mut cache = NeighborhoodCache::new(n);
        cache.build_from_grid(&SerialSurface, &grid, &positions, radius);
        assert_eq!(cache.neighbor_count(0), n);
        assert_eq!(cache.neighbor_count(n - 1), n);

        let mut sorted_grid = SortedCellGrid::default();
        let permutation = sorted_grid.build(&ParallelSurface, &positions, radius).to_vec();
        let sorted: Vec<V3> = permutation.iter().map(|&p| positions[p as usize]).collect();
        let view = sorted_grid.view(&sorted, radius).unwrap();
        let mut count = 0;
        view.for_each_neighbor(0, |_| count += 1);
        assert_eq!(count, n);
    }

    #[test]
    fn single_particle_grid() {
        let positions = vec![vec3f(0.3, 0.3, 0.3)];
        let mut grid = SortedCellGrid::default();
        grid.build(&SerialSurface, &positions, 0.1);
        assert_eq!(grid.geometry.unwrap().cell_count, 1);
        assert_eq!(grid.cell_starts, vec![0, 1]);
    }
}
