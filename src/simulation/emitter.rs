/*!
Lattice emitters for initial fluid volumes.

Particles are placed on a cubic lattice with the same spacing the particle mass is calibrated on
(`1.6 * particle_radius`), so a freshly emitted volume starts close to rest density. The lattice keeps
one particle radius of clearance to the shape surface and the leftover fraction of a step is split
evenly on both sides.
*/

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{floating_type_mod::FT, stages::LATTICE_SPACING_FACTOR, vec3f, V3};

/// Number of lattice points along an extent and the offset of the first one from the lower end.
fn lattice_axis(extent: FT, particle_radius: FT) -> (usize, FT) {
    let step = LATTICE_SPACING_FACTOR * particle_radius;
    let size = (extent - 2. * particle_radius) / step;
    if !(size > 0.) {
        return (1, extent / 2.);
    }
    let whole = size.floor();
    (whole as usize + 1, particle_radius + (size - whole) * step / 2.)
}

pub fn spawn_cube(center: V3, half_sizes: V3, particle_radius: FT) -> Vec<V3> {
    let step = LATTICE_SPACING_FACTOR * particle_radius;
    let (nx, ox) = lattice_axis(2. * half_sizes.x, particle_radius);
    let (ny, oy) = lattice_axis(2. * half_sizes.y, particle_radius);
    let (nz, oz) = lattice_axis(2. * half_sizes.z, particle_radius);
    let origin = center - half_sizes + vec3f(ox, oy, oz);

    let mut points = Vec::with_capacity(nx * ny * nz);
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                points.push(origin + vec3f(x as FT, y as FT, z as FT) * step);
            }
        }
    }
    points
}

/// Lattice points of the bounding cube whose particles lie completely inside the sphere.
pub fn spawn_sphere(center: V3, radius: FT, particle_radius: FT) -> Vec<V3> {
    spawn_cube(center, vec3f(radius, radius, radius), particle_radius)
        .into_iter()
        .filter(|p| (p - center).norm() + particle_radius <= radius)
        .collect()
}

/// A single layer disc perpendicular to `axis` (0 = x, 1 = y, 2 = z).
pub fn spawn_disc(center: V3, radius: FT, axis: usize, particle_radius: FT) -> Vec<V3> {
    let mut half_sizes = vec3f(radius, radius, radius);
    half_sizes[axis] = particle_radius;
    spawn_cube(center, half_sizes, particle_radius)
        .into_iter()
        .filter(|p| {
            let mut offset = p - center;
            offset[axis] = 0.;
            offset.norm() + particle_radius <= radius
        })
        .collect()
}

/// Moves every point by a uniform random offset in `[-amplitude, amplitude)` per axis. Reproducible for a seed.
pub fn jitter(points: &mut [V3], amplitude: FT, seed: u64) {
    if amplitude <= 0. {
        return;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    for p in points {
        for d in 0..3 {
            p[d] += rng.gen_range(-amplitude..amplitude);
        }
    }
}

/// Emitter description as it appears in scene files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Emitter {
    Cube {
        center: V3,
        half_sizes: V3,
        #[serde(default)]
        velocity: Option<V3>,
    },
    Sphere {
        center: V3,
        radius: FT,
        #[serde(default)]
        velocity: Option<V3>,
    },
    Disc {
        center: V3,
        radius: FT,
        axis: usize,
        #[serde(default)]
        velocity: Option<V3>,
    },
}

impl Emitter {
    pub fn positions(&self, particle_radius: FT) -> Vec<V3> {
        match *self {
            Emitter::Cube { center, half_sizes, .. } => spawn_cube(center, half_sizes, particle_radius),
            Emitter::Sphere { center, radius, .. } => spawn_sphere(center, radius, particle_radius),
            Emitter::Disc {
                center, radius, axis, ..
            } => spawn_disc(center, radius, axis.min(2), particle_radius),
        }
    }

    pub fn velocity(&self) -> V3 {
        let velocity = match self {
            Emitter::Cube { velocity, .. } | Emitter::Sphere { velocity, .. } | Emitter::Disc { velocity, .. } => *velocity,
        };
        velocity.unwrap_or_else(V3::zeros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_ft_approx_eq, assert_v3_approx_eq};

    #[test]
    fn cube_lattice_is_centered() {
        let r = 0.017;
        let center = vec3f(0.3, -0.2, 0.1);
        let points = spawn_cube(center, vec3f(0.05, 0.1, 0.05), r);

        // (0.1 - 0.034) / 0.0272 = 2.43 -> 3 points, (0.2 - 0.034) / 0.0272 = 6.1 -> 7 points
        assert_eq!(points.len(), 3 * 7 * 3);

        let mean = points.iter().fold(V3::zeros(), |acc, p| acc + p) / points.len() as FT;
        assert_v3_approx_eq(mean, center, 1e-5, || format!("lattice center"));
        for p in &points {
            let local = p - center;
            assert!(local.x.abs() + r <= 0.05 + 1e-5);
            assert!(local.y.abs() + r <= 0.1 + 1e-5);
        }
    }

    #[test]
    fn tiny_cube_still_gets_one_particle() {
        let points = spawn_cube(vec3f(0.5, 0.5, 0.5), vec3f(0.001, 0.001, 0.001), 0.017);
        assert_eq!(points.len(), 1);
        assert_v3_approx_eq(points[0], vec3f(0.5, 0.5, 0.5), 1e-6, || format!("single particle"));
    }

    #[test]
    fn sphere_points_fit_inside() {
        let r = 0.017;
        let points = spawn_sphere(vec3f(0., 1., 0.), 0.1, r);
        assert!(!points.is_empty());
        assert!(points.len() < spawn_cube(vec3f(0., 1., 0.), vec3f(0.1, 0.1, 0.1), r).len());
        for p in &points {
            assert!((p - vec3f(0., 1., 0.)).norm() + r <= 0.1 + 1e-6);
        }
    }

    #[test]
    fn disc_is_a_single_layer() {
        let points = spawn_disc(vec3f(0., 0.5, 0.), 0.1, 1, 0.017);
        assert!(!points.is_empty());
        for p in &points {
            assert_ft_approx_eq(p.y, 0.5, 1e-6, || format!("disc layer height"));
        }
    }

    #[test]
    fn jitter_is_bounded_and_reproducible() {
        let base = spawn_cube(V3::zeros(), vec3f(0.05, 0.05, 0.05), 0.017);
        let mut a = base.clone();
        let mut b = base.clone();
        jitter(&mut a, 0.001, 7);
        jitter(&mut b, 0.001, 7);
        assert_eq!(a, b);
        assert_ne!(a, base);
        for (p, q) in a.iter().zip(&base) {
            assert!((p - q).amax() <= 0.001);
        }
    }

    #[test]
    fn scene_emitters_parse_from_yaml() {
        let yaml = "- shape: cube\n  center: [0.0, 0.0, 0.0]\n  half_sizes: [0.1, 0.1, 0.1]\n- shape: sphere\n  center: [0.0, 0.5, 0.0]\n  radius: 0.1\n  velocity: [0.0, -1.0, 0.0]\n";
        let emitters: Vec<Emitter> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(emitters.len(), 2);
        assert_eq!(emitters[0].velocity(), V3::zeros());
        assert_eq!(emitters[1].velocity(), vec3f(0., -1., 0.));
        assert!(!emitters[1].positions(0.017).is_empty());
    }
}
