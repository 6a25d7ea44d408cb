/*!
Per particle math of one simulation step.

Every function here is written once against an `ExecutionSurface` and a `Neighborhood`, so the serial
solver and the device program execute identical code. Within a stage a particle only writes its own
entries and only reads entries no other particle writes in the same stage.
*/

use crate::{
    collision::{resolve_collisions, StaticCollisionObject},
    concurrency::ExecutionSurface,
    floating_type_mod::FT,
    neighborhood_search::Neighborhood,
    simulation_parameters::SolverParams,
    sph_kernels::{KernelLookups, LookupTable},
    vec3f, V3,
};

/// Spacing of the synthetic calibration lattice (and of emitted particles) in particle radii.
pub const LATTICE_SPACING_FACTOR: FT = 1.6;

/// The calibration lattice spans `-LATTICE_HALF_EXTENT..=LATTICE_HALF_EXTENT` steps on each axis.
pub const LATTICE_HALF_EXTENT: i32 = 3;

/// Offsets of the 7x7x7 lattice around a particle at rest density, the center included.
pub fn calibration_lattice(particle_radius: FT) -> impl Iterator<Item = V3> {
    let step = LATTICE_SPACING_FACTOR * particle_radius;
    let r = LATTICE_HALF_EXTENT;
    (-r..=r).flat_map(move |i| {
        (-r..=r).flat_map(move |j| (-r..=r).map(move |k| vec3f(i as FT * step, j as FT * step, k as FT * step)))
    })
}

/// Mass for which a particle inside the calibration lattice has exactly `rest_density`.
pub fn calibrate_particle_mass(density_weight: LookupTable, particle_radius: FT, rest_density: FT) -> FT {
    let weighted_sum: FT = calibration_lattice(particle_radius)
        .map(|offset| density_weight.sample(offset.norm()))
        .sum();
    rest_density / weighted_sum
}

/**
 * Scalar mapping a density error to a pressure correction, derived from the pressure kernel gradients
 * over the calibration lattice: `delta = -1 / (beta * (-(Σ∇W)·(Σ∇W) - Σ(∇W·∇W)))` with
 * `beta = 2 (dt m / ρ0)²`. Returns `0` if the denominator vanishes.
 */
pub fn pcisph_delta(pressure_gradient: LookupTable, params: &SolverParams, time_step: FT) -> FT {
    let mut gradient_sum = V3::zeros();
    let mut gradient_dot_sum: FT = 0.;
    for offset in calibration_lattice(params.particle_radius) {
        let distance = offset.norm();
        if distance > 0. {
            let gradient = offset / distance * pressure_gradient.sample(distance);
            gradient_sum += gradient;
            gradient_dot_sum += gradient.dot(&gradient);
        }
    }

    let denominator = -gradient_sum.dot(&gradient_sum) - gradient_dot_sum;
    let beta = time_step * params.particle_mass / params.rest_density;
    let beta = 2. * beta * beta;

    let delta = -1. / (beta * denominator);
    if denominator != 0. && delta.is_finite() {
        delta
    } else {
        0.
    }
}

#[inline(always)]
fn is_finite(v: &V3) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// `ρᵢ = m Σⱼ W(|xᵢ - xⱼ|)` over all neighbors including the particle itself.
#[inline(always)]
fn density_at<N: Neighborhood>(i: usize, params: &SolverParams, lookups: &KernelLookups, neighs: &N, positions: &[V3]) -> FT {
    let x_i = positions[i];
    let mut weighted_sum: FT = 0.;
    neighs.for_each_neighbor(i, |j| {
        weighted_sum += lookups.density_weight.sample((positions[j] - x_i).norm());
    });
    params.particle_mass * weighted_sum
}

/**
 * Symmetric pressure gradient sum `Σⱼ dir(xᵢ - xⱼ) ∇W (Pᵢ/ρᵢ² + Pⱼ/ρⱼ²)` without the self term.
 * Contributions that are not finite (coincident particles, vanishing densities) are dropped.
 */
#[inline(always)]
fn pressure_gradient_sum<N: Neighborhood>(
    i: usize,
    lookups: &KernelLookups,
    neighs: &N,
    positions: &[V3],
    densities: &[FT],
    pressures: &[FT],
) -> V3 {
    let x_i = positions[i];
    let factor_i = pressures[i] / (densities[i] * densities[i]);

    let mut sum = V3::zeros();
    neighs.for_each_neighbor(i, |j| {
        if j == i {
            return;
        }
        let diff = x_i - positions[j];
        let distance = diff.norm();
        let factor_j = pressures[j] / (densities[j] * densities[j]);
        let contribution = diff / distance * (lookups.pressure_gradient.sample(distance) * (factor_i + factor_j));
        if is_finite(&contribution) {
            sum += contribution;
        }
    });
    sum
}

/// Pressure force from a gradient sum; a non-finite total becomes zero.
#[inline(always)]
fn pressure_force(gradient_sum: V3, particle_mass: FT, density: FT) -> V3 {
    let force = gradient_sum * -(particle_mass * density);
    if is_finite(&force) {
        force
    } else {
        V3::zeros()
    }
}

pub fn compute_density_pressure<E: ExecutionSurface, N: Neighborhood>(
    surface: &E,
    params: &SolverParams,
    lookups: &KernelLookups,
    neighs: &N,
    positions: &[V3],
    densities: &mut [FT],
    pressures: &mut [FT],
) {
    surface.for_each2(densities, pressures, |i, density, pressure| {
        *density = density_at(i, params, lookups, neighs, positions);
        *pressure = params.pressure_from_density(*density);
    });
}

/// Adds gravity, surface tension and viscosity to the accumulated forces.
pub fn accumulate_non_pressure_forces<E: ExecutionSurface, N: Neighborhood>(
    surface: &E,
    params: &SolverParams,
    lookups: &KernelLookups,
    neighs: &N,
    positions: &[V3],
    velocities: &[V3],
    densities: &[FT],
    forces: &mut [V3],
) {
    surface.for_each(forces, |i, force| {
        let x_i = positions[i];
        let v_i = velocities[i];

        let mut surface_normal = V3::zeros();
        let mut color_laplacian: FT = 0.;
        let mut viscosity_sum = V3::zeros();

        neighs.for_each_neighbor(i, |j| {
            let diff = x_i - positions[j];
            let distance = diff.norm();
            let inv_density_j = 1. / densities[j];

            let normal = diff * (lookups.density_gradient.sample(distance) * inv_density_j);
            let laplacian = lookups.density_laplacian.sample(distance) * inv_density_j;
            if is_finite(&normal) && laplacian.is_finite() {
                surface_normal += normal;
                color_laplacian += laplacian;
            }

            if j != i {
                let viscosity = (velocities[j] - v_i) * (inv_density_j * lookups.viscosity_laplacian.sample(distance));
                if is_finite(&viscosity) {
                    viscosity_sum += viscosity;
                }
            }
        });

        let gravity = params.gravity * densities[i];
        if is_finite(&gravity) {
            *force += gravity;
        }

        surface_normal *= params.particle_mass;
        let surface_normal_length = surface_normal.norm();
        if surface_normal_length > params.surface_tension_threshold {
            let tension = surface_normal / surface_normal_length
                * (-params.surface_tension * color_laplacian * params.particle_mass);
            if is_finite(&tension) {
                *force += tension;
            }
        }

        let viscosity = viscosity_sum * (params.viscosity * params.particle_mass);
        if is_finite(&viscosity) {
            *force += viscosity;
        }
    });
}

pub fn accumulate_pressure_forces<E: ExecutionSurface, N: Neighborhood>(
    surface: &E,
    params: &SolverParams,
    lookups: &KernelLookups,
    neighs: &N,
    positions: &[V3],
    densities: &[FT],
    pressures: &[FT],
    forces: &mut [V3],
) {
    surface.for_each(forces, |i, force| {
        let gradient_sum = pressure_gradient_sum(i, lookups, neighs, positions, densities, pressures);
        *force += pressure_force(gradient_sum, params.particle_mass, densities[i]);
    });
}

#[inline(always)]
fn acceleration(force: V3, density: FT) -> V3 {
    if density > 0. {
        force / density
    } else {
        V3::zeros()
    }
}

/**
 * Leapfrog kick and drift. The first integration of a particle derives its half step velocity
 * from the full velocity (`v - a dt/2`). Accumulated forces are cleared afterwards.
 */
pub fn integrate<E: ExecutionSurface>(
    surface: &E,
    time_step: FT,
    velocities: &[V3],
    densities: &[FT],
    positions: &mut [V3],
    half_velocities: &mut [V3],
    old_half_velocities: &mut [V3],
    first_step: &mut [bool],
    forces: &mut [V3],
) {
    {
        let forces: &[V3] = forces;
        surface.for_each4(
            positions,
            half_velocities,
            old_half_velocities,
            first_step,
            |i, position, half_velocity, old_half_velocity, first| {
                let a = acceleration(forces[i], densities[i]);
                if *first {
                    *half_velocity = velocities[i] - a * (time_step / 2.);
                    *first = false;
                }

                *old_half_velocity = *half_velocity;
                *half_velocity += a * time_step;
                *position += *half_velocity * time_step;
            },
        );
    }

    surface.for_each(forces, |_, force| {
        *force = V3::zeros();
    });
}

/// Resolves positions and half step velocities against all objects, then averages the full velocity.
pub fn handle_collisions<E: ExecutionSurface>(
    surface: &E,
    params: &SolverParams,
    objects: &[StaticCollisionObject],
    old_half_velocities: &[V3],
    positions: &mut [V3],
    half_velocities: &mut [V3],
    velocities: &mut [V3],
) {
    surface.for_each3(positions, half_velocities, velocities, |i, position, half_velocity, velocity| {
        resolve_collisions(
            objects,
            position,
            half_velocity,
            params.particle_radius,
            params.restitution,
            params.friction,
        );
        *velocity = (old_half_velocities[i] + *half_velocity) / 2.;
    });
}

pub fn pci_init<E: ExecutionSurface>(surface: &E, pressures: &mut [FT], predicted_pressure_forces: &mut [V3]) {
    surface.for_each2(pressures, predicted_pressure_forces, |_, pressure, predicted_pressure_force| {
        *pressure = 0.;
        *predicted_pressure_force = V3::zeros();
    });
}

/// Predicts half step velocity and position from the accumulated and the predicted pressure force.
/// The committed state is left untouched.
pub fn pci_predict<E: ExecutionSurface>(
    surface: &E,
    time_step: FT,
    positions: &[V3],
    velocities: &[V3],
    half_velocities: &[V3],
    forces: &[V3],
    predicted_pressure_forces: &[V3],
    densities: &[FT],
    first_step: &[bool],
    predicted_positions: &mut [V3],
    predicted_half_velocities: &mut [V3],
) {
    surface.for_each2(
        predicted_positions,
        predicted_half_velocities,
        |i, predicted_position, predicted_half_velocity| {
            let a = acceleration(forces[i] + predicted_pressure_forces[i], densities[i]);
            let half_velocity = if first_step[i] {
                velocities[i] - a * (time_step / 2.)
            } else {
                half_velocities[i]
            };

            *predicted_half_velocity = half_velocity + a * time_step;
            *predicted_position = positions[i] + *predicted_half_velocity * time_step;
        },
    );
}

/// Collision handling on the prediction, with the committed restitution and friction.
pub fn pci_handle_collisions<E: ExecutionSurface>(
    surface: &E,
    params: &SolverParams,
    objects: &[StaticCollisionObject],
    predicted_positions: &mut [V3],
    predicted_half_velocities: &mut [V3],
) {
    surface.for_each2(
        predicted_positions,
        predicted_half_velocities,
        |_, predicted_position, predicted_half_velocity| {
            resolve_collisions(
                objects,
                predicted_position,
                predicted_half_velocity,
                params.particle_radius,
                params.restitution,
                params.friction,
            );
        },
    );
}

/**
 * Density at the predicted positions and the pressure correction it implies. Negative corrections
 * (and their density errors) are damped by the negative pressure factor.
 */
pub fn pci_density_pressure<E: ExecutionSurface, N: Neighborhood>(
    surface: &E,
    params: &SolverParams,
    lookups: &KernelLookups,
    neighs: &N,
    predicted_positions: &[V3],
    predicted_densities: &mut [FT],
    density_errors: &mut [FT],
    pressures: &mut [FT],
) {
    surface.for_each3(
        predicted_densities,
        density_errors,
        pressures,
        |i, predicted_density, density_error, pressure| {
            *predicted_density = density_at(i, params, lookups, neighs, predicted_positions);

            let mut error = *predicted_density - params.rest_density;
            let mut correction = params.pcisph_delta * error;
            if correction < 0. {
                error *= params.negative_pressure_factor;
                correction *= params.negative_pressure_factor;
            }

            *density_error = error;
            *pressure += correction;
        },
    );
}

/// Symmetric pressure force at the predicted positions, scaled by the committed density.
pub fn pci_pressure_force<E: ExecutionSurface, N: Neighborhood>(
    surface: &E,
    params: &SolverParams,
    lookups: &KernelLookups,
    neighs: &N,
    predicted_positions: &[V3],
    predicted_densities: &[FT],
    pressures: &[FT],
    densities: &[FT],
    predicted_pressure_forces: &mut [V3],
) {
    surface.for_each(predicted_pressure_forces, |i, predicted_pressure_force| {
        let gradient_sum = pressure_gradient_sum(i, lookups, neighs, predicted_positions, predicted_densities, pressures);
        *predicted_pressure_force = pressure_force(gradient_sum, params.particle_mass, densities[i]);
    });
}

pub fn max_density_error<E: ExecutionSurface>(surface: &E, density_errors: &[FT]) -> FT {
    surface.reduce(density_errors, || 0., FT::max, |_, e| e.abs())
}

pub fn pci_add_pressure_force<E: ExecutionSurface>(surface: &E, predicted_pressure_forces: &[V3], forces: &mut [V3]) {
    surface.for_each(forces, |i, force| {
        *force += predicted_pressure_forces[i];
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assert_ft_approx_eq, assert_v3_approx_eq,
        concurrency::SerialSurface,
        neighborhood_search::{HashedGrid, NeighborhoodCache},
        simulation_parameters::SolverConfig,
        sph_kernels::SphKernels,
    };

    fn setup(config: &SolverConfig) -> (SphKernels, SolverParams) {
        let kernels = SphKernels::new(config.kernel_radius(), config.kernel_subdivisions).unwrap();
        let mass = calibrate_particle_mass(
            kernels.density.weight_table(),
            config.particle_radius,
            config.rest_density,
        );
        let params = SolverParams::new(config, mass, kernels.density.step());
        (kernels, params)
    }

    fn neighbors(positions: &[V3], radius: FT) -> NeighborhoodCache {
        let mut grid = HashedGrid::new(radius);
        grid.build(positions);
        let mut cache = NeighborhoodCache::new(positions.len());
        cache.build_from_grid(&SerialSurface, &grid, positions, radius);
        cache
    }

    #[test]
    fn mass_calibration_reproduces_rest_density() {
        for particle_radius in [0.01, 0.017, 0.03, 0.05, 0.075, 0.1] {
            let config = SolverConfig {
                particle_radius,
                ..SolverConfig::default()
            };
            let (kernels, params) = setup(&config);

            let weighted_sum: FT = calibration_lattice(particle_radius)
                .map(|offset| kernels.density.weight(offset.norm()))
                .sum();
            let density = params.particle_mass * weighted_sum;
            assert_ft_approx_eq(density, config.rest_density, config.rest_density * 0.01, || {
                format!("lattice density for particle radius {}", particle_radius)
            });
        }
    }

    #[test]
    fn lattice_center_has_rest_density() {
        let config = SolverConfig::default();
        let (kernels, params) = setup(&config);
        let positions: Vec<V3> = calibration_lattice(config.particle_radius).collect();
        let center = positions.iter().position(|p| p.norm() == 0.).unwrap();
        let neighs = neighbors(&positions, params.kernel_radius);

        let mut densities = vec![0.; positions.len()];
        let mut pressures = vec![0.; positions.len()];
        compute_density_pressure(
            &SerialSurface,
            &params,
            &kernels.lookups(),
            &neighs,
            &positions,
            &mut densities,
            &mut pressures,
        );

        assert_ft_approx_eq(densities[center], config.rest_density, config.rest_density * 1e-4, || {
            format!("center density")
        });
        // border particles see fewer neighbors; the negative pressure is fully damped by default
        assert!(densities.iter().all(|&d| d > 0. && d <= densities[center] * 1.0001));
        assert!(pressures.iter().all(|&p| p.abs() < 1e-2));
    }

    #[test]
    fn integration_bootstrap_is_half_kick() {
        let a = vec3f(0.3, -9.81, 1.5);
        let dt = 0.01;
        let density = 1000.;

        let velocities = vec![V3::zeros()];
        let densities = vec![density];
        let mut positions = vec![V3::zeros()];
        let mut half_velocities = vec![V3::zeros()];
        let mut old_half_velocities = vec![V3::zeros()];
        let mut first_step = vec![true];
        let mut forces = vec![a * density];

        integrate(
            &SerialSurface,
            dt,
            &velocities,
            &densities,
            &mut positions,
            &mut half_velocities,
            &mut old_half_velocities,
            &mut first_step,
            &mut forces,
        );

        assert_v3_approx_eq(positions[0], a * (0.5 * dt * dt), 1e-7, || format!("position after first step"));
        assert_v3_approx_eq(half_velocities[0], a * (dt / 2.), 1e-6, || format!("half velocity"));
        assert_v3_approx_eq(old_half_velocities[0], a * (-dt / 2.), 1e-6, || format!("old half velocity"));
        assert_eq!(first_step[0], false);
        assert_eq!(forces[0], V3::zeros());
    }

    #[test]
    fn pressure_forces_are_antisymmetric() {
        let config = SolverConfig {
            pressure_stiffness: 50.,
            ..SolverConfig::default()
        };
        let (kernels, params) = setup(&config);
        let spacing = config.particle_radius;
        let positions = vec![vec3f(0., 0., 0.), vec3f(spacing, 0., 0.)];
        let neighs = neighbors(&positions, params.kernel_radius);

        let mut densities = vec![0.; 2];
        let mut pressures = vec![0.; 2];
        compute_density_pressure(
            &SerialSurface,
            &params,
            &kernels.lookups(),
            &neighs,
            &positions,
            &mut densities,
            &mut pressures,
        );

        let mut forces = vec![V3::zeros(); 2];
        // two isolated particles are far below rest density; make them compressed instead
        let pressures = vec![100., 100.];
        accumulate_pressure_forces(
            &SerialSurface,
            &params,
            &kernels.lookups(),
            &neighs,
            &positions,
            &densities,
            &pressures,
            &mut forces,
        );

        assert!(forces[0].x < 0., "left particle pushed left: {:?}", forces[0]);
        assert_v3_approx_eq(forces[0], -forces[1], forces[0].norm() * 1e-5, || format!("force pair"));
    }

    #[test]
    fn coincident_particles_produce_no_pressure_force() {
        let config = SolverConfig::default();
        let (kernels, params) = setup(&config);
        let positions = vec![vec3f(0.1, 0.1, 0.1); 3];
        let neighs = neighbors(&positions, params.kernel_radius);
        assert_eq!(neighs.neighbor_count(0), 3);

        let densities = vec![1000.; 3];
        let pressures = vec![10.; 3];
        let mut forces = vec![V3::zeros(); 3];
        accumulate_pressure_forces(
            &SerialSurface,
            &params,
            &kernels.lookups(),
            &neighs,
            &positions,
            &densities,
            &pressures,
            &mut forces,
        );
        assert!(forces.iter().all(|f| *f == V3::zeros()));

        let mut predicted = vec![V3::zeros(); 3];
        pci_pressure_force(
            &SerialSurface,
            &params,
            &kernels.lookups(),
            &neighs,
            &positions,
            &[0.; 3],
            &pressures,
            &densities,
            &mut predicted,
        );
        assert!(predicted.iter().all(|f| *f == V3::zeros()));
    }

    #[test]
    fn isolated_particle_only_feels_gravity() {
        let config = SolverConfig::default();
        let (kernels, params) = setup(&config);
        let positions = vec![vec3f(0., 0., 0.)];
        let velocities = vec![vec3f(1., 0., 0.)];
        let neighs = neighbors(&positions, params.kernel_radius);

        let densities = vec![700.];
        let mut forces = vec![V3::zeros()];
        accumulate_non_pressure_forces(
            &SerialSurface,
            &params,
            &kernels.lookups(),
            &neighs,
            &positions,
            &velocities,
            &densities,
            &mut forces,
        );
        assert_v3_approx_eq(forces[0], config.gravity * 700., 1e-3, || format!("gravity force"));
    }

    #[test]
    fn degenerate_neighbor_keeps_gravity() {
        let config = SolverConfig::default();
        let (kernels, params) = setup(&config);
        let positions = vec![vec3f(0., 0., 0.), vec3f(0.01, 0., 0.)];
        let velocities = vec![V3::zeros(), vec3f(0., 2., 0.)];
        let neighs = neighbors(&positions, params.kernel_radius);
        assert_eq!(neighs.neighbor_count(0), 2);

        // the neighbor's vanishing density makes its surface tension and viscosity terms non-finite
        let densities = vec![700., 0.];
        let mut forces = vec![V3::zeros(); 2];
        accumulate_non_pressure_forces(
            &SerialSurface,
            &params,
            &kernels.lookups(),
            &neighs,
            &positions,
            &velocities,
            &densities,
            &mut forces,
        );
        assert_v3_approx_eq(forces[0], config.gravity * 700., 1e-3, || format!("gravity force"));
        assert!(forces.iter().all(|f| f.iter().all(|c| c.is_finite())));
    }

    #[test]
    fn pcisph_delta_is_positive_and_scales_with_time_step() {
        let config = SolverConfig::default();
        let (kernels, params) = setup(&config);
        let d1 = pcisph_delta(kernels.pressure.gradient_table(), &params, 0.001);
        let d2 = pcisph_delta(kernels.pressure.gradient_table(), &params, 0.002);
        assert!(d1 > 0.);
        assert_ft_approx_eq(d1 / d2, 4., 1e-3, || format!("delta ~ 1/dt²"));
    }
}
