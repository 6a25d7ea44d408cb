use tracing::{debug, warn};

use crate::{
    error::SimulationError,
    floating_type_mod::FT,
    simulation_parameters::{SolverConfig, SolverParams},
    sph_kernels::SphKernels,
    sph_solver::{FluidSolver, PressureSolver, StepPipeline},
    stages,
};

/**
 * Predictive-corrective pressure: instead of a stiff equation of state the pressure is built up
 * iteratively from the density error of a predicted step.
 *
 * Every iteration predicts positions from the accumulated force plus the current pressure force
 * guess, resolves the prediction against the collision objects, measures the density error at the
 * predicted positions, raises the pressure by `delta * error` and recomputes the pressure force from it.
 * The loop stops after `pcisph_min_iterations` rounds or as soon as the largest error relative to the
 * rest density drops below `pcisph_max_density_error_ratio`.
 */
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PredictiveCorrective {
    last_iteration_count: usize,
    first_max_density_error_ratio: FT,
    last_max_density_error_ratio: FT,
    unconverged_reported: bool,
}

impl PressureSolver for PredictiveCorrective {
    const NAME: &'static str = "PCISPH";

    fn prepare_step(&mut self, params: &mut SolverParams, kernels: &SphKernels) {
        params.pcisph_delta = stages::pcisph_delta(kernels.pressure.gradient_table(), params, params.time_step);
    }

    fn accumulate_pressure_forces<S: StepPipeline>(
        &mut self,
        pipeline: &mut S,
        config: &SolverConfig,
    ) -> Result<(), SimulationError> {
        pipeline.pci_init()?;

        let mut iteration = 0;
        let mut first_max_density_error_ratio = FT::INFINITY;
        let mut max_density_error_ratio = FT::INFINITY;
        while iteration < config.pcisph_min_iterations {
            pipeline.pci_predict()?;
            pipeline.pci_handle_collisions()?;
            pipeline.pci_density_pressure()?;
            pipeline.pci_pressure_force()?;

            max_density_error_ratio = pipeline.pci_max_density_error()? / config.rest_density;
            iteration += 1;
            if iteration == 1 {
                first_max_density_error_ratio = max_density_error_ratio;
            }
            debug!(
                "pcisph iteration {}: max density error ratio {}",
                iteration, max_density_error_ratio
            );

            if max_density_error_ratio < config.pcisph_max_density_error_ratio {
                break;
            }
        }

        let converged = max_density_error_ratio < config.pcisph_max_density_error_ratio;
        if !converged && !self.unconverged_reported {
            warn!(
                "pcisph stopped after {} iterations with max density error ratio {} (tolerance {})",
                iteration, max_density_error_ratio, config.pcisph_max_density_error_ratio
            );
        }
        // reported once until the loop converges again
        self.unconverged_reported = !converged;

        self.last_iteration_count = iteration;
        self.first_max_density_error_ratio = first_max_density_error_ratio;
        self.last_max_density_error_ratio = max_density_error_ratio;

        pipeline.pci_add_pressure_force()?;
        Ok(())
    }
}

pub type PcisphSolver = FluidSolver<PredictiveCorrective>;

impl FluidSolver<PredictiveCorrective> {
    pub fn min_iterations(&self) -> usize {
        self.config().pcisph_min_iterations
    }

    pub fn set_min_iterations(&mut self, iterations: usize) -> Result<(), SimulationError> {
        self.reconfigure(|config| config.pcisph_min_iterations = iterations)
    }

    pub fn max_density_error_ratio(&self) -> FT {
        self.config().pcisph_max_density_error_ratio
    }

    pub fn set_max_density_error_ratio(&mut self, ratio: FT) -> Result<(), SimulationError> {
        self.reconfigure(|config| config.pcisph_max_density_error_ratio = ratio)
    }

    /// Iterations the correction loop ran in the last step.
    pub fn last_iteration_count(&self) -> usize {
        self.pressure_solver.last_iteration_count
    }

    /// Density error ratio of the uncorrected prediction in the last step.
    pub fn first_max_density_error_ratio(&self) -> FT {
        self.pressure_solver.first_max_density_error_ratio
    }

    pub fn last_max_density_error_ratio(&self) -> FT {
        self.pressure_solver.last_max_density_error_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collision::{CollisionBox, CollisionKind},
        device::DeviceClass,
        emitter::spawn_cube,
        particles::Particle,
        simulation_parameters::ExecutionMode,
        vec3f, V3,
    };

    fn cube_solver(config: SolverConfig, half_size: FT) -> PcisphSolver {
        let mut solver = PcisphSolver::new(config).unwrap();
        solver.add_static_collision_object(CollisionBox::new(
            V3::zeros(),
            vec3f(1., 1., 1.),
            CollisionKind::Boundary,
        ));
        let particles = spawn_cube(V3::zeros(), vec3f(half_size, half_size, half_size), config.particle_radius);
        solver.add_particles(particles.into_iter().map(Particle::at));
        solver
    }

    #[test]
    fn relaxed_lattice_converges_in_first_iteration() {
        // with a kernel barely reaching the direct lattice neighbors every particle sits at rest density
        let config = SolverConfig {
            kernel_radius_factor: 1.8,
            ..SolverConfig::default()
        };
        let mut solver = cube_solver(config, 0.05);
        solver.update(0.001).unwrap();

        assert_eq!(solver.last_iteration_count(), 1);
        assert!(solver.last_max_density_error_ratio() < config.pcisph_max_density_error_ratio);
    }

    #[test]
    fn rest_lattice_exits_early_with_default_parameters() {
        let config = SolverConfig::default();
        let mut solver = cube_solver(config, 0.1);
        assert!(solver.particle_count() > 27);
        solver.update(0.001).unwrap();

        assert_eq!(solver.last_iteration_count(), 1);
        assert!(solver.last_iteration_count() < solver.min_iterations());
        assert_eq!(solver.first_max_density_error_ratio(), solver.last_max_density_error_ratio());
        assert!(solver.last_max_density_error_ratio() < config.pcisph_max_density_error_ratio);
    }

    #[test]
    fn compressed_block_error_drops_across_iterations() {
        let config = SolverConfig::default();
        let mut solver = PcisphSolver::new(config).unwrap();
        // 3x3x3 block squeezed to 1.4 particle radii, its center is well above rest density
        let spacing = 1.4 * config.particle_radius;
        for x in -1..=1 {
            for y in -1..=1 {
                for z in -1..=1 {
                    solver.add_particle(Particle::at(vec3f(x as FT, y as FT, z as FT) * spacing));
                }
            }
        }
        solver.update(0.001).unwrap();

        let first = solver.first_max_density_error_ratio();
        let last = solver.last_max_density_error_ratio();
        assert!(first > config.pcisph_max_density_error_ratio, "initial error ratio {}", first);
        assert!(solver.last_iteration_count() >= 2);
        assert!(solver.last_iteration_count() <= config.pcisph_min_iterations);
        assert!(last < first, "error went from {} to {}", first, last);
        assert_eq!(solver.particles().count_non_finite(), 0);
    }

    #[test]
    fn loop_is_bounded_by_min_iterations() {
        let config = SolverConfig {
            pcisph_min_iterations: 3,
            pcisph_max_density_error_ratio: 1e-9,
            ..SolverConfig::default()
        };
        let mut solver = cube_solver(config, 0.05);
        solver.update(0.001).unwrap();
        assert_eq!(solver.last_iteration_count(), 3);

        solver.set_min_iterations(6).unwrap();
        solver.update(0.001).unwrap();
        assert_eq!(solver.last_iteration_count(), 6);

        assert!(solver.set_min_iterations(0).is_err());
        assert!(solver.set_max_density_error_ratio(-0.1).is_err());
        assert_eq!(solver.min_iterations(), 6);
    }

    #[test]
    fn density_error_does_not_diverge() {
        let config = SolverConfig::default();
        let mut few = cube_solver(SolverConfig {
            pcisph_min_iterations: 1,
            ..config
        }, 0.05);
        let mut many = cube_solver(SolverConfig {
            pcisph_min_iterations: 8,
            pcisph_max_density_error_ratio: 1e-9,
            ..config
        }, 0.05);

        few.update(0.001).unwrap();
        many.update(0.001).unwrap();
        let first = few.last_max_density_error_ratio();
        let last = many.last_max_density_error_ratio();
        assert!(first.is_finite() && last.is_finite());
        assert!(last <= first * 1.01, "error grew from {} to {}", first, last);
    }

    #[test]
    fn settles_without_nan_in_both_modes() {
        for mode in [ExecutionMode::Serial, ExecutionMode::Parallel(DeviceClass::Cpu)] {
            let config = SolverConfig {
                execution_mode: mode,
                ..SolverConfig::default()
            };
            let mut solver = cube_solver(config, 0.04);
            for _ in 0..20 {
                solver.update(0.001).unwrap();
            }
            assert_eq!(solver.particles().count_non_finite(), 0);
            assert!(solver.last_iteration_count() >= 1);
            assert!(solver
                .particles()
                .position
                .iter()
                .all(|p| p.iter().all(|c| c.abs() <= 1. + 1e-4)));
        }
    }
}
