use tracing::{info, trace, warn};

use crate::{
    collision::StaticCollisionObject,
    concurrency::SerialSurface,
    device::{ComputeBackend, DeviceClass, DevicePipeline, DeviceSession, DirtyFlags, HostBackend},
    error::SimulationError,
    floating_type_mod::FT,
    neighborhood_search::{HashedGrid, NeighborhoodCache},
    particles::{Particle, ParticleVec, PredictionVec},
    simulation_parameters::{ExecutionMode, SolverConfig, SolverParams},
    sph_kernels::{KernelLookups, SphKernels},
    stages, V3,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolverStage {
    Idle,
    BeginStep,
    ForceAccumulation,
    Integration,
    CollisionResolution,
    EndStep,
}

/// Stable handle of a registered static collision object. Valid until all objects are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollisionObjectId(usize);

impl CollisionObjectId {
    pub fn index(self) -> usize {
        self.0
    }
}

/**
 * The stages of one step on one execution target. The solver drives them in a fixed order; the
 * `pci_*` operations are only used by the predictive-corrective pressure solver.
 */
pub trait StepPipeline {
    /// Rebuilds the neighbor structure and computes density and pressure.
    fn begin_step(&mut self) -> Result<(), SimulationError>;

    fn accumulate_non_pressure_forces(&mut self) -> Result<(), SimulationError>;

    fn accumulate_pressure_forces(&mut self) -> Result<(), SimulationError>;

    fn integrate(&mut self) -> Result<(), SimulationError>;

    fn handle_collisions(&mut self) -> Result<(), SimulationError>;

    fn end_step(&mut self) -> Result<(), SimulationError>;

    fn pci_init(&mut self) -> Result<(), SimulationError>;

    fn pci_predict(&mut self) -> Result<(), SimulationError>;

    fn pci_handle_collisions(&mut self) -> Result<(), SimulationError>;

    fn pci_density_pressure(&mut self) -> Result<(), SimulationError>;

    fn pci_pressure_force(&mut self) -> Result<(), SimulationError>;

    /// Largest absolute density error of the last prediction.
    fn pci_max_density_error(&mut self) -> Result<FT, SimulationError>;

    fn pci_add_pressure_force(&mut self) -> Result<(), SimulationError>;
}

/// Strategy for the pressure part of the force accumulation stage.
pub trait PressureSolver: Send {
    const NAME: &'static str;

    /// Adjusts the per step parameters before any stage runs.
    fn prepare_step(&mut self, _params: &mut SolverParams, _kernels: &SphKernels) {}

    fn accumulate_pressure_forces<S: StepPipeline>(
        &mut self,
        pipeline: &mut S,
        config: &SolverConfig,
    ) -> Result<(), SimulationError>;
}

/// Pressure straight from the equation of state `P = k (ρ - ρ0)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EquationOfState;

impl PressureSolver for EquationOfState {
    const NAME: &'static str = "SPH";

    fn accumulate_pressure_forces<S: StepPipeline>(
        &mut self,
        pipeline: &mut S,
        _config: &SolverConfig,
    ) -> Result<(), SimulationError> {
        pipeline.accumulate_pressure_forces()
    }
}

/// Serial execution on the calling thread with a hashed grid and cached neighbor lists.
struct HostPipeline<'a> {
    params: SolverParams,
    lookups: KernelLookups<'a>,
    objects: &'a [StaticCollisionObject],
    particles: &'a mut ParticleVec,
    grid: &'a mut HashedGrid,
    neighs: &'a mut NeighborhoodCache,
    prediction: &'a mut PredictionVec,
}

impl<'a> StepPipeline for HostPipeline<'a> {
    fn begin_step(&mut self) -> Result<(), SimulationError> {
        let p = &mut *self.particles;
        self.grid.build(&p.position);
        self.neighs
            .build_from_grid(&SerialSurface, &*self.grid, &p.position, self.params.kernel_radius);
        if self.prediction.len() != p.len() {
            self.prediction.resize(p.len());
        }

        stages::compute_density_pressure(
            &SerialSurface,
            &self.params,
            &self.lookups,
            &*self.neighs,
            &p.position,
            &mut p.density,
            &mut p.pressure,
        );
        Ok(())
    }

    fn accumulate_non_pressure_forces(&mut self) -> Result<(), SimulationError> {
        let p = &mut *self.particles;
        stages::accumulate_non_pressure_forces(
            &SerialSurface,
            &self.params,
            &self.lookups,
            &*self.neighs,
            &p.position,
            &p.velocity,
            &p.density,
            &mut p.force,
        );
        Ok(())
    }

    fn accumulate_pressure_forces(&mut self) -> Result<(), SimulationError> {
        let p = &mut *self.particles;
        stages::accumulate_pressure_forces(
            &SerialSurface,
            &self.params,
            &self.lookups,
            &*self.neighs,
            &p.position,
            &p.density,
            &p.pressure,
            &mut p.force,
        );
        Ok(())
    }

    fn integrate(&mut self) -> Result<(), SimulationError> {
        let p = &mut *self.particles;
        stages::integrate(
            &SerialSurface,
            self.params.time_step,
            &p.velocity,
            &p.density,
            &mut p.position,
            &mut p.half_velocity,
            &mut p.old_half_velocity,
            &mut p.first_step,
            &mut p.force,
        );
        Ok(())
    }

    fn handle_collisions(&mut self) -> Result<(), SimulationError> {
        let p = &mut *self.particles;
        stages::handle_collisions(
            &SerialSurface,
            &self.params,
            self.objects,
            &p.old_half_velocity,
            &mut p.position,
            &mut p.half_velocity,
            &mut p.velocity,
        );
        Ok(())
    }

    fn end_step(&mut self) -> Result<(), SimulationError> {
        // both are rebuilt from the moved positions at the next step
        self.grid.clear();
        self.neighs.clear();
        Ok(())
    }

    fn pci_init(&mut self) -> Result<(), SimulationError> {
        stages::pci_init(
            &SerialSurface,
            &mut self.particles.pressure,
            &mut self.prediction.pressure_force,
        );
        Ok(())
    }

    fn pci_predict(&mut self) -> Result<(), SimulationError> {
        let p = &*self.particles;
        let pred = &mut *self.prediction;
        stages::pci_predict(
            &SerialSurface,
            self.params.time_step,
            &p.position,
            &p.velocity,
            &p.half_velocity,
            &p.force,
            &pred.pressure_force,
            &p.density,
            &p.first_step,
            &mut pred.position,
            &mut pred.half_velocity,
        );
        Ok(())
    }

    fn pci_handle_collisions(&mut self) -> Result<(), SimulationError> {
        let pred = &mut *self.prediction;
        stages::pci_handle_collisions(
            &SerialSurface,
            &self.params,
            self.objects,
            &mut pred.position,
            &mut pred.half_velocity,
        );
        Ok(())
    }

    fn pci_density_pressure(&mut self) -> Result<(), SimulationError> {
        let pred = &mut *self.prediction;
        stages::pci_density_pressure(
            &SerialSurface,
            &self.params,
            &self.lookups,
            &*self.neighs,
            &pred.position,
            &mut pred.density,
            &mut pred.density_error,
            &mut self.particles.pressure,
        );
        Ok(())
    }

    fn pci_pressure_force(&mut self) -> Result<(), SimulationError> {
        let pred = &mut *self.prediction;
        stages::pci_pressure_force(
            &SerialSurface,
            &self.params,
            &self.lookups,
            &*self.neighs,
            &pred.position,
            &pred.density,
            &self.particles.pressure,
            &self.particles.density,
            &mut pred.pressure_force,
        );
        Ok(())
    }

    fn pci_max_density_error(&mut self) -> Result<FT, SimulationError> {
        Ok(stages::max_density_error(&SerialSurface, &self.prediction.density_error))
    }

    fn pci_add_pressure_force(&mut self) -> Result<(), SimulationError> {
        stages::pci_add_pressure_force(
            &SerialSurface,
            &self.prediction.pressure_force,
            &mut self.particles.force,
        );
        Ok(())
    }
}

fn enter(stage: &mut SolverStage, next: SolverStage) {
    trace!("solver stage {:?} -> {:?}", *stage, next);
    *stage = next;
}

fn run_step<S: StepPipeline, P: PressureSolver>(
    pipeline: &mut S,
    pressure_solver: &mut P,
    config: &SolverConfig,
    stage: &mut SolverStage,
) -> Result<(), SimulationError> {
    enter(stage, SolverStage::BeginStep);
    pipeline.begin_step()?;

    enter(stage, SolverStage::ForceAccumulation);
    pipeline.accumulate_non_pressure_forces()?;
    pressure_solver.accumulate_pressure_forces(pipeline, config)?;

    enter(stage, SolverStage::Integration);
    pipeline.integrate()?;

    enter(stage, SolverStage::CollisionResolution);
    pipeline.handle_collisions()?;

    enter(stage, SolverStage::EndStep);
    pipeline.end_step()?;

    enter(stage, SolverStage::Idle);
    Ok(())
}

macro_rules! config_accessors {
    ($($field:ident: $ty:ty => $setter:ident),*$(,)?) => {
        $(
            pub fn $field(&self) -> $ty {
                self.config.$field
            }

            pub fn $setter(&mut self, value: $ty) -> Result<(), SimulationError> {
                self.reconfigure(|config| config.$field = value)
            }
        )*
    };
}

/**
 * Particle fluid solver. One call to `update` advances all particles by one time step through the
 * stages `BeginStep`, `ForceAccumulation`, `Integration`, `CollisionResolution` and `EndStep`, either
 * serially or as kernels on a compute device. `P` decides how pressure forces are computed.
 */
pub struct FluidSolver<P: PressureSolver> {
    config: SolverConfig,
    kernels: SphKernels,
    particle_mass: FT,

    particles: ParticleVec,
    collision_objects: Vec<StaticCollisionObject>,

    pub(crate) pressure_solver: P,
    stage: SolverStage,

    execution_mode: ExecutionMode,
    device: DeviceSession,
    dirty: DirtyFlags,

    grid: HashedGrid,
    neighs: NeighborhoodCache,
    prediction: PredictionVec,
}

pub type SphSolver = FluidSolver<EquationOfState>;

impl<P: PressureSolver + Default> FluidSolver<P> {
    /// Solver with the in-crate host device as compute backend.
    pub fn new(config: SolverConfig) -> Result<Self, SimulationError> {
        Self::with_backend(config, Box::new(HostBackend::new()))
    }

    pub fn with_backend(config: SolverConfig, backend: Box<dyn ComputeBackend>) -> Result<Self, SimulationError> {
        config.validate()?;
        let kernels = SphKernels::new(config.kernel_radius(), config.kernel_subdivisions)?;
        let particle_mass = stages::calibrate_particle_mass(
            kernels.density.weight_table(),
            config.particle_radius,
            config.rest_density,
        );

        let mut solver = FluidSolver {
            config,
            kernels,
            particle_mass,
            particles: ParticleVec::default(),
            collision_objects: Vec::new(),
            pressure_solver: P::default(),
            stage: SolverStage::Idle,
            execution_mode: ExecutionMode::Serial,
            device: DeviceSession::new(backend),
            dirty: DirtyFlags::all(),
            grid: HashedGrid::new(config.kernel_radius()),
            neighs: NeighborhoodCache::new(0),
            prediction: PredictionVec::default(),
        };
        solver.set_execution_mode(config.execution_mode);

        info!(
            "{} solver: particle radius {}, kernel radius {}, particle mass {}",
            P::NAME,
            config.particle_radius,
            config.kernel_radius(),
            particle_mass
        );
        Ok(solver)
    }
}

impl<P: PressureSolver> FluidSolver<P> {
    pub fn add_particle(&mut self, particle: Particle) {
        self.particles.push(particle);
        self.dirty.particles = true;
    }

    pub fn add_particles(&mut self, particles: impl IntoIterator<Item = Particle>) {
        for particle in particles {
            self.particles.push(particle);
        }
        self.dirty.particles = true;
    }

    pub fn remove_all_particles(&mut self) {
        self.particles.clear();
        self.neighs.clear();
        self.prediction.clear();
        self.dirty.particles = true;
    }

    pub fn particles(&self) -> &ParticleVec {
        &self.particles
    }

    pub fn particle(&self, i: usize) -> Option<Particle> {
        self.particles.get(i)
    }

    /// Direct access to the particle columns. Every column has to keep the same length.
    pub fn particles_mut(&mut self) -> &mut ParticleVec {
        self.dirty.particles = true;
        &mut self.particles
    }

    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    pub fn add_static_collision_object(&mut self, object: impl Into<StaticCollisionObject>) -> CollisionObjectId {
        self.collision_objects.push(object.into());
        self.dirty.collision_objects = true;
        CollisionObjectId(self.collision_objects.len() - 1)
    }

    pub fn remove_all_static_collision_objects(&mut self) {
        self.collision_objects.clear();
        self.dirty.collision_objects = true;
    }

    /// All objects in registration order, which is also the order of resolution.
    pub fn static_collision_objects(&self) -> &[StaticCollisionObject] {
        &self.collision_objects
    }

    pub fn static_collision_object(&self, id: CollisionObjectId) -> Option<&StaticCollisionObject> {
        self.collision_objects.get(id.0)
    }

    pub fn static_collision_object_mut(
        &mut self,
        id: CollisionObjectId,
    ) -> Result<&mut StaticCollisionObject, SimulationError> {
        let object = self
            .collision_objects
            .get_mut(id.0)
            .ok_or(SimulationError::UnknownCollisionObject(id.0))?;
        self.dirty.collision_objects = true;
        Ok(object)
    }

    pub fn stage(&self) -> SolverStage {
        self.stage
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn particle_mass(&self) -> FT {
        self.particle_mass
    }

    pub fn kernel_radius(&self) -> FT {
        self.config.kernel_radius()
    }

    pub fn kernels(&self) -> &SphKernels {
        &self.kernels
    }

    /// Parameters of the next step, without time step dependent values.
    pub fn params(&self) -> SolverParams {
        SolverParams::new(&self.config, self.particle_mass, self.kernels.density.step())
    }

    config_accessors! {
        gravity: V3 => set_gravity,
        particle_radius: FT => set_particle_radius,
        kernel_radius_factor: FT => set_kernel_radius_factor,
        kernel_subdivisions: usize => set_kernel_subdivisions,
        rest_density: FT => set_rest_density,
        viscosity: FT => set_viscosity,
        pressure_stiffness: FT => set_pressure_stiffness,
        negative_pressure_factor: FT => set_negative_pressure_factor,
        surface_tension: FT => set_surface_tension,
        surface_tension_threshold: FT => set_surface_tension_threshold,
        restitution: FT => set_restitution,
        friction: FT => set_friction,
    }

    /// Replaces every scalar at once. The execution mode of `config` is applied as well.
    pub fn set_config(&mut self, config: SolverConfig) -> Result<(), SimulationError> {
        self.reconfigure(|c| *c = config)?;
        self.set_execution_mode(config.execution_mode);
        Ok(())
    }

    /**
     * Validates the modified configuration before touching anything, then rebuilds what depends on it:
     * kernel tables and grid cell size for a new kernel radius or subdivision count, and the particle mass.
     */
    pub(crate) fn reconfigure(&mut self, f: impl FnOnce(&mut SolverConfig)) -> Result<(), SimulationError> {
        let mut config = self.config;
        f(&mut config);
        config.validate()?;

        let kernel_radius = config.kernel_radius();
        if kernel_radius != self.config.kernel_radius() || config.kernel_subdivisions != self.config.kernel_subdivisions {
            self.kernels.configure(kernel_radius, config.kernel_subdivisions)?;
            self.grid.set_cell_size(kernel_radius);
            self.dirty.kernel_weights = true;
        }

        self.particle_mass = stages::calibrate_particle_mass(
            self.kernels.density.weight_table(),
            config.particle_radius,
            config.rest_density,
        );
        // the execution mode is only switched through `set_execution_mode`
        config.execution_mode = self.config.execution_mode;
        self.config = config;
        Ok(())
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn has_cpu_device(&self) -> bool {
        self.device.availability().has_cpu_device
    }

    pub fn has_gpu_device(&self) -> bool {
        self.device.availability().has_gpu_device
    }

    /**
     * Switches between serial and device execution. A device class the backend does not offer is
     * replaced by the one it does (GPU first); without any device the solver stays serial.
     * Returns the mode that is in effect afterwards.
     */
    pub fn set_execution_mode(&mut self, requested: ExecutionMode) -> ExecutionMode {
        let availability = self.device.availability();
        let effective = match requested {
            ExecutionMode::Serial => ExecutionMode::Serial,
            ExecutionMode::Parallel(class) if availability.supports(class) => ExecutionMode::Parallel(class),
            ExecutionMode::Parallel(class) => match availability.preferred() {
                Some(other) => {
                    warn!("no {:?} device available, using {:?} instead", class, other);
                    ExecutionMode::Parallel(other)
                }
                None => {
                    warn!("no compute device available, falling back to serial execution");
                    ExecutionMode::Serial
                }
            },
        };

        if effective != self.execution_mode {
            info!("execution mode {:?} -> {:?}", self.execution_mode, effective);
            self.dirty.context = true;
        }
        self.execution_mode = effective;
        self.config.execution_mode = effective;
        effective
    }

    fn step_params(&mut self, time_step: FT) -> SolverParams {
        let mut params = self.params();
        params.time_step = time_step;
        self.pressure_solver.prepare_step(&mut params, &self.kernels);
        params
    }

    /// Advances the simulation by `time_step` seconds.
    pub fn update(&mut self, time_step: FT) -> Result<(), SimulationError> {
        if !(time_step.is_finite() && time_step > 0.) {
            return Err(SimulationError::InvalidTimeStep(time_step));
        }
        if self.particles.is_empty() {
            return Ok(());
        }

        let params = self.step_params(time_step);
        let result = match self.execution_mode {
            ExecutionMode::Serial => {
                let mut pipeline = HostPipeline {
                    params,
                    lookups: self.kernels.lookups(),
                    objects: &self.collision_objects,
                    particles: &mut self.particles,
                    grid: &mut self.grid,
                    neighs: &mut self.neighs,
                    prediction: &mut self.prediction,
                };
                run_step(&mut pipeline, &mut self.pressure_solver, &self.config, &mut self.stage)
            }
            ExecutionMode::Parallel(device_class) => self.device_step(device_class, params),
        };

        if result.is_err() {
            self.stage = SolverStage::Idle;
        }
        result
    }

    fn device_step(&mut self, device_class: DeviceClass, params: SolverParams) -> Result<(), SimulationError> {
        self.device.sync(
            device_class,
            &mut self.dirty,
            &self.particles,
            &self.collision_objects,
            &self.kernels,
        )?;
        let mut pipeline = DevicePipeline::new(&mut self.device, &mut self.particles, params);
        run_step(&mut pipeline, &mut self.pressure_solver, &self.config, &mut self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assert_ft_approx_eq,
        collision::{CollisionBox, CollisionKind, CollisionSphere, StaticCollider},
        device::DeviceAvailability,
        error::ConfigError,
        vec3f,
    };

    #[test]
    fn free_fall_matches_leapfrog() {
        let config = SolverConfig {
            viscosity: 0.,
            surface_tension: 0.,
            ..SolverConfig::default()
        };
        let mut solver = SphSolver::new(config).unwrap();
        solver.add_particle(Particle::at(vec3f(0., 1., 0.)));

        let dt = 0.001;
        for _ in 0..10 {
            solver.update(dt).unwrap();
        }
        assert_eq!(solver.stage(), SolverStage::Idle);

        // an isolated particle only sees gravity, the averaged velocity trails by one step
        let t = 10. * dt;
        let p = solver.particle(0).unwrap();
        assert_ft_approx_eq(p.position.y, 1. - 0.5 * 9.81 * t * t, 1e-5, || format!("height after free fall"));
        assert_ft_approx_eq(p.velocity.y, -9.81 * (t - dt), 1e-4, || format!("velocity after free fall"));
        assert!(!p.is_first_step);
        assert_eq!(p.accumulated_force, V3::zeros());
    }

    #[test]
    fn serial_step_releases_its_neighborhood() {
        let mut solver = SphSolver::new(SolverConfig::default()).unwrap();
        for x in 0..3 {
            solver.add_particle(Particle::at(vec3f(x as FT * 0.02, 0., 0.)));
        }
        for _ in 0..2 {
            solver.update(0.001).unwrap();
            assert!(solver.grid.is_empty());
            assert_eq!(solver.neighs.len(), 0);
        }
    }

    #[test]
    fn invalid_time_steps_are_rejected() {
        let mut solver = SphSolver::new(SolverConfig::default()).unwrap();
        solver.add_particle(Particle::at(V3::zeros()));
        for dt in [0., -0.001, FT::NAN, FT::INFINITY] {
            assert!(matches!(solver.update(dt), Err(SimulationError::InvalidTimeStep(_))));
        }
        assert_eq!(solver.particle(0).unwrap().position, V3::zeros());

        // nothing to do without particles
        let mut empty = SphSolver::new(SolverConfig::default()).unwrap();
        empty.update(0.001).unwrap();
    }

    #[test]
    fn rejected_setters_leave_the_solver_untouched() {
        let mut solver = SphSolver::new(SolverConfig::default()).unwrap();
        let mass = solver.particle_mass();
        let kernel_radius = solver.kernel_radius();

        assert!(matches!(
            solver.set_particle_radius(0.),
            Err(SimulationError::Config(ConfigError::NonPositive { .. }))
        ));
        assert!(solver.set_particle_radius(FT::NAN).is_err());
        assert!(solver.set_kernel_subdivisions(0).is_err());
        assert!(solver.set_restitution(2.).is_err());
        assert_eq!(solver.particle_mass(), mass);
        assert_eq!(solver.kernel_radius(), kernel_radius);
        assert_eq!(solver.config(), &SolverConfig::default());
    }

    #[test]
    fn particle_radius_drives_kernel_radius_and_mass() {
        let mut solver = SphSolver::new(SolverConfig::default()).unwrap();
        let mass = solver.particle_mass();

        solver.set_particle_radius(0.034).unwrap();
        assert_ft_approx_eq(solver.kernel_radius(), 0.034 * 2.688, 1e-6, || format!("kernel radius"));
        assert_ft_approx_eq(solver.kernels().density.radius(), solver.kernel_radius(), 1e-7, || {
            format!("kernel table radius")
        });
        // mass scales with the particle volume
        assert_ft_approx_eq(solver.particle_mass() / mass, 8., 0.05, || format!("mass ratio"));

        solver.set_rest_density(2. * 998.29).unwrap();
        assert_ft_approx_eq(solver.particle_mass() / mass, 16., 0.1, || format!("mass ratio"));

        solver.set_viscosity(1.).unwrap();
        assert_eq!(solver.viscosity(), 1.);
    }

    #[test]
    fn collision_objects_keep_registration_order() {
        let mut solver = SphSolver::new(SolverConfig::default()).unwrap();
        let boundary = solver.add_static_collision_object(CollisionBox::new(
            V3::zeros(),
            vec3f(1., 1., 1.),
            CollisionKind::Boundary,
        ));
        let sphere = solver.add_static_collision_object(CollisionSphere::new(
            vec3f(0., -0.5, 0.),
            0.2,
            CollisionKind::Obstacle,
        ));
        assert_eq!(boundary.index(), 0);
        assert_eq!(sphere.index(), 1);
        assert!(matches!(
            solver.static_collision_objects()[1],
            StaticCollisionObject::CollisionSphere(_)
        ));

        solver
            .static_collision_object_mut(sphere)
            .unwrap()
            .set_center(vec3f(0., -0.6, 0.));
        assert_eq!(solver.static_collision_object(sphere).unwrap().center(), vec3f(0., -0.6, 0.));

        solver.remove_all_static_collision_objects();
        assert!(solver.static_collision_object(boundary).is_none());
        assert!(matches!(
            solver.static_collision_object_mut(boundary),
            Err(SimulationError::UnknownCollisionObject(0))
        ));
    }

    #[test]
    fn execution_mode_falls_back_without_devices() {
        let config = SolverConfig {
            execution_mode: ExecutionMode::Parallel(DeviceClass::Gpu),
            ..SolverConfig::default()
        };

        let solver = SphSolver::new(config).unwrap();
        assert!(solver.has_cpu_device());
        assert!(!solver.has_gpu_device());
        assert_eq!(solver.execution_mode(), ExecutionMode::Parallel(DeviceClass::Cpu));

        let backend = HostBackend::with_availability(DeviceAvailability::default());
        let mut solver = SphSolver::with_backend(config, Box::new(backend)).unwrap();
        assert_eq!(solver.execution_mode(), ExecutionMode::Serial);
        assert_eq!(
            solver.set_execution_mode(ExecutionMode::Parallel(DeviceClass::Cpu)),
            ExecutionMode::Serial
        );

        solver.add_particle(Particle::at(V3::zeros()));
        solver.update(0.001).unwrap();
    }

    #[test]
    fn switching_modes_keeps_particles_in_sync() {
        let mut solver = SphSolver::new(SolverConfig::default()).unwrap();
        solver.add_static_collision_object(CollisionBox::new(
            V3::zeros(),
            vec3f(0.5, 0.5, 0.5),
            CollisionKind::Boundary,
        ));
        let spacing = 1.6 * solver.particle_radius();
        for i in 0..5 {
            for j in 0..5 {
                solver.add_particle(Particle::at(vec3f(i as FT * spacing, j as FT * spacing, 0.)));
            }
        }

        solver.update(0.001).unwrap();
        solver.set_execution_mode(ExecutionMode::Parallel(DeviceClass::Cpu));
        solver.update(0.001).unwrap();
        solver.set_execution_mode(ExecutionMode::Serial);
        solver.update(0.001).unwrap();

        assert_eq!(solver.particle_count(), 25);
        assert_eq!(solver.particles().count_non_finite(), 0);
        assert!(solver.particles().first_step.iter().all(|&first| !first));
    }
}
