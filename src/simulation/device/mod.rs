/*!
Parallel execution through a `ComputeBackend`.

`DeviceSession` owns the backend, one grow-only arena per device buffer and the kernel handles of the
current context. Uploads are gated by `DirtyFlags`; every step the parameter block and the grid info
are written and the kernels of the device program are launched in the fixed stage order. Particles stay
sorted by cell on the device, the `id` buffer maps them back to caller order on readback.
*/

mod arena;
mod backend;
mod host_backend;
pub mod kernels;
pub mod layout;

pub use arena::BufferArena;
pub use backend::{AccessMode, BufferHandle, ComputeBackend, DeviceAvailability, DeviceClass, KernelArg, KernelHandle};
pub use host_backend::{HostBackend, KernelInvocation};

use tracing::{debug, info};

use self::{
    kernels::KernelSignature,
    layout::{DeviceParams, WORK_GROUP_SIZE},
};
use crate::{
    collision::StaticCollisionObject,
    concurrency::ParallelSurface,
    error::{BackendError, SimulationError},
    floating_type_mod::FT,
    neighborhood_search::GridGeometry,
    particles::ParticleVec,
    simulation_parameters::SolverParams,
    sph_kernels::SphKernels,
    sph_solver::StepPipeline,
};

/// Categories of host data whose device copy is stale. A context change implies all others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyFlags {
    pub particles: bool,
    pub collision_objects: bool,
    pub kernel_weights: bool,
    pub context: bool,
}

impl DirtyFlags {
    pub fn all() -> Self {
        DirtyFlags {
            particles: true,
            collision_objects: true,
            kernel_weights: true,
            context: true,
        }
    }

    pub fn clean() -> Self {
        DirtyFlags {
            particles: false,
            collision_objects: false,
            kernel_weights: false,
            context: false,
        }
    }

    pub fn any(&self) -> bool {
        self.particles || self.collision_objects || self.kernel_weights || self.context
    }
}

impl Default for DirtyFlags {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extent {
    Params,
    GridInfo,
    CellStarts,
    CollisionObjects,
    KernelWeights,
    ParticleVector,
    ParticleScalar,
    Single,
}

struct BufferSpec {
    name: &'static str,
    access: AccessMode,
    extent: Extent,
}

const fn spec(name: &'static str, access: AccessMode, extent: Extent) -> BufferSpec {
    BufferSpec { name, access, extent }
}

const BUFFERS: &[BufferSpec] = &[
    spec("params", AccessMode::ReadOnly, Extent::Params),
    spec("grid_info", AccessMode::ReadOnly, Extent::GridInfo),
    spec("cell_starts", AccessMode::ReadWrite, Extent::CellStarts),
    spec("collision_objects", AccessMode::ReadOnly, Extent::CollisionObjects),
    spec("kernel_weights", AccessMode::ReadOnly, Extent::KernelWeights),
    spec("position", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("velocity", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("half_velocity", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("old_half_velocity", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("force", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("density", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("pressure", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("first_step", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("id", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("grid_index", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("sort_index", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("predicted_position", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("predicted_half_velocity", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("predicted_pressure_force", AccessMode::ReadWrite, Extent::ParticleVector),
    spec("predicted_density", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("density_error", AccessMode::ReadWrite, Extent::ParticleScalar),
    spec("max_density_error", AccessMode::WriteOnly, Extent::Single),
];

pub struct DeviceSession {
    backend: Box<dyn ComputeBackend>,
    availability: DeviceAvailability,
    device_class: Option<DeviceClass>,
    kernels: Vec<(&'static KernelSignature, KernelHandle)>,
    arenas: Vec<(Extent, BufferArena)>,

    capacity: usize,
    particle_count: usize,
    collision_object_count: usize,
    kernel_table_entries: usize,
}

impl DeviceSession {
    pub fn new(mut backend: Box<dyn ComputeBackend>) -> Self {
        let availability = backend.initialize();
        info!(
            "compute backend `{}`: cpu device {}, gpu device {}",
            backend.name(),
            availability.has_cpu_device,
            availability.has_gpu_device
        );

        DeviceSession {
            backend,
            availability,
            device_class: None,
            kernels: Vec::new(),
            arenas: BUFFERS
                .iter()
                .map(|spec| (spec.extent, BufferArena::new(spec.name, spec.access)))
                .collect(),
            capacity: 0,
            particle_count: 0,
            collision_object_count: 0,
            kernel_table_entries: 0,
        }
    }

    pub fn availability(&self) -> DeviceAvailability {
        self.availability
    }

    pub fn device_class(&self) -> Option<DeviceClass> {
        self.device_class
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn arena(&self, name: &str) -> Result<&BufferArena, BackendError> {
        self.arenas
            .iter()
            .map(|(_, arena)| arena)
            .find(|arena| arena.name() == name)
            .ok_or_else(|| BackendError::Layout(format!("no device buffer named `{}`", name)))
    }

    fn handle(&self, name: &str) -> Result<BufferHandle, BackendError> {
        self.arena(name)?.handle()
    }

    /// Grows every buffer of `extent` to `byte_size`.
    fn ensure(&mut self, extent: Extent, byte_size: usize) -> Result<(), BackendError> {
        let backend = self.backend.as_mut();
        for (e, arena) in self.arenas.iter_mut() {
            if *e == extent {
                arena.ensure(backend, byte_size)?;
            }
        }
        Ok(())
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), BackendError> {
        let handle = self.handle(name)?;
        self.backend.write_buffer(handle, 0, data, false)
    }

    fn read(&mut self, name: &str, byte_size: usize) -> Result<Vec<u8>, BackendError> {
        let handle = self.handle(name)?;
        let mut bytes = vec![0u8; byte_size];
        self.backend.read_buffer(handle, 0, &mut bytes, true)?;
        Ok(bytes)
    }

    fn reinit_context(&mut self, device_class: DeviceClass) -> Result<(), BackendError> {
        self.device_class = None;
        self.kernels.clear();
        for (_, arena) in self.arenas.iter_mut() {
            arena.invalidate();
        }
        self.capacity = 0;

        self.backend.reinit_context(&kernels::program_source(), device_class)?;
        for signature in kernels::PROGRAM {
            let handle = self.backend.create_kernel(signature.name)?;
            self.kernels.push((signature, handle));
        }

        self.ensure(Extent::Params, layout::PARAMS_SIZE)?;
        self.ensure(Extent::GridInfo, layout::GRID_INFO_SIZE)?;
        self.ensure(Extent::Single, layout::SCALAR_SIZE)?;

        self.device_class = Some(device_class);
        info!("compute context created for {:?} device", device_class);
        Ok(())
    }

    /**
     * Brings the device copy up to date with the host data named by `dirty`. The flags are only cleared
     * once the whole batch has been transferred; on error they stay set and the next call retries.
     */
    pub fn sync(
        &mut self,
        device_class: DeviceClass,
        dirty: &mut DirtyFlags,
        particles: &ParticleVec,
        objects: &[StaticCollisionObject],
        kernels: &SphKernels,
    ) -> Result<(), BackendError> {
        let mut pending = *dirty;
        if self.device_class != Some(device_class) {
            pending.context = true;
        }
        if particles.len() != self.particle_count || layout::padded_capacity(particles.len()) > self.capacity {
            pending.particles = true;
        }

        if pending.context {
            self.reinit_context(device_class)?;
            pending = DirtyFlags::all();
        }

        if pending.particles {
            self.upload_particles(particles)?;
        }

        if pending.collision_objects {
            let bytes = layout::encode_collision_objects(objects);
            self.ensure(Extent::CollisionObjects, bytes.len())?;
            self.write("collision_objects", &bytes)?;
            self.collision_object_count = objects.len();
            debug!("uploaded {} collision objects", objects.len());
        }

        if pending.kernel_weights {
            let bytes = layout::encode_scalars(&kernels.packed_tables(), 0);
            self.ensure(Extent::KernelWeights, bytes.len())?;
            self.write("kernel_weights", &bytes)?;
            self.kernel_table_entries = kernels.entries_per_table();
            debug!("uploaded kernel tables with {} entries each", self.kernel_table_entries);
        }

        *dirty = DirtyFlags::clean();
        Ok(())
    }

    fn upload_particles(&mut self, particles: &ParticleVec) -> Result<(), BackendError> {
        let n = particles.len();
        let capacity = layout::padded_capacity(n);
        self.ensure(Extent::ParticleVector, capacity * layout::VEC_SIZE)?;
        self.ensure(Extent::ParticleScalar, capacity * layout::SCALAR_SIZE)?;
        self.capacity = capacity;

        let ids: Vec<u32> = (0..n as u32).collect();
        self.write("position", &layout::encode_vectors(&particles.position, 0))?;
        self.write("velocity", &layout::encode_vectors(&particles.velocity, 0))?;
        self.write("half_velocity", &layout::encode_vectors(&particles.half_velocity, 0))?;
        self.write("old_half_velocity", &layout::encode_vectors(&particles.old_half_velocity, 0))?;
        self.write("force", &layout::encode_vectors(&particles.force, 0))?;
        self.write("density", &layout::encode_scalars(&particles.density, 0))?;
        self.write("pressure", &layout::encode_scalars(&particles.pressure, 0))?;
        self.write("first_step", &layout::encode_flags(&particles.first_step, 0))?;
        self.write("id", &layout::encode_indices(&ids, 0))?;

        self.particle_count = n;
        debug!("uploaded {} particles (capacity {})", n, capacity);
        Ok(())
    }

    pub fn write_params(&mut self, params: &SolverParams) -> Result<(), BackendError> {
        let bytes = layout::encode_params(&DeviceParams {
            solver: *params,
            particle_count: self.particle_count as u32,
            collision_object_count: self.collision_object_count as u32,
            kernel_table_entries: self.kernel_table_entries as u32,
        });
        self.write("params", &bytes)
    }

    pub fn write_grid(&mut self, geometry: &GridGeometry) -> Result<(), BackendError> {
        self.ensure(
            Extent::CellStarts,
            (geometry.cell_count as usize + 1) * layout::SCALAR_SIZE,
        )?;
        self.write("grid_info", &layout::encode_grid_info(geometry))
    }

    /// Binds the buffers named by the kernel's signature and launches it over the padded capacity.
    pub fn run(&mut self, name: &str) -> Result<(), BackendError> {
        let (signature, kernel) = self
            .kernels
            .iter()
            .find(|(signature, _)| signature.name == name)
            .copied()
            .ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;

        for (index, buffer_name) in signature.args.iter().enumerate() {
            let buffer = self.handle(buffer_name)?;
            self.backend.set_kernel_argument(kernel, index, KernelArg::Buffer(buffer))?;
        }
        self.backend.execute_kernel(kernel, self.capacity, Some(WORK_GROUP_SIZE))
    }

    pub fn read_max_density_error(&mut self) -> Result<FT, BackendError> {
        let bytes = self.read("max_density_error", layout::SCALAR_SIZE)?;
        Ok(layout::decode_scalars(&bytes, 1)?[0])
    }

    /// Copies the device particles back into caller order.
    pub fn read_back(&mut self, particles: &mut ParticleVec) -> Result<(), BackendError> {
        self.backend.wait_until_finished()?;

        let n = self.particle_count;
        if particles.len() != n {
            return Err(BackendError::Layout(format!(
                "host holds {} particles, device holds {}",
                particles.len(),
                n
            )));
        }

        let vector_bytes = n * layout::VEC_SIZE;
        let scalar_bytes = n * layout::SCALAR_SIZE;
        let ids = layout::decode_indices(&self.read("id", scalar_bytes)?, n)?;
        if ids.iter().any(|&id| id as usize >= n) {
            return Err(BackendError::Layout("particle id out of range".to_string()));
        }

        let position = layout::decode_vectors(&self.read("position", vector_bytes)?, n)?;
        let velocity = layout::decode_vectors(&self.read("velocity", vector_bytes)?, n)?;
        let half_velocity = layout::decode_vectors(&self.read("half_velocity", vector_bytes)?, n)?;
        let old_half_velocity = layout::decode_vectors(&self.read("old_half_velocity", vector_bytes)?, n)?;
        let force = layout::decode_vectors(&self.read("force", vector_bytes)?, n)?;
        let density = layout::decode_scalars(&self.read("density", scalar_bytes)?, n)?;
        let pressure = layout::decode_scalars(&self.read("pressure", scalar_bytes)?, n)?;
        let first_step = layout::decode_flags(&self.read("first_step", scalar_bytes)?, n)?;

        for (k, &id) in ids.iter().enumerate() {
            let i = id as usize;
            particles.position[i] = position[k];
            particles.velocity[i] = velocity[k];
            particles.half_velocity[i] = half_velocity[k];
            particles.old_half_velocity[i] = old_half_velocity[k];
            particles.force[i] = force[k];
            particles.density[i] = density[k];
            particles.pressure[i] = pressure[k];
            particles.first_step[i] = first_step[k];
        }
        Ok(())
    }
}

/// One simulation step executed as kernel launches on a device session.
pub struct DevicePipeline<'a> {
    session: &'a mut DeviceSession,
    particles: &'a mut ParticleVec,
    params: SolverParams,
}

impl<'a> DevicePipeline<'a> {
    pub fn new(session: &'a mut DeviceSession, particles: &'a mut ParticleVec, params: SolverParams) -> Self {
        DevicePipeline {
            session,
            particles,
            params,
        }
    }
}

impl<'a> StepPipeline for DevicePipeline<'a> {
    fn begin_step(&mut self) -> Result<(), SimulationError> {
        // host positions equal the device positions up to order, so the bounds match
        let geometry = GridGeometry::from_positions(&ParallelSurface, &self.particles.position, self.params.kernel_radius);
        self.session.write_params(&self.params)?;
        self.session.write_grid(&geometry)?;

        self.session.run("calc_grid_indices")?;
        self.session.run("sort_particles")?;
        self.session.run("build_cell_list")?;
        self.session.run("calc_density_pressure")?;
        Ok(())
    }

    fn accumulate_non_pressure_forces(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("accumulate_non_pressure_forces")?)
    }

    fn accumulate_pressure_forces(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("accumulate_pressure_forces")?)
    }

    fn integrate(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("integrate")?)
    }

    fn handle_collisions(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("handle_collisions")?)
    }

    fn end_step(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.read_back(self.particles)?)
    }

    fn pci_init(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("pci_init")?)
    }

    fn pci_predict(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("pci_integrate")?)
    }

    fn pci_handle_collisions(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("pci_handle_collisions")?)
    }

    fn pci_density_pressure(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("pci_calc_density_pressure")?)
    }

    fn pci_pressure_force(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("pci_calc_pressure_force")?)
    }

    fn pci_max_density_error(&mut self) -> Result<FT, SimulationError> {
        self.session.run("pci_max_density_error")?;
        Ok(self.session.read_max_density_error()?)
    }

    fn pci_add_pressure_force(&mut self) -> Result<(), SimulationError> {
        Ok(self.session.run("pci_add_pressure_force")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collision::{CollisionBox, CollisionKind},
        particles::Particle,
        simulation_parameters::SolverConfig,
        vec3f,
    };

    fn sample_particles(n: usize) -> ParticleVec {
        let mut particles = ParticleVec::default();
        for i in 0..n {
            let x = (i % 7) as FT * 0.03;
            let y = (i / 7 % 7) as FT * 0.03;
            let z = (i / 49) as FT * 0.03;
            particles.push(Particle::new(vec3f(x, y, z), vec3f(0.1 * i as FT, 0., 0.)));
        }
        particles
    }

    #[test]
    fn dirty_flags_are_cleared_after_sync() {
        let config = SolverConfig::default();
        let kernels = SphKernels::new(config.kernel_radius(), config.kernel_subdivisions).unwrap();
        let particles = sample_particles(100);
        let objects: Vec<StaticCollisionObject> =
            vec![CollisionBox::new(vec3f(0., 0., 0.), vec3f(1., 1., 1.), CollisionKind::Boundary).into()];

        let mut session = DeviceSession::new(Box::new(HostBackend::new()));
        let mut dirty = DirtyFlags::default();
        assert!(dirty.any());

        session
            .sync(DeviceClass::Cpu, &mut dirty, &particles, &objects, &kernels)
            .unwrap();
        assert_eq!(dirty, DirtyFlags::clean());
        assert_eq!(session.device_class(), Some(DeviceClass::Cpu));
        assert_eq!(session.capacity(), layout::MIN_CAPACITY);

        // a gpu context cannot be created on the host backend, the flags survive the failure
        let mut dirty = DirtyFlags {
            collision_objects: true,
            ..DirtyFlags::clean()
        };
        assert_eq!(
            session.sync(DeviceClass::Gpu, &mut dirty, &particles, &objects, &kernels),
            Err(BackendError::NoDevice)
        );
        assert!(dirty.collision_objects);
    }

    #[test]
    fn particles_survive_upload_sort_and_readback() {
        let config = SolverConfig::default();
        let kernels = SphKernels::new(config.kernel_radius(), config.kernel_subdivisions).unwrap();
        let original = sample_particles(600);

        let mut session = DeviceSession::new(Box::new(HostBackend::new()));
        let mut dirty = DirtyFlags::default();
        session
            .sync(DeviceClass::Cpu, &mut dirty, &original, &[], &kernels)
            .unwrap();
        assert_eq!(session.capacity(), 640);

        let mut params = SolverParams::new(&config, 0.01, kernels.density.step());
        params.time_step = 0.001;
        let mut particles = original.clone();
        let geometry = GridGeometry::from_positions(&ParallelSurface, &particles.position, params.kernel_radius);
        session.write_params(&params).unwrap();
        session.write_grid(&geometry).unwrap();
        session.run("calc_grid_indices").unwrap();
        session.run("sort_particles").unwrap();

        // the device order changed, the caller order did not
        let sorted = layout::decode_vectors(&session.read("position", 600 * layout::VEC_SIZE).unwrap(), 600).unwrap();
        assert_ne!(sorted, original.position);

        session.read_back(&mut particles).unwrap();
        assert_eq!(particles, original);

        assert!(matches!(session.run("no_such_kernel"), Err(BackendError::UnknownKernel(_))));
    }
}
