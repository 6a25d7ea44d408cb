/*!
The device program: kernel signatures shared by every backend and the host implementation of each kernel.

Argument 0 of every kernel is the parameter block. Kernels that search neighbors take the grid info,
the cell starts, the packed kernel tables and the committed positions as arguments 1 to 4.
*/

use super::{
    host_backend::KernelInvocation,
    layout::{self, DeviceParams},
};
use crate::{
    concurrency::{ExecutionSurface, ParallelSurface},
    error::BackendError,
    floating_type_mod::FT,
    neighborhood_search::{compute_cell_starts, compute_grid_indices, CellListView, GridGeometry},
    sph_kernels::{KernelLookups, KERNEL_TABLE_COUNT},
    stages, V3,
};

pub type HostKernelFn = fn(&mut KernelInvocation) -> Result<(), BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: &'static str,
    /// device buffer bound to each argument, in order
    pub args: &'static [&'static str],
}

pub const PROGRAM: &[KernelSignature] = &[
    KernelSignature {
        name: "calc_grid_indices",
        args: &["params", "grid_info", "position", "grid_index", "sort_index"],
    },
    KernelSignature {
        name: "sort_particles",
        args: &[
            "params",
            "grid_index",
            "sort_index",
            "position",
            "velocity",
            "half_velocity",
            "old_half_velocity",
            "force",
            "density",
            "pressure",
            "first_step",
            "id",
        ],
    },
    KernelSignature {
        name: "build_cell_list",
        args: &["params", "grid_info", "grid_index", "cell_starts"],
    },
    KernelSignature {
        name: "calc_density_pressure",
        args: &["params", "grid_info", "cell_starts", "kernel_weights", "position", "density", "pressure"],
    },
    KernelSignature {
        name: "accumulate_non_pressure_forces",
        args: &[
            "params",
            "grid_info",
            "cell_starts",
            "kernel_weights",
            "position",
            "velocity",
            "density",
            "force",
        ],
    },
    KernelSignature {
        name: "accumulate_pressure_forces",
        args: &[
            "params",
            "grid_info",
            "cell_starts",
            "kernel_weights",
            "position",
            "density",
            "pressure",
            "force",
        ],
    },
    KernelSignature {
        name: "integrate",
        args: &[
            "params",
            "velocity",
            "density",
            "position",
            "half_velocity",
            "old_half_velocity",
            "first_step",
            "force",
        ],
    },
    KernelSignature {
        name: "handle_collisions",
        args: &[
            "params",
            "collision_objects",
            "old_half_velocity",
            "position",
            "half_velocity",
            "velocity",
        ],
    },
    KernelSignature {
        name: "pci_init",
        args: &["params", "pressure", "predicted_pressure_force"],
    },
    KernelSignature {
        name: "pci_integrate",
        args: &[
            "params",
            "position",
            "velocity",
            "half_velocity",
            "force",
            "predicted_pressure_force",
            "density",
            "first_step",
            "predicted_position",
            "predicted_half_velocity",
        ],
    },
    KernelSignature {
        name: "pci_handle_collisions",
        args: &["params", "collision_objects", "predicted_position", "predicted_half_velocity"],
    },
    KernelSignature {
        name: "pci_calc_density_pressure",
        args: &[
            "params",
            "grid_info",
            "cell_starts",
            "kernel_weights",
            "position",
            "predicted_position",
            "predicted_density",
            "density_error",
            "pressure",
        ],
    },
    KernelSignature {
        name: "pci_calc_pressure_force",
        args: &[
            "params",
            "grid_info",
            "cell_starts",
            "kernel_weights",
            "position",
            "predicted_position",
            "predicted_density",
            "pressure",
            "density",
            "predicted_pressure_force",
        ],
    },
    KernelSignature {
        name: "pci_max_density_error",
        args: &["params", "density_error", "max_density_error"],
    },
    KernelSignature {
        name: "pci_add_pressure_force",
        args: &["params", "predicted_pressure_force", "force"],
    },
];

pub fn signature(name: &str) -> Option<&'static KernelSignature> {
    PROGRAM.iter().find(|s| s.name == name)
}

pub fn host_entry(name: &str) -> Option<HostKernelFn> {
    let entry: HostKernelFn = match name {
        "calc_grid_indices" => calc_grid_indices,
        "sort_particles" => sort_particles,
        "build_cell_list" => build_cell_list,
        "calc_density_pressure" => calc_density_pressure,
        "accumulate_non_pressure_forces" => accumulate_non_pressure_forces,
        "accumulate_pressure_forces" => accumulate_pressure_forces,
        "integrate" => integrate,
        "handle_collisions" => handle_collisions,
        "pci_init" => pci_init,
        "pci_integrate" => pci_integrate,
        "pci_handle_collisions" => pci_handle_collisions,
        "pci_calc_density_pressure" => pci_calc_density_pressure,
        "pci_calc_pressure_force" => pci_calc_pressure_force,
        "pci_max_density_error" => pci_max_density_error,
        "pci_add_pressure_force" => pci_add_pressure_force,
        _ => return None,
    };
    Some(entry)
}

/// Declarations an external backend compiles its program against: layout constants and kernel signatures.
pub fn program_source() -> String {
    let mut source = String::new();
    let defines: [(&str, usize); 6] = [
        ("WORK_GROUP_SIZE", layout::WORK_GROUP_SIZE),
        ("PARAMS_SIZE", layout::PARAMS_SIZE),
        ("GRID_INFO_SIZE", layout::GRID_INFO_SIZE),
        ("COLLISION_OBJECT_SIZE", layout::COLLISION_OBJECT_SIZE),
        ("SHAPE_BOX", layout::SHAPE_BOX as usize),
        ("SHAPE_SPHERE", layout::SHAPE_SPHERE as usize),
    ];
    for (name, value) in defines {
        source.push_str(&format!("#define {} {}\n", name, value));
    }
    for kernel in PROGRAM {
        source.push_str(&format!("kernel void {}({});\n", kernel.name, kernel.args.join(", ")));
    }
    source
}

fn params(inv: &KernelInvocation) -> Result<DeviceParams, BackendError> {
    layout::decode_params(inv.bytes(0)?)
}

fn vectors(inv: &KernelInvocation, index: usize, n: usize) -> Result<Vec<V3>, BackendError> {
    layout::decode_vectors(inv.bytes(index)?, n)
}

fn scalars(inv: &KernelInvocation, index: usize, n: usize) -> Result<Vec<FT>, BackendError> {
    layout::decode_scalars(inv.bytes(index)?, n)
}

fn indices(inv: &KernelInvocation, index: usize, n: usize) -> Result<Vec<u32>, BackendError> {
    layout::decode_indices(inv.bytes(index)?, n)
}

fn flags(inv: &KernelInvocation, index: usize, n: usize) -> Result<Vec<bool>, BackendError> {
    layout::decode_flags(inv.bytes(index)?, n)
}

fn store_vectors(inv: &mut KernelInvocation, index: usize, values: &[V3]) -> Result<(), BackendError> {
    inv.write(index, &layout::encode_vectors(values, 0))
}

fn store_scalars(inv: &mut KernelInvocation, index: usize, values: &[FT]) -> Result<(), BackendError> {
    inv.write(index, &layout::encode_scalars(values, 0))
}

fn store_indices(inv: &mut KernelInvocation, index: usize, values: &[u32]) -> Result<(), BackendError> {
    inv.write(index, &layout::encode_indices(values, 0))
}

fn store_flags(inv: &mut KernelInvocation, index: usize, values: &[bool]) -> Result<(), BackendError> {
    inv.write(index, &layout::encode_flags(values, 0))
}

/// Everything a neighbor searching kernel reads from arguments 1 to 4.
struct NeighborData {
    geometry: GridGeometry,
    cell_starts: Vec<u32>,
    kernel_weights: Vec<FT>,
    positions: Vec<V3>,
}

impl NeighborData {
    fn decode(inv: &KernelInvocation, params: &DeviceParams) -> Result<NeighborData, BackendError> {
        let n = params.particle_count as usize;
        let geometry = layout::decode_grid_info(inv.bytes(1)?)?;
        let cell_starts = indices(inv, 2, geometry.cell_count as usize + 1)?;
        if cell_starts.last().copied() != Some(params.particle_count) {
            return Err(BackendError::Layout(format!(
                "cell list of kernel `{}` does not cover {} particles",
                inv.kernel_name(),
                n
            )));
        }
        let entries = params.kernel_table_entries as usize;
        let kernel_weights = scalars(inv, 3, entries * KERNEL_TABLE_COUNT)?;
        let positions = vectors(inv, 4, n)?;
        Ok(NeighborData {
            geometry,
            cell_starts,
            kernel_weights,
            positions,
        })
    }

    fn lookups(&self, params: &DeviceParams) -> Result<KernelLookups<'_>, BackendError> {
        KernelLookups::from_packed(
            &self.kernel_weights,
            params.kernel_table_entries as usize,
            params.solver.kernel_division_step,
            params.solver.kernel_radius,
        )
        .ok_or_else(|| BackendError::Layout("kernel weight tables are empty".to_string()))
    }

    fn view(&self, params: &DeviceParams) -> CellListView<'_> {
        CellListView {
            geometry: self.geometry,
            cell_starts: &self.cell_starts,
            positions: &self.positions,
            radius: params.solver.kernel_radius,
        }
    }
}

fn calc_grid_indices(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let geometry = layout::decode_grid_info(inv.bytes(1)?)?;
    let positions = vectors(inv, 2, n)?;

    let mut grid_indices = vec![0u32; n];
    compute_grid_indices(&ParallelSurface, &geometry, &positions, &mut grid_indices);
    let sort_indices: Vec<u32> = (0..n as u32).collect();

    store_indices(inv, 3, &grid_indices)?;
    store_indices(inv, 4, &sort_indices)
}

fn gather<T: Copy + Send + Sync>(src: &[T], permutation: &[u32]) -> Vec<T> {
    let mut dst = src.to_vec();
    ParallelSurface.gather(src, permutation, &mut dst);
    dst
}

fn sort_particles(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;

    let mut keys = indices(inv, 1, n)?;
    let mut permutation = indices(inv, 2, n)?;
    ParallelSurface.sort_by_key(&mut keys, &mut permutation);
    store_indices(inv, 1, &keys)?;
    store_indices(inv, 2, &permutation)?;

    for index in 3..=7 {
        let column = gather(&vectors(inv, index, n)?, &permutation);
        store_vectors(inv, index, &column)?;
    }
    for index in 8..=9 {
        let column = gather(&scalars(inv, index, n)?, &permutation);
        store_scalars(inv, index, &column)?;
    }
    let first_step = gather(&flags(inv, 10, n)?, &permutation);
    store_flags(inv, 10, &first_step)?;
    let ids = gather(&indices(inv, 11, n)?, &permutation);
    store_indices(inv, 11, &ids)
}

fn build_cell_list(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let geometry = layout::decode_grid_info(inv.bytes(1)?)?;
    let grid_indices = indices(inv, 2, p.particle_count as usize)?;

    let mut cell_starts = vec![0u32; geometry.cell_count as usize + 1];
    compute_cell_starts(&ParallelSurface, &grid_indices, &mut cell_starts);
    store_indices(inv, 3, &cell_starts)
}

fn calc_density_pressure(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let data = NeighborData::decode(inv, &p)?;

    let mut densities = vec![0.; n];
    let mut pressures = vec![0.; n];
    stages::compute_density_pressure(
        &ParallelSurface,
        &p.solver,
        &data.lookups(&p)?,
        &data.view(&p),
        &data.positions,
        &mut densities,
        &mut pressures,
    );

    store_scalars(inv, 5, &densities)?;
    store_scalars(inv, 6, &pressures)
}

fn accumulate_non_pressure_forces(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let data = NeighborData::decode(inv, &p)?;
    let velocities = vectors(inv, 5, n)?;
    let densities = scalars(inv, 6, n)?;
    let mut forces = vectors(inv, 7, n)?;

    stages::accumulate_non_pressure_forces(
        &ParallelSurface,
        &p.solver,
        &data.lookups(&p)?,
        &data.view(&p),
        &data.positions,
        &velocities,
        &densities,
        &mut forces,
    );

    store_vectors(inv, 7, &forces)
}

fn accumulate_pressure_forces(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let data = NeighborData::decode(inv, &p)?;
    let densities = scalars(inv, 5, n)?;
    let pressures = scalars(inv, 6, n)?;
    let mut forces = vectors(inv, 7, n)?;

    stages::accumulate_pressure_forces(
        &ParallelSurface,
        &p.solver,
        &data.lookups(&p)?,
        &data.view(&p),
        &data.positions,
        &densities,
        &pressures,
        &mut forces,
    );

    store_vectors(inv, 7, &forces)
}

fn integrate(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let velocities = vectors(inv, 1, n)?;
    let densities = scalars(inv, 2, n)?;
    let mut positions = vectors(inv, 3, n)?;
    let mut half_velocities = vectors(inv, 4, n)?;
    let mut old_half_velocities = vec![V3::zeros(); n];
    let mut first_step = flags(inv, 6, n)?;
    let mut forces = vectors(inv, 7, n)?;

    stages::integrate(
        &ParallelSurface,
        p.solver.time_step,
        &velocities,
        &densities,
        &mut positions,
        &mut half_velocities,
        &mut old_half_velocities,
        &mut first_step,
        &mut forces,
    );

    store_vectors(inv, 3, &positions)?;
    store_vectors(inv, 4, &half_velocities)?;
    store_vectors(inv, 5, &old_half_velocities)?;
    store_flags(inv, 6, &first_step)?;
    store_vectors(inv, 7, &forces)
}

fn handle_collisions(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let objects = layout::decode_collision_objects(inv.bytes(1)?, p.collision_object_count as usize)?;
    let old_half_velocities = vectors(inv, 2, n)?;
    let mut positions = vectors(inv, 3, n)?;
    let mut half_velocities = vectors(inv, 4, n)?;
    let mut velocities = vec![V3::zeros(); n];

    stages::handle_collisions(
        &ParallelSurface,
        &p.solver,
        &objects,
        &old_half_velocities,
        &mut positions,
        &mut half_velocities,
        &mut velocities,
    );

    store_vectors(inv, 3, &positions)?;
    store_vectors(inv, 4, &half_velocities)?;
    store_vectors(inv, 5, &velocities)
}

fn pci_init(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let n = params(inv)?.particle_count as usize;
    let mut pressures = vec![0.; n];
    let mut predicted_pressure_forces = vec![V3::zeros(); n];
    stages::pci_init(&ParallelSurface, &mut pressures, &mut predicted_pressure_forces);

    store_scalars(inv, 1, &pressures)?;
    store_vectors(inv, 2, &predicted_pressure_forces)
}

fn pci_integrate(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let positions = vectors(inv, 1, n)?;
    let velocities = vectors(inv, 2, n)?;
    let half_velocities = vectors(inv, 3, n)?;
    let forces = vectors(inv, 4, n)?;
    let predicted_pressure_forces = vectors(inv, 5, n)?;
    let densities = scalars(inv, 6, n)?;
    let first_step = flags(inv, 7, n)?;

    let mut predicted_positions = vec![V3::zeros(); n];
    let mut predicted_half_velocities = vec![V3::zeros(); n];
    stages::pci_predict(
        &ParallelSurface,
        p.solver.time_step,
        &positions,
        &velocities,
        &half_velocities,
        &forces,
        &predicted_pressure_forces,
        &densities,
        &first_step,
        &mut predicted_positions,
        &mut predicted_half_velocities,
    );

    store_vectors(inv, 8, &predicted_positions)?;
    store_vectors(inv, 9, &predicted_half_velocities)
}

fn pci_handle_collisions(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let objects = layout::decode_collision_objects(inv.bytes(1)?, p.collision_object_count as usize)?;
    let mut predicted_positions = vectors(inv, 2, n)?;
    let mut predicted_half_velocities = vectors(inv, 3, n)?;

    stages::pci_handle_collisions(
        &ParallelSurface,
        &p.solver,
        &objects,
        &mut predicted_positions,
        &mut predicted_half_velocities,
    );

    store_vectors(inv, 2, &predicted_positions)?;
    store_vectors(inv, 3, &predicted_half_velocities)
}

fn pci_calc_density_pressure(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let data = NeighborData::decode(inv, &p)?;
    let predicted_positions = vectors(inv, 5, n)?;
    let mut predicted_densities = vec![0.; n];
    let mut density_errors = vec![0.; n];
    let mut pressures = scalars(inv, 8, n)?;

    stages::pci_density_pressure(
        &ParallelSurface,
        &p.solver,
        &data.lookups(&p)?,
        &data.view(&p),
        &predicted_positions,
        &mut predicted_densities,
        &mut density_errors,
        &mut pressures,
    );

    store_scalars(inv, 6, &predicted_densities)?;
    store_scalars(inv, 7, &density_errors)?;
    store_scalars(inv, 8, &pressures)
}

fn pci_calc_pressure_force(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let p = params(inv)?;
    let n = p.particle_count as usize;
    let data = NeighborData::decode(inv, &p)?;
    let predicted_positions = vectors(inv, 5, n)?;
    let predicted_densities = scalars(inv, 6, n)?;
    let pressures = scalars(inv, 7, n)?;
    let densities = scalars(inv, 8, n)?;
    let mut predicted_pressure_forces = vec![V3::zeros(); n];

    stages::pci_pressure_force(
        &ParallelSurface,
        &p.solver,
        &data.lookups(&p)?,
        &data.view(&p),
        &predicted_positions,
        &predicted_densities,
        &pressures,
        &densities,
        &mut predicted_pressure_forces,
    );

    store_vectors(inv, 9, &predicted_pressure_forces)
}

fn pci_max_density_error(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let n = params(inv)?.particle_count as usize;
    let density_errors = scalars(inv, 1, n)?;
    let max_error = stages::max_density_error(&ParallelSurface, &density_errors);
    store_scalars(inv, 2, &[max_error])
}

fn pci_add_pressure_force(inv: &mut KernelInvocation) -> Result<(), BackendError> {
    let n = params(inv)?.particle_count as usize;
    let predicted_pressure_forces = vectors(inv, 1, n)?;
    let mut forces = vectors(inv, 2, n)?;
    stages::pci_add_pressure_force(&ParallelSurface, &predicted_pressure_forces, &mut forces);
    store_vectors(inv, 2, &forces)
}

#[test]
fn every_signature_has_a_host_entry() {
    for kernel in PROGRAM {
        assert!(host_entry(kernel.name).is_some(), "{}", kernel.name);
        assert_eq!(kernel.args[0], "params", "{}", kernel.name);
    }
    assert!(host_entry("missing").is_none());

    let source = program_source();
    assert_eq!(source.lines().count(), 6 + PROGRAM.len());
    assert!(source.ends_with(");\n"));
    assert!(source.contains("#define WORK_GROUP_SIZE 64"));
    assert!(source.contains("kernel void pci_max_density_error(params, density_error, max_density_error);"));
}

#[test]
fn neighbor_kernels_share_the_leading_arguments() {
    for kernel in PROGRAM {
        if kernel.args.contains(&"cell_starts") && kernel.name != "build_cell_list" {
            assert_eq!(
                &kernel.args[..5],
                &["params", "grid_info", "cell_starts", "kernel_weights", "position"],
                "{}",
                kernel.name
            );
        }
    }
}
