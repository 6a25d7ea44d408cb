/*!
Byte layout of every device buffer. All values are little endian, floats are 32 bit, vectors are
padded to four components.

Parameter block (`PARAMS_SIZE` bytes):

| offset | field                       |
|-------:|-----------------------------|
|      0 | gravity (float4)            |
|     16 | particle mass               |
|     20 | particle radius             |
|     24 | kernel radius               |
|     28 | kernel division step        |
|     32 | rest density                |
|     36 | viscosity                   |
|     40 | pressure stiffness          |
|     44 | negative pressure factor    |
|     48 | surface tension             |
|     52 | surface tension threshold   |
|     56 | restitution                 |
|     60 | friction                    |
|     64 | time step                   |
|     68 | PCISPH delta                |
|     72 | particle count (u32)        |
|     76 | collision object count (u32)|
|     80 | entries per kernel table (u32) |

Grid info (`GRID_INFO_SIZE` bytes): offset float4 at 0, size uint4 at 16, spacing at 32, cell count at 36.

Collision record (`COLLISION_OBJECT_SIZE` bytes): center float4 at 0, half dimensions float4 at 16 (a sphere
stores its radius in x), shape tag at 32 (`SHAPE_BOX`/`SHAPE_SPHERE`), kind at 36 (0 obstacle, 1 boundary).
*/

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    collision::{CollisionBox, CollisionKind, CollisionSphere, StaticCollisionObject},
    error::BackendError,
    floating_type_mod::FT,
    neighborhood_search::GridGeometry,
    simulation_parameters::SolverParams,
    vec3f, V3,
};

pub const WORK_GROUP_SIZE: usize = 64;
pub const MIN_CAPACITY: usize = 512;

pub const SCALAR_SIZE: usize = 4;
pub const VEC_SIZE: usize = 16;
pub const PARAMS_SIZE: usize = 128;
pub const GRID_INFO_SIZE: usize = 48;
pub const COLLISION_OBJECT_SIZE: usize = 64;

pub const SHAPE_BOX: u32 = 0;
pub const SHAPE_SPHERE: u32 = 1;

/// Particle capacity for `n` particles: at least `MIN_CAPACITY` and a multiple of the work group size.
pub fn padded_capacity(n: usize) -> usize {
    let n = n.max(MIN_CAPACITY);
    (n + WORK_GROUP_SIZE - 1) / WORK_GROUP_SIZE * WORK_GROUP_SIZE
}

fn check_len(bytes: &[u8], needed: usize, what: &str) -> Result<(), BackendError> {
    if bytes.len() < needed {
        Err(BackendError::Layout(format!(
            "{} needs {} bytes, buffer holds {}",
            what,
            needed,
            bytes.len()
        )))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn put_f(bytes: &mut [u8], offset: usize, value: FT) {
    LittleEndian::write_f32(&mut bytes[offset..offset + 4], value as f32);
}

#[inline(always)]
fn get_f(bytes: &[u8], offset: usize) -> FT {
    LittleEndian::read_f32(&bytes[offset..offset + 4]) as FT
}

#[inline(always)]
fn put_u(bytes: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut bytes[offset..offset + 4], value);
}

#[inline(always)]
fn get_u(bytes: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&bytes[offset..offset + 4])
}

#[inline(always)]
fn put_v3(bytes: &mut [u8], offset: usize, v: V3) {
    for d in 0..3 {
        put_f(bytes, offset + 4 * d, v[d]);
    }
    put_f(bytes, offset + 12, 0.);
}

#[inline(always)]
fn get_v3(bytes: &[u8], offset: usize) -> V3 {
    vec3f(get_f(bytes, offset), get_f(bytes, offset + 4), get_f(bytes, offset + 8))
}

/// Solver parameters plus the counts a kernel needs to interpret the other buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceParams {
    pub solver: SolverParams,
    pub particle_count: u32,
    pub collision_object_count: u32,
    pub kernel_table_entries: u32,
}

pub fn encode_params(params: &DeviceParams) -> Vec<u8> {
    let mut bytes = vec![0u8; PARAMS_SIZE];
    let s = &params.solver;
    put_v3(&mut bytes, 0, s.gravity);
    put_f(&mut bytes, 16, s.particle_mass);
    put_f(&mut bytes, 20, s.particle_radius);
    put_f(&mut bytes, 24, s.kernel_radius);
    put_f(&mut bytes, 28, s.kernel_division_step);
    put_f(&mut bytes, 32, s.rest_density);
    put_f(&mut bytes, 36, s.viscosity);
    put_f(&mut bytes, 40, s.pressure_stiffness);
    put_f(&mut bytes, 44, s.negative_pressure_factor);
    put_f(&mut bytes, 48, s.surface_tension);
    put_f(&mut bytes, 52, s.surface_tension_threshold);
    put_f(&mut bytes, 56, s.restitution);
    put_f(&mut bytes, 60, s.friction);
    put_f(&mut bytes, 64, s.time_step);
    put_f(&mut bytes, 68, s.pcisph_delta);
    put_u(&mut bytes, 72, params.particle_count);
    put_u(&mut bytes, 76, params.collision_object_count);
    put_u(&mut bytes, 80, params.kernel_table_entries);
    bytes
}

pub fn decode_params(bytes: &[u8]) -> Result<DeviceParams, BackendError> {
    check_len(bytes, PARAMS_SIZE, "parameter block")?;
    Ok(DeviceParams {
        solver: SolverParams {
            gravity: get_v3(bytes, 0),
            particle_mass: get_f(bytes, 16),
            particle_radius: get_f(bytes, 20),
            kernel_radius: get_f(bytes, 24),
            kernel_division_step: get_f(bytes, 28),
            rest_density: get_f(bytes, 32),
            viscosity: get_f(bytes, 36),
            pressure_stiffness: get_f(bytes, 40),
            negative_pressure_factor: get_f(bytes, 44),
            surface_tension: get_f(bytes, 48),
            surface_tension_threshold: get_f(bytes, 52),
            restitution: get_f(bytes, 56),
            friction: get_f(bytes, 60),
            time_step: get_f(bytes, 64),
            pcisph_delta: get_f(bytes, 68),
        },
        particle_count: get_u(bytes, 72),
        collision_object_count: get_u(bytes, 76),
        kernel_table_entries: get_u(bytes, 80),
    })
}

pub fn encode_grid_info(geometry: &GridGeometry) -> Vec<u8> {
    let mut bytes = vec![0u8; GRID_INFO_SIZE];
    put_v3(&mut bytes, 0, geometry.offset);
    for d in 0..3 {
        put_u(&mut bytes, 16 + 4 * d, geometry.size[d]);
    }
    put_f(&mut bytes, 32, geometry.spacing);
    put_u(&mut bytes, 36, geometry.cell_count);
    bytes
}

pub fn decode_grid_info(bytes: &[u8]) -> Result<GridGeometry, BackendError> {
    check_len(bytes, GRID_INFO_SIZE, "grid info")?;
    let size = [get_u(bytes, 16), get_u(bytes, 20), get_u(bytes, 24)];
    let cell_count = get_u(bytes, 36);
    if size.iter().any(|&s| s == 0) || size[0] as u64 * size[1] as u64 * size[2] as u64 != cell_count as u64 {
        return Err(BackendError::Layout(format!(
            "grid size {:?} does not match cell count {}",
            size, cell_count
        )));
    }
    Ok(GridGeometry {
        offset: get_v3(bytes, 0),
        size,
        spacing: get_f(bytes, 32),
        cell_count,
    })
}

/// One record per object, in registration order. An empty list still occupies one zeroed record.
pub fn encode_collision_objects(objects: &[StaticCollisionObject]) -> Vec<u8> {
    let mut bytes = vec![0u8; objects.len().max(1) * COLLISION_OBJECT_SIZE];
    for (i, object) in objects.iter().enumerate() {
        let o = i * COLLISION_OBJECT_SIZE;
        let (center, half_dimensions, shape, kind) = match object {
            StaticCollisionObject::CollisionBox(b) => (b.center, b.half_dimensions, SHAPE_BOX, b.kind),
            StaticCollisionObject::CollisionSphere(s) => (s.center, vec3f(s.radius, 0., 0.), SHAPE_SPHERE, s.kind),
        };
        put_v3(&mut bytes, o, center);
        put_v3(&mut bytes, o + 16, half_dimensions);
        put_u(&mut bytes, o + 32, shape);
        put_u(
            &mut bytes,
            o + 36,
            match kind {
                CollisionKind::Obstacle => 0,
                CollisionKind::Boundary => 1,
            },
        );
    }
    bytes
}

pub fn decode_collision_objects(bytes: &[u8], count: usize) -> Result<Vec<StaticCollisionObject>, BackendError> {
    check_len(bytes, count * COLLISION_OBJECT_SIZE, "collision objects")?;
    (0..count)
        .map(|i| {
            let o = i * COLLISION_OBJECT_SIZE;
            let center = get_v3(bytes, o);
            let half_dimensions = get_v3(bytes, o + 16);
            let kind = match get_u(bytes, o + 36) {
                0 => CollisionKind::Obstacle,
                1 => CollisionKind::Boundary,
                other => return Err(BackendError::Layout(format!("unknown collision kind {}", other))),
            };
            match get_u(bytes, o + 32) {
                SHAPE_BOX => Ok(CollisionBox::new(center, half_dimensions, kind).into()),
                SHAPE_SPHERE => Ok(CollisionSphere::new(center, half_dimensions.x, kind).into()),
                other => Err(BackendError::Layout(format!("unknown collision shape {}", other))),
            }
        })
        .collect()
}

pub fn encode_vectors(values: &[V3], capacity: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; capacity.max(values.len()) * VEC_SIZE];
    for (i, &v) in values.iter().enumerate() {
        put_v3(&mut bytes, i * VEC_SIZE, v);
    }
    bytes
}

pub fn decode_vectors(bytes: &[u8], count: usize) -> Result<Vec<V3>, BackendError> {
    check_len(bytes, count * VEC_SIZE, "vector column")?;
    Ok((0..count).map(|i| get_v3(bytes, i * VEC_SIZE)).collect())
}

pub fn encode_scalars(values: &[FT], capacity: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; capacity.max(values.len()) * SCALAR_SIZE];
    for (i, &v) in values.iter().enumerate() {
        put_f(&mut bytes, i * SCALAR_SIZE, v);
    }
    bytes
}

pub fn decode_scalars(bytes: &[u8], count: usize) -> Result<Vec<FT>, BackendError> {
    check_len(bytes, count * SCALAR_SIZE, "scalar column")?;
    Ok((0..count).map(|i| get_f(bytes, i * SCALAR_SIZE)).collect())
}

pub fn encode_indices(values: &[u32], capacity: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; capacity.max(values.len()) * SCALAR_SIZE];
    LittleEndian::write_u32_into(values, &mut bytes[..values.len() * SCALAR_SIZE]);
    bytes
}

pub fn decode_indices(bytes: &[u8], count: usize) -> Result<Vec<u32>, BackendError> {
    check_len(bytes, count * SCALAR_SIZE, "index column")?;
    let mut values = vec![0u32; count];
    LittleEndian::read_u32_into(&bytes[..count * SCALAR_SIZE], &mut values);
    Ok(values)
}

pub fn encode_flags(values: &[bool], capacity: usize) -> Vec<u8> {
    let values: Vec<u32> = values.iter().map(|&b| b as u32).collect();
    encode_indices(&values, capacity)
}

pub fn decode_flags(bytes: &[u8], count: usize) -> Result<Vec<bool>, BackendError> {
    Ok(decode_indices(bytes, count)?.into_iter().map(|x| x != 0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation_parameters::SolverConfig;

    #[test]
    fn params_survive_the_parameter_block() {
        let mut solver = SolverParams::new(&SolverConfig::default(), 0.0123, 0.0456);
        solver.time_step = 0.001;
        solver.pcisph_delta = 12.5;
        let params = DeviceParams {
            solver,
            particle_count: 4321,
            collision_object_count: 3,
            kernel_table_entries: 1001,
        };

        let bytes = encode_params(&params);
        assert_eq!(bytes.len(), PARAMS_SIZE);
        assert_eq!(LittleEndian::read_u32(&bytes[72..]), 4321);
        assert_eq!(LittleEndian::read_f32(&bytes[4..]), -9.81);

        let decoded = decode_params(&bytes).unwrap();
        assert_eq!(decoded.particle_count, 4321);
        assert_eq!(decoded.kernel_table_entries, 1001);
        assert_eq!(decoded.solver.pcisph_delta, 12.5);
        assert_eq!(decoded.solver.gravity, solver.gravity);

        assert!(decode_params(&bytes[..64]).is_err());
    }

    #[test]
    fn collision_records_keep_order_and_shape() {
        let objects: Vec<StaticCollisionObject> = vec![
            CollisionSphere::new(vec3f(0., 0.5, 0.), 0.25, CollisionKind::Obstacle).into(),
            CollisionBox::new(vec3f(1., 2., 3.), vec3f(0.5, 1., 1.5), CollisionKind::Boundary).into(),
        ];
        let bytes = encode_collision_objects(&objects);
        assert_eq!(bytes.len(), 2 * COLLISION_OBJECT_SIZE);
        assert_eq!(LittleEndian::read_u32(&bytes[32..]), SHAPE_SPHERE);
        assert_eq!(LittleEndian::read_u32(&bytes[COLLISION_OBJECT_SIZE + 32..]), SHAPE_BOX);
        assert_eq!(decode_collision_objects(&bytes, 2).unwrap(), objects);

        assert_eq!(encode_collision_objects(&[]).len(), COLLISION_OBJECT_SIZE);

        let mut corrupted = bytes.clone();
        LittleEndian::write_u32(&mut corrupted[32..36], 7);
        assert!(decode_collision_objects(&corrupted, 2).is_err());
    }

    #[test]
    fn grid_info_is_validated() {
        let geometry = GridGeometry::from_bounds(vec3f(-1., 0., 0.), vec3f(1., 0.5, 0.25), 0.1);
        let bytes = encode_grid_info(&geometry);
        assert_eq!(decode_grid_info(&bytes).unwrap(), geometry);

        let mut corrupted = bytes.clone();
        LittleEndian::write_u32(&mut corrupted[36..40], geometry.cell_count + 1);
        assert!(decode_grid_info(&corrupted).is_err());
    }

    #[test]
    fn columns_are_padded_to_capacity() {
        assert_eq!(padded_capacity(0), MIN_CAPACITY);
        assert_eq!(padded_capacity(513), 576);
        assert_eq!(padded_capacity(640), 640);

        let vectors = vec![vec3f(1., 2., 3.), vec3f(-4., 5., -6.)];
        let bytes = encode_vectors(&vectors, 8);
        assert_eq!(bytes.len(), 8 * VEC_SIZE);
        assert_eq!(decode_vectors(&bytes, 2).unwrap(), vectors);
        assert!(decode_vectors(&bytes, 9).is_err());

        let flags = vec![true, false, true];
        assert_eq!(decode_flags(&encode_flags(&flags, 4), 3).unwrap(), flags);

        let ids = vec![5u32, 0, 7];
        assert_eq!(decode_indices(&encode_indices(&ids, 3), 3).unwrap(), ids);
    }
}
