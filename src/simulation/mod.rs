pub mod collision;
pub mod concurrency;
pub mod device;
pub mod emitter;
pub mod error;
pub mod neighborhood_search;
pub mod particles;
pub mod pcisph;
pub mod scene;
pub mod simulation_parameters;
pub mod sph_kernels;
pub mod sph_solver;
pub mod stages;
pub mod thread_safe_ptr;

use std::fmt::Display;

use num_traits::Float;

pub type IT = i32;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::PI;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::PI;
}

use floating_type_mod::FT;

use nalgebra::SVector;

pub type V<T, const D: usize> = SVector<T, D>;

pub type V3 = V<FT, 3>;
pub type V3I = V<IT, 3>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub fn is_ft_approx_eq<T: Float>(a: T, b: T, tolerance: T) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<T: Float + Display>(a: T, b: T, tolerance: T, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

pub fn assert_v3_approx_eq(a: V3, b: V3, tolerance: FT, s: impl Fn() -> String) {
    for d in 0..3 {
        assert_ft_approx_eq(a[d], b[d], tolerance, || format!("{} (axis {})", s(), d));
    }
}

pub use collision::{CollisionBox, CollisionKind, CollisionSphere, StaticCollider, StaticCollisionObject};
pub use concurrency::{ExecutionSurface, ParallelSurface, SerialSurface};
pub use device::{ComputeBackend, DeviceAvailability, DeviceClass, HostBackend};
pub use error::{BackendError, ConfigError, SimulationError};
pub use particles::Particle;
pub use pcisph::{PcisphSolver, PredictiveCorrective};
pub use scene::SceneConfig;
pub use simulation_parameters::{ExecutionMode, SolverConfig, SolverParams};
pub use sph_solver::{CollisionObjectId, EquationOfState, FluidSolver, PressureSolver, SolverStage, SphSolver};
