use serde::{Deserialize, Serialize};

use crate::{device::DeviceClass, error::ConfigError, floating_type_mod::FT, vec3f, V3};

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Every stage runs on the calling thread.
    Serial,

    /// Stages are dispatched as data-parallel kernels to a compute device.
    Parallel(DeviceClass),
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Serial
    }
}

/**
 * Every scalar a caller may configure. Loaded from YAML; missing keys fall back to the
 * values of a water-like fluid at roughly centimeter particle scale.
 */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    pub gravity: V3,
    pub particle_radius: FT,

    /// kernel support radius in units of the particle radius
    pub kernel_radius_factor: FT,
    pub kernel_subdivisions: usize,

    pub rest_density: FT,
    pub viscosity: FT,
    pub pressure_stiffness: FT,

    /// negative pressures are multiplied by this factor
    pub negative_pressure_factor: FT,

    pub surface_tension: FT,
    pub surface_tension_threshold: FT,

    pub restitution: FT,
    pub friction: FT,

    // only used by PCISPH
    pub pcisph_min_iterations: usize,
    pub pcisph_max_density_error_ratio: FT,

    pub execution_mode: ExecutionMode,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            gravity: vec3f(0., -9.81, 0.),
            particle_radius: 0.017,
            kernel_radius_factor: 2.688,
            kernel_subdivisions: 1000,
            rest_density: 998.29,
            viscosity: 3.5,
            pressure_stiffness: 3.0,
            negative_pressure_factor: 0.0,
            surface_tension: 0.0728,
            surface_tension_threshold: 7.065,
            restitution: 0.5,
            friction: 1.0,
            pcisph_min_iterations: 4,
            pcisph_max_density_error_ratio: 0.1,
            execution_mode: ExecutionMode::Serial,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for d in 0..3 {
            ConfigError::check_finite("gravity", self.gravity[d])?;
        }
        ConfigError::check_positive("particle_radius", self.particle_radius)?;
        ConfigError::check_positive("kernel_radius_factor", self.kernel_radius_factor)?;
        ConfigError::check_positive("kernel_radius", self.kernel_radius())?;
        ConfigError::check_at_least("kernel_subdivisions", self.kernel_subdivisions, 1)?;
        ConfigError::check_positive("rest_density", self.rest_density)?;
        ConfigError::check_range("viscosity", self.viscosity, 0., FT::MAX)?;
        ConfigError::check_range("pressure_stiffness", self.pressure_stiffness, 0., FT::MAX)?;
        ConfigError::check_range("negative_pressure_factor", self.negative_pressure_factor, 0., 1.)?;
        ConfigError::check_range("surface_tension", self.surface_tension, 0., FT::MAX)?;
        ConfigError::check_range("surface_tension_threshold", self.surface_tension_threshold, 0., FT::MAX)?;
        ConfigError::check_range("restitution", self.restitution, 0., 1.)?;
        ConfigError::check_range("friction", self.friction, 0., 1.)?;
        ConfigError::check_at_least("pcisph_min_iterations", self.pcisph_min_iterations, 1)?;
        ConfigError::check_positive("pcisph_max_density_error_ratio", self.pcisph_max_density_error_ratio)?;
        Ok(())
    }

    pub fn kernel_radius(&self) -> FT {
        self.kernel_radius_factor * self.particle_radius
    }

    pub fn from_yaml(yaml: &str) -> Result<SolverConfig, crate::SimulationError> {
        let config: SolverConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, crate::SimulationError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/**
 * Flat, copyable parameter record handed to every stage and mirrored into the device parameter
 * block. Derived from `SolverConfig` plus the quantities the solver computes from it.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverParams {
    pub gravity: V3,
    pub particle_radius: FT,
    pub particle_mass: FT,
    pub kernel_radius: FT,
    pub kernel_division_step: FT,
    pub rest_density: FT,
    pub viscosity: FT,
    pub pressure_stiffness: FT,
    pub negative_pressure_factor: FT,
    pub surface_tension: FT,
    pub surface_tension_threshold: FT,
    pub restitution: FT,
    pub friction: FT,

    // per step values
    pub time_step: FT,
    pub pcisph_delta: FT,
}

impl SolverParams {
    pub fn new(config: &SolverConfig, particle_mass: FT, kernel_division_step: FT) -> SolverParams {
        SolverParams {
            gravity: config.gravity,
            particle_radius: config.particle_radius,
            particle_mass,
            kernel_radius: config.kernel_radius(),
            kernel_division_step,
            rest_density: config.rest_density,
            viscosity: config.viscosity,
            pressure_stiffness: config.pressure_stiffness,
            negative_pressure_factor: config.negative_pressure_factor,
            surface_tension: config.surface_tension,
            surface_tension_threshold: config.surface_tension_threshold,
            restitution: config.restitution,
            friction: config.friction,
            time_step: 0.,
            pcisph_delta: 0.,
        }
    }

    /// Equation of state; negative pressures are damped.
    #[inline(always)]
    pub fn pressure_from_density(&self, density: FT) -> FT {
        let pressure = self.pressure_stiffness * (density - self.rest_density);
        if pressure < 0. {
            pressure * self.negative_pressure_factor
        } else {
            pressure
        }
    }
}

#[test]
fn default_config_is_valid() {
    let config = SolverConfig::default();
    config.validate().unwrap();
    crate::assert_ft_approx_eq(config.kernel_radius(), 0.045696, 1e-6, || format!("kernel radius"));
}

#[test]
fn invalid_values_are_rejected() {
    let checks: Vec<Box<dyn Fn(&mut SolverConfig)>> = vec![
        Box::new(|c| c.particle_radius = 0.),
        Box::new(|c| c.particle_radius = -0.1),
        Box::new(|c| c.kernel_radius_factor = FT::NAN),
        Box::new(|c| c.rest_density = 0.),
        Box::new(|c| c.viscosity = -1.),
        Box::new(|c| c.negative_pressure_factor = 1.5),
        Box::new(|c| c.restitution = -0.1),
        Box::new(|c| c.friction = FT::INFINITY),
        Box::new(|c| c.kernel_subdivisions = 0),
        Box::new(|c| c.pcisph_min_iterations = 0),
        Box::new(|c| c.gravity.y = FT::NAN),
    ];
    for check in checks {
        let mut config = SolverConfig::default();
        check(&mut config);
        assert!(config.validate().is_err(), "{:?} should be rejected", config);
    }
}

#[test]
fn yaml_config_with_missing_keys_uses_defaults() {
    let config = SolverConfig::from_yaml("particle_radius: 0.02\nviscosity: 1.5\n").unwrap();
    assert_eq!(config.particle_radius, 0.02);
    assert_eq!(config.viscosity, 1.5);
    assert_eq!(config.rest_density, SolverConfig::default().rest_density);

    assert!(SolverConfig::from_yaml("particle_radius: -1.0\n").is_err());
    assert!(SolverConfig::from_yaml("no_such_key: 1.0\n").is_err());

    let round_trip = SolverConfig::from_yaml(&SolverConfig::default().to_yaml().unwrap()).unwrap();
    assert_eq!(round_trip, SolverConfig::default());
}

#[test]
fn negative_pressure_is_damped() {
    let config = SolverConfig {
        pressure_stiffness: 2.,
        negative_pressure_factor: 0.25,
        rest_density: 1000.,
        ..SolverConfig::default()
    };
    let params = SolverParams::new(&config, 1., 0.1);
    assert_eq!(params.pressure_from_density(1010.), 20.);
    assert_eq!(params.pressure_from_density(990.), -5.);
}
