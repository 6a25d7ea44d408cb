use serde::{Deserialize, Serialize};

use crate::{
    collision::StaticCollisionObject,
    emitter::{jitter, Emitter},
    floating_type_mod::FT,
    particles::Particle,
    sph_solver::{FluidSolver, PressureSolver},
};

/// Initial fluid volumes and static geometry of a run, loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    #[serde(default)]
    pub collision_objects: Vec<StaticCollisionObject>,
    pub emitters: Vec<Emitter>,

    /// Random offset per axis in particle radii, `0` keeps the exact lattice.
    #[serde(default)]
    pub jitter: FT,
    #[serde(default)]
    pub seed: u64,
}

impl SceneConfig {
    pub fn from_yaml(yaml: &str) -> Result<SceneConfig, crate::SimulationError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Registers the collision objects and emits all particles. Returns the number of added particles.
    pub fn populate<P: PressureSolver>(&self, solver: &mut FluidSolver<P>) -> usize {
        for object in &self.collision_objects {
            solver.add_static_collision_object(object.clone());
        }

        let particle_radius = solver.particle_radius();
        let before = solver.particle_count();
        for (i, emitter) in self.emitters.iter().enumerate() {
            let mut positions = emitter.positions(particle_radius);
            jitter(&mut positions, self.jitter * particle_radius, self.seed.wrapping_add(i as u64));

            let velocity = emitter.velocity();
            solver.add_particles(positions.into_iter().map(|p| Particle::new(p, velocity)));
        }
        solver.particle_count() - before
    }
}

#[test]
fn scene_populates_solver() {
    use crate::{simulation_parameters::SolverConfig, sph_solver::SphSolver};

    let yaml = r#"
collision_objects:
  - CollisionBox:
      center: [0.0, 0.0, 0.0]
      half_dimensions: [0.5, 0.5, 0.5]
      kind: Boundary
emitters:
  - shape: cube
    center: [0.0, 0.0, 0.0]
    half_sizes: [0.05, 0.05, 0.05]
    velocity: [1.0, 0.0, 0.0]
"#;
    let scene = SceneConfig::from_yaml(yaml).unwrap();
    let mut solver = SphSolver::new(SolverConfig::default()).unwrap();

    assert_eq!(scene.populate(&mut solver), 27);
    assert_eq!(solver.static_collision_objects().len(), 1);
    assert!(solver.particles().velocity.iter().all(|v| v.x == 1.));
}
