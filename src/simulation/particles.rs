use serde::{Deserialize, Serialize};

use crate::{floating_type_mod::FT, V3};

/// One fluid particle as seen by callers of the solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub position: V3,
    pub velocity: V3,
    pub half_velocity: V3,
    pub old_half_velocity: V3,
    pub accumulated_force: V3,
    pub density: FT,
    pub pressure: FT,
    pub is_first_step: bool,
}

impl Particle {
    pub fn new(position: V3, velocity: V3) -> Particle {
        Particle {
            position,
            velocity,
            ..Particle::default()
        }
    }

    pub fn at(position: V3) -> Particle {
        Particle::new(position, V3::zeros())
    }
}

impl Default for Particle {
    fn default() -> Self {
        Particle {
            position: V3::zeros(),
            velocity: V3::zeros(),
            half_velocity: V3::zeros(),
            old_half_velocity: V3::zeros(),
            accumulated_force: V3::zeros(),
            density: 0.,
            pressure: 0.,
            is_first_step: true,
        }
    }
}

fn zero() -> V3 {
    V3::zeros()
}

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $struct_name {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl $struct_name {
            pub fn len(&self) -> usize {
                self.position_len()
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn swap(&mut self, i: usize, j: usize) {
                $(
                    self.$field_name.swap(i, j);
                )*
            }

            pub fn truncate(&mut self, len: usize) {
                $(
                    self.$field_name.truncate(len);
                )*
            }

            pub fn clear(&mut self) {
                self.truncate(0);
            }

            /// Grows or shrinks every column to `len`, new entries get their default value.
            pub fn resize(&mut self, len: usize) {
                $(
                    self.$field_name.resize_with(len, || $default_value);
                )*
            }

            pub fn with_len(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }
        }
    }
}

decl_particle_vec! {
    pub struct ParticleVec {
        pub position: Vec<V3> | zero(),
        pub velocity: Vec<V3> | zero(),
        pub half_velocity: Vec<V3> | zero(),
        pub old_half_velocity: Vec<V3> | zero(),

        // cleared at the end of every integration
        pub force: Vec<V3> | zero(),

        pub density: Vec<FT> | 0.,
        pub pressure: Vec<FT> | 0.,

        // the first integration bootstraps the half step velocity
        pub first_step: Vec<bool> | true,
    }
}

impl ParticleVec {
    fn position_len(&self) -> usize {
        self.position.len()
    }

    pub fn push(&mut self, particle: Particle) {
        self.position.push(particle.position);
        self.velocity.push(particle.velocity);
        self.half_velocity.push(particle.half_velocity);
        self.old_half_velocity.push(particle.old_half_velocity);
        self.force.push(particle.accumulated_force);
        self.density.push(particle.density);
        self.pressure.push(particle.pressure);
        self.first_step.push(particle.is_first_step);
    }

    pub fn get(&self, i: usize) -> Option<Particle> {
        if i >= self.len() {
            return None;
        }
        Some(Particle {
            position: self.position[i],
            velocity: self.velocity[i],
            half_velocity: self.half_velocity[i],
            old_half_velocity: self.old_half_velocity[i],
            accumulated_force: self.force[i],
            density: self.density[i],
            pressure: self.pressure[i],
            is_first_step: self.first_step[i],
        })
    }

    pub fn set(&mut self, i: usize, particle: Particle) {
        self.position[i] = particle.position;
        self.velocity[i] = particle.velocity;
        self.half_velocity[i] = particle.half_velocity;
        self.old_half_velocity[i] = particle.old_half_velocity;
        self.force[i] = particle.accumulated_force;
        self.density[i] = particle.density;
        self.pressure[i] = particle.pressure;
        self.first_step[i] = particle.is_first_step;
    }

    pub fn iter(&self) -> impl Iterator<Item = Particle> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    pub fn count_non_finite(&self) -> usize {
        (0..self.len())
            .filter(|&i| {
                !(self.position[i].iter().all(|x| x.is_finite()) && self.velocity[i].iter().all(|x| x.is_finite()))
            })
            .count()
    }
}

decl_particle_vec! {
    pub struct PredictionVec {
        pub position: Vec<V3> | zero(),
        pub half_velocity: Vec<V3> | zero(),
        pub pressure_force: Vec<V3> | zero(),
        pub density: Vec<FT> | 0.,
        pub density_error: Vec<FT> | 0.,
    }
}

impl PredictionVec {
    fn position_len(&self) -> usize {
        self.position.len()
    }
}

#[test]
fn particle_round_trips_through_columns() {
    use crate::vec3f;

    let mut particles = ParticleVec::default();
    particles.push(Particle::at(vec3f(1., 2., 3.)));
    particles.push(Particle {
        density: 1000.,
        is_first_step: false,
        ..Particle::new(vec3f(0., 1., 0.), vec3f(0., -1., 0.))
    });

    assert_eq!(particles.len(), 2);
    assert!(particles.get(0).unwrap().is_first_step);
    assert_eq!(particles.get(1).unwrap().density, 1000.);
    assert_eq!(particles.get(2), None);

    particles.swap(0, 1);
    assert_eq!(particles.position[0], vec3f(0., 1., 0.));
    assert_eq!(particles.iter().count(), 2);

    particles.resize(5);
    assert_eq!(particles.first_step[4], true);
    assert_eq!(particles.count_non_finite(), 0);
    particles.velocity[3].x = FT::NAN;
    assert_eq!(particles.count_non_finite(), 1);

    particles.clear();
    assert!(particles.is_empty());
}
