use serde::{Deserialize, Serialize};

use super::{CollisionKind, Contact, StaticCollider};
use crate::{floating_type_mod::FT, vec3f, V3};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionSphere {
    pub center: V3,
    pub radius: FT,
    pub kind: CollisionKind,
}

impl CollisionSphere {
    pub fn new(center: V3, radius: FT, kind: CollisionKind) -> Self {
        CollisionSphere { center, radius, kind }
    }
}

impl StaticCollider for CollisionSphere {
    fn detect(&self, position: V3, particle_radius: FT) -> Option<Contact> {
        let offset = position - self.center;
        let distance = offset.norm();

        let penetration = match self.kind {
            CollisionKind::Obstacle => (self.radius + particle_radius) - distance,
            CollisionKind::Boundary => distance - (self.radius - particle_radius),
        };
        if !(penetration > 0.) {
            return None;
        }

        // a particle exactly on the center has no direction, push it upwards
        let direction = if distance > 0. { offset / distance } else { vec3f(0., 1., 0.) };

        Some(match self.kind {
            CollisionKind::Obstacle => Contact {
                normal: direction,
                point: self.center + direction * (self.radius + particle_radius),
            },
            CollisionKind::Boundary => Contact {
                normal: -direction,
                point: self.center + direction * (self.radius - particle_radius),
            },
        })
    }

    fn kind(&self) -> CollisionKind {
        self.kind
    }

    fn center(&self) -> V3 {
        self.center
    }

    fn set_center(&mut self, center: V3) {
        self.center = center;
    }
}

#[test]
fn boundary_sphere_contains_particle() {
    let sphere = CollisionSphere::new(vec3f(0.5, -0.25, 1.), 1., CollisionKind::Boundary);
    let particle_radius = 0.05;
    let eps = 0.02;

    let direction = vec3f(1., 2., -2.).normalize();
    let position = sphere.center + direction * (sphere.radius + eps);

    let contact = sphere.detect(position, particle_radius).unwrap();
    crate::assert_ft_approx_eq((contact.point - sphere.center).norm(), 1. - particle_radius, 1e-5, || {
        format!("distance to center after resolution")
    });
    crate::assert_v3_approx_eq(contact.normal, -direction, 1e-5, || format!("inward normal"));

    let inside = sphere.center + direction * 0.5;
    assert!(sphere.detect(inside, particle_radius).is_none());
}

#[test]
fn obstacle_sphere_pushes_outwards() {
    let sphere = CollisionSphere::new(vec3f(0., 0., 0.), 0.5, CollisionKind::Obstacle);

    let contact = sphere.detect(vec3f(0., 0., 0.3), 0.1).unwrap();
    assert_eq!(contact.normal, vec3f(0., 0., 1.));
    crate::assert_v3_approx_eq(contact.point, vec3f(0., 0., 0.6), 1e-6, || format!("contact"));

    let contact = sphere.detect(vec3f(0., 0., 0.), 0.1).unwrap();
    assert_eq!(contact.normal, vec3f(0., 1., 0.));

    assert!(sphere.detect(vec3f(0.7, 0., 0.), 0.1).is_none());
}
