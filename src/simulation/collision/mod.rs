use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::{floating_type_mod::FT, V3};

mod collision_box;
mod collision_sphere;

pub use collision_box::CollisionBox;
pub use collision_sphere::CollisionSphere;

/// Obstacles push particles out of their volume, boundaries keep particles inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollisionKind {
    Obstacle,
    Boundary,
}

/// Result of a detected penetration: unit normal pointing into the allowed region and the point
/// the particle center is snapped to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    pub normal: V3,
    pub point: V3,
}

#[enum_dispatch]
pub trait StaticCollider {
    fn detect(&self, position: V3, particle_radius: FT) -> Option<Contact>;

    fn kind(&self) -> CollisionKind;

    fn center(&self) -> V3;

    fn set_center(&mut self, center: V3);
}

#[enum_dispatch(StaticCollider)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StaticCollisionObject {
    CollisionBox(CollisionBox),
    CollisionSphere(CollisionSphere),
}

/**
 * Applies a contact to one particle.
 *
 * If the particle moves into the surface its velocity is split into a normal and a tangential part,
 * the normal part is scaled by `-restitution` and the tangential part by `friction`. The position is
 * always snapped to the contact point.
 */
pub fn resolve_contact(position: &mut V3, velocity: &mut V3, contact: &Contact, restitution: FT, friction: FT) {
    let separating_velocity = velocity.dot(&contact.normal);
    if separating_velocity < 0. {
        let normal_part = contact.normal * separating_velocity;
        let tangential_part = *velocity - normal_part;
        *velocity = normal_part * -restitution + tangential_part * friction;
    }
    *position = contact.point;
}

/// Resolves against all objects in registration order; later objects see the result of earlier ones.
pub fn resolve_collisions(
    objects: &[StaticCollisionObject],
    position: &mut V3,
    velocity: &mut V3,
    particle_radius: FT,
    restitution: FT,
    friction: FT,
) {
    for object in objects {
        if let Some(contact) = object.detect(*position, particle_radius) {
            resolve_contact(position, velocity, &contact, restitution, friction);
        }
    }
}

#[test]
fn resolution_reflects_only_approaching_velocity() {
    use crate::vec3f;

    let contact = Contact {
        normal: vec3f(0., 1., 0.),
        point: vec3f(0., 0.5, 0.),
    };

    let mut p = vec3f(0., 0.4, 0.);
    let mut v = vec3f(2., -3., 0.);
    resolve_contact(&mut p, &mut v, &contact, 0.5, 0.25);
    assert_eq!(p, contact.point);
    crate::assert_v3_approx_eq(v, vec3f(0.5, 1.5, 0.), 1e-6, || format!("approaching velocity"));

    // separating particles keep their velocity but are still snapped
    let mut p = vec3f(0., 0.4, 0.);
    let mut v = vec3f(2., 3., 0.);
    resolve_contact(&mut p, &mut v, &contact, 0.5, 0.25);
    assert_eq!(p, contact.point);
    assert_eq!(v, vec3f(2., 3., 0.));
}

#[test]
fn later_objects_override_earlier_resolution() {
    use crate::vec3f;

    let objects: Vec<StaticCollisionObject> = vec![
        CollisionBox::new(vec3f(0., 0., 0.), vec3f(1., 1., 1.), CollisionKind::Boundary).into(),
        CollisionSphere::new(vec3f(0., 0.9, 0.), 0.2, CollisionKind::Obstacle).into(),
    ];

    // pushed down from the box ceiling into the sphere, then out of the sphere again
    let mut p = vec3f(0., 1.2, 0.);
    let mut v = vec3f(0., 1., 0.);
    resolve_collisions(&objects, &mut p, &mut v, 0.05, 0.5, 1.);

    crate::assert_v3_approx_eq(p, vec3f(0., 1.15, 0.), 1e-5, || format!("final position"));
    crate::assert_v3_approx_eq(v, vec3f(0., 0.25, 0.), 1e-5, || format!("final velocity"));
}
