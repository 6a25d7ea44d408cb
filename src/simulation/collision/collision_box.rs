use serde::{Deserialize, Serialize};

use super::{CollisionKind, Contact, StaticCollider};
use crate::{floating_type_mod::FT, V3};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionBox {
    pub center: V3,
    pub half_dimensions: V3,
    pub kind: CollisionKind,
}

impl CollisionBox {
    pub fn new(center: V3, half_dimensions: V3, kind: CollisionKind) -> Self {
        CollisionBox {
            center,
            half_dimensions,
            kind,
        }
    }

    /// Axis with the smallest penetration. Ties go to the earlier axis (X, then Y, then Z).
    fn shallowest_axis(penetration: V3) -> usize {
        if penetration.x <= penetration.y && penetration.x <= penetration.z {
            0
        } else if penetration.y <= penetration.z {
            1
        } else {
            2
        }
    }

    fn detect_obstacle(&self, position: V3, particle_radius: FT) -> Option<Contact> {
        let distance = (self.center - position).abs();
        let penetration = (self.half_dimensions - distance).add_scalar(particle_radius);
        if !(penetration.x > 0. && penetration.y > 0. && penetration.z > 0.) {
            return None;
        }

        let axis = Self::shallowest_axis(penetration);
        let sign = if position[axis] - self.center[axis] >= 0. { 1. } else { -1. };

        let mut normal = V3::zeros();
        normal[axis] = sign;

        let mut point = position;
        point[axis] = self.center[axis] + sign * (self.half_dimensions[axis] + particle_radius);

        Some(Contact { normal, point })
    }

    fn detect_boundary(&self, position: V3, particle_radius: FT) -> Option<Contact> {
        let distance = (self.center - position).abs();
        let penetration = (distance - self.half_dimensions).add_scalar(particle_radius);
        if !(penetration.x > 0. || penetration.y > 0. || penetration.z > 0.) {
            return None;
        }

        let mut normal = V3::zeros();
        let mut point = position;
        for axis in 0..3 {
            if penetration[axis] > 0. {
                let sign = if position[axis] - self.center[axis] <= 0. { 1. } else { -1. };
                normal[axis] = sign;
                point[axis] = self.center[axis] - sign * (self.half_dimensions[axis] - particle_radius);
            }
        }
        normal.normalize_mut();

        Some(Contact { normal, point })
    }
}

impl StaticCollider for CollisionBox {
    fn detect(&self, position: V3, particle_radius: FT) -> Option<Contact> {
        match self.kind {
            CollisionKind::Obstacle => self.detect_obstacle(position, particle_radius),
            CollisionKind::Boundary => self.detect_boundary(position, particle_radius),
        }
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
