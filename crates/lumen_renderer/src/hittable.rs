//! Hittable trait and HitRecord for ray-object intersection.

use crate::material::{Lambertian, Material};
use lumen_math::{Aabb, Interval, Ray, Vec3};

/// Material referenced by `HitRecord::default()`.
static DEFAULT_MATERIAL: Lambertian = Lambertian::BLACK;

/// Record of a ray-object intersection.
#[derive(Clone, Copy)]
pub struct HitRecord<'a> {
    /// Point of intersection
    pub p: Vec3,
    /// Surface normal at intersection (always points against ray)
    pub normal: Vec3,
    pub material: &'a dyn Material,
    /// Ray parameter of the intersection
    pub t: f32,
    /// Whether the ray hit the outside of the surface
    pub front_face: bool,
}

impl Default for HitRecord<'_> {
    fn default() -> Self {
        Self {
            p: Vec3::ZERO,
            normal: Vec3::ZERO,
            material: &DEFAULT_MATERIAL,
            t: 0.0,
            front_face: false,
        }
    }
}

impl HitRecord<'_> {
    /// Store the normal facing against the ray and remember which side was hit.
    pub fn set_face_normal(&mut self, ray: &Ray, outward_normal: Vec3) {
        self.front_face = ray.direction.dot(outward_normal) < 0.0;
        self.normal = if self.front_face {
            outward_normal
        } else {
            -outward_normal
        };
    }
}

/// Trait for objects that can be hit by rays.
pub trait Hittable: Send + Sync {
    /// Test if a ray hits this object within `ray_t`, filling in `rec`.
    fn hit<'a>(&'a self, ray: &Ray, ray_t: Interval, rec: &mut HitRecord<'a>) -> bool;

    fn bounding_box(&self) -> Aabb;
}
