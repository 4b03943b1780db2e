//! Surface materials.
//!
//! Radiosity only needs two answers from a surface: how much light it
//! reflects diffusely and how much it emits.

use lumen_math::Vec3;

/// Color type alias (linear RGB, typically 0-1)
pub type Color = Vec3;

/// Trait for materials that describe how light interacts with surfaces.
pub trait Material: Send + Sync {
    /// Diffuse reflectance at the hit point.
    fn albedo(&self) -> Color;

    /// Light emitted by the surface. Most materials return black.
    fn emitted(&self) -> Color {
        Color::ZERO
    }
}

/// Lambertian (diffuse) material.
#[derive(Debug, Clone, Copy)]
pub struct Lambertian {
    albedo: Color,
}

impl Lambertian {
    /// Absorbs everything.
    pub const BLACK: Lambertian = Lambertian { albedo: Color::ZERO };

    pub fn new(albedo: Color) -> Self {
        Self {
            albedo: albedo.clamp(Color::ZERO, Color::ONE),
        }
    }
}

impl Material for Lambertian {
    fn albedo(&self) -> Color {
        self.albedo
    }
}

/// Diffuse light emitter. Reflects nothing.
#[derive(Debug, Clone, Copy)]
pub struct DiffuseLight {
    emit: Color,
}

impl DiffuseLight {
    pub fn new(emit: Color) -> Self {
        Self { emit }
    }
}

impl Material for DiffuseLight {
    fn albedo(&self) -> Color {
        Color::ZERO
    }

    fn emitted(&self) -> Color {
        self.emit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lambertian_albedo_clamped() {
        let m = Lambertian::new(Color::new(1.5, 0.5, -0.2));
        assert_eq!(m.albedo(), Color::new(1.0, 0.5, 0.0));
        assert_eq!(m.emitted(), Color::ZERO);
    }

    #[test]
    fn test_light_emits_only() {
        let light = DiffuseLight::new(Color::splat(4.0));
        assert_eq!(light.albedo(), Color::ZERO);
        assert_eq!(light.emitted(), Color::splat(4.0));
    }
}
