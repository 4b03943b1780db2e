// Re-export glam for convenience
pub use glam::*;

// Lumen math types
mod aabb;
mod interval;
mod ray;

pub use aabb::Aabb;
pub use interval::Interval;
pub use ray::Ray;

/// Relative luminance of a linear RGB triple (Rec. 709 weights).
#[inline]
pub fn luminance(rgb: Vec3) -> f32 {
    0.2126 * rgb.x + 0.7152 * rgb.y + 0.0722 * rgb.z
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luminance_of_white() {
        assert!((luminance(Vec3::ONE) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_luminance_green_dominates() {
        let g = luminance(Vec3::Y);
        assert!(g > luminance(Vec3::X));
        assert!(g > luminance(Vec3::Z));
    }
}
