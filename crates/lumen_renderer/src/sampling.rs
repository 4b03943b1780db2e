//! Random sampling helpers.

use lumen_math::Vec3;
use rand::{Rng, RngCore};
use std::f32::consts::PI;

/// Uniform float in [0, 1).
#[inline]
pub fn gen_f32(rng: &mut dyn RngCore) -> f32 {
    rng.gen::<f32>()
}

/// Orthonormal tangent frame `(t, b)` around unit `n`.
pub fn tangent_frame(n: Vec3) -> (Vec3, Vec3) {
    let helper = if n.x.abs() > 0.9 { Vec3::Y } else { Vec3::X };
    let t = helper.cross(n).normalize();
    (t, n.cross(t))
}

/// Cosine-weighted direction in the hemisphere around unit `n`.
///
/// `(u1, u2)` in [0, 1)^2 pick the direction, so stratified samplers can
/// drive it directly.
pub fn cosine_hemisphere(n: Vec3, u1: f32, u2: f32) -> Vec3 {
    let r = u1.sqrt();
    let phi = 2.0 * PI * u2;
    let (t, b) = tangent_frame(n);
    let z = (1.0 - u1).max(0.0).sqrt();
    (t * (r * phi.cos()) + b * (r * phi.sin()) + n * z).normalize()
}

/// Seed for the jitter sequence of one pass over one rectangle.
///
/// Distinct `(pass, serial)` pairs give unrelated streams; identical pairs
/// repeat exactly across runs.
pub fn tile_seed(pass: u32, serial: u32) -> u64 {
    let mut x = ((pass as u64) << 32 | serial as u64) ^ 0x9E37_79B9_7F4A_7C15;
    // splitmix64 finaliser
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_gen_f32_range() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let v = gen_f32(&mut rng);
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_cosine_hemisphere_above_surface() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in [Vec3::Y, Vec3::X, -Vec3::Z, Vec3::new(1.0, 1.0, 0.0).normalize()] {
            for _ in 0..200 {
                let d = cosine_hemisphere(n, gen_f32(&mut rng), gen_f32(&mut rng));
                assert!(d.dot(n) >= -1e-5);
                assert!((d.length() - 1.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_tile_seed_deterministic_and_distinct() {
        assert_eq!(tile_seed(3, 17), tile_seed(3, 17));
        assert_ne!(tile_seed(3, 17), tile_seed(4, 17));
        assert_ne!(tile_seed(3, 17), tile_seed(3, 18));
        assert_ne!(tile_seed(1, 0), tile_seed(0, 1));
    }
}
