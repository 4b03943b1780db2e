//! Render configuration and image output.

use serde::{Deserialize, Serialize};

use crate::material::Color;
use crate::work_queue::PixelSample;

/// Image and thread settings for a render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    /// Edge of the square buckets both passes walk the image in
    pub bucket_size: u32,
    /// Worker threads; 0 uses one per core
    pub threads: usize,
    /// Jittered probes per pixel in the final pass
    pub samples_per_pixel: u32,
    /// Linear RGB seen by rays that leave the scene
    pub background: [f32; 3],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            bucket_size: 32,
            threads: 0,
            samples_per_pixel: 4,
            background: [0.7, 0.8, 1.0],
        }
    }
}

impl RenderConfig {
    pub fn background_color(&self) -> Color {
        Color::from_array(self.background)
    }

    /// Thread count with 0 resolved to the number of cores.
    pub fn worker_threads(&self) -> usize {
        if self.threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            self.threads
        }
    }
}

/// Apply gamma correction (gamma = 2.0).
#[inline]
pub fn linear_to_gamma(linear: f32) -> f32 {
    if linear > 0.0 {
        linear.sqrt()
    } else {
        0.0
    }
}

/// Convert a linear color to 8-bit RGBA.
pub fn color_to_rgba(color: Color) -> [u8; 4] {
    let c = color.to_array().map(|v| (255.0 * linear_to_gamma(v).clamp(0.0, 1.0)) as u8);
    [c[0], c[1], c[2], 255]
}

/// Linear RGB frame buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Color>,
}

impl ImageBuffer {
    /// A black image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Color::ZERO; width as usize * height as usize],
        }
    }

    /// Splat probe colours into a preview; later samples win.
    pub fn from_samples(width: u32, height: u32, samples: &[PixelSample]) -> Self {
        let mut image = Self::new(width, height);
        for s in samples.iter().filter(|s| s.x < width && s.y < height) {
            image.set(s.x, s.y, s.color);
        }
        image
    }

    pub fn get(&self, x: u32, y: u32) -> Color {
        self.pixels[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, color: Color) {
        self.pixels[(y * self.width + x) as usize] = color;
    }

    /// Gamma-corrected RGBA bytes, row-major.
    pub fn to_rgba(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|c| color_to_rgba(*c)).collect()
    }

    pub fn to_image(&self) -> image::RgbaImage {
        image::RgbaImage::from_fn(self.width, self.height, |x, y| image::Rgba(color_to_rgba(self.get(x, y))))
    }
}
