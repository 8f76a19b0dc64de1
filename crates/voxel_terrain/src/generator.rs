//! Pluggable density sources and the halo-grid sampler.
//!
//! A density source turns a world position into a signed density plus a
//! material index. Sources are called concurrently from every generation
//! worker, so implementations must be reentrant.

use glam::Vec3;
use noise::{NoiseFn, Perlin};
use rayon::prelude::*;

use crate::field::{VoxelField, FIELD_DIM, FIELD_MAX, FIELD_MIN, FIELD_VOLUME};

/// One sampled voxel: signed density (below isolevel = inside) + material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelSample {
    pub density: f32,
    pub material: u8,
}

/// Strategy that sculpts the base terrain.
pub trait DensitySource: Send + Sync {
    /// Density and material at a world position.
    fn sample(&self, world_pos: Vec3) -> VoxelSample;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "DensitySource"
    }
}

/// Samples the source over a chunk's full 19^3 halo-inclusive lattice.
///
/// Lattice point `(x, y, z)` (with x,y,z in [-1, 17]) maps to world position
/// `origin + (x, y, z) * voxel_size`. Sampling is parallelized per point and
/// the results applied sequentially, same as batch chunk generation.
pub fn fill_field(
    field: &mut VoxelField,
    source: &dyn DensitySource,
    origin: Vec3,
    voxel_size: f32,
) {
    let samples: Vec<VoxelSample> = (0..FIELD_VOLUME)
        .into_par_iter()
        .map(|i| {
            let x = (i / (FIELD_DIM * FIELD_DIM)) as i32 + FIELD_MIN;
            let y = (i / FIELD_DIM % FIELD_DIM) as i32 + FIELD_MIN;
            let z = (i % FIELD_DIM) as i32 + FIELD_MIN;
            let world = origin + Vec3::new(x as f32, y as f32, z as f32) * voxel_size;
            source.sample(world)
        })
        .collect();

    let mut i = 0;
    for x in FIELD_MIN..=FIELD_MAX {
        for y in FIELD_MIN..=FIELD_MAX {
            for z in FIELD_MIN..=FIELD_MAX {
                field.set(x, y, z, samples[i].density);
                field.set_material(x, y, z, samples[i].material);
                i += 1;
            }
        }
    }
}

/// Flat ground plane: density is the signed height above `ground_height`.
#[derive(Debug, Clone)]
pub struct FlatTerrain {
    pub ground_height: f32,
    pub material: u8,
}

impl Default for FlatTerrain {
    fn default() -> Self {
        Self {
            ground_height: -50.0,
            material: 0,
        }
    }
}

impl DensitySource for FlatTerrain {
    fn sample(&self, world_pos: Vec3) -> VoxelSample {
        VoxelSample {
            density: world_pos.y - self.ground_height,
            material: self.material,
        }
    }

    fn name(&self) -> &str {
        "FlatTerrain"
    }
}

/// Mountain terrain configuration.
#[derive(Debug, Clone)]
pub struct MountainConfig {
    /// Base ground height before noise.
    pub base_height: f32,

    /// Domain-warp strength applied before the octaves.
    pub warp_scale: f32,

    pub material: u8,
    pub seed: u32,
}

impl Default for MountainConfig {
    fn default() -> Self {
        Self {
            base_height: 50.0,
            warp_scale: 1.0,
            material: 0,
            seed: 0,
        }
    }
}

/// Domain-warped multi-octave mountains: broad continents from the low
/// frequencies, ridged detail from the high ones.
pub struct MountainTerrain {
    config: MountainConfig,
    noise: Perlin,
}

impl MountainTerrain {
    pub fn new(config: MountainConfig) -> Self {
        let noise = Perlin::new(config.seed);
        Self { config, noise }
    }

    fn noise_at(&self, x: f32, y: f32, z: f32) -> f32 {
        self.noise.get([x as f64, y as f64, z as f64]) as f32
    }
}

impl Default for MountainTerrain {
    fn default() -> Self {
        Self::new(MountainConfig::default())
    }
}

impl DensitySource for MountainTerrain {
    fn sample(&self, world_pos: Vec3) -> VoxelSample {
        let mut x = world_pos.x;
        let y = world_pos.y;
        let mut z = world_pos.z;

        let mut d = y - self.config.base_height;

        let warp = self.noise_at(x / 100.0, y / 100.0, z / 100.0) * self.config.warp_scale;
        x += warp;
        z += warp;

        d += self.noise_at(x / 500.0, 0.0, z / 500.0) * 70.5;
        d += self.noise_at(x / 100.0, 0.0, z / 100.0)
            * self.noise_at(x / 200.0, 0.0, z / 200.0)
            * 10.0;
        d += self.noise_at(x / 4000.0, 0.0, z / 4000.0) * 300.0;
        d += self.noise_at(x / 10000.0, 0.0, z / 10000.0) * 800.0;

        VoxelSample {
            density: d,
            material: self.config.material,
        }
    }

    fn name(&self) -> &str {
        "MountainTerrain"
    }
}
