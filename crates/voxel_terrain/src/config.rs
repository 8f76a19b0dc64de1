//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::EngineError;

/// Engine-wide configuration, fixed at construction.
///
/// Voxel width at a given LOD is `2^(lod + base_exponent)` world units, so a
/// chunk spans `16 * 2^(lod + base_exponent)` units per axis. The 3x3x3 root
/// window is made of `max_lod` chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of material slots. Meshes carry one index buffer per material.
    pub material_count: usize,

    /// World identifier; doubles as the on-disk directory name for edits.
    pub world_name: String,

    /// Root directory for persisted edits. `None` disables persistence.
    pub save_root: Option<PathBuf>,

    /// Finest voxel width is `2^base_exponent` world units.
    pub base_exponent: u32,

    /// Coarsest LOD tier; root chunks live at this LOD. LOD 0 is finest.
    pub max_lod: u8,

    /// Density threshold defining the surface; densities below are inside.
    pub isolevel: f32,

    /// Generation worker threads.
    pub worker_count: usize,

    /// A node subdivides while the viewpoint is within this many chunks of
    /// it (per axis, at the node's LOD).
    pub split_radius: i32,

    /// A node prunes its children once the viewpoint is outside this many
    /// chunks. Must exceed `split_radius`; the gap is the hysteresis band
    /// that stops split/collapse thrashing at the boundary.
    pub collapse_radius: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            material_count: 1,
            world_name: "world".to_string(),
            save_root: None,
            base_exponent: 0,
            max_lod: 4,
            isolevel: 0.0,
            worker_count: num_cpus::get().min(4),
            split_radius: 1,
            collapse_radius: 3,
        }
    }
}

impl EngineConfig {
    /// Checks internal consistency. Called by the engine constructor.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.material_count == 0 {
            return Err(EngineError::Config("material_count must be >= 1".into()));
        }
        if self.max_lod == 0 {
            return Err(EngineError::Config("max_lod must be >= 1".into()));
        }
        if self.collapse_radius <= self.split_radius {
            return Err(EngineError::Config(format!(
                "collapse_radius ({}) must be greater than split_radius ({})",
                self.collapse_radius, self.split_radius
            )));
        }
        if self.worker_count == 0 {
            return Err(EngineError::Config("worker_count must be >= 1".into()));
        }
        if self.world_name.is_empty() {
            return Err(EngineError::Config("world_name must not be empty".into()));
        }
        Ok(())
    }

    /// Voxel width at the given LOD, in world units.
    pub fn voxel_size(&self, lod: u8) -> f32 {
        2f32.powi(lod as i32 + self.base_exponent as i32)
    }

    /// Chunk width at the given LOD, in world units.
    pub fn node_width(&self, lod: u8) -> f32 {
        self.voxel_size(lod) * crate::field::FIELD_CELLS as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn collapse_must_exceed_split() {
        let cfg = EngineConfig {
            split_radius: 2,
            collapse_radius: 2,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn widths_follow_the_exponent() {
        let cfg = EngineConfig {
            base_exponent: 4,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.voxel_size(0), 16.0);
        assert_eq!(cfg.voxel_size(2), 64.0);
        assert_eq!(cfg.node_width(2), 1024.0);
    }
}
