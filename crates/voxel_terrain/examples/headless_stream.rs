//! Headless streaming demo: walk a viewpoint across mountain terrain and
//! print what the engine delivers each second.
//!
//! Run with: cargo run --example headless_stream

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use glam::Vec3;
use voxel_terrain::{
    BrushShape, ChunkInfo, EngineConfig, MeshData, MountainTerrain, RenderSink, TerrainEngine,
};

/// Stand-in for a renderer: counts triangles instead of uploading them.
struct CountingSink {
    triangles: Arc<Mutex<usize>>,
}

impl RenderSink for CountingSink {
    fn mesh_ready(&mut self, info: ChunkInfo, mesh: MeshData) {
        let mut total = self.triangles.lock().unwrap();
        *total += mesh.triangle_count();
        println!(
            "  mesh: lod {} at ({:7.0},{:7.0},{:7.0}) — {} tris",
            info.lod, info.origin.x, info.origin.y, info.origin.z,
            mesh.triangle_count()
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let triangles = Arc::new(Mutex::new(0usize));
    let sink = CountingSink {
        triangles: Arc::clone(&triangles),
    };

    let config = EngineConfig {
        material_count: 4,
        world_name: "demo".to_string(),
        base_exponent: 2,
        max_lod: 4,
        ..EngineConfig::default()
    };
    let mut engine = TerrainEngine::new(
        config,
        Arc::new(MountainTerrain::default()),
        Box::new(sink),
    )?;

    // A viewpoint drifting east above the terrain.
    let start = Instant::now();
    engine.set_viewpoint_source(move || {
        let t = start.elapsed().as_secs_f32();
        Vec3::new(t * 40.0, 80.0, 0.0)
    });

    for second in 0..10 {
        let frame_end = Instant::now() + Duration::from_secs(1);
        while Instant::now() < frame_end {
            engine.tick();
            std::thread::sleep(Duration::from_millis(16));
        }
        let stats = engine.stats();
        println!(
            "t={second}s: {} nodes, {} pending, {} meshes, {} tris total",
            stats.live_nodes,
            stats.pending_requests,
            stats.meshes_applied,
            triangles.lock().unwrap()
        );

        // Halfway in, carve a crater under the viewpoint.
        if second == 5 {
            let pos = Vec3::new(start.elapsed().as_secs_f32() * 40.0, 40.0, 0.0);
            let changed = engine.apply_brush(BrushShape::Sphere { soften: true }, 4, pos, 50.0);
            println!("carved a crater at {pos}; {} chunks changed", changed.len());
        }
    }

    engine.shutdown();
    Ok(())
}
