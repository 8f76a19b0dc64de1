//! Engine lifecycle and the per-frame tick.
//!
//! `TerrainEngine` is an explicit context object owning the octree, the
//! generation workers, the I/O worker, and the render hookup; there is no
//! global state, so independent engines can coexist (and tests stay
//! deterministic).
//!
//! Structural octree mutation and queue consumption happen only on the
//! thread that calls [`TerrainEngine::tick`]; workers communicate purely
//! through the scheduler's channels.

use glam::Vec3;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::edit::{BrushShape, EditEngine};
use crate::error::EngineError;
use crate::generator::DensitySource;
use crate::mesher::{MeshData, MesherConfig};
use crate::octree::{NodeKey, Octree, OctreeEvent};
use crate::persist::{self, IoEvent, IoWorker, LoadJob, SaveJob, WorldMeta};
use crate::scheduler::{GenerationScheduler, MeshRequest, SchedulerStats};

/// Identity of a chunk handed to the render collaborator.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    pub node: NodeKey,

    /// World position of the chunk's origin corner. Mesh vertices are
    /// relative to this.
    pub origin: Vec3,

    pub lod: u8,
    pub voxel_size: f32,
}

/// Render-side collaborator. Receives ready mesh buffers and lifecycle
/// notifications; owns GPU upload, visibility toggling, and collision-shape
/// assignment.
pub trait RenderSink {
    /// A chunk's surface is ready. Called once per completed non-empty
    /// build; a later call for the same node replaces the previous mesh.
    fn mesh_ready(&mut self, info: ChunkInfo, mesh: MeshData);

    /// Whether the chunk should currently be drawn.
    fn set_visible(&mut self, _node: NodeKey, _visible: bool) {}

    /// The chunk entered the near field and should get a collision shape.
    fn set_collidable(&mut self, _node: NodeKey, _collidable: bool) {}

    /// The chunk is gone; release its render resources.
    fn node_disposed(&mut self, _node: NodeKey) {}
}

/// Sink that drops everything. Useful headless.
pub struct NullSink;

impl RenderSink for NullSink {
    fn mesh_ready(&mut self, _info: ChunkInfo, _mesh: MeshData) {}
}

/// Aggregated counters for debugging overlays.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub live_nodes: usize,
    pub nodes_per_lod: Vec<u32>,
    pub pending_requests: usize,
    pub meshes_applied: u64,
    pub results_discarded: u64,
    pub nodes_saved: u64,
    pub nodes_loaded: u64,
    pub scheduler: SchedulerStats,
}

/// The terrain core. Feed it a viewpoint, call [`tick`](Self::tick) once per
/// frame, and meshes stream out through the [`RenderSink`].
pub struct TerrainEngine {
    config: EngineConfig,
    octree: Octree,
    scheduler: GenerationScheduler,
    io: Option<IoWorker>,
    edit: EditEngine,
    sink: Box<dyn RenderSink>,
    viewpoint: Option<Box<dyn Fn() -> Vec3>>,
    world_dir: Option<PathBuf>,

    /// Nodes with a save in flight; at most one pending save per node.
    pending_saves: HashSet<NodeKey>,

    meshes_applied: u64,
    results_discarded: u64,
    nodes_saved: u64,
    nodes_loaded: u64,
}

impl TerrainEngine {
    /// Builds the engine: validates configuration, prepares the world
    /// directory, spawns generation workers and (with persistence enabled)
    /// the I/O worker. Worker spawn failure is fatal by design.
    pub fn new(
        config: EngineConfig,
        generator: Arc<dyn DensitySource>,
        sink: Box<dyn RenderSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let world_dir = config
            .save_root
            .as_ref()
            .map(|root| root.join(&config.world_name));
        if let Some(dir) = &world_dir {
            let meta = WorldMeta {
                material_count: config.material_count,
                base_exponent: config.base_exponent,
                max_lod: config.max_lod,
            };
            if let Some(existing) = persist::read_world_meta(dir) {
                if existing != meta {
                    warn!(
                        ?dir,
                        ?existing,
                        "world metadata differs from engine config; records may not line up"
                    );
                }
            }
            persist::write_world_meta(dir, &meta)?;
        }

        let mesher = MesherConfig {
            isolevel: config.isolevel,
            material_count: config.material_count,
        };
        let scheduler = GenerationScheduler::new(
            config.worker_count,
            config.max_lod,
            mesher,
            Arc::clone(&generator),
        )?;
        let io = match &world_dir {
            Some(_) => Some(IoWorker::spawn()?),
            None => None,
        };

        info!(
            world = %config.world_name,
            workers = config.worker_count,
            max_lod = config.max_lod,
            generator = generator.name(),
            "terrain engine initialized"
        );

        Ok(Self {
            octree: Octree::new(&config),
            edit: EditEngine::new(config.isolevel),
            config,
            scheduler,
            io,
            sink,
            viewpoint: None,
            world_dir,
            pending_saves: HashSet::new(),
            meshes_applied: 0,
            results_discarded: 0,
            nodes_saved: 0,
            nodes_loaded: 0,
        })
    }

    /// Installs the viewpoint provider polled by every tick.
    pub fn set_viewpoint_source(&mut self, provider: impl Fn() -> Vec3 + 'static) {
        self.viewpoint = Some(Box::new(provider));
    }

    /// One frame of work: fold in finished loads and builds, follow the
    /// viewpoint, then flush structural events into the queues.
    pub fn tick(&mut self) {
        self.drain_io_events();
        self.drain_finished_builds();

        if let Some(provider) = &self.viewpoint {
            let pos = provider();
            self.octree.set_view_position(pos);
        }

        self.drain_octree_events();
    }

    /// Stops every background thread cooperatively. Idempotent; also runs
    /// on drop.
    pub fn shutdown(&mut self) {
        self.scheduler.stop();
        if let Some(io) = &mut self.io {
            io.stop();
        }
    }

    // ---- edits --------------------------------------------------------------

    /// Selects the material for subsequent brushes.
    pub fn set_brush_material(&mut self, material: u8) {
        self.edit.set_material(material);
    }

    /// Applies a sculpt brush. Changed chunks remesh once per stroke.
    pub fn apply_brush(
        &mut self,
        shape: BrushShape,
        radius: i32,
        pos: Vec3,
        density: f32,
    ) -> Vec<NodeKey> {
        self.edit
            .apply_brush(&mut self.octree, shape, radius, pos, density)
    }

    /// Applies a material-only brush.
    pub fn apply_paint(&mut self, shape: BrushShape, radius: i32, pos: Vec3) -> Vec<NodeKey> {
        self.edit.apply_paint(&mut self.octree, shape, radius, pos, true)
    }

    /// Restores the procedural terrain under the brush.
    pub fn apply_heal(&mut self, shape: BrushShape, radius: i32, pos: Vec3) -> Vec<NodeKey> {
        self.edit.apply_heal(&mut self.octree, shape, radius, pos)
    }

    // ---- introspection ------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            live_nodes: self.octree.live_nodes(),
            nodes_per_lod: self.octree.node_counts().to_vec(),
            pending_requests: self.scheduler.pending_requests(),
            meshes_applied: self.meshes_applied,
            results_discarded: self.results_discarded,
            nodes_saved: self.nodes_saved,
            nodes_loaded: self.nodes_loaded,
            scheduler: self.scheduler.stats(),
        }
    }

    // ---- tick phases --------------------------------------------------------

    fn drain_io_events(&mut self) {
        let events = match &self.io {
            Some(io) => io.drain_events(),
            None => return,
        };
        for event in events {
            match event {
                IoEvent::SaveFinished(key) => {
                    self.pending_saves.remove(&key);
                    self.nodes_saved += 1;
                    // Edits that landed after the snapshot go out again.
                    let dirty = self
                        .octree
                        .node(key)
                        .map(|n| n.save_dirty)
                        .unwrap_or(false);
                    if dirty {
                        self.request_save(key);
                    }
                }
                IoEvent::Loaded(key, field) => {
                    if let Some(node) = self.octree.node_mut(key) {
                        node.overlay.apply_override(&field);
                        node.has_overlay = true;
                        self.nodes_loaded += 1;
                        self.octree.request_regeneration(key);
                    }
                }
            }
        }
    }

    fn drain_finished_builds(&mut self) {
        for result in self.scheduler.drain_finished() {
            let key = result.node;
            let info = match self.octree.node_mut(key) {
                // The node was disposed while the build was in flight.
                None => {
                    self.results_discarded += 1;
                    continue;
                }
                Some(node) => {
                    if let Some(base) = result.base {
                        node.base = Some(base);
                    }
                    node.has_mesh = true;
                    node.mesh_empty = result.mesh.is_empty();
                    ChunkInfo {
                        node: key,
                        origin: node.position,
                        lod: node.lod,
                        voxel_size: self.config.voxel_size(node.lod),
                    }
                }
            };

            if !result.mesh.is_empty() {
                self.sink.mesh_ready(info, result.mesh);
            }
            self.meshes_applied += 1;

            self.octree.complete_regeneration(key);
            self.octree.render_check(key);
            if let Some(parent) = self.octree.node(key).and_then(|n| n.parent) {
                self.octree.render_check(parent);
            }
        }
    }

    fn drain_octree_events(&mut self) {
        for event in self.octree.drain_events() {
            match event {
                OctreeEvent::LoadProbe(key) => self.probe_saved_record(key),
                OctreeEvent::MeshRequested(key) => self.enqueue_build(key),
                OctreeEvent::SaveRequested(key) => self.request_save(key),
                OctreeEvent::Disposed(key) => self.sink.node_disposed(key),
                OctreeEvent::VisibilityChanged(key, visible) => {
                    self.sink.set_visible(key, visible)
                }
                OctreeEvent::CollidableChanged(key, collidable) => {
                    self.sink.set_collidable(key, collidable)
                }
            }
        }
    }

    /// Snapshots everything a worker needs and routes the request. Remesh
    /// requests (base already present) go to the high-priority bucket.
    fn enqueue_build(&mut self, key: NodeKey) {
        let request = {
            let node = match self.octree.node(key) {
                Some(n) => n,
                None => return,
            };
            MeshRequest {
                node: key,
                lod: node.lod,
                origin: node.position,
                voxel_size: self.octree.voxel_size(node.lod),
                base: node.base.clone(),
                overlay: node
                    .has_overlay
                    .then(|| Box::new(node.overlay.clone())),
            }
        };
        self.scheduler.enqueue(request);
    }

    fn probe_saved_record(&mut self, key: NodeKey) {
        let (Some(io), Some(world_dir)) = (&self.io, &self.world_dir) else {
            return;
        };
        let Some(rel) = self.octree.record_path(key) else {
            return;
        };
        let dir = world_dir.join(rel);
        if persist::record_exists(&dir) {
            io.enqueue_load(LoadJob { node: key, dir });
        }
    }

    fn request_save(&mut self, key: NodeKey) {
        let Some(io) = &self.io else {
            return;
        };
        if self.pending_saves.contains(&key) {
            // Deduplicated: the dirty flag re-queues it on completion.
            return;
        }
        let Some(world_dir) = &self.world_dir else {
            return;
        };
        let Some(rel) = self.octree.record_path(key) else {
            return;
        };
        let dir = world_dir.join(rel);

        let job = {
            let node = match self.octree.node_mut(key) {
                Some(n) => n,
                None => return,
            };
            node.save_dirty = false;
            SaveJob {
                node: key,
                dir,
                densities: node.overlay.compress_densities(),
                materials: node.overlay.compress_materials(),
            }
        };
        self.pending_saves.insert(key);
        io.enqueue_save(job);
    }
}

impl Drop for TerrainEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::FlatTerrain;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Sink that records every delivered mesh for inspection.
    #[derive(Clone, Default)]
    struct CollectingSink {
        meshes: Arc<Mutex<Vec<(ChunkInfo, MeshData)>>>,
    }

    impl RenderSink for CollectingSink {
        fn mesh_ready(&mut self, info: ChunkInfo, mesh: MeshData) {
            self.meshes.lock().unwrap().push((info, mesh));
        }
    }

    fn flat_config() -> EngineConfig {
        EngineConfig {
            material_count: 1,
            base_exponent: 4,
            max_lod: 2,
            isolevel: 0.0,
            worker_count: 2,
            ..EngineConfig::default()
        }
    }

    fn tick_until(
        engine: &mut TerrainEngine,
        timeout: Duration,
        mut done: impl FnMut(&TerrainEngine) -> bool,
    ) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            engine.tick();
            if done(engine) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within {timeout:?}");
    }

    #[test]
    fn flat_world_meshes_as_a_plane() {
        let sink = CollectingSink::default();
        let meshes = Arc::clone(&sink.meshes);
        // Density y - 5: the surface is the y = 5 plane.
        let generator = Arc::new(FlatTerrain {
            ground_height: 5.0,
            material: 0,
        });
        let mut engine =
            TerrainEngine::new(flat_config(), generator, Box::new(sink)).expect("engine");
        engine.set_viewpoint_source(|| Vec3::new(8.0, 5.0, 8.0));

        tick_until(&mut engine, Duration::from_secs(60), |_| {
            meshes
                .lock()
                .unwrap()
                .iter()
                .any(|(info, _)| info.lod == 2 && info.origin == Vec3::ZERO)
        });

        let meshes = meshes.lock().unwrap();
        let (info, mesh) = meshes
            .iter()
            .find(|(info, _)| info.lod == 2 && info.origin == Vec3::ZERO)
            .unwrap();

        // A single flat sheet across the chunk at y = 5.
        assert!(mesh.triangle_count() > 0);
        let width = 16.0 * info.voxel_size;
        for p in &mesh.positions {
            assert!((p.y - 5.0).abs() < 1e-2, "vertex off the plane: {p}");
            assert!(p.x >= -info.voxel_size && p.x <= width + info.voxel_size);
            assert!(p.z >= -info.voxel_size && p.z <= width + info.voxel_size);
        }

        // Chunks that sit entirely above or below the plane never deliver.
        for (info, _) in meshes.iter() {
            let width = 16.0 * info.voxel_size;
            assert!(
                info.origin.y <= 5.0 && info.origin.y + width >= 5.0,
                "empty chunk delivered a mesh: origin {:?} lod {}",
                info.origin,
                info.lod
            );
        }
        drop(meshes);
        engine.shutdown();
    }

    #[test]
    fn brush_edit_remeshes_saves_and_reloads() {
        let save_root = std::env::temp_dir().join(format!(
            "voxel_terrain_engine_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&save_root);

        let config = EngineConfig {
            save_root: Some(save_root.clone()),
            world_name: "edit_world".to_string(),
            ..flat_config()
        };
        let generator: Arc<dyn DensitySource> = Arc::new(FlatTerrain {
            ground_height: 5.0,
            material: 0,
        });
        // Chunk-interior point so exactly one LOD0 node (the origin chunk)
        // owns the whole brush.
        let edit_pos = Vec3::new(64.0, 64.0, 64.0);

        {
            let sink = CollectingSink::default();
            let meshes = Arc::clone(&sink.meshes);
            let mut engine =
                TerrainEngine::new(config.clone(), Arc::clone(&generator), Box::new(sink))
                    .expect("engine");
            engine.set_viewpoint_source(|| Vec3::new(8.0, 5.0, 8.0));

            // Wait for the initial LOD0 mesh around the edit point.
            tick_until(&mut engine, Duration::from_secs(60), |_| {
                meshes
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(info, _)| info.lod == 0 && info.origin == Vec3::ZERO)
            });

            // Hang a solid blob above the plane and wait for the remesh.
            let before = meshes
                .lock()
                .unwrap()
                .iter()
                .filter(|(info, _)| info.lod == 0 && info.origin == Vec3::ZERO)
                .count();
            let changed = engine.apply_brush(BrushShape::Box, 2, edit_pos, -20.0);
            assert!(!changed.is_empty());

            tick_until(&mut engine, Duration::from_secs(60), |_| {
                meshes
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(info, _)| info.lod == 0 && info.origin == Vec3::ZERO)
                    .count()
                    > before
            });

            // Wait until the save hit disk.
            tick_until(&mut engine, Duration::from_secs(60), |e| {
                e.stats().nodes_saved > 0
            });
            engine.shutdown();
        }

        // A fresh engine over the same world streams the edits back in.
        {
            let mut engine =
                TerrainEngine::new(config, Arc::clone(&generator), Box::new(NullSink))
                    .expect("engine");
            engine.set_viewpoint_source(|| Vec3::new(8.0, 5.0, 8.0));

            tick_until(&mut engine, Duration::from_secs(60), |e| {
                e.stats().nodes_loaded > 0
            });
            tick_until(&mut engine, Duration::from_secs(60), |e| {
                e.octree()
                    .search_node(edit_pos, 0)
                    .and_then(|k| e.octree().node(k))
                    .map(|n| n.has_overlay && n.overlay.is_set(4, 4, 4))
                    .unwrap_or(false)
            });
            engine.shutdown();
        }

        let _ = std::fs::remove_dir_all(&save_root);
    }

    #[test]
    fn shutdown_is_prompt_and_idempotent() {
        let generator = Arc::new(FlatTerrain::default());
        let mut engine =
            TerrainEngine::new(flat_config(), generator, Box::new(NullSink)).expect("engine");
        engine.tick();
        let start = Instant::now();
        engine.shutdown();
        engine.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
