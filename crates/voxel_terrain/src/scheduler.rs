//! Asynchronous chunk generation.
//!
//! Worker threads pull mesh requests from a set of priority buckets: bucket 0
//! holds remesh-only requests (a density field already exists), the remaining
//! buckets hold compute requests grouped by LOD and served finest-first. Each
//! worker drains up to a fixed batch per pass to bound queue contention, then
//! yields.
//!
//! A request carries everything the worker needs; workers never touch the
//! octree. Finished results land on a channel the main thread drains once per
//! tick. Panics inside a request are caught, logged, and converted into an
//! empty result so one bad chunk can never stall the pipeline.

use crossbeam_channel::{unbounded, Receiver, Sender};
use glam::Vec3;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::EngineError;
use crate::field::VoxelField;
use crate::generator::{fill_field, DensitySource};
use crate::mesher::{extract_surface, MeshData, MesherConfig};
use crate::octree::NodeKey;

/// Requests drained per worker pass.
const MAX_REQUESTS_PER_PASS: usize = 10;

/// Sleep when a pass found no work.
const IDLE_SLEEP: Duration = Duration::from_millis(30);

/// Sleep after a productive pass, to yield without busy-spinning.
const WORK_SLEEP: Duration = Duration::from_millis(4);

/// Snapshot of one node's meshing work.
pub struct MeshRequest {
    pub node: NodeKey,
    pub lod: u8,

    /// World position of the chunk's origin corner.
    pub origin: Vec3,

    pub voxel_size: f32,

    /// Present for remesh-only requests; the worker fills a fresh field
    /// from the density source otherwise.
    pub base: Option<Arc<VoxelField>>,

    /// Copy of the node's edit layer, if it has one.
    pub overlay: Option<Box<VoxelField>>,
}

/// Output of one completed request.
pub struct MeshResult {
    pub node: NodeKey,

    /// Newly computed base field, absent for remesh-only requests.
    pub base: Option<Arc<VoxelField>>,

    pub mesh: MeshData,
}

/// Counters shared with the stats surface.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub total_generated: u64,
    pub total_meshed: u64,
    pub failed_requests: u64,
    pub total_build_time_ms: f32,
    pub avg_build_time_ms: f32,
}

/// Pool of generation workers plus the queues that feed them.
pub struct GenerationScheduler {
    senders: Vec<Sender<MeshRequest>>,
    finished_rx: Receiver<MeshResult>,
    active: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl GenerationScheduler {
    /// Spawns `worker_count` threads. Bucket layout is fixed by `max_lod`:
    /// index 0 for remesh, 1..=max_lod+1 for per-LOD compute requests.
    pub fn new(
        worker_count: usize,
        max_lod: u8,
        mesher: MesherConfig,
        generator: Arc<dyn DensitySource>,
    ) -> Result<Self, EngineError> {
        let bucket_count = max_lod as usize + 2;
        let mut senders = Vec::with_capacity(bucket_count);
        let mut receivers = Vec::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let (finished_tx, finished_rx) = unbounded();
        let active = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receivers = receivers.clone();
            let finished = finished_tx.clone();
            let generator = Arc::clone(&generator);
            let mesher = mesher.clone();
            let active = Arc::clone(&active);
            let stats = Arc::clone(&stats);
            let handle = std::thread::Builder::new()
                .name(format!("terrain-gen-{worker_id}"))
                .spawn(move || {
                    worker_loop(&receivers, &finished, &*generator, &mesher, &active, &stats);
                    debug!(worker_id, "generation worker stopped");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            senders,
            finished_rx,
            active,
            workers,
            stats,
        })
    }

    /// Routes a request into its priority bucket.
    pub fn enqueue(&self, request: MeshRequest) {
        let bucket = if request.base.is_some() {
            0
        } else {
            request.lod as usize + 1
        };
        // Send only fails after shutdown; requests are moot then.
        let _ = self.senders[bucket].send(request);
    }

    /// Takes every finished result without blocking.
    pub fn drain_finished(&self) -> Vec<MeshResult> {
        self.finished_rx.try_iter().collect()
    }

    /// Requests currently waiting in the buckets.
    pub fn pending_requests(&self) -> usize {
        self.senders.iter().map(|s| s.len()).sum()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Cooperative shutdown: raise the stop flag, then join every worker.
    /// Latency is bounded by the sleep interval, not by queued work.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for GenerationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    receivers: &[Receiver<MeshRequest>],
    finished: &Sender<MeshResult>,
    generator: &dyn DensitySource,
    mesher: &MesherConfig,
    active: &AtomicBool,
    stats: &Mutex<SchedulerStats>,
) {
    while active.load(Ordering::Relaxed) {
        let mut processed = 0;
        while processed < MAX_REQUESTS_PER_PASS {
            let Some(request) = next_request(receivers) else {
                break;
            };
            let node = request.node;
            let computes_density = request.base.is_none();
            let start = Instant::now();

            let outcome =
                catch_unwind(AssertUnwindSafe(|| process_request(request, generator, mesher)));
            let elapsed_ms = start.elapsed().as_secs_f32() * 1000.0;

            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    error!(?node, "chunk build panicked; completing request with empty buffers");
                    if let Ok(mut stats) = stats.lock() {
                        stats.failed_requests += 1;
                    }
                    MeshResult {
                        node,
                        base: None,
                        mesh: MeshData::empty(mesher.material_count),
                    }
                }
            };

            if let Ok(mut stats) = stats.lock() {
                if computes_density {
                    stats.total_generated += 1;
                }
                stats.total_meshed += 1;
                stats.total_build_time_ms += elapsed_ms;
                stats.avg_build_time_ms =
                    stats.total_build_time_ms / stats.total_meshed as f32;
            }

            if finished.send(result).is_err() {
                return;
            }
            processed += 1;
        }

        std::thread::sleep(if processed == 0 { IDLE_SLEEP } else { WORK_SLEEP });
    }
}

/// Scans buckets in priority order: remesh first, then compute by ascending
/// LOD, so near/fine chunks win over the far field.
pub(crate) fn next_request(receivers: &[Receiver<MeshRequest>]) -> Option<MeshRequest> {
    for rx in receivers {
        if let Ok(request) = rx.try_recv() {
            return Some(request);
        }
    }
    None
}

fn process_request(
    request: MeshRequest,
    generator: &dyn DensitySource,
    mesher: &MesherConfig,
) -> MeshResult {
    let (base, fresh) = match request.base {
        Some(base) => (base, false),
        None => {
            let mut field = VoxelField::new();
            fill_field(&mut field, generator, request.origin, request.voxel_size);
            (Arc::new(field), true)
        }
    };

    let view = crate::field::FieldView::new(&base, request.overlay.as_deref());
    let mesh = extract_surface(view, request.voxel_size, mesher);

    MeshResult {
        node: request.node,
        base: fresh.then_some(base),
        mesh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{FlatTerrain, VoxelSample};
    use slotmap::SlotMap;
    use std::collections::HashSet;

    fn mesher() -> MesherConfig {
        MesherConfig {
            isolevel: 0.0,
            material_count: 2,
        }
    }

    fn mint_keys(count: usize) -> Vec<NodeKey> {
        let mut arena: SlotMap<NodeKey, ()> = SlotMap::with_key();
        (0..count).map(|_| arena.insert(())).collect()
    }

    fn compute_request(node: NodeKey, lod: u8, origin: Vec3) -> MeshRequest {
        MeshRequest {
            node,
            lod,
            origin,
            voxel_size: 2f32.powi(lod as i32),
            base: None,
            overlay: None,
        }
    }

    fn drain_all(scheduler: &GenerationScheduler, expect: usize) -> Vec<MeshResult> {
        let mut results = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(20);
        while results.len() < expect && Instant::now() < deadline {
            results.extend(scheduler.drain_finished());
            std::thread::sleep(Duration::from_millis(5));
        }
        results
    }

    #[test]
    fn remesh_bucket_outranks_compute_buckets() {
        let (tx0, rx0) = unbounded();
        let (tx1, rx1) = unbounded();
        let receivers = vec![rx0, rx1];
        let keys = mint_keys(2);

        tx1.send(compute_request(keys[0], 0, Vec3::ZERO)).unwrap();
        let mut remesh = compute_request(keys[1], 0, Vec3::ZERO);
        remesh.base = Some(Arc::new(VoxelField::new()));
        tx0.send(remesh).unwrap();

        let first = next_request(&receivers).unwrap();
        assert_eq!(first.node, keys[1], "remesh requests are served first");
        let second = next_request(&receivers).unwrap();
        assert_eq!(second.node, keys[0]);
        assert!(next_request(&receivers).is_none());
    }

    #[test]
    fn every_request_is_delivered_exactly_once() {
        let generator = Arc::new(FlatTerrain {
            ground_height: 0.0,
            material: 0,
        });
        let scheduler =
            Arc::new(GenerationScheduler::new(3, 2, mesher(), generator).expect("spawn"));

        let keys = mint_keys(48);
        let mut producers = Vec::new();
        for chunk in keys.chunks(12) {
            let scheduler = Arc::clone(&scheduler);
            let chunk: Vec<NodeKey> = chunk.to_vec();
            producers.push(std::thread::spawn(move || {
                for (i, key) in chunk.into_iter().enumerate() {
                    let lod = (i % 3) as u8;
                    let origin = Vec3::new(i as f32 * 16.0, -100.0, 0.0);
                    scheduler.enqueue(compute_request(key, lod, origin));
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        let results = drain_all(&scheduler, keys.len());
        assert_eq!(results.len(), keys.len(), "no request may be dropped");
        let unique: HashSet<NodeKey> = results.iter().map(|r| r.node).collect();
        assert_eq!(unique.len(), keys.len(), "no result may be delivered twice");
        assert!(scheduler.drain_finished().is_empty());

        // Every compute request came back with a base field.
        assert!(results.iter().all(|r| r.base.is_some()));
        assert_eq!(scheduler.stats().total_generated, keys.len() as u64);
    }

    struct PanickingSource;

    impl DensitySource for PanickingSource {
        fn sample(&self, world_pos: Vec3) -> VoxelSample {
            if world_pos.x > 1000.0 {
                panic!("synthetic generator failure");
            }
            VoxelSample {
                density: world_pos.y,
                material: 0,
            }
        }
    }

    #[test]
    fn panicking_chunk_completes_and_pipeline_continues() {
        let scheduler =
            GenerationScheduler::new(1, 1, mesher(), Arc::new(PanickingSource)).expect("spawn");
        let keys = mint_keys(3);

        scheduler.enqueue(compute_request(keys[0], 0, Vec3::new(0.0, -8.0, 0.0)));
        scheduler.enqueue(compute_request(keys[1], 0, Vec3::new(5000.0, -8.0, 0.0)));
        scheduler.enqueue(compute_request(keys[2], 0, Vec3::new(0.0, -8.0, 64.0)));

        let results = drain_all(&scheduler, 3);
        assert_eq!(results.len(), 3, "the bad chunk must still complete");

        let bad = results.iter().find(|r| r.node == keys[1]).unwrap();
        assert!(bad.mesh.is_empty());
        assert!(bad.base.is_none());

        let good = results.iter().find(|r| r.node == keys[0]).unwrap();
        assert!(!good.mesh.is_empty(), "surface crosses y=8 inside the chunk");
        assert_eq!(scheduler.stats().failed_requests, 1);
    }

    #[test]
    fn stop_joins_quickly_when_idle() {
        let generator = Arc::new(FlatTerrain::default());
        let mut scheduler = GenerationScheduler::new(2, 1, mesher(), generator).expect("spawn");
        let start = Instant::now();
        scheduler.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
