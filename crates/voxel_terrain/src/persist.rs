//! On-disk persistence for edited chunks.
//!
//! Each LOD0 node with edits owns a record directory (root window cell, then
//! the chain of child indices). A record is two line-oriented files, one
//! `<run>,<value>` line per RLE run: `densities.txt` and `materials.txt`.
//! Missing files mean "no saved edits"; malformed files are demoted to the
//! same, logged, never fatal.
//!
//! A single I/O worker drains a save FIFO and a load FIFO. Loads never touch
//! nodes directly: the decoded field is posted back and folded in on the
//! main thread's tick.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, PersistError};
use crate::field::VoxelField;
use crate::octree::NodeKey;

const DENSITY_FILE: &str = "densities.txt";
const MATERIAL_FILE: &str = "materials.txt";
const META_FILE: &str = "world.json";

/// Poll interval of the I/O worker.
const IO_SLEEP: Duration = Duration::from_millis(3);

/// Per-world metadata, written at engine init and checked on reopen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub material_count: usize,
    pub base_exponent: u32,
    pub max_lod: u8,
}

/// True if a record was ever saved under this directory.
pub fn record_exists(dir: &Path) -> bool {
    dir.join(DENSITY_FILE).exists()
}

/// Writes both RLE streams for a chunk record.
pub fn save_record(
    dir: &Path,
    densities: &[(u32, f32)],
    materials: &[(u32, u8)],
) -> Result<(), PersistError> {
    std::fs::create_dir_all(dir).map_err(|source| PersistError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    write_runs(&dir.join(DENSITY_FILE), densities.iter().map(|(n, v)| (*n, v.to_string())))?;
    write_runs(&dir.join(MATERIAL_FILE), materials.iter().map(|(n, v)| (*n, v.to_string())))?;
    Ok(())
}

fn write_runs(
    path: &Path,
    runs: impl Iterator<Item = (u32, String)>,
) -> Result<(), PersistError> {
    let io_err = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::create(path).map_err(io_err)?;
    let mut out = std::io::BufWriter::new(file);
    for (run, value) in runs {
        writeln!(out, "{run},{value}").map_err(io_err)?;
    }
    out.flush().map_err(io_err)?;
    Ok(())
}

/// Reads a chunk record back into a fresh field. `Ok(None)` means no record;
/// a parse failure is an error the caller demotes to "no saved edits".
pub fn load_record(dir: &Path) -> Result<Option<VoxelField>, PersistError> {
    let density_path = dir.join(DENSITY_FILE);
    let material_path = dir.join(MATERIAL_FILE);
    if !density_path.exists() {
        return Ok(None);
    }

    let densities: Vec<(u32, f32)> = read_runs(&density_path)?;
    let materials: Vec<(u32, u8)> = if material_path.exists() {
        read_runs(&material_path)?
    } else {
        Vec::new()
    };

    let mut field = VoxelField::new();
    field
        .decompress_densities(&densities)
        .map_err(|_| PersistError::WrongLength {
            path: density_path,
        })?;
    if !materials.is_empty() {
        field
            .decompress_materials(&materials)
            .map_err(|_| PersistError::WrongLength {
                path: material_path,
            })?;
    }
    Ok(Some(field))
}

fn read_runs<V: std::str::FromStr>(path: &Path) -> Result<Vec<(u32, V)>, PersistError> {
    let contents = std::fs::read_to_string(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut runs = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let parsed = line.split_once(',').and_then(|(run, value)| {
            Some((run.trim().parse::<u32>().ok()?, value.trim().parse::<V>().ok()?))
        });
        match parsed {
            Some(run) => runs.push(run),
            None => {
                return Err(PersistError::Malformed {
                    path: path.to_path_buf(),
                    line: i + 1,
                })
            }
        }
    }
    Ok(runs)
}

/// Writes `world.json` into the world directory.
pub fn write_world_meta(dir: &Path, meta: &WorldMeta) -> Result<(), PersistError> {
    std::fs::create_dir_all(dir).map_err(|source| PersistError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(META_FILE);
    let json = serde_json::to_string_pretty(meta).expect("meta serializes");
    std::fs::write(&path, json).map_err(|source| PersistError::Io { path, source })
}

/// Reads `world.json` if present. Malformed metadata is reported as absent.
pub fn read_world_meta(dir: &Path) -> Option<WorldMeta> {
    let path = dir.join(META_FILE);
    let contents = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!(?path, %err, "unreadable world metadata, ignoring");
            None
        }
    }
}

/// Save job: a point-in-time snapshot of one node's edit layer, already
/// compressed on the main thread.
pub struct SaveJob {
    pub node: NodeKey,
    pub dir: PathBuf,
    pub densities: Vec<(u32, f32)>,
    pub materials: Vec<(u32, u8)>,
}

pub struct LoadJob {
    pub node: NodeKey,
    pub dir: PathBuf,
}

/// Completions posted back to the main thread.
pub enum IoEvent {
    /// The save attempt finished (even on failure, so the dedup slot frees).
    SaveFinished(NodeKey),

    /// A record was found and decoded.
    Loaded(NodeKey, Box<VoxelField>),
}

/// The dedicated persistence thread and its FIFOs.
pub struct IoWorker {
    save_tx: Sender<SaveJob>,
    load_tx: Sender<LoadJob>,
    events_rx: Receiver<IoEvent>,
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IoWorker {
    pub fn spawn() -> Result<Self, EngineError> {
        let (save_tx, save_rx) = unbounded::<SaveJob>();
        let (load_tx, load_rx) = unbounded::<LoadJob>();
        let (events_tx, events_rx) = unbounded::<IoEvent>();
        let active = Arc::new(AtomicBool::new(true));

        let thread_active = Arc::clone(&active);
        let handle = std::thread::Builder::new()
            .name("terrain-io".to_string())
            .spawn(move || {
                io_loop(&save_rx, &load_rx, &events_tx, &thread_active);
                debug!("io worker stopped");
            })?;

        Ok(Self {
            save_tx,
            load_tx,
            events_rx,
            active,
            handle: Some(handle),
        })
    }

    pub fn enqueue_save(&self, job: SaveJob) {
        let _ = self.save_tx.send(job);
    }

    pub fn enqueue_load(&self, job: LoadJob) {
        let _ = self.load_tx.send(job);
    }

    /// Takes every completion without blocking. Called once per tick.
    pub fn drain_events(&self) -> Vec<IoEvent> {
        self.events_rx.try_iter().collect()
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn io_loop(
    save_rx: &Receiver<SaveJob>,
    load_rx: &Receiver<LoadJob>,
    events: &Sender<IoEvent>,
    active: &AtomicBool,
) {
    while active.load(Ordering::Relaxed) {
        if let Ok(job) = save_rx.try_recv() {
            if let Err(err) = save_record(&job.dir, &job.densities, &job.materials) {
                warn!(dir = ?job.dir, %err, "chunk save failed");
            }
            if events.send(IoEvent::SaveFinished(job.node)).is_err() {
                return;
            }
        }

        if let Ok(job) = load_rx.try_recv() {
            match load_record(&job.dir) {
                Ok(Some(field)) => {
                    if events.send(IoEvent::Loaded(job.node, Box::new(field))).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    // Data-integrity failures demote to "no saved edits".
                    warn!(dir = ?job.dir, %err, "unreadable chunk record, ignoring");
                }
            }
        }

        std::thread::sleep(IO_SLEEP);
    }
}
