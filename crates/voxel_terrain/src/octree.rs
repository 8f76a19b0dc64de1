//! Octree chunk management.
//!
//! A 3x3x3 window of root chunks (coarsest LOD) slides with the viewpoint;
//! nodes subdivide toward LOD 0 near the viewer and collapse again behind
//! asymmetric distance windows so the boundary cannot thrash.
//!
//! Nodes live in a generational arena. Parent->child links own the tree;
//! parent and neighbor links are plain keys, so disposal can never leave a
//! dangling owner, and a key held by an in-flight generation request simply
//! stops resolving once the node is gone.

use glam::{IVec3, Vec3};
use slotmap::{new_key_type, SlotMap};
use std::sync::Arc;
use tracing::warn;

use crate::config::EngineConfig;
use crate::field::{VoxelField, FIELD_CELLS, FIELD_MAX, FIELD_MIN};
use crate::pool::FieldPool;

new_key_type! {
    /// Generational handle to an octree node.
    pub struct NodeKey;
}

/// Child octant offsets, in units of half the parent width.
pub const CHILD_OFFSETS: [[i32; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 1, 0],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

/// Unit offsets to the six same-LOD neighbors.
pub const NEIGHBOR_OFFSETS: [[i32; 3]; 6] = [
    [-1, 0, 0],
    [0, -1, 0],
    [0, 0, -1],
    [1, 0, 0],
    [0, 1, 0],
    [0, 0, 1],
];

/// Index of the reverse direction for each neighbor slot.
pub const OPPOSITE_NEIGHBOR: [usize; 6] = [3, 4, 5, 0, 1, 2];

/// At this LOD and above, children prune as soon as the viewpoint leaves the
/// split window; the collapse band only protects the fine tiers.
const UNCONDITIONAL_COLLAPSE_LOD: u8 = 3;

/// LOD0 chunks within this many chunks of the viewpoint get collision shapes.
const COLLISION_RADIUS: i32 = 3;

/// One cubic chunk of the tree.
pub struct Node {
    /// World position of the origin corner.
    pub position: Vec3,

    /// LOD tier; 0 is finest.
    pub lod: u8,

    /// Slot of this node in its parent's child array.
    pub child_index: u8,

    pub parent: Option<NodeKey>,
    pub children: [Option<NodeKey>; 8],

    /// Same-LOD neighbors, resolved lazily; cleared reciprocally on dispose.
    pub neighbors: [Option<NodeKey>; 6],

    /// Chunk coordinate at this node's LOD (floor(center / node_width)).
    pub chunk_pos: IVec3,

    pub center: Vec3,

    /// Permanent nodes survive pruning; set by edits, propagates upward.
    pub permanent: bool,

    /// Generated density field. Immutable once set.
    pub base: Option<Arc<VoxelField>>,

    /// Sparse edit layer; the only mutable field data after generation.
    pub overlay: VoxelField,

    /// True once any edit or loaded record touched the overlay.
    pub has_overlay: bool,

    /// Edits since the last save snapshot.
    pub save_dirty: bool,

    pub regen_requested: bool,
    pub regen_pending_again: bool,

    pub has_mesh: bool,
    pub mesh_empty: bool,
    pub visible: bool,
    pub collidable: bool,
}

impl Node {
    /// A node with a free child slot acts as a leaf for subdivision and
    /// rendering purposes.
    pub fn is_leaf(&self) -> bool {
        self.children.iter().any(|c| c.is_none())
    }
}

/// Structural changes the engine reacts to, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OctreeEvent {
    /// A LOD0 node was created; the engine probes disk for saved edits.
    LoadProbe(NodeKey),

    /// The node needs (re)meshing.
    MeshRequested(NodeKey),

    /// The node's overlay changed and should be persisted.
    SaveRequested(NodeKey),

    /// The node was destroyed; render resources can be released.
    Disposed(NodeKey),

    VisibilityChanged(NodeKey, bool),
    CollidableChanged(NodeKey, bool),
}

/// The sliding-window octree of terrain chunks.
pub struct Octree {
    nodes: SlotMap<NodeKey, Node>,
    /// Root node per window slot; index = (x * 3 + y) * 3 + z.
    roots: [NodeKey; 27],
    /// Permanent ex-roots that slid out of the window. Data retained,
    /// invisible, never updated again.
    retired_roots: Vec<NodeKey>,
    root_coord: IVec3,
    /// Viewpoint chunk coordinate per LOD.
    view_chunk: Vec<IVec3>,
    /// Half-LOD0-chunk cell of the last propagated viewpoint (debounce).
    fine_coord: IVec3,
    node_counts: Vec<u32>,
    pool: FieldPool,
    events: Vec<OctreeEvent>,

    max_lod: u8,
    base_exponent: u32,
    split_radius: i32,
    collapse_radius: i32,
}

impl Octree {
    /// Builds the initial 3x3x3 window centered on the origin root cell.
    pub fn new(config: &EngineConfig) -> Self {
        let max_lod = config.max_lod;
        let mut tree = Self {
            nodes: SlotMap::with_key(),
            roots: [NodeKey::default(); 27],
            retired_roots: Vec::new(),
            root_coord: IVec3::ZERO,
            view_chunk: vec![IVec3::ZERO; max_lod as usize + 1],
            fine_coord: IVec3::MIN,
            node_counts: vec![0; max_lod as usize + 1],
            pool: FieldPool::default(),
            events: Vec::new(),
            max_lod,
            base_exponent: config.base_exponent,
            split_radius: config.split_radius,
            collapse_radius: config.collapse_radius,
        };

        let width = tree.node_width(max_lod);
        for sx in 0..3 {
            for sy in 0..3 {
                for sz in 0..3 {
                    let pos = Vec3::new(
                        (sx as i32 - 1) as f32 * width,
                        (sy as i32 - 1) as f32 * width,
                        (sz as i32 - 1) as f32 * width,
                    );
                    tree.roots[slot_index(sx, sy, sz)] = tree.create_node(None, 0, pos, max_lod);
                }
            }
        }
        tree
    }

    /// Voxel width at a LOD, in world units.
    pub fn voxel_size(&self, lod: u8) -> f32 {
        2f32.powi(lod as i32 + self.base_exponent as i32)
    }

    /// Chunk width at a LOD, in world units.
    pub fn node_width(&self, lod: u8) -> f32 {
        self.voxel_size(lod) * FIELD_CELLS as f32
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn root_coord(&self) -> IVec3 {
        self.root_coord
    }

    /// Root key for a window slot, each coordinate in 0..3.
    pub fn root_at(&self, sx: usize, sy: usize, sz: usize) -> NodeKey {
        self.roots[slot_index(sx, sy, sz)]
    }

    /// Live node count per LOD tier.
    pub fn node_counts(&self) -> &[u32] {
        &self.node_counts
    }

    pub fn live_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn pool_stats(&self) -> &crate::pool::FieldPoolStats {
        &self.pool.stats
    }

    /// Takes the buffered structural events.
    pub fn drain_events(&mut self) -> Vec<OctreeEvent> {
        std::mem::take(&mut self.events)
    }

    // ---- window maintenance -------------------------------------------------

    /// Reacts to a viewpoint move: slides the root window, then (debounced to
    /// half-LOD0-chunk granularity) re-evaluates subdivision below every root.
    pub fn set_view_position(&mut self, pos: Vec3) {
        for lod in 0..=self.max_lod {
            let width = self.node_width(lod);
            self.view_chunk[lod as usize] = floor_cell(pos, width);
        }

        let target = floor_cell(pos, self.node_width(self.max_lod));
        while self.root_coord != target {
            let delta = target - self.root_coord;
            // One axis, one step at a time; each step leaves a valid window.
            let axis = if delta.x != 0 {
                0
            } else if delta.y != 0 {
                1
            } else {
                2
            };
            self.shift_axis(axis, delta[axis].signum());
        }

        let half = self.node_width(0) * 0.5;
        let fine = floor_cell(pos, half);
        if fine != self.fine_coord {
            self.fine_coord = fine;
            for i in 0..27 {
                let root = self.roots[i];
                self.update_lod(root, pos);
            }
        }
    }

    fn shift_axis(&mut self, axis: usize, dir: i32) {
        let mut coord = self.root_coord;
        coord[axis] += dir;
        self.root_coord = coord;

        let width = self.node_width(self.max_lod);
        // Walk the 3x3 cross-section; drop the trailing plane, slide the
        // other two, create the leading plane.
        let (trailing, leading) = if dir > 0 { (0, 2) } else { (2, 0) };
        for u in 0..3usize {
            for v in 0..3usize {
                let at = |a: usize| -> usize {
                    let mut s = [0usize; 3];
                    s[axis] = a;
                    s[(axis + 1) % 3] = u;
                    s[(axis + 2) % 3] = v;
                    slot_index(s[0], s[1], s[2])
                };

                self.retire_root(self.roots[at(trailing)]);
                if dir > 0 {
                    self.roots[at(0)] = self.roots[at(1)];
                    self.roots[at(1)] = self.roots[at(2)];
                } else {
                    self.roots[at(2)] = self.roots[at(1)];
                    self.roots[at(1)] = self.roots[at(0)];
                }

                let mut slot = [0i32; 3];
                slot[axis] = leading as i32;
                slot[(axis + 1) % 3] = u as i32;
                slot[(axis + 2) % 3] = v as i32;
                let pos = Vec3::new(
                    (self.root_coord.x + slot[0] - 1) as f32 * width,
                    (self.root_coord.y + slot[1] - 1) as f32 * width,
                    (self.root_coord.z + slot[2] - 1) as f32 * width,
                );
                self.roots[at(leading)] = self.create_node(None, 0, pos, self.max_lod);
            }
        }
    }

    /// A root sliding out of the window: disposed if disposable, otherwise
    /// kept (hidden) so edits stay resident until their saves land.
    fn retire_root(&mut self, key: NodeKey) {
        let permanent = match self.nodes.get(key) {
            Some(n) => n.permanent,
            None => return,
        };
        if permanent {
            self.hide_subtree(key);
            self.retired_roots.push(key);
        } else {
            self.dispose_subtree(key);
        }
    }

    // ---- subdivision / pruning ---------------------------------------------

    fn update_lod(&mut self, key: NodeKey, pos: Vec3) {
        let (lod, chunk_pos) = match self.nodes.get(key) {
            Some(n) => (n.lod, n.chunk_pos),
            None => return,
        };
        let view = self.view_chunk[lod as usize];
        let dist = (view - chunk_pos).abs().max_element();

        if dist <= self.split_radius {
            if lod > 0 {
                if self.nodes[key].is_leaf() {
                    self.create_children(key);
                }
                let children = self.nodes[key].children;
                for child in children.into_iter().flatten() {
                    self.update_lod(child, pos);
                }
            }
        } else if lod >= UNCONDITIONAL_COLLAPSE_LOD || dist > self.collapse_radius {
            self.prune_children(key);
        }

        if lod == 0 {
            self.collision_check(key, pos);
        }
        self.render_check(key);
    }

    /// Fills any free child slots; permanent survivors already occupy theirs.
    fn create_children(&mut self, key: NodeKey) {
        let (lod, position) = match self.nodes.get(key) {
            Some(n) if n.lod > 0 => (n.lod, n.position),
            _ => return,
        };
        let half = self.node_width(lod) * 0.5;
        for (i, offset) in CHILD_OFFSETS.iter().enumerate() {
            if self.nodes[key].children[i].is_some() {
                continue;
            }
            let child_pos = position
                + Vec3::new(
                    offset[0] as f32 * half,
                    offset[1] as f32 * half,
                    offset[2] as f32 * half,
                );
            let child = self.create_node(Some(key), i as u8, child_pos, lod - 1);
            self.nodes[key].children[i] = Some(child);
        }
    }

    /// Drops non-permanent children; permanent subtrees are kept but hidden
    /// and trimmed of their own disposable branches.
    fn prune_children(&mut self, key: NodeKey) {
        for i in 0..8 {
            let child = match self.nodes.get(key).and_then(|n| n.children[i]) {
                Some(c) => c,
                None => continue,
            };
            if self.nodes[child].permanent {
                self.prune_permanent(child);
            } else {
                self.dispose_subtree(child);
                self.nodes[key].children[i] = None;
            }
        }
    }

    fn prune_permanent(&mut self, key: NodeKey) {
        // Permanence propagates upward, so a non-permanent child can never
        // hide a permanent descendant: safe to dispose it wholesale.
        for i in 0..8 {
            let child = match self.nodes.get(key).and_then(|n| n.children[i]) {
                Some(c) => c,
                None => continue,
            };
            if self.nodes[child].permanent {
                self.prune_permanent(child);
            } else {
                self.dispose_subtree(child);
                self.nodes[key].children[i] = None;
            }
        }
        self.set_visible(key, false);
    }

    fn hide_subtree(&mut self, key: NodeKey) {
        let children = match self.nodes.get(key) {
            Some(n) => n.children,
            None => return,
        };
        self.set_visible(key, false);
        for child in children.into_iter().flatten() {
            self.hide_subtree(child);
        }
    }

    // ---- node lifecycle -----------------------------------------------------

    fn create_node(
        &mut self,
        parent: Option<NodeKey>,
        child_index: u8,
        position: Vec3,
        lod: u8,
    ) -> NodeKey {
        let width = self.node_width(lod);
        let center = position + Vec3::splat(width * 0.5);
        let permanent = parent
            .and_then(|p| self.nodes.get(p))
            .map(|p| p.permanent)
            .unwrap_or(false);
        let overlay = self.pool.acquire();

        let key = self.nodes.insert(Node {
            position,
            lod,
            child_index,
            parent,
            children: [None; 8],
            neighbors: [None; 6],
            chunk_pos: floor_cell(center, width),
            center,
            permanent,
            base: None,
            overlay,
            has_overlay: false,
            save_dirty: false,
            regen_requested: true,
            regen_pending_again: false,
            has_mesh: false,
            mesh_empty: true,
            visible: false,
            collidable: false,
        });

        self.node_counts[lod as usize] += 1;
        if lod == 0 {
            self.events.push(OctreeEvent::LoadProbe(key));
        }
        self.events.push(OctreeEvent::MeshRequested(key));
        key
    }

    /// Destroys a node and everything below it: children first, then
    /// reciprocal neighbor links, then the node itself. The overlay returns
    /// to the pool; the render side is told to release its resources.
    fn dispose_subtree(&mut self, key: NodeKey) {
        let node = match self.nodes.get(key) {
            Some(n) => n,
            None => return,
        };
        debug_assert!(!node.permanent, "permanent nodes are never disposed");
        let children = node.children;
        let neighbors = node.neighbors;
        let lod = node.lod;

        for child in children.into_iter().flatten() {
            self.dispose_subtree(child);
        }

        for (dir, neighbor) in neighbors.into_iter().enumerate() {
            if let Some(other) = neighbor.and_then(|n| self.nodes.get_mut(n)) {
                other.neighbors[OPPOSITE_NEIGHBOR[dir]] = None;
            }
        }

        if let Some(node) = self.nodes.remove(key) {
            self.pool.release(node.overlay);
        }
        self.node_counts[lod as usize] -= 1;
        self.events.push(OctreeEvent::Disposed(key));
    }

    // ---- searching ----------------------------------------------------------

    /// True if the point lies within the node's axis-aligned bounds.
    pub fn contains_point(&self, key: NodeKey, pos: Vec3) -> bool {
        let node = match self.nodes.get(key) {
            Some(n) => n,
            None => return false,
        };
        let width = self.node_width(node.lod);
        pos.cmpge(node.position).all() && pos.cmple(node.position + Vec3::splat(width)).all()
    }

    /// Bounds inflated by one voxel width per side: a point near a chunk
    /// border is considered inside every chunk whose halo covers it.
    pub fn contains_density_point(&self, key: NodeKey, pos: Vec3) -> bool {
        let node = match self.nodes.get(key) {
            Some(n) => n,
            None => return false,
        };
        let voxel = self.voxel_size(node.lod);
        let width = self.node_width(node.lod);
        let lo = node.position - Vec3::splat(voxel);
        let hi = node.position + Vec3::splat(width + voxel);
        pos.cmpge(lo).all() && pos.cmple(hi).all()
    }

    /// Finds the node containing `pos`, as close as possible to `lod`.
    pub fn search_node(&self, pos: Vec3, lod: u8) -> Option<NodeKey> {
        for root in self.roots {
            if self.contains_point(root, pos) {
                return Some(self.descend(root, pos, lod));
            }
        }
        None
    }

    /// Containment walk starting at an arbitrary node: escape upward until
    /// the point is inside, then descend toward the requested LOD. The root
    /// window bounds the upward phase, so the walk always terminates.
    pub fn search_from(&self, start: NodeKey, pos: Vec3, lod: u8) -> Option<NodeKey> {
        let mut key = start;
        loop {
            if self.contains_point(key, pos) {
                return Some(self.descend(key, pos, lod));
            }
            match self.nodes.get(key).and_then(|n| n.parent) {
                Some(parent) => key = parent,
                None => return self.search_node(pos, lod),
            }
        }
    }

    fn descend(&self, key: NodeKey, pos: Vec3, lod: u8) -> NodeKey {
        let node = &self.nodes[key];
        if node.lod == lod {
            return key;
        }
        for child in node.children.into_iter().flatten() {
            if self.contains_point(child, pos) {
                return self.descend(child, pos, lod);
            }
        }
        // No containing child allocated: this is the closest live node.
        key
    }

    /// Edit-path search: collects every LOD `lod` node whose halo-inflated
    /// bounds contain the point, creating missing children along the way.
    /// Boundary points match up to 8 chunks.
    pub fn search_nodes_containing_density(&mut self, pos: Vec3, lod: u8) -> Vec<NodeKey> {
        let mut out = Vec::new();
        for root in self.roots {
            self.search_create(root, pos, lod, &mut out);
        }
        out
    }

    fn search_create(&mut self, key: NodeKey, pos: Vec3, lod: u8, out: &mut Vec<NodeKey>) {
        if !self.contains_density_point(key, pos) {
            return;
        }
        let node_lod = self.nodes[key].lod;
        if node_lod == lod {
            if out.len() < 8 && !out.contains(&key) {
                out.push(key);
            }
            return;
        }
        if node_lod == 0 {
            return;
        }
        if self.nodes[key].is_leaf() {
            self.create_children(key);
        }
        let children = self.nodes[key].children;
        for child in children.into_iter().flatten() {
            self.search_create(child, pos, lod, out);
        }
    }

    // ---- neighbors ----------------------------------------------------------

    /// Resolves the same-LOD neighbor in a direction, caching the link both
    /// ways. Returns None when no same-LOD node exists there yet.
    pub fn neighbor(&mut self, key: NodeKey, dir: usize) -> Option<NodeKey> {
        let (lod, center) = {
            let node = self.nodes.get(key)?;
            if let Some(existing) = node.neighbors[dir] {
                if self
                    .nodes
                    .get(existing)
                    .map(|n| n.lod == node.lod)
                    .unwrap_or(false)
                {
                    return Some(existing);
                }
            }
            (node.lod, node.center)
        };

        let width = self.node_width(lod);
        let offset = NEIGHBOR_OFFSETS[dir];
        let probe = center
            + Vec3::new(
                offset[0] as f32 * width,
                offset[1] as f32 * width,
                offset[2] as f32 * width,
            );
        let found = self.search_from(key, probe, lod)?;
        if self.nodes[found].lod != lod {
            return None;
        }
        self.nodes[key].neighbors[dir] = Some(found);
        self.nodes[found].neighbors[OPPOSITE_NEIGHBOR[dir]] = Some(key);
        Some(found)
    }

    // ---- permanence ---------------------------------------------------------

    /// Marking permanent walks the ancestor chain up; clearing walks the
    /// subtree down. Upward-only propagation keeps the invariant that a
    /// permanent node's ancestors are all permanent.
    pub fn set_permanent(&mut self, key: NodeKey, value: bool) {
        if value {
            let mut cursor = Some(key);
            while let Some(k) = cursor {
                match self.nodes.get_mut(k) {
                    Some(node) => {
                        node.permanent = true;
                        cursor = node.parent;
                    }
                    None => break,
                }
            }
        } else {
            self.clear_permanent(key);
        }
    }

    fn clear_permanent(&mut self, key: NodeKey) {
        let children = match self.nodes.get_mut(key) {
            Some(node) => {
                node.permanent = false;
                node.children
            }
            None => return,
        };
        for child in children.into_iter().flatten() {
            self.clear_permanent(child);
        }
    }

    // ---- regeneration bookkeeping -------------------------------------------

    /// Requests a remesh; a request while one is in flight sets the
    /// regenerate-again flag instead, so no edit is ever dropped.
    pub fn request_regeneration(&mut self, key: NodeKey) {
        let node = match self.nodes.get_mut(key) {
            Some(n) => n,
            None => return,
        };
        if node.regen_requested {
            node.regen_pending_again = true;
        } else {
            node.regen_requested = true;
            self.events.push(OctreeEvent::MeshRequested(key));
        }
    }

    /// Called when a finished mesh was applied; immediately re-requests if
    /// another regeneration queued up behind the in-flight one.
    pub fn complete_regeneration(&mut self, key: NodeKey) {
        let node = match self.nodes.get_mut(key) {
            Some(n) => n,
            None => return,
        };
        node.regen_requested = false;
        if node.regen_pending_again {
            node.regen_pending_again = false;
            self.request_regeneration(key);
        }
    }

    // ---- edits --------------------------------------------------------------

    /// Writes a density into the node's override layer at the lattice point
    /// for `world`. Out-of-range points are logged and skipped.
    pub fn edit_density(&mut self, key: NodeKey, world: Vec3, value: f32) -> bool {
        let lattice = match self.overlay_coords(key, world) {
            Some(l) => l,
            None => return false,
        };
        let node = &mut self.nodes[key];
        node.overlay.set_at(lattice, value);
        node.has_overlay = true;
        node.save_dirty = true;
        self.set_permanent(key, true);
        self.events.push(OctreeEvent::SaveRequested(key));
        true
    }

    /// Writes a material into the override layer. Only an actual change
    /// marks the node dirty. Returns true if the value changed.
    pub fn edit_material(&mut self, key: NodeKey, world: Vec3, material: u8) -> bool {
        let lattice = match self.overlay_coords(key, world) {
            Some(l) => l,
            None => return false,
        };
        let node = &mut self.nodes[key];
        if node.overlay.get_material(lattice.x, lattice.y, lattice.z) == material {
            return false;
        }
        node.overlay.set_material(lattice.x, lattice.y, lattice.z, material);
        node.has_overlay = true;
        node.save_dirty = true;
        self.set_permanent(key, true);
        self.events.push(OctreeEvent::SaveRequested(key));
        true
    }

    fn overlay_coords(&self, key: NodeKey, world: Vec3) -> Option<IVec3> {
        let node = self.nodes.get(key)?;
        let voxel = self.voxel_size(node.lod);
        let rel = (world - node.position) / voxel;
        let lattice = IVec3::new(
            rel.x.round() as i32,
            rel.y.round() as i32,
            rel.z.round() as i32,
        );
        let in_range = |v: i32| (FIELD_MIN..=FIELD_MAX).contains(&v);
        if !(in_range(lattice.x) && in_range(lattice.y) && in_range(lattice.z)) {
            warn!(
                ?lattice,
                lod = node.lod,
                "edit point outside the node's halo range, skipping"
            );
            return None;
        }
        Some(lattice)
    }

    // ---- render state -------------------------------------------------------

    fn set_visible(&mut self, key: NodeKey, visible: bool) {
        if let Some(node) = self.nodes.get_mut(key) {
            if node.visible != visible {
                node.visible = visible;
                self.events.push(OctreeEvent::VisibilityChanged(key, visible));
            }
        }
    }

    /// Leaves render; an interior node keeps rendering while any child still
    /// lacks a mesh, so subdivision never opens holes.
    pub fn render_check(&mut self, key: NodeKey) {
        let node = match self.nodes.get(key) {
            Some(n) => n,
            None => return,
        };
        if !node.has_mesh {
            return;
        }
        let visible = if node.is_leaf() {
            true
        } else {
            node.children
                .iter()
                .flatten()
                .any(|c| self.nodes.get(*c).map(|n| !n.has_mesh).unwrap_or(true))
        };
        self.set_visible(key, visible);
    }

    fn collision_check(&mut self, key: NodeKey, pos: Vec3) {
        let width = self.node_width(0);
        let node = &self.nodes[key];
        let view_cell = floor_cell(pos, width);
        let node_cell = floor_cell(node.position, width);
        let eligible = (view_cell - node_cell).abs().max_element() <= COLLISION_RADIUS;
        if eligible && !node.collidable {
            self.nodes[key].collidable = true;
            self.events.push(OctreeEvent::CollidableChanged(key, true));
        }
    }

    // ---- persistence addressing ---------------------------------------------

    /// Relative record directory for a node: the root's window cell, then
    /// the chain of child indices down to the node.
    pub fn record_path(&self, key: NodeKey) -> Option<std::path::PathBuf> {
        let mut indices = Vec::new();
        let mut cursor = key;
        loop {
            let node = self.nodes.get(cursor)?;
            match node.parent {
                Some(parent) => {
                    indices.push(node.child_index);
                    cursor = parent;
                }
                None => {
                    let width = self.node_width(self.max_lod);
                    let cell = floor_cell(node.position, width);
                    let mut path =
                        std::path::PathBuf::from(format!("r{}_{}_{}", cell.x, cell.y, cell.z));
                    for index in indices.iter().rev() {
                        path.push(index.to_string());
                    }
                    return Some(path);
                }
            }
        }
    }
}

#[inline]
fn slot_index(x: usize, y: usize, z: usize) -> usize {
    (x * 3 + y) * 3 + z
}

#[inline]
fn floor_cell(pos: Vec3, width: f32) -> IVec3 {
    IVec3::new(
        (pos.x / width).floor() as i32,
        (pos.y / width).floor() as i32,
        (pos.z / width).floor() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn test_config() -> EngineConfig {
        EngineConfig {
            base_exponent: 4,
            max_lod: 2,
            ..EngineConfig::default()
        }
    }

    fn window_positions_are_canonical(tree: &Octree) {
        let width = tree.node_width(tree.max_lod);
        for sx in 0..3 {
            for sy in 0..3 {
                for sz in 0..3 {
                    let key = tree.root_at(sx, sy, sz);
                    let node = tree.node(key).expect("slot must hold a live root");
                    let expected = Vec3::new(
                        (tree.root_coord().x + sx as i32 - 1) as f32 * width,
                        (tree.root_coord().y + sy as i32 - 1) as f32 * width,
                        (tree.root_coord().z + sz as i32 - 1) as f32 * width,
                    );
                    assert_eq!(node.position, expected, "slot ({sx},{sy},{sz})");
                    assert_eq!(node.lod, tree.max_lod);
                }
            }
        }
    }

    #[test]
    fn initial_window_covers_the_origin() {
        let tree = Octree::new(&test_config());
        assert_eq!(tree.root_coord(), IVec3::ZERO);
        window_positions_are_canonical(&tree);
    }

    #[test]
    fn window_slides_with_the_viewpoint() {
        let mut tree = Octree::new(&test_config());
        let width = tree.node_width(2); // 1024

        // A zig-zag across several root cells, including a multi-cell jump.
        let moves = [
            Vec3::new(width * 1.5, 0.0, 0.0),
            Vec3::new(width * 1.5, width * -2.2, 0.0),
            Vec3::new(width * -3.1, width * -2.2, width * 4.9),
            Vec3::new(0.5, 0.5, 0.5),
        ];
        for pos in moves {
            tree.set_view_position(pos);
            let expected = IVec3::new(
                (pos.x / width).floor() as i32,
                (pos.y / width).floor() as i32,
                (pos.z / width).floor() as i32,
            );
            assert_eq!(tree.root_coord(), expected);
            window_positions_are_canonical(&tree);
        }
    }

    #[test]
    fn viewpoint_subdivides_down_to_lod0() {
        let mut tree = Octree::new(&test_config());
        tree.set_view_position(Vec3::new(8.0, 8.0, 8.0));
        assert!(tree.node_counts()[0] > 0, "expected LOD0 nodes near viewer");
        assert!(tree.node_counts()[1] > 0);

        // The finest node at the viewpoint is reachable by search.
        let found = tree.search_node(Vec3::new(8.0, 8.0, 8.0), 0).unwrap();
        assert_eq!(tree.node(found).unwrap().lod, 0);
    }

    #[test]
    fn containment_search_returns_covering_nodes() {
        let mut tree = Octree::new(&test_config());
        tree.set_view_position(Vec3::ZERO);
        let width = tree.node_width(2);

        for pos in [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(500.0, -500.0, 250.0),
            Vec3::new(-width, width, -width) * 0.99,
            Vec3::new(width * 1.9, width * 1.9, width * 1.9),
        ] {
            for lod in 0..=2 {
                let key = tree
                    .search_node(pos, lod)
                    .unwrap_or_else(|| panic!("no node contains {pos}"));
                assert!(tree.contains_point(key, pos));
            }
        }

        // Outside the window there is nothing to find.
        assert!(tree.search_node(Vec3::splat(width * 10.0), 0).is_none());
    }

    #[test]
    fn hysteresis_keeps_children_in_the_collapse_band() {
        let mut tree = Octree::new(&test_config());
        tree.set_view_position(Vec3::ZERO);
        let lod1 = tree.node_counts()[1];
        assert!(lod1 > 0);

        // Move two LOD1 chunks away: outside split (1) but inside collapse
        // (3) for the fine tiers, so LOD1 children survive.
        let w1 = tree.node_width(1);
        tree.set_view_position(Vec3::new(2.0 * w1 + 1.0, 0.5, 0.5));
        assert!(tree.node_counts()[1] > 0, "collapse band must retain children");

        // Far outside the collapse window everything fine is pruned.
        let w2 = tree.node_width(2);
        tree.set_view_position(Vec3::new(0.5, w2 * 1.5, 0.5));
        // Roots remain, their subdivided interiors near the old spot are gone.
        let total_fine: u32 = tree.node_counts()[0];
        let lod0_near_view = tree.search_node(Vec3::new(0.5, w2 * 1.5, 0.5), 0);
        assert!(lod0_near_view.is_some());
        assert!(total_fine > 0);
    }

    #[test]
    fn search_and_create_returns_boundary_cluster() {
        let mut tree = Octree::new(&test_config());
        // A corner point shared by multiple LOD0 chunks (chunk width 256).
        let keys = tree.search_nodes_containing_density(Vec3::new(256.0, 256.0, 256.0), 0);
        assert!(!keys.is_empty());
        assert!(keys.len() <= 8);
        for key in &keys {
            let node = tree.node(*key).unwrap();
            assert_eq!(node.lod, 0);
            assert!(tree.contains_density_point(*key, Vec3::new(256.0, 256.0, 256.0)));
        }
        // The same point strictly inside one chunk matches just that chunk.
        let keys = tree.search_nodes_containing_density(Vec3::new(128.0, 128.0, 128.0), 0);
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn permanence_propagates_up_and_clears_down() {
        let mut tree = Octree::new(&test_config());
        let keys = tree.search_nodes_containing_density(Vec3::new(100.0, 100.0, 100.0), 0);
        let leaf = keys[0];

        tree.set_permanent(leaf, true);
        let mut cursor = Some(leaf);
        while let Some(k) = cursor {
            let node = tree.node(k).unwrap();
            assert!(node.permanent, "ancestors must become permanent");
            cursor = node.parent;
        }

        // Top-down reset clears the whole chain.
        let mut top = leaf;
        while let Some(p) = tree.node(top).unwrap().parent {
            top = p;
        }
        tree.set_permanent(top, false);
        assert!(!tree.node(leaf).unwrap().permanent);
    }

    #[test]
    fn permanent_nodes_survive_window_and_pruning() {
        let mut tree = Octree::new(&test_config());
        tree.set_view_position(Vec3::ZERO);
        let keys = tree.search_nodes_containing_density(Vec3::new(40.0, 40.0, 40.0), 0);
        let edited = keys[0];
        assert!(tree.edit_density(edited, Vec3::new(40.0, 40.0, 40.0), -25.0));
        assert!(tree.node(edited).unwrap().permanent);

        // Wander far away repeatedly: non-permanent interiors get pruned and
        // the window slides, but the edited node must remain alive.
        let w2 = tree.node_width(2);
        for step in 1..6 {
            tree.set_view_position(Vec3::splat(w2 * step as f32 * 1.3));
            assert!(tree.contains(edited), "edited node lost at step {step}");
        }
    }

    #[test]
    fn disposal_clears_neighbor_backlinks() {
        let mut tree = Octree::new(&test_config());
        tree.set_view_position(Vec3::ZERO);

        // The LOD0 chunk at the origin and its -x neighbor, which lives
        // under the adjacent root.
        let a = tree.search_node(Vec3::new(8.0, 8.0, 8.0), 0).unwrap();
        let b = tree.neighbor(a, 0).expect("neighbor should resolve");
        assert_eq!(tree.node(a).unwrap().neighbors[0], Some(b));
        assert_eq!(tree.node(b).unwrap().neighbors[3], Some(a));

        // One root cell to the +x: the trailing root plane (with b's root)
        // is disposed, a's root stays in the window.
        let w2 = tree.node_width(2);
        tree.set_view_position(Vec3::new(w2 + 16.0, 8.0, 8.0));
        assert!(tree.contains(a), "a's root is still in the window");
        assert!(!tree.contains(b), "b went out with the trailing plane");
        assert_eq!(
            tree.node(a).unwrap().neighbors[0],
            None,
            "disposal must clear the reciprocal link"
        );
    }

    #[test]
    fn regeneration_requests_are_never_dropped() {
        let mut tree = Octree::new(&test_config());
        let key = tree.root_at(1, 1, 1);
        tree.drain_events();

        // A request while one is in flight folds into the pending flag.
        tree.request_regeneration(key);
        assert!(tree.drain_events().is_empty());
        assert!(tree.node(key).unwrap().regen_pending_again);

        // Completion consumes the pending flag into a fresh request.
        tree.complete_regeneration(key);
        let events = tree.drain_events();
        assert!(events.contains(&OctreeEvent::MeshRequested(key)));
        assert!(tree.node(key).unwrap().regen_requested);
    }

    #[test]
    fn record_paths_identify_nodes() {
        let mut tree = Octree::new(&test_config());
        let keys = tree.search_nodes_containing_density(Vec3::new(100.0, 100.0, 100.0), 0);
        let path = tree.record_path(keys[0]).unwrap();
        let text = path.to_string_lossy().into_owned();
        assert!(text.starts_with('r'));
        // Two levels of child indices below a maxLOD=2 root.
        assert_eq!(path.components().count(), 3);
    }

    #[test]
    fn out_of_range_edit_is_skipped() {
        let mut tree = Octree::new(&test_config());
        let keys = tree.search_nodes_containing_density(Vec3::new(100.0, 100.0, 100.0), 0);
        let key = keys[0];
        let far = tree.node(key).unwrap().position + Vec3::splat(10_000.0);
        assert!(!tree.edit_density(key, far, -1.0));
    }
}
