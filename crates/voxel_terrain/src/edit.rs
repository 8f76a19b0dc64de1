//! Brush edits: sculpting, painting, healing.
//!
//! Brushes enumerate LOD0 lattice points, resolve every owning chunk through
//! the creating search (boundary points touch up to 8 chunks), and write the
//! override layers. Touched nodes become permanent, get queued for saving,
//! and are collected so a stroke triggers exactly one regeneration per node
//! no matter how many points it wrote.

use glam::{IVec3, Vec3};

use crate::field::{DENSITY_SET_THRESHOLD, DENSITY_UNSET};
use crate::octree::{NodeKey, Octree};

/// Brush volume shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrushShape {
    /// Inclusive cube of side `radius + 1` lattice points, anchored at the
    /// rounded brush position.
    Box,

    /// Euclidean ball of `radius` chunks' worth of lattice points. With
    /// `soften`, the applied density tapers toward the isolevel at the rim.
    Sphere { soften: bool },
}

/// Sculpt/paint state: the selected material plus the isolevel the sphere
/// taper pulls toward.
pub struct EditEngine {
    material: u8,
    isolevel: f32,
}

impl EditEngine {
    pub fn new(isolevel: f32) -> Self {
        Self {
            material: 0,
            isolevel,
        }
    }

    /// Selects the material painted by subsequent brushes.
    pub fn set_material(&mut self, material: u8) {
        self.material = material;
    }

    pub fn material(&self) -> u8 {
        self.material
    }

    /// Applies a density brush plus the one-cell material feather around it.
    /// Returns the changed nodes, each already queued for one regeneration.
    pub fn apply_brush(
        &mut self,
        tree: &mut Octree,
        shape: BrushShape,
        radius: i32,
        pos: Vec3,
        density: f32,
    ) -> Vec<NodeKey> {
        let cell = tree.voxel_size(0);
        let mut changed: Vec<NodeKey> = Vec::new();

        for point in brush_points(shape, radius, pos, cell) {
            let value = self.brushed_density(shape, radius, pos, point, cell, density);
            for key in tree.search_nodes_containing_density(point, 0) {
                let wrote_density = tree.edit_density(key, point, value);
                let wrote_material = tree.edit_material(key, point, self.material);
                if (wrote_density || wrote_material) && !changed.contains(&key) {
                    changed.push(key);
                }
            }
        }

        // Feather the material one cell past the density edit.
        let painted = self.paint_points(tree, shape, radius + 1, pos);
        for key in painted {
            if !changed.contains(&key) {
                changed.push(key);
            }
        }

        for key in &changed {
            tree.request_regeneration(*key);
        }
        changed
    }

    /// Material-only brush. With `regen` the touched nodes remesh; a brush
    /// stroke calls this with `regen = false` and folds the nodes into its
    /// own changed set instead.
    pub fn apply_paint(
        &mut self,
        tree: &mut Octree,
        shape: BrushShape,
        radius: i32,
        pos: Vec3,
        regen: bool,
    ) -> Vec<NodeKey> {
        let changed = self.paint_points(tree, shape, radius, pos);
        if regen {
            for key in &changed {
                tree.request_regeneration(*key);
            }
        }
        changed
    }

    /// Restores the base terrain: unsets densities (back to the sentinel)
    /// and clears materials under the brush.
    pub fn apply_heal(
        &mut self,
        tree: &mut Octree,
        shape: BrushShape,
        radius: i32,
        pos: Vec3,
    ) -> Vec<NodeKey> {
        let saved = self.material;
        self.material = 0;
        let changed = self.apply_brush(tree, shape, radius, pos, DENSITY_UNSET);
        self.material = saved;
        changed
    }

    fn paint_points(
        &mut self,
        tree: &mut Octree,
        shape: BrushShape,
        radius: i32,
        pos: Vec3,
    ) -> Vec<NodeKey> {
        let cell = tree.voxel_size(0);
        let mut changed = Vec::new();
        for point in brush_points(shape, radius, pos, cell) {
            for key in tree.search_nodes_containing_density(point, 0) {
                if tree.edit_material(key, point, self.material) && !changed.contains(&key) {
                    changed.push(key);
                }
            }
        }
        changed
    }

    /// Density actually written at a point. Sphere brushes may taper toward
    /// the isolevel at the rim; the heal sentinel is never tapered.
    fn brushed_density(
        &self,
        shape: BrushShape,
        radius: i32,
        center: Vec3,
        point: Vec3,
        cell: f32,
        density: f32,
    ) -> f32 {
        match shape {
            BrushShape::Sphere { soften: true } if density > DENSITY_SET_THRESHOLD => {
                let t = (center.distance(point) / (radius as f32 * cell)).clamp(0.0, 1.0);
                self.isolevel + (density - self.isolevel) * (1.0 - t)
            }
            _ => density,
        }
    }
}

/// Lattice points covered by a brush, in world coordinates.
///
/// The sphere scan spans twice as far below the anchor as above it
/// (`y in [-2r, r)`) before the distance filter applies; the asymmetry is
/// kept pending product-owner clarification.
pub(crate) fn brush_points(shape: BrushShape, radius: i32, pos: Vec3, cell: f32) -> Vec<Vec3> {
    let anchor = IVec3::new(
        (pos.x / cell).round() as i32,
        (pos.y / cell).round() as i32,
        (pos.z / cell).round() as i32,
    );

    let mut points = Vec::new();
    match shape {
        BrushShape::Box => {
            for x in 0..=radius {
                for y in 0..=radius {
                    for z in 0..=radius {
                        points.push(lattice_world(anchor + IVec3::new(x, y, z), cell));
                    }
                }
            }
        }
        BrushShape::Sphere { .. } => {
            let reach = radius as f32 * cell;
            for x in -radius..radius {
                for y in -2 * radius..radius {
                    for z in -radius..radius {
                        let world = lattice_world(anchor + IVec3::new(x, y, z), cell);
                        if world.distance(pos) < reach {
                            points.push(world);
                        }
                    }
                }
            }
        }
    }
    points
}

#[inline]
fn lattice_world(lattice: IVec3, cell: f32) -> Vec3 {
    Vec3::new(
        lattice.x as f32 * cell,
        lattice.y as f32 * cell,
        lattice.z as f32 * cell,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::field::FieldView;
    use crate::mesher::{extract_surface, MesherConfig};
    use crate::octree::OctreeEvent;

    fn tree() -> Octree {
        Octree::new(&EngineConfig {
            base_exponent: 4,
            max_lod: 2,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn box_brush_writes_density_and_material() {
        let mut tree = tree();
        let mut edit = EditEngine::new(0.0);
        edit.set_material(2);

        let pos = Vec3::new(128.0, 128.0, 128.0);
        let changed = edit.apply_brush(&mut tree, BrushShape::Box, 2, pos, -30.0);
        assert!(!changed.is_empty());

        let key = *changed.first().unwrap();
        let node = tree.node(key).unwrap();
        assert_eq!(node.lod, 0);
        assert!(node.permanent);
        assert!(node.has_overlay);

        // The anchored lattice point carries the brush value.
        let lattice = ((pos - node.position) / tree.voxel_size(0)).round();
        let d = node
            .overlay
            .get(lattice.x as i32, lattice.y as i32, lattice.z as i32);
        assert_eq!(d, -30.0);
        let m = node
            .overlay
            .get_material(lattice.x as i32, lattice.y as i32, lattice.z as i32);
        assert_eq!(m, 2);
    }

    #[test]
    fn one_regeneration_per_changed_node() {
        let mut tree = tree();
        let mut edit = EditEngine::new(0.0);
        tree.drain_events();

        let changed = edit.apply_brush(
            &mut tree,
            BrushShape::Box,
            3,
            Vec3::new(100.0, 100.0, 100.0),
            -10.0,
        );

        let events = tree.drain_events();
        for key in &changed {
            let requests = events
                .iter()
                .filter(|e| matches!(e, OctreeEvent::MeshRequested(k) if k == key))
                .count();
            // Freshly created nodes already carry their initial request; the
            // stroke's regeneration folds into the pending flag.
            assert!(requests <= 1, "node saw {requests} mesh requests");
            let saves = events
                .iter()
                .filter(|e| matches!(e, OctreeEvent::SaveRequested(k) if k == key))
                .count();
            assert!(saves >= 1, "edited node must be queued for saving");
        }
    }

    #[test]
    fn sphere_scan_keeps_the_vertical_bias() {
        let cell = 16.0;
        let radius = 2;
        let points = brush_points(
            BrushShape::Sphere { soften: false },
            radius,
            Vec3::ZERO,
            cell,
        );
        assert!(!points.is_empty());

        let reach = radius as f32 * cell;
        let min_y = points.iter().map(|p| p.y).fold(f32::MAX, f32::min);
        for p in &points {
            assert!(p.distance(Vec3::ZERO) < reach);
        }
        // The scan window reaches two radii down; the distance filter trims
        // it back, but everything below -radius*cell is only reachable from
        // the extended window.
        assert!(min_y <= -reach + cell, "vertical bias lost: min_y = {min_y}");
    }

    #[test]
    fn soften_tapers_toward_the_isolevel() {
        let edit = EditEngine::new(5.0);
        let shape = BrushShape::Sphere { soften: true };
        let center = Vec3::ZERO;
        let at_center = edit.brushed_density(shape, 4, center, center, 16.0, 25.0);
        let near_rim =
            edit.brushed_density(shape, 4, center, Vec3::new(60.0, 0.0, 0.0), 16.0, 25.0);
        assert_eq!(at_center, 25.0);
        assert!(near_rim < at_center && near_rim > 5.0);

        // Heal's sentinel passes through untapered.
        let healed = edit.brushed_density(shape, 4, center, Vec3::new(60.0, 0.0, 0.0), 16.0, DENSITY_UNSET);
        assert_eq!(healed, DENSITY_UNSET);
    }

    #[test]
    fn paint_feathers_one_cell_past_the_brush() {
        let mut tree = tree();
        let mut edit = EditEngine::new(0.0);
        edit.set_material(3);

        // Box brush at a chunk-interior point: density extends `radius`
        // cells, material `radius + 1`.
        let pos = Vec3::new(64.0, 64.0, 64.0);
        let radius = 1;
        edit.apply_brush(&mut tree, BrushShape::Box, radius, pos, -20.0);

        let key = tree
            .search_nodes_containing_density(pos, 0)
            .into_iter()
            .next()
            .unwrap();
        let node = tree.node(key).unwrap();
        let cell = tree.voxel_size(0);
        let base = ((pos - node.position) / cell).round();
        let (bx, by, bz) = (base.x as i32, base.y as i32, base.z as i32);

        let beyond = radius + 1;
        assert!(node.overlay.get_material(bx + beyond, by, bz) == 3);
        assert!(!node.overlay.is_set(bx + beyond, by, bz), "density stops at the brush");
        assert!(node.overlay.is_set(bx + radius, by, bz));
    }

    #[test]
    fn heal_restores_the_base_surface() {
        let mut tree = tree();
        let mut edit = EditEngine::new(0.0);
        edit.set_material(1);
        let pos = Vec3::new(128.0, 128.0, 128.0);

        let changed = edit.apply_brush(&mut tree, BrushShape::Box, 2, pos, -40.0);
        let key = changed[0];
        assert!(tree.node(key).unwrap().has_overlay);

        // Healing a wider region unsets everything the brush wrote.
        edit.apply_heal(&mut tree, BrushShape::Box, 4, Vec3::new(96.0, 96.0, 96.0));
        let node = tree.node(key).unwrap();
        let cell = tree.voxel_size(0);
        let lattice = ((pos - node.position) / cell).round();
        let (x, y, z) = (lattice.x as i32, lattice.y as i32, lattice.z as i32);
        assert!(!node.overlay.is_set(x, y, z));
        assert_eq!(node.overlay.get_material(x, y, z), 0);
        assert_eq!(edit.material(), 1, "heal must restore the selected material");
    }

    #[test]
    fn carved_chunk_gains_a_surface() {
        let mut tree = tree();
        let mut edit = EditEngine::new(0.0);

        // Solid chunk everywhere (base density -10), then carve a pocket of
        // empty space through the override.
        let pos = Vec3::new(128.0, 128.0, 128.0);
        let changed = edit.apply_brush(&mut tree, BrushShape::Sphere { soften: false }, 3, pos, 40.0);
        let key = changed[0];

        let mut base = crate::field::VoxelField::new();
        for x in crate::field::FIELD_MIN..=crate::field::FIELD_MAX {
            for y in crate::field::FIELD_MIN..=crate::field::FIELD_MAX {
                for z in crate::field::FIELD_MIN..=crate::field::FIELD_MAX {
                    base.set(x, y, z, -10.0);
                }
            }
        }
        let node = tree.node(key).unwrap();
        let mesh = extract_surface(
            FieldView::new(&base, Some(&node.overlay)),
            tree.voxel_size(0),
            &MesherConfig {
                isolevel: 0.0,
                material_count: 1,
            },
        );
        assert!(mesh.triangle_count() > 0, "carving must expose a surface");
    }
}
