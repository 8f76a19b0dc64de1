//! Surface extraction via marching cubes.
//!
//! Pure function from a chunk's effective density field (base + override) to
//! triangle buffers. Triangles are bucketed into one index buffer per
//! material so the host renderer can bind them as sub-meshes.

use glam::{Vec2, Vec3};

use crate::field::{FieldView, FIELD_CELLS};
use crate::tables::{CORNER_OFFSETS, EDGE_CORNERS, EDGE_TABLE, TRI_TABLE};

/// Below this distance to the isolevel (or between two corner densities) the
/// zero crossing snaps to a corner instead of dividing.
const SNAP_EPSILON: f32 = 1e-5;

/// Corner samples per axis of the normal lattice (cell corners 0..=16).
const NORMAL_DIM: usize = FIELD_CELLS + 1;

/// Extraction parameters.
#[derive(Debug, Clone)]
pub struct MesherConfig {
    /// Density threshold defining the surface; densities below are inside.
    pub isolevel: f32,

    /// Number of material slots; one index buffer is emitted per slot.
    pub material_count: usize,
}

/// Triangle buffers for one chunk, in node-local coordinates.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,

    /// One index buffer per material slot.
    pub submeshes: Vec<Vec<u32>>,
}

impl MeshData {
    pub fn empty(material_count: usize) -> Self {
        Self {
            positions: Vec::new(),
            normals: Vec::new(),
            uvs: Vec::new(),
            submeshes: vec![Vec::new(); material_count],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(|s| s.len()).sum::<usize>() / 3
    }
}

/// Runs marching cubes over the 16^3 interior cells.
///
/// `voxel_size` scales lattice coordinates into node-local world units
/// (`2^(lod + base_exponent)`). Vertex normals come from the blended
/// central-difference gradients at the edge's two corners.
pub fn extract_surface(view: FieldView, voxel_size: f32, config: &MesherConfig) -> MeshData {
    let mut mesh = MeshData::empty(config.material_count.max(1));
    let normals = corner_gradients(&view, voxel_size);

    for x in 0..FIELD_CELLS as i32 {
        for y in 0..FIELD_CELLS as i32 {
            for z in 0..FIELD_CELLS as i32 {
                process_cell(&view, &normals, [x, y, z], voxel_size, config, &mut mesh);
            }
        }
    }

    mesh
}

/// Central-difference density gradient at every cell corner (17^3 lattice),
/// normalized. The halo samples make the boundary corners well-defined.
fn corner_gradients(view: &FieldView, voxel_size: f32) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; NORMAL_DIM * NORMAL_DIM * NORMAL_DIM];
    for x in 0..NORMAL_DIM as i32 {
        for y in 0..NORMAL_DIM as i32 {
            for z in 0..NORMAL_DIM as i32 {
                let grad = Vec3::new(
                    view.density(x + 1, y, z) - view.density(x - 1, y, z),
                    view.density(x, y + 1, z) - view.density(x, y - 1, z),
                    view.density(x, y, z + 1) - view.density(x, y, z - 1),
                ) / voxel_size;
                normals[normal_index(x, y, z)] = grad.normalize_or_zero();
            }
        }
    }
    normals
}

#[inline]
fn normal_index(x: i32, y: i32, z: i32) -> usize {
    (x as usize * NORMAL_DIM + y as usize) * NORMAL_DIM + z as usize
}

fn process_cell(
    view: &FieldView,
    normals: &[Vec3],
    cell: [i32; 3],
    voxel_size: f32,
    config: &MesherConfig,
    mesh: &mut MeshData,
) {
    let mut densities = [0f32; 8];
    for (i, off) in CORNER_OFFSETS.iter().enumerate() {
        densities[i] = view.density(cell[0] + off[0], cell[1] + off[1], cell[2] + off[2]);
    }

    let mut mask = 0usize;
    for (i, d) in densities.iter().enumerate() {
        if *d < config.isolevel {
            mask |= 1 << i;
        }
    }

    // Fully inside or fully outside.
    if mask == 0 || mask == 255 {
        return;
    }

    let edges = EDGE_TABLE[mask];
    if edges == 0 {
        return;
    }

    let mut edge_positions = [Vec3::ZERO; 12];
    let mut edge_normals = [Vec3::ZERO; 12];
    for (edge, &(a, b)) in EDGE_CORNERS.iter().enumerate() {
        if edges & (1 << edge) == 0 {
            continue;
        }
        let pa = corner_position(cell, a, voxel_size);
        let pb = corner_position(cell, b, voxel_size);
        let na = normals[corner_normal_index(cell, a)];
        let nb = normals[corner_normal_index(cell, b)];
        let (p, n) = interpolate_crossing(
            config.isolevel,
            pa,
            pb,
            densities[a],
            densities[b],
            na,
            nb,
        );
        edge_positions[edge] = p;
        edge_normals[edge] = n;
    }

    // The whole cell's triangles take the material at its base corner.
    let material = view.material(cell[0], cell[1], cell[2]) as usize;
    let submesh = material.min(mesh.submeshes.len() - 1);

    let tris = &TRI_TABLE[mask];
    let mut i = 0;
    while tris[i] >= 0 {
        let (e0, e1, e2) = (tris[i] as usize, tris[i + 1] as usize, tris[i + 2] as usize);
        emit_triangle(
            mesh,
            submesh,
            [edge_positions[e0], edge_positions[e1], edge_positions[e2]],
            [edge_normals[e0], edge_normals[e1], edge_normals[e2]],
        );
        i += 3;
    }
}

#[inline]
fn corner_position(cell: [i32; 3], corner: usize, voxel_size: f32) -> Vec3 {
    let off = CORNER_OFFSETS[corner];
    Vec3::new(
        (cell[0] + off[0]) as f32,
        (cell[1] + off[1]) as f32,
        (cell[2] + off[2]) as f32,
    ) * voxel_size
}

#[inline]
fn corner_normal_index(cell: [i32; 3], corner: usize) -> usize {
    let off = CORNER_OFFSETS[corner];
    normal_index(cell[0] + off[0], cell[1] + off[1], cell[2] + off[2])
}

/// Zero-crossing position and normal on an edge. Snaps to a corner when a
/// corner density sits on the isolevel or the densities are near-equal, which
/// keeps the division well away from zero.
fn interpolate_crossing(
    isolevel: f32,
    pa: Vec3,
    pb: Vec3,
    da: f32,
    db: f32,
    na: Vec3,
    nb: Vec3,
) -> (Vec3, Vec3) {
    if (isolevel - da).abs() < SNAP_EPSILON {
        return (pa, na);
    }
    if (isolevel - db).abs() < SNAP_EPSILON {
        return (pb, nb);
    }
    if (da - db).abs() < SNAP_EPSILON {
        return (pa, na);
    }

    let mu = (isolevel - da) / (db - da);
    let p = pa + (pb - pa) * mu;
    let n = na.lerp(nb, mu).normalize_or_zero();
    (p, n)
}

/// Pushes one triangle: three fresh vertices, planar x/z UVs, indices into
/// the material's bucket. Vertex order is flipped so front faces point out
/// of the solid.
fn emit_triangle(mesh: &mut MeshData, submesh: usize, points: [Vec3; 3], normals: [Vec3; 3]) {
    let base = mesh.positions.len() as u32;
    for i in [2, 1, 0] {
        mesh.positions.push(points[i]);
        mesh.normals.push(normals[i]);
        mesh.uvs.push(Vec2::new(points[i].x, points[i].z));
    }
    mesh.submeshes[submesh].extend([base, base + 1, base + 2]);
}
