//! Voxel density field storage.
//!
//! A field holds one chunk's density + material samples: 16 cells per axis
//! means 17 corner samples, plus a one-sample halo on each side for gradient
//! normals and seamless edits across chunk borders, so storage is 19^3 and
//! coordinates run from -1 to 17 inclusive.
//!
//! Densities use a sentinel to mean "unset". Override fields start fully
//! unset; a read through [`FieldView`] falls back to the base field wherever
//! the override is still sentinel.

use glam::IVec3;

/// Logical cells per chunk axis.
pub const FIELD_CELLS: usize = 16;

/// Samples per axis: 17 cell corners plus the halo sample on each side.
pub const FIELD_DIM: usize = FIELD_CELLS + 3;

/// Total samples in one field.
pub const FIELD_VOLUME: usize = FIELD_DIM * FIELD_DIM * FIELD_DIM;

/// Smallest addressable coordinate (halo).
pub const FIELD_MIN: i32 = -1;

/// Largest addressable coordinate (halo).
pub const FIELD_MAX: i32 = FIELD_CELLS as i32 + 1;

/// Sentinel density marking an unset cell in an override field.
pub const DENSITY_UNSET: f32 = -100_000.0;

/// Densities above this are considered set. Sits well below any density a
/// generator produces, with slack so the sentinel survives float round trips.
pub const DENSITY_SET_THRESHOLD: f32 = -99_999.0;

/// Density + material lattice for one chunk.
#[derive(Clone)]
pub struct VoxelField {
    densities: Box<[f32; FIELD_VOLUME]>,
    materials: Box<[u8; FIELD_VOLUME]>,
}

#[inline]
fn index(x: i32, y: i32, z: i32) -> usize {
    debug_assert!(
        (FIELD_MIN..=FIELD_MAX).contains(&x)
            && (FIELD_MIN..=FIELD_MAX).contains(&y)
            && (FIELD_MIN..=FIELD_MAX).contains(&z),
        "field coordinate ({x},{y},{z}) outside [{FIELD_MIN},{FIELD_MAX}]"
    );
    ((x + 1) as usize * FIELD_DIM + (y + 1) as usize) * FIELD_DIM + (z + 1) as usize
}

impl VoxelField {
    /// A fully unset field: sentinel densities, material 0 everywhere.
    pub fn new() -> Self {
        Self {
            densities: Box::new([DENSITY_UNSET; FIELD_VOLUME]),
            materials: Box::new([0; FIELD_VOLUME]),
        }
    }

    /// True if the cell's density has been written (non-sentinel).
    #[inline]
    pub fn is_set(&self, x: i32, y: i32, z: i32) -> bool {
        self.densities[index(x, y, z)] > DENSITY_SET_THRESHOLD
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32, z: i32) -> f32 {
        self.densities[index(x, y, z)]
    }

    #[inline]
    pub fn get_material(&self, x: i32, y: i32, z: i32) -> u8 {
        self.materials[index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: i32, y: i32, z: i32, value: f32) {
        self.densities[index(x, y, z)] = value;
    }

    #[inline]
    pub fn set_material(&mut self, x: i32, y: i32, z: i32, value: u8) {
        self.materials[index(x, y, z)] = value;
    }

    #[inline]
    pub fn get_at(&self, p: IVec3) -> f32 {
        self.get(p.x, p.y, p.z)
    }

    #[inline]
    pub fn set_at(&mut self, p: IVec3, value: f32) {
        self.set(p.x, p.y, p.z, value);
    }

    /// Additive merge: every set cell of `other` overwrites this field.
    /// Used when a loaded edit record is folded into a live override field.
    pub fn apply_override(&mut self, other: &VoxelField) {
        for i in 0..FIELD_VOLUME {
            if other.densities[i] > DENSITY_SET_THRESHOLD {
                self.densities[i] = other.densities[i];
            }
            if other.materials[i] != 0 {
                self.materials[i] = other.materials[i];
            }
        }
    }

    /// Resets every density to the sentinel and every material to 0, making
    /// the field safe to reuse as a fresh override layer.
    pub fn clear(&mut self) {
        self.densities.fill(DENSITY_UNSET);
        self.materials.fill(0);
    }

    /// True if no cell has been written.
    pub fn is_empty(&self) -> bool {
        self.densities.iter().all(|d| *d <= DENSITY_SET_THRESHOLD)
            && self.materials.iter().all(|m| *m == 0)
    }

    /// Run-length encodes the density plane. One linear scan in x-outer,
    /// y-middle, z-inner order; equal consecutive values merge into a run.
    pub fn compress_densities(&self) -> Vec<(u32, f32)> {
        compress(self.densities.iter().copied())
    }

    /// Run-length encodes the material plane. Same ordering as densities.
    pub fn compress_materials(&self) -> Vec<(u32, u8)> {
        compress(self.materials.iter().copied())
    }

    /// Inverse of [`compress_densities`](Self::compress_densities). The runs
    /// must cover the field volume exactly.
    pub fn decompress_densities(&mut self, runs: &[(u32, f32)]) -> Result<(), CodecError> {
        decompress(runs, &mut self.densities[..])
    }

    /// Inverse of [`compress_materials`](Self::compress_materials).
    pub fn decompress_materials(&mut self, runs: &[(u32, u8)]) -> Result<(), CodecError> {
        decompress(runs, &mut self.materials[..])
    }
}

impl Default for VoxelField {
    fn default() -> Self {
        Self::new()
    }
}

/// Run count does not match the field volume.
#[derive(Debug, PartialEq, Eq)]
pub struct CodecError;

fn compress<T: Copy + PartialEq>(values: impl Iterator<Item = T>) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for v in values {
        match runs.last_mut() {
            Some((count, last)) if *last == v => *count += 1,
            _ => runs.push((1, v)),
        }
    }
    runs
}

fn decompress<T: Copy>(runs: &[(u32, T)], out: &mut [T]) -> Result<(), CodecError> {
    let total: usize = runs.iter().map(|(n, _)| *n as usize).sum();
    if total != out.len() {
        return Err(CodecError);
    }
    let mut i = 0;
    for (count, value) in runs {
        for _ in 0..*count {
            out[i] = *value;
            i += 1;
        }
    }
    Ok(())
}

/// Read view over a base field with an optional override layer.
///
/// Reads consult the override first: a density wins if it is set, a material
/// wins if it is nonzero. This is the merge the mesher sees; edits only ever
/// write the override, the base stays immutable after generation.
#[derive(Clone, Copy)]
pub struct FieldView<'a> {
    base: &'a VoxelField,
    overlay: Option<&'a VoxelField>,
}

impl<'a> FieldView<'a> {
    pub fn new(base: &'a VoxelField, overlay: Option<&'a VoxelField>) -> Self {
        Self { base, overlay }
    }

    #[inline]
    pub fn density(&self, x: i32, y: i32, z: i32) -> f32 {
        if let Some(over) = self.overlay {
            let d = over.get(x, y, z);
            if d > DENSITY_SET_THRESHOLD {
                return d;
            }
        }
        self.base.get(x, y, z)
    }

    #[inline]
    pub fn material(&self, x: i32, y: i32, z: i32) -> u8 {
        if let Some(over) = self.overlay {
            let m = over.get_material(x, y, z);
            if m != 0 {
                return m;
            }
        }
        self.base.get_material(x, y, z)
    }

    #[inline]
    pub fn density_at(&self, p: IVec3) -> f32 {
        self.density(p.x, p.y, p.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_field() -> VoxelField {
        let mut f = VoxelField::new();
        for x in FIELD_MIN..=FIELD_MAX {
            for y in FIELD_MIN..=FIELD_MAX {
                for z in FIELD_MIN..=FIELD_MAX {
                    f.set(x, y, z, (x * 31 + y * 7 + z) as f32 * 0.5);
                    f.set_material(x, y, z, ((x + y + z).rem_euclid(5)) as u8);
                }
            }
        }
        f
    }

    #[test]
    fn rle_round_trip_is_exact() {
        let field = filled_field();
        let d = field.compress_densities();
        let m = field.compress_materials();

        let mut out = VoxelField::new();
        out.decompress_densities(&d).unwrap();
        out.decompress_materials(&m).unwrap();

        for x in FIELD_MIN..=FIELD_MAX {
            for y in FIELD_MIN..=FIELD_MAX {
                for z in FIELD_MIN..=FIELD_MAX {
                    assert_eq!(field.get(x, y, z).to_bits(), out.get(x, y, z).to_bits());
                    assert_eq!(field.get_material(x, y, z), out.get_material(x, y, z));
                }
            }
        }
    }

    #[test]
    fn rle_merges_constant_regions() {
        let field = VoxelField::new();
        let runs = field.compress_densities();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0 as usize, FIELD_VOLUME);
    }

    #[test]
    fn rle_rejects_wrong_length() {
        let mut field = VoxelField::new();
        assert_eq!(field.decompress_densities(&[(3, 1.0)]), Err(CodecError));
    }

    #[test]
    fn overlay_wins_only_where_set() {
        let mut base = VoxelField::new();
        let mut over = VoxelField::new();
        base.set(0, 0, 0, 2.0);
        base.set(1, 0, 0, 3.0);
        base.set_material(0, 0, 0, 2);
        over.set(0, 0, 0, -7.0);
        over.set_material(1, 0, 0, 4);

        let view = FieldView::new(&base, Some(&over));
        assert_eq!(view.density(0, 0, 0), -7.0);
        assert_eq!(view.density(1, 0, 0), 3.0);
        // Material 2 from the base shows where the overlay is zero.
        assert_eq!(view.material(0, 0, 0), 2);
        assert_eq!(view.material(1, 0, 0), 4);
    }

    #[test]
    fn apply_override_is_additive() {
        let mut target = VoxelField::new();
        target.set(2, 2, 2, 1.0);
        let mut patch = VoxelField::new();
        patch.set(5, 5, 5, 9.0);
        patch.set_material(5, 5, 5, 3);

        target.apply_override(&patch);
        assert_eq!(target.get(2, 2, 2), 1.0);
        assert_eq!(target.get(5, 5, 5), 9.0);
        assert_eq!(target.get_material(5, 5, 5), 3);
    }

    #[test]
    fn clear_resets_to_sentinel() {
        let mut field = filled_field();
        field.clear();
        assert!(field.is_empty());
        assert!(!field.is_set(0, 0, 0));
    }

    #[test]
    fn halo_coordinates_are_addressable() {
        let mut field = VoxelField::new();
        field.set(FIELD_MIN, FIELD_MIN, FIELD_MIN, 1.0);
        field.set(FIELD_MAX, FIELD_MAX, FIELD_MAX, 2.0);
        assert_eq!(field.get(FIELD_MIN, FIELD_MIN, FIELD_MIN), 1.0);
        assert_eq!(field.get(FIELD_MAX, FIELD_MAX, FIELD_MAX), 2.0);
    }
}
