//! Memory pool for voxel fields to avoid frequent large allocations.
//!
//! Every node owns an override field for its whole lifetime, and nodes churn
//! as the viewpoint moves. The pool is owned by the octree and touched only
//! from the main thread; worker threads allocate their own output fields.

use crate::field::VoxelField;
use std::collections::VecDeque;

/// Pool of pre-allocated voxel fields.
pub struct FieldPool {
    /// Cleared fields ready to be reused.
    available: VecDeque<VoxelField>,

    /// Maximum pool size.
    max_size: usize,

    /// Statistics
    pub stats: FieldPoolStats,
}

#[derive(Debug, Clone, Default)]
pub struct FieldPoolStats {
    pub available_fields: usize,
    pub allocations: u64,
    pub reuses: u64,
}

impl FieldPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            available: VecDeque::with_capacity(max_size),
            max_size,
            stats: FieldPoolStats::default(),
        }
    }

    /// Acquire a fully unset field from the pool (or allocate a new one).
    pub fn acquire(&mut self) -> VoxelField {
        if let Some(field) = self.available.pop_front() {
            self.stats.reuses += 1;
            self.update_stats();
            field
        } else {
            self.stats.allocations += 1;
            VoxelField::new()
        }
    }

    /// Return a field to the pool for reuse. Cleared here so acquire is
    /// always handed a pristine field.
    pub fn release(&mut self, mut field: VoxelField) {
        if self.available.len() < self.max_size {
            field.clear();
            self.available.push_back(field);
            self.update_stats();
        }
        // If the pool is full the field is dropped.
    }

    /// Pre-allocate fields to warm up the pool.
    pub fn preallocate(&mut self, count: usize) {
        for _ in 0..count.min(self.max_size) {
            self.available.push_back(VoxelField::new());
        }
        self.update_stats();
    }

    fn update_stats(&mut self) {
        self.stats.available_fields = self.available.len();
    }
}

impl Default for FieldPool {
    fn default() -> Self {
        Self::new(256)
    }
}
