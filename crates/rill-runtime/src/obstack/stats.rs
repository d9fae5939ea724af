//! Allocation and collection statistics
//!
//! Monotonic volume counters plus current/high-water gauges, merged from
//! child obstacks on join and optionally dumped as JSON when an obstack is
//! torn down.

use serde::Serialize;

/// What triggered a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Triggered by the runtime internally.
    Runtime,
    /// Triggered by explicit user code.
    Manual,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AllocStats {
    // Gauges with high-water marks.
    cur_chunk_count: usize,
    max_chunk_count: usize,
    cur_large_count: usize,
    max_large_count: usize,
    cur_large_size: usize,
    max_large_size: usize,
    cur_intern_count: usize,
    max_intern_count: usize,

    // Allocator volumes (monotonic).
    small_vol: u64,
    large_vol: u64,
    fragment_vol: u64,
    shadow_vol: u64,

    // Collector activity (monotonic).
    gc_reclaim_vol: u64,
    gc_scan_vol: u64,
    gc_visit_count: u64,

    runtime_collects: u64,
    manual_collects: u64,
    runtime_sweeps: u64,
    manual_sweeps: u64,
}

impl AllocStats {
    pub fn modify_chunk(&mut self, delta: isize) {
        self.cur_chunk_count = self.cur_chunk_count.wrapping_add_signed(delta);
        self.max_chunk_count = self.max_chunk_count.max(self.cur_chunk_count);
    }

    pub fn modify_large(&mut self, delta_count: isize, delta_bytes: isize) {
        self.cur_large_count = self.cur_large_count.wrapping_add_signed(delta_count);
        self.cur_large_size = self.cur_large_size.wrapping_add_signed(delta_bytes);
        self.max_large_count = self.max_large_count.max(self.cur_large_count);
        self.max_large_size = self.max_large_size.max(self.cur_large_size);
    }

    pub fn modify_intern(&mut self, delta: isize) {
        self.cur_intern_count = self.cur_intern_count.wrapping_add_signed(delta);
        self.max_intern_count = self.max_intern_count.max(self.cur_intern_count);
    }

    pub fn alloc_small(&mut self, bytes: usize) {
        self.small_vol += bytes as u64;
    }

    pub fn alloc_large(&mut self, bytes: usize) {
        self.large_vol += bytes as u64;
    }

    pub fn alloc_fragment(&mut self, bytes: usize) {
        self.fragment_vol += bytes as u64;
    }

    pub fn alloc_shadow(&mut self, bytes: usize) {
        self.shadow_vol += bytes as u64;
    }

    pub fn gc_reclaim(&mut self, bytes: usize) {
        self.gc_reclaim_vol += bytes as u64;
    }

    pub fn gc_scan(&mut self, bytes: usize) {
        self.gc_scan_vol += bytes as u64;
    }

    pub fn gc_visit(&mut self, count: usize) {
        self.gc_visit_count += count as u64;
    }

    pub fn count_collect(&mut self, mode: CollectMode) {
        match mode {
            CollectMode::Runtime => self.runtime_collects += 1,
            CollectMode::Manual => self.manual_collects += 1,
        }
    }

    pub fn count_sweep(&mut self, mode: CollectMode) {
        match mode {
            CollectMode::Runtime => self.runtime_sweeps += 1,
            CollectMode::Manual => self.manual_sweeps += 1,
        }
    }

    pub fn cur_chunk_count(&self) -> usize {
        self.cur_chunk_count
    }

    pub fn cur_large_count(&self) -> usize {
        self.cur_large_count
    }

    pub fn cur_large_size(&self) -> usize {
        self.cur_large_size
    }

    pub fn cur_intern_count(&self) -> usize {
        self.cur_intern_count
    }

    /// Merge a finished child's counters into this instance.
    pub fn merge(&mut self, other: &AllocStats) {
        self.cur_chunk_count += other.cur_chunk_count;
        self.cur_large_count += other.cur_large_count;
        self.cur_large_size += other.cur_large_size;
        self.cur_intern_count += other.cur_intern_count;
        self.max_chunk_count = self.max_chunk_count.max(self.cur_chunk_count);
        self.max_large_count = self.max_large_count.max(self.cur_large_count);
        self.max_large_size = self.max_large_size.max(self.cur_large_size);
        self.max_intern_count = self.max_intern_count.max(self.cur_intern_count);

        self.small_vol += other.small_vol;
        self.large_vol += other.large_vol;
        self.fragment_vol += other.fragment_vol;
        self.shadow_vol += other.shadow_vol;
        self.gc_reclaim_vol += other.gc_reclaim_vol;
        self.gc_scan_vol += other.gc_scan_vol;
        self.gc_visit_count += other.gc_visit_count;
        self.runtime_collects += other.runtime_collects;
        self.manual_collects += other.manual_collects;
        self.runtime_sweeps += other.runtime_sweeps;
        self.manual_sweeps += other.manual_sweeps;
    }

    /// Log a one-line JSON report.
    pub fn report(&self) {
        match serde_json::to_string(self) {
            Ok(json) => log::debug!("obstack stats: {}", json),
            Err(err) => log::warn!("obstack stats serialization failed: {}", err),
        }
    }
}
