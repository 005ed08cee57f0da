//! Time-indexed, disk-cached multidimensional array: [`DistributedMatrix`].
//!
//! A matrix stores, for each stored time point, a dense tensor over a
//! (possibly empty) set of grid axes. Reads at arbitrary `t` interpolate
//! linearly between the two adjacent stored time points, or extrapolate by
//! nearest-neighbour outside the stored range. Time blocks older than
//! `cache_window` most-recent insertions are spilled to a private temporary
//! file and memory-mapped back on demand (LRU eviction).

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Row-major strides for a tensor shape.
fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn total_len(shape: &[usize]) -> usize {
    shape.iter().product::<usize>().max(if shape.is_empty() { 1 } else { 0 })
}

/// Flat start offsets of every 1-D fiber running along `axis`.
fn fiber_starts(shape: &[usize], axis: usize) -> Vec<usize> {
    let strides = row_major_strides(shape);
    if shape.is_empty() {
        return vec![0];
    }
    let reduced_shape: Vec<usize> = shape
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != axis)
        .map(|(_, &d)| d)
        .collect();
    if reduced_shape.is_empty() {
        return vec![0];
    }
    let mut starts = Vec::with_capacity(reduced_shape.iter().product());
    let mut counter = vec![0usize; reduced_shape.len()];
    loop {
        let mut offset = 0usize;
        let mut ci = 0;
        for (ax, &stride) in strides.iter().enumerate() {
            let coord = if ax == axis { 0 } else { let c = counter[ci]; ci += 1; c };
            offset += coord * stride;
        }
        starts.push(offset);
        let mut k = reduced_shape.len();
        let mut carried_out = true;
        while k > 0 {
            k -= 1;
            counter[k] += 1;
            if counter[k] < reduced_shape[k] {
                carried_out = false;
                break;
            }
            counter[k] = 0;
        }
        if carried_out {
            break;
        }
    }
    starts
}

/// A single time slice's dense tensor over the matrix's declared shape.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Slice {
    pub data: Vec<f64>,
}

impl Slice {
    pub fn zeros(shape: &[usize]) -> Self {
        Slice { data: vec![0.0; total_len(shape)] }
    }

    fn lerp(a: &Slice, b: &Slice, alpha: f64) -> Slice {
        let data = a.data.iter().zip(b.data.iter())
            .map(|(x, y)| alpha * x + (1.0 - alpha) * y)
            .collect();
        Slice { data }
    }
}

enum BlockLocation {
    Memory(Slice),
    Disk { offset: u64, len: u64 },
}

/// Append-only spill file for evicted time blocks.
struct DiskCache {
    _temp: tempfile::NamedTempFile,
    file: std::fs::File,
    path: PathBuf,
    next_offset: u64,
}

impl DiskCache {
    fn create(dir: &Path) -> std::io::Result<Self> {
        let temp = tempfile::NamedTempFile::new_in(dir)?;
        let file = temp.reopen()?;
        let path = temp.path().to_path_buf();
        Ok(DiskCache { _temp: temp, file, path, next_offset: 0 })
    }

    fn write(&mut self, slice: &Slice) -> EngineResult<(u64, u64)> {
        let bytes = bincode::serialize(slice)?;
        self.file.seek(SeekFrom::Start(self.next_offset))?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        let offset = self.next_offset;
        let len = bytes.len() as u64;
        self.next_offset += len;
        Ok((offset, len))
    }

    fn read(&self, offset: u64, len: u64) -> EngineResult<Slice> {
        // Re-open read-only each time: the backing file keeps growing as more
        // blocks spill, so a stale mmap from an earlier point would not see
        // later appends.
        let file = std::fs::File::open(&self.path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let bytes = &mmap[offset as usize..(offset + len) as usize];
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A time-indexed, disk-cached dense tensor.
pub struct DistributedMatrix {
    shape: Vec<usize>,
    times: Vec<f64>,
    blocks: Vec<BlockLocation>,
    lru: VecDeque<usize>,
    resident: usize,
    cache_window: usize,
    cache_dir: Option<PathBuf>,
    disk: Option<DiskCache>,
    cache_disabled: bool,
    pending_warning: Option<String>,
}

impl DistributedMatrix {
    pub fn new(shape: Vec<usize>) -> Self {
        Self::with_cache(shape, usize::MAX, None)
    }

    pub fn with_cache(shape: Vec<usize>, cache_window: usize, cache_dir: Option<PathBuf>) -> Self {
        DistributedMatrix {
            shape,
            times: Vec::new(),
            blocks: Vec::new(),
            lru: VecDeque::new(),
            resident: 0,
            cache_window: cache_window.max(1),
            cache_dir,
            disk: None,
            cache_disabled: false,
            pending_warning: None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn time_points(&self) -> &[f64] {
        &self.times
    }

    /// Drain a cache-fallback warning, if one was raised, for the owner to
    /// log (via `EngineContext`) exactly once.
    pub fn take_cache_warning(&mut self) -> Option<String> {
        self.pending_warning.take()
    }

    fn touch(&mut self, idx: usize) {
        self.lru.retain(|&i| i != idx);
        self.lru.push_back(idx);
    }

    fn ensure_disk_cache(&mut self) -> bool {
        if self.cache_disabled {
            return false;
        }
        if self.disk.is_some() {
            return true;
        }
        let dir = match &self.cache_dir {
            Some(d) => d.clone(),
            None => std::env::temp_dir(),
        };
        match DiskCache::create(&dir) {
            Ok(cache) => {
                self.disk = Some(cache);
                true
            }
            Err(e) => {
                self.cache_disabled = true;
                self.pending_warning =
                    Some(format!("cache directory unavailable ({e}); falling back to in-memory storage"));
                false
            }
        }
    }

    /// Evict the least-recently-used resident block to disk, if the cache is
    /// over budget and spilling is available.
    fn maybe_evict(&mut self) {
        if self.resident <= self.cache_window {
            return;
        }
        if !self.ensure_disk_cache() {
            return; // in-memory fallback: never evict
        }
        if let Some(victim) = self.lru.pop_front() {
            if let BlockLocation::Memory(slice) = &self.blocks[victim] {
                let slice = slice.clone();
                match self.disk.as_mut().unwrap().write(&slice) {
                    Ok((offset, len)) => {
                        self.blocks[victim] = BlockLocation::Disk { offset, len };
                        self.resident -= 1;
                    }
                    Err(e) => {
                        self.cache_disabled = true;
                        self.pending_warning = Some(format!("cache spill failed ({e}); disabling spill"));
                    }
                }
            }
        }
    }

    fn load(&mut self, idx: usize) -> EngineResult<Slice> {
        match &self.blocks[idx] {
            BlockLocation::Memory(s) => Ok(s.clone()),
            BlockLocation::Disk { offset, len } => {
                let slice = self.disk.as_ref().unwrap().read(*offset, *len)?;
                Ok(slice)
            }
        }
    }

    /// Insert (or overwrite) the full tensor slice at time `t`. Insertion
    /// point is found in `O(log n)`.
    pub fn set_time_point(&mut self, t: f64, slice: Slice) {
        debug_assert_eq!(slice.data.len(), total_len(&self.shape));
        match self.times.binary_search_by(|probe| probe.partial_cmp(&t).unwrap()) {
            Ok(idx) => {
                let was_resident = matches!(self.blocks[idx], BlockLocation::Memory(_));
                self.blocks[idx] = BlockLocation::Memory(slice);
                if !was_resident {
                    self.resident += 1;
                }
                self.touch(idx);
            }
            Err(idx) => {
                self.times.insert(idx, t);
                self.blocks.insert(idx, BlockLocation::Memory(slice));
                for i in self.lru.iter_mut() {
                    if *i >= idx {
                        *i += 1;
                    }
                }
                self.resident += 1;
                self.touch(idx);
            }
        }
        self.maybe_evict();
    }

    pub fn set_value(&mut self, t: f64, coords: &[usize], v: f64) -> EngineResult<()> {
        let strides = row_major_strides(&self.shape);
        let flat: usize = coords.iter().zip(strides.iter()).map(|(c, s)| c * s).sum();
        let mut slice = match self.get_time_point_exact(t) {
            Some(s) => s,
            None => Slice::zeros(&self.shape),
        };
        if flat >= slice.data.len() {
            return Err(EngineError::InvalidTarget(format!("coordinates {coords:?} out of range")));
        }
        slice.data[flat] = v;
        self.set_time_point(t, slice);
        Ok(())
    }

    pub fn get_value(&mut self, t: f64, coords: &[usize]) -> EngineResult<f64> {
        let strides = row_major_strides(&self.shape);
        let flat: usize = coords.iter().zip(strides.iter()).map(|(c, s)| c * s).sum();
        let slice = self.get_time_point(t)?;
        slice.data.get(flat).copied().ok_or_else(|| {
            EngineError::InvalidTarget(format!("coordinates {coords:?} out of range"))
        })
    }

    fn get_time_point_exact(&mut self, t: f64) -> Option<Slice> {
        let idx = self.times.binary_search_by(|probe| probe.partial_cmp(&t).unwrap()).ok()?;
        self.touch(idx);
        self.load(idx).ok()
    }

    /// Read the tensor at arbitrary `t`: exact match if stored, linear
    /// interpolation between adjacent stored points, or nearest-neighbour
    /// extrapolation outside `[t_min, t_max]`.
    pub fn get_time_point(&mut self, t: f64) -> EngineResult<Slice> {
        if self.times.is_empty() {
            return Err(EngineError::InvalidTarget("matrix has no stored time points".into()));
        }
        match self.times.binary_search_by(|probe| probe.partial_cmp(&t).unwrap()) {
            Ok(idx) => {
                self.touch(idx);
                self.load(idx)
            }
            Err(idx) => {
                if idx == 0 {
                    self.touch(0);
                    self.load(0)
                } else if idx == self.times.len() {
                    let last = self.times.len() - 1;
                    self.touch(last);
                    self.load(last)
                } else {
                    let t0 = self.times[idx - 1];
                    let t1 = self.times[idx];
                    let alpha = (t1 - t) / (t1 - t0);
                    self.touch(idx - 1);
                    self.touch(idx);
                    let s0 = self.load(idx - 1)?;
                    let s1 = self.load(idx)?;
                    Ok(Slice::lerp(&s0, &s1, alpha))
                }
            }
        }
    }

    /// Remove all time points in `[t1, t2)`, or, when `t2` is `None`, in
    /// `(t1, inf)`.
    pub fn remove_range(&mut self, t1: f64, t2: Option<f64>) {
        let keep: Vec<bool> = self.times.iter().map(|&t| {
            match t2 {
                Some(t2) => !(t >= t1 && t < t2),
                None => !(t > t1),
            }
        }).collect();
        self.retain(&keep);
    }

    /// Truncate all time points at or after `t` (or strictly after `t` when
    /// `inclusive` is `false`).
    pub fn remove_time_points_after(&mut self, t: f64, inclusive: bool) {
        let keep: Vec<bool> = self.times.iter().map(|&tt| {
            if inclusive { tt < t } else { tt <= t }
        }).collect();
        self.retain(&keep);
    }

    fn retain(&mut self, keep: &[bool]) {
        let mut new_times = Vec::new();
        let mut new_blocks = Vec::new();
        let mut resident = 0usize;
        for (i, &k) in keep.iter().enumerate() {
            if k {
                new_times.push(self.times[i]);
                if matches!(self.blocks[i], BlockLocation::Memory(_)) {
                    resident += 1;
                }
                new_blocks.push(std::mem::replace(&mut self.blocks[i], BlockLocation::Memory(Slice { data: vec![] })));
            }
        }
        self.times = new_times;
        self.blocks = new_blocks;
        self.resident = resident;
        self.lru = (0..self.times.len()).collect();
    }

    /// Data reduction hint: drop interior points closer together
    /// than `step` when their value is linearly representable within
    /// `tol` of a straight line through their surviving neighbours. The
    /// first and last point in `[t1, t2]` are always kept.
    pub fn compress_time_points(&mut self, t1: f64, t2: f64, step: f64, tol: f64) -> EngineResult<()> {
        let in_range: Vec<usize> = (0..self.times.len())
            .filter(|&i| self.times[i] >= t1 && self.times[i] <= t2)
            .collect();
        if in_range.len() < 3 {
            return Ok(());
        }
        let mut keep = vec![true; in_range.len()];
        let mut last_kept = 0usize;
        for i in 1..in_range.len() - 1 {
            let t_prev = self.times[in_range[last_kept]];
            let t_cur = self.times[in_range[i]];
            if t_cur - t_prev >= step {
                last_kept = i;
                continue;
            }
            // Candidate for removal: check the next kept neighbour forward.
            let mut next = i + 1;
            while next < in_range.len() - 1 && !keep[next] {
                next += 1;
            }
            let t_next = self.times[in_range[next]];
            let alpha = if t_next > t_prev { (t_next - t_cur) / (t_next - t_prev) } else { 1.0 };
            let s_prev = self.load(in_range[last_kept])?;
            let s_next = self.load(in_range[next])?;
            let predicted = Slice::lerp(&s_prev, &s_next, alpha);
            let actual = self.load(in_range[i])?;
            let max_err = predicted.data.iter().zip(actual.data.iter())
                .map(|(p, a)| (p - a).abs())
                .fold(0.0_f64, f64::max);
            if max_err <= tol {
                keep[i] = false;
            } else {
                last_kept = i;
            }
        }
        let mut full_keep = vec![true; self.times.len()];
        for (j, &idx) in in_range.iter().enumerate() {
            full_keep[idx] = keep[j];
        }
        self.retain(&full_keep);
        Ok(())
    }

    /// Rebuild storage after an axis gained a class: the new class gets zero
    /// mass at every stored time point.
    pub fn insert_zero_class(&mut self, axis: usize, at: usize) -> EngineResult<()> {
        let mut new_shape = self.shape.clone();
        new_shape[axis] += 1;
        for idx in 0..self.times.len() {
            let old = self.load(idx)?;
            let new_slice = insert_class(&old, &self.shape, axis, at, 0.0);
            self.blocks[idx] = BlockLocation::Memory(new_slice);
        }
        self.resident = self.times.len();
        self.shape = new_shape;
        Ok(())
    }

    /// Rebuild storage after an axis lost a class: the removed class's mass
    /// is redistributed uniformly across the remaining classes of that axis
    /// (mass-weighted rebinning is used for grid-to-grid conversion instead;
    /// this uniform rule applies specifically to in-place class removal).
    pub fn remove_class_uniform(&mut self, axis: usize, at: usize) -> EngineResult<()> {
        let mut new_shape = self.shape.clone();
        new_shape[axis] -= 1;
        for idx in 0..self.times.len() {
            let old = self.load(idx)?;
            let new_slice = remove_class_redistribute(&old, &self.shape, axis, at);
            self.blocks[idx] = BlockLocation::Memory(new_slice);
        }
        self.resident = self.times.len();
        self.shape = new_shape;
        Ok(())
    }

    /// Linear rebinning of an axis onto new boundaries, conserving the
    /// axis's first moment (mass-weighted, per the resolved open question).
    pub fn rebin_axis(&mut self, axis: usize, old_boundaries: &[f64], new_boundaries: &[f64]) -> EngineResult<()> {
        let new_n = new_boundaries.len() - 1;
        let mut new_shape = self.shape.clone();
        new_shape[axis] = new_n;
        for idx in 0..self.times.len() {
            let old = self.load(idx)?;
            let new_slice = rebin_fiber_axis(&old, &self.shape, axis, old_boundaries, new_boundaries);
            self.blocks[idx] = BlockLocation::Memory(new_slice);
        }
        self.resident = self.times.len();
        self.shape = new_shape;
        Ok(())
    }
}

fn insert_class(slice: &Slice, shape: &[usize], axis: usize, at: usize, fill: f64) -> Slice {
    let mut new_shape = shape.to_vec();
    new_shape[axis] += 1;
    let mut out = Slice { data: vec![0.0; total_len(&new_shape)] };
    let out_strides = row_major_strides(&new_shape);
    let in_strides = row_major_strides(shape);
    for &start in &fiber_starts(shape, axis) {
        let out_start = remap_fiber_start(start, shape, &in_strides, &out_strides, axis);
        let mut out_i = 0usize;
        for in_idx in 0..shape[axis] {
            let target = if in_idx < at { in_idx } else { in_idx + 1 };
            out.data[out_start + target * out_strides[axis]] = slice.data[start + in_idx * in_strides[axis]];
            out_i = target;
        }
        let _ = out_i;
        out.data[out_start + at * out_strides[axis]] = fill;
    }
    out
}

fn remove_class_redistribute(slice: &Slice, shape: &[usize], axis: usize, at: usize) -> Slice {
    let mut new_shape = shape.to_vec();
    new_shape[axis] -= 1;
    let mut out = Slice { data: vec![0.0; total_len(&new_shape)] };
    let out_strides = row_major_strides(&new_shape);
    let in_strides = row_major_strides(shape);
    let remaining = shape[axis] - 1;
    for &start in &fiber_starts(shape, axis) {
        let out_start = remap_fiber_start(start, shape, &in_strides, &out_strides, axis);
        let removed_mass = slice.data[start + at * in_strides[axis]];
        let share = if remaining > 0 { removed_mass / remaining as f64 } else { 0.0 };
        let mut out_idx = 0usize;
        for in_idx in 0..shape[axis] {
            if in_idx == at {
                continue;
            }
            out.data[out_start + out_idx * out_strides[axis]] = slice.data[start + in_idx * in_strides[axis]] + share;
            out_idx += 1;
        }
    }
    out
}

fn rebin_fiber_axis(slice: &Slice, shape: &[usize], axis: usize, old_b: &[f64], new_b: &[f64]) -> Slice {
    let new_n = new_b.len() - 1;
    let mut new_shape = shape.to_vec();
    new_shape[axis] = new_n;
    let mut out = Slice { data: vec![0.0; total_len(&new_shape)] };
    let out_strides = row_major_strides(&new_shape);
    let in_strides = row_major_strides(shape);
    for &start in &fiber_starts(shape, axis) {
        let out_start = remap_fiber_start(start, shape, &in_strides, &out_strides, axis);
        for new_idx in 0..new_n {
            let (nb0, nb1) = (new_b[new_idx], new_b[new_idx + 1]);
            let mut acc = 0.0;
            for old_idx in 0..shape[axis] {
                let (ob0, ob1) = (old_b[old_idx], old_b[old_idx + 1]);
                let overlap = (ob1.min(nb1) - ob0.max(nb0)).max(0.0);
                if overlap <= 0.0 {
                    continue;
                }
                let old_width = ob1 - ob0;
                if old_width <= 0.0 {
                    continue;
                }
                let fraction = overlap / old_width;
                acc += slice.data[start + old_idx * in_strides[axis]] * fraction;
            }
            out.data[out_start + new_idx * out_strides[axis]] = acc;
        }
    }
    out
}

/// Translate a fiber's start offset (computed with the axis coordinate fixed
/// at zero, under `in_shape`/`in_strides`) into the equivalent start offset
/// under `out_strides`, which share every axis except `axis` with `in_shape`.
fn remap_fiber_start(start: usize, in_shape: &[usize], in_strides: &[usize], out_strides: &[usize], axis: usize) -> usize {
    let mut remaining = start;
    let mut out_start = 0usize;
    for ax in 0..in_shape.len() {
        if ax == axis {
            continue;
        }
        let coord = remaining / in_strides[ax];
        remaining %= in_strides[ax];
        out_start += coord * out_strides[ax];
    }
    out_start
}
