//! Parallel FFT batch processor.
//!
//! A fixed worker pool serves a FIFO queue of transform jobs. Each worker
//! owns its own `FftEngine` so plan caches are never contended. A shared
//! LRU result cache keyed by a 64-bit xxh3 hash of the input short-circuits
//! repeated transforms of identical buffers; hash hits verify the full
//! input to defeat collisions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, trace};
use num_complex::Complex;
use parking_lot::{Condvar, Mutex};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::fft::FftEngine;
use crate::Float;

/// One transform request.
#[derive(Clone)]
pub enum FftJob<F: Float> {
    /// Forward complex FFT.
    Forward { input: Vec<Complex<F>> },
    /// Inverse complex FFT (engine-scaled by `1/N`).
    Inverse { input: Vec<Complex<F>> },
    /// Forward real FFT producing `N/2 + 1` bins.
    ForwardReal { input: Vec<F> },
    /// Inverse real FFT reconstructing `length` samples.
    InverseReal {
        spectrum: Vec<Complex<F>>,
        length: usize,
    },
}

/// A finished transform.
#[derive(Clone, Debug, PartialEq)]
pub enum FftJobResult<F: Float> {
    Complex(Vec<Complex<F>>),
    Real(Vec<F>),
}

/// Cache hit/miss counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Pool and cache configuration.
#[derive(Clone, Copy, Debug)]
pub struct FftBatchConfig {
    /// Worker count; `None` auto-sizes to the physical core count.
    pub workers: Option<usize>,
    /// Total cached results across all input sizes.
    pub cache_entries: usize,
    /// Cached results per distinct input length.
    pub cache_entries_per_size: usize,
    /// Inputs longer than this are never cached.
    pub max_cached_input: usize,
}

impl Default for FftBatchConfig {
    fn default() -> Self {
        Self {
            workers: None,
            cache_entries: 256,
            cache_entries_per_size: 32,
            max_cached_input: 1 << 16,
        }
    }
}

/// View a complex slice as its raw component bytes for hashing.
/// `Complex<F>` is a repr(C) `(re, im)` pair, so the cast is a plain
/// reinterpretation of the same floats.
fn complex_bytes<F: Float>(bins: &[Complex<F>]) -> &[u8] {
    let floats =
        unsafe { core::slice::from_raw_parts(bins.as_ptr() as *const F, bins.len() * 2) };
    bytemuck::cast_slice(floats)
}

impl<F: Float> FftJob<F> {
    fn input_len(&self) -> usize {
        match self {
            FftJob::Forward { input } | FftJob::Inverse { input } => input.len(),
            FftJob::ForwardReal { input } => input.len(),
            FftJob::InverseReal { spectrum, .. } => spectrum.len(),
        }
    }

    /// Stable byte fingerprint: discriminant, length data, sample bytes.
    fn fingerprint(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.input_len() * 16 + 16);
        match self {
            FftJob::Forward { input } => {
                bytes.push(0);
                bytes.extend_from_slice(&(input.len() as u64).to_le_bytes());
                bytes.extend_from_slice(complex_bytes(input));
            }
            FftJob::Inverse { input } => {
                bytes.push(1);
                bytes.extend_from_slice(&(input.len() as u64).to_le_bytes());
                bytes.extend_from_slice(complex_bytes(input));
            }
            FftJob::ForwardReal { input } => {
                bytes.push(2);
                bytes.extend_from_slice(&(input.len() as u64).to_le_bytes());
                bytes.extend_from_slice(bytemuck::cast_slice(input));
            }
            FftJob::InverseReal { spectrum, length } => {
                bytes.push(3);
                bytes.extend_from_slice(&(*length as u64).to_le_bytes());
                bytes.extend_from_slice(complex_bytes(spectrum));
            }
        }
        bytes
    }

    fn run(&self, engine: &mut FftEngine<F>) -> Result<FftJobResult<F>> {
        Ok(match self {
            FftJob::Forward { input } => FftJobResult::Complex(engine.fft(input)?),
            FftJob::Inverse { input } => FftJobResult::Complex(engine.ifft(input)?),
            FftJob::ForwardReal { input } => FftJobResult::Complex(engine.rfft(input)?),
            FftJob::InverseReal { spectrum, length } => {
                FftJobResult::Real(engine.irfft(spectrum, *length)?)
            }
        })
    }
}

struct CacheEntry<F: Float> {
    fingerprint: Vec<u8>,
    result: FftJobResult<F>,
    last_used: u64,
}

struct FftCache<F: Float> {
    /// Hash -> entries with that hash (collisions chain).
    map: HashMap<u64, Vec<CacheEntry<F>>>,
    /// Entry count per input length.
    per_size: HashMap<usize, usize>,
    entries: usize,
    tick: u64,
    stats: CacheStats,
    config: FftBatchConfig,
}

impl<F: Float> FftCache<F> {
    fn new(config: FftBatchConfig) -> Self {
        Self {
            map: HashMap::new(),
            per_size: HashMap::new(),
            entries: 0,
            tick: 0,
            stats: CacheStats::default(),
            config,
        }
    }

    fn lookup(&mut self, hash: u64, fingerprint: &[u8]) -> Option<FftJobResult<F>> {
        self.tick += 1;
        let tick = self.tick;
        if let Some(bucket) = self.map.get_mut(&hash) {
            for entry in bucket.iter_mut() {
                // A hash hit still verifies the full input.
                if entry.fingerprint == fingerprint {
                    entry.last_used = tick;
                    self.stats.hits += 1;
                    return Some(entry.result.clone());
                }
            }
        }
        self.stats.misses += 1;
        None
    }

    fn insert(&mut self, hash: u64, fingerprint: Vec<u8>, size: usize, result: FftJobResult<F>) {
        if size > self.config.max_cached_input || self.config.cache_entries == 0 {
            return;
        }
        let size_count = self.per_size.get(&size).copied().unwrap_or(0);
        if size_count >= self.config.cache_entries_per_size {
            self.evict_lru(Some(size));
        } else if self.entries >= self.config.cache_entries {
            self.evict_lru(None);
        }
        self.tick += 1;
        self.map.entry(hash).or_default().push(CacheEntry {
            fingerprint,
            result,
            last_used: self.tick,
        });
        *self.per_size.entry(size).or_insert(0) += 1;
        self.entries += 1;
    }

    /// Drop the least-recently-used entry, optionally only among entries of
    /// one input size.
    fn evict_lru(&mut self, size: Option<usize>) {
        let mut victim: Option<(u64, usize, u64)> = None;
        for (&hash, bucket) in self.map.iter() {
            for (index, entry) in bucket.iter().enumerate() {
                if let Some(size) = size {
                    if entry_size(entry) != size {
                        continue;
                    }
                }
                if victim.map_or(true, |(_, _, used)| entry.last_used < used) {
                    victim = Some((hash, index, entry.last_used));
                }
            }
        }
        if let Some((hash, index, _)) = victim {
            if let Some(bucket) = self.map.get_mut(&hash) {
                let entry = bucket.remove(index);
                let size = entry_size(&entry);
                if let Some(count) = self.per_size.get_mut(&size) {
                    *count = count.saturating_sub(1);
                }
                if bucket.is_empty() {
                    self.map.remove(&hash);
                }
                self.entries = self.entries.saturating_sub(1);
            }
        }
    }
}

fn entry_size<F: Float>(entry: &CacheEntry<F>) -> usize {
    // The fingerprint stores the length right after the discriminant.
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&entry.fingerprint[1..9]);
    u64::from_le_bytes(bytes) as usize
}

struct QueueState<F: Float> {
    jobs: VecDeque<(u64, FftJob<F>)>,
    results: HashMap<u64, Result<FftJobResult<F>>>,
    next_id: u64,
    submitted: u64,
    completed: u64,
    shutdown: bool,
}

struct Shared<F: Float> {
    queue: Mutex<QueueState<F>>,
    /// Signaled on submission and shutdown.
    job_ready: Condvar,
    /// Signaled on completion.
    job_done: Condvar,
    /// Serialized separately from the queue so cache traffic never blocks
    /// submissions.
    cache: Mutex<FftCache<F>>,
}

/// Ticket for a submitted job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobTicket(u64);

/// Worker pool with a shared verified result cache.
pub struct FftBatchProcessor<F: Float> {
    shared: Arc<Shared<F>>,
    workers: Vec<JoinHandle<()>>,
}

impl<F: Float> FftBatchProcessor<F> {
    pub fn new(config: FftBatchConfig) -> Self {
        let workers = config
            .workers
            .unwrap_or_else(num_cpus::get_physical)
            .max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                results: HashMap::new(),
                next_id: 0,
                submitted: 0,
                completed: 0,
                shutdown: false,
            }),
            job_ready: Condvar::new(),
            job_done: Condvar::new(),
            cache: Mutex::new(FftCache::new(config)),
        });
        debug!("fft batch: starting {workers} workers");
        let handles = (0..workers)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("fft-batch-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawning fft batch worker")
            })
            .collect();
        Self {
            shared,
            workers: handles,
        }
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a job; workers pick it up in FIFO order.
    pub fn submit(&self, job: FftJob<F>) -> JobTicket {
        let mut queue = self.shared.queue.lock();
        let id = queue.next_id;
        queue.next_id += 1;
        queue.submitted += 1;
        queue.jobs.push_back((id, job));
        drop(queue);
        self.shared.job_ready.notify_one();
        JobTicket(id)
    }

    /// Block until the job finishes and take its result.
    pub fn wait(&self, ticket: JobTicket) -> Result<FftJobResult<F>> {
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(result) = queue.results.remove(&ticket.0) {
                return result;
            }
            self.shared.job_done.wait(&mut queue);
        }
    }

    /// Block until every submitted job has completed.
    pub fn wait_all(&self) {
        let mut queue = self.shared.queue.lock();
        while queue.completed < queue.submitted {
            self.shared.job_done.wait(&mut queue);
        }
    }

    /// Submit a whole batch and collect results in order.
    pub fn run_batch(&self, jobs: Vec<FftJob<F>>) -> Vec<Result<FftJobResult<F>>> {
        let tickets: Vec<JobTicket> = jobs.into_iter().map(|job| self.submit(job)).collect();
        tickets.into_iter().map(|t| self.wait(t)).collect()
    }

    /// Cache counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.cache.lock().stats
    }
}

impl<F: Float> Drop for FftBatchProcessor<F> {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
        }
        self.shared.job_ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<F: Float>(shared: Arc<Shared<F>>) {
    // Each worker owns its engine; plan caches are per-thread.
    let mut engine = FftEngine::new();
    loop {
        let (id, job) = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.job_ready.wait(&mut queue);
            }
        };

        let fingerprint = job.fingerprint();
        let hash = xxh3_64(&fingerprint);
        let cached = shared.cache.lock().lookup(hash, &fingerprint);
        let result = match cached {
            Some(result) => {
                trace!("fft batch: cache hit for job {id}");
                Ok(result)
            }
            None => {
                let computed = job.run(&mut engine);
                if let Ok(result) = &computed {
                    shared
                        .cache
                        .lock()
                        .insert(hash, fingerprint, job.input_len(), result.clone());
                }
                computed
            }
        };

        let mut queue = shared.queue.lock();
        queue.results.insert(id, result);
        queue.completed += 1;
        drop(queue);
        shared.job_done.notify_all();
    }
}
