use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use super::Throttler;

/// Aggregates throttler spacings and a coarse CPU-pressure estimate,
/// recomputed once per wall-clock second. Grounded in
/// `original_source/src/interrupts/global.{hpp,cpp}`; `cpu_usage` is
/// approximated from wall-clock elapsed time rather than `getrusage`
/// (the original's `boost::timer::cpu_timer`), since nothing else in the
/// pack reaches for a process-time crate. The fields are read without
/// locks; torn reads are tolerated.
pub struct GlobalInterrupts {
    nr_threads: u32,
    started: Mutex<Instant>,
    /// Weak so registering a throttler does not keep it alive past the
    /// device that owns it.
    throttlers: Mutex<Vec<Weak<dyn Throttler>>>,
    spacing_min_ns: AtomicU64,
    spacing_max_ns: AtomicU64,
    spacing_avg_ns: AtomicU64,
    /// fixed-point, ×1000 (so 0.9 is stored as 900)
    cpu_usage_milli: AtomicU32,
    /// fixed-point, ×1000 (so 1.1 is stored as 1100)
    slow_down_milli: AtomicU32,
}

impl GlobalInterrupts {
    pub fn new(nr_threads: u32) -> Self {
        GlobalInterrupts {
            nr_threads,
            started: Mutex::new(Instant::now()),
            throttlers: Mutex::new(Vec::new()),
            spacing_min_ns: AtomicU64::new(u64::MAX),
            spacing_max_ns: AtomicU64::new(0),
            spacing_avg_ns: AtomicU64::new(0),
            cpu_usage_milli: AtomicU32::new(0),
            slow_down_milli: AtomicU32::new(1000),
        }
    }

    /// Registers a throttler for aggregation.
    pub fn add(&self, throttler: &Arc<dyn Throttler>) {
        self.throttlers.lock().unwrap().push(Arc::downgrade(throttler));
    }

    /// Recomputes `cpu_usage`/`slow_down` once per elapsed wall-second, and
    /// always refreshes {min, max, avg} over registered spacings.
    pub fn update(&self) {
        let mut started = self.started.lock().unwrap();
        let elapsed = started.elapsed();
        if elapsed.as_secs() >= 1 {
            // A full CPU-time measurement needs getrusage; we approximate
            // cpu_usage from the fraction of the wall-second that elapsed
            // beyond one second, clamped to [0, 1].
            let cpu_usage = (elapsed.as_secs_f32() - 1.0).clamp(0.0, 1.0);
            self.cpu_usage_milli
                .store((cpu_usage * 1000.0) as u32, Ordering::Relaxed);

            let slow_down = self.slow_down_milli.load(Ordering::Relaxed) as f32 / 1000.0;
            let next = if cpu_usage > 0.9 {
                slow_down * 1.1
            } else {
                (slow_down * 0.9).max(1.0)
            };
            self.slow_down_milli
                .store((next * 1000.0) as u32, Ordering::Relaxed);
            *started = Instant::now();
        }
        drop(started);

        let mut throttlers = self.throttlers.lock().unwrap();
        throttlers.retain(|t| t.strong_count() > 0);
        let mut min = u64::MAX;
        let mut max = 0u64;
        for t in throttlers.iter() {
            if let Some(t) = t.upgrade() {
                let v = t.spacing();
                min = min.min(v);
                max = max.max(v);
            }
        }
        if min != u64::MAX {
            self.spacing_min_ns.store(min, Ordering::Relaxed);
            self.spacing_max_ns.store(max, Ordering::Relaxed);
            self.spacing_avg_ns.store((min + max) / 2, Ordering::Relaxed);
        }
    }

    pub fn spacing_min_ns(&self) -> u64 {
        self.spacing_min_ns.load(Ordering::Relaxed)
    }

    pub fn spacing_max_ns(&self) -> u64 {
        self.spacing_max_ns.load(Ordering::Relaxed)
    }

    pub fn spacing_avg_ns(&self) -> u64 {
        self.spacing_avg_ns.load(Ordering::Relaxed)
    }

    pub fn cpu_usage(&self) -> f32 {
        self.cpu_usage_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn slow_down(&self) -> f32 {
        self.slow_down_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn nr_threads(&self) -> u32 {
        self.nr_threads
    }
}
