use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use vmux_transport::IrqTrigger;

use super::{duration_from_nanos, fire, ThrottleOutcome, Throttler, MAX_DEFER_NS};

/// Defers an interrupt by `min(500us, spacing - time_since_last)` whenever
/// the guest already has one pending or the minimum spacing has not
/// elapsed; fires immediately otherwise. Grounded in
/// `original_source/src/interrupts/accurate.hpp`.
pub struct AccurateThrottler {
    irq_idx: u32,
    irq: Arc<dyn IrqTrigger>,
    last_interrupt: Mutex<Option<Instant>>,
    is_deferred: Arc<AtomicBool>,
    spacing: AtomicU64,
}

impl AccurateThrottler {
    pub fn new(irq_idx: u32, irq: Arc<dyn IrqTrigger>) -> Self {
        AccurateThrottler {
            irq_idx,
            irq,
            last_interrupt: Mutex::new(None),
            is_deferred: Arc::new(AtomicBool::new(false)),
            spacing: AtomicU64::new(0),
        }
    }

    fn arm(&self, defer_by_ns: u64) {
        let irq = Arc::clone(&self.irq);
        let irq_idx = self.irq_idx;
        let is_deferred = Arc::clone(&self.is_deferred);
        std::thread::spawn(move || {
            std::thread::sleep(duration_from_nanos(defer_by_ns));
            fire(irq.as_ref(), irq_idx);
            is_deferred.store(false, Ordering::Release);
        });
    }
}

impl Throttler for AccurateThrottler {
    fn try_interrupt(&self, min_spacing_ns: u64, int_pending: bool) -> ThrottleOutcome {
        self.spacing.store(min_spacing_ns, Ordering::Relaxed);
        let now = Instant::now();
        let mut last = self.last_interrupt.lock().unwrap();

        let time_since = last.map(|t| now.saturating_duration_since(t).as_nanos() as u64);
        let defer_by = time_since
            .map(|t| min_spacing_ns.saturating_sub(t))
            .unwrap_or(min_spacing_ns)
            .min(MAX_DEFER_NS);

        let within_spacing = time_since.map(|t| t < min_spacing_ns).unwrap_or(false);

        if within_spacing || int_pending {
            match self
                .is_deferred
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    *last = Some(now + duration_from_nanos(defer_by));
                    drop(last);
                    self.arm(defer_by);
                    ThrottleOutcome::Deferred
                }
                Err(_) => ThrottleOutcome::AlreadyArmed,
            }
        } else {
            *last = Some(now);
            drop(last);
            fire(self.irq.as_ref(), self.irq_idx);
            ThrottleOutcome::Fired
        }
    }

    fn spacing(&self) -> u64 {
        self.spacing.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RecordingIrq(Mutex<Vec<u32>>);
    impl IrqTrigger for RecordingIrq {
        fn trigger_irq(&self, vector: u32) -> vmux_transport::Result<()> {
            self.0.lock().unwrap().push(vector);
            Ok(())
        }
    }

    #[test]
    fn s3_throttler_coalescing() {
        let irq = Arc::new(RecordingIrq(Mutex::new(Vec::new())));
        let throttler = AccurateThrottler::new(1, irq.clone());

        assert_eq!(
            throttler.try_interrupt(1_000_000, false),
            ThrottleOutcome::Fired
        );
        assert_eq!(irq.0.lock().unwrap().len(), 1);

        std::thread::sleep(Duration::from_micros(100));
        assert_eq!(
            throttler.try_interrupt(1_000_000, false),
            ThrottleOutcome::Deferred
        );

        std::thread::sleep(Duration::from_micros(100));
        assert_eq!(
            throttler.try_interrupt(1_000_000, false),
            ThrottleOutcome::AlreadyArmed
        );

        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(irq.0.lock().unwrap().len(), 2);
    }
}
