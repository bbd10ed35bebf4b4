use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use vmux_transport::IrqTrigger;

use super::{fire, GlobalInterrupts, ThrottleOutcome, Throttler};

/// Arms at an absolute deadline `now + min_spacing`; a later-scheduled
/// request is dropped, an earlier one overwrites the pending deadline.
/// Grounded in `original_source/src/interrupts/simbricks.hpp` (the
/// documented, reachable code path — the function also contains a large
/// block of dead code past an unconditional early `return 0`, which this
/// port does not carry forward).
pub struct SimbricksThrottler {
    irq_idx: u32,
    irq: Arc<dyn IrqTrigger>,
    global: Arc<GlobalInterrupts>,
    armed: Arc<AtomicBool>,
    deadline: Mutex<Option<Instant>>,
    /// Bumped every time a new timer thread is armed. A sleeping timer
    /// thread only fires if its captured generation still matches this
    /// counter when it wakes, so rescheduling to an earlier deadline
    /// supersedes (rather than races) whatever thread was armed before.
    generation: Arc<AtomicU64>,
    spacing: AtomicU64,
}

impl SimbricksThrottler {
    pub fn new(irq_idx: u32, irq: Arc<dyn IrqTrigger>, global: Arc<GlobalInterrupts>) -> Self {
        SimbricksThrottler {
            irq_idx,
            irq,
            global,
            armed: Arc::new(AtomicBool::new(false)),
            deadline: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            spacing: AtomicU64::new(0),
        }
    }

    fn arm_at(&self, deadline: Instant) {
        let irq = Arc::clone(&self.irq);
        let irq_idx = self.irq_idx;
        let armed = Arc::clone(&self.armed);
        let generation = Arc::clone(&self.generation);
        let my_generation = generation.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = deadline.saturating_duration_since(Instant::now());
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if generation.load(Ordering::Acquire) != my_generation {
                // superseded by a reschedule to an earlier deadline;
                // that thread owns firing and clearing `armed`.
                return;
            }
            fire(irq.as_ref(), irq_idx);
            armed.store(false, Ordering::Release);
        });
    }
}

impl Throttler for SimbricksThrottler {
    fn try_interrupt(&self, min_spacing_ns: u64, _int_pending: bool) -> ThrottleOutcome {
        self.spacing.store(min_spacing_ns, Ordering::Relaxed);
        self.global.update();

        let now = Instant::now();
        let candidate = now + std::time::Duration::from_nanos(min_spacing_ns);

        let mut deadline = self.deadline.lock().unwrap();
        if self.armed.load(Ordering::Acquire) {
            if let Some(current) = *deadline {
                if current <= candidate {
                    // already scheduled no later than requested
                    return ThrottleOutcome::AlreadyArmed;
                }
            }
            // already armed but for a later time: reschedule to the
            // earlier deadline. `arm_at` bumps the generation counter so
            // the previously-armed thread notices it was superseded and
            // skips firing, matching the original's single-timerfd
            // overwrite with only one fire per reschedule.
        }

        self.armed.store(true, Ordering::Release);
        *deadline = Some(candidate);
        drop(deadline);
        self.arm_at(candidate);
        ThrottleOutcome::Deferred
    }

    fn spacing(&self) -> u64 {
        self.spacing.load(Ordering::Relaxed)
    }
}
