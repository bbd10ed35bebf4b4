use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vmux_transport::IrqTrigger;

use super::{fire, ThrottleOutcome, Throttler};

/// Fires every call, immediately. Grounded in
/// `original_source/src/interrupts/none.hpp`.
pub struct NoneThrottler {
    irq_idx: u32,
    irq: Arc<dyn IrqTrigger>,
    spacing: AtomicU64,
}

impl NoneThrottler {
    pub fn new(irq_idx: u32, irq: Arc<dyn IrqTrigger>) -> Self {
        NoneThrottler {
            irq_idx,
            irq,
            spacing: AtomicU64::new(0),
        }
    }
}

impl Throttler for NoneThrottler {
    fn try_interrupt(&self, min_spacing_ns: u64, _int_pending: bool) -> ThrottleOutcome {
        self.spacing.store(min_spacing_ns, Ordering::Relaxed);
        fire(self.irq.as_ref(), self.irq_idx);
        ThrottleOutcome::Fired
    }

    fn spacing(&self) -> u64 {
        self.spacing.load(Ordering::Relaxed)
    }
}
