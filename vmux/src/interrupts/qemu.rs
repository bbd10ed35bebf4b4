use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vmux_transport::IrqTrigger;

use super::{duration_from_nanos, fire, GlobalInterrupts, ThrottleOutcome, Throttler};

/// QEMU-style level-triggered mitigation: while the guest's pending-interrupt
/// signal is high and no mitigation timer is running, arms one for
/// `max(spacing, 128us) * factor` and raises the interrupt line; on a
/// low-to-high transition of the pending signal while no timer is running,
/// fires immediately. Grounded in `original_source/src/interrupts/qemu.hpp`.
pub struct QemuLikeThrottler {
    irq_idx: u32,
    irq: Arc<dyn IrqTrigger>,
    global: Arc<GlobalInterrupts>,
    is_deferred: Arc<AtomicBool>,
    mit_irq_level: Mutex<bool>,
    irq_level: Mutex<bool>,
    spacing: AtomicU64,
    factor: u64,
}

const MIN_MIT_DELAY_NS: u64 = 128_000;

impl QemuLikeThrottler {
    pub fn new(irq_idx: u32, irq: Arc<dyn IrqTrigger>, global: Arc<GlobalInterrupts>) -> Self {
        QemuLikeThrottler {
            irq_idx,
            irq,
            global,
            is_deferred: Arc::new(AtomicBool::new(false)),
            mit_irq_level: Mutex::new(false),
            irq_level: Mutex::new(false),
            spacing: AtomicU64::new(0),
            factor: 10,
        }
    }

    fn pci_set_irq(&self, level: bool) {
        let mut irq_level = self.irq_level.lock().unwrap();
        if *irq_level && !level {
            *irq_level = false;
        } else if !*irq_level && level {
            *irq_level = true;
            fire(self.irq.as_ref(), self.irq_idx);
        }
    }

    fn arm(&self, delay_ns: u64) {
        let irq = Arc::clone(&self.irq);
        let irq_idx = self.irq_idx;
        let is_deferred = Arc::clone(&self.is_deferred);
        std::thread::spawn(move || {
            std::thread::sleep(duration_from_nanos(delay_ns));
            fire(irq.as_ref(), irq_idx);
            is_deferred.store(false, Ordering::Release);
        });
    }
}

impl Throttler for QemuLikeThrottler {
    fn try_interrupt(&self, min_spacing_ns: u64, int_pending: bool) -> ThrottleOutcome {
        self.spacing.store(min_spacing_ns, Ordering::Relaxed);
        self.global.update();

        let mit_irq_level = *self.mit_irq_level.lock().unwrap();
        let mut outcome = ThrottleOutcome::AlreadyArmed;

        if !mit_irq_level && int_pending {
            match self
                .is_deferred
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let mit_delay = self.factor * min_spacing_ns.max(MIN_MIT_DELAY_NS);
                    self.arm(mit_delay);
                    outcome = ThrottleOutcome::Deferred;
                }
                Err(_) => return ThrottleOutcome::AlreadyArmed,
            }
        }

        *self.mit_irq_level.lock().unwrap() = int_pending;
        self.pci_set_irq(int_pending);

        outcome
    }

    fn spacing(&self) -> u64 {
        self.spacing.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingIrq(Mutex<Vec<u32>>);
    impl IrqTrigger for RecordingIrq {
        fn trigger_irq(&self, vector: u32) -> vmux_transport::Result<()> {
            self.0.lock().unwrap().push(vector);
            Ok(())
        }
    }

    #[test]
    fn low_to_high_transition_fires_immediately() {
        let irq = Arc::new(RecordingIrq(Mutex::new(Vec::new())));
        let global = Arc::new(GlobalInterrupts::new(1));
        let throttler = QemuLikeThrottler::new(2, irq.clone(), global);

        throttler.try_interrupt(1_000_000, true);
        assert_eq!(irq.0.lock().unwrap().len(), 1);

        // staying pending does not re-raise the level until it drops and
        // rises again
        throttler.try_interrupt(1_000_000, true);
        assert_eq!(irq.0.lock().unwrap().len(), 1);
    }
}
