//! Interrupt throttling. Four variants share one
//! `Throttler` trait; each fires through an [`vmux_transport::IrqTrigger`]
//! handle rather than holding the whole `Transport`, since deferred firing
//! happens from a timer thread independent of the endpoint's dispatch loop.

mod accurate;
mod global;
mod none;
mod qemu;
mod simbricks;

pub use accurate::AccurateThrottler;
pub use global::GlobalInterrupts;
pub use none::NoneThrottler;
pub use qemu::QemuLikeThrottler;
pub use simbricks::SimbricksThrottler;

use std::sync::Arc;
use std::time::Duration;

use vmux_transport::IrqTrigger;

/// Outcome of [`Throttler::try_interrupt`]. The original returns a raw
/// status integer per variant (`1337`/`1338`/`1339`/bool); here those
/// collapse into one meaningfully-named enum shared by all variants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThrottleOutcome {
    /// The interrupt fired immediately.
    Fired,
    /// A timer was armed to fire later; this call did not fire.
    Deferred,
    /// A timer was already armed and will fire no later than requested;
    /// this call was a no-op.
    AlreadyArmed,
}

/// Common contract for all four throttler variants.
/// `min_spacing_ns` is nanoseconds; `int_pending` mirrors the guest's
/// current pending-interrupt signal.
pub trait Throttler: Send + Sync {
    fn try_interrupt(&self, min_spacing_ns: u64, int_pending: bool) -> ThrottleOutcome;

    /// Most recently requested minimum spacing, for `GlobalInterrupts` to
    /// aggregate so external readers can observe it.
    fn spacing(&self) -> u64;
}

/// Minimum granularity the `Accurate`/`Simbricks` variants clamp deferrals
/// to, mirroring the original's `500000` ns constant.
pub(crate) const MAX_DEFER_NS: u64 = 500_000;

pub(crate) fn duration_from_nanos(ns: u64) -> Duration {
    Duration::from_nanos(ns)
}

fn fire(irq: &dyn IrqTrigger, irq_idx: u32) {
    if let Err(err) = irq.trigger_irq(irq_idx) {
        tracing::warn!(target: "vmux::throttle", irq_idx, %err, "failed to trigger MSI-X");
    }
}

/// Which throttler variant to construct, selected by `--throttler`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThrottlerKind {
    None,
    Accurate,
    QemuLike,
    Simbricks,
}

impl std::str::FromStr for ThrottlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ThrottlerKind::None),
            "accurate" => Ok(ThrottlerKind::Accurate),
            "qemu" => Ok(ThrottlerKind::QemuLike),
            "simbricks" => Ok(ThrottlerKind::Simbricks),
            other => Err(format!("unknown throttler variant: {other}")),
        }
    }
}

pub fn build(
    kind: ThrottlerKind,
    irq_idx: u32,
    irq: Arc<dyn IrqTrigger>,
    global: Arc<GlobalInterrupts>,
) -> Arc<dyn Throttler> {
    match kind {
        ThrottlerKind::None => Arc::new(NoneThrottler::new(irq_idx, irq)),
        ThrottlerKind::Accurate => Arc::new(AccurateThrottler::new(irq_idx, irq)),
        ThrottlerKind::QemuLike => Arc::new(QemuLikeThrottler::new(irq_idx, irq, global)),
        ThrottlerKind::Simbricks => Arc::new(SimbricksThrottler::new(irq_idx, irq, global)),
    }
}
