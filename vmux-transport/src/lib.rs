pub mod error;
pub mod loopback;
pub mod primitives;
pub mod transport;
pub mod types;

pub use error::{Result, TransportError};
pub use loopback::{GuestAction, LoopbackTransport};
pub use primitives::{EventFd, MemFd};
pub use transport::{AttachOutcome, DispatchOutcome, IrqTrigger, Transport, TransportCallbacks};
pub use types::{
    BarRegion, PciBusType, PciIdentity, Prot, RegionFlags, RegionIndex, IrqKind, ResetReason,
};
