//! The guest transport contract: region declaration, capability append,
//! region access dispatch, MSI-X trigger, DMA (un)register callback hooks,
//! poll fd, and a "run one turn" entrypoint. A real implementation would
//! speak the vfio-user wire protocol over `/tmp/vmux_<slot>.sock`; that
//! protocol is treated as an opaque transport with a callback contract and
//! is out of scope here, so this crate only defines the contract plus
//! [`crate::loopback::LoopbackTransport`], an in-process double that
//! implements it completely for tests.

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{BarRegion, IrqKind, PciBusType, PciIdentity, Prot, ResetReason};

/// A cheaply-cloneable, thread-safe handle to a transport's MSI-X trigger
/// primitive, independent of the rest of the `Transport` API; the MSI-X
/// trigger primitive is thread-safe by contract. Throttlers hold one of
/// these to fire interrupts from their own timer thread without needing
/// shared/exclusive access to the full `Transport`.
pub trait IrqTrigger: Send + Sync {
    fn trigger_irq(&self, vector: u32) -> Result<()>;
}

/// Outcome of [`Transport::attach`]: either a guest connected, or none has
/// yet (the caller should retry — matches vfio-user's non-blocking attach
/// semantics used by `Runner`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachOutcome {
    Connected,
    WouldBlock,
}

/// Outcome of [`Transport::dispatch_one`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// At least one guest request was processed this turn.
    Processed,
    /// No request was ready.
    WouldBlock,
}

/// The device-side hooks a `Transport` dispatches into while running.
/// Grounded in `libvfio-user::Device`'s `region_access_barN` methods and
/// `dma_range_added`/`dma_range_removed`, generalized from "one method per
/// fixed BAR index" to a `RegionIndex` parameter since `vmux`'s
/// `VfuEndpoint` (not the transport) is what knows which concrete device
/// is attached.
///
/// The C callback hooks of the underlying bindings are replaced here by a
/// trait whose concrete type is the device: a `Transport` is handed a
/// `&mut dyn TransportCallbacks` for the lifetime of one dispatch call
/// rather than a stored function pointer plus an opaque context pointer.
pub trait TransportCallbacks {
    /// A guest access (read or write) of `data.len()` bytes at `offset`
    /// within the named region. Returns the number of bytes transferred,
    /// or a negative errno on failure (mirrors the underlying bindings'
    /// `Result<usize, i32>` BAR callback convention).
    fn region_access(
        &mut self,
        region: crate::types::RegionIndex,
        offset: usize,
        data: &mut [u8],
        write: bool,
    ) -> std::result::Result<usize, i32>;

    /// The guest registered a DMA range. `local_ptr` is already resolved
    /// to a pointer valid in this process: the endpoint inserts into the
    /// DMA region table, then hands the iova/vaddr/length/prot to a
    /// per-device hook.
    fn dma_register(&mut self, iova: u64, len: usize, local_ptr: *mut u8, prot: Prot);

    /// The guest is about to unregister a previously-registered range.
    /// Called *before* the entry is removed from the DMA table, so
    /// implementations that need to fence pollers first (vDPDK) or tear
    /// down a backing IOMMU mapping (passthrough) can still translate the
    /// range one last time if needed.
    fn dma_unregister(&mut self, iova: u64);

    /// The guest reset the device (or the connection was lost). Returning
    /// `Err` maps to a negative-errno reported back to the guest.
    fn reset(&mut self, reason: ResetReason) -> std::result::Result<(), i32>;
}

/// The guest-facing vfio-user-equivalent endpoint contract.
pub trait Transport: Send {
    /// Declares PCI identity and finalizes the device's basic shape.
    /// Corresponds to `vfu_pci_init`/`vfu_pci_set_id`/`vfu_pci_set_class`
    /// plus `vfu_realize_ctx` in the underlying bindings' `setup.rs`.
    fn realize(&mut self, identity: PciIdentity, bus_type: PciBusType) -> Result<()>;

    /// Declares one BAR or special region. May be called multiple times,
    /// once per region, before the first `attach`.
    fn add_bar(&mut self, region: BarRegion) -> Result<()>;

    /// Appends an opaque, pre-built capability blob to the guest-visible
    /// capability list. PCI capability byte layout parsing is out of scope
    /// here and treated as an opaque copy-and-append: the transport does
    /// not interpret `blob`; it is recorded and linked into the guest's
    /// capability walk verbatim, even if its length exceeds what the
    /// transport otherwise expects for that capability ID, in which case
    /// it still records the whole blob and surfaces it.
    fn add_capability(&mut self, blob: Vec<u8>) -> Result<()>;

    /// Declares `count` interrupt sources of the given kind.
    fn add_irqs(&mut self, kind: IrqKind, count: u32) -> Result<()>;

    /// Blocks (or, for `LoopbackTransport`, simulates blocking) until a
    /// guest connects. Returns `WouldBlock` rather than blocking forever
    /// when the transport is configured non-blocking, so `Runner` can
    /// retry under its own stop-token check.
    fn attach(&mut self) -> Result<AttachOutcome>;

    /// Processes one pending guest request by dispatching into
    /// `callbacks`, or returns `WouldBlock` if nothing is ready.
    fn dispatch_one(&mut self, callbacks: &mut dyn TransportCallbacks) -> Result<DispatchOutcome>;

    /// A file descriptor the endpoint thread can multiplex with `poll`/
    /// `epoll`: readable exactly when `dispatch_one` would return
    /// `Processed`.
    fn poll_fd(&self) -> RawFd;

    /// Requests delivery of MSI-X vector `vector` to the guest. Must be
    /// safe to call concurrently with `dispatch_one` from other threads;
    /// the MSI-X trigger primitive is thread-safe by contract, provided by
    /// the transport.
    fn trigger_irq(&self, vector: u32) -> Result<()>;

    /// A cloneable handle to just the trigger primitive, for components
    /// (throttlers) that fire interrupts from a thread other than the one
    /// driving `dispatch_one`.
    fn irq_trigger(&self) -> Arc<dyn IrqTrigger>;

    /// True once a guest has successfully attached and no disconnect has
    /// been observed since.
    fn is_connected(&self) -> bool;
}
