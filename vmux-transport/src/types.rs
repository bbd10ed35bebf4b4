//! Shared types describing a device to the guest transport: PCI identity,
//! BAR regions, interrupt kinds. Mirrors the shape of
//! `libvfio-user::{PciConfig, DeviceRegion, DeviceRegionKind, InterruptRequestKind}`
//! from the underlying vfio-user bindings, generalized from "one fixed vfio-user backend"
//! to "any transport implementing the trait in this crate".

use std::os::fd::RawFd;

/// Which PCI bus the guest transport should present. vDPDK and the
/// emulated NICs use `Express`; raw passthrough mirrors whatever the
/// physical device's bus type actually is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PciBusType {
    Conventional,
    PciX1,
    PciX2,
    Express,
}

/// A device's PCI identity. Immutable after construction; used to
/// synthesize the configuration space exposed to the guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub class_base: u8,
    pub class_subclass: u8,
    pub class_prog_if: u8,
    pub revision_id: u8,
}

/// Which BAR (or special region) is being declared. Config/Rom/Vga/Migration
/// are carried even though `vmux`'s device implementations mostly only use
/// BAR0-2, because the endpoint/transport contract needs to name all of
/// them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RegionIndex {
    Bar0,
    Bar1,
    Bar2,
    Bar3,
    Bar4,
    Bar5,
    Rom,
    Config,
    Vga,
    Migration,
}

bitflags::bitflags! {
    /// Protection flags on a DMA-mapped range.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Prot: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct RegionFlags: u8 {
        const READ         = 0b0001;
        const WRITE        = 0b0010;
        const MEM          = 0b0100;
        /// Trap every guest access even on a memory-backed (mmap'able)
        /// region, instead of letting the guest touch the shared mapping
        /// directly. Used by config-space-like regions.
        const ALWAYS_TRAP  = 0b1000;
    }
}

/// A declared BAR or special region. Exactly one
/// of `shared_fd`/"has a callback" applies in practice, but both are
/// legal to set: vfio-user permits a region to be both a zero-copy mmap
/// *and* trap certain accesses via `ALWAYS_TRAP`.
#[derive(Clone, Debug)]
pub struct BarRegion {
    pub index: RegionIndex,
    pub size: usize,
    pub flags: RegionFlags,
    /// File descriptor the guest maps directly (zero-copy). `None` means
    /// every access must go through the region-access callback.
    pub shared_fd: Option<RawFd>,
    pub fd_offset: u64,
    /// Whether accesses to this region are dispatched to
    /// `TransportCallbacks::region_access`. Forced `true` when
    /// `shared_fd` is `None`.
    pub has_callback: bool,
}

/// Interrupt source kinds. `vmux` only emulates MSI-X; legacy INTx is
/// excluded beyond pass-through forwarding, but the contract names all
/// five so passthrough can forward whichever kinds the physical device
/// exposes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IrqKind {
    IntX,
    Msi,
    MsiX,
    Err,
    Req,
}

/// Why the guest (or its loss) triggered a device reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetReason {
    ClientRequest,
    LostConnection,
    PciReset,
}
