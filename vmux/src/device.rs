//! The device interface: the operation vtable `VfuEndpoint` drives. Grounded in
//! the `Device` trait used by the underlying vfio-user bindings
//! (`region_access_barN`, `dma_range_added`/`dma_range_removed`, `reset`),
//! generalized so `declare` takes a `&mut dyn Transport` instead of the
//! raw `ctx()`/`ctx_mut()` accessors into an owned `DeviceContext` —
//! `vmux`'s `VfuEndpoint` owns the device rather than the other way
//! around (see DESIGN.md), so there is no context for the device to hand
//! back out.

use std::sync::Arc;

use vmux_transport::{IrqKind, PciIdentity, Prot, ResetReason, Transport};

use crate::dma::GuardedDmaTable;

/// Per-VM server-side hooks a concrete device (passthrough, vDPDK, an
/// emulated NIC) implements. Default bodies mirror the upstream trait's:
/// `unimplemented!()` for region accesses on BARs a device doesn't use,
/// no-ops for the DMA hooks and `rx_callback`, `Ok(())` for reset.
pub trait Device: Send {
    /// Declares PCI identity, BARs, capabilities and interrupt sources on
    /// `transport` before the first `attach`. `dma` is handed down so a
    /// device that needs concurrent reader access (vDPDK's TX/RX pollers)
    /// can clone the `Arc` out for its own threads.
    fn declare(&mut self, transport: &mut dyn Transport, dma: Arc<GuardedDmaTable>) -> crate::Result<()>;

    fn region_access_bar0(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("bar0 access on a device that does not use bar0")
    }
    fn region_access_bar1(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("bar1 access on a device that does not use bar1")
    }
    fn region_access_bar2(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("bar2 access on a device that does not use bar2")
    }
    fn region_access_bar3(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("bar3 access on a device that does not use bar3")
    }
    fn region_access_bar4(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("bar4 access on a device that does not use bar4")
    }
    fn region_access_bar5(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("bar5 access on a device that does not use bar5")
    }
    fn region_access_rom(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("rom access on a device with no expansion rom")
    }
    fn region_access_config(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("config space access beyond what the transport handles itself")
    }
    fn region_access_vga(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("vga access on a non-vga device")
    }
    fn region_access_migration(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let _ = (offset, data, write);
        unimplemented!("migration region access, unsupported")
    }

    /// The guest registered a DMA range; `local_ptr` is already inserted
    /// into the shared `GuardedDmaTable` by the time this is called.
    fn dma_range_added(&mut self, iova: u64, len: usize, local_ptr: *mut u8, prot: Prot) {
        let _ = (iova, len, local_ptr, prot);
    }

    /// The guest is unregistering `iova`; called after the table's entry
    /// has been removed.
    fn dma_range_removed(&mut self, iova: u64) {
        let _ = iova;
    }

    fn reset(&mut self, reason: ResetReason) -> Result<(), i32> {
        let _ = reason;
        Ok(())
    }

    /// Driven by `RxThread` once per scheduling quantum for devices that
    /// poll a backend driver for inbound packets (vDPDK). Devices with no
    /// RX path (passthrough, a pure TX-only test double) leave this a
    /// no-op.
    fn rx_callback(&mut self, vm_id: u32) {
        let _ = vm_id;
    }
}

/// Everything a `Device::declare` implementation needs about the PCI
/// shape it should present, read from configuration rather than hardcoded
/// per device.
#[derive(Clone, Copy, Debug)]
pub struct DeviceIdentity {
    pub pci: PciIdentity,
    pub bus: vmux_transport::PciBusType,
    pub irqs: &'static [(IrqKind, u32)],
}
