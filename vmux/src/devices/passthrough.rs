//! Direct hardware passthrough: mirrors a physical PCI function's BARs,
//! interrupts and DMA mappings through the kernel's IOMMU facility.
//! Grounded in `original_source/src/devices/passthrough.hpp` and
//! `src/vfio-consumer.hpp`; the kernel ioctl sequence itself (opening a
//! VFIO container, adding a group, the `VFIO_IOMMU_MAP_DMA`/`_UNMAP_DMA`
//! calls) is out of scope here, so it is named only as the
//! `PassthroughConsumer` trait, a "Consumer object" in the original's
//! own terms.

use std::sync::Arc;

use vmux_transport::{BarRegion, IrqKind, Prot, RegionFlags, RegionIndex, ResetReason, Transport};

use crate::device::Device;
use crate::dma::GuardedDmaTable;

const PCI_COMMAND_OFFSET: usize = 0x04;
const PCI_COMMAND_INTX_DISABLE: u16 = 0x0400;

#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    pub index: RegionIndex,
    pub size: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct IrqInfo {
    pub kind: IrqKind,
    pub count: u32,
}

/// The kernel IOMMU facility's operations, named abstractly: open
/// container, add group, set IOMMU type, map DMA ranges, request device
/// FD, query region/irq info, set IRQ eventfds, mask/unmask IRQs, reset.
/// No implementation ships here — only the trait and the fake
/// passthrough's own tests use it.
pub trait PassthroughConsumer: Send {
    fn open_container(&mut self) -> crate::Result<()>;
    fn add_group(&mut self) -> crate::Result<()>;
    fn set_iommu_type(&mut self) -> crate::Result<()>;
    fn request_device_fd(&mut self) -> crate::Result<()>;
    fn query_regions(&self) -> Vec<RegionInfo>;
    fn query_irqs(&self) -> Vec<IrqInfo>;
    fn set_irq_eventfds(&mut self, kind: IrqKind, count: u32) -> crate::Result<()>;
    fn mask_irqs(&mut self, kind: IrqKind, start: u32, count: u32, masked: bool) -> crate::Result<()>;
    fn map_dma(&mut self, iova: u64, len: usize, local_ptr: *mut u8, prot: Prot) -> crate::Result<()>;
    fn unmap_dma(&mut self, iova: u64) -> crate::Result<()>;
    fn read_region(&self, region: RegionIndex, offset: usize, data: &mut [u8]) -> crate::Result<()>;
    fn write_region(&mut self, region: RegionIndex, offset: usize, data: &[u8]) -> crate::Result<()>;
    fn reset(&mut self) -> crate::Result<()>;
}

/// Mirrors a physical function's BARs/IRQs/DMA mappings one-to-one
/// through a [`PassthroughConsumer`]. Grounded in
/// `PassthroughDevice::setup_vfu` (original): `add_regions`, `add_irqs`,
/// wiring the physical MSI-X eventfds, installing the DMA hooks that
/// forward into the kernel IOMMU.
pub struct PassthroughDevice {
    consumer: Box<dyn PassthroughConsumer>,
}

impl PassthroughDevice {
    pub fn new(consumer: Box<dyn PassthroughConsumer>) -> Self {
        PassthroughDevice { consumer }
    }
}

impl Device for PassthroughDevice {
    fn declare(&mut self, transport: &mut dyn Transport, _dma: Arc<GuardedDmaTable>) -> crate::Result<()> {
        self.consumer.open_container()?;
        self.consumer.add_group()?;
        self.consumer.set_iommu_type()?;
        self.consumer.request_device_fd()?;

        for region in self.consumer.query_regions() {
            if region.size == 0 {
                continue;
            }
            transport.add_bar(BarRegion {
                index: region.index,
                size: region.size,
                flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MEM,
                shared_fd: None,
                fd_offset: 0,
                has_callback: true,
            })?;
        }

        for irq in self.consumer.query_irqs() {
            transport.add_irqs(irq.kind, irq.count)?;
            self.consumer.set_irq_eventfds(irq.kind, irq.count)?;
        }

        Ok(())
    }

    fn region_access_bar0(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        self.forward(RegionIndex::Bar0, offset, data, write)
    }
    fn region_access_bar1(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        self.forward(RegionIndex::Bar1, offset, data, write)
    }
    fn region_access_bar2(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        self.forward(RegionIndex::Bar2, offset, data, write)
    }
    fn region_access_bar3(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        self.forward(RegionIndex::Bar3, offset, data, write)
    }
    fn region_access_bar4(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        self.forward(RegionIndex::Bar4, offset, data, write)
    }
    fn region_access_bar5(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        self.forward(RegionIndex::Bar5, offset, data, write)
    }

    /// The only config-space write this device inspects: the PCI Command
    /// register's Interrupt Disable bit, forwarded as an INTx mask/unmask
    /// to the physical function. MSI-X masking is tracked per-vector by
    /// the guest's own MSI-X capability/vector table and is recorded but
    /// not forwarded, since the kernel passthrough path does not permit
    /// it.
    fn region_access_config(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        if write && offset == PCI_COMMAND_OFFSET && data.len() >= 2 {
            let command = u16::from_le_bytes([data[0], data[1]]);
            let masked = command & PCI_COMMAND_INTX_DISABLE != 0;
            if let Err(err) = self.consumer.mask_irqs(IrqKind::IntX, 0, 1, masked) {
                tracing::warn!(target: "vmux::passthrough", %err, "failed to forward intx mask state");
            }
        }
        Ok(data.len())
    }

    fn dma_range_added(&mut self, iova: u64, len: usize, local_ptr: *mut u8, prot: Prot) {
        if let Err(err) = self.consumer.map_dma(iova, len, local_ptr, prot) {
            tracing::warn!(target: "vmux::passthrough", iova, len, %err, "failed to map dma range into iommu");
        }
    }

    fn dma_range_removed(&mut self, iova: u64) {
        if let Err(err) = self.consumer.unmap_dma(iova) {
            tracing::warn!(target: "vmux::passthrough", iova, %err, "failed to unmap dma range from iommu");
        }
    }

    fn reset(&mut self, reason: ResetReason) -> Result<(), i32> {
        tracing::debug!(target: "vmux::passthrough", ?reason, "resetting passthrough device");
        self.consumer.reset().map_err(|_| libc::EIO)
    }
}

impl PassthroughDevice {
    fn forward(&mut self, region: RegionIndex, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        let result = if write {
            self.consumer.write_region(region, offset, data)
        } else {
            self.consumer.read_region(region, offset, data)
        };
        result.map(|_| data.len()).map_err(|_| libc::EIO)
    }
}
