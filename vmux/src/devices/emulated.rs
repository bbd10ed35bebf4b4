//! The trait boundary an in-process behavioral model of an Intel-class
//! NIC (e810/e1000) would implement. The packet-processing behavioral
//! model of specific NIC silicon is out of scope here; what is in scope
//! is the seam at which `vmux` hands register accesses to one.

use std::sync::Arc;

use vmux_transport::{BarRegion, Prot, RegionFlags, RegionIndex, ResetReason, Transport};

use crate::device::Device;
use crate::dma::GuardedDmaTable;

/// A behavioral NIC model: given a BAR0 register access, returns whatever
/// it would return. `vmux` ships no real implementation; `EmulatedDevice`
/// just routes BAR0 to whatever is plugged in here.
pub trait NicModel: Send {
    fn register_access(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32>;
    fn reset(&mut self);
}

pub struct EmulatedDevice {
    bar0_size: usize,
    model: Box<dyn NicModel>,
}

impl EmulatedDevice {
    pub fn new(bar0_size: usize, model: Box<dyn NicModel>) -> Self {
        EmulatedDevice { bar0_size, model }
    }
}

impl Device for EmulatedDevice {
    fn declare(&mut self, transport: &mut dyn Transport, _dma: Arc<GuardedDmaTable>) -> crate::Result<()> {
        transport.add_bar(BarRegion {
            index: RegionIndex::Bar0,
            size: self.bar0_size,
            flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MEM | RegionFlags::ALWAYS_TRAP,
            shared_fd: None,
            fd_offset: 0,
            has_callback: true,
        })?;
        Ok(())
    }

    fn region_access_bar0(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        self.model.register_access(offset, data, write)
    }

    fn reset(&mut self, reason: ResetReason) -> Result<(), i32> {
        let _ = reason;
        self.model.reset();
        Ok(())
    }

    fn dma_range_added(&mut self, iova: u64, len: usize, local_ptr: *mut u8, prot: Prot) {
        let _ = (iova, len, local_ptr, prot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullModel;
    impl NicModel for NullModel {
        fn register_access(&mut self, _offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
            if !write {
                data.fill(0);
            }
            Ok(data.len())
        }
        fn reset(&mut self) {}
    }

    #[test]
    fn unwritten_registers_read_zero() {
        let mut device = EmulatedDevice::new(0x4000, Box::new(NullModel));
        let mut buf = [0xffu8; 4];
        assert_eq!(device.region_access_bar0(0, &mut buf, false), Ok(4));
        assert_eq!(buf, [0, 0, 0, 0]);
    }
}
