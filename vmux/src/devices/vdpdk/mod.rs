//! The vDPDK device: BAR0 control region plus two shared-memfd ring
//! BARs, a TX polling thread, and an RX callback.
//! Grounded in `original_source/src/devices/vdpdk.cpp`'s `VdpdkDevice`
//! (constructor PCI id defaults, `setup_vfu`, `region_access_cb`).

pub mod rx;
pub mod ring;
pub mod tx;

use std::sync::{Arc, Mutex};

use vmux_transport::{
    BarRegion, PciBusType, PciIdentity, RegionFlags, RegionIndex, ResetReason, Transport,
};

use crate::device::Device;
use crate::dma::GuardedDmaTable;
use crate::driver::Driver;
use crate::interrupts::Throttler;

use ring::{read_ring_setup, REGION_SIZE};
use rx::RxQueue;
use tx::{TxPoller, TxPollerConfig};

const OFFSET_DEBUG_STRING: usize = 0x00;
const OFFSET_TX_QUEUE_START: usize = 0x40;
const OFFSET_TX_QUEUE_STOP: usize = 0x80;
const OFFSET_RX_QUEUE_START: usize = 0x140;
const OFFSET_RX_QUEUE_STOP: usize = 0x180;

const BANNER: &[u8] = b"vmux vdpdk control region\0";

/// vendor/device/subsystem ids the original assigns a vDPDK device
/// (`original_source/src/devices/vdpdk.cpp` constructor).
pub const VDPDK_PCI_IDENTITY: PciIdentity = PciIdentity {
    vendor_id: 0x1af4,
    device_id: 0x7abc,
    subsystem_vendor_id: 0,
    subsystem_id: 0,
    class_base: 2,
    class_subclass: 0,
    class_prog_if: 0,
    revision_id: 1,
};

/// The paravirtual ring device. `device_id` names the
/// poller thread (`vmuxTx<device_id>`) and is the `vm_id` passed to
/// `driver` for RX/TX.
pub struct VdpdkDevice {
    device_id: u32,
    driver: Arc<dyn Driver>,
    tx_config: TxPollerConfig,

    debug_buf: Vec<u8>,

    tx_bar: Vec<u8>,
    rx_bar: Vec<u8>,

    dma: Option<Arc<GuardedDmaTable>>,
    tx_poller: Option<TxPoller>,
    rx_queue: Arc<Mutex<Option<RxQueue>>>,

    throttler: Option<Arc<dyn Throttler>>,
    min_spacing_ns: u64,
}

impl VdpdkDevice {
    pub fn new(device_id: u32, driver: Arc<dyn Driver>, tx_config: TxPollerConfig) -> Self {
        VdpdkDevice {
            device_id,
            driver,
            tx_config,
            debug_buf: Vec::new(),
            tx_bar: vec![0u8; REGION_SIZE],
            rx_bar: vec![0u8; REGION_SIZE],
            dma: None,
            tx_poller: None,
            rx_queue: Arc::new(Mutex::new(None)),
            throttler: None,
            min_spacing_ns: 0,
        }
    }

    /// Wires up the interrupt throttler that fires MSI-X after
    /// `rx_callback` delivers at least one packet into guest-visible
    /// memory.
    pub fn with_throttler(mut self, throttler: Arc<dyn Throttler>, min_spacing_ns: u64) -> Self {
        self.throttler = Some(throttler);
        self.min_spacing_ns = min_spacing_ns;
        self
    }

    fn dma(&self) -> Arc<GuardedDmaTable> {
        self.dma.clone().expect("declare must run before any region access")
    }

    fn handle_debug_write(&mut self, data: &[u8]) -> Result<usize, i32> {
        for &byte in data {
            if byte == 0 {
                tracing::info!(
                    target: "vmux::vdpdk",
                    device_id = self.device_id,
                    msg = %String::from_utf8_lossy(&self.debug_buf),
                    "vdpdk debug string"
                );
                self.debug_buf.clear();
            } else {
                self.debug_buf.push(byte);
            }
        }
        Ok(data.len())
    }

    fn tx_queue_start(&mut self, queue_idx: u16) -> Result<usize, i32> {
        if queue_idx != 0 {
            // Matches the original's own rejection: only one TX queue per
            // device is wired up.
            return Err(libc::EINVAL);
        }
        let setup = read_ring_setup(&self.tx_bar);
        self.tx_poller = None; // drop joins the previous poller first
        self.tx_poller = Some(TxPoller::spawn(
            self.device_id,
            self.device_id,
            self.dma(),
            Arc::clone(&self.driver),
            setup.ring_iova,
            setup.idx_mask,
            self.tx_config,
        ));
        Ok(2)
    }

    fn tx_queue_stop(&mut self, queue_idx: u16) -> Result<usize, i32> {
        if queue_idx != 0 {
            return Err(libc::EINVAL);
        }
        self.tx_poller = None;
        Ok(2)
    }

    fn rx_queue_start(&mut self, queue_idx: u16) -> Result<usize, i32> {
        if queue_idx != 0 {
            return Err(libc::EINVAL);
        }
        let setup = read_ring_setup(&self.rx_bar);
        *self.rx_queue.lock().unwrap() = Some(RxQueue {
            ring_iova: setup.ring_iova,
            idx_mask: setup.idx_mask,
            idx: 0,
        });
        Ok(2)
    }

    fn rx_queue_stop(&mut self, queue_idx: u16) -> Result<usize, i32> {
        if queue_idx != 0 {
            return Err(libc::EINVAL);
        }
        *self.rx_queue.lock().unwrap() = None;
        Ok(2)
    }
}

impl Device for VdpdkDevice {
    fn declare(&mut self, transport: &mut dyn Transport, dma: Arc<GuardedDmaTable>) -> crate::Result<()> {
        self.dma = Some(dma);

        transport.realize(VDPDK_PCI_IDENTITY, PciBusType::Express)?;

        transport.add_bar(BarRegion {
            index: RegionIndex::Bar0,
            size: REGION_SIZE,
            flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::ALWAYS_TRAP,
            shared_fd: None,
            fd_offset: 0,
            has_callback: true,
        })?;
        transport.add_bar(BarRegion {
            index: RegionIndex::Bar1,
            size: REGION_SIZE,
            flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MEM,
            shared_fd: None,
            fd_offset: 0,
            has_callback: true,
        })?;
        transport.add_bar(BarRegion {
            index: RegionIndex::Bar2,
            size: REGION_SIZE,
            flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MEM,
            shared_fd: None,
            fd_offset: 0,
            has_callback: true,
        })?;

        Ok(())
    }

    fn region_access_bar0(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        if write {
            match offset {
                OFFSET_DEBUG_STRING..=0x3F => self.handle_debug_write(data),
                OFFSET_TX_QUEUE_START => {
                    let idx = u16::from_ne_bytes(data.get(0..2).ok_or(libc::EINVAL)?.try_into().unwrap());
                    self.tx_queue_start(idx)
                }
                OFFSET_TX_QUEUE_STOP => {
                    let idx = u16::from_ne_bytes(data.get(0..2).ok_or(libc::EINVAL)?.try_into().unwrap());
                    self.tx_queue_stop(idx)
                }
                OFFSET_RX_QUEUE_START => {
                    let idx = u16::from_ne_bytes(data.get(0..2).ok_or(libc::EINVAL)?.try_into().unwrap());
                    self.rx_queue_start(idx)
                }
                OFFSET_RX_QUEUE_STOP => {
                    let idx = u16::from_ne_bytes(data.get(0..2).ok_or(libc::EINVAL)?.try_into().unwrap());
                    self.rx_queue_stop(idx)
                }
                _ => Err(libc::EINVAL),
            }
        } else if offset < OFFSET_TX_QUEUE_START {
            let len = data.len().min(BANNER.len().saturating_sub(offset));
            data[..len].copy_from_slice(&BANNER[offset..offset + len]);
            Ok(len)
        } else {
            Err(libc::EINVAL)
        }
    }

    fn region_access_bar1(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        region_access_shared(&mut self.tx_bar, offset, data, write)
    }

    fn region_access_bar2(&mut self, offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
        region_access_shared(&mut self.rx_bar, offset, data, write)
    }

    fn reset(&mut self, reason: ResetReason) -> Result<(), i32> {
        let _ = reason;
        self.tx_poller = None;
        *self.rx_queue.lock().unwrap() = None;
        self.debug_buf.clear();
        Ok(())
    }

    fn rx_callback(&mut self, vm_id: u32) {
        let delivered = rx::rx_callback(vm_id, self.driver.as_ref(), &self.dma(), &self.rx_queue);
        if delivered > 0 {
            if let Some(throttler) = &self.throttler {
                throttler.try_interrupt(self.min_spacing_ns, true);
            }
        }
    }
}

fn region_access_shared(backing: &mut [u8], offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
    let end = offset.checked_add(data.len()).ok_or(libc::EINVAL)?;
    if end > backing.len() {
        return Err(libc::EINVAL);
    }
    if write {
        backing[offset..end].copy_from_slice(data);
    } else {
        data.copy_from_slice(&backing[offset..end]);
    }
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LoopbackDriver;
    use vmux_transport::LoopbackTransport;

    #[test]
    fn declare_adds_three_bars_and_realizes_identity() {
        let mut device = VdpdkDevice::new(0, Arc::new(LoopbackDriver::new()), TxPollerConfig::default());
        let mut transport = LoopbackTransport::new(0x10000).unwrap();
        let dma = GuardedDmaTable::new();
        device.declare(&mut transport, dma).unwrap();
        assert_eq!(transport.declared_bars().len(), 3);
    }

    #[test]
    fn bar0_read_below_control_offsets_returns_banner() {
        let mut device = VdpdkDevice::new(0, Arc::new(LoopbackDriver::new()), TxPollerConfig::default());
        let mut transport = LoopbackTransport::new(0x10000).unwrap();
        let dma = GuardedDmaTable::new();
        device.declare(&mut transport, dma).unwrap();

        let mut buf = vec![0u8; 4];
        let n = device.region_access_bar0(0, &mut buf, false).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, &BANNER[0..4]);
    }

    #[test]
    fn debug_string_write_flushes_on_nul() {
        let mut device = VdpdkDevice::new(0, Arc::new(LoopbackDriver::new()), TxPollerConfig::default());
        let mut transport = LoopbackTransport::new(0x10000).unwrap();
        let dma = GuardedDmaTable::new();
        device.declare(&mut transport, dma).unwrap();

        let mut msg = b"hi\0".to_vec();
        device.region_access_bar0(0, &mut msg, true).unwrap();
        assert!(device.debug_buf.is_empty());
    }

    #[test]
    fn tx_queue_start_rejects_nonzero_queue_index() {
        let mut device = VdpdkDevice::new(0, Arc::new(LoopbackDriver::new()), TxPollerConfig::default());
        let mut transport = LoopbackTransport::new(0x10000).unwrap();
        let dma = GuardedDmaTable::new();
        device.declare(&mut transport, dma).unwrap();

        let mut idx = 1u16.to_ne_bytes();
        let err = device.region_access_bar0(OFFSET_TX_QUEUE_START, &mut idx, true).unwrap_err();
        assert_eq!(err, libc::EINVAL);
    }

    #[test]
    fn rx_queue_start_then_stop_clears_published_queue() {
        let mut device = VdpdkDevice::new(0, Arc::new(LoopbackDriver::new()), TxPollerConfig::default());
        let mut transport = LoopbackTransport::new(0x10000).unwrap();
        let dma = GuardedDmaTable::new();
        device.declare(&mut transport, dma).unwrap();

        device.rx_bar[0..8].copy_from_slice(&0x1_0000u64.to_ne_bytes());
        device.rx_bar[8..10].copy_from_slice(&0x3Fu16.to_ne_bytes());

        let mut idx = 0u16.to_ne_bytes();
        device.region_access_bar0(OFFSET_RX_QUEUE_START, &mut idx, true).unwrap();
        assert!(device.rx_queue.lock().unwrap().is_some());

        device.region_access_bar0(OFFSET_RX_QUEUE_STOP, &mut idx, true).unwrap();
        assert!(device.rx_queue.lock().unwrap().is_none());
    }
}
