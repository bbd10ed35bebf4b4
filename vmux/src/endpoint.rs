//! `VfuEndpoint`: the per-VM server that owns the guest
//! transport and the concrete device it dispatches into. Grounded in the
//! `DeviceContext`/`Device` pairing used by the underlying vfio-user bindings,
//! with the ownership direction flipped (endpoint owns device, not device
//! owns endpoint) so that one dispatch call can borrow the transport and
//! the device as two disjoint fields of the same struct instead of
//! reaching for a raw-pointer `ctx()`/`ctx_mut()` trick, which
//! has no safe equivalent once the device is a `dyn` trait object rather
//! than a C `void*` (see DESIGN.md, "VfuEndpoint/Device ownership").

use std::sync::{Arc, Mutex};

use vmux_transport::{
    AttachOutcome, BarRegion, DispatchOutcome, IrqTrigger, PciBusType, PciIdentity, Prot,
    RegionIndex, ResetReason, Transport, TransportCallbacks,
};

use crate::device::Device;
use crate::dma::GuardedDmaTable;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Fresh,
    Initialized,
    Connected,
    Running,
    Closed,
}

pub struct VfuEndpoint {
    transport: Box<dyn Transport>,
    device: Arc<Mutex<Box<dyn Device>>>,
    dma: Arc<GuardedDmaTable>,
    state: EndpointState,
}

/// Bridges `TransportCallbacks` to the `Device` trait's per-region
/// methods. Borrows `device` and `dma` as two fields disjoint from
/// `transport`, which is what makes `VfuEndpoint::dispatch_one` possible
/// without the device ever needing a handle back to the endpoint.
struct DeviceCallbacks<'a> {
    device: &'a mut dyn Device,
    dma: &'a Arc<GuardedDmaTable>,
}

impl TransportCallbacks for DeviceCallbacks<'_> {
    fn region_access(
        &mut self,
        region: RegionIndex,
        offset: usize,
        data: &mut [u8],
        write: bool,
    ) -> Result<usize, i32> {
        match region {
            RegionIndex::Bar0 => self.device.region_access_bar0(offset, data, write),
            RegionIndex::Bar1 => self.device.region_access_bar1(offset, data, write),
            RegionIndex::Bar2 => self.device.region_access_bar2(offset, data, write),
            RegionIndex::Bar3 => self.device.region_access_bar3(offset, data, write),
            RegionIndex::Bar4 => self.device.region_access_bar4(offset, data, write),
            RegionIndex::Bar5 => self.device.region_access_bar5(offset, data, write),
            RegionIndex::Rom => self.device.region_access_rom(offset, data, write),
            RegionIndex::Config => self.device.region_access_config(offset, data, write),
            RegionIndex::Vga => self.device.region_access_vga(offset, data, write),
            RegionIndex::Migration => self.device.region_access_migration(offset, data, write),
        }
    }

    fn dma_register(&mut self, iova: u64, len: usize, local_ptr: *mut u8, prot: Prot) {
        if let Err(err) = self.dma.write().insert(iova, len, local_ptr, prot) {
            tracing::warn!(target: "vmux::endpoint", iova, len, %err, "guest dma registration rejected");
            return;
        }
        self.device.dma_range_added(iova, len, local_ptr, prot);
    }

    fn dma_unregister(&mut self, iova: u64) {
        // Ask any reader mid-burst to drop its read guard before we take
        // the exclusive lock.
        self.dma.request_yield();
        if let Err(err) = self.dma.write().remove(iova) {
            tracing::warn!(target: "vmux::endpoint", iova, %err, "guest dma unregistration of unknown range");
        }
        self.device.dma_range_removed(iova);
        self.dma.clear_yield();
    }

    fn reset(&mut self, reason: ResetReason) -> Result<(), i32> {
        self.device.reset(reason)
    }
}

impl VfuEndpoint {
    pub fn new(transport: Box<dyn Transport>, device: Box<dyn Device>) -> Self {
        VfuEndpoint {
            transport,
            device: Arc::new(Mutex::new(device)),
            dma: GuardedDmaTable::new(),
            state: EndpointState::Fresh,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn dma(&self) -> &Arc<GuardedDmaTable> {
        &self.dma
    }

    pub fn irq_trigger(&self) -> Arc<dyn IrqTrigger> {
        self.transport.irq_trigger()
    }

    /// A cloneable handle to the owned device, shared with
    /// [`crate::rxthread::RxThread`] so its busy-poll loop can call
    /// `rx_callback` concurrently with this endpoint's own dispatch loop.
    /// The RX callback runs on a dedicated thread, grounded in the
    /// original's `shared_ptr<VmuxDevice>` shared between `Runner` and
    /// `RxThread`.
    pub fn device_handle(&self) -> Arc<Mutex<Box<dyn Device>>> {
        Arc::clone(&self.device)
    }

    /// Declares identity and lets the device add its BARs/capabilities/
    /// IRQs on the transport before the first `attach`.
    pub fn realize(&mut self, identity: PciIdentity, bus: PciBusType) -> crate::Result<()> {
        self.transport.realize(identity, bus)?;
        self.device
            .lock()
            .unwrap()
            .declare(self.transport.as_mut(), Arc::clone(&self.dma))?;
        self.state = EndpointState::Initialized;
        Ok(())
    }

    pub fn add_bar(&mut self, region: BarRegion) -> crate::Result<()> {
        Ok(self.transport.add_bar(region)?)
    }

    pub fn add_capability(&mut self, blob: Vec<u8>) -> crate::Result<()> {
        Ok(self.transport.add_capability(blob)?)
    }

    pub fn attach(&mut self) -> crate::Result<AttachOutcome> {
        let outcome = self.transport.attach()?;
        if outcome == AttachOutcome::Connected {
            self.state = EndpointState::Connected;
        }
        Ok(outcome)
    }

    /// Processes one pending guest request, dispatching into the owned
    /// device. Advances `state` to `Running` on the first processed
    /// request, a marker layered on top of the base
    /// `Fresh -> Initialized -> Connected` progression for "has
    /// dispatched at least once". A guest disconnect observed mid-dispatch
    /// reverts `state` to `Initialized`; a later `attach()` cycles it back
    /// to `Connected` once a new guest attaches on the same socket.
    pub fn dispatch_one(&mut self) -> crate::Result<DispatchOutcome> {
        let VfuEndpoint {
            transport,
            device,
            dma,
            state,
        } = self;
        let mut device_guard = device.lock().unwrap();
        let mut callbacks = DeviceCallbacks {
            device: device_guard.as_mut(),
            dma,
        };
        let result = transport.dispatch_one(&mut callbacks);
        drop(device_guard);

        match result {
            Ok(outcome) => {
                if outcome == DispatchOutcome::Processed && *state == EndpointState::Connected {
                    *state = EndpointState::Running;
                }
                Ok(outcome)
            }
            Err(err @ vmux_transport::TransportError::NotConnected)
                if matches!(state, EndpointState::Connected | EndpointState::Running) =>
            {
                *state = EndpointState::Initialized;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn poll_fd(&self) -> std::os::fd::RawFd {
        self.transport.poll_fd()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn close(&mut self) {
        self.state = EndpointState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmux_transport::loopback::LoopbackTransport;
    use vmux_transport::{PciBusType, RegionFlags};

    struct EchoDevice;
    impl Device for EchoDevice {
        fn declare(&mut self, transport: &mut dyn Transport, _dma: Arc<GuardedDmaTable>) -> crate::Result<()> {
            transport.add_bar(BarRegion {
                index: RegionIndex::Bar0,
                size: 0x1000,
                flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MEM,
                shared_fd: None,
                fd_offset: 0,
                has_callback: true,
            })?;
            Ok(())
        }

        fn region_access_bar0(&mut self, _offset: usize, data: &mut [u8], write: bool) -> Result<usize, i32> {
            if write {
                Ok(data.len())
            } else {
                data.fill(0x42);
                Ok(data.len())
            }
        }
    }

    fn identity() -> PciIdentity {
        PciIdentity {
            vendor_id: 0x1af4,
            device_id: 0x1000,
            subsystem_vendor_id: 0x1af4,
            subsystem_id: 0x1,
            class_base: 0x02,
            class_subclass: 0x00,
            class_prog_if: 0x00,
            revision_id: 0x1,
        }
    }

    #[test]
    fn realize_then_attach_then_dispatch_reads_back_bar0() {
        let transport = Box::new(LoopbackTransport::new(4096).unwrap());
        let mut endpoint = VfuEndpoint::new(transport, Box::new(EchoDevice));
        endpoint.realize(identity(), PciBusType::Express).unwrap();
        assert_eq!(endpoint.state(), EndpointState::Initialized);

        assert_eq!(endpoint.attach().unwrap(), AttachOutcome::WouldBlock);
    }

    /// A `Transport` double whose `connected` flag is shared with the
    /// test, so test code can flip it after the transport has been
    /// moved into a `VfuEndpoint`, simulating a guest disconnect/reconnect
    /// without an internal queue to drive.
    struct FlakyTransport {
        connected: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Transport for FlakyTransport {
        fn realize(&mut self, _identity: PciIdentity, _bus_type: PciBusType) -> vmux_transport::Result<()> {
            Ok(())
        }
        fn add_bar(&mut self, _region: BarRegion) -> vmux_transport::Result<()> {
            Ok(())
        }
        fn add_capability(&mut self, _blob: Vec<u8>) -> vmux_transport::Result<()> {
            Ok(())
        }
        fn add_irqs(&mut self, _kind: vmux_transport::IrqKind, _count: u32) -> vmux_transport::Result<()> {
            Ok(())
        }
        fn attach(&mut self) -> vmux_transport::Result<AttachOutcome> {
            if self.connected.load(std::sync::atomic::Ordering::Acquire) {
                Ok(AttachOutcome::Connected)
            } else {
                Ok(AttachOutcome::WouldBlock)
            }
        }
        fn dispatch_one(&mut self, _callbacks: &mut dyn TransportCallbacks) -> vmux_transport::Result<DispatchOutcome> {
            if !self.connected.load(std::sync::atomic::Ordering::Acquire) {
                return Err(vmux_transport::TransportError::NotConnected);
            }
            Ok(DispatchOutcome::Processed)
        }
        fn poll_fd(&self) -> std::os::fd::RawFd {
            -1
        }
        fn trigger_irq(&self, _vector: u32) -> vmux_transport::Result<()> {
            Ok(())
        }
        fn irq_trigger(&self) -> Arc<dyn IrqTrigger> {
            struct NullIrq;
            impl IrqTrigger for NullIrq {
                fn trigger_irq(&self, _vector: u32) -> vmux_transport::Result<()> {
                    Ok(())
                }
            }
            Arc::new(NullIrq)
        }
        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::Acquire)
        }
    }

    #[test]
    fn disconnect_reverts_to_initialized_and_reattach_cycles_to_connected() {
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let transport: Box<dyn Transport> = Box::new(FlakyTransport {
            connected: Arc::clone(&connected),
        });
        let mut endpoint = VfuEndpoint::new(transport, Box::new(EchoDevice));
        endpoint.realize(identity(), PciBusType::Express).unwrap();
        assert_eq!(endpoint.attach().unwrap(), AttachOutcome::Connected);
        assert_eq!(endpoint.state(), EndpointState::Connected);

        assert_eq!(endpoint.dispatch_one().unwrap(), DispatchOutcome::Processed);
        assert_eq!(endpoint.state(), EndpointState::Running);

        connected.store(false, std::sync::atomic::Ordering::Release);
        assert!(endpoint.dispatch_one().is_err());
        assert_eq!(endpoint.state(), EndpointState::Initialized);

        connected.store(true, std::sync::atomic::Ordering::Release);
        assert_eq!(endpoint.attach().unwrap(), AttachOutcome::Connected);
        assert_eq!(endpoint.state(), EndpointState::Connected);
    }
}
