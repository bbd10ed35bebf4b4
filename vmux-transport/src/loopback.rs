//! An in-process double for [`crate::Transport`]: simulates a single guest
//! driving the endpoint, without a real vfio-user socket. Used by `vmux`'s
//! integration tests (DMA mapping, vDPDK TX/RX, throttlers, capability
//! aggregation); the real wire protocol is out of scope for this crate.
//!
//! Test code drives the simulated guest with [`LoopbackTransport::queue`]
//! and reads back device state through the normal [`crate::Transport`]
//! methods; [`crate::Transport::dispatch_one`] drains one queued action per
//! call, exactly as a real transport would drain one wire message.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};
use crate::primitives::{EventFd, MemFd};
use crate::transport::{AttachOutcome, DispatchOutcome, IrqTrigger, Transport, TransportCallbacks};
use crate::types::{BarRegion, IrqKind, PciBusType, PciIdentity, Prot, RegionIndex, ResetReason};

/// The cloneable trigger handle `LoopbackTransport::irq_trigger` hands out.
struct LoopbackIrqTrigger {
    triggered: Arc<Mutex<Vec<u32>>>,
}

impl IrqTrigger for LoopbackIrqTrigger {
    fn trigger_irq(&self, vector: u32) -> Result<()> {
        self.triggered.lock().unwrap().push(vector);
        Ok(())
    }
}

/// One simulated guest-initiated event, queued by test code and drained by
/// `dispatch_one`.
pub enum GuestAction {
    RegionAccess {
        region: RegionIndex,
        offset: usize,
        len: usize,
        write_data: Option<Vec<u8>>,
    },
    /// Registers `len` bytes of the transport's simulated guest memory,
    /// starting at `guest_mem_offset`, as DMA-mappable under `iova`.
    DmaMap {
        iova: u64,
        guest_mem_offset: usize,
        len: usize,
        prot: Prot,
    },
    DmaUnmap {
        iova: u64,
    },
    Reset(ResetReason),
}

struct DmaEntry {
    guest_mem_offset: usize,
    len: usize,
}

pub struct LoopbackTransport {
    identity: Option<PciIdentity>,
    bus_type: Option<PciBusType>,
    bars: HashMap<RegionIndex, BarRegion>,
    capabilities: Vec<Vec<u8>>,
    irqs: HashMap<IrqKind, u32>,
    connected: bool,
    queue: VecDeque<GuestAction>,
    notify: EventFd,
    /// Simulated guest physical memory. DMA ranges registered via
    /// [`GuestAction::DmaMap`] alias into this buffer, so device code that
    /// writes through a resolved DMA pointer is observable by test code
    /// reading `guest_mem()` back.
    guest_mem: MemFd,
    dma_ranges: HashMap<u64, DmaEntry>,
    triggered_irqs: Arc<Mutex<Vec<u32>>>,
    last_region_access_result: Mutex<Option<Vec<u8>>>,
}

impl LoopbackTransport {
    pub fn new(guest_mem_size: usize) -> Result<Self> {
        Ok(LoopbackTransport {
            identity: None,
            bus_type: None,
            bars: HashMap::new(),
            capabilities: Vec::new(),
            irqs: HashMap::new(),
            connected: false,
            queue: VecDeque::new(),
            notify: EventFd::new()?,
            guest_mem: MemFd::new("vmux-loopback-guest", guest_mem_size)?,
            dma_ranges: HashMap::new(),
            triggered_irqs: Arc::new(Mutex::new(Vec::new())),
            last_region_access_result: Mutex::new(None),
        })
    }

    /// Marks the simulated guest as attached; `attach()` will return
    /// `Connected` on its next call.
    pub fn connect(&mut self) {
        self.connected = true;
        self.notify.signal();
    }

    /// Simulates the guest going away: any in-flight `dispatch_one` call
    /// starts returning `NotConnected`, mirroring a closed vfio-user
    /// socket. A later `connect()` call simulates a fresh guest attaching
    /// on the same socket path.
    pub fn disconnect(&mut self) {
        self.connected = false;
        self.queue.clear();
        self.notify.signal();
    }

    /// Queues one simulated guest event and wakes `poll_fd`.
    pub fn queue(&mut self, action: GuestAction) {
        self.queue.push_back(action);
        self.notify.signal();
    }

    pub fn guest_mem(&self) -> &[u8] {
        self.guest_mem.as_slice()
    }

    pub fn guest_mem_mut(&mut self) -> &mut [u8] {
        self.guest_mem.as_mut_slice()
    }

    /// The data most recently returned by a `RegionAccess` read, for test
    /// assertions.
    pub fn last_read(&self) -> Option<Vec<u8>> {
        self.last_region_access_result.lock().unwrap().clone()
    }

    /// MSI-X (or other) vectors triggered so far, in order.
    pub fn triggered_irqs(&self) -> Vec<u32> {
        self.triggered_irqs.lock().unwrap().clone()
    }

    pub fn declared_bars(&self) -> &HashMap<RegionIndex, BarRegion> {
        &self.bars
    }

    pub fn declared_capabilities(&self) -> &[Vec<u8>] {
        &self.capabilities
    }
}

impl Transport for LoopbackTransport {
    fn realize(&mut self, identity: PciIdentity, bus_type: PciBusType) -> Result<()> {
        self.identity = Some(identity);
        self.bus_type = Some(bus_type);
        Ok(())
    }

    fn add_bar(&mut self, region: BarRegion) -> Result<()> {
        self.bars.insert(region.index, region);
        Ok(())
    }

    fn add_capability(&mut self, blob: Vec<u8>) -> Result<()> {
        self.capabilities.push(blob);
        Ok(())
    }

    fn add_irqs(&mut self, kind: IrqKind, count: u32) -> Result<()> {
        *self.irqs.entry(kind).or_insert(0) += count;
        Ok(())
    }

    fn attach(&mut self) -> Result<AttachOutcome> {
        if self.connected {
            Ok(AttachOutcome::Connected)
        } else {
            Ok(AttachOutcome::WouldBlock)
        }
    }

    fn dispatch_one(&mut self, callbacks: &mut dyn TransportCallbacks) -> Result<DispatchOutcome> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let Some(action) = self.queue.pop_front() else {
            self.notify.reset();
            return Ok(DispatchOutcome::WouldBlock);
        };

        match action {
            GuestAction::RegionAccess {
                region,
                offset,
                len,
                write_data,
            } => match write_data {
                Some(mut data) => {
                    data.resize(len, 0);
                    callbacks
                        .region_access(region, offset, &mut data, true)
                        .map_err(|errno| {
                            TransportError::BadRequest(format!("region write errno {errno}"))
                        })?;
                }
                None => {
                    let mut buf = vec![0u8; len];
                    callbacks
                        .region_access(region, offset, &mut buf, false)
                        .map_err(|errno| {
                            TransportError::BadRequest(format!("region read errno {errno}"))
                        })?;
                    *self.last_region_access_result.lock().unwrap() = Some(buf);
                }
            },
            GuestAction::DmaMap {
                iova,
                guest_mem_offset,
                len,
                prot,
            } => {
                if guest_mem_offset + len > self.guest_mem.size() {
                    return Err(TransportError::BadRequest(
                        "dma map out of guest memory bounds".into(),
                    ));
                }
                let local_ptr = unsafe { self.guest_mem.as_ptr().add(guest_mem_offset) };
                self.dma_ranges.insert(
                    iova,
                    DmaEntry {
                        guest_mem_offset,
                        len,
                    },
                );
                callbacks.dma_register(iova, len, local_ptr, prot);
            }
            GuestAction::DmaUnmap { iova } => {
                callbacks.dma_unregister(iova);
                self.dma_ranges.remove(&iova);
            }
            GuestAction::Reset(reason) => {
                callbacks.reset(reason).map_err(|errno| {
                    TransportError::BadRequest(format!("reset refused, errno {errno}"))
                })?;
            }
        }

        if self.queue.is_empty() {
            self.notify.reset();
        }
        Ok(DispatchOutcome::Processed)
    }

    fn poll_fd(&self) -> RawFd {
        self.notify.as_raw_fd()
    }

    fn trigger_irq(&self, vector: u32) -> Result<()> {
        self.triggered_irqs.lock().unwrap().push(vector);
        Ok(())
    }

    fn irq_trigger(&self) -> Arc<dyn IrqTrigger> {
        Arc::new(LoopbackIrqTrigger {
            triggered: Arc::clone(&self.triggered_irqs),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingCallbacks {
        resets: u32,
        dma_registered: Vec<(u64, usize)>,
    }

    impl TransportCallbacks for RecordingCallbacks {
        fn region_access(
            &mut self,
            _region: RegionIndex,
            _offset: usize,
            data: &mut [u8],
            write: bool,
        ) -> std::result::Result<usize, i32> {
            if !write {
                data.fill(0x42);
            }
            Ok(data.len())
        }

        fn dma_register(&mut self, iova: u64, len: usize, _local_ptr: *mut u8, _prot: Prot) {
            self.dma_registered.push((iova, len));
        }

        fn dma_unregister(&mut self, iova: u64) {
            self.dma_registered.retain(|(i, _)| *i != iova);
        }

        fn reset(&mut self, _reason: ResetReason) -> std::result::Result<(), i32> {
            self.resets += 1;
            Ok(())
        }
    }

    #[test]
    fn dispatch_one_drains_queue_in_order() {
        let mut transport = LoopbackTransport::new(1 << 16).unwrap();
        transport.connect();
        transport.queue(GuestAction::DmaMap {
            iova: 0x1000,
            guest_mem_offset: 0,
            len: 4096,
            prot: Prot::READ | Prot::WRITE,
        });
        transport.queue(GuestAction::RegionAccess {
            region: RegionIndex::Bar0,
            offset: 0,
            len: 4,
            write_data: None,
        });
        transport.queue(GuestAction::DmaUnmap { iova: 0x1000 });

        let mut cb = RecordingCallbacks {
            resets: 0,
            dma_registered: Vec::new(),
        };

        assert_eq!(
            transport.dispatch_one(&mut cb).unwrap(),
            DispatchOutcome::Processed
        );
        assert_eq!(cb.dma_registered, vec![(0x1000, 4096)]);

        assert_eq!(
            transport.dispatch_one(&mut cb).unwrap(),
            DispatchOutcome::Processed
        );
        assert_eq!(transport.last_read(), Some(vec![0x42; 4]));

        assert_eq!(
            transport.dispatch_one(&mut cb).unwrap(),
            DispatchOutcome::Processed
        );
        assert!(cb.dma_registered.is_empty());

        assert_eq!(
            transport.dispatch_one(&mut cb).unwrap(),
            DispatchOutcome::WouldBlock
        );
    }

    #[test]
    fn attach_is_would_block_until_connected() {
        let mut transport = LoopbackTransport::new(4096).unwrap();
        assert_eq!(transport.attach().unwrap(), AttachOutcome::WouldBlock);
        transport.connect();
        assert_eq!(transport.attach().unwrap(), AttachOutcome::Connected);
    }

    #[test]
    fn disconnect_then_reconnect_cycles_attach_outcome() {
        let mut transport = LoopbackTransport::new(4096).unwrap();
        transport.connect();
        assert_eq!(transport.attach().unwrap(), AttachOutcome::Connected);

        transport.disconnect();
        assert_eq!(transport.attach().unwrap(), AttachOutcome::WouldBlock);
        let mut cb = RecordingCallbacks {
            resets: 0,
            dma_registered: Vec::new(),
        };
        assert!(matches!(
            transport.dispatch_one(&mut cb),
            Err(TransportError::NotConnected)
        ));

        transport.connect();
        assert_eq!(transport.attach().unwrap(), AttachOutcome::Connected);
    }

    #[test]
    fn trigger_irq_is_recorded() {
        let transport = LoopbackTransport::new(4096).unwrap();
        transport.trigger_irq(3).unwrap();
        transport.trigger_irq(7).unwrap();
        assert_eq!(transport.triggered_irqs(), vec![3, 7]);
    }
}
