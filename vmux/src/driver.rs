//! The `Driver` trait, grounded in `original_source/src/drivers/driver.hpp`:
//! the backend a device's RX callback drains and its TX path submits to.
//! Concrete kernel-bypass backends (DPDK, TAP, passthrough) are out of
//! scope; `vmux` ships the trait and a `LoopbackDriver` test double.

use crossbeam_channel::Sender;

/// One received packet, handed from [`Driver::recv`] to a device's RX
/// callback.
pub struct RxPacket {
    pub data: Vec<u8>,
}

/// Notice that a zero-copy TX buffer has been fully transmitted and its
/// descriptor slot may be handed back to the guest. A free callback that
/// mutates guest state runs on the driver's own thread, so this is
/// modeled as a single-producer MPSC channel from whatever thread the
/// backend frees the buffer on, back to the TX poller that owns the
/// descriptor (the poller alone clears `TX_FLAG_AVAIL`).
#[derive(Clone, Copy, Debug)]
pub struct TxCompletion {
    pub desc_idx: u16,
}

/// A zero-copy TX buffer: a borrow of guest memory the backend transmits
/// without copying. `ptr`/`len` point into DMA-mapped guest memory for as
/// long as the TX poller's dma read guard is held; the backend must not
/// retain them past sending `completion`.
#[derive(Clone, Copy)]
pub struct ZeroCopyPacket {
    pub ptr: *const u8,
    pub len: u16,
    pub desc_idx: u16,
}

// SAFETY: the pointer is only valid for the duration the TX poller holds
// its DMA read guard; the backend is trusted to read it synchronously or
// hold the guard's implied lifetime itself (see tx.rs).
unsafe impl Send for ZeroCopyPacket {}

pub enum TxPacket {
    Copied(Box<[u8]>),
    ZeroCopy(ZeroCopyPacket),
}

/// Backend packet I/O: one or more backends (raw kernel-bypass NIC
/// queues, a host TAP interface, direct hardware passthrough) implement
/// this trait. `vm_id` lets one driver instance serve multiple VMs (the
/// original's "vm_id can be used to serve multiple VMs with one single
/// driver").
pub trait Driver: Send + Sync {
    /// Submits a burst of TX packets for `vm_id`. Returns the number
    /// actually accepted; the caller frees/drops the unsent tail.
    /// `completions` is where the backend (or whatever thread frees a
    /// zero-copy buffer) sends a [`TxCompletion`] once that buffer is
    /// safe to return to the guest.
    fn send_burst(&self, vm_id: u32, packets: Vec<TxPacket>, completions: Sender<TxCompletion>) -> usize;

    /// Fills in whatever received packets are ready for `vm_id`.
    fn recv(&self, vm_id: u32) -> Vec<RxPacket>;

    /// Releases backend-side buffers for packets `recv` already returned.
    fn recv_consumed(&self, vm_id: u32);

    fn add_switch_rule(&self, vm_id: u32, mac_addr: [u8; 6], dst_queue: u16) -> bool {
        let _ = (vm_id, mac_addr, dst_queue);
        false
    }

    fn mediation_enable(&self, vm_id: u32) -> bool {
        let _ = vm_id;
        false
    }

    fn mediation_disable(&self, vm_id: u32) -> bool {
        let _ = vm_id;
        false
    }
}

/// An in-process `Driver` used by tests: `send_burst` records copied
/// packets and immediately completes zero-copy ones (there is no real
/// backend thread to defer completion to); `recv` replays a queued
/// inbound batch.
pub struct LoopbackDriver {
    sent: std::sync::Mutex<Vec<Vec<u8>>>,
    inbound: std::sync::Mutex<std::collections::VecDeque<Vec<u8>>>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        LoopbackDriver {
            sent: std::sync::Mutex::new(Vec::new()),
            inbound: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn queue_inbound(&self, packet: Vec<u8>) {
        self.inbound.lock().unwrap().push_back(packet);
    }

    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        LoopbackDriver::new()
    }
}

impl Driver for LoopbackDriver {
    fn send_burst(&self, _vm_id: u32, packets: Vec<TxPacket>, completions: Sender<TxCompletion>) -> usize {
        let mut sent = self.sent.lock().unwrap();
        let count = packets.len();
        for packet in packets {
            match packet {
                TxPacket::Copied(data) => sent.push(data.into_vec()),
                TxPacket::ZeroCopy(zc) => {
                    // SAFETY: caller guarantees the pointer is valid for
                    // the duration of this synchronous call.
                    let data = unsafe { std::slice::from_raw_parts(zc.ptr, zc.len as usize) }.to_vec();
                    sent.push(data);
                    let _ = completions.send(TxCompletion { desc_idx: zc.desc_idx });
                }
            }
        }
        count
    }

    fn recv(&self, _vm_id: u32) -> Vec<RxPacket> {
        self.inbound
            .lock()
            .unwrap()
            .drain(..)
            .map(|data| RxPacket { data })
            .collect()
    }

    fn recv_consumed(&self, _vm_id: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_driver_records_sent_copied_packets() {
        let driver = LoopbackDriver::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let sent = driver.send_burst(0, vec![TxPacket::Copied(Box::from(&b"hi"[..]))], tx);
        assert_eq!(sent, 1);
        assert_eq!(driver.sent_packets(), vec![b"hi".to_vec()]);
    }

    #[test]
    fn loopback_driver_replays_queued_inbound() {
        let driver = LoopbackDriver::new();
        driver.queue_inbound(b"packet".to_vec());
        let received = driver.recv(0);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data, b"packet");
    }
}
