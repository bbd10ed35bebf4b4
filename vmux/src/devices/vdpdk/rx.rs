//! The RX callback, draining backend packets into the guest's RX ring.
//! Grounded in
//! `original_source/src/devices/vdpdk.cpp`'s `rx_callback_fn`; driven by
//! [`crate::rxthread::RxThread`] once per scheduling quantum.

use std::sync::Mutex;

use crate::dma::GuardedDmaTable;
use crate::driver::Driver;

use super::ring::{desc_offset, read_flags, read_iova, read_len, write_flags, write_len, RX_DESC_SIZE, RX_FLAG_AVAIL};

/// Published by `RX_QUEUE_START`, cleared by `RX_QUEUE_STOP`: an
/// `{ring_iova, idx_mask, idx=0}` value held behind a lock so the RX
/// thread and the dispatch thread agree on where the ring lives.
#[derive(Clone, Copy, Debug)]
pub struct RxQueue {
    pub ring_iova: u64,
    pub idx_mask: u16,
    pub idx: u16,
}

/// Drains whatever the driver has received for `vm_id` into the
/// published RX ring. A no-op if no queue is published or nothing was
/// received (the original only takes the DMA lock once it knows there is
/// something to write, to avoid contending with the TX poller on an idle
/// queue).
/// Returns the number of packets actually written into the guest's ring,
/// so the caller can decide whether to poke the interrupt throttler.
pub fn rx_callback(vm_id: u32, driver: &dyn Driver, dma: &GuardedDmaTable, rx_queue: &Mutex<Option<RxQueue>>) -> usize {
    let packets = driver.recv(vm_id);
    if packets.is_empty() {
        return 0;
    }

    let mut rxq_guard = rx_queue.lock().unwrap();
    let Some(rxq) = rxq_guard.as_mut() else {
        driver.recv_consumed(vm_id);
        return 0;
    };

    let ring_size = (rxq.idx_mask as usize + 1) * RX_DESC_SIZE;
    let guard = dma.read();
    let ring = match guard.translate(rxq.ring_iova, ring_size) {
        Some(ptr) => ptr,
        None => {
            tracing::warn!(target: "vmux::vdpdk", ring_iova = rxq.ring_iova, "rx ring iova unmapped");
            driver.recv_consumed(vm_id);
            return 0;
        }
    };

    let mut delivered = 0usize;
    for packet in packets {
        let desc = unsafe { ring.add(desc_offset(rxq.idx, rxq.idx_mask, RX_DESC_SIZE)) };
        let flags = unsafe { read_flags(desc) };
        if flags & RX_FLAG_AVAIL == 0 {
            // Ring full: leave the remaining packets in the driver's
            // buffers for the next invocation.
            break;
        }

        let buf_iova = unsafe { read_iova(desc) };
        let buf_len = unsafe { read_len(desc) };
        let buf_ptr = match guard.translate(buf_iova, buf_len as usize) {
            Some(ptr) => ptr,
            None => {
                tracing::warn!(target: "vmux::vdpdk", buf_iova, "rx buffer iova unmapped, stopping batch");
                break;
            }
        };

        let pkt_len = packet.data.len();
        if pkt_len > buf_len as usize || pkt_len > u16::MAX as usize {
            tracing::warn!(target: "vmux::vdpdk", pkt_len, buf_len, "rx packet too large for posted buffer");
            break;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(packet.data.as_ptr(), buf_ptr, pkt_len);
            write_len(desc, pkt_len as u16);
            write_flags(desc, flags & !RX_FLAG_AVAIL);
        }
        rxq.idx = rxq.idx.wrapping_add(1);
        delivered += 1;
    }

    drop(guard);
    driver.recv_consumed(vm_id);
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, LoopbackDriver};
    use vmux_transport::Prot;

    #[test]
    fn drains_one_packet_into_posted_buffer() {
        let dma = GuardedDmaTable::new();
        let mut ring_mem = vec![0u8; RX_DESC_SIZE];
        let mut pkt_mem = vec![0u8; 64];

        unsafe {
            write_flags(ring_mem.as_mut_ptr(), RX_FLAG_AVAIL);
            (ring_mem.as_mut_ptr() as *mut u64).write_unaligned(0x2000);
            write_len(ring_mem.as_mut_ptr(), 64);
        }

        dma.write().insert(0x1000, ring_mem.len(), ring_mem.as_mut_ptr(), Prot::READ | Prot::WRITE).unwrap();
        dma.write().insert(0x2000, pkt_mem.len(), pkt_mem.as_mut_ptr(), Prot::READ | Prot::WRITE).unwrap();

        let driver = LoopbackDriver::new();
        driver.queue_inbound(b"hello".to_vec());

        let rx_queue = Mutex::new(Some(RxQueue {
            ring_iova: 0x1000,
            idx_mask: 0,
            idx: 0,
        }));

        let delivered = rx_callback(0, &driver, &dma, &rx_queue);

        assert_eq!(delivered, 1);
        assert_eq!(&pkt_mem[..5], b"hello");
        unsafe {
            assert_eq!(read_flags(ring_mem.as_mut_ptr()) & RX_FLAG_AVAIL, 0);
            assert_eq!(read_len(ring_mem.as_ptr()), 5);
        }
        assert_eq!(rx_queue.lock().unwrap().unwrap().idx, 1);
    }
}
