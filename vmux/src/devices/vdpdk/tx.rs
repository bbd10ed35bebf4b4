//! The TX polling thread: a dedicated thread drains the guest's TX ring,
//! batches packets, and submits them to the backend. Grounded in
//! `original_source/src/devices/vdpdk.cpp`'s `tx_poll`, with DPDK's
//! `rte_mbuf`/mempool machinery replaced by the `Driver` trait's
//! `send_burst` (concrete backends are out of scope here).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::dma::GuardedDmaTable;
use crate::driver::{Driver, TxPacket, ZeroCopyPacket};

use super::ring::{desc_offset, read_flags, read_iova, read_len, write_flags, TX_DESC_SIZE, TX_FLAG_ATTACHED, TX_FLAG_AVAIL};

#[derive(Clone, Copy, Debug)]
pub struct TxPollerConfig {
    pub burst_size: usize,
    pub zero_copy: bool,
}

impl Default for TxPollerConfig {
    fn default() -> Self {
        TxPollerConfig {
            burst_size: 128,
            zero_copy: false,
        }
    }
}

/// Owns the TX polling thread for one queue. Dropping (or calling
/// `stop`) requests the thread exit and joins it, mirroring the
/// original's `std::jthread` RAII ownership (`tx_poll_thread = {}` stops
/// and joins the previous thread before a new `TX_QUEUE_START`).
pub struct TxPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TxPoller {
    pub fn spawn(
        device_id: u32,
        vm_id: u32,
        dma: Arc<GuardedDmaTable>,
        driver: Arc<dyn Driver>,
        ring_iova: u64,
        idx_mask: u16,
        config: TxPollerConfig,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("vmuxTx{device_id}"))
            .spawn(move || tx_poll_loop(vm_id, dma, driver, ring_iova, idx_mask, config, stop_thread))
            .expect("failed to spawn vdpdk tx poller thread");
        TxPoller {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.request_stop_and_join();
    }

    fn request_stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TxPoller {
    fn drop(&mut self) {
        self.request_stop_and_join();
    }
}

fn tx_poll_loop(
    vm_id: u32,
    dma: Arc<GuardedDmaTable>,
    driver: Arc<dyn Driver>,
    ring_iova: u64,
    idx_mask: u16,
    config: TxPollerConfig,
    stop: Arc<AtomicBool>,
) {
    let ring_size = (idx_mask as usize + 1) * TX_DESC_SIZE;
    tracing::info!(target: "vmux::vdpdk", ring_iova, idx_mask, ring_size, "starting tx poll");

    let mut guard = dma.read();
    let mut ring = match guard.translate(ring_iova, ring_size) {
        Some(ptr) => ptr,
        None => {
            tracing::warn!(target: "vmux::vdpdk", ring_iova, "invalid tx ring iova, exiting poller");
            return;
        }
    };

    let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
    let mut idx: u16 = 0;
    let mut burst: Vec<TxPacket> = Vec::with_capacity(config.burst_size);

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        // Apply zero-copy completions from a previous burst before
        // touching any more descriptors.
        while let Ok(completion) = completions_rx.try_recv() {
            unsafe {
                let desc = ring.add(desc_offset(completion.desc_idx, idx_mask, TX_DESC_SIZE));
                let flags = read_flags(desc) & !TX_FLAG_AVAIL;
                write_flags(desc, flags);
            }
        }

        // Reader/writer handshake: the endpoint thread set this flag
        // before taking the write lock to remove a mapping. Drop our
        // read guard so it isn't starved, then re-translate once we can
        // read again.
        if dma.should_yield() {
            drop(guard);
            while dma.should_yield() {
                std::thread::yield_now();
            }
            guard = dma.read();
            match guard.translate(ring_iova, ring_size) {
                Some(ptr) => ring = ptr,
                None => {
                    tracing::info!(target: "vmux::vdpdk", "tx ring unmapped during poll, exiting");
                    break;
                }
            }
        }

        let desc = unsafe { ring.add(desc_offset(idx, idx_mask, TX_DESC_SIZE)) };
        let desc_flags = unsafe { read_flags(desc) };

        let ready = (desc_flags & TX_FLAG_AVAIL) != 0;
        if (burst.len() >= config.burst_size || !ready) && !burst.is_empty() {
            let submitted = std::mem::replace(&mut burst, Vec::with_capacity(config.burst_size));
            driver.send_burst(vm_id, submitted, completions_tx.clone());
        }

        if !ready {
            std::thread::yield_now();
            continue;
        }

        if config.zero_copy && (desc_flags & TX_FLAG_ATTACHED) != 0 {
            // Ring wrapped onto a descriptor still owned by an in-flight
            // zero-copy send; wait for its completion.
            std::thread::yield_now();
            continue;
        }

        let iova = unsafe { read_iova(desc) };
        let len = unsafe { read_len(desc) };
        let buf_ptr = match guard.translate(iova, len as usize) {
            Some(ptr) => ptr,
            None => {
                tracing::warn!(target: "vmux::vdpdk", iova, len, "invalid tx packet iova, dropping");
                unsafe { write_flags(desc, desc_flags & !TX_FLAG_AVAIL) };
                idx = idx.wrapping_add(1);
                continue;
            }
        };

        if config.zero_copy {
            burst.push(TxPacket::ZeroCopy(ZeroCopyPacket {
                ptr: buf_ptr as *const u8,
                len,
                desc_idx: idx,
            }));
            unsafe { write_flags(desc, desc_flags | TX_FLAG_ATTACHED) };
        } else {
            let data = unsafe { std::slice::from_raw_parts(buf_ptr, len as usize) }
                .to_vec()
                .into_boxed_slice();
            burst.push(TxPacket::Copied(data));
            unsafe { write_flags(desc, desc_flags & !TX_FLAG_AVAIL) };
        }

        idx = idx.wrapping_add(1);
    }

    if !burst.is_empty() {
        driver.send_burst(vm_id, burst, completions_tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::ring::write_len;
    use crate::dma::GuardedDmaTable;
    use crate::driver::LoopbackDriver;
    use vmux_transport::Prot;

    struct Region(Box<[u8]>);

    fn mapped_region(dma: &GuardedDmaTable, iova: u64, len: usize) -> Region {
        let mut buf = vec![0u8; len].into_boxed_slice();
        dma.write()
            .insert(iova, len, buf.as_mut_ptr(), Prot::READ | Prot::WRITE)
            .unwrap();
        Region(buf)
    }

    #[test]
    fn tx_poller_drains_one_descriptor_and_clears_avail() {
        let dma = GuardedDmaTable::new();
        const RING_IOVA: u64 = 0x1000;
        const PKT_IOVA: u64 = 0x2000;
        let idx_mask = 0x3u16;
        let ring_size = (idx_mask as usize + 1) * TX_DESC_SIZE;
        let _ring = mapped_region(&dma, RING_IOVA, ring_size);
        let _pkt = mapped_region(&dma, PKT_IOVA, 64);

        {
            let guard = dma.read();
            let ring_ptr = guard.translate(RING_IOVA, ring_size).unwrap();
            unsafe {
                let desc = ring_ptr.add(desc_offset(0, idx_mask, TX_DESC_SIZE));
                write_len(desc, 4);
                let iova_ptr = desc as *mut u64;
                iova_ptr.write_unaligned(PKT_IOVA);
                write_flags(desc, TX_FLAG_AVAIL);
            }
            let pkt_ptr = guard.translate(PKT_IOVA, 4).unwrap();
            unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), pkt_ptr, 4) };
        }

        let driver = Arc::new(LoopbackDriver::new());
        let poller = TxPoller::spawn(
            0,
            0,
            Arc::new(dma),
            Arc::clone(&driver) as Arc<dyn Driver>,
            RING_IOVA,
            idx_mask,
            TxPollerConfig {
                burst_size: 1,
                zero_copy: false,
            },
        );

        let mut attempts = 0;
        let packets = loop {
            let packets = driver.sent_packets();
            if !packets.is_empty() || attempts >= 200 {
                break packets;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            attempts += 1;
        };

        poller.stop();
        assert_eq!(packets, vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn tx_polling_exits_cleanly_when_ring_is_unregistered_mid_poll() {
        let dma = GuardedDmaTable::new();
        const RING_IOVA: u64 = 0x1000;
        let idx_mask = 0x3u16;
        let ring_size = (idx_mask as usize + 1) * TX_DESC_SIZE;
        let _ring = mapped_region(&dma, RING_IOVA, ring_size);

        let driver = Arc::new(LoopbackDriver::new());
        let poller = TxPoller::spawn(
            0,
            0,
            Arc::clone(&dma),
            Arc::clone(&driver) as Arc<dyn Driver>,
            RING_IOVA,
            idx_mask,
            TxPollerConfig {
                burst_size: 1,
                zero_copy: false,
            },
        );

        // Give the poller a moment to be mid-loop, then tear down the
        // ring's mapping the same way `VfuEndpoint::dma_unregister` does.
        std::thread::sleep(std::time::Duration::from_millis(10));
        dma.request_yield();
        dma.write().remove(RING_IOVA).unwrap();
        dma.clear_yield();

        // The poller thread must notice the ring no longer translates and
        // exit on its own; `stop()` here only joins, it does not need to
        // also request a stop for this to terminate.
        poller.stop();
    }
}
