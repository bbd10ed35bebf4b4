//! The RX busy-poll worker. Grounded in `original_source/src/rx-thread.hpp`'s
//! `RxThread`: a dedicated thread that calls `device->rx_callback` in a
//! tight loop, pinned to a CPU, named `vmuxRx<device_id>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::device::Device;

/// Owns the busy-poll thread driving one device's `rx_callback`. Only
/// devices with an RX path (vDPDK) need one; passthrough and other
/// callback-only devices simply never spawn an `RxThread`.
pub struct RxThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RxThread {
    /// Spawns the worker. `cpu` is an optional core to pin the thread to
    /// (the original uses `pthread_setaffinity_np`; this crate uses
    /// `libc::sched_setaffinity` directly since there is no
    /// thread-affinity crate in this dependency stack).
    pub fn spawn(device_id: u32, vm_id: u32, device: Arc<Mutex<Box<dyn Device>>>, cpu: Option<usize>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("vmuxRx{device_id}"))
            .spawn(move || {
                if let Some(cpu) = cpu {
                    pin_current_thread(cpu);
                }
                run(vm_id, device, stop_thread);
            })
            .expect("failed to spawn rx thread");
        RxThread {
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

impl Drop for RxThread {
    fn drop(&mut self) {
        self.request_stop_and_join();
    }
}

fn run(vm_id: u32, device: Arc<Mutex<Box<dyn Device>>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        device.lock().unwrap().rx_callback(vm_id);
    }
}

fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            tracing::warn!(target: "vmux::rxthread", cpu, "failed to set rx thread cpu affinity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingDevice {
        calls: Arc<AtomicUsize>,
    }

    impl Device for CountingDevice {
        fn declare(&mut self, _transport: &mut dyn vmux_transport::Transport, _dma: Arc<crate::dma::GuardedDmaTable>) -> crate::Result<()> {
            Ok(())
        }

        fn rx_callback(&mut self, _vm_id: u32) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn busy_polls_rx_callback_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let device: Arc<Mutex<Box<dyn Device>>> = Arc::new(Mutex::new(Box::new(CountingDevice { calls: Arc::clone(&calls) })));
        let rx = RxThread::spawn(0, 0, device, None);
        while calls.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }
        rx.stop();
        assert!(calls.load(Ordering::Relaxed) >= 10);
    }
}
