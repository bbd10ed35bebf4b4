//! The per-VM server thread: one thread per VM. On start, realizes the
//! endpoint, then blocks in attach. After attach, polls the endpoint's
//! poll FD with a 500 ms timeout and dispatches one run-context turn per
//! POLLIN. Grounded in `original_source/src/runner.hpp`/`runner.cpp`'s
//! `VmuxRunner`.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use vmux_transport::{AttachOutcome, DispatchOutcome, PciBusType, PciIdentity};

use crate::caps;
use crate::endpoint::VfuEndpoint;

/// Mirrors the original's `VmuxRunner::State` enum exactly (including the
/// numbering, since nothing outside this module inspects it as anything
/// but an opaque progression).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RunnerState {
    NotStarted = 0,
    Started = 1,
    Initialized = 2,
    Connected = 3,
}

impl From<u8> for RunnerState {
    fn from(value: u8) -> Self {
        match value {
            0 => RunnerState::NotStarted,
            1 => RunnerState::Started,
            2 => RunnerState::Initialized,
            _ => RunnerState::Connected,
        }
    }
}

/// Whether to append the standard PM/MSI-X/Express/DSN capability chain
/// during `initialize`. The original only does this for PCIe passthrough
/// devices
/// (`device->vfioc->is_pcie`); vDPDK and other emulated devices don't
/// carry a backing `VfioConsumer` to source a serial number from, so
/// they opt out.
#[derive(Clone, Copy, Debug)]
pub struct CapabilityPlan {
    pub add_standard_caps: bool,
    pub msix_vectors: u16,
    pub device_serial: u64,
}

impl Default for CapabilityPlan {
    fn default() -> Self {
        CapabilityPlan {
            add_standard_caps: false,
            msix_vectors: 1,
            device_serial: 0,
        }
    }
}

const ATTACH_RETRY_INTERVAL: Duration = Duration::from_micros(10_000);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Drives one `VfuEndpoint` to completion on a dedicated thread.
pub struct Runner {
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<crate::Result<()>>>,
}

impl Runner {
    /// Spawns the runner thread. `identity`/`bus`/`caps` describe what
    /// `endpoint.realize` should declare; `socket` is carried only for
    /// logging (the concrete transport already knows its own address).
    pub fn start(
        socket: String,
        mut endpoint: VfuEndpoint,
        identity: PciIdentity,
        bus: PciBusType,
        cap_plan: CapabilityPlan,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(RunnerState::NotStarted as u8));
        let running = Arc::new(AtomicBool::new(true));

        let state_thread = Arc::clone(&state);
        let running_thread = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("vmuxRunner".to_string())
            .spawn(move || run(socket, &mut endpoint, identity, bus, cap_plan, state_thread, running_thread))
            .expect("failed to spawn runner thread");

        Runner {
            state,
            running,
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> RunnerState {
        RunnerState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == RunnerState::Initialized
    }

    pub fn is_connected(&self) -> bool {
        self.state() == RunnerState::Connected
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn join(&mut self) -> crate::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().expect("runner thread panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}

fn run(
    socket: String,
    endpoint: &mut VfuEndpoint,
    identity: PciIdentity,
    bus: PciBusType,
    cap_plan: CapabilityPlan,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
) -> crate::Result<()> {
    state.store(RunnerState::Started as u8, Ordering::Release);
    tracing::info!(target: "vmux::runner", socket, "initializing endpoint");

    endpoint.realize(identity, bus)?;
    if cap_plan.add_standard_caps {
        add_caps(endpoint, cap_plan)?;
    }
    state.store(RunnerState::Initialized as u8, Ordering::Release);

    tracing::info!(target: "vmux::runner", socket, "waiting for guest to attach");
    loop {
        match endpoint.attach()? {
            AttachOutcome::Connected => break,
            AttachOutcome::WouldBlock => {
                if !running.load(Ordering::Acquire) {
                    return Ok(());
                }
                std::thread::sleep(ATTACH_RETRY_INTERVAL);
            }
        }
    }
    state.store(RunnerState::Connected as u8, Ordering::Release);

    while running.load(Ordering::Acquire) {
        if !poll_readable(endpoint.poll_fd(), POLL_TIMEOUT) {
            continue;
        }
        match endpoint.dispatch_one() {
            Ok(DispatchOutcome::Processed) | Ok(DispatchOutcome::WouldBlock) => {}
            Err(crate::VmuxError::Transport(vmux_transport::TransportError::NotConnected)) => {
                tracing::warn!(target: "vmux::runner", socket, "guest disconnected");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

fn poll_readable(fd: std::os::fd::RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as i32) };
    ret > 0 && (pfd.revents & libc::POLLIN) != 0
}

/// Standard (non-extended) capabilities conventionally start here in this
/// device's config space layout; the vendor-specific header before it is
/// opaque to this crate.
const STD_CAP_BASE: u8 = 0x40;

fn add_caps(endpoint: &mut VfuEndpoint, plan: CapabilityPlan) -> crate::Result<()> {
    let standard = caps::link_chain(
        STD_CAP_BASE,
        vec![
            caps::pm(),
            caps::msix(plan.msix_vectors, 3, 0, 3, 0x1000),
            caps::express(),
        ],
    );
    for blob in standard {
        endpoint.add_capability(blob)?;
    }
    // The only extended-config-space capability this device declares, so
    // its next-pointer is always the chain terminator.
    endpoint.add_capability(caps::dsn(plan.device_serial))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::dma::GuardedDmaTable;
    use vmux_transport::LoopbackTransport;

    struct NullDevice;
    impl Device for NullDevice {
        fn declare(&mut self, _transport: &mut dyn vmux_transport::Transport, _dma: Arc<GuardedDmaTable>) -> crate::Result<()> {
            Ok(())
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
    fn stops_cleanly_while_waiting_for_attach() {
        let transport = Box::new(LoopbackTransport::new(4096).unwrap());
        let endpoint = VfuEndpoint::new(transport, Box::new(NullDevice));
        let mut runner = Runner::start(
            "test.sock".to_string(),
            endpoint,
            identity(),
            PciBusType::Express,
            CapabilityPlan::default(),
        );

        while !runner.is_initialized() {
            std::thread::yield_now();
        }
        runner.stop();
        runner.join().unwrap();
    }
}
