//! Process supervisor: construct drivers, VMs, wire components, signal
//! handling. Grounded in `original_source/src/main.cpp`'s argument
//! parsing / device construction loop and `runner.cpp`'s per-VM thread
//! model.
//!
//! The guest-facing wire protocol and concrete packet-I/O backends are
//! external collaborators this binary excludes: it wires every VM's
//! [`vmux::endpoint::VfuEndpoint`] to
//! [`vmux_transport::LoopbackTransport`] (the only `Transport` this crate
//! ships) and a [`vmux::driver::LoopbackDriver`] (the only `Driver` this
//! crate ships). A deployment with a real vfio-user socket and a real
//! kernel-bypass backend would substitute different implementations of
//! those two traits; everything else here is unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vmux::config::{Cli, Config};
use vmux::device::Device;
use vmux::devices::vdpdk::{VdpdkDevice, VDPDK_PCI_IDENTITY};
use vmux::devices::vdpdk::tx::TxPollerConfig;
use vmux::driver::{Driver, LoopbackDriver};
use vmux::endpoint::VfuEndpoint;
use vmux::interrupts::{self, GlobalInterrupts, ThrottlerKind};
use vmux::policies::SwitchPolicy;
use vmux::rxthread::RxThread;
use vmux::runner::{CapabilityPlan, Runner};
use vmux_transport::{LoopbackTransport, PciBusType};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

fn main() {
    let cli = Cli::parse();
    let throttler_kind: ThrottlerKind = cli.throttler.into();
    let debug_output = cli.debug_output;

    let default_filter = if debug_output { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_file(debug_output)
        .with_line_number(debug_output)
        .init();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(target: "vmux::main", %err, "configuration error");
            std::process::exit(1);
        }
    };

    install_sigint_handler();

    let switch_policy = Arc::new(SwitchPolicy::new(config.max_switch_rules));
    let global_interrupts = Arc::new(GlobalInterrupts::new(config.devices.len() as u32));
    let stats_thread = StatsThread::spawn(
        Duration::from_secs(config.stats_interval_secs.max(1)),
        Arc::clone(&global_interrupts),
        Arc::clone(&switch_policy),
    );

    let mut runners = Vec::new();
    let mut rx_threads = Vec::new();
    for (device_idx, device_addr) in config.devices.iter().enumerate() {
        let device_id = device_idx as u32;
        let socket = format!("{}_{device_idx}", config.socket.display());
        let cpu_pin = config.cpu_pin.get(device_idx).copied();

        let driver: Arc<dyn Driver> = Arc::new(LoopbackDriver::new());
        let tx_config = TxPollerConfig {
            burst_size: config.burst_size,
            zero_copy: config.tx_zero_copy,
        };

        let transport = match LoopbackTransport::new(1 << 20) {
            Ok(transport) => Box::new(transport),
            Err(err) => {
                tracing::error!(target: "vmux::main", device = %device_addr, %err, "failed to set up guest transport");
                std::process::exit(1);
            }
        };
        let irq_trigger = transport.irq_trigger();
        let throttler = interrupts::build(throttler_kind, 0, irq_trigger, Arc::clone(&global_interrupts));

        let device: Box<dyn Device> =
            Box::new(VdpdkDevice::new(device_id, Arc::clone(&driver), tx_config).with_throttler(throttler, 0));
        let endpoint = VfuEndpoint::new(transport, device);
        let device_handle = endpoint.device_handle();

        tracing::info!(target: "vmux::main", device = %device_addr, socket, "starting vm");
        let runner = Runner::start(
            socket,
            endpoint,
            VDPDK_PCI_IDENTITY,
            PciBusType::Express,
            CapabilityPlan {
                add_standard_caps: false,
                msix_vectors: 1,
                device_serial: device_id as u64,
            },
        );
        runners.push(runner);
        rx_threads.push(RxThread::spawn(device_id, device_id, device_handle, cpu_pin));
    }

    while !SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    tracing::info!(target: "vmux::main", "shutting down");
    for runner in &runners {
        runner.stop();
    }
    for mut runner in runners {
        if let Err(err) = runner.join() {
            tracing::error!(target: "vmux::main", %err, "vm runner exited with an error");
        }
    }
    for rx_thread in rx_threads {
        rx_thread.stop();
    }
    stats_thread.stop();
}

/// Periodically logs the global interrupt-rate statistics and the switch
/// table's current size, at `--stats-interval-secs`. Mirrors the stop-flag
/// thread pattern used by [`vmux::policies::PtpPolicy`] and
/// [`vmux::rxthread::RxThread`].
struct StatsThread {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StatsThread {
    fn spawn(
        interval: std::time::Duration,
        global_interrupts: Arc<GlobalInterrupts>,
        switch_policy: Arc<SwitchPolicy>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("vmuxStats".to_string())
            .spawn(move || {
                while !stop_thread.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if stop_thread.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::info!(
                        target: "vmux::main",
                        spacing_min_ns = global_interrupts.spacing_min_ns(),
                        spacing_max_ns = global_interrupts.spacing_max_ns(),
                        spacing_avg_ns = global_interrupts.spacing_avg_ns(),
                        cpu_usage = global_interrupts.cpu_usage(),
                        slow_down = global_interrupts.slow_down(),
                        switch_rules = switch_policy.rule_count(),
                        "stats"
                    );
                }
            })
            .expect("failed to spawn stats thread");

        StatsThread {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
