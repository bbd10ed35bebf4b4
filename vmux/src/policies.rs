//! Switch-rule authority and the PTP broadcast rotator. Grounded in
//! `original_source/src/policies/policies.hpp` (`SwitchPolicy`) and
//! `original_source/src/policies/ptp.hpp` (`PtpPolicy`); the latter's
//! `timerfd`+`epoll` rotation is replaced by a spawned thread, matching
//! the simplification already made for the interrupt throttlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

fn mac_to_u64(mac: [u8; 6]) -> u64 {
    mac.iter().fold(0u64, |acc, &byte| (acc << 8) | byte as u64)
}

/// Destination-MAC -> vm-id authority. `add_switch_rule` succeeds iff the
/// MAC is unbound or already bound to the same vm-id, so repeated
/// identical adds are idempotent. Capped at `max_rules` total bindings,
/// configured from `--max-switch-rules`, so a guest cannot grow the table
/// without bound.
pub struct SwitchPolicy {
    rules: Mutex<HashMap<u64, u32>>,
    max_rules: usize,
}

impl SwitchPolicy {
    pub fn new(max_rules: usize) -> Self {
        SwitchPolicy {
            rules: Mutex::new(HashMap::new()),
            max_rules,
        }
    }

    pub fn add_switch_rule(&self, vm_id: u32, dst_addr: [u8; 6], dst_queue: u16) -> bool {
        let _ = dst_queue;
        let mac = mac_to_u64(dst_addr);
        let mut rules = self.rules.lock().unwrap();
        match rules.get(&mac) {
            Some(&existing) if existing == vm_id => true,
            Some(_) => false,
            None => {
                if rules.len() >= self.max_rules {
                    tracing::warn!(target: "vmux::policies", max_rules = self.max_rules, "switch rule table full, rejecting new binding");
                    return false;
                }
                rules.insert(mac, vm_id);
                true
            }
        }
    }

    pub fn resolve(&self, dst_addr: [u8; 6]) -> Option<u32> {
        self.rules.lock().unwrap().get(&mac_to_u64(dst_addr)).copied()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().unwrap().len()
    }
}

/// Round-robins a PTP broadcast target among `destination_count` VMs
/// every 20 seconds. Generalized from a PTP round-robin scheduler that
/// originally reached directly into an `E810EmulatedDevice`'s
/// `ptp_target_vm_idx`: a specific behavioral NIC model is out of scope
/// here, so this policy only owns the rotating index and lets whatever
/// device cares read it.
pub struct PtpPolicy {
    current_target: Arc<AtomicUsize>,
    destination_count: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PtpPolicy {
    const SCHEDULING_INTERVAL: Duration = Duration::from_secs(20);

    pub fn start(destination_count: usize) -> Self {
        let current_target = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = if destination_count > 0 {
            let target = Arc::clone(&current_target);
            let stop_thread = Arc::clone(&stop);
            Some(
                std::thread::Builder::new()
                    .name("vmuxPtp".to_string())
                    .spawn(move || {
                        while !stop_thread.load(Ordering::Acquire) {
                            std::thread::sleep(Self::SCHEDULING_INTERVAL);
                            if stop_thread.load(Ordering::Acquire) {
                                break;
                            }
                            let next = (target.load(Ordering::Relaxed) + 1) % destination_count;
                            target.store(next, Ordering::Relaxed);
                            tracing::debug!(target: "vmux::policies", vm_idx = next, "new ptp broadcast target");
                        }
                    })
                    .expect("failed to spawn ptp rotation thread"),
            )
        } else {
            None
        };

        PtpPolicy {
            current_target,
            destination_count,
            stop,
            handle,
        }
    }

    pub fn current_target(&self) -> usize {
        self.current_target.load(Ordering::Relaxed)
    }

    pub fn destination_count(&self) -> usize {
        self.destination_count
    }
}

impl Drop for PtpPolicy {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
