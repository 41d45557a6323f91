//! # Capacity Accountant
//!
//! Bounded counter of in-use process slots plus a read-only snapshot of host
//! resources for reporting. One slot is one iperf3 subprocess, server or
//! client.

use crate::model::SystemCapacity;
use anyhow::{bail, Result};
use std::sync::Mutex;

#[derive(Debug)]
struct Slots {
    max: usize,
    used: usize,
}

/// Process-slot accountant with an upper bound
#[derive(Debug)]
pub struct CapacityAccountant {
    slots: Mutex<Slots>,
}

impl CapacityAccountant {
    /// Create an accountant. A zero limit derives a conservative default of
    /// four slots per CPU core.
    pub fn new(max_processes: usize) -> Self {
        let max = if max_processes == 0 {
            num_cpus::get() * 4
        } else {
            max_processes
        };
        Self {
            slots: Mutex::new(Slots { max, used: 0 }),
        }
    }

    /// Reserve `count` slots or fail without changing state
    pub fn reserve(&self, count: usize) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        if slots.used + count > slots.max {
            bail!(
                "insufficient capacity: need {count} slots, have {} available",
                slots.max - slots.used
            );
        }
        slots.used += count;
        Ok(())
    }

    /// Return `count` slots. A release without a matching reserve is a bug in
    /// the caller, but the counter never goes below zero.
    pub fn release(&self, count: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots.used = slots.used.saturating_sub(count);
    }

    pub fn available(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.max.saturating_sub(slots.used)
    }

    pub fn used(&self) -> usize {
        self.slots.lock().unwrap().used
    }

    pub fn max_processes(&self) -> usize {
        self.slots.lock().unwrap().max
    }

    /// Adjust the slot limit at runtime (`Initialize` override). In-flight
    /// reservations are untouched; a limit below the current usage simply
    /// rejects new work until slots drain.
    pub fn set_max_processes(&self, max: usize) {
        if max > 0 {
            self.slots.lock().unwrap().max = max;
        }
    }

    /// Snapshot host resources and the current slot budget. Reading a
    /// snapshot does not touch the counter.
    pub fn detect(&self) -> SystemCapacity {
        let (max, available) = {
            let slots = self.slots.lock().unwrap();
            (slots.max, slots.max.saturating_sub(slots.used))
        };
        SystemCapacity {
            max_processes: max,
            available_processes: available,
            cpu_cores: num_cpus::get(),
            available_memory_bytes: available_memory_bytes(),
            network_interfaces: active_interfaces(),
        }
    }
}

/// Names of up, non-loopback network interfaces
fn active_interfaces() -> Vec<String> {
    let mut names: Vec<String> = match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.name)
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names.dedup();
    names
}

/// Available memory from /proc/meminfo, 0 where unavailable
#[cfg(target_os = "linux")]
fn available_memory_bytes() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn available_memory_bytes() -> u64 {
    0
}
