//! # Port Allocator
//!
//! Tracks which ports in the configured `[start, end]` range are reserved for
//! iperf3 servers. Three indices are kept mutually consistent under one lock:
//! the set of in-use ports, port -> test id, and test id -> port.

use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Indices {
    allocated: BTreeSet<u16>,
    port_to_test: HashMap<u16, String>,
    test_to_port: HashMap<String, u16>,
}

/// Fixed-range port allocator, serialized by a single lock
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    indices: Mutex<Indices>,
}

impl PortAllocator {
    /// Create an allocator over `[start, end]`. Rejects zero ports and empty
    /// or inverted ranges; the u16 type bounds the top end.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start < 1 {
            bail!("invalid start port: {start}");
        }
        if start >= end {
            bail!("start port must be less than end port");
        }
        Ok(Self {
            start,
            end,
            indices: Mutex::new(Indices::default()),
        })
    }

    /// Reserve a port for `test_id`. Idempotent: a test that already holds a
    /// port gets the same port back.
    pub fn allocate(&self, test_id: &str) -> Result<u16> {
        let mut idx = self.indices.lock().unwrap();

        if let Some(&port) = idx.test_to_port.get(test_id) {
            return Ok(port);
        }

        for port in self.start..=self.end {
            if !idx.allocated.contains(&port) {
                idx.allocated.insert(port);
                idx.port_to_test.insert(port, test_id.to_string());
                idx.test_to_port.insert(test_id.to_string(), port);
                return Ok(port);
            }
        }

        Err(anyhow!(
            "no available ports in range {}-{}",
            self.start,
            self.end
        ))
    }

    /// Reserve a specific port for `test_id`. Fails when the port lies
    /// outside the configured range or is already in use.
    pub fn reserve(&self, port: u16, test_id: &str) -> Result<()> {
        if port < self.start || port > self.end {
            bail!(
                "port {port} outside configured range {}-{}",
                self.start,
                self.end
            );
        }
        let mut idx = self.indices.lock().unwrap();
        if idx.allocated.contains(&port) {
            bail!("port {port} already in use");
        }
        idx.allocated.insert(port);
        idx.port_to_test.insert(port, test_id.to_string());
        idx.test_to_port.insert(test_id.to_string(), port);
        Ok(())
    }

    /// Atomically reserve the `count` lowest free ports, or fail without
    /// changing any state. Bulk reservations carry no test-id mapping; they
    /// are released back by number.
    pub fn allocate_n(&self, count: usize) -> Result<Vec<u16>> {
        let mut idx = self.indices.lock().unwrap();

        let free: Vec<u16> = (self.start..=self.end)
            .filter(|p| !idx.allocated.contains(p))
            .take(count)
            .collect();

        if free.len() < count {
            bail!("insufficient ports: need {count}, found {}", free.len());
        }

        for &port in &free {
            idx.allocated.insert(port);
        }
        Ok(free)
    }

    /// Release the port held by `test_id`
    pub fn release(&self, test_id: &str) -> Result<()> {
        let mut idx = self.indices.lock().unwrap();

        let port = idx
            .test_to_port
            .remove(test_id)
            .ok_or_else(|| anyhow!("test {test_id} has no allocated port"))?;
        idx.allocated.remove(&port);
        idx.port_to_test.remove(&port);
        Ok(())
    }

    /// Release a port by number
    pub fn release_port(&self, port: u16) -> Result<()> {
        let mut idx = self.indices.lock().unwrap();

        if !idx.allocated.remove(&port) {
            bail!("port {port} is not allocated");
        }
        if let Some(test_id) = idx.port_to_test.remove(&port) {
            idx.test_to_port.remove(&test_id);
        }
        Ok(())
    }

    /// Release several ports, ignoring ones that are not allocated
    pub fn release_ports(&self, ports: &[u16]) {
        let mut idx = self.indices.lock().unwrap();

        for port in ports {
            if idx.allocated.remove(port) {
                if let Some(test_id) = idx.port_to_test.remove(port) {
                    idx.test_to_port.remove(&test_id);
                }
            }
        }
    }

    /// Drop every reservation
    pub fn release_all(&self) {
        let mut idx = self.indices.lock().unwrap();
        *idx = Indices::default();
    }

    pub fn port_for_test(&self, test_id: &str) -> Option<u16> {
        self.indices
            .lock()
            .unwrap()
            .test_to_port
            .get(test_id)
            .copied()
    }

    pub fn test_for_port(&self, port: u16) -> Option<String> {
        self.indices.lock().unwrap().port_to_test.get(&port).cloned()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.indices.lock().unwrap().allocated.contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.indices.lock().unwrap().allocated.len()
    }

    pub fn available_count(&self) -> usize {
        self.capacity() - self.allocated_count()
    }

    /// Total number of ports in the range
    pub fn capacity(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn allocated_ports(&self) -> Vec<u16> {
        self.indices
            .lock()
            .unwrap()
            .allocated
            .iter()
            .copied()
            .collect()
    }
}
