use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use crate::error::{ComputeError, Result};
use crate::models::PortRange;

/// Hands out ports from a fixed range, never the same port twice until released.
pub struct PortAllocator {
    range: PortRange,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate the lowest free port in the range that the OS also reports as unbound.
    pub fn allocate(&self) -> Result<u16> {
        let mut allocated = self
            .allocated
            .lock()
            .map_err(|_| ComputeError::PortAllocation("port pool lock poisoned".into()))?;
        for port in self.range.iter() {
            if allocated.contains(&port) {
                continue;
            }
            if is_port_free(port) {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(ComputeError::PortAllocation(format!(
            "no free port left in {}..={}",
            self.range.start, self.range.end
        )))
    }

    /// Allocate a port that goes back to the pool when the lease is dropped,
    /// unless [`PortLease::keep`] was called.
    pub fn lease(&self) -> Result<PortLease<'_>> {
        let port = self.allocate()?;
        Ok(PortLease {
            allocator: self,
            port,
            kept: false,
        })
    }

    pub fn release(&self, port: u16) {
        if let Ok(mut allocated) = self.allocated.lock() {
            allocated.remove(&port);
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().map(|a| a.len()).unwrap_or(0)
    }
}

pub struct PortLease<'a> {
    allocator: &'a PortAllocator,
    port: u16,
    kept: bool,
}

impl PortLease<'_> {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep the port allocated past the lease; the caller now owns its release.
    pub fn keep(mut self) -> u16 {
        self.kept = true;
        self.port
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.allocator.release(self.port);
        }
    }
}

fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
