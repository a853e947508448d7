//! Memory accounting and cleanup.
//!
//! Candle does not expose allocator statistics, so the engine tracks the
//! bytes it stages for each batch against a [`DeviceMemory`] budget. The
//! adaptive strategy sizes its batches from the observed peak.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocation counters for the device running the layers
pub trait DeviceMemory: Send + Sync {
    /// Total bytes usable
    fn capacity(&self) -> usize;

    fn allocated(&self) -> usize;

    /// Highest `allocated` since the last [`DeviceMemory::reset_peak`]
    fn peak(&self) -> usize;

    fn reset_peak(&self);

    /// Claim `bytes`, failing with `ResourceExhausted` past capacity
    fn reserve(&self, bytes: usize) -> crate::Result<()>;

    fn release(&self, bytes: usize);

    /// Return cached blocks to the system
    fn empty_cache(&self);
}

/// Accounting-only [`DeviceMemory`] with a fixed capacity
#[derive(Debug)]
pub struct HostMemory {
    capacity: usize,
    allocated: AtomicUsize,
    peak: AtomicUsize,
}

impl HostMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Capacity from the memory currently available on this machine
    pub fn system() -> Self {
        Self::new(available_system_memory().unwrap_or(usize::MAX))
    }
}

impl DeviceMemory for HostMemory {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn reset_peak(&self) {
        self.peak.store(self.allocated(), Ordering::SeqCst);
    }

    fn reserve(&self, bytes: usize) -> crate::Result<()> {
        let mut current = self.allocated.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.capacity {
                return Err(crate::LayerwiseError::ResourceExhausted(format!(
                    "cannot reserve {} with {} of {} in use",
                    format_bytes(bytes as u64),
                    format_bytes(current as u64),
                    format_bytes(self.capacity as u64)
                )));
            }
            match self
                .allocated
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::SeqCst);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |a| Some(a.saturating_sub(bytes)));
    }

    fn empty_cache(&self) {
        if trim_host_heap() {
            tracing::trace!("Host heap trimmed");
        }
    }
}

/// Bytes held until dropped
#[must_use = "the reservation is released when dropped"]
pub struct Reservation {
    memory: Arc<dyn DeviceMemory>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.memory.release(self.bytes);
    }
}

/// Pinned host staging buffers, released when dropped
#[must_use = "staging is unpinned when dropped"]
pub struct PinnedStaging {
    pinned: Arc<AtomicUsize>,
    bytes: usize,
}

impl PinnedStaging {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for PinnedStaging {
    fn drop(&mut self) {
        self.pinned.fetch_sub(self.bytes, Ordering::SeqCst);
        tracing::trace!("Unpinned {}", format_bytes(self.bytes as u64));
    }
}

/// Memory state shared by one inference call's layers
#[derive(Clone)]
pub struct MemoryContext {
    memory: Arc<dyn DeviceMemory>,
    pinned: Arc<AtomicUsize>,
}

impl MemoryContext {
    pub fn new(memory: Arc<dyn DeviceMemory>) -> Self {
        Self {
            memory,
            pinned: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn memory(&self) -> &Arc<dyn DeviceMemory> {
        &self.memory
    }

    pub fn reserve(&self, bytes: usize) -> crate::Result<Reservation> {
        self.memory.reserve(bytes)?;
        Ok(Reservation {
            memory: self.memory.clone(),
            bytes,
        })
    }

    /// Pin `bytes` of host staging for the lifetime of the guard
    pub fn pin(&self, bytes: usize) -> PinnedStaging {
        self.pinned.fetch_add(bytes, Ordering::SeqCst);
        tracing::trace!("Pinned {}", format_bytes(bytes as u64));
        PinnedStaging {
            pinned: self.pinned.clone(),
            bytes,
        }
    }

    pub fn pinned_bytes(&self) -> usize {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.memory.peak()
    }

    pub fn reset_peak(&self) {
        self.memory.reset_peak();
    }

    /// Bytes the adaptive strategy aims to stay under
    pub fn target_bytes(&self, fraction: f64) -> usize {
        (self.memory.capacity() as f64 * fraction) as usize
    }

    pub fn clear_caches(&self) {
        tracing::trace!("Clearing memory caches");
        self.memory.empty_cache();
    }
}

/// Return freed heap pages to the OS between layers.
///
/// Reports whether the allocator gave anything back; always `false` where
/// glibc's `malloc_trim` is unavailable.
pub fn trim_host_heap() -> bool {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        unsafe extern "C" {
            fn malloc_trim(pad: usize) -> i32;
        }
        unsafe { malloc_trim(0) != 0 }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        false
    }
}

/// `MemAvailable` from `/proc/meminfo`, where the platform has it
pub fn available_system_memory() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_clearing_caches_keeps_accounting() {
        let cx = MemoryContext::new(Arc::new(HostMemory::new(100)));
        let _held = cx.reserve(30).unwrap();
        cx.clear_caches();
        assert_eq!(cx.memory().allocated(), 30);
    }

    #[test]
    fn test_reservations_release_on_drop() {
        let cx = MemoryContext::new(Arc::new(HostMemory::new(100)));
        {
            let _a = cx.reserve(60).unwrap();
            assert_eq!(cx.memory().allocated(), 60);
            let err = cx.reserve(50).err().unwrap();
            assert!(err.is_resource_exhaustion());
            let _b = cx.reserve(40).unwrap();
        }
        assert_eq!(cx.memory().allocated(), 0);
        assert_eq!(cx.peak(), 100);

        cx.reset_peak();
        assert_eq!(cx.peak(), 0);
    }

    #[test]
    fn test_pinned_staging_guard() {
        let cx = MemoryContext::new(Arc::new(HostMemory::new(usize::MAX)));
        let guard = cx.pin(4096);
        assert_eq!(cx.pinned_bytes(), 4096);
        drop(guard);
        assert_eq!(cx.pinned_bytes(), 0);
    }

    #[test]
    fn test_target_bytes() {
        let cx = MemoryContext::new(Arc::new(HostMemory::new(1000)));
        assert_eq!(cx.target_bytes(0.8), 800);
    }
}
