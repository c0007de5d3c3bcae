//! Process memory readings used as a proxy for cache footprint and as the
//! pressure signal for adaptive throttling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source of the current process memory usage.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory in bytes, or `None` when the platform cannot tell.
    fn resident_bytes(&self) -> Option<u64>;
}

impl<T: MemoryProbe + ?Sized> MemoryProbe for Arc<T> {
    fn resident_bytes(&self) -> Option<u64> {
        (**self).resident_bytes()
    }
}

/// Reads the resident set size of the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    fn resident_bytes(&self) -> Option<u64> {
        process_resident_bytes()
    }
}

/// `VmRSS` from `/proc/self/status`. Linux only; `None` elsewhere.
pub fn process_resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}

/// Last reading of another probe, kept in an atomic so the request path never
/// touches the filesystem. Refreshed by [`SampledMemory::start`].
pub struct SampledMemory {
    source: Box<dyn MemoryProbe>,
    // 0 = no reading
    last: AtomicU64,
}

impl SampledMemory {
    /// Wrap `source`, taking a first reading immediately.
    pub fn new(source: Box<dyn MemoryProbe>) -> Self {
        let sampled = Self {
            source,
            last: AtomicU64::new(0),
        };
        sampled.refresh();
        sampled
    }

    pub fn refresh(&self) -> Option<u64> {
        let reading = self.source.resident_bytes();
        self.last.store(reading.unwrap_or(0), Ordering::Relaxed);
        reading
    }

    /// Refresh every `interval` until `cancel` fires.
    pub fn start(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let sampled = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sampled.refresh();
                    }
                }
            }
        })
    }
}

impl MemoryProbe for SampledMemory {
    fn resident_bytes(&self) -> Option<u64> {
        match self.last.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }
}
