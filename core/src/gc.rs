/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * GC Scheduling Policy.
 *
 * Decides when to ask the engine to reclaim guest-managed references.
 * Three independent thresholds (requests served, host heap growth, elapsed
 * time); crossing any one triggers a pass at the next safe point. Skipping
 * a pass only delays reclamation.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::bridge::ValueBridge;
use crate::host::HostState;
use std::fmt;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;
use wasmtime::AsContextMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcThresholds {
    pub requests: u64,
    pub heap_growth_bytes: u64,
    pub interval: Duration,
}

impl Default for GcThresholds {
    fn default() -> Self {
        GcThresholds {
            requests: 100,
            heap_growth_bytes: 64 * 1024 * 1024,
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTrigger {
    Requests,
    HeapGrowth,
    Elapsed,
    EntryReturned,
    Explicit,
}

impl fmt::Display for GcTrigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            GcTrigger::Requests => "request count",
            GcTrigger::HeapGrowth => "heap growth",
            GcTrigger::Elapsed => "elapsed time",
            GcTrigger::EntryReturned => "entry point returned",
            GcTrigger::Explicit => "guest request",
        };
        f.write_str(text)
    }
}

// =============================================================================
// Heap Probe
// =============================================================================

/// Source of the host heap figure the growth threshold is measured on.
pub trait HeapProbe: Send {
    fn heap_bytes(&mut self) -> Option<u64>;
}

/// Resident memory of the current process.
pub struct ProcessMemory {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        ProcessMemory {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapProbe for ProcessMemory {
    fn heap_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid).map(|p| p.memory())
    }
}

// =============================================================================
// Policy
// =============================================================================

pub struct GcPolicy {
    thresholds: GcThresholds,
    probe: Box<dyn HeapProbe>,
    requests_since: u64,
    heap_baseline: Option<u64>,
    last: Instant,
    collections: u64,
}

impl GcPolicy {
    pub fn new(thresholds: GcThresholds) -> Self {
        Self::with_probe(thresholds, Box::new(ProcessMemory::new()))
    }

    pub fn with_probe(thresholds: GcThresholds, mut probe: Box<dyn HeapProbe>) -> Self {
        let heap_baseline = probe.heap_bytes();
        GcPolicy {
            thresholds,
            probe,
            requests_since: 0,
            heap_baseline,
            last: Instant::now(),
            collections: 0,
        }
    }

    pub fn thresholds(&self) -> GcThresholds {
        self.thresholds
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn note_request(&mut self) {
        self.requests_since += 1;
    }

    /// Which threshold, if any, has been crossed.
    pub fn due(&mut self) -> Option<GcTrigger> {
        if self.requests_since >= self.thresholds.requests {
            return Some(GcTrigger::Requests);
        }
        if let (Some(base), Some(now)) = (self.heap_baseline, self.probe.heap_bytes()) {
            if now.saturating_sub(base) >= self.thresholds.heap_growth_bytes {
                return Some(GcTrigger::HeapGrowth);
            }
        }
        if self.last.elapsed() >= self.thresholds.interval {
            return Some(GcTrigger::Elapsed);
        }
        None
    }

    /// Resets every counter after a pass.
    pub fn collected(&mut self, trigger: GcTrigger) {
        self.collections += 1;
        self.requests_since = 0;
        self.heap_baseline = self.probe.heap_bytes();
        self.last = Instant::now();
        debug!(%trigger, collections = self.collections, "gc pass");
    }
}

impl fmt::Debug for GcPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GcPolicy")
            .field("thresholds", &self.thresholds)
            .field("requests_since", &self.requests_since)
            .field("heap_baseline", &self.heap_baseline)
            .field("collections", &self.collections)
            .finish()
    }
}

// =============================================================================
// Safe Points
// =============================================================================

/// Runs a collection pass now.
pub fn collect<B: ValueBridge>(
    mut store: impl AsContextMut<Data = HostState<B>>,
    trigger: GcTrigger,
) {
    let mut cx = store.as_context_mut();
    let _ = cx.gc(None);
    cx.data_mut().gc.collected(trigger);
}

/// Counts a served request and collects if a threshold was crossed.
pub fn after_request<B: ValueBridge>(mut store: impl AsContextMut<Data = HostState<B>>) {
    let mut cx = store.as_context_mut();
    let policy = &mut cx.data_mut().gc;
    policy.note_request();
    if let Some(trigger) = policy.due() {
        collect(cx, trigger);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct FakeHeap(Arc<AtomicU64>);

    impl HeapProbe for FakeHeap {
        fn heap_bytes(&mut self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    fn policy(requests: u64, heap: u64, secs: u64) -> (GcPolicy, Arc<AtomicU64>) {
        let bytes = Arc::new(AtomicU64::new(1_000));
        let policy = GcPolicy::with_probe(
            GcThresholds {
                requests,
                heap_growth_bytes: heap,
                interval: Duration::from_secs(secs),
            },
            Box::new(FakeHeap(bytes.clone())),
        );
        (policy, bytes)
    }

    #[test]
    fn test_request_threshold() {
        let (mut p, _) = policy(3, u64::MAX, 3600);
        p.note_request();
        p.note_request();
        assert_eq!(p.due(), None);
        p.note_request();
        assert_eq!(p.due(), Some(GcTrigger::Requests));
        p.collected(GcTrigger::Requests);
        assert_eq!(p.due(), None, "counter resets after a pass");
        assert_eq!(p.collections(), 1);
    }

    #[test]
    fn test_heap_growth_threshold() {
        let (mut p, heap) = policy(1_000, 500, 3600);
        heap.store(1_400, Ordering::SeqCst);
        assert_eq!(p.due(), None);
        heap.store(1_500, Ordering::SeqCst);
        assert_eq!(p.due(), Some(GcTrigger::HeapGrowth));
        p.collected(GcTrigger::HeapGrowth);
        assert_eq!(p.due(), None, "baseline moves to current heap");
    }

    #[test]
    fn test_heap_shrink_does_not_trigger() {
        let (mut p, heap) = policy(1_000, 1, 3600);
        heap.store(10, Ordering::SeqCst);
        assert_eq!(p.due(), None);
    }

    #[test]
    fn test_elapsed_threshold() {
        let (mut p, _) = policy(1_000, u64::MAX, 0);
        assert_eq!(p.due(), Some(GcTrigger::Elapsed));
    }

    #[test]
    fn test_process_probe_reports_memory() {
        let mut probe = ProcessMemory::new();
        assert!(probe.heap_bytes().is_some_and(|b| b > 0));
    }

    #[test]
    fn test_collect_resets_store_policy() {
        let mut store = crate::bridge::tests::store::<crate::bridge::HandleTable>();
        store.data_mut().gc.note_request();
        collect(&mut store, GcTrigger::Explicit);
        assert_eq!(store.data().gc.collections(), 1);
    }
}
