//! Admission control for heavy operations
//!
//! Bounds how many separations, transcodes and downloads run at once, and
//! refuses work the memory governor says will not fit. A granted slot is an
//! RAII guard: it is released exactly once when dropped, whether the holder
//! returns, fails with `?`, panics, or is cancelled.

use crate::error::{DenyReason, GuardError, GuardResult};
use crate::services::memory_governor::MemoryGovernor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct GateState {
    /// Slot id -> (operation name, estimated MB)
    active: HashMap<Uuid, (String, u64)>,
}

#[derive(Debug)]
struct GateInner {
    capacity: usize,
    governor: MemoryGovernor,
    state: Mutex<GateState>,
    released: Notify,
}

impl GateInner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, id: Uuid) {
        let remaining = {
            let mut state = self.lock();
            if state.active.remove(&id).is_none() {
                return;
            }
            state.active.len()
        };
        self.released.notify_one();
        debug!(slot = %id, active = remaining, "Operation slot released");

        // Re-sample memory off the calling thread; no-op outside a runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let governor = self.governor.clone();
            handle.spawn_blocking(move || governor.reclaim_hint());
        }
    }
}

/// Bounded, memory-aware gate in front of heavy operations
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl AdmissionGate {
    /// Create a gate admitting at most `capacity` concurrent operations
    pub fn new(capacity: usize, governor: MemoryGovernor) -> Self {
        Self {
            inner: Arc::new(GateInner {
                capacity: capacity.max(1),
                governor,
                state: Mutex::new(GateState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of slots currently held
    pub fn active(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Names of the operations currently holding slots
    pub fn active_operations(&self) -> Vec<String> {
        self.inner
            .lock()
            .active
            .values()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.inner.governor
    }

    /// Try to reserve a slot without waiting
    ///
    /// The slot count is checked before memory, and both checks plus the
    /// increment happen under one lock. The memory check covers this
    /// estimate plus the estimates of every slot already held.
    pub fn acquire(&self, name: &str, estimated_mb: u64) -> GuardResult<OperationSlot> {
        let id = Uuid::new_v4();
        {
            let mut state = self.inner.lock();

            if state.active.len() >= self.inner.capacity {
                warn!(
                    operation = name,
                    active = state.active.len(),
                    capacity = self.inner.capacity,
                    "Operation denied: concurrency limit reached"
                );
                return Err(GuardError::AdmissionDenied {
                    reason: DenyReason::ConcurrencyLimit,
                });
            }

            // Granted slots may not have allocated yet; their estimates
            // still count against the headroom
            let reserved_mb: u64 = state.active.values().map(|(_, mb)| *mb).sum();
            if !self.inner.governor.admit(estimated_mb.saturating_add(reserved_mb)) {
                warn!(
                    operation = name,
                    estimated_mb,
                    reserved_mb,
                    "Operation denied: insufficient memory"
                );
                return Err(GuardError::AdmissionDenied {
                    reason: DenyReason::MemoryLimit,
                });
            }

            state.active.insert(id, (name.to_string(), estimated_mb));
            info!(
                operation = name,
                slot = %id,
                estimated_mb,
                active = state.active.len(),
                capacity = self.inner.capacity,
                "Operation slot acquired"
            );
        }

        Ok(OperationSlot {
            id,
            name: name.to_string(),
            estimated_mb,
            acquired_at: Instant::now(),
            gate: Arc::clone(&self.inner),
        })
    }

    /// Reserve a slot, waiting up to `max_wait` for one to be released
    ///
    /// Only concurrency denials are waited out. A memory denial is returned
    /// at once, as is the last concurrency denial when `max_wait` elapses.
    pub async fn acquire_wait(
        &self,
        name: &str,
        estimated_mb: u64,
        max_wait: Duration,
    ) -> GuardResult<OperationSlot> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let err = match self.acquire(name, estimated_mb) {
                Ok(slot) => return Ok(slot),
                Err(err @ GuardError::AdmissionDenied {
                    reason: DenyReason::ConcurrencyLimit,
                }) => err,
                Err(err) => return Err(err),
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(err);
            }

            debug!(operation = name, "Waiting for an operation slot");
            if tokio::time::timeout_at(deadline, self.inner.released.notified())
                .await
                .is_err()
            {
                // One last try: a release may have raced the deadline
                return self.acquire(name, estimated_mb);
            }
        }
    }
}

/// A held admission slot
///
/// Dropping the slot releases it and wakes one waiter.
#[derive(Debug)]
pub struct OperationSlot {
    id: Uuid,
    name: String,
    estimated_mb: u64,
    acquired_at: Instant,
    gate: Arc<GateInner>,
}

impl OperationSlot {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn estimated_mb(&self) -> u64 {
        self.estimated_mb
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for OperationSlot {
    fn drop(&mut self) {
        debug!(
            operation = %self.name,
            held_ms = self.held_for().as_millis() as u64,
            "Releasing operation slot"
        );
        self.gate.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_governor::StaticMemoryProbe;
    use mtools_common::config::MemoryConfig;

    fn gate_with(capacity: usize, probe: Arc<StaticMemoryProbe>) -> AdmissionGate {
        let governor = MemoryGovernor::new(probe, MemoryConfig::default());
        AdmissionGate::new(capacity, governor)
    }

    fn roomy_gate(capacity: usize) -> AdmissionGate {
        gate_with(capacity, Arc::new(StaticMemoryProbe::new(32000, 16000, 100)))
    }

    #[tokio::test]
    async fn test_acquire_up_to_capacity() {
        let gate = roomy_gate(2);
        let a = gate.acquire("separation", 100).unwrap();
        let _b = gate.acquire("separation", 100).unwrap();
        assert_eq!(gate.active(), 2);

        let err = gate.acquire("separation", 100).unwrap_err();
        assert!(matches!(
            err,
            GuardError::AdmissionDenied { reason: DenyReason::ConcurrencyLimit }
        ));

        drop(a);
        assert_eq!(gate.active(), 1);
        assert!(gate.acquire("separation", 100).is_ok());
    }

    #[tokio::test]
    async fn test_memory_denial() {
        let gate = gate_with(4, Arc::new(StaticMemoryProbe::new(8000, 100, 100)));
        let err = gate.acquire("separation", 500).unwrap_err();
        assert!(matches!(
            err,
            GuardError::AdmissionDenied { reason: DenyReason::MemoryLimit }
        ));
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn test_held_estimates_reserve_headroom() {
        let probe = Arc::new(StaticMemoryProbe::new(16000, 300, 100));
        let gate = gate_with(4, probe);
        let first = gate.acquire("separation", 200).unwrap();

        let err = gate.acquire("separation", 200).unwrap_err();
        assert!(matches!(
            err,
            GuardError::AdmissionDenied { reason: DenyReason::MemoryLimit }
        ));
        assert!(gate.acquire("transcode", 100).is_ok());

        drop(first);
        assert!(gate.acquire("separation", 200).is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_checked_before_memory() {
        let probe = Arc::new(StaticMemoryProbe::new(32000, 16000, 100));
        let gate = gate_with(1, probe.clone());
        let _held = gate.acquire("separation", 100).unwrap();

        probe.set(32000, 10, 100);
        let err = gate.acquire("separation", 100).unwrap_err();
        assert!(matches!(
            err,
            GuardError::AdmissionDenied { reason: DenyReason::ConcurrencyLimit }
        ));
    }

    #[tokio::test]
    async fn test_slot_released_on_panic() {
        let gate = roomy_gate(1);
        let task_gate = gate.clone();
        let result = tokio::spawn(async move {
            let _slot = task_gate.acquire("separation", 100).unwrap();
            panic!("tool wrapper crashed");
        })
        .await;
        assert!(result.is_err());
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn test_slot_released_on_cancellation() {
        let gate = roomy_gate(1);
        let task_gate = gate.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            let _slot = task_gate.acquire("separation", 100).unwrap();
            let _ = tx.send(());
            std::future::pending::<()>().await;
        });
        rx.await.unwrap();
        assert_eq!(gate.active(), 1);

        handle.abort();
        let _ = handle.await;
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn test_acquire_wait_gives_up() {
        let gate = roomy_gate(1);
        let _held = gate.acquire("separation", 100).unwrap();
        let started = Instant::now();
        let err = gate
            .acquire_wait("separation", 100, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::AdmissionDenied { .. }));
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_acquire_wait_memory_denial_is_immediate() {
        let gate = gate_with(2, Arc::new(StaticMemoryProbe::new(8000, 10, 100)));
        let started = Instant::now();
        let err = gate
            .acquire_wait("separation", 500, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::AdmissionDenied { reason: DenyReason::MemoryLimit }
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
