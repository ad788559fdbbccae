//! Single-flight admission gate
//!
//! The native engine serves one generation at a time. The gate admits exactly
//! one request and rejects the rest immediately instead of queueing them.

use rkserve_common::{GatewayError, Result, METRICS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Binary admission gate guarding the engine
#[derive(Debug, Clone, Default)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    /// Slot held flag
    busy: AtomicBool,

    /// Slots handed out so far
    admitted: AtomicU64,

    /// Acquisitions refused so far
    rejected: AtomicU64,
}

impl AdmissionGate {
    /// Create a free gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or fail with [`GatewayError::Busy`] without waiting
    pub fn try_acquire(&self) -> Result<AdmissionSlot> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            trace!("Admission refused, slot is held");
            return Err(GatewayError::Busy);
        }

        let ticket = self.inner.admitted.fetch_add(1, Ordering::Relaxed) + 1;
        METRICS.generation.slot_occupied.set(1);
        debug!("Admission slot {} acquired", ticket);

        Ok(AdmissionSlot {
            inner: Arc::clone(&self.inner),
            ticket,
        })
    }

    /// Whether the slot is currently held
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Slots handed out since startup
    pub fn admitted(&self) -> u64 {
        self.inner.admitted.load(Ordering::Relaxed)
    }

    /// Acquisitions refused since startup
    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }
}

/// Proof of admission; dropping it frees the gate
#[derive(Debug)]
pub struct AdmissionSlot {
    inner: Arc<GateInner>,
    ticket: u64,
}

impl AdmissionSlot {
    /// Sequence number of this admission
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::Release);
        METRICS.generation.slot_occupied.set(0);
        debug!("Admission slot {} released", self.ticket);
    }
}
