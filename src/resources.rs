// src/resources.rs
//
// =============================================================================
// SUNBENCH: RESOURCE LEDGER & HANDLES
// =============================================================================
//
// The Inventory.
//
// Responsibilities:
// 1. Track which instrument addresses are currently open.
// 2. Issue "Leases" (receipts) so no two contexts hold the same instrument.
// 3. Wrap every open instrument in a `Handle` that releases it exactly once,
//    on every exit path (success, error, cancellation, panic unwinding).

use crate::error::{LabError, LabResult};
use crate::instruments::{Instrument, InstrumentKind};
use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

// ============================================================================
// 1. THE LEDGER (State Tracker)
// ============================================================================

/// Claim policy for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Fails with `AddressInUse` if another context holds the address.
    Normal,
    /// Safety path (emergency stop): never refused, never recorded.
    Preempt,
}

#[derive(Clone, Default)]
pub struct ResourceLedger {
    held: Arc<Mutex<HashSet<(InstrumentKind, String)>>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(
        &self,
        kind: InstrumentKind,
        address: &str,
        priority: Priority,
    ) -> LabResult<Lease> {
        if priority == Priority::Preempt {
            return Ok(Lease {
                ledger: self.clone(),
                key: None,
            });
        }
        let key = (kind, address.to_string());
        let mut held = self.lock();
        if !held.insert(key.clone()) {
            return Err(LabError::AddressInUse {
                kind,
                address: address.to_string(),
            });
        }
        Ok(Lease {
            ledger: self.clone(),
            key: Some(key),
        })
    }

    pub fn is_held(&self, kind: InstrumentKind, address: &str) -> bool {
        self.lock().contains(&(kind, address.to_string()))
    }

    /// Number of addresses currently open.
    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<(InstrumentKind, String)>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Receipt for a claimed address. Returned to the pool on drop.
pub struct Lease {
    ledger: ResourceLedger,
    key: Option<(InstrumentKind, String)>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.ledger.lock().remove(&key);
        }
    }
}

// ============================================================================
// 2. SCOPED HANDLES
// ============================================================================

/// Scoped ownership of one instrument connection.
pub struct Handle<T: Instrument + ?Sized> {
    inner: Box<T>,
    // Dropped after `release()` so the address frees only once closed
    _lease: Lease,
}

impl<T: Instrument + ?Sized> Handle<T> {
    pub fn new(inner: Box<T>, lease: Lease) -> Self {
        Self {
            inner,
            _lease: lease,
        }
    }
}

impl<T: Instrument + ?Sized> Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Instrument + ?Sized> DerefMut for Handle<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: Instrument + ?Sized> Drop for Handle<T> {
    fn drop(&mut self) {
        log::debug!(
            "Releasing {} at {}",
            self.inner.kind(),
            self.inner.address()
        );
        self.inner.release();
    }
}

impl<T: Instrument + ?Sized> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}@{})", self.inner.kind(), self.inner.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_address_is_refused() {
        let ledger = ResourceLedger::new();
        let lease = ledger
            .claim(InstrumentKind::StageController, "10.0.0.2", Priority::Normal)
            .unwrap();
        let again = ledger.claim(InstrumentKind::StageController, "10.0.0.2", Priority::Normal);
        assert!(matches!(again, Err(LabError::AddressInUse { .. })));

        // The safety path is never refused and never recorded
        let estop = ledger
            .claim(InstrumentKind::StageController, "10.0.0.2", Priority::Preempt)
            .unwrap();
        assert_eq!(ledger.open_count(), 1);
        drop(estop);
        assert!(ledger.is_held(InstrumentKind::StageController, "10.0.0.2"));

        drop(lease);
        assert_eq!(ledger.open_count(), 0);
    }
}
