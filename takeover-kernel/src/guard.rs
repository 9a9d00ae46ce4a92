//! Process-wide exclusion between reconciliation passes and platform deletion.
//!
//! The guard is a three-state cell (`Idle`, `Syncing`, `Deleting`). Holders
//! move it out of `Idle` with a compare-and-swap and get a [`GuardLease`]
//! back; dropping the lease returns the cell to `Idle`. Nothing ever waits on
//! the guard: a contended acquire fails immediately.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{Result, TakeoverError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardState {
    Idle,
    Syncing,
    Deleting,
}

impl GuardState {
    fn to_u8(self) -> u8 {
        match self {
            GuardState::Idle => 0,
            GuardState::Syncing => 1,
            GuardState::Deleting => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => GuardState::Syncing,
            2 => GuardState::Deleting,
            _ => GuardState::Idle,
        }
    }

    fn busy_error(self) -> TakeoverError {
        match self {
            GuardState::Deleting => TakeoverError::DeletionInProgress,
            _ => TakeoverError::SyncInProgress,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncGuard {
    state: AtomicU8,
}

impl SyncGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> GuardState {
        GuardState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_syncing(&self) -> bool {
        self.state() == GuardState::Syncing
    }

    pub fn is_deleting(&self) -> bool {
        self.state() == GuardState::Deleting
    }

    /// Idle -> Syncing. Fails with `SyncInProgress` if a pass is already
    /// running and `DeletionInProgress` if a deletion holds the guard.
    pub fn begin_sync(self: &Arc<Self>) -> Result<GuardLease> {
        self.acquire(GuardState::Syncing)
    }

    /// Idle -> Deleting. Fails with `SyncInProgress` while a pass runs.
    pub fn begin_delete(self: &Arc<Self>) -> Result<GuardLease> {
        self.acquire(GuardState::Deleting)
    }

    fn acquire(self: &Arc<Self>, target: GuardState) -> Result<GuardLease> {
        match self.state.compare_exchange(
            GuardState::Idle.to_u8(),
            target.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(GuardLease { guard: Arc::clone(self), held: target }),
            Err(current) => Err(GuardState::from_u8(current).busy_error()),
        }
    }

    fn release(&self, held: GuardState) {
        let released = self
            .state
            .compare_exchange(held.to_u8(), GuardState::Idle.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !released {
            tracing::warn!(?held, current = ?self.state(), "guard released from unexpected state");
        }
    }
}

/// Proof of holding the guard; releases it on drop.
#[derive(Debug)]
pub struct GuardLease {
    guard: Arc<SyncGuard>,
    held: GuardState,
}

impl GuardLease {
    pub fn held(&self) -> GuardState {
        self.held
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        self.guard.release(self.held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_blocks_delete_until_released() {
        let guard = SyncGuard::new();
        let lease = guard.begin_sync().unwrap();
        assert!(guard.is_syncing());
        assert!(matches!(guard.begin_delete(), Err(TakeoverError::SyncInProgress)));

        drop(lease);
        assert_eq!(guard.state(), GuardState::Idle);
        let delete = guard.begin_delete().unwrap();
        assert_eq!(delete.held(), GuardState::Deleting);
    }

    #[test]
    fn sync_is_single_flight() {
        let guard = SyncGuard::new();
        let _lease = guard.begin_sync().unwrap();
        assert!(matches!(guard.begin_sync(), Err(TakeoverError::SyncInProgress)));
    }

    #[test]
    fn delete_blocks_new_sync() {
        let guard = SyncGuard::new();
        let _lease = guard.begin_delete().unwrap();
        assert!(guard.is_deleting());
        assert!(matches!(guard.begin_sync(), Err(TakeoverError::DeletionInProgress)));
    }

    #[test]
    fn failed_acquire_does_not_disturb_holder() {
        let guard = SyncGuard::new();
        let lease = guard.begin_sync().unwrap();
        let _ = guard.begin_delete();
        assert!(guard.is_syncing());
        drop(lease);
        assert_eq!(guard.state(), GuardState::Idle);
    }
}
