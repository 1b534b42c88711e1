//! Poison-tolerant lock access.
//!
//! Cache entries and throttle state stay usable after a panic on another
//! thread; the panic itself is reported where it happened, so here we only
//! note the recovery and continue with the inner value.

use std::panic::Location;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) trait RwLockExt<T> {
    fn read_recovering(&self, op: &'static str) -> RwLockReadGuard<'_, T>;
    fn write_recovering(&self, op: &'static str) -> RwLockWriteGuard<'_, T>;
}

pub(crate) trait MutexExt<T> {
    fn lock_recovering(&self, op: &'static str) -> MutexGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    #[track_caller]
    fn read_recovering(&self, op: &'static str) -> RwLockReadGuard<'_, T> {
        let location = Location::caller();
        self.read()
            .unwrap_or_else(|poisoned| recover(poisoned, op, "rwlock.read", location))
    }

    #[track_caller]
    fn write_recovering(&self, op: &'static str) -> RwLockWriteGuard<'_, T> {
        let location = Location::caller();
        self.write()
            .unwrap_or_else(|poisoned| recover(poisoned, op, "rwlock.write", location))
    }
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_recovering(&self, op: &'static str) -> MutexGuard<'_, T> {
        let location = Location::caller();
        self.lock()
            .unwrap_or_else(|poisoned| recover(poisoned, op, "mutex.lock", location))
    }
}

fn recover<G>(
    poisoned: PoisonError<G>,
    op: &'static str,
    lock_kind: &'static str,
    location: &'static Location<'static>,
) -> G {
    warn!(
        op,
        lock_kind,
        location = %location,
        "Recovered from poisoned lock"
    );
    poisoned.into_inner()
}
