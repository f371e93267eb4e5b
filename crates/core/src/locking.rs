//! Poison-tolerant lock helpers.
//!
//! Every record guarded by these locks is replaced wholesale after validation,
//! so a panic in another holder never leaves half-written state behind.
//! A poisoned lock is therefore recovered rather than propagating the panic.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("rwlock was poisoned, recovering");
        poisoned.into_inner()
    })
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("rwlock was poisoned, recovering");
        poisoned.into_inner()
    })
}
