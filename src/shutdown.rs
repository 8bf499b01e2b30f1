//! Barrier between mutating requests and persistence.
//!
//! Mutating work holds a shared guard; flush and shutdown take the
//! exclusive guard, which waits for in-flight mutations to drain and keeps
//! new ones out until the flush is done. Once closed, the gate refuses
//! every later mutation.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::AtlasError;

#[derive(Debug, Default)]
pub(crate) struct ShutdownGate {
    closed: RwLock<bool>,
}

/// Held for the duration of one mutation.
pub(crate) struct Entered<'a> {
    _guard: RwLockReadGuard<'a, bool>,
}

impl ShutdownGate {
    /// Admit one mutation. Never call while already holding an [`Entered`]:
    /// a waiting barrier would deadlock the second entry.
    pub(crate) fn enter(&self) -> Result<Entered<'_>, AtlasError> {
        let guard = self.closed.read();
        if *guard {
            return Err(AtlasError::ShuttingDown);
        }
        Ok(Entered { _guard: guard })
    }

    /// Wait for in-flight mutations and hold new ones off.
    pub(crate) fn barrier(&self) -> RwLockWriteGuard<'_, bool> {
        self.closed.write()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.read()
    }
}
