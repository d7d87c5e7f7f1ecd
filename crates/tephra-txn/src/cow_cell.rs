//! Copy-on-write locking for registry entry data.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A value guarded by a read/write lock with copy-on-write mutation.
///
/// Readers take a shared guard over the committed value. A writer takes the
/// exclusive lock, stages a clone, mutates the stage, and publishes it
/// atomically with [`CowWriteGuard::commit`]; dropping the guard without
/// committing abandons the stage. Readers therefore always observe a
/// consistent old or new value, never a partially-updated one, and a writer
/// whose side effects fail (e.g. persistence) simply walks away.
#[derive(Debug, Default)]
pub struct CowCell<T: Clone> {
    inner: RwLock<T>,
}

impl<T: Clone> CowCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Shared access to the committed value.
    ///
    /// Holding the guard also pins the value: no writer can publish until it
    /// is released.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Exclusive access with a staged copy to mutate.
    pub fn write(&self) -> CowWriteGuard<'_, T> {
        let guard = self.inner.write();
        let staged = guard.clone();
        CowWriteGuard { guard, staged }
    }
}

/// Write guard over a [`CowCell`]: the committed value stays readable while
/// the staged copy accumulates changes.
#[derive(Debug)]
pub struct CowWriteGuard<'a, T: Clone> {
    guard: RwLockWriteGuard<'a, T>,
    staged: T,
}

impl<T: Clone> CowWriteGuard<'_, T> {
    /// The committed value, as readers currently see it.
    pub fn data(&self) -> &T {
        &self.guard
    }

    /// The staged copy. Changes become visible only on
    /// [`CowWriteGuard::commit`].
    pub fn mutable_data(&mut self) -> &mut T {
        &mut self.staged
    }

    /// Publish the staged copy.
    pub fn commit(self) {
        let Self { mut guard, staged } = self;
        *guard = staged;
    }
}
