use crate::{SpinLock, SpinLockGuard};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Deref;

/// Keeps each stripe on its own cache line.
#[repr(align(64))]
struct Padded<T>(T);

impl<T> Deref for Padded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// A fixed pool of spin locks selected by key.
///
/// Many logical objects share one of `len()` locks; two keys that map to
/// the same stripe serialize, keys on different stripes never contend.
/// The pool is sized once and never grows.
pub struct StripedLocks<T> {
    stripes: Box<[Padded<SpinLock<T>>]>,
}

impl<T> StripedLocks<T> {
    /// Builds `count` stripes, initializing stripe `i` with `init(i)`.
    ///
    /// # Panics
    /// If `count` is zero.
    pub fn new(count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        assert!(count > 0, "a lock pool needs at least one stripe");
        let stripes: Vec<_> = (0..count).map(|i| Padded(SpinLock::new(init(i)))).collect();
        Self {
            stripes: stripes.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    /// The stripe responsible for `key`.
    #[inline]
    pub fn stripe(&self, key: usize) -> &SpinLock<T> {
        &self.stripes[key % self.stripes.len()]
    }

    /// Locks the stripe responsible for `key`.
    #[inline]
    pub fn lock(&self, key: usize) -> SpinLockGuard<'_, T> {
        self.stripe(key).lock()
    }

    /// Iterates all stripes in index order.
    pub fn iter(&self) -> impl Iterator<Item = &SpinLock<T>> {
        self.stripes.iter().map(|p| &p.0)
    }
}
