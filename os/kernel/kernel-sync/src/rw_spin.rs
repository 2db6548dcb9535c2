use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const EXCLUSIVE: u32 = u32::MAX;

/// Shared/exclusive lock word without attached data.
///
/// Used where the protected state is spread over atomics that are only
/// *written* by the exclusive holder, e.g. a physical frame descriptor.
///
/// State encoding:
/// * `0`: unlocked
/// * `u32::MAX`: held exclusively
/// * `n`: held shared by `n` readers
#[derive(Debug)]
pub struct RawRwSpin {
    state: AtomicU32,
}

impl Default for RawRwSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Attempts to take the lock exclusively without spinning.
    #[inline]
    pub fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spins until the lock is held exclusively.
    #[inline]
    pub fn lock_exclusive(&self) {
        while !self.try_lock_exclusive() {
            while self.state.load(Ordering::Relaxed) != UNLOCKED {
                spin_loop();
            }
        }
    }

    /// Attempts to join the shared holders without spinning.
    ///
    /// Fails if the lock is held exclusively.
    #[inline]
    pub fn try_lock_shared(&self) -> bool {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur == EXCLUSIVE || cur == EXCLUSIVE - 1 {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Releases an exclusive hold.
    ///
    /// # Panics
    /// In debug builds, if the lock was not held exclusively.
    #[inline]
    pub fn unlock_exclusive(&self) {
        let prev = self.state.swap(UNLOCKED, Ordering::Release);
        debug_assert_eq!(prev, EXCLUSIVE, "unlock_exclusive on a lock not held exclusively");
    }

    /// Releases one shared hold.
    ///
    /// # Panics
    /// In debug builds, if the lock was not held shared.
    #[inline]
    pub fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(
            prev != UNLOCKED && prev != EXCLUSIVE,
            "unlock_shared on a lock not held shared"
        );
    }

    /// Turns an exclusive hold into a single shared hold.
    #[inline]
    pub fn downgrade(&self) {
        let prev = self.state.swap(1, Ordering::Release);
        debug_assert_eq!(prev, EXCLUSIVE, "downgrade of a lock not held exclusively");
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) == EXCLUSIVE
    }

    /// Number of shared holders, `0` when unlocked or held exclusively.
    #[inline]
    pub fn shared_count(&self) -> u32 {
        match self.state.load(Ordering::Relaxed) {
            EXCLUSIVE => 0,
            n => n,
        }
    }
}
