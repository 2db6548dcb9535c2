//! # Kernel synchronization primitives
//!
//! Spin-based building blocks for code that must never sleep while holding a
//! lock:
//!
//! * [`SpinLock`]: a data-owning TATAS lock.
//! * [`StripedLocks`]: a fixed pool of [`SpinLock`]s selected by key, for
//!   spreading many small critical sections over a bounded number of locks.
//! * [`RawRwSpin`]: a data-less shared/exclusive lock word with try-lock
//!   operations, suitable for embedding in per-frame descriptors.
//! * [`PublishArray`]: append-only storage readers can scan without locks.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod publish_array;
mod rw_spin;
mod spin_lock;
mod striped;

pub use publish_array::PublishArray;
pub use rw_spin::RawRwSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use striped::StripedLocks;
