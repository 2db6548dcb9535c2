use alloc::boxed::Box;
use alloc::vec::Vec;
use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

/// 0 = EMPTY, 1 = WRITING, 2 = READY
const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity, append-only array with publish-after-init semantics.
///
/// A value becomes visible to readers only after it has been fully written:
/// the writer fills the slot, then marks it `READY` with `Release`; readers
/// check `READY` with `Acquire`. Readers never lock and never observe a
/// partially built element. Elements are never removed.
pub struct PublishArray<T> {
    slots: Box<[Slot<T>]>,
    claimed: AtomicUsize,
}

// Safety: shared after READY; each slot has exactly one writer.
unsafe impl<T: Send + Sync> Sync for PublishArray<T> {}
unsafe impl<T: Send> Send for PublishArray<T> {}

impl<T> PublishArray<T> {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let slots: Vec<_> = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(EMPTY),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            claimed: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots handed out so far (published or still being written).
    #[inline]
    pub fn len(&self) -> usize {
        self.claimed.load(Ordering::Acquire).min(self.slots.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `value`, returning its index, or gives it back when full.
    ///
    /// # Errors
    /// Returns `Err(value)` if every slot is taken.
    pub fn push(&self, value: T) -> Result<usize, T> {
        let idx = self.claimed.fetch_add(1, Ordering::AcqRel);
        let Some(slot) = self.slots.get(idx) else {
            self.claimed.fetch_sub(1, Ordering::AcqRel);
            return Err(value);
        };

        // We are the only writer of this slot.
        slot.state.store(WRITING, Ordering::Relaxed);
        unsafe {
            (*slot.value.get()).write(value);
        }
        // Publish value before marking READY
        slot.state.store(READY, Ordering::Release);
        Ok(idx)
    }

    /// Returns `Some(&T)` if slot `idx` has been published.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&T> {
        let slot = self.slots.get(idx)?;
        if slot.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY guarantees the write is done
            Some(unsafe { &*(*slot.value.get()).as_ptr() })
        } else {
            None
        }
    }

    /// Iterates published elements in index order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len()).filter_map(|i| self.get(i))
    }
}

impl<T> Drop for PublishArray<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if *slot.state.get_mut() == READY {
                // SAFETY: READY slots hold an initialized value, dropped exactly once.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}
