//! Lock-free single-producer/single-consumer ring for frame-ready notifications.
//!
//! The render thread pushes, the mirror-capture thread pops. Neither side ever
//! waits on the other: a full ring makes `push` hand the item back so the
//! producer can drop that frame, an empty ring makes `pop` return `None`.
//!
//! `head` is written only by the producer and `tail` only by the consumer. The
//! producer writes the slot, then publishes it with a release store of `head`;
//! the consumer's acquire load of `head` makes the slot contents visible. The
//! consumer hands the slot back the same way through `tail`.

use crate::gpu::{FenceValue, TextureId};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Frame descriptor handed from the render thread to the mirror-capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureNotification {
    pub texture: TextureId,
    pub fence: FenceValue,
    pub width: u32,
    pub height: u32,
    /// Which of the two rotating capture textures `texture` is.
    pub slot: usize,
    pub frame_number: u64,
}

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: a slot is accessed by at most one side at a time. The consumer only
// reads slots in [tail, head), the producer only writes the slot at head, and
// ownership moves through the release/acquire pairs on head and tail.
unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Ring<T> {
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.mask
    }
}

pub struct CaptureSender<T> {
    ring: Arc<Ring<T>>,
}

pub struct CaptureReceiver<T> {
    ring: Arc<Ring<T>>,
}

/// Builds a ring with `capacity` slots (rounded up to a power of two, at least 2).
/// One slot always stays empty, so `capacity - 1` items fit.
pub fn capture_queue<T: Copy + Send>(capacity: usize) -> (CaptureSender<T>, CaptureReceiver<T>) {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let ring = Arc::new(Ring {
        slots,
        mask: capacity - 1,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });

    (
        CaptureSender { ring: Arc::clone(&ring) },
        CaptureReceiver { ring },
    )
}

impl<T: Copy + Send> CaptureSender<T> {
    /// Returns the item back when the ring is full. Nothing is overwritten.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let next = (head + 1) & ring.mask;
        if next == ring.tail.load(Ordering::Acquire) {
            return Err(item);
        }

        // SAFETY: `head` is not in [tail, head), so the consumer is not reading it.
        unsafe {
            (*ring.slots[head].get()).write(item);
        }
        ring.head.store(next, Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        let ring = &*self.ring;
        let next = (ring.head.load(Ordering::Relaxed) + 1) & ring.mask;
        next == ring.tail.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.mask
    }
}

impl<T: Copy + Send> CaptureReceiver<T> {
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        if tail == ring.head.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: the acquire load above observed the producer's write of this slot.
        let item = unsafe { (*ring.slots[tail].get()).assume_init_read() };
        ring.tail.store((tail + 1) & ring.mask, Ordering::Release);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
