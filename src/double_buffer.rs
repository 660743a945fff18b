//! Two-slot cache with an atomic selector.
//!
//! A single producer writes the slot readers are not pointed at and then flips
//! the selector. Each slot holds an immutable `Arc<T>`, so a reader that loaded
//! the old index just before a flip still holds a complete value. It never sees
//! fields from two different refreshes.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct DoubleBuffer<T> {
    slots: [ArcSwapOption<T>; 2],
    active: AtomicUsize,
    generation: AtomicU64,
    seed_lock: Mutex<()>,
}

impl<T> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DoubleBuffer<T> {
    pub fn new() -> Self {
        Self {
            slots: [ArcSwapOption::empty(), ArcSwapOption::empty()],
            active: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            seed_lock: Mutex::new(()),
        }
    }

    /// Producer side. Writes the inactive slot, then exposes it.
    pub fn refresh(&self, value: T) {
        let inactive = 1 - self.active.load(Ordering::Acquire);
        self.slots[inactive].store(Some(Arc::new(value)));
        self.active.store(inactive, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn read(&self) -> Option<Arc<T>> {
        let index = self.active.load(Ordering::Acquire);
        self.slots[index].load_full()
    }

    /// Startup path: returns the cached value, or computes one and seeds the
    /// empty slots when no refresh has happened yet. A refresh that lands while
    /// `init` runs wins over the seed.
    pub fn read_or_init(&self, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(value) = self.read() {
            return value;
        }

        let _seeding = self.seed_lock.lock();
        if let Some(value) = self.read() {
            return value;
        }

        let value = Arc::new(init());
        let index = self.active.load(Ordering::Acquire);
        let previous = self.slots[index].compare_and_swap(&None::<Arc<T>>, Some(Arc::clone(&value)));
        if previous.is_none() {
            let _ = self.slots[1 - index].compare_and_swap(&None::<Arc<T>>, Some(Arc::clone(&value)));
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.read().unwrap_or(value)
    }

    /// Number of completed refreshes, including the startup seed.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Debug)]
    struct Wide {
        a: u64,
        b: u64,
        c: u64,
        d: u64,
    }

    #[test]
    fn empty_until_first_refresh() {
        let buffer: DoubleBuffer<u32> = DoubleBuffer::new();
        assert!(buffer.read().is_none());
        buffer.refresh(7);
        assert_eq!(*buffer.read().unwrap(), 7);
        buffer.refresh(8);
        assert_eq!(*buffer.read().unwrap(), 8);
        assert_eq!(buffer.generation(), 2);
    }

    #[test]
    fn read_or_init_seeds_once() {
        let buffer: DoubleBuffer<String> = DoubleBuffer::new();
        let first = buffer.read_or_init(|| "computed".to_string());
        let second = buffer.read_or_init(|| unreachable!("already seeded"));
        assert_eq!(*first, "computed");
        assert!(Arc::ptr_eq(&first, &second));

        buffer.refresh("refreshed".to_string());
        assert_eq!(*buffer.read_or_init(|| unreachable!()), "refreshed");
    }

    #[test]
    fn concurrent_reads_never_mix_refreshes() {
        let buffer = Arc::new(DoubleBuffer::new());
        buffer.refresh(Wide { a: 0, b: 0, c: 0, d: 0 });
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        let value = buffer.read().unwrap();
                        assert!(value.a == value.b && value.b == value.c && value.c == value.d, "torn read: {:?}", value);
                    }
                })
            })
            .collect();

        for n in 1..=20_000u64 {
            buffer.refresh(Wide { a: n, b: n, c: n, d: n });
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.read().unwrap().a, 20_000);
    }

    #[test]
    fn refresh_during_seed_is_not_overwritten() {
        let buffer: DoubleBuffer<u32> = DoubleBuffer::new();
        let seeded = buffer.read_or_init(|| {
            buffer.refresh(2560);
            1920
        });
        assert_eq!(*seeded, 2560);
        assert_eq!(*buffer.read().unwrap(), 2560);
        assert_eq!(buffer.generation(), 1);

        buffer.refresh(3840);
        assert_eq!(*buffer.read().unwrap(), 3840);
    }
}
