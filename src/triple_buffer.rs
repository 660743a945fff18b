//! Write/ready/back buffer exchange between one capturing and one uploading thread.
//!
//! The writer fills its private buffer and swaps it with `ready`. The reader,
//! when it sees `fresh`, swaps `ready` with its private back buffer. Both swaps
//! happen under the same short lock; neither side holds it while copying pixels.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Shared<T> {
    ready: Mutex<T>,
    fresh: AtomicBool,
}

pub struct TripleWriter<T> {
    write: T,
    shared: Arc<Shared<T>>,
}

pub struct TripleReader<T> {
    back: T,
    shared: Arc<Shared<T>>,
}

pub fn triple_buffer<T: Default>() -> (TripleWriter<T>, TripleReader<T>) {
    let shared = Arc::new(Shared {
        ready: Mutex::new(T::default()),
        fresh: AtomicBool::new(false),
    });
    (
        TripleWriter {
            write: T::default(),
            shared: Arc::clone(&shared),
        },
        TripleReader {
            back: T::default(),
            shared,
        },
    )
}

impl<T> TripleWriter<T> {
    pub fn buffer(&self) -> &T {
        &self.write
    }

    pub fn buffer_mut(&mut self) -> &mut T {
        &mut self.write
    }

    /// Makes the write buffer the new ready frame. An unconsumed ready frame
    /// comes back as the next write buffer.
    pub fn publish(&mut self) {
        let mut ready = self.shared.ready.lock();
        std::mem::swap(&mut self.write, &mut *ready);
        self.shared.fresh.store(true, Ordering::Release);
    }

    pub fn reader_alive(&self) -> bool {
        Arc::strong_count(&self.shared) > 1
    }
}

impl<T> TripleReader<T> {
    pub fn has_fresh(&self) -> bool {
        self.shared.fresh.load(Ordering::Acquire)
    }

    /// Returns the newly published frame, or `None` if nothing was published
    /// since the last call.
    pub fn take(&mut self) -> Option<&T> {
        if !self.shared.fresh.load(Ordering::Acquire) {
            return None;
        }
        {
            let mut ready = self.shared.ready.lock();
            std::mem::swap(&mut self.back, &mut *ready);
            self.shared.fresh.store(false, Ordering::Release);
        }
        Some(&self.back)
    }

    /// The frame returned by the last successful `take`.
    pub fn back(&self) -> &T {
        &self.back
    }

    pub fn writer_alive(&self) -> bool {
        Arc::strong_count(&self.shared) > 1
    }
}
