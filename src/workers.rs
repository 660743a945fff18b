//! Fixed-interval worker threads.

use crate::error::HostError;
use crate::{log_info, log_warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// One iteration of a worker loop.
pub trait Tick: Send + 'static {
    fn tick(&mut self, now: Instant);

    /// Runs on the worker thread after the last tick.
    fn shutdown(&mut self) {}
}

/// Average busy time and achieved rate, refreshed about once a second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickStats {
    pub ticks_per_sec: f32,
    pub busy_ms: f32,
}

pub struct WorkerHandle {
    name: String,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<Option<TickStats>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Option<TickStats> {
        *self.stats.lock()
    }

    /// Clears the stop flag and joins. The worker finishes its current tick first.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log_warn!("{} thread panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn spawn_ticking<W: Tick>(name: &str, interval: Duration, mut worker: W) -> Result<WorkerHandle, HostError> {
    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(Mutex::new(None));

    let running_flag = Arc::clone(&running);
    let stats_slot = Arc::clone(&stats);
    let thread_name = name.to_string();

    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            log_info!("{} thread started ({:?} interval)", thread_name, interval);

            let mut busy_total = Duration::ZERO;
            let mut ticks = 0u32;
            let mut last_stats_update = Instant::now();

            while running_flag.load(Ordering::Acquire) {
                let start = Instant::now();
                worker.tick(start);
                let busy = start.elapsed();

                busy_total += busy;
                ticks += 1;
                let since_update = last_stats_update.elapsed();
                if since_update >= Duration::from_secs(1) {
                    *stats_slot.lock() = Some(TickStats {
                        ticks_per_sec: ticks as f32 / since_update.as_secs_f32(),
                        busy_ms: busy_total.as_secs_f32() * 1000.0 / ticks as f32,
                    });
                    busy_total = Duration::ZERO;
                    ticks = 0;
                    last_stats_update = Instant::now();
                }

                if busy < interval {
                    spin_sleep::sleep(interval - busy);
                }
            }

            worker.shutdown();
            log_info!("{} thread ended", thread_name);
        })
        .map_err(|source| HostError::Spawn {
            name: name.to_string(),
            source,
        })?;

    Ok(WorkerHandle {
        name: name.to_string(),
        running,
        stats,
        thread: Some(thread),
    })
}
