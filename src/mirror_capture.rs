//! Mirror-capture thread: waits on fenced back-buffer copies and publishes
//! finished game frames to the render side.

use crate::frame_exchange::{ConsumeOutcome, FrameConsumer, GpuFrameExchange};
use crate::workers::Tick;
use crate::log_info;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MIRROR_CAPTURE_INTERVAL: Duration = Duration::from_millis(2);
/// Upper bound on a single fence wait so the stop flag is still polled.
pub const FENCE_WAIT_TIMEOUT: Duration = Duration::from_millis(8);

/// Finalizes captured game frames. The only thread that blocks on capture fences.
pub struct MirrorCaptureWorker {
    consumer: FrameConsumer,
    exchange: Arc<GpuFrameExchange>,
    log_timing: bool,
    last_outcome: ConsumeOutcome,
}

impl MirrorCaptureWorker {
    pub fn new(consumer: FrameConsumer, exchange: Arc<GpuFrameExchange>, log_timing: bool) -> Self {
        Self {
            consumer,
            exchange,
            log_timing,
            last_outcome: ConsumeOutcome::Idle,
        }
    }

    pub fn last_outcome(&self) -> ConsumeOutcome {
        self.last_outcome
    }
}

impl Tick for MirrorCaptureWorker {
    fn tick(&mut self, _now: Instant) {
        // Keep finalizing while frames are queued; each wait blocks only this thread.
        loop {
            let started = Instant::now();
            let outcome = self.consumer.poll(FENCE_WAIT_TIMEOUT);
            self.last_outcome = outcome;
            match outcome {
                ConsumeOutcome::Finalized(frame) => {
                    if self.log_timing {
                        log_info!(
                            "Frame {} ready after {:?} ({}x{})",
                            frame.frame_number,
                            started.elapsed(),
                            frame.width,
                            frame.height
                        );
                    }
                }
                ConsumeOutcome::Idle | ConsumeOutcome::Pending | ConsumeOutcome::DeviceLost => break,
            }
        }
    }

    fn shutdown(&mut self) {
        self.consumer.drain();
        self.exchange.request_teardown();
        let stats = self.exchange.stats();
        log_info!(
            "Mirror capture stopped: {} submitted, {} finalized, {} skipped busy, {} skipped full, {} device lost",
            stats.submitted,
            stats.finalized,
            stats.skipped_busy,
            stats.skipped_full,
            stats.device_lost
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_exchange::{frame_channel, SubmitOutcome};
    use crate::gpu::{HeadlessGpu, RenderGpu};

    #[test]
    fn tick_finalizes_and_shutdown_requests_teardown() {
        let mut gpu = HeadlessGpu::new(128, 72);
        let exchange = Arc::new(GpuFrameExchange::new());
        let (mut producer, consumer) = frame_channel(Arc::clone(&exchange), gpu.timeline(), 4);
        let mut worker = MirrorCaptureWorker::new(consumer, Arc::clone(&exchange), true);

        assert!(matches!(producer.submit(&mut gpu), SubmitOutcome::Submitted(_)));
        worker.tick(Instant::now());
        assert!(matches!(worker.last_outcome(), ConsumeOutcome::Idle));
        assert_eq!(exchange.ready_width(), 128);

        worker.shutdown();
        assert!(exchange.teardown_pending());
        assert_eq!(producer.submit(&mut gpu), SubmitOutcome::TornDown);
        assert_eq!(gpu.live_textures(), 0);
    }
}
