use crate::config::{Easing, Rect};
use std::time::{Duration, Instant};

/// Read-side view of the viewport animation, republished every logic tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportTransitionSnapshot {
    pub active: bool,
    pub from_mode: String,
    pub to_mode: String,
    pub progress: f32,
    pub rect: Rect,
}

impl ViewportTransitionSnapshot {
    pub fn idle(mode: &str, rect: Rect) -> Self {
        Self {
            active: false,
            from_mode: mode.to_string(),
            to_mode: mode.to_string(),
            progress: 1.0,
            rect,
        }
    }
}

/// Geometry animation between two modes. Only the logic thread advances it.
#[derive(Debug, Clone)]
pub struct ModeTransition {
    from_mode: String,
    to_mode: String,
    from: Rect,
    to: Rect,
    started: Instant,
    duration: Duration,
    easing: Easing,
    progress: f32,
}

impl ModeTransition {
    pub fn start(
        from_mode: impl Into<String>,
        from: Rect,
        to_mode: impl Into<String>,
        to: Rect,
        now: Instant,
        duration: Duration,
        easing: Easing,
    ) -> Self {
        Self {
            from_mode: from_mode.into(),
            to_mode: to_mode.into(),
            from,
            to,
            started: now,
            duration,
            easing,
            progress: if duration.is_zero() { 1.0 } else { 0.0 },
        }
    }

    pub fn to_mode(&self) -> &str {
        &self.to_mode
    }

    pub fn target(&self) -> Rect {
        self.to
    }

    /// Moves the end point, e.g. when the target mode's dimensions were edited mid-flight.
    pub fn retarget(&mut self, to: Rect) {
        self.to = to;
    }

    pub fn advance(&mut self, now: Instant) {
        if self.duration.is_zero() {
            self.progress = 1.0;
            return;
        }
        let elapsed = now.saturating_duration_since(self.started);
        self.progress = (elapsed.as_secs_f32() / self.duration.as_secs_f32()).min(1.0);
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }

    pub fn current_rect(&self) -> Rect {
        let t = self.easing.apply(self.progress);
        let lerp_i = |a: i32, b: i32| (a as f32 + (b - a) as f32 * t).round() as i32;
        let lerp_u = |a: u32, b: u32| (a as f32 + (b as f32 - a as f32) * t).round().max(1.0) as u32;
        Rect {
            x: lerp_i(self.from.x, self.to.x),
            y: lerp_i(self.from.y, self.to.y),
            width: lerp_u(self.from.width, self.to.width),
            height: lerp_u(self.from.height, self.to.height),
        }
    }

    pub fn snapshot(&self) -> ViewportTransitionSnapshot {
        ViewportTransitionSnapshot {
            active: !self.is_complete(),
            from_mode: self.from_mode.clone(),
            to_mode: self.to_mode.clone(),
            progress: self.progress,
            rect: self.current_rect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, width: u32) -> Rect {
        Rect { x, y: 0, width, height: 100 }
    }

    #[test]
    fn linear_midpoint_and_completion() {
        let t0 = Instant::now();
        let mut transition = ModeTransition::start(
            "a",
            rect(0, 100),
            "b",
            rect(100, 300),
            t0,
            Duration::from_millis(200),
            Easing::Linear,
        );

        transition.advance(t0 + Duration::from_millis(100));
        let mid = transition.snapshot();
        assert!(mid.active);
        assert_eq!(mid.rect.x, 50);
        assert_eq!(mid.rect.width, 200);

        transition.advance(t0 + Duration::from_millis(500));
        let done = transition.snapshot();
        assert!(!done.active);
        assert_eq!(done.rect, rect(100, 300));
        assert_eq!(done.to_mode, "b");
    }

    #[test]
    fn zero_duration_completes_immediately() {
        let t0 = Instant::now();
        let transition = ModeTransition::start("a", rect(0, 10), "b", rect(5, 20), t0, Duration::ZERO, Easing::EaseOutCubic);
        assert!(transition.is_complete());
        assert_eq!(transition.current_rect(), rect(5, 20));
    }
}
