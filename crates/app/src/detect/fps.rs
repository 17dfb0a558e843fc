use std::time::{Duration, Instant};

/// Frames-per-second over fixed one-second windows.
#[derive(Debug)]
pub(crate) struct FpsMeter {
    window: Duration,
    window_start: Instant,
    frames: u32,
    current: f32,
}

impl FpsMeter {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            window: Duration::from_secs(1),
            window_start: now,
            frames: 0,
            current: 0.0,
        }
    }

    /// Count one frame. Returns the new rate when a window closes.
    pub(crate) fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }
        self.current = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(self.current)
    }

    /// Rate measured over the last closed window.
    pub(crate) fn current(&self) -> f32 {
        self.current
    }
}
