//! Virtual playback clock.
//!
//! Playback time is `stored + elapsed_real * rate` while a wall-clock base
//! is held, clamped to `[0, duration]`. The scheduler freezes the clock
//! (drops the base, keeps the Playing state) whenever the readahead window
//! is not buffered, so time only advances over data the client holds.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Paused,
    Playing,
}

#[derive(Debug)]
pub(crate) struct PlaybackClock {
    duration_ms: i64,
    stored_ms: f64,
    rate: f64,
    state: State,
    base: Option<Instant>,
}

impl PlaybackClock {
    pub fn new(duration_ms: i64) -> Self {
        Self {
            duration_ms,
            stored_ms: 0.0,
            rate: 1.0,
            state: State::Paused,
            base: None,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f64, now: Instant) {
        self.freeze(now);
        self.rate = rate;
        self.unfreeze(now);
    }

    pub fn current_ms(&self, now: Instant) -> i64 {
        let elapsed = self
            .base
            .map(|base| now.saturating_duration_since(base).as_secs_f64() * 1000.0 * self.rate)
            .unwrap_or(0.0);
        (self.stored_ms + elapsed).clamp(0.0, self.duration_ms as f64) as i64
    }

    pub fn is_playing(&self) -> bool {
        self.state == State::Playing
    }

    /// Playing but not advancing: waiting for data.
    pub fn is_frozen(&self) -> bool {
        self.state == State::Playing && self.base.is_none()
    }

    pub fn play(&mut self, now: Instant) {
        self.state = State::Playing;
        if self.base.is_none() {
            self.base = Some(now);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        self.stored_ms = self.current_ms(now) as f64;
        self.base = None;
        self.state = State::Paused;
    }

    /// Jump to an absolute target, or a rate-scaled offset from the current
    /// position. The clock is left unbased (buffering) until the scheduler
    /// confirms data under the new position.
    pub fn seek(&mut self, target_ms: i64, relative: bool, now: Instant) {
        let target = if relative {
            self.current_ms(now) as f64 + target_ms as f64 * self.rate
        } else {
            target_ms as f64
        };
        self.stored_ms = target.clamp(0.0, self.duration_ms as f64);
        self.base = None;
    }

    /// Stop advancing without leaving the Playing state.
    pub fn freeze(&mut self, now: Instant) {
        if self.base.is_some() {
            self.stored_ms = self.current_ms(now) as f64;
            self.base = None;
        }
    }

    /// Resume advancing if playing and currently frozen.
    pub fn unfreeze(&mut self, now: Instant) {
        if self.state == State::Playing && self.base.is_none() {
            self.base = Some(now);
        }
    }
}
