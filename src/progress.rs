//! Shared progress state between a matching run and whoever polls it.
//!
//! The run is the only writer. Every write takes the lock once, so a poller
//! never sees a step description paired with the percentage of another step.

use crate::engine::RunSummary;
use crate::error::{MatchError, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressState {
    pub current_step: String,
    /// Step seen by the previous poll; drives the dot animation.
    pub previous_step: String,
    pub percent: u8,
    pub dot_count: u8,
    pub show_dots: bool,
    pub running: bool,
    pub button_disabled: bool,
    /// Set once, when the run completes successfully.
    pub result: Option<RunSummary>,
}

/// What a poller gets back on each tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressView {
    pub percent: u8,
    /// Current step, with the animated dots appended when enabled.
    pub step: String,
    pub running: bool,
    pub button_disabled: bool,
    /// Only present once the run reached 100%.
    pub result: Option<RunSummary>,
}

/// Cloneable handle to one run's progress state.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<Mutex<ProgressState>>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset to the initial state of a new run and mark it running.
    pub fn begin(&self, step: impl Into<String>) -> Result<()> {
        let mut state = self.lock();
        if state.running {
            return Err(MatchError::RunInProgress);
        }
        *state = ProgressState {
            current_step: step.into(),
            previous_step: String::new(),
            percent: 0,
            dot_count: 0,
            show_dots: true,
            running: true,
            button_disabled: true,
            result: None,
        };
        Ok(())
    }

    /// Move to a new step. The percentage never goes backwards.
    pub fn update(&self, step: impl Into<String>, percent: u8) {
        let mut state = self.lock();
        state.current_step = step.into();
        state.percent = state.percent.max(percent.min(100));
    }

    pub fn set_show_dots(&self, show: bool) {
        self.lock().show_dots = show;
    }

    /// Terminal success: 100%, result stored, polling can stop.
    pub fn finish(&self, step: impl Into<String>, summary: RunSummary) {
        let mut state = self.lock();
        state.current_step = step.into();
        state.percent = 100;
        state.show_dots = false;
        if state.result.is_none() {
            state.result = Some(summary);
        }
        state.running = false;
        state.button_disabled = false;
    }

    /// Terminal failure: not running, no result.
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.lock();
        state.current_step = message.into();
        state.show_dots = false;
        state.running = false;
        state.button_disabled = false;
    }

    /// Poller-side read; advances the dot animation by one frame.
    pub fn poll(&self) -> ProgressView {
        let mut state = self.lock();
        if state.current_step != state.previous_step {
            state.dot_count = 0;
        } else {
            state.dot_count = (state.dot_count + 1) % 4;
        }
        state.previous_step = state.current_step.clone();

        let mut step = state.current_step.clone();
        if state.show_dots {
            step.push_str(&".".repeat(state.dot_count as usize));
        }

        ProgressView {
            percent: state.percent,
            step,
            running: state.running,
            button_disabled: state.button_disabled,
            result: if state.percent >= 100 {
                state.result.clone()
            } else {
                None
            },
        }
    }

    pub fn snapshot(&self) -> ProgressState {
        self.lock().clone()
    }
}

/// Share of the overall bar reached after `done` of `total` files are parsed.
///
/// Parsing owns the first half of the range. Ties round to even.
pub fn parse_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 50;
    }
    ((done * 50) as f64 / total as f64).round_ties_even() as u8
}
