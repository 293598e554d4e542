//! Completion arbitration
//!
//! A generation is done when the model stream has ended and every published
//! turn has settled. Turns may never settle (an observer-side update lost, a
//! turn stuck streaming), so a grace timer forces completion once the model
//! is done, and a hard ceiling bounds the whole generation.
//!
//! The arbiter does no I/O and never reads the clock: callers pass `now` and
//! sleep until [`CompletionArbiter::next_deadline`].

use crate::transport::TurnProgress;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// `forced` when the grace timer fired before turns settled
    Complete { forced: bool },
    HardTimeout,
}

pub struct CompletionArbiter {
    model_done: bool,
    turns_done: bool,
    tracking_started: bool,
    grace: Duration,
    grace_deadline: Option<Instant>,
    hard_deadline: Option<Instant>,
    tracking: Option<watch::Receiver<TurnProgress>>,
    verdict: Option<Verdict>,
    torn_down: bool,
}

impl CompletionArbiter {
    pub fn new(
        now: Instant,
        grace: Duration,
        hard_timeout: Duration,
        tracking: Option<watch::Receiver<TurnProgress>>,
    ) -> Self {
        Self {
            model_done: false,
            turns_done: false,
            tracking_started: false,
            grace,
            grace_deadline: None,
            hard_deadline: Some(now + hard_timeout),
            tracking,
            verdict: None,
            torn_down: false,
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// The model stream ended with nothing left to resume
    pub fn model_finished(&mut self, now: Instant) -> Option<Verdict> {
        if self.verdict.is_some() {
            return None;
        }
        self.model_done = true;
        if let Some(rx) = self.tracking.as_mut() {
            let progress = *rx.borrow_and_update();
            self.apply(progress);
        }
        self.evaluate(now)
    }

    /// Fold in a tracking update
    pub fn observe(&mut self, progress: TurnProgress, now: Instant) -> Option<Verdict> {
        if self.verdict.is_some() {
            return None;
        }
        self.apply(progress);
        self.evaluate(now)
    }

    /// Called when [`Self::next_deadline`] has passed
    pub fn on_deadline(&mut self, now: Instant) -> Option<Verdict> {
        if self.verdict.is_some() {
            return None;
        }
        if self.grace_deadline.is_some_and(|d| now >= d)
            && !self.hard_deadline.is_some_and(|d| now >= d)
        {
            self.turns_done = true;
            return self.decide(Verdict::Complete { forced: true });
        }
        self.evaluate(now)
    }

    /// Earliest pending deadline; `None` after a verdict or teardown
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.verdict.is_some() || self.torn_down {
            return None;
        }
        match (self.grace_deadline, self.hard_deadline) {
            (Some(g), Some(h)) => Some(g.min(h)),
            (g, h) => g.or(h),
        }
    }

    /// Wait for the next tracking update.
    ///
    /// Pends forever when there is no subscription, so it can sit in a
    /// `select!` unconditionally.
    pub async fn tracking_changed(&mut self) -> TurnProgress {
        let Some(rx) = self.tracking.as_mut() else {
            return std::future::pending().await;
        };
        let changed = rx.changed().await;
        match changed {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => {
                self.tracking = None;
                std::future::pending().await
            }
        }
    }

    /// Release the tracking subscription and clear both deadlines.
    ///
    /// Returns true the first time; later calls do nothing.
    pub fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        self.tracking = None;
        self.grace_deadline = None;
        self.hard_deadline = None;
        true
    }

    fn apply(&mut self, progress: TurnProgress) {
        if progress.tracked {
            self.tracking_started = true;
        }
        self.turns_done = progress.all_terminal;
    }

    fn evaluate(&mut self, now: Instant) -> Option<Verdict> {
        if self.torn_down {
            return None;
        }
        if self.hard_deadline.is_some_and(|d| now >= d) {
            return self.decide(Verdict::HardTimeout);
        }
        if self.model_done && (self.turns_done || !self.tracking_started) {
            return self.decide(Verdict::Complete { forced: false });
        }
        if self.model_done && self.grace_deadline.is_none() {
            self.grace_deadline = Some(now + self.grace);
        }
        None
    }

    fn decide(&mut self, verdict: Verdict) -> Option<Verdict> {
        if self.torn_down || self.verdict.is_some() {
            return None;
        }
        self.verdict = Some(verdict);
        self.grace_deadline = None;
        self.hard_deadline = None;
        Some(verdict)
    }
}
