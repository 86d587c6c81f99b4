//! Per-phase progress reporting and cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unit of work a progress value refers to. Each phase runs 0 → 100 on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Encoding reference images into a training corpus.
    Encoding,
    Filtering,
    Sorting,
    Copying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Encoding => "encoding",
            Self::Filtering => "filtering",
            Self::Sorting => "sorting",
            Self::Copying => "copying",
        })
    }
}

/// Receives progress updates. Purely observational.
pub trait ProgressSink {
    fn report(&mut self, phase: Phase, percent: f32);
}

impl<F: FnMut(Phase, f32)> ProgressSink for F {
    fn report(&mut self, phase: Phase, percent: f32) {
        self(phase, percent)
    }
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _phase: Phase, _percent: f32) {}
}

/// Turns "done n of total" into non-decreasing percentages ending at 100.
pub struct PhaseProgress<'a> {
    sink: &'a mut dyn ProgressSink,
    phase: Phase,
    total: usize,
    done: usize,
}

impl<'a> PhaseProgress<'a> {
    pub fn start(sink: &'a mut dyn ProgressSink, phase: Phase, total: usize) -> Self {
        Self {
            sink,
            phase,
            total,
            done: 0,
        }
    }

    /// One more unit finished.
    pub fn advance(&mut self) {
        self.done = (self.done + 1).min(self.total);
        let percent = if self.total == 0 {
            100.0
        } else {
            (self.done * 100) as f32 / self.total as f32
        };
        self.sink.report(self.phase, percent);
    }

    /// Report a fraction in [0, 1] from a collaborator with its own counting.
    pub fn fraction(&mut self, fraction: f32) {
        self.sink.report(self.phase, fraction.clamp(0.0, 1.0) * 100.0);
    }

    /// Final update. Always exactly 100, also for an empty phase.
    pub fn finish(self) {
        self.sink.report(self.phase, 100.0);
    }
}

/// Shared flag polled before each unit of work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
