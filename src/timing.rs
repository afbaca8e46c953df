//! Per-shard phase timers and the worker phase machine.
//!
//! Timing collection always runs (it is cheap); the report itself is gated
//! by the pipeline's verbosity flag and goes through the `log` facade.

use std::fmt;
use std::time::{Duration, Instant};

/// Phases a shard worker moves through, strictly forward. There are no
/// retries; a failure in any phase aborts the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerPhase {
    Idle,
    Deserializing,
    Materializing,
    ConstructingTables,
    Optimizing,
    Emitting,
    Done,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerPhase::Idle => "idle",
            WorkerPhase::Deserializing => "deserializing",
            WorkerPhase::Materializing => "materializing",
            WorkerPhase::ConstructingTables => "constructing tables",
            WorkerPhase::Optimizing => "optimizing",
            WorkerPhase::Emitting => "emitting",
            WorkerPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Tracks the current phase of one worker, enforcing forward-only moves.
#[derive(Debug)]
pub struct PhaseTracker {
    current: WorkerPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        PhaseTracker {
            current: WorkerPhase::Idle,
        }
    }

    pub fn current(&self) -> WorkerPhase {
        self.current
    }

    pub fn advance(&mut self, next: WorkerPhase) {
        debug_assert!(next > self.current, "worker phase moved backwards");
        self.current = next;
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        PhaseTracker::new()
    }
}

/// Accumulated wall time for one named phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseTimer {
    pub elapsed: Duration,
}

impl PhaseTimer {
    /// Run `f`, adding its wall time to this timer.
    pub fn time<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = f();
        self.elapsed += start.elapsed();
        out
    }
}

/// Timers for every phase of one shard, including the backend-side ones.
#[derive(Debug, Default)]
pub struct ShardTimers {
    pub shard: usize,
    pub deserialize: PhaseTimer,
    pub materialize: PhaseTimer,
    pub construct: PhaseTimer,
    pub unopt: PhaseTimer,
    pub optimize: PhaseTimer,
    pub opt: PhaseTimer,
    pub obj: PhaseTimer,
    pub asm: PhaseTimer,
}

impl ShardTimers {
    pub fn new(shard: usize) -> Self {
        ShardTimers {
            shard,
            ..ShardTimers::default()
        }
    }

    fn rows(&self) -> [(&'static str, Duration); 8] {
        [
            ("deserialize", self.deserialize.elapsed),
            ("materialize", self.materialize.elapsed),
            ("construct", self.construct.elapsed),
            ("unopt", self.unopt.elapsed),
            ("optimize", self.optimize.elapsed),
            ("opt", self.opt.elapsed),
            ("obj", self.obj.elapsed),
            ("asm", self.asm.elapsed),
        ]
    }

    /// Log per-phase timings for this shard. Phases that never ran are
    /// skipped.
    pub fn report(&self) {
        let total: Duration = self.rows().iter().map(|(_, d)| *d).sum();
        log::info!("shard {} timings (total {:.3}s):", self.shard, total.as_secs_f64());
        for (name, elapsed) in self.rows() {
            if !elapsed.is_zero() {
                log::info!("  {:.3}s  {}", elapsed.as_secs_f64(), name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_forward() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(WorkerPhase::Deserializing);
        tracker.advance(WorkerPhase::Materializing);
        tracker.advance(WorkerPhase::ConstructingTables);
        tracker.advance(WorkerPhase::Optimizing);
        tracker.advance(WorkerPhase::Emitting);
        tracker.advance(WorkerPhase::Done);
        assert_eq!(tracker.current(), WorkerPhase::Done);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_phase_cannot_move_backwards() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(WorkerPhase::Optimizing);
        tracker.advance(WorkerPhase::Materializing);
    }

    #[test]
    fn test_timer_accumulates() {
        let mut timer = PhaseTimer::default();
        let v = timer.time(|| 40 + 2);
        assert_eq!(v, 42);
        timer.time(|| std::thread::sleep(Duration::from_millis(1)));
        assert!(timer.elapsed >= Duration::from_millis(1));
    }
}
