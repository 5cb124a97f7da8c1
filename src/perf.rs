//! Rolling performance counters.
//!
//! A counter instance holds a matrix of values: one row per key, one
//! column per history interval, column 0 being the interval currently
//! accumulating.  On rollover the columns shift right; keys flagged
//! `preserve` carry their value into the new interval (sizes, limits),
//! the rest restart from zero (event counts).

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{PvfsError, PvfsResult};
use crate::types::epoch_millis;

/// Default interval between history rollovers.
pub const PERF_DEFAULT_TIME_INTERVAL_SECS: u64 = 300;
/// Default number of history intervals kept.
pub const PERF_DEFAULT_HISTORY_SIZE: usize = 6;

/// A single counter key.
#[derive(Clone, Copy, Debug)]
pub struct PerfKey {
    pub name: &'static str,
    /// Carry the value across rollover instead of resetting to zero.
    pub preserve: bool,
}

/// Measurement operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerfOp {
    Add,
    Sub,
    Set,
}

struct Samples {
    /// `matrix[key][interval]`; interval 0 is accumulating.
    matrix: Vec<Vec<i64>>,
    /// Wall-clock start of each interval, milliseconds since epoch.
    start_ms: Vec<u64>,
    history: usize,
    interval: Duration,
    rolled_at: Instant,
}

/// A rolling histogram of named counters.
pub struct PerfCounter {
    keys: &'static [PerfKey],
    samples: Mutex<Samples>,
}

impl PerfCounter {
    pub fn new(keys: &'static [PerfKey]) -> PerfCounter {
        let history = PERF_DEFAULT_HISTORY_SIZE;
        let mut start_ms = vec![0; history];
        start_ms[0] = epoch_millis();
        PerfCounter {
            keys,
            samples: Mutex::new(Samples {
                matrix: vec![vec![0; history]; keys.len()],
                start_ms,
                history,
                interval: Duration::from_secs(PERF_DEFAULT_TIME_INTERVAL_SECS),
                rolled_at: Instant::now(),
            }),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Apply a measurement to the current interval.
    pub fn count(&self, key: usize, value: i64, op: PerfOp) {
        let mut s = self.samples.lock();
        if key >= self.keys.len() {
            return;
        }
        let cell = &mut s.matrix[key][0];
        match op {
            PerfOp::Add => *cell += value,
            PerfOp::Sub => *cell -= value,
            PerfOp::Set => *cell = value,
        }
    }

    /// Value of a key in the accumulating interval.
    pub fn current(&self, key: usize) -> i64 {
        let s = self.samples.lock();
        s.matrix.get(key).map(|row| row[0]).unwrap_or(0)
    }

    /// Value of a key `age` intervals back (0 = current).
    pub fn sample(&self, key: usize, age: usize) -> Option<i64> {
        let s = self.samples.lock();
        s.matrix.get(key).and_then(|row| row.get(age)).copied()
    }

    /// Shift the history window by one interval.
    pub fn rollover(&self) {
        let mut s = self.samples.lock();
        self.rollover_locked(&mut s);
    }

    fn rollover_locked(&self, s: &mut Samples) {
        if s.history < 2 {
            // a single interval has nowhere to roll
            s.rolled_at = Instant::now();
            return;
        }
        for (key, row) in s.matrix.iter_mut().enumerate() {
            row.rotate_right(1);
            row[0] = if self.keys[key].preserve { row[1] } else { 0 };
        }
        s.start_ms.rotate_right(1);
        s.start_ms[0] = epoch_millis();
        s.rolled_at = Instant::now();
    }

    /// Roll the window if the configured interval has elapsed.  The
    /// dispatcher calls this cooperatively from its main loop; returns
    /// whether a rollover happened.
    pub fn maybe_rollover(&self) -> bool {
        let mut s = self.samples.lock();
        if s.rolled_at.elapsed() >= s.interval {
            self.rollover_locked(&mut s);
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.samples.lock().interval
    }

    pub fn set_interval(&self, interval: Duration) {
        self.samples.lock().interval = interval;
    }

    pub fn history_size(&self) -> usize {
        self.samples.lock().history
    }

    /// Resize the history window.  Shrinking discards the oldest
    /// intervals; growing appends zeroed ones.
    pub fn set_history_size(&self, history: usize) -> PvfsResult<()> {
        if history == 0 {
            return Err(PvfsError::EINVAL);
        }
        let mut s = self.samples.lock();
        for row in &mut s.matrix {
            row.resize(history, 0);
        }
        s.start_ms.resize(history, 0);
        s.history = history;
        Ok(())
    }

    /// Reset every value in every interval.
    pub fn reset(&self) {
        let mut s = self.samples.lock();
        for row in &mut s.matrix {
            row.iter_mut().for_each(|v| *v = 0);
        }
    }

    /// Render the counter matrix as text, one row per key, newest
    /// interval first.  This is what the perf-count upcall returns.
    pub fn text(&self) -> String {
        let s = self.samples.lock();
        let mut out = String::new();
        let _ = write!(out, "{:<24}", "Start times (ms):");
        for ms in &s.start_ms {
            let _ = write!(out, " {:>12}", ms);
        }
        out.push('\n');
        for (key, row) in self.keys.iter().zip(&s.matrix) {
            let _ = write!(out, "{:<24}", key.name);
            for value in row {
                let _ = write!(out, " {:>12}", value);
            }
            out.push('\n');
        }
        out
    }
}
