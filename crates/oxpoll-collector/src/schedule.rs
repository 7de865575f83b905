//! Per-collector schedule wheel: a small ordered list of named tasks,
//! each with its own cadence. Consecutive failures widen the effective
//! interval exponentially up to a standby ceiling; the first success
//! restores normal cadence.

use oxpoll_common::error::{Error, Result};
use std::time::{Duration, Instant};

const DEFAULT_STANDBY_CEILING: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct Task {
    name: String,
    interval: Duration,
    next: Instant,
}

#[derive(Debug)]
pub struct Schedule {
    tasks: Vec<Task>,
    consecutive_failures: u32,
    ceiling: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule {
    pub fn new() -> Self {
        Schedule {
            tasks: Vec::new(),
            consecutive_failures: 0,
            ceiling: DEFAULT_STANDBY_CEILING,
        }
    }

    pub fn with_ceiling(ceiling: Duration) -> Self {
        Schedule {
            ceiling,
            ..Schedule::new()
        }
    }

    /// Registers a task due immediately. Task names are unique.
    pub fn add_task(&mut self, name: impl Into<String>, interval: Duration) -> Result<()> {
        let name = name.into();
        if self.tasks.iter().any(|t| t.name == name) {
            return Err(Error::Config(format!("schedule task {name:?} added twice")));
        }
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "schedule task {name:?} has zero interval"
            )));
        }
        self.tasks.push(Task {
            name,
            interval,
            next: Instant::now(),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Earliest-due task and how long until it is due (zero if overdue).
    pub fn next_due(&self) -> Option<(String, Duration)> {
        let now = Instant::now();
        self.tasks
            .iter()
            .min_by_key(|t| t.next)
            .map(|t| (t.name.clone(), t.next.saturating_duration_since(now)))
    }

    /// Re-arms a task after its handler ran, applying the current backoff.
    pub fn complete(&mut self, name: &str) {
        let interval = match self.tasks.iter().find(|t| t.name == name) {
            Some(task) => self.effective(task.interval),
            None => return,
        };
        if let Some(task) = self.tasks.iter_mut().find(|t| t.name == name) {
            task.next = Instant::now() + interval;
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn in_standby(&self) -> bool {
        self.consecutive_failures > 0
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The interval a task would currently be re-armed with.
    pub fn effective_interval(&self, name: &str) -> Option<Duration> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| self.effective(t.interval))
    }

    fn effective(&self, base: Duration) -> Duration {
        if self.consecutive_failures == 0 {
            return base;
        }
        let shift = self.consecutive_failures.min(16);
        let widened = base.saturating_mul(1u32 << shift);
        widened.min(self.ceiling)
    }
}

/// Parses template durations: `"30s"`, `"10m"`, `"1h"` or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => s.split_at(split),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration {s:?}")))?;
    let secs = match unit {
        "s" | "" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(Error::Config(format!("invalid duration unit in {s:?}"))),
    };
    Ok(Duration::from_secs(secs))
}
