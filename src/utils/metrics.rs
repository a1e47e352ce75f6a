use std::time::Instant;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Counters for one orchestrator run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    /// Start time of the run
    pub started_at: DateTime<Utc>,

    /// Batches selected from the queue
    pub batches: usize,

    /// Fetch tasks launched
    pub dispatched: usize,

    /// Pages that answered with a 2xx status
    pub fetched: usize,

    /// Items marked fetched
    pub saved: usize,

    /// Pages fetched that yielded nothing worth storing
    pub unsaved: usize,

    /// Items the site refused
    pub blocked: usize,

    /// Tasks that ended in an error instead of an outcome
    pub rejected: usize,

    /// Pending items left, counted at start and decremented per saved item
    pub remaining: u64,
}

impl RunMetrics {
    pub fn new(remaining: u64) -> Self {
        Self {
            started_at: Utc::now(),
            batches: 0,
            dispatched: 0,
            fetched: 0,
            saved: 0,
            unsaved: 0,
            blocked: 0,
            rejected: 0,
            remaining,
        }
    }

    /// Count a saved item against the remaining backlog
    pub fn record_saved(&mut self) {
        self.saved += 1;
        self.remaining = self.remaining.saturating_sub(1);
    }

    /// Seconds since the run started
    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    /// Start time of the request
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
