//! Session statistics.
//!
//! Counts what a tracking session did with its input and how flushing went.
//! Stats can be persisted so a restarted session on the same day continues
//! the counts instead of starting over.

use crate::core::tracker::Observation;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Counters for one day's tracking session.
#[derive(Debug)]
pub struct SessionStats {
    date: NaiveDate,
    sightings: AtomicU64,
    applied: AtomicU64,
    low_confidence: AtomicU64,
    unknown: AtomicU64,
    ordering_violations: AtomicU64,
    check_ins: AtomicU64,
    check_outs: AtomicU64,
    flushes_completed: AtomicU64,
    flush_failures: AtomicU64,
    flushes_deferred: AtomicU64,
    states_lost: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

/// Thread-safe shared stats.
pub type SharedSessionStats = Arc<SessionStats>;

impl SessionStats {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            sightings: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            low_confidence: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
            ordering_violations: AtomicU64::new(0),
            check_ins: AtomicU64::new(0),
            check_outs: AtomicU64::new(0),
            flushes_completed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            flushes_deferred: AtomicU64::new(0),
            states_lost: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats backed by a file, resuming counts saved for the same day.
    pub fn with_persistence(date: NaiveDate, path: PathBuf) -> Self {
        let mut stats = Self::new(date);
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            warn!(error = %e, "could not load previous session stats");
        }

        stats
    }

    /// Record one incoming sighting line.
    pub fn record_sighting(&self) {
        self.sightings.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sighting whose username matched nobody on the roster.
    pub fn record_unknown(&self) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the tracker's verdict on an observation.
    pub fn record_observation(&self, observation: &Observation) {
        let counter = match observation {
            Observation::CheckedIn { .. } => {
                self.check_ins.fetch_add(1, Ordering::Relaxed);
                &self.applied
            }
            Observation::Updated { .. } => &self.applied,
            Observation::LowConfidence => &self.low_confidence,
            Observation::UnknownEmployee => &self.unknown,
            Observation::OrderingViolation { .. } => &self.ordering_violations,
            Observation::Duplicate
            | Observation::AfterCheckout
            | Observation::OnLeave
            | Observation::OutsideDay => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_check_outs(&self, count: u64) {
        self.check_outs.fetch_add(count, Ordering::Relaxed);
    }

    /// Record the result of one flush job.
    pub fn record_flush(&self, succeeded: bool) {
        if succeeded {
            self.flushes_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a flush that could not be queued.
    pub fn record_deferred(&self) {
        self.flushes_deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// Record states still unconfirmed at shutdown.
    pub fn record_lost(&self, count: u64) {
        self.states_lost.fetch_add(count, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            date: self.date,
            sightings: self.sightings.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            low_confidence: self.low_confidence.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            ordering_violations: self.ordering_violations.load(Ordering::Relaxed),
            check_ins: self.check_ins.load(Ordering::Relaxed),
            check_outs: self.check_outs.load(Ordering::Relaxed),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            flushes_deferred: self.flushes_deferred.load(Ordering::Relaxed),
            states_lost: self.states_lost.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Session Statistics ({}):\n\
             - Sightings received: {}\n\
             - Observations applied: {}\n\
             - Low confidence: {}\n\
             - Unknown subjects: {}\n\
             - Out of order: {}\n\
             - Check-ins: {}\n\
             - Check-outs: {}\n\
             - Flushes completed: {}\n\
             - Flushes failed: {}\n\
             - Flushes deferred: {}\n\
             - States lost: {}\n\
             - Session duration: {} seconds",
            stats.date,
            stats.sightings,
            stats.applied,
            stats.low_confidence,
            stats.unknown,
            stats.ordering_violations,
            stats.check_ins,
            stats.check_outs,
            stats.flushes_completed,
            stats.flush_failures,
            stats.flushes_deferred,
            stats.states_lost,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                counters: self.snapshot().into(),
                last_updated: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk; counts saved for another day are ignored.
    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedStats =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;
        let c = persisted.counters;
        if c.date != self.date {
            return Ok(());
        }

        self.sightings.store(c.sightings, Ordering::Relaxed);
        self.applied.store(c.applied, Ordering::Relaxed);
        self.low_confidence.store(c.low_confidence, Ordering::Relaxed);
        self.unknown.store(c.unknown, Ordering::Relaxed);
        self.ordering_violations
            .store(c.ordering_violations, Ordering::Relaxed);
        self.check_ins.store(c.check_ins, Ordering::Relaxed);
        self.check_outs.store(c.check_outs, Ordering::Relaxed);
        self.flushes_completed
            .store(c.flushes_completed, Ordering::Relaxed);
        self.flush_failures.store(c.flush_failures, Ordering::Relaxed);
        self.flushes_deferred
            .store(c.flushes_deferred, Ordering::Relaxed);
        self.states_lost.store(c.states_lost, Ordering::Relaxed);
        Ok(())
    }
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub date: NaiveDate,
    pub sightings: u64,
    pub applied: u64,
    pub low_confidence: u64,
    pub unknown: u64,
    pub ordering_violations: u64,
    pub check_ins: u64,
    pub check_outs: u64,
    pub flushes_completed: u64,
    pub flush_failures: u64,
    pub flushes_deferred: u64,
    pub states_lost: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Counter values as written to disk.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCounters {
    date: NaiveDate,
    sightings: u64,
    applied: u64,
    low_confidence: u64,
    unknown: u64,
    ordering_violations: u64,
    check_ins: u64,
    check_outs: u64,
    flushes_completed: u64,
    flush_failures: u64,
    flushes_deferred: u64,
    states_lost: u64,
}

impl From<StatsSnapshot> for PersistedCounters {
    fn from(s: StatsSnapshot) -> Self {
        Self {
            date: s.date,
            sightings: s.sightings,
            applied: s.applied,
            low_confidence: s.low_confidence,
            unknown: s.unknown,
            ordering_violations: s.ordering_violations,
            check_ins: s.check_ins,
            check_outs: s.check_outs,
            flushes_completed: s.flushes_completed,
            flush_failures: s.flush_failures,
            flushes_deferred: s.flushes_deferred,
            states_lost: s.states_lost,
        }
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(flatten)]
    counters: PersistedCounters,
    last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::presence::AttendanceStatus;
    use chrono::Duration;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    #[test]
    fn test_observations_are_counted() {
        let stats = SessionStats::new(date());
        stats.record_observation(&Observation::CheckedIn {
            status: AttendanceStatus::Present,
        });
        stats.record_observation(&Observation::Updated {
            out_of_sight_added: Duration::zero(),
        });
        stats.record_observation(&Observation::LowConfidence);
        stats.record_observation(&Observation::Duplicate);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.applied, 2);
        assert_eq!(snapshot.check_ins, 1);
        assert_eq!(snapshot.low_confidence, 1);
        assert_eq!(snapshot.ordering_violations, 0);
    }

    #[test]
    fn test_persistence_resumes_same_day_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats").join("session_stats.json");

        let stats = SessionStats::with_persistence(date(), path.clone());
        stats.record_sighting();
        stats.record_sighting();
        stats.record_flush(true);
        stats.save().unwrap();

        let resumed = SessionStats::with_persistence(date(), path.clone());
        assert_eq!(resumed.snapshot().sightings, 2);
        assert_eq!(resumed.snapshot().flushes_completed, 1);

        let next_day = date().succ_opt().unwrap();
        let fresh = SessionStats::with_persistence(next_day, path);
        assert_eq!(fresh.snapshot().sightings, 0);
    }

    #[test]
    fn test_summary_mentions_losses() {
        let stats = SessionStats::new(date());
        stats.record_lost(3);
        assert!(stats.summary().contains("States lost: 3"));
    }
}
