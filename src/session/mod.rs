//! The per-day tracking session.
//!
//! A session is the single consumer of the sighting channel. It resolves
//! sightings to roster employees, feeds the tracker, schedules checkpoints and
//! check-outs, and hands snapshots to the [`FlushWorker`]. Flush results come
//! back asynchronously and only then is progress marked as persisted.

pub mod worker;

pub use worker::{EnqueueError, FlushReport, FlushWorker};

use crate::core::presence::{EmployeeId, FlushSnapshot};
use crate::core::tracker::{Observation, PresenceTracker};
use crate::source::{RecognitionEvent, Sighting};
use crate::stats::{SharedSessionStats, StatsSnapshot};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Where the session takes "now" from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// The system clock
    #[default]
    Wall,
    /// The latest sighting timestamp; used for replays
    Event,
}

/// Session timing settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub clock: ClockMode,
    pub checkpoint_interval: Duration,
    /// How long to wait for a sighting before running periodic work
    pub poll_interval: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::Wall,
            checkpoint_interval: Duration::minutes(5),
            poll_interval: std::time::Duration::from_millis(100),
        }
    }
}

/// Why the observation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The running flag was cleared (Ctrl+C)
    Interrupted,
    /// The sighting source closed
    SourceExhausted,
    /// The day ended and nobody is left to track
    DayOver,
}

/// Outcome of a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub date: NaiveDate,
    pub reason: StopReason,
    pub employees: usize,
    pub checked_in: usize,
    /// Employees whose final state never reached the store
    pub lost: Vec<EmployeeId>,
    pub stats: StatsSnapshot,
}

/// One day of tracking.
pub struct TrackingSession {
    tracker: PresenceTracker,
    worker: FlushWorker,
    stats: SharedSessionStats,
    config: SessionConfig,
    /// Highest revision queued per employee and not yet reported
    in_flight: HashMap<EmployeeId, u64>,
    last_checkpoint: Option<DateTime<Utc>>,
    latest_event: Option<DateTime<Utc>>,
}

impl TrackingSession {
    pub fn new(
        tracker: PresenceTracker,
        worker: FlushWorker,
        stats: SharedSessionStats,
        config: SessionConfig,
    ) -> Self {
        Self {
            tracker,
            worker,
            stats,
            config,
            in_flight: HashMap::new(),
            last_checkpoint: None,
            latest_event: None,
        }
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    fn now(&self) -> Option<DateTime<Utc>> {
        match self.config.clock {
            ClockMode::Wall => Some(Utc::now()),
            ClockMode::Event => self.latest_event,
        }
    }

    /// Consume sightings until interrupted, the source closes, or the day
    /// ends; then check everyone out and drain pending flushes.
    pub fn run(mut self, sightings: &Receiver<Sighting>, running: &AtomicBool) -> SessionSummary {
        info!(
            date = %self.tracker.date(),
            employees = self.tracker.len(),
            clock = ?self.config.clock,
            "tracking session started"
        );

        let reason = loop {
            if !running.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }

            match sightings.recv_timeout(self.config.poll_interval) {
                Ok(sighting) => self.handle_sighting(&sighting),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break StopReason::SourceExhausted,
            }

            self.apply_reports();

            if let Some(now) = self.now() {
                self.check_out_due(now);
                self.maybe_checkpoint(now);
                if self.tracker.is_day_over(now) && self.tracker.active_count() == 0 {
                    break StopReason::DayOver;
                }
            }
        };

        self.shutdown(reason)
    }

    /// Resolve and apply one sighting.
    pub fn handle_sighting(&mut self, sighting: &Sighting) {
        self.stats.record_sighting();

        let employee = match (sighting.employee_id, sighting.username.as_deref()) {
            (Some(id), _) => id,
            (None, Some(username)) => match self.tracker.resolve(username) {
                Some(id) => id,
                None => {
                    debug!(username, "sighting does not match the roster");
                    self.stats.record_unknown();
                    return;
                }
            },
            (None, None) => {
                debug!("sighting carries no identity");
                self.stats.record_unknown();
                return;
            }
        };

        if self.config.clock == ClockMode::Event {
            self.latest_event = Some(
                self.latest_event
                    .map_or(sighting.timestamp, |t| t.max(sighting.timestamp)),
            );
        }

        let event = RecognitionEvent::new(employee, sighting.timestamp, sighting.confidence());
        let outcome = self.tracker.observe(&event);
        self.stats.record_observation(&outcome);

        // Persist check-ins right away rather than at the next checkpoint.
        if let Observation::CheckedIn { .. } = outcome {
            if let Some(snapshot) = self.tracker.snapshot(employee) {
                self.enqueue(snapshot);
            }
        }
    }

    fn enqueue(&mut self, snapshot: FlushSnapshot) {
        let employee = snapshot.employee_id;
        let revision = snapshot.revision;
        if self
            .in_flight
            .get(&employee)
            .is_some_and(|queued| *queued >= revision)
        {
            return;
        }

        match self.worker.try_enqueue(snapshot) {
            Ok(()) => {
                self.in_flight.insert(employee, revision);
            }
            Err(EnqueueError::Full(_)) => {
                warn!(
                    employee,
                    revision, "flush queue full; deferring to next checkpoint"
                );
                self.stats.record_deferred();
            }
            Err(EnqueueError::Closed(_)) => {
                error!(employee, revision, "flush worker stopped; cannot persist");
            }
        }
    }

    /// Apply flush results that have arrived.
    fn apply_reports(&mut self) {
        for report in self.worker.try_reports() {
            self.apply_report(report);
        }
    }

    fn apply_report(&mut self, report: FlushReport) {
        let FlushReport {
            employee_id,
            revision,
            result,
        } = report;

        if self.in_flight.get(&employee_id) == Some(&revision) {
            self.in_flight.remove(&employee_id);
        }

        match result {
            Ok(outcome) => {
                debug!(employee = employee_id, revision, ?outcome, "flush confirmed");
                self.tracker.acknowledge(employee_id, revision);
                self.stats.record_flush(true);
            }
            Err(e) => {
                warn!(
                    employee = employee_id,
                    revision,
                    error = %e,
                    "flush not confirmed; state stays pending"
                );
                self.stats.record_flush(false);
            }
        }
    }

    fn check_out_due(&mut self, now: DateTime<Utc>) {
        for employee in self.tracker.due_for_checkout(now) {
            if let Some(snapshot) = self.tracker.check_out(employee, now) {
                self.stats.record_check_outs(1);
                self.enqueue(snapshot);
            }
        }
    }

    fn maybe_checkpoint(&mut self, now: DateTime<Utc>) {
        let Some(last) = self.last_checkpoint else {
            self.last_checkpoint = Some(now);
            return;
        };
        if now - last >= self.config.checkpoint_interval {
            self.checkpoint();
            self.last_checkpoint = Some(now);
        }
    }

    /// Queue every state with unconfirmed progress.
    pub fn checkpoint(&mut self) {
        let pending = self.tracker.pending_snapshots();
        if !pending.is_empty() {
            debug!(pending = pending.len(), "checkpoint");
        }
        for snapshot in pending {
            self.enqueue(snapshot);
        }
    }

    fn shutdown(mut self, reason: StopReason) -> SessionSummary {
        let now = self.now().unwrap_or_else(Utc::now);
        info!(?reason, at = %now, "tracking session stopping");

        let closed = self.tracker.check_out_all(now);
        self.stats.record_check_outs(closed.len() as u64);
        let absent = self.tracker.mark_no_shows();
        if absent > 0 {
            info!(absent, "recording no-shows as absent");
        }
        self.apply_reports();

        for snapshot in self.tracker.pending_snapshots() {
            let employee = snapshot.employee_id;
            let revision = snapshot.revision;
            if self
                .in_flight
                .get(&employee)
                .is_some_and(|queued| *queued >= revision)
            {
                continue;
            }
            match self.worker.enqueue_blocking(snapshot) {
                Ok(()) => {
                    self.in_flight.insert(employee, revision);
                }
                Err(e) => error!(employee, revision, error = %e, "final flush not queued"),
            }
        }

        for report in self.worker.finish() {
            self.apply_report(report);
        }

        let mut lost = Vec::new();
        for snapshot in self.tracker.pending_snapshots() {
            error!(
                employee = snapshot.employee_id,
                date = %snapshot.date,
                status = %snapshot.status,
                checked_out = snapshot.is_checkout(),
                "presence state lost; store never confirmed it"
            );
            lost.push(snapshot.employee_id);
        }
        self.stats.record_lost(lost.len() as u64);

        if let Err(e) = self.stats.save() {
            warn!(error = %e, "could not save session stats");
        }

        let checked_in = self
            .tracker
            .states()
            .filter(|s| s.check_in_time.is_some())
            .count();
        info!(
            checked_in,
            lost = lost.len(),
            "tracking session finished"
        );

        SessionSummary {
            date: self.tracker.date(),
            reason,
            employees: self.tracker.len(),
            checked_in,
            lost,
            stats: self.stats.snapshot(),
        }
    }
}
