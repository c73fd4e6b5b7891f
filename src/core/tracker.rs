//! Presence tracking.
//!
//! The tracker owns every employee's [`PresenceState`] for one day and folds
//! recognition events into it: first sighting sets check-in and status, long
//! gaps between sightings accumulate as out-of-sight time, and check-out
//! closes the day for an employee.

use crate::config::{Config, ConfigError};
use crate::core::presence::{
    AttendanceStatus, EmployeeId, FlushSnapshot, PresenceState, TrackingPhase,
};
use crate::core::roster::DayRoster;
use crate::source::RecognitionEvent;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Thresholds and clock settings for the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub timezone: Tz,
    pub late_cutoff: NaiveTime,
    pub end_of_day: NaiveTime,
    pub min_confidence: f64,
    pub out_of_sight_threshold: Duration,
    pub long_absence_threshold: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            late_cutoff: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            end_of_day: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
            min_confidence: 0.4,
            out_of_sight_threshold: Duration::seconds(60),
            long_absence_threshold: Duration::hours(2),
        }
    }
}

// Keeps conversions from std durations inside chrono's range.
const MAX_THRESHOLD_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::seconds(duration.as_secs().min(MAX_THRESHOLD_SECS) as i64)
}

impl TrackerConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            timezone: config.tz()?,
            late_cutoff: config.late_cutoff,
            end_of_day: config.end_of_day,
            min_confidence: config.min_confidence,
            out_of_sight_threshold: to_chrono(config.out_of_sight_threshold),
            long_absence_threshold: to_chrono(config.long_absence_threshold),
        })
    }
}

/// What an observation did to the tracked state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// First sighting of the day
    CheckedIn { status: AttendanceStatus },
    /// Later sighting; `out_of_sight_added` is zero for short gaps
    Updated { out_of_sight_added: Duration },
    /// Same instant as the last sighting
    Duplicate,
    LowConfidence,
    UnknownEmployee,
    /// Employee already checked out today
    AfterCheckout,
    /// Employee is on approved leave
    OnLeave,
    /// Timestamp earlier than the last accepted sighting
    OrderingViolation { last_seen: DateTime<Utc> },
    /// Timestamp falls on another local day
    OutsideDay,
}

impl Observation {
    /// Whether the observation changed tracked state.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            Observation::CheckedIn { .. } | Observation::Updated { .. }
        )
    }
}

/// Per-day presence tracker.
pub struct PresenceTracker {
    config: TrackerConfig,
    date: NaiveDate,
    states: HashMap<EmployeeId, PresenceState>,
    usernames: HashMap<String, EmployeeId>,
}

impl PresenceTracker {
    pub fn new(config: TrackerConfig, roster: DayRoster) -> Self {
        Self {
            config,
            date: roster.date,
            states: roster.states,
            usernames: roster.usernames,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, employee: EmployeeId) -> Option<&PresenceState> {
        self.states.get(&employee)
    }

    /// All states, in no particular order.
    pub fn states(&self) -> impl Iterator<Item = &PresenceState> {
        self.states.values()
    }

    /// Resolve a username (case-insensitive) to a roster employee.
    pub fn resolve(&self, username: &str) -> Option<EmployeeId> {
        self.usernames.get(&username.to_lowercase()).copied()
    }

    /// Employees currently checked in.
    pub fn active_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.phase == TrackingPhase::CheckedIn)
            .count()
    }

    /// Whether `now` is at or past the end of the tracked day.
    pub fn is_day_over(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.config.timezone);
        let date = local.date_naive();
        date > self.date || (date == self.date && local.time() >= self.config.end_of_day)
    }

    /// Fold one recognition event into the tracked state.
    pub fn observe(&mut self, event: &RecognitionEvent) -> Observation {
        let config = &self.config;
        let Some(state) = self.states.get_mut(&event.employee_id) else {
            debug!(employee = event.employee_id, "sighting of unknown employee");
            return Observation::UnknownEmployee;
        };

        // NaN confidence fails this comparison too.
        if !(event.confidence >= config.min_confidence) {
            debug!(
                employee = event.employee_id,
                confidence = event.confidence,
                "ignoring low-confidence sighting"
            );
            return Observation::LowConfidence;
        }

        if let TrackingPhase::CheckedOut { .. } = state.phase {
            return Observation::AfterCheckout;
        }
        if state.status == AttendanceStatus::OnLeave {
            return Observation::OnLeave;
        }

        let local = event.timestamp.with_timezone(&config.timezone);
        if local.date_naive() != self.date {
            debug!(
                employee = event.employee_id,
                timestamp = %event.timestamp,
                "sighting outside the tracked day"
            );
            return Observation::OutsideDay;
        }

        if let Some(last_seen) = state.last_seen.or(state.check_in_time) {
            if event.timestamp < last_seen {
                warn!(
                    employee = event.employee_id,
                    timestamp = %event.timestamp,
                    %last_seen,
                    "out-of-order sighting ignored"
                );
                return Observation::OrderingViolation { last_seen };
            }
        }

        if state.check_in_time.is_none() {
            let status = if local.time() >= config.late_cutoff {
                AttendanceStatus::Late
            } else {
                AttendanceStatus::Present
            };
            state.check_in_time = Some(event.timestamp);
            state.last_seen = Some(event.timestamp);
            state.status = status;
            state.phase = TrackingPhase::CheckedIn;
            state.touch();

            info!(
                employee = event.employee_id,
                at = %event.timestamp,
                %status,
                "checked in"
            );
            return Observation::CheckedIn { status };
        }

        // Resumed from a stored row: nothing is known about the time between
        // the stored check-in and this sighting.
        let Some(previous) = state.last_seen else {
            debug!(
                employee = event.employee_id,
                at = %event.timestamp,
                "resumed tracking"
            );
            state.last_seen = Some(event.timestamp);
            return Observation::Updated {
                out_of_sight_added: Duration::zero(),
            };
        };
        let gap = event.timestamp - previous;
        if gap == Duration::zero() {
            return Observation::Duplicate;
        }

        let added = if gap > config.out_of_sight_threshold {
            gap
        } else {
            Duration::zero()
        };
        if added > Duration::zero() {
            debug!(
                employee = event.employee_id,
                gap_secs = gap.num_seconds(),
                "out-of-sight gap recorded"
            );
        }
        state.out_of_sight_duration = state.out_of_sight_duration + added;
        state.last_seen = Some(event.timestamp);
        state.touch();

        Observation::Updated {
            out_of_sight_added: added,
        }
    }

    /// Out-of-sight time including the gap still open at `now`.
    fn projected_out_of_sight(&self, state: &PresenceState, now: DateTime<Utc>) -> Duration {
        let open_gap = state
            .last_seen
            .map(|last| now - last)
            .filter(|gap| *gap > self.config.out_of_sight_threshold)
            .unwrap_or_else(Duration::zero);
        state.out_of_sight_duration + open_gap
    }

    /// Checked-in employees that should be checked out at `now`, sorted by id.
    pub fn due_for_checkout(&self, now: DateTime<Utc>) -> Vec<EmployeeId> {
        let day_over = self.is_day_over(now);
        let mut due: Vec<EmployeeId> = self
            .states
            .values()
            .filter(|s| s.phase == TrackingPhase::CheckedIn)
            .filter(|s| {
                day_over
                    || self.projected_out_of_sight(s, now) > self.config.long_absence_threshold
            })
            .map(|s| s.employee_id)
            .collect();
        due.sort_unstable();
        due
    }

    /// Close the day for `employee` at `now`.
    ///
    /// Returns the final snapshot, or `None` if the employee was not checked
    /// in. An open gap at `now` is counted as out-of-sight time; a resumed
    /// state not seen since the restart has no open gap.
    pub fn check_out(&mut self, employee: EmployeeId, now: DateTime<Utc>) -> Option<FlushSnapshot> {
        let threshold = self.config.out_of_sight_threshold;
        let state = self.states.get_mut(&employee)?;
        if state.phase != TrackingPhase::CheckedIn {
            return None;
        }

        let floor = state.last_seen.or(state.check_in_time)?;
        let at = now.max(floor);
        if let Some(last_seen) = state.last_seen {
            let open_gap = at - last_seen;
            if open_gap > threshold {
                state.out_of_sight_duration = state.out_of_sight_duration + open_gap;
            }
        }
        state.phase = TrackingPhase::CheckedOut { at };
        state.touch();

        let snapshot = state.snapshot();
        if let Some(snapshot) = &snapshot {
            info!(
                employee,
                at = %at,
                out_of_sight_secs = snapshot.out_of_sight_duration.num_seconds(),
                working_secs = snapshot
                    .working_hours
                    .map(|w| w.num_seconds())
                    .unwrap_or_default(),
                "checked out"
            );
        }
        snapshot
    }

    /// Check out everyone still checked in.
    pub fn check_out_all(&mut self, now: DateTime<Utc>) -> Vec<FlushSnapshot> {
        let mut active: Vec<EmployeeId> = self
            .states
            .values()
            .filter(|s| s.phase == TrackingPhase::CheckedIn)
            .map(|s| s.employee_id)
            .collect();
        active.sort_unstable();
        active
            .into_iter()
            .filter_map(|employee| self.check_out(employee, now))
            .collect()
    }

    /// Mark every employee never seen today for an Absent row.
    ///
    /// Called once the day's tracking is over; the marked states then show up
    /// in [`pending_snapshots`](Self::pending_snapshots) as absence snapshots.
    /// Employees on leave are left alone. Returns how many were marked.
    pub fn mark_no_shows(&mut self) -> usize {
        let mut marked = 0;
        for state in self.states.values_mut() {
            if state.phase == TrackingPhase::NoShow
                && state.status == AttendanceStatus::Absent
                && !state.is_dirty()
            {
                state.touch();
                marked += 1;
            }
        }
        marked
    }

    /// Snapshot of one employee's unconfirmed progress.
    pub fn snapshot(&self, employee: EmployeeId) -> Option<FlushSnapshot> {
        self.states
            .get(&employee)
            .filter(|s| s.is_dirty())
            .and_then(PresenceState::snapshot)
    }

    /// Snapshots of every state with unconfirmed progress, sorted by id.
    pub fn pending_snapshots(&self) -> Vec<FlushSnapshot> {
        let mut snapshots: Vec<FlushSnapshot> = self
            .states
            .values()
            .filter(|s| s.is_dirty())
            .filter_map(PresenceState::snapshot)
            .collect();
        snapshots.sort_unstable_by_key(|s| s.employee_id);
        snapshots
    }

    /// Mark `revision` of `employee` as persisted.
    pub fn acknowledge(&mut self, employee: EmployeeId, revision: u64) {
        if let Some(state) = self.states.get_mut(&employee) {
            state.acknowledge(revision);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::presence::AttendanceRecord;
    use crate::core::roster::RosterEntry;
    use chrono::TimeZone;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, s).unwrap()
    }

    fn tracker() -> PresenceTracker {
        let roster = DayRoster::absent(
            date(),
            &[RosterEntry::employee(1, "alice"), RosterEntry::employee(2, "bob")],
        );
        PresenceTracker::new(TrackerConfig::default(), roster)
    }

    fn seen(employee: EmployeeId, timestamp: DateTime<Utc>) -> RecognitionEvent {
        RecognitionEvent::new(employee, timestamp, 0.9)
    }

    #[test]
    fn test_check_in_before_cutoff_is_present() {
        let mut tracker = tracker();
        let outcome = tracker.observe(&seen(1, at(9, 15, 0)));

        assert_eq!(
            outcome,
            Observation::CheckedIn {
                status: AttendanceStatus::Present
            }
        );
        let state = tracker.state(1).unwrap();
        assert_eq!(state.check_in_time, Some(at(9, 15, 0)));
        assert_eq!(state.phase, TrackingPhase::CheckedIn);
        assert!(state.is_dirty());
    }

    #[test]
    fn test_check_in_after_cutoff_is_late() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 45, 0)));
        tracker.observe(&seen(2, at(9, 30, 0)));

        assert_eq!(tracker.state(1).unwrap().status, AttendanceStatus::Late);
        assert_eq!(tracker.state(2).unwrap().status, AttendanceStatus::Late);
    }

    #[test]
    fn test_cutoff_uses_local_time() {
        let roster = DayRoster::absent(date(), &[RosterEntry::employee(1, "alice")]);
        let config = TrackerConfig {
            timezone: chrono_tz::Asia::Dhaka,
            ..TrackerConfig::default()
        };
        let mut tracker = PresenceTracker::new(config, roster);

        // 03:15 UTC is 09:15 in Dhaka.
        tracker.observe(&seen(1, at(3, 15, 0)));
        assert_eq!(tracker.state(1).unwrap().status, AttendanceStatus::Present);
    }

    #[test]
    fn test_only_long_gaps_count_as_out_of_sight() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));

        let short = tracker.observe(&seen(1, at(9, 0, 30)));
        assert_eq!(
            short,
            Observation::Updated {
                out_of_sight_added: Duration::zero()
            }
        );

        let long = tracker.observe(&seen(1, at(9, 1, 40)));
        assert_eq!(
            long,
            Observation::Updated {
                out_of_sight_added: Duration::seconds(70)
            }
        );
        assert_eq!(
            tracker.state(1).unwrap().out_of_sight_duration,
            Duration::seconds(70)
        );
    }

    #[test]
    fn test_replay_is_a_no_op() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));
        tracker.observe(&seen(1, at(9, 5, 0)));
        let before = tracker.state(1).unwrap().clone();

        assert_eq!(tracker.observe(&seen(1, at(9, 5, 0))), Observation::Duplicate);
        assert_eq!(tracker.state(1).unwrap(), &before);
    }

    #[test]
    fn test_low_confidence_changes_nothing() {
        let mut tracker = tracker();
        let outcome = tracker.observe(&RecognitionEvent::new(1, at(9, 0, 0), 0.2));

        assert_eq!(outcome, Observation::LowConfidence);
        let state = tracker.state(1).unwrap();
        assert_eq!(state.check_in_time, None);
        assert_eq!(state.last_seen, None);
        assert_eq!(state.status, AttendanceStatus::Absent);

        let nan = tracker.observe(&RecognitionEvent::new(1, at(9, 0, 0), f64::NAN));
        assert_eq!(nan, Observation::LowConfidence);
    }

    #[test]
    fn test_out_of_order_sighting_is_rejected() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(10, 0, 0)));
        let before = tracker.state(1).unwrap().clone();

        let outcome = tracker.observe(&seen(1, at(9, 0, 0)));
        assert_eq!(
            outcome,
            Observation::OrderingViolation {
                last_seen: at(10, 0, 0)
            }
        );
        assert_eq!(tracker.state(1).unwrap(), &before);
    }

    #[test]
    fn test_unknown_and_other_day_sightings() {
        let mut tracker = tracker();
        assert_eq!(
            tracker.observe(&seen(42, at(9, 0, 0))),
            Observation::UnknownEmployee
        );

        let tomorrow = Utc.with_ymd_and_hms(2024, 1, 11, 9, 0, 0).unwrap();
        assert_eq!(tracker.observe(&seen(1, tomorrow)), Observation::OutsideDay);
    }

    #[test]
    fn test_no_observations_after_checkout() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));
        tracker.check_out(1, at(17, 0, 0)).unwrap();

        assert_eq!(
            tracker.observe(&seen(1, at(17, 30, 0))),
            Observation::AfterCheckout
        );
        assert_eq!(tracker.state(1).unwrap().last_seen, Some(at(9, 0, 0)));
    }

    #[test]
    fn test_on_leave_is_never_promoted() {
        let record = AttendanceRecord {
            id: 1,
            employee_id: 1,
            date: date(),
            check_in_time: None,
            check_out_time: None,
            out_of_sight_duration: Duration::zero(),
            working_hours: None,
            status: AttendanceStatus::OnLeave,
        };
        let mut roster = DayRoster::absent(date(), &[RosterEntry::employee(1, "alice")]);
        roster.states.insert(1, PresenceState::from_record(&record));
        let mut tracker = PresenceTracker::new(TrackerConfig::default(), roster);

        assert_eq!(tracker.observe(&seen(1, at(9, 0, 0))), Observation::OnLeave);
        let state = tracker.state(1).unwrap();
        assert_eq!(state.status, AttendanceStatus::OnLeave);
        assert!(tracker.pending_snapshots().is_empty());
    }

    fn resumed(check_in: DateTime<Utc>, out_of_sight: Duration) -> PresenceTracker {
        let record = AttendanceRecord {
            id: 1,
            employee_id: 1,
            date: date(),
            check_in_time: Some(check_in),
            check_out_time: None,
            out_of_sight_duration: out_of_sight,
            working_hours: None,
            status: AttendanceStatus::Present,
        };
        let mut roster = DayRoster::absent(date(), &[RosterEntry::employee(1, "alice")]);
        roster.states.insert(1, PresenceState::from_record(&record));
        PresenceTracker::new(TrackerConfig::default(), roster)
    }

    #[test]
    fn test_restart_gap_is_not_out_of_sight() {
        let mut tracker = resumed(at(9, 0, 0), Duration::seconds(120));

        assert!(tracker.due_for_checkout(at(13, 0, 0)).is_empty());
        assert_eq!(
            tracker.observe(&seen(1, at(13, 1, 0))),
            Observation::Updated {
                out_of_sight_added: Duration::zero()
            }
        );
        assert_eq!(tracker.state(1).unwrap().last_seen, Some(at(13, 1, 0)));
        assert!(tracker.due_for_checkout(at(14, 0, 0)).is_empty());

        let long = tracker.observe(&seen(1, at(13, 3, 0)));
        assert_eq!(
            long,
            Observation::Updated {
                out_of_sight_added: Duration::seconds(120)
            }
        );
        assert_eq!(
            tracker.state(1).unwrap().out_of_sight_duration,
            Duration::seconds(240)
        );
    }

    #[test]
    fn test_resumed_state_rejects_sightings_before_check_in() {
        let mut tracker = resumed(at(9, 0, 0), Duration::zero());
        assert_eq!(
            tracker.observe(&seen(1, at(8, 59, 0))),
            Observation::OrderingViolation {
                last_seen: at(9, 0, 0)
            }
        );
    }

    #[test]
    fn test_resumed_state_unseen_until_day_end() {
        let mut tracker = resumed(at(9, 0, 0), Duration::seconds(60));

        let snapshot = tracker.check_out(1, at(18, 0, 0)).unwrap();
        assert_eq!(snapshot.out_of_sight_duration, Duration::seconds(60));
        assert_eq!(
            snapshot.working_hours,
            Some(Duration::hours(9) - Duration::seconds(60))
        );
    }

    #[test]
    fn test_check_out_computes_working_hours() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));
        tracker.observe(&seen(1, at(9, 30, 0)));
        tracker.observe(&seen(1, at(16, 59, 30)));

        let snapshot = tracker.check_out(1, at(17, 0, 0)).unwrap();

        // Both gaps are out of sight; the 30 s open gap at check-out is not.
        let out_of_sight = Duration::minutes(30) + Duration::seconds(7 * 3600 + 29 * 60 + 30);
        assert_eq!(snapshot.out_of_sight_duration, out_of_sight);
        assert_eq!(snapshot.check_out_time, Some(at(17, 0, 0)));
        assert_eq!(
            snapshot.working_hours,
            Some(Duration::hours(8) - out_of_sight)
        );
        assert!(snapshot.is_checkout());
    }

    #[test]
    fn test_long_absence_triggers_checkout() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));
        tracker.observe(&seen(2, at(9, 0, 0)));
        tracker.observe(&seen(2, at(11, 0, 0)));

        assert!(tracker.due_for_checkout(at(10, 0, 0)).is_empty());
        assert_eq!(tracker.due_for_checkout(at(11, 0, 1)), vec![1]);

        let snapshot = tracker.check_out(1, at(11, 0, 1)).unwrap();
        assert_eq!(snapshot.out_of_sight_duration, Duration::seconds(2 * 3600 + 1));
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn test_end_of_day_checks_out_everyone() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));
        tracker.observe(&seen(2, at(9, 10, 0)));

        assert!(!tracker.is_day_over(at(17, 59, 59)));
        assert!(tracker.is_day_over(at(18, 0, 0)));
        assert_eq!(tracker.due_for_checkout(at(18, 0, 0)), vec![1, 2]);
        assert_eq!(tracker.check_out_all(at(18, 0, 0)).len(), 2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_acknowledge_clears_pending() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));
        let snapshot = tracker.snapshot(1).unwrap();

        tracker.observe(&seen(1, at(9, 5, 0)));
        tracker.acknowledge(1, snapshot.revision);
        assert_eq!(tracker.pending_snapshots().len(), 1);

        let latest = tracker.snapshot(1).unwrap();
        tracker.acknowledge(1, latest.revision);
        assert!(tracker.pending_snapshots().is_empty());
        assert!(tracker.snapshot(2).is_none());
    }

    #[test]
    fn test_no_shows_become_absence_snapshots() {
        let mut tracker = tracker();
        tracker.observe(&seen(1, at(9, 0, 0)));
        let check_in = tracker.snapshot(1).unwrap();
        tracker.acknowledge(1, check_in.revision);

        assert_eq!(tracker.mark_no_shows(), 1);
        assert_eq!(tracker.mark_no_shows(), 0);

        let pending = tracker.pending_snapshots();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].employee_id, 2);
        assert_eq!(pending[0].status, AttendanceStatus::Absent);
        assert!(pending[0].is_absence());
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let tracker = tracker();
        assert_eq!(tracker.resolve("Alice"), Some(1));
        assert_eq!(tracker.resolve("mallory"), None);
    }
}
