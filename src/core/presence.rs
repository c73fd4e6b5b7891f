//! Attendance records and the per-day presence state the tracker mutates.
//!
//! `AttendanceRecord` mirrors a row in the record store. `PresenceState` is
//! the in-memory progress for one employee on one day; it carries a revision
//! counter so that flush confirmations arriving late never mark newer
//! progress as persisted.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an employee (the user id in the record store).
pub type EmployeeId = u64;

/// Daily attendance status, using the store's single-letter codes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[serde(rename = "P")]
    Present,
    #[serde(rename = "A")]
    Absent,
    #[serde(rename = "L")]
    Late,
    #[serde(rename = "O")]
    OnLeave,
}

impl AttendanceStatus {
    /// Wire code used by the record store.
    pub fn code(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "P",
            AttendanceStatus::Absent => "A",
            AttendanceStatus::Late => "L",
            AttendanceStatus::OnLeave => "O",
        }
    }

    /// Whether this status means the employee was seen that day.
    pub fn is_checked_in(&self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
            AttendanceStatus::Late => "Late",
            AttendanceStatus::OnLeave => "On Leave",
        };
        write!(f, "{label}")
    }
}

/// A persisted attendance row, unique per `(employee_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// Store-assigned identifier
    pub id: u64,
    #[serde(rename = "employee")]
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    #[serde(default)]
    pub check_in_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub check_out_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "out_of_sight_time",
        with = "duration_secs",
        default = "zero_duration"
    )]
    pub out_of_sight_duration: Duration,
    #[serde(with = "duration_secs::option", default)]
    pub working_hours: Option<Duration>,
    pub status: AttendanceStatus,
}

/// Time between check-in and check-out minus out-of-sight time, never negative.
pub fn working_hours(
    check_in: DateTime<Utc>,
    check_out: DateTime<Utc>,
    out_of_sight: Duration,
) -> Duration {
    let worked = check_out - check_in - out_of_sight;
    if worked < Duration::zero() {
        Duration::zero()
    } else {
        worked
    }
}

/// Where an employee is in the day's tracking lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingPhase {
    /// Not yet seen today
    NoShow,
    /// Seen at least once, still being tracked
    CheckedIn,
    /// Day closed for this employee; no further observations apply
    CheckedOut { at: DateTime<Utc> },
}

/// In-memory presence progress for one employee on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceState {
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub check_in_time: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub out_of_sight_duration: Duration,
    pub status: AttendanceStatus,
    pub phase: TrackingPhase,
    revision: u64,
    flushed_revision: u64,
}

impl PresenceState {
    /// Fresh state for an employee with no record yet today.
    pub fn absent(employee_id: EmployeeId, date: NaiveDate) -> Self {
        Self {
            employee_id,
            date,
            check_in_time: None,
            last_seen: None,
            out_of_sight_duration: Duration::zero(),
            status: AttendanceStatus::Absent,
            phase: TrackingPhase::NoShow,
            revision: 0,
            flushed_revision: 0,
        }
    }

    /// Seed state from a record already in the store (restart recovery).
    ///
    /// The seeded state is clean: everything it holds is already persisted.
    /// A checked-in row leaves `last_seen` unset, so the first sighting after
    /// the restart becomes a fresh anchor instead of closing one long gap
    /// reaching back to the stored check-in.
    pub fn from_record(record: &AttendanceRecord) -> Self {
        let phase = match (record.check_in_time, record.check_out_time) {
            (_, Some(at)) => TrackingPhase::CheckedOut { at },
            (Some(_), None) => TrackingPhase::CheckedIn,
            (None, None) => TrackingPhase::NoShow,
        };

        Self {
            employee_id: record.employee_id,
            date: record.date,
            check_in_time: record.check_in_time,
            last_seen: record.check_out_time,
            out_of_sight_duration: record.out_of_sight_duration,
            status: record.status,
            phase,
            revision: 0,
            flushed_revision: 0,
        }
    }

    /// Check-out time, once the day is closed for this employee.
    pub fn check_out_time(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            TrackingPhase::CheckedOut { at } => Some(at),
            _ => None,
        }
    }

    /// Working hours, available after check-out.
    pub fn working_hours(&self) -> Option<Duration> {
        match (self.check_in_time, self.check_out_time()) {
            (Some(check_in), Some(check_out)) => Some(working_hours(
                check_in,
                check_out,
                self.out_of_sight_duration,
            )),
            _ => None,
        }
    }

    /// Whether the state holds progress not yet confirmed by the store.
    pub fn is_dirty(&self) -> bool {
        self.revision > self.flushed_revision
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Record that the state changed.
    pub(crate) fn touch(&mut self) {
        self.revision += 1;
    }

    /// Record that `revision` has been persisted.
    pub(crate) fn acknowledge(&mut self, revision: u64) {
        self.flushed_revision = self.flushed_revision.max(revision.min(self.revision));
    }

    /// Build the store-facing snapshot of this state.
    ///
    /// Returns `None` for employees on leave, whose rows tracking never owns.
    /// An employee never seen yields an Absent snapshot with no check-in.
    pub fn snapshot(&self) -> Option<FlushSnapshot> {
        if self.status == AttendanceStatus::OnLeave {
            return None;
        }
        let check_in_time = self.check_in_time;
        if check_in_time.is_none() && self.status != AttendanceStatus::Absent {
            return None;
        }

        Some(FlushSnapshot {
            employee_id: self.employee_id,
            date: self.date,
            status: self.status,
            check_in_time,
            check_out_time: self.check_out_time(),
            out_of_sight_duration: self.out_of_sight_duration,
            working_hours: self.working_hours(),
            revision: self.revision,
        })
    }
}

/// Immutable copy of a presence state handed to the flusher.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushSnapshot {
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    /// `None` for an absence marker
    pub check_in_time: Option<DateTime<Utc>>,
    pub check_out_time: Option<DateTime<Utc>>,
    pub out_of_sight_duration: Duration,
    pub working_hours: Option<Duration>,
    /// Revision of the state this snapshot was taken from
    pub revision: u64,
}

impl FlushSnapshot {
    /// Whether this snapshot closes the day (as opposed to a checkpoint).
    pub fn is_checkout(&self) -> bool {
        self.check_out_time.is_some()
    }

    /// Whether this snapshot only records that the employee never showed up.
    pub fn is_absence(&self) -> bool {
        self.check_in_time.is_none()
    }
}

fn zero_duration() -> Duration {
    Duration::zero()
}

/// Serde support for chrono durations.
///
/// Durations are written as whole seconds, which the store's duration fields
/// accept. Reads also take the store's own rendering, `[D ]HH:MM:SS[.ffffff]`,
/// and `null` (zero, or `None` for the optional form).
pub(crate) mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireDuration {
        Seconds(i64),
        Fractional(f64),
        Text(String),
    }

    impl WireDuration {
        fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
            let duration = match self {
                WireDuration::Seconds(secs) => Duration::seconds(secs),
                WireDuration::Fractional(secs) => Duration::microseconds((secs * 1e6) as i64),
                WireDuration::Text(text) => parse(&text)
                    .ok_or_else(|| E::custom(format!("invalid duration {text:?}")))?,
            };
            Ok(duration.max(Duration::zero()))
        }
    }

    /// Parse `[D ]HH:MM:SS[.ffffff]`; bare `SS` and `MM:SS` are accepted too.
    pub(crate) fn parse(text: &str) -> Option<Duration> {
        let text = text.trim();
        let (days, clock) = match text.rsplit_once(' ') {
            Some((days, clock)) => {
                let days = days
                    .trim_end_matches(',')
                    .trim_end_matches("days")
                    .trim_end_matches("day")
                    .trim();
                (days.parse::<i64>().ok()?, clock)
            }
            None => (0, text),
        };

        let (whole, micros) = match clock.split_once(|c: char| c == '.' || c == ',') {
            Some((whole, fraction)) => {
                if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let digits: String = fraction.chars().chain("000000".chars()).take(6).collect();
                (whole, digits.parse::<i64>().ok()?)
            }
            None => (clock, 0),
        };

        let mut parts = whole.split(':').rev();
        let seconds = parts.next()?.parse::<i64>().ok()?;
        let minutes = parts.next().map(str::parse::<i64>).transpose().ok()?.unwrap_or(0);
        let hours = parts.next().map(str::parse::<i64>).transpose().ok()?.unwrap_or(0);
        if parts.next().is_some() || seconds < 0 || minutes < 0 || hours < 0 {
            return None;
        }

        Some(
            Duration::days(days)
                + Duration::hours(hours)
                + Duration::minutes(minutes)
                + Duration::seconds(seconds)
                + Duration::microseconds(micros),
        )
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.num_seconds().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<WireDuration>::deserialize(deserializer)? {
            Some(wire) => wire.into_duration(),
            None => Ok(Duration::zero()),
        }
    }

    pub mod option {
        use super::WireDuration;
        use chrono::Duration;
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.map(|d| d.num_seconds()).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<WireDuration>::deserialize(deserializer)?
                .map(|wire| wire.into_duration())
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, s).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    #[test]
    fn test_working_hours_subtracts_out_of_sight() {
        let worked = working_hours(at(9, 0, 0), at(17, 0, 0), Duration::minutes(30));
        assert_eq!(worked, Duration::minutes(7 * 60 + 30));
    }

    #[test]
    fn test_working_hours_never_negative() {
        let worked = working_hours(at(9, 0, 0), at(9, 10, 0), Duration::hours(1));
        assert_eq!(worked, Duration::zero());
    }

    #[test]
    fn test_seed_from_checked_in_record() {
        let record = AttendanceRecord {
            id: 7,
            employee_id: 3,
            date: date(),
            check_in_time: Some(at(9, 5, 0)),
            check_out_time: None,
            out_of_sight_duration: Duration::seconds(90),
            working_hours: None,
            status: AttendanceStatus::Present,
        };

        let state = PresenceState::from_record(&record);
        assert_eq!(state.phase, TrackingPhase::CheckedIn);
        assert_eq!(state.last_seen, None);
        assert_eq!(state.out_of_sight_duration, Duration::seconds(90));
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_seed_from_checked_out_record_is_closed() {
        let record = AttendanceRecord {
            id: 7,
            employee_id: 3,
            date: date(),
            check_in_time: Some(at(9, 5, 0)),
            check_out_time: Some(at(18, 0, 0)),
            out_of_sight_duration: Duration::zero(),
            working_hours: Some(Duration::minutes(535)),
            status: AttendanceStatus::Present,
        };

        let state = PresenceState::from_record(&record);
        assert_eq!(state.phase, TrackingPhase::CheckedOut { at: at(18, 0, 0) });
        assert_eq!(state.working_hours(), Some(Duration::minutes(535)));
    }

    #[test]
    fn test_no_show_snapshot_is_an_absence() {
        let state = PresenceState::absent(1, date());
        let snapshot = state.snapshot().unwrap();
        assert!(snapshot.is_absence());
        assert_eq!(snapshot.status, AttendanceStatus::Absent);
        assert_eq!(snapshot.working_hours, None);

        let on_leave = PresenceState {
            status: AttendanceStatus::OnLeave,
            ..PresenceState::absent(1, date())
        };
        assert!(on_leave.snapshot().is_none());
    }

    #[test]
    fn test_acknowledge_old_revision_keeps_dirty() {
        let mut state = PresenceState::absent(1, date());
        state.touch();
        state.touch();
        state.acknowledge(1);
        assert!(state.is_dirty());
        state.acknowledge(2);
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_record_wire_format() {
        let json = serde_json::json!({
            "id": 1,
            "employee": 4,
            "date": "2024-01-10",
            "check_in_time": "2024-01-10T09:15:00Z",
            "check_out_time": null,
            "out_of_sight_time": 120,
            "working_hours": null,
            "status": "L"
        });

        let record: AttendanceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.employee_id, 4);
        assert_eq!(record.status, AttendanceStatus::Late);
        assert_eq!(record.out_of_sight_duration, Duration::seconds(120));
        assert_eq!(record.working_hours, None);
    }

    fn record_with(out_of_sight: serde_json::Value, worked: serde_json::Value) -> AttendanceRecord {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "employee": 4,
            "date": "2024-01-10",
            "check_in_time": "2024-01-10T09:00:00Z",
            "check_out_time": "2024-01-10T18:00:00Z",
            "out_of_sight_time": out_of_sight,
            "working_hours": worked,
            "status": "P"
        }))
        .unwrap()
    }

    #[test]
    fn test_record_accepts_store_duration_strings() {
        let record = record_with("00:02:00".into(), "1 02:00:00".into());
        assert_eq!(record.out_of_sight_duration, Duration::minutes(2));
        assert_eq!(record.working_hours, Some(Duration::hours(26)));

        let record = record_with("00:00:01.500000".into(), "08:57:59.25".into());
        assert_eq!(record.out_of_sight_duration, Duration::milliseconds(1500));
        assert_eq!(
            record.working_hours,
            Some(Duration::seconds(8 * 3600 + 57 * 60 + 59) + Duration::milliseconds(250))
        );
    }

    #[test]
    fn test_record_accepts_null_durations() {
        let record = record_with(serde_json::Value::Null, serde_json::Value::Null);
        assert_eq!(record.out_of_sight_duration, Duration::zero());
        assert_eq!(record.working_hours, None);

        let json = serde_json::json!({
            "id": 1,
            "employee": 4,
            "date": "2024-01-10",
            "status": "A"
        });
        let record: AttendanceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.out_of_sight_duration, Duration::zero());
        assert_eq!(record.check_in_time, None);
    }

    #[test]
    fn test_record_accepts_numeric_durations() {
        let record = record_with(90.into(), 1.5.into());
        assert_eq!(record.out_of_sight_duration, Duration::seconds(90));
        assert_eq!(record.working_hours, Some(Duration::milliseconds(1500)));
    }

    #[test]
    fn test_malformed_duration_is_rejected() {
        let json = serde_json::json!({
            "id": 1,
            "employee": 4,
            "date": "2024-01-10",
            "out_of_sight_time": "two minutes",
            "status": "P"
        });
        assert!(serde_json::from_value::<AttendanceRecord>(json).is_err());
        assert_eq!(duration_secs::parse("1:2:3:4"), None);
        assert_eq!(duration_secs::parse("00:01:"), None);
        assert_eq!(
            duration_secs::parse("2 days, 00:00:30"),
            Some(Duration::seconds(2 * 86400 + 30))
        );
        assert_eq!(
            duration_secs::parse("-1 23:59:00"),
            Some(Duration::seconds(-60))
        );
    }
}
