//! Persisting presence snapshots.
//!
//! A flush is idempotent: the flusher reads the current row, creates it when
//! missing and otherwise patches only the fields that differ. Rows marked
//! OnLeave belong to the leave workflow and are never overwritten. An absence
//! snapshot only ever creates a missing Absent row; it never touches an
//! existing one.

use crate::core::presence::{AttendanceRecord, AttendanceStatus, FlushSnapshot};
use crate::store::{AttendancePatch, NewAttendance, SharedStore, StoreError};
use tracing::debug;

/// What a flush did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Created(AttendanceRecord),
    Patched(AttendanceRecord),
    /// Row already matched the snapshot
    Unchanged,
    /// Row is OnLeave; tracking does not override it
    SkippedOnLeave,
}

/// Fields of `existing` that differ from `snapshot`.
///
/// Durations are compared at whole-second precision, the granularity the
/// store keeps.
pub fn patch_for(existing: &AttendanceRecord, snapshot: &FlushSnapshot) -> AttendancePatch {
    let mut patch = AttendancePatch::default();

    if existing.status != snapshot.status {
        patch.status = Some(snapshot.status);
    }
    if snapshot.check_in_time.is_some() && existing.check_in_time != snapshot.check_in_time {
        patch.check_in_time = snapshot.check_in_time;
    }
    if snapshot.check_out_time.is_some() && existing.check_out_time != snapshot.check_out_time {
        patch.check_out_time = snapshot.check_out_time;
    }
    if existing.out_of_sight_duration.num_seconds()
        != snapshot.out_of_sight_duration.num_seconds()
    {
        patch.out_of_sight_duration = Some(snapshot.out_of_sight_duration);
    }
    if let Some(worked) = snapshot.working_hours {
        if existing.working_hours.map(|w| w.num_seconds()) != Some(worked.num_seconds()) {
            patch.working_hours = Some(worked);
        }
    }

    patch
}

fn new_record(snapshot: &FlushSnapshot) -> NewAttendance {
    NewAttendance {
        employee_id: snapshot.employee_id,
        date: snapshot.date,
        status: snapshot.status,
        check_in_time: snapshot.check_in_time,
        check_out_time: snapshot.check_out_time,
        out_of_sight_duration: snapshot.out_of_sight_duration,
        working_hours: snapshot.working_hours,
    }
}

/// Converts snapshots into store writes.
#[derive(Clone)]
pub struct AttendanceFlusher {
    store: SharedStore,
}

impl AttendanceFlusher {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Persist one snapshot.
    pub async fn flush(&self, snapshot: &FlushSnapshot) -> Result<FlushOutcome, StoreError> {
        let existing = self
            .store
            .find_record(snapshot.employee_id, snapshot.date)
            .await?;

        let Some(existing) = existing else {
            return match self.create(snapshot).await {
                // Another writer created the day's row first.
                Err(StoreError::Validation(_)) if snapshot.is_absence() => {
                    Ok(FlushOutcome::Unchanged)
                }
                result => result,
            };
        };

        if existing.status == AttendanceStatus::OnLeave {
            debug!(
                employee = snapshot.employee_id,
                date = %snapshot.date,
                "attendance row is on leave; not flushing"
            );
            return Ok(FlushOutcome::SkippedOnLeave);
        }
        if snapshot.is_absence() {
            return Ok(FlushOutcome::Unchanged);
        }

        let patch = patch_for(&existing, snapshot);
        if patch.is_empty() {
            return Ok(FlushOutcome::Unchanged);
        }

        match self.store.patch_record(existing.id, patch).await {
            Ok(record) => Ok(FlushOutcome::Patched(record)),
            // Deleted between read and write.
            Err(StoreError::NotFound(_)) => self.create(snapshot).await,
            Err(e) => Err(e),
        }
    }

    async fn create(&self, snapshot: &FlushSnapshot) -> Result<FlushOutcome, StoreError> {
        let record = self.store.create_record(new_record(snapshot)).await?;
        Ok(FlushOutcome::Created(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use std::sync::Arc;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    fn checkpoint() -> FlushSnapshot {
        FlushSnapshot {
            employee_id: 1,
            date: date(),
            status: AttendanceStatus::Present,
            check_in_time: Some(at(9, 0)),
            check_out_time: None,
            out_of_sight_duration: Duration::seconds(90),
            working_hours: None,
            revision: 2,
        }
    }

    fn checkout() -> FlushSnapshot {
        FlushSnapshot {
            check_out_time: Some(at(17, 0)),
            working_hours: Some(Duration::hours(8) - Duration::seconds(90)),
            revision: 5,
            ..checkpoint()
        }
    }

    #[tokio::test]
    async fn test_first_flush_creates_row() {
        let store = Arc::new(InMemoryStore::new());
        let flusher = AttendanceFlusher::new(store.clone());

        let outcome = flusher.flush(&checkpoint()).await.unwrap();

        assert!(matches!(outcome, FlushOutcome::Created(_)));
        let row = store.record_for(1, date()).unwrap();
        assert_eq!(row.check_in_time, Some(at(9, 0)));
        assert_eq!(row.out_of_sight_duration, Duration::seconds(90));
    }

    #[tokio::test]
    async fn test_repeated_flush_is_unchanged() {
        let store = Arc::new(InMemoryStore::new());
        let flusher = AttendanceFlusher::new(store.clone());

        flusher.flush(&checkpoint()).await.unwrap();
        let again = flusher.flush(&checkpoint()).await.unwrap();

        assert_eq!(again, FlushOutcome::Unchanged);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_checkout_patches_only_changed_fields() {
        let store = Arc::new(InMemoryStore::new());
        let flusher = AttendanceFlusher::new(store.clone());
        flusher.flush(&checkpoint()).await.unwrap();

        let existing = store.record_for(1, date()).unwrap();
        let patch = patch_for(&existing, &checkout());
        assert_eq!(patch.status, None);
        assert_eq!(patch.check_in_time, None);
        assert_eq!(patch.out_of_sight_duration, None);
        assert_eq!(patch.check_out_time, Some(at(17, 0)));
        assert!(patch.working_hours.is_some());

        match flusher.flush(&checkout()).await.unwrap() {
            FlushOutcome::Patched(row) => {
                assert_eq!(row.check_out_time, Some(at(17, 0)));
                assert_eq!(row.working_hours, checkout().working_hours);
            }
            other => panic!("expected a patch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_on_leave_row_is_never_overwritten() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_record(NewAttendance::with_status(
            1,
            date(),
            AttendanceStatus::OnLeave,
        ));
        let before = store.records();
        let flusher = AttendanceFlusher::new(store.clone());

        let outcome = flusher.flush(&checkout()).await.unwrap();

        assert_eq!(outcome, FlushOutcome::SkippedOnLeave);
        assert_eq!(store.records(), before);
    }

    #[tokio::test]
    async fn test_absent_row_is_upgraded() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_record(NewAttendance::with_status(
            1,
            date(),
            AttendanceStatus::Absent,
        ));
        let flusher = AttendanceFlusher::new(store.clone());

        let outcome = flusher.flush(&checkpoint()).await.unwrap();

        assert!(matches!(outcome, FlushOutcome::Patched(_)));
        let row = store.record_for(1, date()).unwrap();
        assert_eq!(row.status, AttendanceStatus::Present);
        assert_eq!(store.records().len(), 1);
    }

    fn absence() -> FlushSnapshot {
        FlushSnapshot {
            status: AttendanceStatus::Absent,
            check_in_time: None,
            out_of_sight_duration: Duration::zero(),
            revision: 1,
            ..checkpoint()
        }
    }

    #[tokio::test]
    async fn test_absence_creates_absent_row() {
        let store = Arc::new(InMemoryStore::new());
        let flusher = AttendanceFlusher::new(store.clone());

        let outcome = flusher.flush(&absence()).await.unwrap();

        assert!(matches!(outcome, FlushOutcome::Created(_)));
        let row = store.record_for(1, date()).unwrap();
        assert_eq!(row.status, AttendanceStatus::Absent);
        assert_eq!(row.check_in_time, None);
        assert_eq!(row.working_hours, None);
    }

    #[tokio::test]
    async fn test_absence_never_touches_existing_rows() {
        for status in [
            AttendanceStatus::OnLeave,
            AttendanceStatus::Absent,
            AttendanceStatus::Present,
        ] {
            let store = Arc::new(InMemoryStore::new());
            store.insert_record(NewAttendance {
                check_in_time: status.is_checked_in().then(|| at(9, 0)),
                ..NewAttendance::with_status(1, date(), status)
            });
            let before = store.records();
            let flusher = AttendanceFlusher::new(store.clone());

            let outcome = flusher.flush(&absence()).await.unwrap();

            assert!(matches!(
                outcome,
                FlushOutcome::Unchanged | FlushOutcome::SkippedOnLeave
            ));
            assert_eq!(store.records(), before, "{status:?}");
        }
    }

    #[tokio::test]
    async fn test_transient_error_is_returned() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next(1);
        let flusher = AttendanceFlusher::new(store.clone());

        let result = flusher.flush(&checkpoint()).await;
        assert!(result.unwrap_err().is_transient());
        assert!(store.records().is_empty());
    }
}
