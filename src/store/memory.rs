//! In-memory record store.
//!
//! Enforces the same constraints as the real backend (one attendance row per
//! employee and date, leave date ordering) and supports injecting transient
//! failures so retry and deferral paths can be exercised.

use crate::core::leave::{LeaveRequest, LeaveStatus};
use crate::core::presence::{AttendanceRecord, AttendanceStatus, EmployeeId};
use crate::core::roster::RosterEntry;
use crate::store::{
    AttendancePatch, NewAttendance, NewLeave, Notification, Notifier, RecordHandle, RecordStore,
    StoreError,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    roster: Vec<RosterEntry>,
    roster_unavailable: bool,
    records: BTreeMap<u64, AttendanceRecord>,
    leaves: BTreeMap<u64, LeaveRequest>,
    notifications: Vec<Notification>,
    next_record_id: u64,
    next_leave_id: u64,
    pending_failures: u32,
    /// Calls that succeed before the pending failures start
    healthy_calls: u32,
}

impl Inner {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        if self.pending_failures > 0 && self.healthy_calls > 0 {
            self.healthy_calls -= 1;
            return Ok(());
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    fn record_for(&self, employee: EmployeeId, date: NaiveDate) -> Option<&AttendanceRecord> {
        self.records
            .values()
            .find(|r| r.employee_id == employee && r.date == date)
    }
}

/// Record store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given roster.
    pub fn with_roster(roster: Vec<RosterEntry>) -> Self {
        let store = Self::new();
        store.lock().roster = roster;
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` store calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_after(0, count);
    }

    /// Let `calls` store calls through, then fail the following `count`.
    pub fn fail_after(&self, calls: u32, count: u32) {
        let mut inner = self.lock();
        inner.healthy_calls = calls;
        inner.pending_failures = count;
    }

    /// Make roster fetches fail until reset.
    pub fn set_roster_unavailable(&self, unavailable: bool) {
        self.lock().roster_unavailable = unavailable;
    }

    /// Insert a row directly, bypassing validation. Returns its id.
    pub fn insert_record(&self, record: NewAttendance) -> u64 {
        let mut inner = self.lock();
        inner.next_record_id += 1;
        let id = inner.next_record_id;
        inner.records.insert(id, materialize(id, record));
        id
    }

    /// Insert a leave directly, bypassing validation. Returns its id.
    pub fn insert_leave(&self, leave: NewLeave) -> u64 {
        let mut inner = self.lock();
        inner.next_leave_id += 1;
        let id = inner.next_leave_id;
        inner.leaves.insert(id, leave_from(id, leave));
        id
    }

    /// All attendance rows, ordered by id.
    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// The row for `(employee, date)`, if any.
    pub fn record_for(&self, employee: EmployeeId, date: NaiveDate) -> Option<AttendanceRecord> {
        self.lock().record_for(employee, date).cloned()
    }

    /// All notifications created so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    pub fn leave(&self, id: u64) -> Option<LeaveRequest> {
        self.lock().leaves.get(&id).cloned()
    }
}

fn materialize(id: u64, record: NewAttendance) -> AttendanceRecord {
    AttendanceRecord {
        id,
        employee_id: record.employee_id,
        date: record.date,
        check_in_time: record.check_in_time,
        check_out_time: record.check_out_time,
        out_of_sight_duration: record.out_of_sight_duration,
        working_hours: record.working_hours,
        status: record.status,
    }
}

fn leave_from(id: u64, leave: NewLeave) -> LeaveRequest {
    LeaveRequest {
        id,
        employee_id: leave.employee_id,
        start_date: leave.start_date,
        end_date: leave.end_date,
        status: leave.status,
        reason: leave.reason,
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn list_roster(&self) -> Result<Vec<RosterEntry>, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        if inner.roster_unavailable {
            return Err(StoreError::Transient("roster unavailable".to_string()));
        }
        Ok(inner.roster.clone())
    }

    async fn record_exists(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        Ok(inner.record_for(employee, date).is_some())
    }

    async fn find_record(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        Ok(inner.record_for(employee, date).cloned())
    }

    async fn lookup_record(
        &self,
        username: &str,
        date: NaiveDate,
    ) -> Result<RecordHandle, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let employee = inner
            .roster
            .iter()
            .find(|entry| entry.username.eq_ignore_ascii_case(username))
            .map(|entry| entry.id)
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))?;

        let record = inner.record_for(employee, date).ok_or_else(|| {
            StoreError::NotFound(format!("attendance for {username} on {date}"))
        })?;

        Ok(RecordHandle {
            id: record.id,
            is_first: record.status == AttendanceStatus::Absent,
            status: Some(record.status),
        })
    }

    async fn create_record(&self, record: NewAttendance) -> Result<AttendanceRecord, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        if inner.record_for(record.employee_id, record.date).is_some() {
            return Err(StoreError::Validation(format!(
                "attendance for employee {} on {} already exists",
                record.employee_id, record.date
            )));
        }

        inner.next_record_id += 1;
        let id = inner.next_record_id;
        let created = materialize(id, record);
        inner.records.insert(id, created.clone());
        Ok(created)
    }

    async fn patch_record(
        &self,
        id: u64,
        patch: AttendancePatch,
    ) -> Result<AttendanceRecord, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("attendance {id}")))?;
        patch.apply_to(record);
        Ok(record.clone())
    }

    async fn delete_record(&self, id: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        inner
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("attendance {id}")))
    }

    async fn create_leave(&self, leave: NewLeave) -> Result<LeaveRequest, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        if leave.end_date < leave.start_date {
            return Err(StoreError::Validation(
                "End date cannot be earlier than start date.".to_string(),
            ));
        }

        inner.next_leave_id += 1;
        let id = inner.next_leave_id;
        let created = leave_from(id, leave);
        inner.leaves.insert(id, created.clone());
        Ok(created)
    }

    async fn get_leave(&self, id: u64) -> Result<LeaveRequest, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        inner
            .leaves
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("leave {id}")))
    }

    async fn update_leave_status(
        &self,
        id: u64,
        status: LeaveStatus,
    ) -> Result<LeaveRequest, StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        let leave = inner
            .leaves
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("leave {id}")))?;
        leave.status = status;
        Ok(leave.clone())
    }

    async fn delete_leave(&self, id: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        inner
            .leaves
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("leave {id}")))
    }
}

#[async_trait]
impl Notifier for InMemoryStore {
    async fn notify(&self, receiver: EmployeeId, content: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.take_failure()?;
        inner.notifications.push(Notification {
            receiver_id: receiver,
            content: content.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_day() {
        let store = InMemoryStore::new();
        let row = NewAttendance::with_status(1, date(), AttendanceStatus::Absent);

        store.create_record(row.clone()).await.unwrap();
        let second = store.create_record(row).await;

        assert!(matches!(second, Err(StoreError::Validation(_))));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next(1);

        assert!(store.record_exists(1, date()).await.unwrap_err().is_transient());
        assert!(!store.record_exists(1, date()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delayed_failures_start_after_healthy_calls() {
        let store = InMemoryStore::new();
        store.fail_after(2, 1);

        assert!(!store.record_exists(1, date()).await.unwrap());
        assert!(store.find_record(1, date()).await.unwrap().is_none());
        assert!(store.record_exists(1, date()).await.unwrap_err().is_transient());
        assert!(!store.record_exists(1, date()).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_reports_first_sighting() {
        let store = InMemoryStore::with_roster(vec![RosterEntry::employee(5, "Carol")]);
        store.insert_record(NewAttendance::with_status(5, date(), AttendanceStatus::Absent));

        let handle = store.lookup_record("carol", date()).await.unwrap();
        assert!(handle.is_first);
        assert_eq!(handle.status, Some(AttendanceStatus::Absent));

        let missing = store.lookup_record("dave", date()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_patch_missing_record_is_not_found() {
        let store = InMemoryStore::new();
        let result = store.patch_record(99, AttendancePatch::default()).await;
        assert!(result.unwrap_err().is_not_found());
    }
}
