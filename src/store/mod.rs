//! Record store and notification ports.
//!
//! The record store is a network service holding attendance and leave rows.
//! Everything in the core talks to it through [`RecordStore`], so tests run
//! against [`memory::InMemoryStore`] and production uses
//! [`http::HttpRecordStore`].

use crate::core::leave::{LeaveRequest, LeaveStatus};
use crate::core::presence::{AttendanceRecord, AttendanceStatus, EmployeeId};
use crate::core::roster::RosterEntry;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[cfg(feature = "http-store")]
pub mod http;
pub mod memory;
pub mod retry;

pub use memory::InMemoryStore;
pub use retry::RetryPolicy;

#[cfg(feature = "http-store")]
pub use http::HttpRecordStore;

/// Record store error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Request was malformed or violated a store constraint
    #[error("validation error: {0}")]
    Validation(String),
    /// Target row does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Network failure or server-side error; safe to retry
    #[error("transient store error: {0}")]
    Transient(String),
    /// Store refused the request for another reason
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Response body could not be decoded
    #[error("store serialization error: {0}")]
    Serialization(String),
    /// Client could not be configured
    #[error("store config error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Payload for creating an attendance row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAttendance {
    #[serde(rename = "employee")]
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "out_of_sight_time",
        serialize_with = "crate::core::presence::duration_secs::serialize"
    )]
    pub out_of_sight_duration: Duration,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::core::presence::duration_secs::option::serialize"
    )]
    pub working_hours: Option<Duration>,
}

impl NewAttendance {
    /// Minimal row for a status with no presence data (Absent, OnLeave).
    pub fn with_status(employee_id: EmployeeId, date: NaiveDate, status: AttendanceStatus) -> Self {
        Self {
            employee_id,
            date,
            status,
            check_in_time: None,
            check_out_time: None,
            out_of_sight_duration: Duration::zero(),
            working_hours: None,
        }
    }
}

/// Partial update of an attendance row; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttendancePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AttendanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "out_of_sight_time",
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::core::presence::duration_secs::option::serialize"
    )]
    pub out_of_sight_duration: Option<Duration>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::core::presence::duration_secs::option::serialize"
    )]
    pub working_hours: Option<Duration>,
}

impl AttendancePatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.check_in_time.is_none()
            && self.check_out_time.is_none()
            && self.out_of_sight_duration.is_none()
            && self.working_hours.is_none()
    }

    /// Apply the patch to a record in place.
    pub fn apply_to(&self, record: &mut AttendanceRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(check_in) = self.check_in_time {
            record.check_in_time = Some(check_in);
        }
        if let Some(check_out) = self.check_out_time {
            record.check_out_time = Some(check_out);
        }
        if let Some(out_of_sight) = self.out_of_sight_duration {
            record.out_of_sight_duration = out_of_sight;
        }
        if let Some(worked) = self.working_hours {
            record.working_hours = Some(worked);
        }
    }
}

/// Lightweight handle for a record looked up by username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHandle {
    pub id: u64,
    /// True while the record still says Absent (no check-in yet)
    pub is_first: bool,
    #[serde(default)]
    pub status: Option<AttendanceStatus>,
}

/// Payload for creating a leave request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewLeave {
    #[serde(rename = "employee")]
    pub employee_id: EmployeeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: LeaveStatus,
    pub reason: String,
}

/// A notification addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "receiver")]
    pub receiver_id: EmployeeId,
    pub content: String,
}

/// Attendance and leave persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every user tracked by the agent.
    async fn list_roster(&self) -> Result<Vec<RosterEntry>, StoreError>;

    /// Whether any attendance row exists for `(employee, date)`.
    async fn record_exists(&self, employee: EmployeeId, date: NaiveDate)
        -> Result<bool, StoreError>;

    /// The attendance row for `(employee, date)`, if any.
    async fn find_record(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Look up a row by username. Fails with `NotFound` when there is none.
    async fn lookup_record(&self, username: &str, date: NaiveDate)
        -> Result<RecordHandle, StoreError>;

    async fn create_record(&self, record: NewAttendance) -> Result<AttendanceRecord, StoreError>;

    async fn patch_record(
        &self,
        id: u64,
        patch: AttendancePatch,
    ) -> Result<AttendanceRecord, StoreError>;

    async fn delete_record(&self, id: u64) -> Result<(), StoreError>;

    async fn create_leave(&self, leave: NewLeave) -> Result<LeaveRequest, StoreError>;

    async fn get_leave(&self, id: u64) -> Result<LeaveRequest, StoreError>;

    async fn update_leave_status(
        &self,
        id: u64,
        status: LeaveStatus,
    ) -> Result<LeaveRequest, StoreError>;

    async fn delete_leave(&self, id: u64) -> Result<(), StoreError>;
}

/// Fire-and-forget notification delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, receiver: EmployeeId, content: &str) -> Result<(), StoreError>;
}

/// Thread-safe shared record store.
pub type SharedStore = Arc<dyn RecordStore>;

/// Thread-safe shared notifier.
pub type SharedNotifier = Arc<dyn Notifier>;
