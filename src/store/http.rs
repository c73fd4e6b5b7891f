//! HTTP client for the attendance backend.
//!
//! Speaks the backend's REST shape: resources under `{base}/attendance/` and
//! `{base}/notification/`, responses wrapped in `{error, message, data}`
//! envelopes (some endpoints return the bare object).

use crate::config::StoreConfig;
use crate::core::leave::{LeaveRequest, LeaveStatus};
use crate::core::presence::{AttendanceRecord, EmployeeId};
use crate::core::roster::RosterEntry;
use crate::store::{
    AttendancePatch, NewAttendance, NewLeave, Notification, Notifier, RecordHandle, RecordStore,
    StoreError,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

impl StoreConfig {
    fn attendance(&self) -> String {
        format!("{}/attendance", self.base_url.trim_end_matches('/'))
    }

    /// Roster endpoint.
    pub fn users_url(&self) -> String {
        format!("{}/list-users/", self.attendance())
    }

    /// Attendance collection endpoint.
    pub fn records_url(&self) -> String {
        format!("{}/get-attendance/", self.attendance())
    }

    pub fn record_url(&self, id: u64) -> String {
        format!("{}/get-attendance/{id}/", self.attendance())
    }

    /// Per-employee attendance history.
    pub fn employee_records_url(&self, employee: EmployeeId) -> String {
        format!(
            "{}/get-attendance/user-attendance/{employee}/",
            self.attendance()
        )
    }

    pub fn check_attendance_url(&self) -> String {
        format!("{}/get-attendance/check-attendance/", self.attendance())
    }

    pub fn attendance_id_url(&self) -> String {
        format!("{}/get-attendance/get-attendance-id/", self.attendance())
    }

    pub fn leaves_url(&self) -> String {
        format!("{}/leaves/", self.attendance())
    }

    pub fn leave_url(&self, id: u64) -> String {
        format!("{}/leaves/{id}/", self.attendance())
    }

    pub fn notifications_url(&self) -> String {
        format!(
            "{}/notification/get-notification/",
            self.base_url.trim_end_matches('/')
        )
    }
}

/// Envelope fields the client inspects.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    message: String,
}

/// Map a non-success HTTP status to a store error.
pub fn status_error(status: u16, message: String) -> StoreError {
    match status {
        400 | 409 | 422 => StoreError::Validation(message),
        404 => StoreError::NotFound(message),
        408 | 429 | 500..=599 => StoreError::Transient(format!("HTTP {status}: {message}")),
        _ => StoreError::Rejected { status, message },
    }
}

/// Decode `T` from an envelope's `data`, or from the body itself when the
/// endpoint does not wrap its response.
fn decode<T: DeserializeOwned>(mut body: Value) -> Result<T, StoreError> {
    let payload = match body.get_mut("data") {
        Some(data) => data.take(),
        None => body,
    };
    serde_json::from_value(payload).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Record store backed by the REST backend.
pub struct HttpRecordStore {
    config: StoreConfig,
    client: reqwest::Client,
    station_id: String,
}

impl HttpRecordStore {
    /// Create a new client.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Config(format!("failed to create HTTP client: {e}")))?;

        // Station ID from hostname + instance
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let station_id = format!(
            "presence-{}-{}",
            hostname,
            &uuid::Uuid::new_v4().to_string()[..8]
        );

        Ok(Self {
            config,
            client,
            station_id,
        })
    }

    /// Identifier sent with every request.
    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Option<Value>, StoreError> {
        let mut request = request.header("X-Station-Id", &self.station_id);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope>(&text)
                .map(|envelope| envelope.message)
                .ok()
                .filter(|message| !message.is_empty())
                .unwrap_or(text);
            return Err(status_error(status.as_u16(), message));
        }

        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, StoreError> {
        let body = self
            .send(request)
            .await?
            .ok_or_else(|| StoreError::Serialization("empty response body".to_string()))?;
        decode(body)
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn list_roster(&self) -> Result<Vec<RosterEntry>, StoreError> {
        self.fetch(self.client.get(self.config.users_url())).await
    }

    async fn record_exists(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let request = self.client.get(self.config.check_attendance_url()).query(&[
            ("user_id", employee.to_string()),
            ("date", date.to_string()),
        ]);
        let body = self
            .send(request)
            .await?
            .ok_or_else(|| StoreError::Serialization("empty response body".to_string()))?;
        let envelope: Envelope =
            serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))?;
        // The endpoint flags an existing row through `error`.
        Ok(envelope.error)
    }

    async fn find_record(
        &self,
        employee: EmployeeId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let request = self.client.get(self.config.employee_records_url(employee));
        match self.fetch::<Vec<AttendanceRecord>>(request).await {
            Ok(records) => Ok(records.into_iter().find(|r| r.date == date)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lookup_record(
        &self,
        username: &str,
        date: NaiveDate,
    ) -> Result<RecordHandle, StoreError> {
        let request = self.client.get(self.config.attendance_id_url()).query(&[
            ("username", username.to_string()),
            ("date", date.to_string()),
        ]);
        match self.fetch(request).await {
            // A missing row comes back as 400.
            Err(StoreError::Validation(message)) => Err(StoreError::NotFound(message)),
            other => other,
        }
    }

    async fn create_record(&self, record: NewAttendance) -> Result<AttendanceRecord, StoreError> {
        debug!(
            employee = record.employee_id,
            date = %record.date,
            status = %record.status,
            "creating attendance row"
        );
        self.fetch(self.client.post(self.config.records_url()).json(&record))
            .await
    }

    async fn patch_record(
        &self,
        id: u64,
        patch: AttendancePatch,
    ) -> Result<AttendanceRecord, StoreError> {
        self.send(self.client.patch(self.config.record_url(id)).json(&patch))
            .await?;
        // The patch response does not carry the row; read it back.
        self.fetch(self.client.get(self.config.record_url(id))).await
    }

    async fn delete_record(&self, id: u64) -> Result<(), StoreError> {
        self.send(self.client.delete(self.config.record_url(id)))
            .await
            .map(|_| ())
    }

    async fn create_leave(&self, leave: NewLeave) -> Result<LeaveRequest, StoreError> {
        self.fetch(self.client.post(self.config.leaves_url()).json(&leave))
            .await
    }

    async fn get_leave(&self, id: u64) -> Result<LeaveRequest, StoreError> {
        self.fetch(self.client.get(self.config.leave_url(id))).await
    }

    async fn update_leave_status(
        &self,
        id: u64,
        status: LeaveStatus,
    ) -> Result<LeaveRequest, StoreError> {
        let body = serde_json::json!({ "status": status });
        self.fetch(self.client.patch(self.config.leave_url(id)).json(&body))
            .await
    }

    async fn delete_leave(&self, id: u64) -> Result<(), StoreError> {
        self.send(self.client.delete(self.config.leave_url(id)))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Notifier for HttpRecordStore {
    async fn notify(&self, receiver: EmployeeId, content: &str) -> Result<(), StoreError> {
        let notification = Notification {
            receiver_id: receiver,
            content: content.to_string(),
        };
        self.send(
            self.client
                .post(self.config.notifications_url())
                .json(&notification),
        )
        .await
        .map(|_| ())
    }
}
