//! Leave requests and their effect on attendance.
//!
//! The synchronizer runs independently of the live tracker: approving a
//! leave materializes OnLeave rows for its date range, rejecting one removes
//! rows again. The workflow validates submissions and guards transitions.

use crate::core::presence::{AttendanceStatus, EmployeeId};
use crate::store::{
    NewAttendance, NewLeave, RetryPolicy, SharedNotifier, SharedStore, StoreError,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Leave approval status, using the store's single-letter codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaveStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "A")]
    Approved,
    #[serde(rename = "R")]
    Rejected,
}

impl LeaveStatus {
    /// Approved and rejected leaves can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LeaveStatus::Pending)
    }
}

impl std::fmt::Display for LeaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LeaveStatus::Pending => "Pending",
            LeaveStatus::Approved => "Approved",
            LeaveStatus::Rejected => "Rejected",
        };
        write!(f, "{label}")
    }
}

/// A leave request as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: u64,
    #[serde(rename = "employee")]
    pub employee_id: EmployeeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: LeaveStatus,
    #[serde(default)]
    pub reason: String,
}

impl LeaveRequest {
    /// Every date in `[start_date, end_date]`.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end_date;
        self.start_date.iter_days().take_while(move |d| *d <= end)
    }
}

/// Which attendance rows a rejection removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Delete any row in the range, whatever its status
    #[default]
    AnyRecord,
    /// Delete only OnLeave rows; tracked attendance survives
    OnLeaveOnly,
}

impl RejectionPolicy {
    fn removes(&self, status: AttendanceStatus) -> bool {
        match self {
            RejectionPolicy::AnyRecord => true,
            RejectionPolicy::OnLeaveOnly => status == AttendanceStatus::OnLeave,
        }
    }
}

/// What a synchronization pass did to attendance rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub deleted: usize,
    /// Dates left untouched (row already present, or kept by policy)
    pub skipped: usize,
}

/// Keeps attendance rows consistent with leave decisions.
pub struct LeaveAttendanceSynchronizer {
    store: SharedStore,
    notifier: SharedNotifier,
    policy: RejectionPolicy,
    retry: RetryPolicy,
}

impl LeaveAttendanceSynchronizer {
    pub fn new(
        store: SharedStore,
        notifier: SharedNotifier,
        policy: RejectionPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
            retry,
        }
    }

    pub fn policy(&self) -> RejectionPolicy {
        self.policy
    }

    /// Tell every approver about a new request. Returns how many were told.
    pub async fn on_created(&self, leave: &LeaveRequest) -> usize {
        let store = &self.store;
        let roster = match self.retry.run("list_roster", move || store.list_roster()).await {
            Ok(roster) => roster,
            Err(e) => {
                warn!(leave = leave.id, error = %e, "cannot notify approvers; roster unavailable");
                return 0;
            }
        };

        let requester = roster
            .iter()
            .find(|entry| entry.id == leave.employee_id)
            .map(|entry| entry.username.clone())
            .unwrap_or_else(|| format!("employee {}", leave.employee_id));
        let content = format!(
            "Leave request created by {} from {} to {}. Waiting for approval.",
            requester, leave.start_date, leave.end_date
        );

        let mut notified = 0;
        for approver in roster.iter().filter(|entry| entry.role.approves_leave()) {
            if self.notify(approver.id, &content).await {
                notified += 1;
            }
        }
        notified
    }

    /// React to a status change from `previous` to `leave.status`.
    ///
    /// Only Pending to Approved or Rejected changes anything.
    pub async fn on_transition(
        &self,
        leave: &LeaveRequest,
        previous: LeaveStatus,
    ) -> Result<SyncReport, StoreError> {
        if previous != LeaveStatus::Pending || leave.status == LeaveStatus::Pending {
            debug!(
                leave = leave.id,
                from = %previous,
                to = %leave.status,
                "leave transition has no attendance effect"
            );
            return Ok(SyncReport::default());
        }

        let report = self.reconcile(leave).await?;

        let verdict = if leave.status == LeaveStatus::Approved {
            "accepted"
        } else {
            "rejected"
        };
        let content = format!(
            "Your leave request from {} to {} has been {}.",
            leave.start_date, leave.end_date, verdict
        );
        self.notify(leave.employee_id, &content).await;

        info!(
            leave = leave.id,
            employee = leave.employee_id,
            status = %leave.status,
            created = report.created,
            deleted = report.deleted,
            skipped = report.skipped,
            "leave synchronized with attendance"
        );
        Ok(report)
    }

    /// Bring the attendance rows of `leave`'s range in line with its status.
    ///
    /// Idempotent and silent: rows already in the right shape are skipped and
    /// nobody is notified. A Pending leave has no attendance effect.
    pub async fn reconcile(&self, leave: &LeaveRequest) -> Result<SyncReport, StoreError> {
        match leave.status {
            LeaveStatus::Approved => self.materialize(leave).await,
            LeaveStatus::Rejected => self.retract(leave).await,
            LeaveStatus::Pending => Ok(SyncReport::default()),
        }
    }

    async fn materialize(&self, leave: &LeaveRequest) -> Result<SyncReport, StoreError> {
        let store = &self.store;
        let employee = leave.employee_id;
        let mut report = SyncReport::default();

        for date in leave.dates() {
            let exists = self
                .retry
                .run("record_exists", move || store.record_exists(employee, date))
                .await?;
            if exists {
                report.skipped += 1;
                continue;
            }

            let row = NewAttendance::with_status(employee, date, AttendanceStatus::OnLeave);
            match self
                .retry
                .run("create_record", || store.create_record(row.clone()))
                .await
            {
                Ok(_) => report.created += 1,
                // Written concurrently by someone else; theirs wins.
                Err(StoreError::Validation(message)) => {
                    debug!(employee, %date, %message, "attendance row appeared concurrently");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    async fn retract(&self, leave: &LeaveRequest) -> Result<SyncReport, StoreError> {
        let store = &self.store;
        let employee = leave.employee_id;
        let mut report = SyncReport::default();

        for date in leave.dates() {
            let existing = self
                .retry
                .run("find_record", move || store.find_record(employee, date))
                .await?;
            let Some(record) = existing else {
                continue;
            };
            if !self.policy.removes(record.status) {
                report.skipped += 1;
                continue;
            }

            let id = record.id;
            match self
                .retry
                .run("delete_record", move || store.delete_record(id))
                .await
            {
                Ok(()) => report.deleted += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    async fn notify(&self, receiver: EmployeeId, content: &str) -> bool {
        match self.notifier.notify(receiver, content).await {
            Ok(()) => true,
            Err(e) => {
                warn!(receiver, error = %e, "notification delivery failed");
                false
            }
        }
    }
}

/// Leave workflow failures.
#[derive(Debug, thiserror::Error)]
pub enum LeaveError {
    #[error("invalid leave request: {0}")]
    Validation(String),
    #[error("leave {id} is already {status}")]
    AlreadyDecided { id: u64, status: LeaveStatus },
    #[error("leave {id} belongs to another employee")]
    NotOwner { id: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Submission, decision and withdrawal of leave requests.
pub struct LeaveWorkflow {
    store: SharedStore,
    sync: LeaveAttendanceSynchronizer,
    timezone: Tz,
    same_day_cutoff: NaiveTime,
}

impl LeaveWorkflow {
    pub fn new(
        store: SharedStore,
        sync: LeaveAttendanceSynchronizer,
        timezone: Tz,
        same_day_cutoff: NaiveTime,
    ) -> Self {
        Self {
            store,
            sync,
            timezone,
            same_day_cutoff,
        }
    }

    /// Check a request against the submission rules at local time `now`.
    pub fn validate(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LeaveError> {
        let local = now.with_timezone(&self.timezone);
        let today = local.date_naive();

        if start_date == today && local.time() <= self.same_day_cutoff {
            return Err(LeaveError::Validation(format!(
                "Start date cannot be before {} today.",
                self.same_day_cutoff.format("%H:%M")
            )));
        }
        if start_date < today {
            return Err(LeaveError::Validation(
                "Start date cannot be in the past.".to_string(),
            ));
        }
        if end_date < start_date {
            return Err(LeaveError::Validation(
                "End date cannot be earlier than start date.".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(LeaveError::Validation("A reason is required.".to_string()));
        }
        Ok(())
    }

    /// Validate and create a Pending leave, then notify approvers.
    pub async fn submit(
        &self,
        requester: EmployeeId,
        start_date: NaiveDate,
        end_date: NaiveDate,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LeaveRequest, LeaveError> {
        self.validate(start_date, end_date, reason, now)?;

        let leave = self
            .store
            .create_leave(NewLeave {
                employee_id: requester,
                start_date,
                end_date,
                status: LeaveStatus::Pending,
                reason: reason.trim().to_string(),
            })
            .await?;

        info!(
            leave = leave.id,
            employee = requester,
            start = %start_date,
            end = %end_date,
            "leave request submitted"
        );
        self.sync.on_created(&leave).await;
        Ok(leave)
    }

    /// Approve or reject a Pending leave and synchronize attendance.
    pub async fn decide(
        &self,
        leave_id: u64,
        decision: LeaveStatus,
    ) -> Result<(LeaveRequest, SyncReport), LeaveError> {
        if !decision.is_terminal() {
            return Err(LeaveError::Validation(
                "a decision must approve or reject".to_string(),
            ));
        }

        let current = self.store.get_leave(leave_id).await?;
        if current.status.is_terminal() {
            return Err(LeaveError::AlreadyDecided {
                id: leave_id,
                status: current.status,
            });
        }

        let updated = self.store.update_leave_status(leave_id, decision).await?;
        let report = self.sync.on_transition(&updated, current.status).await?;
        Ok((updated, report))
    }

    /// Re-run attendance synchronization for a decided leave.
    ///
    /// Completes a decision whose synchronization failed partway through the
    /// range; the status itself is already committed, so `decide` cannot be
    /// repeated.
    pub async fn resync(&self, leave_id: u64) -> Result<(LeaveRequest, SyncReport), LeaveError> {
        let leave = self.store.get_leave(leave_id).await?;
        if !leave.status.is_terminal() {
            return Err(LeaveError::Validation(format!("leave {leave_id} is still pending")));
        }

        let report = self.sync.reconcile(&leave).await?;
        info!(
            leave = leave_id,
            status = %leave.status,
            created = report.created,
            deleted = report.deleted,
            skipped = report.skipped,
            "leave resynchronized with attendance"
        );
        Ok((leave, report))
    }

    /// Delete a Pending leave on behalf of its owner.
    pub async fn withdraw(&self, leave_id: u64, requester: EmployeeId) -> Result<(), LeaveError> {
        let current = self.store.get_leave(leave_id).await?;
        if current.employee_id != requester {
            return Err(LeaveError::NotOwner { id: leave_id });
        }
        if current.status.is_terminal() {
            return Err(LeaveError::AlreadyDecided {
                id: leave_id,
                status: current.status,
            });
        }

        self.store.delete_leave(leave_id).await?;
        info!(leave = leave_id, employee = requester, "leave request withdrawn");
        Ok(())
    }
}
