//! Core functionality for the presence agent.
//!
//! This module contains:
//! - Attendance records and per-day presence state
//! - Roster initialization at the start of a day
//! - The presence tracker that folds recognition events into state
//! - Flushing presence snapshots to the record store
//! - Leave requests and their attendance side effects

pub mod flusher;
pub mod leave;
pub mod presence;
pub mod roster;
pub mod tracker;

// Re-export commonly used types
pub use flusher::{AttendanceFlusher, FlushOutcome};
pub use leave::{
    LeaveAttendanceSynchronizer, LeaveError, LeaveRequest, LeaveStatus, LeaveWorkflow,
    RejectionPolicy, SyncReport,
};
pub use presence::{
    AttendanceRecord, AttendanceStatus, EmployeeId, FlushSnapshot, PresenceState, TrackingPhase,
};
pub use roster::{DailyRosterInitializer, DayRoster, InitError, Role, RosterEntry};
pub use tracker::{Observation, PresenceTracker, TrackerConfig};
