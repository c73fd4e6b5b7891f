//! Presence Agent - camera-driven attendance tracking.
//!
//! This library turns a stream of recognition sightings ("employee X was seen
//! at time T") into daily attendance records, and keeps those records
//! consistent with the leave-approval workflow.
//!
//! # Guarantees
//!
//! - **One row per employee per day**: every write goes through
//!   find-then-create-or-patch against the record store
//! - **Ordered state**: out-of-order and low-confidence sightings never move
//!   check-in, last-seen or status
//! - **Nothing silently dropped**: unconfirmed progress stays dirty until the
//!   store accepts it, and what is still unconfirmed at shutdown is logged
//! - **Leave wins**: rows marked on-leave are never overwritten by tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Presence Agent                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │   Source    │──▶│   Tracker   │──▶│ FlushWorker │──┐    │
//! │  │ (JSON lines)│   │  (session)  │   │  (flusher)  │  │    │
//! │  └─────────────┘   └─────────────┘   └─────────────┘  │    │
//! │         ▲                 ▲                           ▼    │
//! │  ┌─────────────┐   ┌─────────────┐           ┌──────────┐  │
//! │  │ FaceMatcher │   │   Roster    │◀──────────│  Record  │  │
//! │  │ (external)  │   │ Initializer │           │  Store   │  │
//! │  └─────────────┘   └─────────────┘           └──────────┘  │
//! │                                                   ▲        │
//! │                    ┌─────────────────────────┐    │        │
//! │                    │ LeaveWorkflow + Sync    │────┘        │
//! │                    └─────────────────────────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use presence_agent::core::{DailyRosterInitializer, PresenceTracker, TrackerConfig};
//! use presence_agent::store::{InMemoryStore, RetryPolicy};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let date = chrono::Utc::now().date_naive();
//! let roster = DailyRosterInitializer::new(store, RetryPolicy::default())
//!     .initialize(date)
//!     .await?;
//! let tracker = PresenceTracker::new(TrackerConfig::default(), roster);
//! println!("tracking {} employees", tracker.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod session;
pub mod source;
pub mod stats;
pub mod store;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, StoreConfig};
pub use core::{
    AttendanceFlusher, AttendanceRecord, AttendanceStatus, DailyRosterInitializer, EmployeeId,
    LeaveAttendanceSynchronizer, LeaveRequest, LeaveStatus, LeaveWorkflow, PresenceState,
    PresenceTracker, TrackerConfig,
};
pub use session::{ClockMode, SessionConfig, SessionSummary, StopReason, TrackingSession};
pub use source::{FaceMatcher, FrameSource, LineSource, RecognitionEvent, Sighting};
pub use stats::{SessionStats, SharedSessionStats, StatsSnapshot};
pub use store::{InMemoryStore, Notifier, RecordStore, RetryPolicy, StoreError};

#[cfg(feature = "http-store")]
pub use store::HttpRecordStore;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
