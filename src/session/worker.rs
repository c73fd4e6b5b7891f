//! Background flush worker.
//!
//! Runs the [`AttendanceFlusher`] on a dedicated thread with its own tokio
//! runtime so store latency never blocks the observation loop. Jobs arrive on
//! a bounded queue; results go back as [`FlushReport`]s.

use crate::core::flusher::{AttendanceFlusher, FlushOutcome};
use crate::core::presence::{EmployeeId, FlushSnapshot};
use crate::store::{RetryPolicy, StoreError};
use crossbeam_channel::{unbounded, Receiver};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};

/// Result of one flush job.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub employee_id: EmployeeId,
    /// Revision of the snapshot that was flushed
    pub revision: u64,
    pub result: Result<FlushOutcome, StoreError>,
}

/// Why a snapshot could not be queued. The snapshot is handed back.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("flush queue is full")]
    Full(FlushSnapshot),
    #[error("flush worker has stopped")]
    Closed(FlushSnapshot),
}

/// Handle to the flush thread.
pub struct FlushWorker {
    sender: Option<mpsc::Sender<FlushSnapshot>>,
    reports: Receiver<FlushReport>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Start the worker with a queue of `capacity` pending jobs.
    pub fn spawn(
        flusher: AttendanceFlusher,
        retry: RetryPolicy,
        capacity: usize,
    ) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, mut jobs) = mpsc::channel::<FlushSnapshot>(capacity.max(1));
        let (report_sender, reports) = unbounded();

        let handle = thread::Builder::new()
            .name("flush-worker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(snapshot) = jobs.recv().await {
                        let result = {
                            let flusher = &flusher;
                            let snapshot = &snapshot;
                            retry.run("flush", move || flusher.flush(snapshot)).await
                        };
                        if let Err(e) = &result {
                            error!(
                                employee = snapshot.employee_id,
                                revision = snapshot.revision,
                                error = %e,
                                "flush failed"
                            );
                        }

                        let report = FlushReport {
                            employee_id: snapshot.employee_id,
                            revision: snapshot.revision,
                            result,
                        };
                        if report_sender.send(report).is_err() {
                            debug!("flush report receiver gone");
                        }
                    }
                    debug!("flush queue closed; worker exiting");
                });
            })?;

        Ok(Self {
            sender: Some(sender),
            reports,
            handle: Some(handle),
        })
    }

    /// Queue a snapshot without waiting.
    pub fn try_enqueue(&self, snapshot: FlushSnapshot) -> Result<(), EnqueueError> {
        let Some(sender) = &self.sender else {
            return Err(EnqueueError::Closed(snapshot));
        };
        sender.try_send(snapshot).map_err(|e| match e {
            TrySendError::Full(snapshot) => EnqueueError::Full(snapshot),
            TrySendError::Closed(snapshot) => EnqueueError::Closed(snapshot),
        })
    }

    /// Queue a snapshot, waiting for room.
    ///
    /// Must not be called from inside an async context.
    pub fn enqueue_blocking(&self, snapshot: FlushSnapshot) -> Result<(), EnqueueError> {
        let Some(sender) = &self.sender else {
            return Err(EnqueueError::Closed(snapshot));
        };
        sender
            .blocking_send(snapshot)
            .map_err(|e| EnqueueError::Closed(e.0))
    }

    /// Reports that have arrived so far.
    pub fn try_reports(&self) -> Vec<FlushReport> {
        self.reports.try_iter().collect()
    }

    /// Close the queue, wait for every queued job and return their reports.
    pub fn finish(&mut self) -> Vec<FlushReport> {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("flush worker panicked");
            }
        }
        self.try_reports()
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::leave::{LeaveRequest, LeaveStatus};
    use crate::core::presence::{AttendanceRecord, AttendanceStatus};
    use crate::core::roster::RosterEntry;
    use crate::store::{
        AttendancePatch, InMemoryStore, NewAttendance, NewLeave, RecordHandle, RecordStore,
    };
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    fn snapshot(employee: EmployeeId, revision: u64) -> FlushSnapshot {
        FlushSnapshot {
            employee_id: employee,
            date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            status: AttendanceStatus::Present,
            check_in_time: Some(Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap()),
            check_out_time: None,
            out_of_sight_duration: Duration::zero(),
            working_hours: None,
            revision,
        }
    }

    #[test]
    fn test_queued_snapshots_are_flushed() {
        let store = Arc::new(InMemoryStore::new());
        let mut worker =
            FlushWorker::spawn(AttendanceFlusher::new(store.clone()), RetryPolicy::none(), 8)
                .unwrap();

        worker.enqueue_blocking(snapshot(1, 1)).unwrap();
        worker.enqueue_blocking(snapshot(2, 1)).unwrap();
        let reports = worker.finish();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.result.is_ok()));
        assert_eq!(store.records().len(), 2);
        assert!(matches!(
            worker.try_enqueue(snapshot(3, 1)),
            Err(EnqueueError::Closed(_))
        ));
    }

    #[test]
    fn test_failures_are_reported() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next(1);
        let mut worker =
            FlushWorker::spawn(AttendanceFlusher::new(store.clone()), RetryPolicy::none(), 8)
                .unwrap();

        worker.enqueue_blocking(snapshot(1, 4)).unwrap();
        let reports = worker.finish();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].revision, 4);
        assert!(reports[0].result.as_ref().unwrap_err().is_transient());
    }

    /// Store whose lookups wait until the test opens the gate.
    struct GatedStore {
        inner: InMemoryStore,
        gate: Mutex<Receiver<()>>,
    }

    #[async_trait]
    impl RecordStore for GatedStore {
        async fn list_roster(&self) -> Result<Vec<RosterEntry>, StoreError> {
            self.inner.list_roster().await
        }
        async fn record_exists(&self, e: EmployeeId, d: NaiveDate) -> Result<bool, StoreError> {
            self.inner.record_exists(e, d).await
        }
        async fn find_record(
            &self,
            employee: EmployeeId,
            date: NaiveDate,
        ) -> Result<Option<AttendanceRecord>, StoreError> {
            let _ = self
                .gate
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .recv();
            self.inner.find_record(employee, date).await
        }
        async fn lookup_record(&self, u: &str, d: NaiveDate) -> Result<RecordHandle, StoreError> {
            self.inner.lookup_record(u, d).await
        }
        async fn create_record(&self, r: NewAttendance) -> Result<AttendanceRecord, StoreError> {
            self.inner.create_record(r).await
        }
        async fn patch_record(
            &self,
            id: u64,
            patch: AttendancePatch,
        ) -> Result<AttendanceRecord, StoreError> {
            self.inner.patch_record(id, patch).await
        }
        async fn delete_record(&self, id: u64) -> Result<(), StoreError> {
            self.inner.delete_record(id).await
        }
        async fn create_leave(&self, l: NewLeave) -> Result<LeaveRequest, StoreError> {
            self.inner.create_leave(l).await
        }
        async fn get_leave(&self, id: u64) -> Result<LeaveRequest, StoreError> {
            self.inner.get_leave(id).await
        }
        async fn update_leave_status(
            &self,
            id: u64,
            s: LeaveStatus,
        ) -> Result<LeaveRequest, StoreError> {
            self.inner.update_leave_status(id, s).await
        }
        async fn delete_leave(&self, id: u64) -> Result<(), StoreError> {
            self.inner.delete_leave(id).await
        }
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let (open, gate) = unbounded();
        let store = Arc::new(GatedStore {
            inner: InMemoryStore::new(),
            gate: Mutex::new(gate),
        });
        let mut worker =
            FlushWorker::spawn(AttendanceFlusher::new(store), RetryPolicy::none(), 1).unwrap();

        // One job can be in flight and one queued; the third cannot fit.
        let mut accepted = 0;
        let mut rejected = 0;
        for employee in 1..=3 {
            match worker.try_enqueue(snapshot(employee, 1)) {
                Ok(()) => accepted += 1,
                Err(EnqueueError::Full(returned)) => {
                    assert_eq!(returned.employee_id, employee);
                    rejected += 1;
                }
                Err(EnqueueError::Closed(_)) => panic!("worker closed early"),
            }
        }
        assert!(rejected >= 1);

        for _ in 0..accepted {
            open.send(()).unwrap();
        }
        let reports = worker.finish();
        assert_eq!(reports.len(), accepted);
    }
}
