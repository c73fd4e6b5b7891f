//! Frame-driven sighting source.
//!
//! Runs captured face crops through a [`FaceMatcher`] on a background thread
//! and forwards every match as a [`Sighting`]. Crops the matcher cannot place
//! are counted and dropped.

use crate::source::lines::SourceError;
use crate::source::types::{FaceMatcher, Sighting};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// One face crop cut from a camera frame.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// When the frame was captured
    pub timestamp: DateTime<Utc>,
    /// Encoded image of the detected face
    pub crop: Vec<u8>,
}

/// A running matcher thread.
pub struct FrameSource {
    receiver: Receiver<Sighting>,
    unmatched: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Start matching crops from `frames` with `matcher`.
    ///
    /// The sighting channel holds at most `capacity` entries. It disconnects
    /// once `frames` disconnects and every crop has been matched.
    pub fn spawn<M>(
        frames: Receiver<CapturedFrame>,
        matcher: M,
        capacity: usize,
    ) -> Result<Self, SourceError>
    where
        M: FaceMatcher + 'static,
    {
        let (sender, receiver) = bounded(capacity.max(1));
        let unmatched = Arc::new(AtomicU64::new(0));
        let unmatched_counter = unmatched.clone();

        let handle = thread::Builder::new()
            .name("frame-matcher".to_string())
            .spawn(move || {
                for frame in frames.iter() {
                    let Some(found) = matcher.best_match(&frame.crop) else {
                        unmatched_counter.fetch_add(1, Ordering::Relaxed);
                        debug!(at = %frame.timestamp, "no identity matched the crop");
                        continue;
                    };
                    if sender.send(Sighting::from_match(found, frame.timestamp)).is_err() {
                        debug!("sighting consumer gone; stopping matcher");
                        break;
                    }
                }
            })?;

        Ok(Self {
            receiver,
            unmatched,
            handle: Some(handle),
        })
    }

    pub fn receiver(&self) -> &Receiver<Sighting> {
        &self.receiver
    }

    /// Crops that matched nobody so far.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Wait for the matcher thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
