//! JSON-lines sighting source.
//!
//! Reads one `Sighting` per line from any buffered reader (stdin, a replay
//! file) on a background thread and forwards it over a bounded channel.
//! Malformed lines are logged and skipped.

use crate::source::types::Sighting;
use crossbeam_channel::{bounded, Receiver};
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Errors that can occur while starting a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to spawn sighting reader: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A running line reader.
pub struct LineSource {
    receiver: Receiver<Sighting>,
    skipped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl LineSource {
    /// Start reading `reader` on a background thread.
    ///
    /// The channel holds at most `capacity` sightings; the reader blocks when
    /// it is full. The receiver disconnects once the reader reaches EOF.
    pub fn spawn<R>(reader: R, capacity: usize) -> Result<Self, SourceError>
    where
        R: BufRead + Send + 'static,
    {
        let (sender, receiver) = bounded(capacity.max(1));
        let skipped = Arc::new(AtomicU64::new(0));
        let skipped_counter = skipped.clone();

        let handle = thread::Builder::new()
            .name("sighting-reader".to_string())
            .spawn(move || {
                for (index, line) in reader.lines().enumerate() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "sighting input read failed; stopping reader");
                            break;
                        }
                    };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<Sighting>(trimmed) {
                        Ok(sighting) => {
                            if sender.send(sighting).is_err() {
                                debug!("sighting consumer gone; stopping reader");
                                break;
                            }
                        }
                        Err(e) => {
                            skipped_counter.fetch_add(1, Ordering::Relaxed);
                            warn!(line = index + 1, error = %e, "skipping malformed sighting");
                        }
                    }
                }
            })?;

        Ok(Self {
            receiver,
            skipped,
            handle: Some(handle),
        })
    }

    /// Get the receiver for sightings.
    pub fn receiver(&self) -> &Receiver<Sighting> {
        &self.receiver
    }

    /// Number of lines that could not be parsed so far.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Wait for the reader thread to finish.
    ///
    /// Only returns once the input is exhausted or the receiver is dropped.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
