//! Sighting sources for the presence agent.
//!
//! Sightings reach the agent either as JSON lines from an external capture
//! process, or as face crops matched in process through a [`FaceMatcher`].
//! Both end up on a bounded channel the tracking session consumes.

pub mod frames;
pub mod lines;
pub mod types;

// Re-export commonly used types
pub use frames::{CapturedFrame, FrameSource};
pub use lines::{LineSource, SourceError};
pub use types::{FaceMatcher, RecognitionEvent, RecognitionMatch, Sighting};
