//! Recognition event types.
//!
//! A `Sighting` is what arrives from the capture side: an identity label (or
//! employee id) with a timestamp and a match score. The tracker consumes
//! `RecognitionEvent`s, which are sightings resolved to a roster employee.

use crate::core::presence::EmployeeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A validated observation of one employee at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub employee_id: EmployeeId,
    pub timestamp: DateTime<Utc>,
    /// Match confidence in `[0, 1]`
    pub confidence: f64,
}

impl RecognitionEvent {
    pub fn new(employee_id: EmployeeId, timestamp: DateTime<Utc>, confidence: f64) -> Self {
        Self {
            employee_id,
            timestamp,
            confidence,
        }
    }
}

/// Best match returned by the face-identification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionMatch {
    /// Identity label of the match (the employee's username)
    pub subject: String,
    /// Normalized distance; 0 is identical
    pub distance: f64,
}

impl RecognitionMatch {
    /// Confidence derived from distance, clamped to `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        distance_to_confidence(self.distance)
    }
}

/// Face-identification collaborator.
///
/// Given an image crop, returns the closest known identity or `None`.
pub trait FaceMatcher: Send {
    fn best_match(&self, crop: &[u8]) -> Option<RecognitionMatch>;
}

/// One line of sighting input.
///
/// Either `employee_id` or `username` identifies the subject; either
/// `confidence` or `distance` scores the match. A sighting with no score is
/// treated as zero confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<EmployeeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

impl Sighting {
    /// Sighting of a known employee id.
    pub fn of_employee(employee_id: EmployeeId, timestamp: DateTime<Utc>, confidence: f64) -> Self {
        Self {
            employee_id: Some(employee_id),
            username: None,
            timestamp,
            confidence: Some(confidence),
            distance: None,
        }
    }

    /// Sighting built from a face-identification match.
    pub fn from_match(found: RecognitionMatch, timestamp: DateTime<Utc>) -> Self {
        Self {
            employee_id: None,
            username: Some(found.subject),
            timestamp,
            confidence: None,
            distance: Some(found.distance),
        }
    }

    pub fn confidence(&self) -> f64 {
        match (self.confidence, self.distance) {
            (Some(confidence), _) => confidence.clamp(0.0, 1.0),
            (None, Some(distance)) => distance_to_confidence(distance),
            (None, None) => 0.0,
        }
    }
}

fn distance_to_confidence(distance: f64) -> f64 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance).clamp(0.0, 1.0)
}
