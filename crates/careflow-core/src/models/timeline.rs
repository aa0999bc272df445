//! Timeline segment models.

use serde::{Deserialize, Serialize};

use super::keys::{new_canonical_id, patient_pk, timeline_sk};
use crate::db::ItemKey;

/// One open/close interval during which a patient occupied a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineSegment {
    pub segment_id: String,
    pub patient_id: String,
    /// Stage name
    pub stage: String,
    pub opened_at: String,
    /// Absent while the segment is open
    #[serde(default)]
    pub closed_at: Option<String>,
    /// Registration in use when the segment opened
    pub registration_number: String,
    pub scheme: String,
    /// Items the gate required on entering this stage
    #[serde(default)]
    pub required_on_entry: Vec<String>,
    /// Items the gate required on leaving this stage (filled at close)
    #[serde(default)]
    pub required_on_exit: Vec<String>,
    /// Items the caller reported complete on entry
    #[serde(default)]
    pub completed_on_entry: Vec<String>,
    /// Items the caller reported complete on exit (filled at close)
    #[serde(default)]
    pub completed_on_exit: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

impl TimelineSegment {
    /// Open a new segment.
    pub fn open(
        patient_id: &str,
        stage: &str,
        registration_number: &str,
        scheme: &str,
        opened_at: &str,
    ) -> Self {
        Self {
            segment_id: new_canonical_id(),
            patient_id: patient_id.to_string(),
            stage: stage.to_string(),
            opened_at: opened_at.to_string(),
            closed_at: None,
            registration_number: registration_number.to_string(),
            scheme: scheme.to_string(),
            required_on_entry: Vec::new(),
            required_on_exit: Vec::new(),
            completed_on_entry: Vec::new(),
            completed_on_exit: Vec::new(),
            note: None,
            actor_id: None,
        }
    }

    pub fn sort_key(&self) -> String {
        timeline_sk(&self.opened_at, &self.segment_id)
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(patient_pk(&self.patient_id), self.sort_key())
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}
