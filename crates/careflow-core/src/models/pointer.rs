//! MRN pointer and checklist entry models.

use serde::{Deserialize, Serialize};

use super::episode::EpisodeStatus;

/// Maps one external registration number to its owning patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MrnPointer {
    pub registration_number: String,
    pub scheme: String,
    /// Owning canonical id; only ever rewritten to the same value
    pub patient_id: String,
    /// Denormalized from the episode for quick lookup
    pub department: String,
    pub status: EpisodeStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Allowed transition between two stages with its required items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChecklistEntry {
    pub from_stage: String,
    pub to_stage: String,
    #[serde(default)]
    pub required_on_entry: Vec<String>,
    #[serde(default)]
    pub required_on_exit: Vec<String>,
}

impl ChecklistEntry {
    pub fn new(from_stage: &str, to_stage: &str, required_on_entry: &[&str], required_on_exit: &[&str]) -> Self {
        Self {
            from_stage: from_stage.to_string(),
            to_stage: to_stage.to_string(),
            required_on_entry: required_on_entry.iter().map(|s| s.to_string()).collect(),
            required_on_exit: required_on_exit.iter().map(|s| s.to_string()).collect(),
        }
    }
}
