//! Episode record models.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::keys::{new_canonical_id, now_timestamp};

/// Administrative status of an episode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EpisodeStatus {
    #[default]
    Active,
    Inactive,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Active => "ACTIVE",
            EpisodeStatus::Inactive => "INACTIVE",
        }
    }

    /// Parse a status, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(EpisodeStatus::Active),
            "INACTIVE" => Some(EpisodeStatus::Inactive),
            _ => None,
        }
    }
}

/// Derive the cohort index key for a department and status.
pub fn cohort_key(department: &str, status: EpisodeStatus) -> String {
    format!("dept:{}:{}", department, status.as_str())
}

/// Postal address of an emergency contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Emergency contact of a patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EmergencyContact {
    pub name: String,
    /// Relationship to the patient (e.g., "spouse")
    pub relationship: Option<String>,
    pub phone: Option<String>,
    pub alternate_phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<Address>,
}

/// One entry of the registration history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationEntry {
    /// External registration number (MRN)
    pub number: String,
    /// Issuing scheme
    pub scheme: String,
    /// When this registration came into use
    pub date: String,
}

impl RegistrationEntry {
    pub fn new(number: impl Into<String>, scheme: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            scheme: scheme.into(),
            date: date.into(),
        }
    }
}

/// Canonical, single-row-per-patient projection of the current episode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeRecord {
    /// Canonical id, assigned at creation and never reused
    pub patient_id: String,
    /// Patient name
    pub name: String,
    /// Age in years
    #[serde(default)]
    pub age: Option<u32>,
    /// Sex as recorded at registration
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub emergency_contact: Option<EmergencyContact>,
    /// Department the episode belongs to
    pub department: String,
    pub status: EpisodeStatus,
    /// Care pathway (e.g., "surgical", "consult")
    #[serde(default)]
    pub pathway: Option<String>,
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub comorbidities: Vec<String>,
    #[serde(default)]
    pub assigned_clinician: Option<String>,
    #[serde(default)]
    pub assigned_clinician_id: Option<String>,
    #[serde(default)]
    pub is_urgent: bool,
    #[serde(default)]
    pub urgent_reason: Option<String>,
    #[serde(default)]
    pub urgent_until: Option<String>,
    /// Stage the patient currently occupies
    pub current_stage: String,
    /// Sort key of the open timeline segment
    #[serde(default)]
    pub open_segment_ref: Option<String>,
    /// Stage -> first entry time (never overwritten)
    #[serde(default)]
    pub stage_first_seen_at: BTreeMap<String, String>,
    /// Registration number currently in use
    pub active_registration_number: String,
    pub active_scheme: String,
    /// Every registration ever used, in order of adoption
    #[serde(default)]
    pub registration_history: Vec<RegistrationEntry>,
    /// Denormalized `dept:<department>:<STATUS>` index key
    pub cohort_key: String,
    /// Count of discharge writes (observability only)
    #[serde(default)]
    pub update_counter: i64,
    /// Creation timestamp
    pub created_at: String,
    /// Last update timestamp
    pub updated_at: String,
}

impl EpisodeRecord {
    /// Build a fresh episode from registration input.
    pub fn from_new(input: &NewPatient, first_stage: &str) -> Self {
        let now = now_timestamp();
        let mut stage_first_seen_at = BTreeMap::new();
        stage_first_seen_at.insert(first_stage.to_string(), now.clone());
        Self {
            patient_id: new_canonical_id(),
            name: input.name.trim().to_string(),
            age: input.age,
            sex: input.sex.clone(),
            emergency_contact: input.emergency_contact.clone(),
            department: input.department.trim().to_string(),
            status: EpisodeStatus::Active,
            pathway: input.pathway.clone(),
            diagnosis: input.diagnosis.clone(),
            comorbidities: input.comorbidities.clone(),
            assigned_clinician: input.assigned_clinician.clone(),
            assigned_clinician_id: input.assigned_clinician_id.clone(),
            is_urgent: input.is_urgent,
            urgent_reason: input.urgent_reason.clone(),
            urgent_until: input.urgent_until.clone(),
            current_stage: first_stage.to_string(),
            open_segment_ref: None,
            stage_first_seen_at,
            active_registration_number: input.registration_number.trim().to_string(),
            active_scheme: input.scheme.trim().to_string(),
            registration_history: vec![RegistrationEntry::new(
                input.registration_number.trim(),
                input.scheme.trim(),
                now.clone(),
            )],
            cohort_key: cohort_key(input.department.trim(), EpisodeStatus::Active),
            update_counter: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Whether the active registration appears in the history.
    pub fn history_contains_active(&self) -> bool {
        self.registration_history
            .iter()
            .any(|e| e.number == self.active_registration_number)
    }
}

/// Input for registering a new patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewPatient {
    pub name: String,
    pub registration_number: String,
    pub scheme: String,
    pub department: String,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub emergency_contact: Option<EmergencyContact>,
    pub pathway: Option<String>,
    pub diagnosis: Option<String>,
    pub comorbidities: Vec<String>,
    pub assigned_clinician: Option<String>,
    pub assigned_clinician_id: Option<String>,
    pub is_urgent: bool,
    pub urgent_reason: Option<String>,
    pub urgent_until: Option<String>,
    /// Stage to open the first segment at (default from config)
    pub first_stage: Option<String>,
    pub actor_id: Option<String>,
}

impl NewPatient {
    /// Create registration input with required fields.
    pub fn new(
        name: impl Into<String>,
        registration_number: impl Into<String>,
        scheme: impl Into<String>,
        department: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            registration_number: registration_number.into(),
            scheme: scheme.into(),
            department: department.into(),
            ..Default::default()
        }
    }

    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.registration_number.trim().is_empty() {
            missing.push("registration_number");
        }
        if self.scheme.trim().is_empty() {
            missing.push("scheme");
        }
        if self.department.trim().is_empty() {
            missing.push("department");
        }
        missing
    }
}

/// Partial update of demographic and episode fields.
///
/// Stage and registration fields are deliberately absent: they change only
/// through transitions and registration switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EpisodeUpdate {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub emergency_contact: Option<EmergencyContact>,
    pub department: Option<String>,
    pub status: Option<EpisodeStatus>,
    pub pathway: Option<String>,
    pub diagnosis: Option<String>,
    pub comorbidities: Option<Vec<String>>,
    pub assigned_clinician: Option<String>,
    pub assigned_clinician_id: Option<String>,
    pub is_urgent: Option<bool>,
    pub urgent_reason: Option<String>,
    pub urgent_until: Option<String>,
}

impl EpisodeUpdate {
    pub fn is_empty(&self) -> bool {
        self == &EpisodeUpdate::default()
    }

    /// Apply every present field to a record.
    pub fn apply_to(&self, record: &mut EpisodeRecord) {
        if let Some(v) = &self.name {
            record.name = v.trim().to_string();
        }
        if let Some(v) = self.age {
            record.age = Some(v);
        }
        if let Some(v) = &self.sex {
            record.sex = Some(v.clone());
        }
        if let Some(v) = &self.emergency_contact {
            record.emergency_contact = Some(v.clone());
        }
        if let Some(v) = &self.department {
            record.department = v.trim().to_string();
        }
        if let Some(v) = self.status {
            record.status = v;
        }
        if let Some(v) = &self.pathway {
            record.pathway = Some(v.clone());
        }
        if let Some(v) = &self.diagnosis {
            record.diagnosis = Some(v.clone());
        }
        if let Some(v) = &self.comorbidities {
            record.comorbidities = v.clone();
        }
        if let Some(v) = &self.assigned_clinician {
            record.assigned_clinician = Some(v.clone());
        }
        if let Some(v) = &self.assigned_clinician_id {
            record.assigned_clinician_id = Some(v.clone());
        }
        if let Some(v) = self.is_urgent {
            record.is_urgent = v;
        }
        if let Some(v) = &self.urgent_reason {
            record.urgent_reason = Some(v.clone());
        }
        if let Some(v) = &self.urgent_until {
            record.urgent_until = Some(v.clone());
        }
        record.cohort_key = cohort_key(&record.department, record.status);
    }
}
