//! Clinical note and medication order models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keys::{med_sk, note_sk, parse_instant, patient_pk};
use crate::db::ItemKey;

/// Attribute holding the object keys attached to a note or medication.
pub const FILES_ATTR: &str = "files";

/// Who a clinical note is written for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NoteCategory {
    DoctorNote,
    NurseNote,
    Pharmacy,
    Discharge,
}

impl NoteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteCategory::DoctorNote => "doctorNote",
            NoteCategory::NurseNote => "nurseNote",
            NoteCategory::Pharmacy => "pharmacy",
            NoteCategory::Discharge => "discharge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "doctorNote" => Some(NoteCategory::DoctorNote),
            "nurseNote" => Some(NoteCategory::NurseNote),
            "pharmacy" => Some(NoteCategory::Pharmacy),
            "discharge" => Some(NoteCategory::Discharge),
            _ => None,
        }
    }
}

/// A free-text note on a patient. Notes are soft-deleted, never removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub note_id: String,
    pub patient_id: String,
    pub author_id: String,
    pub category: NoteCategory,
    pub content: String,
    /// Attached object keys, each under `patients/<id>/`
    #[serde(default)]
    pub files: Vec<String>,
    /// Registration in use when the note was written
    #[serde(default)]
    pub registration_number: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Note {
    pub fn sort_key(&self) -> String {
        note_sk(&self.created_at, &self.note_id)
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(patient_pk(&self.patient_id), self.sort_key())
    }
}

/// Input for writing a note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewNote {
    pub author_id: String,
    pub category: NoteCategory,
    pub content: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl NewNote {
    pub fn new(author_id: impl Into<String>, category: NoteCategory, content: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            category,
            content: content.into(),
            files: Vec::new(),
        }
    }
}

/// Edit of a note's category and/or content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NotePatch {
    pub category: Option<NoteCategory>,
    pub content: Option<String>,
}

/// Urgency of a medication order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MedPriority {
    #[default]
    Routine,
    Important,
    Critical,
}

impl MedPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MedPriority::Routine => "routine",
            MedPriority::Important => "important",
            MedPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "routine" => Some(MedPriority::Routine),
            "important" => Some(MedPriority::Important),
            "critical" => Some(MedPriority::Critical),
            _ => None,
        }
    }
}

/// A medication order. Stopping an order sets `end`; orders are never removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Medication {
    pub med_id: String,
    pub patient_id: String,
    pub name: String,
    pub dose: String,
    pub route: String,
    pub freq: String,
    pub start: String,
    /// `None` while the order is running
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub priority: MedPriority,
    /// Administration times of day, e.g. `08:00`
    #[serde(default)]
    pub schedule_times: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub registration_number: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Medication {
    pub fn sort_key(&self) -> String {
        med_sk(&self.med_id)
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(patient_pk(&self.patient_id), self.sort_key())
    }

    /// Running at `now`: no end, or an end still in the future.
    /// An unreadable end counts as stopped.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match &self.end {
            None => true,
            Some(end) => parse_instant(end).is_some_and(|end| end > now),
        }
    }
}

/// Input for ordering a medication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMedication {
    pub name: String,
    pub dose: String,
    pub route: String,
    pub freq: String,
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub priority: MedPriority,
    #[serde(default)]
    pub schedule_times: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl NewMedication {
    pub fn new(
        name: impl Into<String>,
        dose: impl Into<String>,
        route: impl Into<String>,
        freq: impl Into<String>,
        start: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            dose: dose.into(),
            route: route.into(),
            freq: freq.into(),
            start: start.into(),
            end: None,
            priority: MedPriority::default(),
            schedule_times: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// Partial edit of a medication order. `clear_end` restarts a stopped order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MedicationPatch {
    pub name: Option<String>,
    pub dose: Option<String>,
    pub route: Option<String>,
    pub freq: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub clear_end: bool,
    pub priority: Option<MedPriority>,
    pub schedule_times: Option<Vec<String>>,
}

impl MedicationPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.dose.is_none()
            && self.route.is_none()
            && self.freq.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && !self.clear_end
            && self.priority.is_none()
            && self.schedule_times.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(end: Option<&str>) -> Medication {
        Medication {
            med_id: "m-1".into(),
            patient_id: "p-1".into(),
            name: "Ceftriaxone".into(),
            dose: "1 g".into(),
            route: "IV".into(),
            freq: "BD".into(),
            start: "2026-01-01T08:00:00Z".into(),
            end: end.map(str::to_string),
            priority: MedPriority::Important,
            schedule_times: vec!["08:00".into(), "20:00".into()],
            files: Vec::new(),
            registration_number: None,
            scheme: None,
            created_at: "2026-01-01T08:00:00.000000Z".into(),
            updated_at: "2026-01-01T08:00:00.000000Z".into(),
        }
    }

    #[test]
    fn test_note_category_wire_names() {
        assert_eq!(
            serde_json::to_value(NoteCategory::DoctorNote).unwrap(),
            serde_json::json!("doctorNote")
        );
        assert_eq!(NoteCategory::parse("nurseNote"), Some(NoteCategory::NurseNote));
        assert_eq!(NoteCategory::parse("surgeonNote"), None);
    }

    #[test]
    fn test_medication_activity() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        assert!(order(None).is_active(now));
        assert!(order(Some("2026-01-06")).is_active(now));
        assert!(!order(Some("2026-01-05T12:00:00Z")).is_active(now));
        assert!(!order(Some("2026-01-05T17:00:00+05:30")).is_active(now));
        assert!(!order(Some("soon")).is_active(now));
    }

    #[test]
    fn test_medication_defaults_on_read() {
        let value = serde_json::json!({
            "med_id": "m-1", "patient_id": "p-1", "name": "Paracetamol",
            "dose": "500 mg", "route": "PO", "freq": "TDS", "start": "2026-01-01",
            "created_at": "x", "updated_at": "x"
        });
        let med: Medication = serde_json::from_value(value).unwrap();
        assert_eq!(med.priority, MedPriority::Routine);
        assert!(med.end.is_none());
        assert!(med.files.is_empty());
        assert_eq!(med.key().sk, "med:m-1");
    }

    #[test]
    fn test_empty_patch() {
        assert!(MedicationPatch::default().is_empty());
        let patch = MedicationPatch {
            clear_end: true,
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
