//! Key conventions and shared value helpers.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::db::ItemKey;

/// Sort key of the episode record.
pub const PROFILE_SK: &str = "profile";
/// Sort key of an MRN pointer.
pub const POINTER_SK: &str = "pointer";
/// Sort key of the attachment lists record.
pub const DOCUMENTS_SK: &str = "documents";
/// Sort key prefix of timeline segments.
pub const TIMELINE_PREFIX: &str = "timeline:";
/// Sort key prefix of discharge versions (and the latest pointer).
pub const DISCHARGE_PREFIX: &str = "discharge:";
/// Sort key of the discharge latest pointer.
pub const DISCHARGE_LATEST_SK: &str = "discharge:latest";
/// Sort key prefix of clinical notes.
pub const NOTE_PREFIX: &str = "note:";
/// Sort key prefix of medication orders.
pub const MED_PREFIX: &str = "med:";
/// Partition holding the checklist gate.
pub const CHECKLIST_PK: &str = "checklist";

pub fn patient_pk(patient_id: &str) -> String {
    format!("patient:{}", patient_id)
}

pub fn profile_key(patient_id: &str) -> ItemKey {
    ItemKey::new(patient_pk(patient_id), PROFILE_SK)
}

pub fn pointer_key(registration_number: &str) -> ItemKey {
    ItemKey::new(format!("registration:{}", registration_number), POINTER_SK)
}

pub fn documents_key(patient_id: &str) -> ItemKey {
    ItemKey::new(patient_pk(patient_id), DOCUMENTS_SK)
}

pub fn timeline_sk(opened_at: &str, segment_id: &str) -> String {
    format!("{}{}:{}", TIMELINE_PREFIX, opened_at, segment_id)
}

pub fn discharge_sk(created_at: &str, version_id: &str) -> String {
    format!("{}{}:{}", DISCHARGE_PREFIX, created_at, version_id)
}

pub fn note_sk(created_at: &str, note_id: &str) -> String {
    format!("{}{}:{}", NOTE_PREFIX, created_at, note_id)
}

pub fn med_sk(med_id: &str) -> String {
    format!("{}{}", MED_PREFIX, med_id)
}

pub fn discharge_latest_key(patient_id: &str) -> ItemKey {
    ItemKey::new(patient_pk(patient_id), DISCHARGE_LATEST_SK)
}

pub fn checklist_sk(from_stage: &str, to_stage: &str) -> String {
    format!("stage:{}:to:{}", from_stage, to_stage)
}

pub fn checklist_prefix(from_stage: &str) -> String {
    format!("stage:{}:to:", from_stage)
}

/// Fixed-width UTC timestamp; lexicographic order equals time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Parse an RFC 3339 instant or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

/// Sortable canonical identifier.
pub fn new_canonical_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Stage names are embedded in keys, so they must be non-empty and free of `:`.
pub fn is_valid_stage(stage: &str) -> bool {
    !stage.trim().is_empty() && !stage.contains(':') && stage.trim() == stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_fixed_width() {
        let a = timestamp(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(a, "2026-01-02T03:04:05.000000Z");
        assert_eq!(now_timestamp().len(), a.len());
    }

    #[test]
    fn test_canonical_ids_sort_by_creation() {
        let first = new_canonical_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_canonical_id();
        assert!(first < second);
        assert_eq!(first.len(), 36);
    }

    #[test]
    fn test_timeline_keys_sort_chronologically() {
        let earlier = timeline_sk("2026-01-02T03:04:05.000000Z", "zzz");
        let later = timeline_sk("2026-01-02T03:04:05.000001Z", "aaa");
        assert!(earlier < later);
        assert!(earlier.starts_with(TIMELINE_PREFIX));
    }

    #[test]
    fn test_stage_validation() {
        assert!(is_valid_stage("preop"));
        assert!(is_valid_stage("discharge-init"));
        assert!(!is_valid_stage(""));
        assert!(!is_valid_stage("a:b"));
        assert!(!is_valid_stage(" preop"));
    }

    #[test]
    fn test_parse_instant_normalizes_offsets() {
        let ist = parse_instant("2026-01-01T10:00:00+05:30").unwrap();
        let utc = parse_instant("2026-01-01T05:00:00Z").unwrap();
        assert!(ist < utc);
        assert_eq!(
            parse_instant("2026-01-01").unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_instant("last tuesday").is_none());
        assert!(parse_instant("2026").is_none());
    }
}
