//! Discharge summary models.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::keys::{discharge_sk, patient_pk};
use crate::db::ItemKey;

/// Author recorded when the caller supplies none.
pub const ANONYMOUS_AUTHOR: &str = "anon";

/// Lifecycle status of a discharge version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DischargeStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl DischargeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DischargeStatus::Draft => "draft",
            DischargeStatus::Published => "published",
            DischargeStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(DischargeStatus::Draft),
            "published" => Some(DischargeStatus::Published),
            "archived" => Some(DischargeStatus::Archived),
            _ => None,
        }
    }
}

/// A structured section: either a block of text or named fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SectionValue {
    Text(String),
    Fields(BTreeMap<String, String>),
}

impl SectionValue {
    /// Trim text and drop blank fields; `None` when nothing remains.
    fn sanitized(&self) -> Option<SectionValue> {
        match self {
            SectionValue::Text(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| SectionValue::Text(text.to_string()))
            }
            SectionValue::Fields(fields) => {
                let fields = clean_map(fields);
                (!fields.is_empty()).then_some(SectionValue::Fields(fields))
            }
        }
    }
}

/// Body of a discharge summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DischargeContent {
    /// Free text (markdown)
    #[serde(default)]
    pub text: String,
    /// Named structured sections
    #[serde(default)]
    pub sections: BTreeMap<String, SectionValue>,
    /// Optional key/value summary
    #[serde(default)]
    pub summary: Option<BTreeMap<String, String>>,
}

impl DischargeContent {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Normalized copy: trimmed text, blank sections and summary entries removed.
    pub fn sanitized(&self) -> Self {
        let sections = self
            .sections
            .iter()
            .filter_map(|(name, value)| {
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                value.sanitized().map(|v| (name.to_string(), v))
            })
            .collect();
        let summary = self
            .summary
            .as_ref()
            .map(clean_map)
            .filter(|m| !m.is_empty());
        Self {
            text: self.text.trim().to_string(),
            sections,
            summary,
        }
    }

    /// Non-empty text or at least one non-empty section.
    pub fn has_content(&self) -> bool {
        let clean = self.sanitized();
        !clean.text.is_empty() || !clean.sections.is_empty()
    }
}

fn clean_map(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Input for a new discharge version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DischargeDraft {
    pub content: DischargeContent,
    pub status: DischargeStatus,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub commit_message: Option<String>,
}

impl DischargeDraft {
    pub fn new(content: DischargeContent) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }
}

/// One immutable saved version of a discharge summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DischargeVersion {
    pub version_id: String,
    pub patient_id: String,
    pub status: DischargeStatus,
    pub content: DischargeContent,
    /// Registration in use when the version was written
    pub registration_number: String,
    pub scheme: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    /// Soft delete flag; versions are never physically removed
    #[serde(default)]
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl DischargeVersion {
    pub fn sort_key(&self) -> String {
        discharge_sk(&self.created_at, &self.version_id)
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(patient_pk(&self.patient_id), self.sort_key())
    }
}

/// Mutable projection of the current discharge version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatestPointer {
    /// Sort key of the mirrored version
    pub current_version_key: String,
    pub current_version_id: String,
    #[serde(flatten)]
    pub version: DischargeVersion,
}

impl LatestPointer {
    pub fn mirror(version: &DischargeVersion) -> Self {
        Self {
            current_version_key: version.sort_key(),
            current_version_id: version.version_id.clone(),
            version: version.clone(),
        }
    }
}

/// Edit of a version's status and/or commit message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VersionPatch {
    pub status: Option<DischargeStatus>,
    pub commit_message: Option<String>,
}

impl VersionPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.commit_message.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(DischargeStatus::Published).unwrap(),
            serde_json::json!("published")
        );
        assert_eq!(DischargeStatus::parse("ARCHIVED"), Some(DischargeStatus::Archived));
    }

    #[test]
    fn test_blank_content_has_no_content() {
        let mut content = DischargeContent::from_text("   ");
        content
            .sections
            .insert("advice".into(), SectionValue::Text("  ".into()));
        let mut fields = BTreeMap::new();
        fields.insert("dose".into(), " ".into());
        content
            .sections
            .insert("meds".into(), SectionValue::Fields(fields));
        assert!(!content.has_content());
    }

    #[test]
    fn test_single_section_is_content() {
        let mut content = DischargeContent::default();
        content
            .sections
            .insert("advice".into(), SectionValue::Text(" rest ".into()));
        assert!(content.has_content());
        assert_eq!(
            content.sanitized().sections["advice"],
            SectionValue::Text("rest".into())
        );
    }

    #[test]
    fn test_sections_deserialize_untagged() {
        let content: DischargeContent = serde_json::from_value(serde_json::json!({
            "text": "Stable",
            "sections": { "advice": "rest", "vitals": { "bp": "120/80" } }
        }))
        .unwrap();
        assert!(matches!(content.sections["advice"], SectionValue::Text(_)));
        assert!(matches!(content.sections["vitals"], SectionValue::Fields(_)));
        assert!(content.summary.is_none());
    }

    #[test]
    fn test_latest_pointer_flattens_version() {
        let version = DischargeVersion {
            version_id: "v1".into(),
            patient_id: "p-1".into(),
            status: DischargeStatus::Draft,
            content: DischargeContent::from_text("x"),
            registration_number: "MRN-1".into(),
            scheme: "UHID".into(),
            author_id: ANONYMOUS_AUTHOR.into(),
            author_name: None,
            commit_message: None,
            deleted: false,
            created_at: "t1".into(),
            updated_at: "t1".into(),
        };
        let value = serde_json::to_value(LatestPointer::mirror(&version)).unwrap();
        assert_eq!(value["current_version_key"], "discharge:t1:v1");
        assert_eq!(value["version_id"], "v1");

        let back: LatestPointer = serde_json::from_value(value).unwrap();
        assert_eq!(back.version, version);
    }
}
