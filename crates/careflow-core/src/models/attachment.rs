//! Document attachment models.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Document category; each category is one list field on the documents record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentCategory {
    PreopPics,
    LabReports,
    Radiology,
    IntraopPics,
    OtNotes,
    PostopPics,
    DischargePics,
}

impl AttachmentCategory {
    pub const ALL: [AttachmentCategory; 7] = [
        AttachmentCategory::PreopPics,
        AttachmentCategory::LabReports,
        AttachmentCategory::Radiology,
        AttachmentCategory::IntraopPics,
        AttachmentCategory::OtNotes,
        AttachmentCategory::PostopPics,
        AttachmentCategory::DischargePics,
    ];

    /// Attribute name of the list on the documents record.
    pub fn field(&self) -> &'static str {
        match self {
            AttachmentCategory::PreopPics => "preop_pics",
            AttachmentCategory::LabReports => "lab_reports",
            AttachmentCategory::Radiology => "radiology",
            AttachmentCategory::IntraopPics => "intraop_pics",
            AttachmentCategory::OtNotes => "ot_notes",
            AttachmentCategory::PostopPics => "postop_pics",
            AttachmentCategory::DischargePics => "discharge_pics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|c| c.field() == s)
    }
}

/// Reference to an uploaded object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    /// Object storage key, always under `patients/<id>/`
    pub key: String,
    pub uploaded_at: String,
    #[serde(default)]
    pub uploaded_by: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Registration in use at upload time
    #[serde(default)]
    pub registration_number: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
}

/// Input for attaching an uploaded object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewAttachment {
    pub key: String,
    pub uploaded_by: Option<String>,
    pub caption: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

impl NewAttachment {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// All attachment lists of one patient.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttachmentSet {
    pub lists: BTreeMap<AttachmentCategory, Vec<Attachment>>,
    /// Concurrency stamp; `None` before the first write
    pub revision: Option<i64>,
}

impl AttachmentSet {
    pub fn get(&self, category: AttachmentCategory) -> &[Attachment] {
        self.lists.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_fields_round_trip() {
        for category in AttachmentCategory::ALL {
            assert_eq!(AttachmentCategory::parse(category.field()), Some(category));
            assert_eq!(
                serde_json::to_value(category).unwrap(),
                serde_json::json!(category.field())
            );
        }
        assert_eq!(AttachmentCategory::parse("xray"), None);
    }
}
