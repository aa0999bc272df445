//! Document attachment lists, one list per category on a single record.

use serde_json::Value;
use tracing::info;

use crate::concurrency::{ListMutator, REVISION_ATTR};
use crate::db::{Database, DbError};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::IdentityResolver;
use crate::models::keys::{documents_key, now_timestamp};
use crate::models::{Attachment, AttachmentCategory, AttachmentSet, NewAttachment};

/// Object-key prefix every attachment of `patient_id` must live under.
///
/// Characters outside `[A-Za-z0-9._-]` are replaced, each run by a single `_`.
pub fn object_prefix(patient_id: &str) -> String {
    let mut safe = String::with_capacity(patient_id.len());
    let mut in_run = false;
    for c in patient_id.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            safe.push(c);
            in_run = false;
        } else if !in_run {
            safe.push('_');
            in_run = true;
        }
    }
    format!("patients/{}/", safe)
}

/// Trimmed `object_key` if it names an object under the patient's prefix.
pub(crate) fn owned_object_key(patient_id: &str, object_key: &str) -> LedgerResult<String> {
    let key = object_key.trim();
    if key.is_empty() {
        return Err(LedgerError::Validation("object key is required".into()));
    }
    let prefix = object_prefix(patient_id);
    if !key.starts_with(&prefix) || key.len() == prefix.len() {
        return Err(LedgerError::Validation(format!(
            "object key must start with {}",
            prefix
        )));
    }
    Ok(key.to_string())
}

/// Attachment lists of patients.
pub struct AttachmentStore<'a> {
    db: &'a Database,
}

impl<'a> AttachmentStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Every category's list plus the current revision.
    pub fn list(&self, any_id: &str) -> LedgerResult<AttachmentSet> {
        let episode = IdentityResolver::new(self.db).resolve_existing(any_id)?;
        let Some(item) = self.db.get_item(&documents_key(&episode.patient_id))? else {
            return Ok(AttachmentSet::default());
        };

        let mut set = AttachmentSet {
            revision: Some(item.get_i64(REVISION_ATTR).unwrap_or(0)),
            ..Default::default()
        };
        for category in AttachmentCategory::ALL {
            let list: Vec<Attachment> = match item.get(category.field()) {
                None | Some(Value::Null) => continue,
                Some(value) => serde_json::from_value(value.clone()).map_err(DbError::from)?,
            };
            set.lists.insert(category, list);
        }
        Ok(set)
    }

    /// Append an attachment. A concurrent writer surfaces as `Conflict`.
    pub fn attach(
        &self,
        any_id: &str,
        category: AttachmentCategory,
        input: NewAttachment,
    ) -> LedgerResult<Attachment> {
        let episode = IdentityResolver::new(self.db).resolve_existing(any_id)?;
        let key = owned_object_key(&episode.patient_id, &input.key)?;

        let attachment = Attachment {
            key,
            uploaded_at: now_timestamp(),
            uploaded_by: input.uploaded_by,
            caption: input.caption,
            mime_type: input.mime_type,
            size: input.size,
            registration_number: Some(episode.active_registration_number.clone()),
            scheme: Some(episode.active_scheme.clone()),
        };
        let snapshot = ListMutator::new(self.db).append(
            &documents_key(&episode.patient_id),
            category.field(),
            attachment.clone(),
        )?;
        info!(
            patient_id = %episode.patient_id,
            category = category.field(),
            revision = ?snapshot.revision,
            "attachment added"
        );
        Ok(attachment)
    }

    /// Remove an attachment by object key.
    pub fn detach(&self, any_id: &str, category: AttachmentCategory, object_key: &str) -> LedgerResult<()> {
        let episode = IdentityResolver::new(self.db).resolve_existing(any_id)?;
        let object_key = object_key.trim();
        let (_, removed) = ListMutator::new(self.db).remove_where(
            &documents_key(&episode.patient_id),
            category.field(),
            |a: &Attachment| a.key == object_key,
        )?;
        if removed == 0 {
            return Err(LedgerError::NotFound(format!("attachment {}", object_key)));
        }
        info!(patient_id = %episode.patient_id, category = category.field(), "attachment removed");
        Ok(())
    }
}
