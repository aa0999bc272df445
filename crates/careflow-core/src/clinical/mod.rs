//! Clinical notes and medication orders.
//!
//! Both record kinds live in the patient's partition and carry a `files` list
//! of object keys. The list is changed through [`ListMutator`], so two
//! concurrent attaches on the same record cannot silently drop one another:
//! the loser gets `Conflict`.

mod meds;
mod notes;

pub use meds::{ListMedications, MedicationPage, MedicationStore};
pub use notes::{ListNotes, NotePage, NoteStore};

use tracing::debug;

use crate::attachments::owned_object_key;
use crate::concurrency::ListMutator;
use crate::db::{Database, ItemKey};
use crate::error::{LedgerError, LedgerResult};
use crate::models::FILES_ATTR;

/// Validate and de-duplicate object keys supplied at creation.
fn initial_files(patient_id: &str, files: &[String]) -> LedgerResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(files.len());
    for file in files {
        let key = owned_object_key(patient_id, file)?;
        if !out.contains(&key) {
            out.push(key);
        }
    }
    Ok(out)
}

/// Add `object_key` to the record's files unless already present.
fn attach_file(
    db: &Database,
    record: &ItemKey,
    patient_id: &str,
    object_key: &str,
) -> LedgerResult<Vec<String>> {
    let object_key = owned_object_key(patient_id, object_key)?;
    let mutator = ListMutator::new(db);
    let snapshot = mutator.read::<String>(record, FILES_ATTR)?;
    if snapshot.revision.is_none() {
        return Err(LedgerError::NotFound(format!("record {}", record)));
    }
    if snapshot.items.contains(&object_key) {
        debug!(record = %record, "file already attached");
        return Ok(snapshot.items);
    }

    let mut files = snapshot.items;
    files.push(object_key);
    mutator.write(record, FILES_ATTR, &files, snapshot.revision)?;
    Ok(files)
}

/// Drop `object_key` from the record's files. Absent keys are not an error.
fn detach_file(db: &Database, record: &ItemKey, object_key: &str) -> LedgerResult<Vec<String>> {
    let object_key = object_key.trim();
    if object_key.is_empty() {
        return Err(LedgerError::Validation("object key is required".into()));
    }
    let (snapshot, removed) =
        ListMutator::new(db).remove_where(record, FILES_ATTR, |k: &String| k == object_key)?;
    if snapshot.revision.is_none() {
        return Err(LedgerError::NotFound(format!("record {}", record)));
    }
    debug!(record = %record, removed, "file detached");
    Ok(snapshot.items)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(field: &str, value: &str) -> LedgerResult<String> {
    non_blank(Some(value.to_string()))
        .ok_or_else(|| LedgerError::Validation(format!("{} is required", field)))
}
