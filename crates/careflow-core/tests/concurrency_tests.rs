//! Optimistic-concurrency tests for shared list records.

use std::time::Duration;

use careflow_core::attachments::{object_prefix, AttachmentStore};
use careflow_core::clinical::{MedicationStore, NoteStore};
use careflow_core::concurrency::{retry_on_conflict, ListMutator};
use careflow_core::db::Database;
use careflow_core::episode::EpisodeService;
use careflow_core::error::LedgerError;
use careflow_core::models::keys::documents_key;
use careflow_core::models::{
    Attachment, AttachmentCategory, NewAttachment, NewMedication, NewNote, NewPatient,
    NoteCategory, FILES_ATTR,
};

fn attachment(key: String) -> Attachment {
    Attachment {
        key,
        uploaded_at: "2024-05-01T10:00:00.000000Z".into(),
        uploaded_by: None,
        caption: None,
        mime_type: Some("application/pdf".into()),
        size: Some(1024),
        registration_number: None,
        scheme: None,
    }
}

fn admit(db: &Database) -> String {
    EpisodeService::new(db)
        .create_patient(NewPatient::new("Asha Rao", "MRN-1", "UHID", "ortho"))
        .unwrap()
        .patient_id
}

#[test]
fn test_two_writers_same_stamp_one_conflicts_then_retry_wins() {
    let db = Database::open_in_memory().unwrap();
    let id = admit(&db);
    let key = documents_key(&id);
    let field = AttachmentCategory::LabReports.field();
    let mutator = ListMutator::new(&db);
    let first = attachment(format!("{}cbc.pdf", object_prefix(&id)));
    let second = attachment(format!("{}lft.pdf", object_prefix(&id)));

    // Both callers read before either writes.
    let a = mutator.read::<Attachment>(&key, field).unwrap();
    let b = mutator.read::<Attachment>(&key, field).unwrap();
    assert_eq!(a.revision, b.revision);

    let mut a_items = a.items.clone();
    a_items.push(first.clone());
    mutator.write(&key, field, &a_items, a.revision).unwrap();

    let mut b_items = b.items.clone();
    b_items.push(second.clone());
    let err = mutator.write(&key, field, &b_items, b.revision).unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    retry_on_conflict(3, || mutator.append(&key, field, second.clone())).unwrap();

    let list = AttachmentStore::new(&db).list(&id).unwrap();
    let keys: Vec<_> = list
        .get(AttachmentCategory::LabReports)
        .iter()
        .map(|a| a.key.clone())
        .collect();
    assert_eq!(keys, vec![first.key, second.key]);
    assert_eq!(list.revision, Some(2));
}

#[test]
fn test_conflict_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("careflow.db");
    let db_a = Database::open_with_timeout(&path, Duration::from_secs(5)).unwrap();
    let db_b = Database::open_with_timeout(&path, Duration::from_secs(5)).unwrap();
    let id = admit(&db_a);
    let key = documents_key(&id);
    let field = AttachmentCategory::Radiology.field();

    let a = ListMutator::new(&db_a).read::<Attachment>(&key, field).unwrap();
    let b = ListMutator::new(&db_b).read::<Attachment>(&key, field).unwrap();
    assert_eq!(a.revision, None);

    ListMutator::new(&db_a)
        .write(&key, field, &[attachment(format!("{}x1.png", object_prefix(&id)))], a.revision)
        .unwrap();
    let err = ListMutator::new(&db_b)
        .write(&key, field, &[attachment(format!("{}x2.png", object_prefix(&id)))], b.revision)
        .unwrap_err();
    assert!(err.is_conflict());

    let mut input = NewAttachment::new(format!("{}x2.png", object_prefix(&id)));
    input.caption = Some("lateral".into());
    retry_on_conflict(3, || {
        AttachmentStore::new(&db_b).attach(&id, AttachmentCategory::Radiology, input.clone())
    })
    .unwrap();

    let list = AttachmentStore::new(&db_a).list("MRN-1").unwrap();
    assert_eq!(list.get(AttachmentCategory::Radiology).len(), 2);
}

#[test]
fn test_lists_are_independent_per_category() {
    let db = Database::open_in_memory().unwrap();
    let id = admit(&db);
    let store = AttachmentStore::new(&db);

    store
        .attach(
            &id,
            AttachmentCategory::OtNotes,
            NewAttachment::new(format!("{}ot.pdf", object_prefix(&id))),
        )
        .unwrap();
    store
        .attach(
            &id,
            AttachmentCategory::Radiology,
            NewAttachment::new(format!("{}ct.png", object_prefix(&id))),
        )
        .unwrap();

    let list = store.list(&id).unwrap();
    assert_eq!(list.get(AttachmentCategory::OtNotes).len(), 1);
    assert_eq!(list.get(AttachmentCategory::Radiology).len(), 1);
    assert_eq!(list.revision, Some(2));
}

#[test]
fn test_note_files_lost_update_is_a_conflict() {
    let db = Database::open_in_memory().unwrap();
    let id = admit(&db);
    let store = NoteStore::new(&db);
    let note = store
        .create_note(&id, NewNote::new("dr-1", NoteCategory::DoctorNote, "Post-op check"))
        .unwrap();
    let key = note.key();
    let mutator = ListMutator::new(&db);
    let first = format!("{}notes/a.jpg", object_prefix(&id));
    let second = format!("{}notes/b.jpg", object_prefix(&id));

    let a = mutator.read::<String>(&key, FILES_ATTR).unwrap();
    let b = mutator.read::<String>(&key, FILES_ATTR).unwrap();
    assert_eq!(a.revision, Some(0));

    mutator.write(&key, FILES_ATTR, &[first.clone()], a.revision).unwrap();
    let err = mutator
        .write(&key, FILES_ATTR, &[second.clone()], b.revision)
        .unwrap_err();
    assert!(err.is_conflict());

    let note = retry_on_conflict(3, || store.attach_file(&id, &note.note_id, &second)).unwrap();
    assert_eq!(note.files, vec![first, second]);
    assert_eq!(note.content, "Post-op check");
}

#[test]
fn test_medication_files_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("careflow.db");
    let db_a = Database::open_with_timeout(&path, Duration::from_secs(5)).unwrap();
    let db_b = Database::open_with_timeout(&path, Duration::from_secs(5)).unwrap();
    let id = admit(&db_a);
    let med = MedicationStore::new(&db_a)
        .create_medication(
            "MRN-1",
            NewMedication::new("Heparin", "5000 IU", "SC", "BD", "2026-01-01T08:00:00Z"),
        )
        .unwrap();
    let chart = format!("{}meds/chart.pdf", object_prefix(&id));
    let label = format!("{}meds/label.jpg", object_prefix(&id));

    MedicationStore::new(&db_a)
        .attach_file(&id, &med.med_id, &chart)
        .unwrap();
    let seen = MedicationStore::new(&db_b)
        .attach_file("MRN-1", &med.med_id, &label)
        .unwrap();
    assert_eq!(seen.files, vec![chart.clone(), label]);

    let after = MedicationStore::new(&db_a)
        .detach_file(&id, &med.med_id, &chart)
        .unwrap();
    assert_eq!(after.files.len(), 1);
    assert_eq!(after.name, "Heparin");
}
