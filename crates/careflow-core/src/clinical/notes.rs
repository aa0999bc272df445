//! Clinical notes, newest first.

use tracing::{debug, info};

use super::{attach_file, detach_file, initial_files, non_blank, required};
use crate::config::CoreConfig;
use crate::db::{cursor_after, Condition, Database, Item, ItemKey, Mutation, Query, WriteOp};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::IdentityResolver;
use crate::models::keys::{new_canonical_id, now_timestamp, patient_pk, profile_key, NOTE_PREFIX};
use crate::models::{EpisodeRecord, NewNote, Note, NotePatch};

/// Options for listing notes.
#[derive(Debug, Clone, Default)]
pub struct ListNotes {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub include_deleted: bool,
}

/// One page of notes, newest first.
#[derive(Debug, Clone, Default)]
pub struct NotePage {
    pub notes: Vec<Note>,
    pub next_cursor: Option<String>,
}

/// Notes of patients.
pub struct NoteStore<'a> {
    db: &'a Database,
    config: CoreConfig,
}

impl<'a> NoteStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_config(db, CoreConfig::default())
    }

    pub fn with_config(db: &'a Database, config: CoreConfig) -> Self {
        Self { db, config }
    }

    fn episode(&self, any_id: &str) -> LedgerResult<EpisodeRecord> {
        IdentityResolver::new(self.db).resolve_existing(any_id)
    }

    /// Write a note and bump the patient's update counter in one transaction.
    pub fn create_note(&self, any_id: &str, input: NewNote) -> LedgerResult<Note> {
        let author_id = required("author id", &input.author_id)?;
        let content = required("content", &input.content)?;
        let episode = self.episode(any_id)?;
        let files = initial_files(&episode.patient_id, &input.files)?;
        let now = now_timestamp();

        let note = Note {
            note_id: new_canonical_id(),
            patient_id: episode.patient_id.clone(),
            author_id,
            category: input.category,
            content,
            files,
            registration_number: Some(episode.active_registration_number.clone()),
            scheme: Some(episode.active_scheme.clone()),
            deleted: false,
            created_at: now.clone(),
            updated_at: now,
        };

        self.db.transact_write(vec![
            WriteOp::Put {
                item: Item::from_record(note.key(), &note)?,
                condition: Some(Condition::NotExists),
            },
            WriteOp::Update {
                key: profile_key(&episode.patient_id),
                mutations: vec![Mutation::increment("update_counter", 1)],
                condition: Some(Condition::Exists),
            },
        ])?;

        info!(
            patient_id = %note.patient_id,
            note_id = %note.note_id,
            category = note.category.as_str(),
            "note created"
        );
        Ok(note)
    }

    /// Notes newest first, skipping deleted ones unless asked.
    pub fn list_notes(&self, any_id: &str, options: ListNotes) -> LedgerResult<NotePage> {
        let episode = self.episode(any_id)?;
        let limit = self.config.clamp_page(options.limit);
        let mut notes = Vec::new();
        let mut cursor = options.cursor;

        loop {
            let page = self.db.query_items(
                &Query::new(patient_pk(&episode.patient_id), NOTE_PREFIX)
                    .descending()
                    .limit(limit)
                    .after(cursor),
            )?;
            let has_more = page.next_cursor.is_some();
            let count = page.items.len();

            for (i, item) in page.items.iter().enumerate() {
                let note: Note = item.to_record()?;
                if note.deleted && !options.include_deleted {
                    continue;
                }
                notes.push(note);
                if notes.len() == limit {
                    let more = has_more || i + 1 < count;
                    return Ok(NotePage {
                        notes,
                        next_cursor: more.then(|| cursor_after(&item.key.sk)),
                    });
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(NotePage { notes, next_cursor: None }),
            }
        }
    }

    /// One note by id. Deleted notes only with `include_deleted`.
    pub fn get_note(&self, any_id: &str, note_id: &str, include_deleted: bool) -> LedgerResult<Note> {
        let episode = self.episode(any_id)?;
        match self.find_note(&episode.patient_id, note_id)? {
            Some(note) if include_deleted || !note.deleted => Ok(note),
            _ => Err(LedgerError::NotFound(format!("note {}", note_id))),
        }
    }

    /// Change a note's category and/or content.
    pub fn patch_note(&self, any_id: &str, note_id: &str, patch: NotePatch) -> LedgerResult<Note> {
        if patch.category.is_none() && patch.content.is_none() {
            return Err(LedgerError::Validation("nothing to update".into()));
        }
        let content = match patch.content {
            Some(content) => Some(
                non_blank(Some(content))
                    .ok_or_else(|| LedgerError::Validation("content cannot be blank".into()))?,
            ),
            None => None,
        };
        let note = self.existing(any_id, note_id)?;

        let mut mutations = vec![Mutation::set("updated_at", now_timestamp())];
        if let Some(category) = patch.category {
            mutations.push(Mutation::set("category", category.as_str()));
        }
        if let Some(content) = content {
            mutations.push(Mutation::set("content", content));
        }
        let updated = self
            .db
            .update_item(&note.key(), &mutations, Some(Condition::Exists))?;
        debug!(note_id = %note.note_id, "note patched");
        Ok(updated.to_record()?)
    }

    /// Flag a note deleted. The record is kept.
    pub fn soft_delete_note(&self, any_id: &str, note_id: &str) -> LedgerResult<Note> {
        let note = self.existing(any_id, note_id)?;
        if note.deleted {
            return Ok(note);
        }
        let updated = self.db.update_item(
            &note.key(),
            &[
                Mutation::set("deleted", true),
                Mutation::set("updated_at", now_timestamp()),
            ],
            Some(Condition::Exists),
        )?;
        info!(patient_id = %note.patient_id, note_id = %note.note_id, "note deleted");
        Ok(updated.to_record()?)
    }

    /// Attach an uploaded object to a note. Attaching twice is a no-op.
    pub fn attach_file(&self, any_id: &str, note_id: &str, object_key: &str) -> LedgerResult<Note> {
        let note = self.existing(any_id, note_id)?;
        attach_file(self.db, &note.key(), &note.patient_id, object_key)?;
        self.reload(&note.key(), note_id)
    }

    /// Detach an object from a note.
    pub fn detach_file(&self, any_id: &str, note_id: &str, object_key: &str) -> LedgerResult<Note> {
        let note = self.existing(any_id, note_id)?;
        detach_file(self.db, &note.key(), object_key)?;
        self.reload(&note.key(), note_id)
    }

    fn existing(&self, any_id: &str, note_id: &str) -> LedgerResult<Note> {
        let episode = self.episode(any_id)?;
        self.find_note(&episode.patient_id, note_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("note {}", note_id)))
    }

    fn reload(&self, key: &ItemKey, note_id: &str) -> LedgerResult<Note> {
        match self.db.get_item(key)? {
            Some(item) => Ok(item.to_record()?),
            None => Err(LedgerError::NotFound(format!("note {}", note_id))),
        }
    }

    /// Note ids are not in the sort key's leading position, so lookup walks
    /// the patient's notes newest first.
    fn find_note(&self, patient_id: &str, note_id: &str) -> LedgerResult<Option<Note>> {
        let note_id = note_id.trim();
        if note_id.is_empty() {
            return Err(LedgerError::Validation("note id is required".into()));
        }
        let mut cursor = None;
        loop {
            let page = self.db.query_items(
                &Query::new(patient_pk(patient_id), NOTE_PREFIX)
                    .descending()
                    .limit(self.config.scan_page_size())
                    .after(cursor),
            )?;
            for item in &page.items {
                let note: Note = item.to_record()?;
                if note.note_id == note_id {
                    return Ok(Some(note));
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::object_prefix;
    use crate::episode::EpisodeService;
    use crate::models::{NewPatient, NoteCategory};
    use std::thread::sleep;
    use std::time::Duration;

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let record = EpisodeService::new(&db)
            .create_patient(NewPatient::new("Asha Rao", "MRN-1", "UHID", "ortho"))
            .unwrap();
        (db, record.patient_id)
    }

    fn note(text: &str) -> NewNote {
        NewNote::new("dr-1", NoteCategory::DoctorNote, text)
    }

    #[test]
    fn test_create_note_bumps_counter() {
        let (db, id) = setup();
        let store = NoteStore::new(&db);

        let created = store.create_note("MRN-1", note("Wound clean")).unwrap();
        assert_eq!(created.patient_id, id);
        assert_eq!(created.registration_number.as_deref(), Some("MRN-1"));
        assert!(!created.deleted);

        let episode = EpisodeService::new(&db).get(&id).unwrap();
        assert_eq!(episode.update_counter, 1);
        assert_eq!(store.get_note(&id, &created.note_id, false).unwrap(), created);
    }

    #[test]
    fn test_create_note_requires_author_and_content() {
        let (db, id) = setup();
        let store = NoteStore::new(&db);

        let err = store
            .create_note(&id, NewNote::new(" ", NoteCategory::NurseNote, "text"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        let err = store.create_note(&id, note("  ")).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(store.list_notes(&id, ListNotes::default()).unwrap().notes.is_empty());
    }

    #[test]
    fn test_list_newest_first_and_hides_deleted() {
        let (db, id) = setup();
        let store = NoteStore::new(&db);
        let first = store.create_note(&id, note("first")).unwrap();
        sleep(Duration::from_millis(2));
        let second = store.create_note(&id, note("second")).unwrap();
        sleep(Duration::from_millis(2));
        let third = store.create_note(&id, note("third")).unwrap();

        store.soft_delete_note(&id, &second.note_id).unwrap();

        let live = store.list_notes(&id, ListNotes::default()).unwrap();
        let ids: Vec<_> = live.notes.iter().map(|n| n.note_id.as_str()).collect();
        assert_eq!(ids, vec![third.note_id.as_str(), first.note_id.as_str()]);

        let page = store
            .list_notes(
                &id,
                ListNotes {
                    limit: Some(2),
                    include_deleted: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.notes.len(), 2);
        assert_eq!(page.notes[1].note_id, second.note_id);
        let rest = store
            .list_notes(
                &id,
                ListNotes {
                    limit: Some(2),
                    cursor: page.next_cursor,
                    include_deleted: true,
                },
            )
            .unwrap();
        assert_eq!(rest.notes.len(), 1);
        assert_eq!(rest.notes[0].note_id, first.note_id);
        assert!(rest.next_cursor.is_none());
    }

    #[test]
    fn test_patch_note() {
        let (db, id) = setup();
        let store = NoteStore::new(&db);
        let created = store.create_note(&id, note("draft")).unwrap();

        let err = store
            .patch_note(&id, &created.note_id, NotePatch::default())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let patched = store
            .patch_note(
                &id,
                &created.note_id,
                NotePatch {
                    category: Some(NoteCategory::Pharmacy),
                    content: Some(" Hold warfarin ".into()),
                },
            )
            .unwrap();
        assert_eq!(patched.category, NoteCategory::Pharmacy);
        assert_eq!(patched.content, "Hold warfarin");
        assert_eq!(patched.created_at, created.created_at);

        let err = store
            .patch_note(&id, "missing", NotePatch { content: Some("x".into()), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn test_deleted_note_is_hidden_from_get() {
        let (db, id) = setup();
        let store = NoteStore::new(&db);
        let created = store.create_note(&id, note("x")).unwrap();

        let deleted = store.soft_delete_note(&id, &created.note_id).unwrap();
        assert!(deleted.deleted);
        assert!(matches!(
            store.get_note(&id, &created.note_id, false),
            Err(LedgerError::NotFound(_))
        ));
        assert!(store.get_note(&id, &created.note_id, true).unwrap().deleted);
    }

    #[test]
    fn test_attach_and_detach_files() {
        let (db, id) = setup();
        let store = NoteStore::new(&db);
        let created = store.create_note(&id, note("see photo")).unwrap();
        let key = format!("{}notes/{}/wound.jpg", object_prefix(&id), created.note_id);

        let attached = store.attach_file(&id, &created.note_id, &key).unwrap();
        assert_eq!(attached.files, vec![key.clone()]);
        let again = store.attach_file(&id, &created.note_id, &key).unwrap();
        assert_eq!(again.files.len(), 1);

        let err = store
            .attach_file(&id, &created.note_id, "patients/someone-else/x.jpg")
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let detached = store.detach_file(&id, &created.note_id, &key).unwrap();
        assert!(detached.files.is_empty());
        let detached = store.detach_file(&id, &created.note_id, &key).unwrap();
        assert!(detached.files.is_empty());

        let err = store.attach_file(&id, "missing", &key).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
