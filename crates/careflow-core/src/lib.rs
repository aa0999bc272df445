//! Careflow Core Library
//!
//! Clinical episode ledger on a partition-keyed record store: patient identity,
//! care-stage progression and versioned discharge summaries.
//!
//! # Architecture
//!
//! ```text
//!        caller (UI / API / FFI)
//!                  │
//!          Identity Resolver          canonical id or registration number
//!                  │
//!    ┌─────────────┼──────────────┬──────────────────┐
//!    │             │              │                  │
//!    ▼             ▼              ▼                  ▼
//!  Episode    State Machine   MRN Registry    Discharge Store
//!  Record    (checklist gate) (switch/history) (versions + latest)
//!    │             │              │                  │
//!    └─────────────┴──────┬───────┴──────────────────┘
//!                         │
//!             ┌───────────▼────────────┐
//!             │   Record Store (db)    │
//!             │ conditional writes +   │
//!             │ all-or-nothing batches │
//!             └────────────────────────┘
//! ```
//!
//! # Core Principle
//!
//! **Every multi-record effect is one `transact_write`.** There is no in-process
//! locking; a writer that loses a race gets `Conflict` and decides itself
//! whether to re-read and retry.
//!
//! # Modules
//!
//! - [`db`]: SQLite-backed item store with conditions, mutations and batches
//! - [`models`]: Domain types (EpisodeRecord, TimelineSegment, DischargeVersion, etc.)
//! - [`identity`]: Identifier resolution
//! - [`episode`]: Episode operations and checklist-gated stage transitions
//! - [`registry`]: MRN pointers, registration switches and history
//! - [`checklist`]: Allowed stage transitions
//! - [`discharge`]: Discharge versions and the latest projection
//! - [`concurrency`]: Optimistic list mutator and retry helper
//! - [`attachments`]: Document attachment lists
//! - [`clinical`]: Clinical notes and medication orders

pub mod attachments;
pub mod checklist;
pub mod clinical;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod discharge;
pub mod episode;
pub mod error;
pub mod identity;
pub mod models;
pub mod registry;

// Re-export commonly used types
pub use attachments::AttachmentStore;
pub use checklist::ChecklistGate;
pub use clinical::{ListMedications, ListNotes, MedicationStore, NoteStore};
pub use concurrency::{retry_on_conflict, ListMutator, ListSnapshot};
pub use config::CoreConfig;
pub use db::Database;
pub use discharge::{
    DeleteOutcome, DischargeStore, LatestChange, ListVersions, MirrorSync, PatchOutcome,
};
pub use episode::{EpisodeService, TransitionRequest};
pub use error::{LedgerError, LedgerResult};
pub use identity::{IdentityResolver, Resolution, ResolvedVia};
pub use models::{
    ChecklistEntry, DischargeContent, DischargeDraft, DischargeStatus, DischargeVersion,
    EpisodeRecord, EpisodeStatus, EpisodeUpdate, Medication, MrnPointer, NewMedication, NewNote,
    NewPatient, Note, TimelineSegment,
};
pub use registry::{HistoryEntryInput, MrnRegistry, RegistrationSwitch};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use models::{
    Address, Attachment, AttachmentCategory, AttachmentSet, EmergencyContact, MedPriority,
    MedicationPatch, NewAttachment, NoteCategory, NotePatch, RegistrationEntry, SectionValue,
};

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CareflowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transition not allowed: {0}")]
    TransitionNotAllowed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<LedgerError> for CareflowError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(msg) => CareflowError::NotFound(msg),
            LedgerError::Validation(msg) => CareflowError::Validation(msg),
            LedgerError::TransitionNotAllowed { from, to } => {
                CareflowError::TransitionNotAllowed(format!("{} -> {}", from, to))
            }
            LedgerError::Conflict(msg) => CareflowError::Conflict(msg),
            LedgerError::StoreUnavailable(msg) => CareflowError::StoreUnavailable(msg),
        }
    }
}

impl From<db::DbError> for CareflowError {
    fn from(e: db::DbError) -> Self {
        LedgerError::from(e).into()
    }
}

impl From<serde_json::Error> for CareflowError {
    fn from(e: serde_json::Error) -> Self {
        CareflowError::Validation(format!("malformed JSON: {}", e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for CareflowError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        CareflowError::StoreUnavailable(format!("Lock poisoned: {}", e))
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Open or create a database at the given path.
#[uniffi::export]
pub fn open_database(path: String) -> Result<Arc<CareflowCore>, CareflowError> {
    let db = Database::open(&path)?;
    Ok(CareflowCore::wrap(db, CoreConfig::default()))
}

/// Open the database named by the `CAREFLOW_*` environment variables.
#[uniffi::export]
pub fn open_database_from_env() -> Result<Arc<CareflowCore>, CareflowError> {
    let config = CoreConfig::from_env()?;
    let db = Database::open_with_timeout(config.database_path(), config.busy_timeout())?;
    Ok(CareflowCore::wrap(db, config))
}

/// Create an in-memory database (for testing).
#[uniffi::export]
pub fn open_database_in_memory() -> Result<Arc<CareflowCore>, CareflowError> {
    let db = Database::open_in_memory()?;
    Ok(CareflowCore::wrap(db, CoreConfig::default()))
}

/// Install a global fmt subscriber. Returns false if one is already installed.
#[uniffi::export]
pub fn init_logging(filter: String) -> bool {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_new(filter.trim())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("careflow_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

// =========================================================================
// Main API Object
// =========================================================================

/// Thread-safe database wrapper for FFI.
#[derive(uniffi::Object)]
pub struct CareflowCore {
    db: Arc<Mutex<Database>>,
    config: CoreConfig,
}

impl CareflowCore {
    fn wrap(db: Database, config: CoreConfig) -> Arc<Self> {
        Arc::new(Self {
            db: Arc::new(Mutex::new(db)),
            config,
        })
    }
}

#[uniffi::export]
impl CareflowCore {
    // =========================================================================
    // Checklist Operations
    // =========================================================================

    /// Seed the stock pathway; existing entries are kept. Returns entries written.
    pub fn seed_default_checklists(&self) -> Result<u32, CareflowError> {
        let db = self.db.lock()?;
        Ok(ChecklistGate::new(&db).seed_defaults()? as u32)
    }

    /// Add or replace a checklist entry.
    pub fn upsert_checklist_entry(&self, entry: FfiChecklistEntry) -> Result<(), CareflowError> {
        let db = self.db.lock()?;
        ChecklistGate::new(&db).upsert(&entry.into())?;
        Ok(())
    }

    /// Get the entry for a stage pair.
    pub fn get_checklist_entry(
        &self,
        from_stage: String,
        to_stage: String,
    ) -> Result<Option<FfiChecklistEntry>, CareflowError> {
        let db = self.db.lock()?;
        let entry = ChecklistGate::new(&db).requirement(&from_stage, &to_stage)?;
        Ok(entry.map(|e| e.into()))
    }

    /// Transitions allowed out of a stage.
    pub fn get_checklist_targets(
        &self,
        from_stage: String,
    ) -> Result<Vec<FfiChecklistEntry>, CareflowError> {
        let db = self.db.lock()?;
        let entries = ChecklistGate::new(&db).targets_from(&from_stage)?;
        Ok(entries.into_iter().map(|e| e.into()).collect())
    }

    // =========================================================================
    // Patient Operations
    // =========================================================================

    /// Register a new patient.
    pub fn create_patient(&self, input: FfiNewPatient) -> Result<FfiEpisode, CareflowError> {
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        Ok(service.create_patient(input.into())?.into())
    }

    /// Get a patient by canonical id or registration number.
    pub fn get_patient(&self, any_id: String) -> Result<FfiEpisode, CareflowError> {
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        Ok(service.get(&any_id)?.into())
    }

    /// List patients of a department with a status (ACTIVE or INACTIVE).
    pub fn list_patients(
        &self,
        department: String,
        status: String,
        limit: Option<u32>,
        cursor: Option<String>,
    ) -> Result<FfiEpisodePage, CareflowError> {
        let status = parse_episode_status(&status)?;
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        let page = service.list_by_cohort(&department, status, limit.map(|l| l as usize), cursor)?;
        Ok(FfiEpisodePage {
            episodes: page.episodes.into_iter().map(|e| e.into()).collect(),
            next_cursor: page.next_cursor,
        })
    }

    /// Update demographic and episode fields.
    pub fn update_patient(
        &self,
        any_id: String,
        update: FfiEpisodeUpdate,
    ) -> Result<FfiEpisode, CareflowError> {
        let update: EpisodeUpdate = update.try_into()?;
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        Ok(service.update(&any_id, update)?.into())
    }

    /// Soft-deactivate a patient.
    pub fn deactivate_patient(&self, any_id: String) -> Result<FfiEpisode, CareflowError> {
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        Ok(service.deactivate(&any_id)?.into())
    }

    /// Move a patient to another stage.
    pub fn transition_stage(
        &self,
        any_id: String,
        request: FfiTransition,
    ) -> Result<FfiEpisode, CareflowError> {
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        Ok(service.transition(&any_id, request.into())?.into())
    }

    /// Timeline segments, oldest first unless `newest_first`.
    pub fn get_timeline(
        &self,
        any_id: String,
        newest_first: bool,
        limit: Option<u32>,
        cursor: Option<String>,
    ) -> Result<FfiTimelinePage, CareflowError> {
        let order = if newest_first {
            db::SortOrder::Descending
        } else {
            db::SortOrder::Ascending
        };
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        let page = service.timeline(&any_id, order, limit.map(|l| l as usize), cursor)?;
        Ok(FfiTimelinePage {
            segments: page.segments.into_iter().map(|s| s.into()).collect(),
            next_cursor: page.next_cursor,
        })
    }

    /// The currently open timeline segment.
    pub fn get_open_segment(&self, any_id: String) -> Result<Option<FfiTimelineSegment>, CareflowError> {
        let db = self.db.lock()?;
        let service = EpisodeService::with_config(&db, self.config.clone());
        Ok(service.open_segment(&any_id)?.map(|s| s.into()))
    }

    // =========================================================================
    // Registration Operations
    // =========================================================================

    /// Make another registration number active.
    pub fn switch_registration(
        &self,
        any_id: String,
        switch: FfiRegistrationSwitch,
    ) -> Result<FfiEpisode, CareflowError> {
        let switch: RegistrationSwitch = switch.try_into()?;
        let db = self.db.lock()?;
        let registry = MrnRegistry::with_config(&db, self.config.clone());
        Ok(registry.switch_registration(&any_id, switch)?.into())
    }

    /// Replace the registration history; the latest-dated entry becomes active.
    pub fn overwrite_registration_history(
        &self,
        any_id: String,
        entries: Vec<FfiHistoryEntry>,
        actor_id: Option<String>,
    ) -> Result<FfiEpisode, CareflowError> {
        let db = self.db.lock()?;
        let registry = MrnRegistry::with_config(&db, self.config.clone());
        let entries = entries.into_iter().map(|e| e.into()).collect();
        Ok(registry.overwrite_history(&any_id, entries, actor_id)?.into())
    }

    /// Edit past registration entries; the active one must remain.
    pub fn edit_registration_history(
        &self,
        any_id: String,
        entries: Vec<FfiHistoryEntry>,
    ) -> Result<FfiEpisode, CareflowError> {
        let db = self.db.lock()?;
        let registry = MrnRegistry::with_config(&db, self.config.clone());
        let entries = entries.into_iter().map(|e| e.into()).collect();
        Ok(registry.edit_history(&any_id, entries)?.into())
    }

    /// Look up the pointer of a registration number.
    pub fn get_registration_pointer(&self, number: String) -> Result<FfiMrnPointer, CareflowError> {
        let db = self.db.lock()?;
        let registry = MrnRegistry::with_config(&db, self.config.clone());
        Ok(registry.pointer(&number)?.into())
    }

    // =========================================================================
    // Discharge Operations
    // =========================================================================

    /// Save a new discharge version and make it the latest.
    pub fn create_discharge_version(
        &self,
        any_id: String,
        draft: FfiDischargeDraft,
    ) -> Result<FfiDischargeVersion, CareflowError> {
        let draft: DischargeDraft = draft.try_into()?;
        let db = self.db.lock()?;
        let store = DischargeStore::with_config(&db, self.config.clone());
        store.create_version(&any_id, draft)?.try_into()
    }

    /// List versions newest first.
    pub fn list_discharge_versions(
        &self,
        any_id: String,
        limit: Option<u32>,
        cursor: Option<String>,
        include_deleted: bool,
    ) -> Result<FfiVersionPage, CareflowError> {
        let db = self.db.lock()?;
        let store = DischargeStore::with_config(&db, self.config.clone());
        let page = store.list_versions(
            &any_id,
            ListVersions {
                limit: limit.map(|l| l as usize),
                cursor,
                include_deleted,
            },
        )?;
        Ok(FfiVersionPage {
            versions: page
                .versions
                .into_iter()
                .map(FfiDischargeVersion::try_from)
                .collect::<Result<_, _>>()?,
            next_cursor: page.next_cursor,
        })
    }

    /// Get one version by id.
    pub fn get_discharge_version(
        &self,
        any_id: String,
        version_id: String,
        include_deleted: bool,
    ) -> Result<FfiDischargeVersion, CareflowError> {
        let db = self.db.lock()?;
        let store = DischargeStore::with_config(&db, self.config.clone());
        store
            .get_version(&any_id, &version_id, include_deleted)?
            .try_into()
    }

    /// Edit a version's status and/or commit message.
    pub fn patch_discharge_version(
        &self,
        any_id: String,
        version_id: String,
        status: Option<String>,
        commit_message: Option<String>,
    ) -> Result<FfiPatchOutcome, CareflowError> {
        let status = status.as_deref().map(parse_discharge_status).transpose()?;
        let db = self.db.lock()?;
        let store = DischargeStore::with_config(&db, self.config.clone());
        let outcome = store.patch_version(
            &any_id,
            &version_id,
            models::VersionPatch {
                status,
                commit_message,
            },
        )?;
        let (mirror, mirror_reason) = match outcome.mirror {
            MirrorSync::NotCurrent => ("not_current", None),
            MirrorSync::Synced => ("synced", None),
            MirrorSync::Pending { reason } => ("pending", Some(reason)),
        };
        Ok(FfiPatchOutcome {
            version: outcome.version.try_into()?,
            mirror: mirror.to_string(),
            mirror_reason,
        })
    }

    /// Soft-delete a version.
    pub fn soft_delete_discharge_version(
        &self,
        any_id: String,
        version_id: String,
    ) -> Result<FfiDeleteOutcome, CareflowError> {
        let db = self.db.lock()?;
        let store = DischargeStore::with_config(&db, self.config.clone());
        let outcome = store.soft_delete_version(&any_id, &version_id)?;
        let (latest, latest_version_id) = match outcome.latest {
            LatestChange::Unchanged => ("unchanged", None),
            LatestChange::Repointed(id) => ("repointed", Some(id)),
            LatestChange::Removed => ("removed", None),
        };
        Ok(FfiDeleteOutcome {
            version: outcome.version.try_into()?,
            latest: latest.to_string(),
            latest_version_id,
        })
    }

    /// The current discharge version, if any.
    pub fn get_latest_discharge(
        &self,
        any_id: String,
    ) -> Result<Option<FfiDischargeVersion>, CareflowError> {
        let db = self.db.lock()?;
        let store = DischargeStore::with_config(&db, self.config.clone());
        store
            .get_latest(&any_id)?
            .map(FfiDischargeVersion::try_from)
            .transpose()
    }

    // =========================================================================
    // Attachment Operations
    // =========================================================================

    /// All attachment lists of a patient.
    pub fn list_attachments(&self, any_id: String) -> Result<FfiAttachmentSet, CareflowError> {
        let db = self.db.lock()?;
        Ok(AttachmentStore::new(&db).list(&any_id)?.into())
    }

    /// Attach an uploaded object to a category.
    pub fn attach_document(
        &self,
        any_id: String,
        category: String,
        input: FfiNewAttachment,
    ) -> Result<FfiAttachment, CareflowError> {
        let category = parse_category(&category)?;
        let db = self.db.lock()?;
        let attachment = AttachmentStore::new(&db).attach(&any_id, category, input.into())?;
        Ok(attachment.into())
    }

    /// Detach an object from a category.
    pub fn detach_document(
        &self,
        any_id: String,
        category: String,
        object_key: String,
    ) -> Result<(), CareflowError> {
        let category = parse_category(&category)?;
        let db = self.db.lock()?;
        AttachmentStore::new(&db).detach(&any_id, category, &object_key)?;
        Ok(())
    }

    // =========================================================================
    // Note Operations
    // =========================================================================

    /// Write a clinical note.
    pub fn create_note(&self, any_id: String, input: FfiNewNote) -> Result<FfiNote, CareflowError> {
        let input: NewNote = input.try_into()?;
        let db = self.db.lock()?;
        let store = NoteStore::with_config(&db, self.config.clone());
        Ok(store.create_note(&any_id, input)?.into())
    }

    /// List notes newest first.
    pub fn list_notes(
        &self,
        any_id: String,
        limit: Option<u32>,
        cursor: Option<String>,
        include_deleted: bool,
    ) -> Result<FfiNotePage, CareflowError> {
        let db = self.db.lock()?;
        let store = NoteStore::with_config(&db, self.config.clone());
        let page = store.list_notes(
            &any_id,
            ListNotes {
                limit: limit.map(|l| l as usize),
                cursor,
                include_deleted,
            },
        )?;
        Ok(FfiNotePage {
            notes: page.notes.into_iter().map(FfiNote::from).collect(),
            next_cursor: page.next_cursor,
        })
    }

    pub fn get_note(
        &self,
        any_id: String,
        note_id: String,
        include_deleted: bool,
    ) -> Result<FfiNote, CareflowError> {
        let db = self.db.lock()?;
        let store = NoteStore::with_config(&db, self.config.clone());
        Ok(store.get_note(&any_id, &note_id, include_deleted)?.into())
    }

    /// Change a note's category and/or content.
    pub fn patch_note(
        &self,
        any_id: String,
        note_id: String,
        category: Option<String>,
        content: Option<String>,
    ) -> Result<FfiNote, CareflowError> {
        let category = category.as_deref().map(parse_note_category).transpose()?;
        let db = self.db.lock()?;
        let store = NoteStore::with_config(&db, self.config.clone());
        let note = store.patch_note(&any_id, &note_id, NotePatch { category, content })?;
        Ok(note.into())
    }

    /// Soft-delete a note.
    pub fn delete_note(&self, any_id: String, note_id: String) -> Result<FfiNote, CareflowError> {
        let db = self.db.lock()?;
        let store = NoteStore::with_config(&db, self.config.clone());
        Ok(store.soft_delete_note(&any_id, &note_id)?.into())
    }

    pub fn attach_note_file(
        &self,
        any_id: String,
        note_id: String,
        object_key: String,
    ) -> Result<FfiNote, CareflowError> {
        let db = self.db.lock()?;
        let store = NoteStore::with_config(&db, self.config.clone());
        Ok(store.attach_file(&any_id, &note_id, &object_key)?.into())
    }

    pub fn detach_note_file(
        &self,
        any_id: String,
        note_id: String,
        object_key: String,
    ) -> Result<FfiNote, CareflowError> {
        let db = self.db.lock()?;
        let store = NoteStore::with_config(&db, self.config.clone());
        Ok(store.detach_file(&any_id, &note_id, &object_key)?.into())
    }

    // =========================================================================
    // Medication Operations
    // =========================================================================

    /// Record a medication order.
    pub fn create_medication(
        &self,
        any_id: String,
        input: FfiNewMedication,
    ) -> Result<FfiMedication, CareflowError> {
        let input: NewMedication = input.try_into()?;
        let db = self.db.lock()?;
        let store = MedicationStore::with_config(&db, self.config.clone());
        Ok(store.create_medication(&any_id, input)?.into())
    }

    /// List orders oldest first, optionally only running ones.
    pub fn list_medications(
        &self,
        any_id: String,
        active_only: bool,
        limit: Option<u32>,
        cursor: Option<String>,
    ) -> Result<FfiMedicationPage, CareflowError> {
        let db = self.db.lock()?;
        let store = MedicationStore::with_config(&db, self.config.clone());
        let page = store.list_medications(
            &any_id,
            ListMedications {
                limit: limit.map(|l| l as usize),
                cursor,
                active_only,
            },
        )?;
        Ok(FfiMedicationPage {
            medications: page.medications.into_iter().map(FfiMedication::from).collect(),
            next_cursor: page.next_cursor,
        })
    }

    pub fn get_medication(&self, any_id: String, med_id: String) -> Result<FfiMedication, CareflowError> {
        let db = self.db.lock()?;
        let store = MedicationStore::with_config(&db, self.config.clone());
        Ok(store.get_medication(&any_id, &med_id)?.into())
    }

    /// Change any subset of an order's fields.
    pub fn patch_medication(
        &self,
        any_id: String,
        med_id: String,
        patch: FfiMedicationPatch,
    ) -> Result<FfiMedication, CareflowError> {
        let patch: MedicationPatch = patch.try_into()?;
        let db = self.db.lock()?;
        let store = MedicationStore::with_config(&db, self.config.clone());
        Ok(store.patch_medication(&any_id, &med_id, patch)?.into())
    }

    /// Stop an order now.
    pub fn stop_medication(&self, any_id: String, med_id: String) -> Result<FfiMedication, CareflowError> {
        let db = self.db.lock()?;
        let store = MedicationStore::with_config(&db, self.config.clone());
        Ok(store.stop_medication(&any_id, &med_id)?.into())
    }

    pub fn attach_medication_file(
        &self,
        any_id: String,
        med_id: String,
        object_key: String,
    ) -> Result<FfiMedication, CareflowError> {
        let db = self.db.lock()?;
        let store = MedicationStore::with_config(&db, self.config.clone());
        Ok(store.attach_file(&any_id, &med_id, &object_key)?.into())
    }

    pub fn detach_medication_file(
        &self,
        any_id: String,
        med_id: String,
        object_key: String,
    ) -> Result<FfiMedication, CareflowError> {
        let db = self.db.lock()?;
        let store = MedicationStore::with_config(&db, self.config.clone());
        Ok(store.detach_file(&any_id, &med_id, &object_key)?.into())
    }
}

fn parse_episode_status(s: &str) -> Result<EpisodeStatus, CareflowError> {
    EpisodeStatus::parse(s)
        .ok_or_else(|| CareflowError::Validation(format!("unknown patient status: {}", s)))
}

fn parse_discharge_status(s: &str) -> Result<DischargeStatus, CareflowError> {
    DischargeStatus::parse(s)
        .ok_or_else(|| CareflowError::Validation(format!("unknown discharge status: {}", s)))
}

fn parse_category(s: &str) -> Result<AttachmentCategory, CareflowError> {
    AttachmentCategory::parse(s)
        .ok_or_else(|| CareflowError::Validation(format!("unknown document category: {}", s)))
}

fn parse_note_category(s: &str) -> Result<NoteCategory, CareflowError> {
    NoteCategory::parse(s)
        .ok_or_else(|| CareflowError::Validation(format!("unknown note category: {}", s)))
}

fn parse_med_priority(s: &str) -> Result<MedPriority, CareflowError> {
    MedPriority::parse(s)
        .ok_or_else(|| CareflowError::Validation(format!("unknown priority: {}", s)))
}

fn to_hash(map: BTreeMap<String, String>) -> HashMap<String, String> {
    map.into_iter().collect()
}

fn to_btree(map: HashMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter().collect()
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe postal address.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

impl From<Address> for FfiAddress {
    fn from(a: Address) -> Self {
        Self {
            line1: a.line1,
            line2: a.line2,
            city: a.city,
            state: a.state,
            postal_code: a.postal_code,
            country: a.country,
        }
    }
}

impl From<FfiAddress> for Address {
    fn from(a: FfiAddress) -> Self {
        Address {
            line1: a.line1,
            line2: a.line2,
            city: a.city,
            state: a.state,
            postal_code: a.postal_code,
            country: a.country,
        }
    }
}

/// FFI-safe emergency contact.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiEmergencyContact {
    pub name: String,
    pub relationship: Option<String>,
    pub phone: Option<String>,
    pub alternate_phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<FfiAddress>,
}

impl From<EmergencyContact> for FfiEmergencyContact {
    fn from(c: EmergencyContact) -> Self {
        Self {
            name: c.name,
            relationship: c.relationship,
            phone: c.phone,
            alternate_phone: c.alternate_phone,
            email: c.email,
            address: c.address.map(|a| a.into()),
        }
    }
}

impl From<FfiEmergencyContact> for EmergencyContact {
    fn from(c: FfiEmergencyContact) -> Self {
        EmergencyContact {
            name: c.name,
            relationship: c.relationship,
            phone: c.phone,
            alternate_phone: c.alternate_phone,
            email: c.email,
            address: c.address.map(|a| a.into()),
        }
    }
}

/// FFI-safe registration history entry.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRegistrationEntry {
    pub number: String,
    pub scheme: String,
    pub date: String,
}

impl From<RegistrationEntry> for FfiRegistrationEntry {
    fn from(e: RegistrationEntry) -> Self {
        Self {
            number: e.number,
            scheme: e.scheme,
            date: e.date,
        }
    }
}

/// FFI-safe history entry input; scheme and date may be omitted.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiHistoryEntry {
    pub number: String,
    pub scheme: Option<String>,
    pub date: Option<String>,
}

impl From<FfiHistoryEntry> for HistoryEntryInput {
    fn from(e: FfiHistoryEntry) -> Self {
        HistoryEntryInput {
            number: e.number,
            scheme: e.scheme,
            date: e.date,
        }
    }
}

/// FFI-safe new patient input.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNewPatient {
    pub name: String,
    pub registration_number: String,
    pub scheme: String,
    pub department: String,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub emergency_contact: Option<FfiEmergencyContact>,
    pub pathway: Option<String>,
    pub diagnosis: Option<String>,
    pub comorbidities: Vec<String>,
    pub assigned_clinician: Option<String>,
    pub assigned_clinician_id: Option<String>,
    pub is_urgent: bool,
    pub urgent_reason: Option<String>,
    pub urgent_until: Option<String>,
    pub first_stage: Option<String>,
    pub actor_id: Option<String>,
}

impl From<FfiNewPatient> for NewPatient {
    fn from(p: FfiNewPatient) -> Self {
        NewPatient {
            name: p.name,
            registration_number: p.registration_number,
            scheme: p.scheme,
            department: p.department,
            age: p.age,
            sex: p.sex,
            emergency_contact: p.emergency_contact.map(|c| c.into()),
            pathway: p.pathway,
            diagnosis: p.diagnosis,
            comorbidities: p.comorbidities,
            assigned_clinician: p.assigned_clinician,
            assigned_clinician_id: p.assigned_clinician_id,
            is_urgent: p.is_urgent,
            urgent_reason: p.urgent_reason,
            urgent_until: p.urgent_until,
            first_stage: p.first_stage,
            actor_id: p.actor_id,
        }
    }
}

/// FFI-safe episode record.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiEpisode {
    pub patient_id: String,
    pub name: String,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub emergency_contact: Option<FfiEmergencyContact>,
    pub department: String,
    pub status: String,
    pub pathway: Option<String>,
    pub diagnosis: Option<String>,
    pub comorbidities: Vec<String>,
    pub assigned_clinician: Option<String>,
    pub assigned_clinician_id: Option<String>,
    pub is_urgent: bool,
    pub urgent_reason: Option<String>,
    pub urgent_until: Option<String>,
    pub current_stage: String,
    pub open_segment_ref: Option<String>,
    pub stage_first_seen_at: HashMap<String, String>,
    pub active_registration_number: String,
    pub active_scheme: String,
    pub registration_history: Vec<FfiRegistrationEntry>,
    pub update_counter: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<EpisodeRecord> for FfiEpisode {
    fn from(e: EpisodeRecord) -> Self {
        Self {
            patient_id: e.patient_id,
            name: e.name,
            age: e.age,
            sex: e.sex,
            emergency_contact: e.emergency_contact.map(|c| c.into()),
            department: e.department,
            status: e.status.as_str().to_string(),
            pathway: e.pathway,
            diagnosis: e.diagnosis,
            comorbidities: e.comorbidities,
            assigned_clinician: e.assigned_clinician,
            assigned_clinician_id: e.assigned_clinician_id,
            is_urgent: e.is_urgent,
            urgent_reason: e.urgent_reason,
            urgent_until: e.urgent_until,
            current_stage: e.current_stage,
            open_segment_ref: e.open_segment_ref,
            stage_first_seen_at: to_hash(e.stage_first_seen_at),
            active_registration_number: e.active_registration_number,
            active_scheme: e.active_scheme,
            registration_history: e
                .registration_history
                .into_iter()
                .map(|r| r.into())
                .collect(),
            update_counter: e.update_counter,
            created_at: e.created_at,
            updated_at: e.updated_at,
        }
    }
}

/// FFI-safe page of episodes.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiEpisodePage {
    pub episodes: Vec<FfiEpisode>,
    pub next_cursor: Option<String>,
}

/// FFI-safe partial episode update.
#[derive(Debug, Clone, Default, uniffi::Record)]
pub struct FfiEpisodeUpdate {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub emergency_contact: Option<FfiEmergencyContact>,
    pub department: Option<String>,
    pub status: Option<String>,
    pub pathway: Option<String>,
    pub diagnosis: Option<String>,
    pub comorbidities: Option<Vec<String>>,
    pub assigned_clinician: Option<String>,
    pub assigned_clinician_id: Option<String>,
    pub is_urgent: Option<bool>,
    pub urgent_reason: Option<String>,
    pub urgent_until: Option<String>,
}

impl TryFrom<FfiEpisodeUpdate> for EpisodeUpdate {
    type Error = CareflowError;

    fn try_from(u: FfiEpisodeUpdate) -> Result<Self, Self::Error> {
        Ok(EpisodeUpdate {
            name: u.name,
            age: u.age,
            sex: u.sex,
            emergency_contact: u.emergency_contact.map(|c| c.into()),
            department: u.department,
            status: u.status.as_deref().map(parse_episode_status).transpose()?,
            pathway: u.pathway,
            diagnosis: u.diagnosis,
            comorbidities: u.comorbidities,
            assigned_clinician: u.assigned_clinician,
            assigned_clinician_id: u.assigned_clinician_id,
            is_urgent: u.is_urgent,
            urgent_reason: u.urgent_reason,
            urgent_until: u.urgent_until,
        })
    }
}

/// FFI-safe stage transition request.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiTransition {
    pub to_stage: String,
    pub completed_on_entry: Vec<String>,
    pub completed_on_exit: Vec<String>,
    pub actor_id: Option<String>,
    pub note: Option<String>,
}

impl From<FfiTransition> for TransitionRequest {
    fn from(t: FfiTransition) -> Self {
        TransitionRequest {
            to_stage: t.to_stage,
            completed_on_entry: t.completed_on_entry,
            completed_on_exit: t.completed_on_exit,
            actor_id: t.actor_id,
            note: t.note,
        }
    }
}

/// FFI-safe timeline segment.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiTimelineSegment {
    pub segment_id: String,
    pub patient_id: String,
    pub stage: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub registration_number: String,
    pub scheme: String,
    pub required_on_entry: Vec<String>,
    pub required_on_exit: Vec<String>,
    pub completed_on_entry: Vec<String>,
    pub completed_on_exit: Vec<String>,
    pub note: Option<String>,
    pub actor_id: Option<String>,
}

impl From<TimelineSegment> for FfiTimelineSegment {
    fn from(s: TimelineSegment) -> Self {
        Self {
            segment_id: s.segment_id,
            patient_id: s.patient_id,
            stage: s.stage,
            opened_at: s.opened_at,
            closed_at: s.closed_at,
            registration_number: s.registration_number,
            scheme: s.scheme,
            required_on_entry: s.required_on_entry,
            required_on_exit: s.required_on_exit,
            completed_on_entry: s.completed_on_entry,
            completed_on_exit: s.completed_on_exit,
            note: s.note,
            actor_id: s.actor_id,
        }
    }
}

/// FFI-safe page of timeline segments.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiTimelinePage {
    pub segments: Vec<FfiTimelineSegment>,
    pub next_cursor: Option<String>,
}

/// FFI-safe registration switch request.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRegistrationSwitch {
    pub number: String,
    pub scheme: String,
    pub updates: Option<FfiEpisodeUpdate>,
    pub first_stage: Option<String>,
    pub actor_id: Option<String>,
    pub note: Option<String>,
}

impl TryFrom<FfiRegistrationSwitch> for RegistrationSwitch {
    type Error = CareflowError;

    fn try_from(s: FfiRegistrationSwitch) -> Result<Self, Self::Error> {
        Ok(RegistrationSwitch {
            number: s.number,
            scheme: s.scheme,
            updates: s.updates.unwrap_or_default().try_into()?,
            first_stage: s.first_stage,
            actor_id: s.actor_id,
            note: s.note,
        })
    }
}

/// FFI-safe MRN pointer.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiMrnPointer {
    pub registration_number: String,
    pub scheme: String,
    pub patient_id: String,
    pub department: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<MrnPointer> for FfiMrnPointer {
    fn from(p: MrnPointer) -> Self {
        Self {
            registration_number: p.registration_number,
            scheme: p.scheme,
            patient_id: p.patient_id,
            department: p.department,
            status: p.status.as_str().to_string(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// FFI-safe checklist entry.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiChecklistEntry {
    pub from_stage: String,
    pub to_stage: String,
    pub required_on_entry: Vec<String>,
    pub required_on_exit: Vec<String>,
}

impl From<ChecklistEntry> for FfiChecklistEntry {
    fn from(e: ChecklistEntry) -> Self {
        Self {
            from_stage: e.from_stage,
            to_stage: e.to_stage,
            required_on_entry: e.required_on_entry,
            required_on_exit: e.required_on_exit,
        }
    }
}

impl From<FfiChecklistEntry> for ChecklistEntry {
    fn from(e: FfiChecklistEntry) -> Self {
        ChecklistEntry {
            from_stage: e.from_stage,
            to_stage: e.to_stage,
            required_on_entry: e.required_on_entry,
            required_on_exit: e.required_on_exit,
        }
    }
}

/// FFI-safe discharge draft. Sections travel as a JSON object of
/// `name -> text | {field: text}`.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiDischargeDraft {
    pub text: String,
    pub sections_json: Option<String>,
    pub summary: Option<HashMap<String, String>>,
    pub status: Option<String>,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub commit_message: Option<String>,
}

impl TryFrom<FfiDischargeDraft> for DischargeDraft {
    type Error = CareflowError;

    fn try_from(d: FfiDischargeDraft) -> Result<Self, Self::Error> {
        let sections: BTreeMap<String, SectionValue> = match d.sections_json.as_deref().map(str::trim) {
            None | Some("") => BTreeMap::new(),
            Some(json) => serde_json::from_str(json)?,
        };
        Ok(DischargeDraft {
            content: DischargeContent {
                text: d.text,
                sections,
                summary: d.summary.map(to_btree),
            },
            status: d
                .status
                .as_deref()
                .map(parse_discharge_status)
                .transpose()?
                .unwrap_or_default(),
            author_id: d.author_id,
            author_name: d.author_name,
            commit_message: d.commit_message,
        })
    }
}

/// FFI-safe discharge version.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiDischargeVersion {
    pub version_id: String,
    pub patient_id: String,
    pub status: String,
    pub text: String,
    pub sections_json: String,
    pub summary: Option<HashMap<String, String>>,
    pub registration_number: String,
    pub scheme: String,
    pub author_id: String,
    pub author_name: Option<String>,
    pub commit_message: Option<String>,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<DischargeVersion> for FfiDischargeVersion {
    type Error = CareflowError;

    fn try_from(v: DischargeVersion) -> Result<Self, Self::Error> {
        Ok(Self {
            sections_json: serde_json::to_string(&v.content.sections)?,
            version_id: v.version_id,
            patient_id: v.patient_id,
            status: v.status.as_str().to_string(),
            text: v.content.text,
            summary: v.content.summary.map(to_hash),
            registration_number: v.registration_number,
            scheme: v.scheme,
            author_id: v.author_id,
            author_name: v.author_name,
            commit_message: v.commit_message,
            deleted: v.deleted,
            created_at: v.created_at,
            updated_at: v.updated_at,
        })
    }
}

/// FFI-safe page of discharge versions.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiVersionPage {
    pub versions: Vec<FfiDischargeVersion>,
    pub next_cursor: Option<String>,
}

/// FFI-safe patch result. `mirror` is `not_current`, `synced` or `pending`.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatchOutcome {
    pub version: FfiDischargeVersion,
    pub mirror: String,
    pub mirror_reason: Option<String>,
}

/// FFI-safe delete result. `latest` is `unchanged`, `repointed` or `removed`.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiDeleteOutcome {
    pub version: FfiDischargeVersion,
    pub latest: String,
    pub latest_version_id: Option<String>,
}

/// FFI-safe attachment.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAttachment {
    pub key: String,
    pub uploaded_at: String,
    pub uploaded_by: Option<String>,
    pub caption: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub registration_number: Option<String>,
    pub scheme: Option<String>,
}

impl From<Attachment> for FfiAttachment {
    fn from(a: Attachment) -> Self {
        Self {
            key: a.key,
            uploaded_at: a.uploaded_at,
            uploaded_by: a.uploaded_by,
            caption: a.caption,
            mime_type: a.mime_type,
            size: a.size,
            registration_number: a.registration_number,
            scheme: a.scheme,
        }
    }
}

/// FFI-safe attachment input.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNewAttachment {
    pub key: String,
    pub uploaded_by: Option<String>,
    pub caption: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

impl From<FfiNewAttachment> for NewAttachment {
    fn from(a: FfiNewAttachment) -> Self {
        NewAttachment {
            key: a.key,
            uploaded_by: a.uploaded_by,
            caption: a.caption,
            mime_type: a.mime_type,
            size: a.size,
        }
    }
}

/// FFI-safe attachment lists keyed by category name.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAttachmentSet {
    pub lists: HashMap<String, Vec<FfiAttachment>>,
    pub revision: Option<i64>,
}

impl From<AttachmentSet> for FfiAttachmentSet {
    fn from(set: AttachmentSet) -> Self {
        Self {
            lists: set
                .lists
                .into_iter()
                .map(|(category, list)| {
                    (
                        category.field().to_string(),
                        list.into_iter().map(|a| a.into()).collect(),
                    )
                })
                .collect(),
            revision: set.revision,
        }
    }
}

/// FFI-safe note input.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNewNote {
    pub author_id: String,
    pub category: String,
    pub content: String,
    pub files: Vec<String>,
}

impl TryFrom<FfiNewNote> for NewNote {
    type Error = CareflowError;

    fn try_from(n: FfiNewNote) -> Result<Self, Self::Error> {
        Ok(NewNote {
            author_id: n.author_id,
            category: parse_note_category(&n.category)?,
            content: n.content,
            files: n.files,
        })
    }
}

/// FFI-safe clinical note.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNote {
    pub note_id: String,
    pub patient_id: String,
    pub author_id: String,
    pub category: String,
    pub content: String,
    pub files: Vec<String>,
    pub registration_number: Option<String>,
    pub scheme: Option<String>,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Note> for FfiNote {
    fn from(n: Note) -> Self {
        Self {
            note_id: n.note_id,
            patient_id: n.patient_id,
            author_id: n.author_id,
            category: n.category.as_str().to_string(),
            content: n.content,
            files: n.files,
            registration_number: n.registration_number,
            scheme: n.scheme,
            deleted: n.deleted,
            created_at: n.created_at,
            updated_at: n.updated_at,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNotePage {
    pub notes: Vec<FfiNote>,
    pub next_cursor: Option<String>,
}

/// FFI-safe medication order input.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNewMedication {
    pub name: String,
    pub dose: String,
    pub route: String,
    pub freq: String,
    pub start: String,
    pub end: Option<String>,
    pub priority: Option<String>,
    pub schedule_times: Vec<String>,
    pub files: Vec<String>,
}

impl TryFrom<FfiNewMedication> for NewMedication {
    type Error = CareflowError;

    fn try_from(m: FfiNewMedication) -> Result<Self, Self::Error> {
        Ok(NewMedication {
            name: m.name,
            dose: m.dose,
            route: m.route,
            freq: m.freq,
            start: m.start,
            end: m.end,
            priority: m
                .priority
                .as_deref()
                .map(parse_med_priority)
                .transpose()?
                .unwrap_or_default(),
            schedule_times: m.schedule_times,
            files: m.files,
        })
    }
}

/// FFI-safe medication order.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiMedication {
    pub med_id: String,
    pub patient_id: String,
    pub name: String,
    pub dose: String,
    pub route: String,
    pub freq: String,
    pub start: String,
    pub end: Option<String>,
    pub priority: String,
    pub schedule_times: Vec<String>,
    pub files: Vec<String>,
    pub registration_number: Option<String>,
    pub scheme: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Medication> for FfiMedication {
    fn from(m: Medication) -> Self {
        Self {
            med_id: m.med_id,
            patient_id: m.patient_id,
            name: m.name,
            dose: m.dose,
            route: m.route,
            freq: m.freq,
            start: m.start,
            end: m.end,
            priority: m.priority.as_str().to_string(),
            schedule_times: m.schedule_times,
            files: m.files,
            registration_number: m.registration_number,
            scheme: m.scheme,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiMedicationPage {
    pub medications: Vec<FfiMedication>,
    pub next_cursor: Option<String>,
}

/// FFI-safe partial medication edit.
#[derive(Debug, Clone, Default, uniffi::Record)]
pub struct FfiMedicationPatch {
    pub name: Option<String>,
    pub dose: Option<String>,
    pub route: Option<String>,
    pub freq: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub clear_end: bool,
    pub priority: Option<String>,
    pub schedule_times: Option<Vec<String>>,
}

impl TryFrom<FfiMedicationPatch> for MedicationPatch {
    type Error = CareflowError;

    fn try_from(p: FfiMedicationPatch) -> Result<Self, Self::Error> {
        Ok(MedicationPatch {
            name: p.name,
            dose: p.dose,
            route: p.route,
            freq: p.freq,
            start: p.start,
            end: p.end,
            clear_end: p.clear_end,
            priority: p.priority.as_deref().map(parse_med_priority).transpose()?,
            schedule_times: p.schedule_times,
        })
    }
}
