//! Episode records and the stage timeline.
//!
//! The episode record is the canonical projection of a patient: demographics,
//! episode fields, the current stage, a reference to the open timeline segment
//! and the active registration. Every write that touches more than the episode
//! itself goes through a single `transact_write`.

mod segments;
mod transition;

pub(crate) use segments::*;
pub use transition::*;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::db::{Condition, Database, DbError, Item, Mutation, Query, SortOrder, WriteOp};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::{IdentityResolver, Resolution};
use crate::models::keys::{
    is_valid_stage, now_timestamp, patient_pk, pointer_key, profile_key, TIMELINE_PREFIX,
};
use crate::models::{
    cohort_key, EpisodeRecord, EpisodeStatus, EpisodeUpdate, MrnPointer, NewPatient,
    TimelineSegment,
};

/// One page of episodes from a cohort listing.
#[derive(Debug, Clone, Default)]
pub struct EpisodePage {
    pub episodes: Vec<EpisodeRecord>,
    pub next_cursor: Option<String>,
}

/// One page of timeline segments.
#[derive(Debug, Clone, Default)]
pub struct TimelinePage {
    pub segments: Vec<TimelineSegment>,
    pub next_cursor: Option<String>,
}

/// Episode record operations and stage transitions.
pub struct EpisodeService<'a> {
    db: &'a Database,
    config: CoreConfig,
}

impl<'a> EpisodeService<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_config(db, CoreConfig::default())
    }

    pub fn with_config(db: &'a Database, config: CoreConfig) -> Self {
        Self { db, config }
    }

    fn resolver(&self) -> IdentityResolver<'a> {
        IdentityResolver::new(self.db)
    }

    /// Register a new patient.
    ///
    /// Writes the episode, its first timeline segment and the MRN pointer in
    /// one transaction. A registration number that already has a pointer
    /// fails the whole write with `Conflict`.
    pub fn create_patient(&self, input: NewPatient) -> LedgerResult<EpisodeRecord> {
        let missing = input.missing_fields();
        if !missing.is_empty() {
            return Err(LedgerError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        let first_stage = input
            .first_stage
            .clone()
            .unwrap_or_else(|| self.config.default_first_stage().to_string());
        if !is_valid_stage(&first_stage) {
            return Err(LedgerError::Validation(format!("invalid stage name: {:?}", first_stage)));
        }

        let mut record = EpisodeRecord::from_new(&input, &first_stage);
        let mut segment = TimelineSegment::open(
            &record.patient_id,
            &first_stage,
            &record.active_registration_number,
            &record.active_scheme,
            &record.created_at,
        );
        segment.actor_id = input.actor_id.clone();
        record.open_segment_ref = Some(segment.sort_key());

        let pointer = MrnPointer {
            registration_number: record.active_registration_number.clone(),
            scheme: record.active_scheme.clone(),
            patient_id: record.patient_id.clone(),
            department: record.department.clone(),
            status: record.status,
            created_at: record.created_at.clone(),
            updated_at: record.created_at.clone(),
        };

        let result = self.db.transact_write(vec![
            WriteOp::Put {
                item: Item::from_record(profile_key(&record.patient_id), &record)?,
                condition: Some(Condition::NotExists),
            },
            open_segment_op(&segment)?,
            WriteOp::Put {
                item: Item::from_record(pointer_key(&pointer.registration_number), &pointer)?,
                condition: Some(Condition::NotExists),
            },
        ]);
        match result {
            Ok(()) => {}
            Err(DbError::ConditionFailed { index: 2, .. }) => {
                warn!(registration_number = %pointer.registration_number, "registration number already in use");
                return Err(LedgerError::Conflict(format!(
                    "registration number {} is already registered",
                    pointer.registration_number
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            patient_id = %record.patient_id,
            registration_number = %record.active_registration_number,
            stage = %first_stage,
            "patient created"
        );
        Ok(record)
    }

    /// Resolve any identifier to its episode.
    pub fn get(&self, any_id: &str) -> LedgerResult<EpisodeRecord> {
        self.resolver().resolve_existing(any_id)
    }

    /// Resolve any identifier without requiring the episode to exist.
    pub fn resolve(&self, any_id: &str) -> LedgerResult<Resolution> {
        self.resolver().resolve(any_id)
    }

    /// List episodes of one department with one status.
    pub fn list_by_cohort(
        &self,
        department: &str,
        status: EpisodeStatus,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> LedgerResult<EpisodePage> {
        let department = department.trim();
        if department.is_empty() {
            return Err(LedgerError::Validation("department is required".into()));
        }
        let page = self.db.query_cohort(
            &cohort_key(department, status),
            self.config.clamp_page(limit),
            cursor.as_deref(),
        )?;
        let episodes = page
            .items
            .iter()
            .map(|item| item.to_record())
            .collect::<Result<Vec<EpisodeRecord>, _>>()?;
        debug!(department, status = status.as_str(), count = episodes.len(), "cohort listed");
        Ok(EpisodePage {
            episodes,
            next_cursor: page.next_cursor,
        })
    }

    /// Update demographic and episode fields.
    ///
    /// The cohort key is recomputed and the active MRN pointer's denormalized
    /// department/status is rewritten in the same transaction.
    pub fn update(&self, any_id: &str, update: EpisodeUpdate) -> LedgerResult<EpisodeRecord> {
        if update.is_empty() {
            return Err(LedgerError::Validation("nothing to update".into()));
        }
        validate_update(&update)?;

        let episode = self.get(any_id)?;
        let now = now_timestamp();
        let ops = update_ops(self.db, &episode, &update, &now)?;
        self.db.transact_write(ops)?;

        info!(patient_id = %episode.patient_id, "episode updated");
        self.reload(&episode.patient_id)
    }

    /// Soft-deactivate an episode. Records are never deleted.
    pub fn deactivate(&self, any_id: &str) -> LedgerResult<EpisodeRecord> {
        let episode = self.get(any_id)?;
        if episode.status == EpisodeStatus::Inactive {
            debug!(patient_id = %episode.patient_id, "already inactive");
            return Ok(episode);
        }
        self.update(
            &episode.patient_id,
            EpisodeUpdate {
                status: Some(EpisodeStatus::Inactive),
                ..Default::default()
            },
        )
    }

    /// Timeline segments in key order (chronological when ascending).
    pub fn timeline(
        &self,
        any_id: &str,
        order: SortOrder,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> LedgerResult<TimelinePage> {
        let episode = self.get(any_id)?;
        let mut query = Query::new(patient_pk(&episode.patient_id), TIMELINE_PREFIX)
            .limit(self.config.clamp_page(limit))
            .after(cursor);
        if order == SortOrder::Descending {
            query = query.descending();
        }
        let page = self.db.query_items(&query)?;
        let segments = page
            .items
            .iter()
            .map(|item| item.to_record())
            .collect::<Result<Vec<TimelineSegment>, _>>()?;
        Ok(TimelinePage {
            segments,
            next_cursor: page.next_cursor,
        })
    }

    /// The currently open segment, verified against the episode.
    pub fn open_segment(&self, any_id: &str) -> LedgerResult<Option<TimelineSegment>> {
        let episode = self.get(any_id)?;
        verified_open_segment(self.db, &episode)
    }

    pub(crate) fn reload(&self, patient_id: &str) -> LedgerResult<EpisodeRecord> {
        load_episode(self.db, patient_id)
    }
}

pub(crate) fn load_episode(db: &Database, patient_id: &str) -> LedgerResult<EpisodeRecord> {
    match db.get_item(&profile_key(patient_id))? {
        Some(item) => Ok(item.to_record()?),
        None => Err(LedgerError::NotFound(format!("patient {}", patient_id))),
    }
}

pub(crate) fn validate_update(update: &EpisodeUpdate) -> LedgerResult<()> {
    if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(LedgerError::Validation("name cannot be empty".into()));
    }
    if update.department.as_deref().is_some_and(|d| d.trim().is_empty()) {
        return Err(LedgerError::Validation("department cannot be empty".into()));
    }
    Ok(())
}

/// Mutations writing every field present in `update`, taken from the merged record.
pub(crate) fn field_mutations(
    update: &EpisodeUpdate,
    merged: &EpisodeRecord,
) -> LedgerResult<Vec<Mutation>> {
    let mut mutations = Vec::new();
    if update.name.is_some() {
        mutations.push(Mutation::set("name", merged.name.as_str()));
    }
    if update.age.is_some() {
        mutations.push(Mutation::set_json("age", &merged.age)?);
    }
    if update.sex.is_some() {
        mutations.push(Mutation::set_json("sex", &merged.sex)?);
    }
    if update.emergency_contact.is_some() {
        mutations.push(Mutation::set_json("emergency_contact", &merged.emergency_contact)?);
    }
    if update.department.is_some() {
        mutations.push(Mutation::set("department", merged.department.as_str()));
    }
    if update.status.is_some() {
        mutations.push(Mutation::set_json("status", &merged.status)?);
    }
    if update.pathway.is_some() {
        mutations.push(Mutation::set_json("pathway", &merged.pathway)?);
    }
    if update.diagnosis.is_some() {
        mutations.push(Mutation::set_json("diagnosis", &merged.diagnosis)?);
    }
    if update.comorbidities.is_some() {
        mutations.push(Mutation::set_json("comorbidities", &merged.comorbidities)?);
    }
    if update.assigned_clinician.is_some() {
        mutations.push(Mutation::set_json("assigned_clinician", &merged.assigned_clinician)?);
    }
    if update.assigned_clinician_id.is_some() {
        mutations.push(Mutation::set_json("assigned_clinician_id", &merged.assigned_clinician_id)?);
    }
    if update.is_urgent.is_some() {
        mutations.push(Mutation::set("is_urgent", merged.is_urgent));
    }
    if update.urgent_reason.is_some() {
        mutations.push(Mutation::set_json("urgent_reason", &merged.urgent_reason)?);
    }
    if update.urgent_until.is_some() {
        mutations.push(Mutation::set_json("urgent_until", &merged.urgent_until)?);
    }
    mutations.push(Mutation::set("cohort_key", merged.cohort_key.as_str()));
    Ok(mutations)
}

/// Condition that the cohort inputs are as read, so the derived key stays consistent.
pub(crate) fn cohort_unchanged(episode: &EpisodeRecord) -> LedgerResult<Condition> {
    Ok(Condition::All(vec![
        Condition::Exists,
        Condition::equals("department", episode.department.as_str()),
        Condition::Equals {
            attr: "status".into(),
            value: serde_json::to_value(episode.status).map_err(DbError::from)?,
        },
    ]))
}

/// Pointer mirror op for the active registration, if the pointer is ours.
pub(crate) fn pointer_mirror_op(
    db: &Database,
    episode: &EpisodeRecord,
    merged: &EpisodeRecord,
    now: &str,
) -> LedgerResult<Option<WriteOp>> {
    let key = pointer_key(&episode.active_registration_number);
    let Some(item) = db.get_item(&key)? else {
        warn!(
            patient_id = %episode.patient_id,
            registration_number = %episode.active_registration_number,
            "active registration has no pointer"
        );
        return Ok(None);
    };
    if item.get_str("patient_id") != Some(episode.patient_id.as_str()) {
        warn!(
            patient_id = %episode.patient_id,
            registration_number = %episode.active_registration_number,
            "active registration pointer is owned by another patient"
        );
        return Ok(None);
    }
    Ok(Some(WriteOp::Update {
        key,
        mutations: vec![
            Mutation::set("department", merged.department.as_str()),
            Mutation::set_json("status", &merged.status)?,
            Mutation::set("updated_at", Value::from(now)),
        ],
        condition: Some(Condition::equals("patient_id", episode.patient_id.as_str())),
    }))
}

/// Episode field update plus pointer mirror, as one batch.
pub(crate) fn update_ops(
    db: &Database,
    episode: &EpisodeRecord,
    update: &EpisodeUpdate,
    now: &str,
) -> LedgerResult<Vec<WriteOp>> {
    let mut merged = episode.clone();
    update.apply_to(&mut merged);

    let mut mutations = field_mutations(update, &merged)?;
    mutations.push(Mutation::set("updated_at", now));

    let mut ops = vec![WriteOp::Update {
        key: profile_key(&episode.patient_id),
        mutations,
        condition: Some(cohort_unchanged(episode)?),
    }];
    if let Some(op) = pointer_mirror_op(db, episode, &merged, now)? {
        ops.push(op);
    }
    Ok(ops)
}
