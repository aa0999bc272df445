//! MRN registry: registration switches and registration history.
//!
//! A pointer record maps each registration number to exactly one patient.
//! Once set, the owner may only be rewritten to the same patient. A switch
//! closes the open segment, opens a fresh one stamped with the new
//! registration, upserts the pointer and rewrites the episode, all in one
//! transaction. It is not checklist-gated: it is an administrative event, not
//! a clinical stage change.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::db::{Condition, Database, Item, Mutation, WriteOp};
use crate::episode::{
    close_segment_op, cohort_unchanged, enter_segment_mutations, episode_unchanged, field_mutations,
    load_episode, open_segment_op, update_ops, validate_update, verified_open_segment,
};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::IdentityResolver;
use crate::models::keys::{is_valid_stage, now_timestamp, parse_instant, pointer_key, profile_key};
use crate::models::{EpisodeRecord, EpisodeUpdate, MrnPointer, RegistrationEntry, TimelineSegment};

/// A request to make another registration number active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RegistrationSwitch {
    pub number: String,
    /// Issuing scheme; blank falls back to the configured default
    pub scheme: String,
    /// Episode fields to change alongside the switch
    pub updates: EpisodeUpdate,
    /// Stage for the fresh segment (default: the current stage)
    pub first_stage: Option<String>,
    pub actor_id: Option<String>,
    pub note: Option<String>,
}

impl RegistrationSwitch {
    pub fn new(number: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            scheme: scheme.into(),
            ..Default::default()
        }
    }
}

/// A caller-supplied history entry before cleaning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HistoryEntryInput {
    pub number: String,
    pub scheme: Option<String>,
    pub date: Option<String>,
}

impl HistoryEntryInput {
    pub fn new(number: impl Into<String>, scheme: Option<&str>, date: Option<&str>) -> Self {
        Self {
            number: number.into(),
            scheme: scheme.map(str::to_string),
            date: date.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
enum HistoryChange {
    Append,
    Replace(Vec<RegistrationEntry>),
}

/// Registration pointers and the registration history of episodes.
pub struct MrnRegistry<'a> {
    db: &'a Database,
    config: CoreConfig,
}

impl<'a> MrnRegistry<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_config(db, CoreConfig::default())
    }

    pub fn with_config(db: &'a Database, config: CoreConfig) -> Self {
        Self { db, config }
    }

    /// Look up the pointer for a registration number.
    pub fn pointer(&self, number: &str) -> LedgerResult<MrnPointer> {
        let number = number.trim();
        match self.db.get_item(&pointer_key(number))? {
            Some(item) => Ok(item.to_record()?),
            None => Err(LedgerError::NotFound(format!("registration number {}", number))),
        }
    }

    /// Make `switch.number` the patient's active registration.
    ///
    /// Switching to the already-active `(number, scheme)` opens no segment and
    /// appends no history; episode field updates are still applied.
    pub fn switch_registration(
        &self,
        any_id: &str,
        switch: RegistrationSwitch,
    ) -> LedgerResult<EpisodeRecord> {
        let episode = IdentityResolver::new(self.db).resolve_existing(any_id)?;
        self.switch_inner(episode, switch, HistoryChange::Append)
    }

    /// Replace the whole registration history.
    ///
    /// The entry with the latest date becomes the desired active registration.
    /// If it is already active only the history is rewritten; otherwise the
    /// replacement goes through the full switch.
    pub fn overwrite_history(
        &self,
        any_id: &str,
        entries: Vec<HistoryEntryInput>,
        actor_id: Option<String>,
    ) -> LedgerResult<EpisodeRecord> {
        let episode = IdentityResolver::new(self.db).resolve_existing(any_id)?;
        let cleaned = self.clean_history(&episode, &entries)?;
        let Some(latest) = latest_by_date(&cleaned).cloned() else {
            return Err(LedgerError::Validation(
                "registration history needs at least one entry".into(),
            ));
        };

        if latest.number == episode.active_registration_number && latest.scheme == episode.active_scheme {
            debug!(patient_id = %episode.patient_id, "active registration unchanged; rewriting history only");
            return self.rewrite_history(&episode, cleaned);
        }

        let switch = RegistrationSwitch {
            number: latest.number,
            scheme: latest.scheme,
            actor_id,
            ..Default::default()
        };
        self.switch_inner(episode, switch, HistoryChange::Replace(cleaned))
    }

    /// Prune or edit past entries without touching the active registration.
    pub fn edit_history(
        &self,
        any_id: &str,
        entries: Vec<HistoryEntryInput>,
    ) -> LedgerResult<EpisodeRecord> {
        let episode = IdentityResolver::new(self.db).resolve_existing(any_id)?;
        let cleaned = self.clean_history(&episode, &entries)?;
        if !cleaned
            .iter()
            .any(|e| e.number == episode.active_registration_number)
        {
            return Err(LedgerError::Validation(format!(
                "history must keep the active registration {}",
                episode.active_registration_number
            )));
        }
        self.rewrite_history(&episode, cleaned)
    }

    fn rewrite_history(
        &self,
        episode: &EpisodeRecord,
        history: Vec<RegistrationEntry>,
    ) -> LedgerResult<EpisodeRecord> {
        let now = now_timestamp();
        self.db.update_item(
            &profile_key(&episode.patient_id),
            &[
                Mutation::set_json("registration_history", &history)?,
                Mutation::set("updated_at", now.as_str()),
            ],
            Some(Condition::All(vec![
                Condition::Exists,
                Condition::equals(
                    "active_registration_number",
                    episode.active_registration_number.as_str(),
                ),
            ])),
        )?;
        info!(patient_id = %episode.patient_id, entries = history.len(), "registration history rewritten");
        load_episode(self.db, &episode.patient_id)
    }

    fn switch_inner(
        &self,
        episode: EpisodeRecord,
        switch: RegistrationSwitch,
        history: HistoryChange,
    ) -> LedgerResult<EpisodeRecord> {
        let number = switch.number.trim().to_string();
        if number.is_empty() {
            return Err(LedgerError::Validation("registration number is required".into()));
        }
        let scheme = match switch.scheme.trim() {
            "" => self.config.default_scheme().to_string(),
            s => s.to_string(),
        };
        let first_stage = switch
            .first_stage
            .as_deref()
            .map(str::trim)
            .unwrap_or(episode.current_stage.as_str())
            .to_string();
        if !is_valid_stage(&first_stage) {
            return Err(LedgerError::Validation(format!("invalid stage name: {:?}", first_stage)));
        }
        let has_updates = !switch.updates.is_empty();
        if has_updates {
            validate_update(&switch.updates)?;
        }

        let existing = self.db.get_item(&pointer_key(&number))?;
        let existing: Option<MrnPointer> = existing.map(|i| i.to_record()).transpose()?;
        if let Some(pointer) = &existing {
            if pointer.patient_id != episode.patient_id {
                warn!(
                    patient_id = %episode.patient_id,
                    registration_number = %number,
                    owner = %pointer.patient_id,
                    "registration number owned by another patient"
                );
                return Err(LedgerError::Conflict(format!(
                    "registration number {} belongs to another patient",
                    number
                )));
            }
        }

        let already_active =
            number == episode.active_registration_number && scheme == episode.active_scheme;
        if already_active {
            if first_stage != episode.current_stage {
                return Err(LedgerError::Validation(
                    "registration is already active; use a stage transition to change stage".into(),
                ));
            }
            if !has_updates {
                debug!(patient_id = %episode.patient_id, registration_number = %number, "registration already active");
                return Ok(episode);
            }
            let now = now_timestamp();
            self.db
                .transact_write(update_ops(self.db, &episode, &switch.updates, &now)?)?;
            info!(patient_id = %episode.patient_id, "episode updated through registration switch");
            return load_episode(self.db, &episode.patient_id);
        }

        let now = now_timestamp();
        let mut merged = episode.clone();
        switch.updates.apply_to(&mut merged);

        let mut ops = Vec::with_capacity(4);
        if let Some(open) = verified_open_segment(self.db, &episode)? {
            ops.push(close_segment_op(&open, &now, &[], &[])?);
        }

        let mut segment = TimelineSegment::open(&episode.patient_id, &first_stage, &number, &scheme, &now);
        segment.actor_id = switch.actor_id.clone();
        segment.note = switch
            .note
            .clone()
            .or_else(|| Some(format!("registration switched to {}", number)));
        ops.push(open_segment_op(&segment)?);

        let pointer = MrnPointer {
            registration_number: number.clone(),
            scheme: scheme.clone(),
            patient_id: episode.patient_id.clone(),
            department: merged.department.clone(),
            status: merged.status,
            created_at: existing
                .as_ref()
                .map(|p| p.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now.clone(),
        };
        let pointer_index = ops.len();
        ops.push(WriteOp::Put {
            item: Item::from_record(pointer_key(&number), &pointer)?,
            condition: Some(Condition::Any(vec![
                Condition::NotExists,
                Condition::equals("patient_id", episode.patient_id.as_str()),
            ])),
        });

        let mut mutations = enter_segment_mutations(&segment, &now);
        mutations.push(Mutation::set("active_registration_number", number.as_str()));
        mutations.push(Mutation::set("active_scheme", scheme.as_str()));
        match &history {
            HistoryChange::Append => mutations.push(Mutation::append(
                "registration_history",
                &[RegistrationEntry::new(number.as_str(), scheme.as_str(), now.as_str())],
            )?),
            HistoryChange::Replace(entries) => {
                mutations.push(Mutation::set_json("registration_history", entries)?)
            }
        }
        if has_updates {
            mutations.extend(field_mutations(&switch.updates, &merged)?);
        }

        let mut guard = vec![
            episode_unchanged(&episode),
            Condition::equals(
                "active_registration_number",
                episode.active_registration_number.as_str(),
            ),
        ];
        if has_updates {
            guard.push(cohort_unchanged(&episode)?);
        }
        ops.push(WriteOp::Update {
            key: profile_key(&episode.patient_id),
            mutations,
            condition: Some(Condition::All(guard)),
        });

        match self.db.transact_write(ops) {
            Ok(()) => {}
            Err(crate::db::DbError::ConditionFailed { index, .. }) if index == pointer_index => {
                warn!(patient_id = %episode.patient_id, registration_number = %number, "pointer claimed concurrently");
                return Err(LedgerError::Conflict(format!(
                    "registration number {} belongs to another patient",
                    number
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            patient_id = %episode.patient_id,
            from = %episode.active_registration_number,
            to = %number,
            stage = %first_stage,
            "registration switched"
        );
        load_episode(self.db, &episode.patient_id)
    }

    /// Trim numbers, drop blank ones, default the scheme and date.
    ///
    /// Dates must be RFC 3339 instants or `YYYY-MM-DD`.
    fn clean_history(
        &self,
        episode: &EpisodeRecord,
        entries: &[HistoryEntryInput],
    ) -> LedgerResult<Vec<RegistrationEntry>> {
        let mut cleaned = Vec::with_capacity(entries.len());
        for entry in entries {
            let number = entry.number.trim();
            if number.is_empty() {
                continue;
            }
            let scheme = entry
                .scheme
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(self.config.default_scheme());
            let date = entry
                .date
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .unwrap_or(episode.updated_at.as_str());
            if parse_instant(date).is_none() {
                return Err(LedgerError::Validation(format!(
                    "registration {} has an unreadable date: {:?}",
                    number, date
                )));
            }
            cleaned.push(RegistrationEntry::new(number, scheme, date));
        }
        Ok(cleaned)
    }
}

/// Entry with the latest instant; the later entry wins ties.
/// Entries whose date does not parse are ignored.
fn latest_by_date(entries: &[RegistrationEntry]) -> Option<&RegistrationEntry> {
    entries
        .iter()
        .filter_map(|entry| parse_instant(&entry.date).map(|at| (at, entry)))
        .fold(None, |best, (at, entry)| match best {
            Some((best_at, b)) if best_at > at => Some((best_at, b)),
            _ => Some((at, entry)),
        })
        .map(|(_, entry)| entry)
}
