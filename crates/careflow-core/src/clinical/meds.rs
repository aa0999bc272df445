//! Medication orders, in order of creation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::{attach_file, detach_file, initial_files, non_blank, required};
use crate::config::CoreConfig;
use crate::db::{cursor_after, Condition, Database, Item, ItemKey, Mutation, Query, WriteOp};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::IdentityResolver;
use crate::models::keys::{
    med_sk, new_canonical_id, now_timestamp, parse_instant, patient_pk, timestamp, MED_PREFIX,
};
use crate::models::{EpisodeRecord, Medication, MedicationPatch, NewMedication};

/// Options for listing medication orders.
#[derive(Debug, Clone, Default)]
pub struct ListMedications {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    /// Only orders still running now
    pub active_only: bool,
}

/// One page of medication orders, oldest first.
#[derive(Debug, Clone, Default)]
pub struct MedicationPage {
    pub medications: Vec<Medication>,
    pub next_cursor: Option<String>,
}

/// Medication orders of patients.
pub struct MedicationStore<'a> {
    db: &'a Database,
    config: CoreConfig,
}

impl<'a> MedicationStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_config(db, CoreConfig::default())
    }

    pub fn with_config(db: &'a Database, config: CoreConfig) -> Self {
        Self { db, config }
    }

    fn episode(&self, any_id: &str) -> LedgerResult<EpisodeRecord> {
        IdentityResolver::new(self.db).resolve_existing(any_id)
    }

    /// Record a new order.
    pub fn create_medication(&self, any_id: &str, input: NewMedication) -> LedgerResult<Medication> {
        let name = required("name", &input.name)?;
        let dose = required("dose", &input.dose)?;
        let route = required("route", &input.route)?;
        let freq = required("freq", &input.freq)?;
        let start = required("start", &input.start)?;
        let end = non_blank(input.end);
        check_window(&start, end.as_deref())?;
        let schedule_times = clean_times(input.schedule_times);

        let episode = self.episode(any_id)?;
        let files = initial_files(&episode.patient_id, &input.files)?;
        let now = now_timestamp();

        let medication = Medication {
            med_id: new_canonical_id(),
            patient_id: episode.patient_id.clone(),
            name,
            dose,
            route,
            freq,
            start,
            end,
            priority: input.priority,
            schedule_times,
            files,
            registration_number: Some(episode.active_registration_number.clone()),
            scheme: Some(episode.active_scheme.clone()),
            created_at: now.clone(),
            updated_at: now,
        };

        self.db.transact_write(vec![WriteOp::Put {
            item: Item::from_record(medication.key(), &medication)?,
            condition: Some(Condition::NotExists),
        }])?;

        info!(
            patient_id = %medication.patient_id,
            med_id = %medication.med_id,
            priority = medication.priority.as_str(),
            "medication ordered"
        );
        Ok(medication)
    }

    /// Orders oldest first, optionally only those still running.
    pub fn list_medications(
        &self,
        any_id: &str,
        options: ListMedications,
    ) -> LedgerResult<MedicationPage> {
        let episode = self.episode(any_id)?;
        let limit = self.config.clamp_page(options.limit);
        let now = Utc::now();
        let mut medications = Vec::new();
        let mut cursor = options.cursor;

        loop {
            let page = self.db.query_items(
                &Query::new(patient_pk(&episode.patient_id), MED_PREFIX)
                    .limit(limit)
                    .after(cursor),
            )?;
            let has_more = page.next_cursor.is_some();
            let count = page.items.len();

            for (i, item) in page.items.iter().enumerate() {
                let medication: Medication = item.to_record()?;
                if options.active_only && !medication.is_active(now) {
                    continue;
                }
                medications.push(medication);
                if medications.len() == limit {
                    let more = has_more || i + 1 < count;
                    return Ok(MedicationPage {
                        medications,
                        next_cursor: more.then(|| cursor_after(&item.key.sk)),
                    });
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    return Ok(MedicationPage {
                        medications,
                        next_cursor: None,
                    })
                }
            }
        }
    }

    pub fn get_medication(&self, any_id: &str, med_id: &str) -> LedgerResult<Medication> {
        let episode = self.episode(any_id)?;
        let key = med_key(&episode.patient_id, med_id)?;
        match self.db.get_item(&key)? {
            Some(item) => Ok(item.to_record()?),
            None => Err(LedgerError::NotFound(format!("medication {}", med_id))),
        }
    }

    /// Change any subset of an order's fields. Blank values are rejected.
    pub fn patch_medication(
        &self,
        any_id: &str,
        med_id: &str,
        patch: MedicationPatch,
    ) -> LedgerResult<Medication> {
        if patch.is_empty() {
            return Err(LedgerError::Validation("nothing to update".into()));
        }
        if patch.clear_end && patch.end.is_some() {
            return Err(LedgerError::Validation(
                "end cannot be both set and cleared".into(),
            ));
        }
        let current = self.get_medication(any_id, med_id)?;

        let mut mutations = vec![Mutation::set("updated_at", now_timestamp())];
        for (field, value) in [
            ("name", patch.name),
            ("dose", patch.dose),
            ("route", patch.route),
            ("freq", patch.freq),
        ] {
            if let Some(value) = value {
                mutations.push(Mutation::set(field, required(field, &value)?));
            }
        }

        let start = match patch.start {
            Some(start) => required("start", &start)?,
            None => current.start.clone(),
        };
        let end = match patch.end {
            Some(end) => Some(required("end", &end)?),
            None if patch.clear_end => None,
            None => current.end.clone(),
        };
        check_window(&start, end.as_deref())?;
        mutations.push(Mutation::set("start", start));
        mutations.push(Mutation::set("end", end.map_or(Value::Null, Value::from)));

        if let Some(priority) = patch.priority {
            mutations.push(Mutation::set("priority", priority.as_str()));
        }
        if let Some(times) = patch.schedule_times {
            mutations.push(Mutation::set_json("schedule_times", &clean_times(times))?);
        }

        let updated = self
            .db
            .update_item(&current.key(), &mutations, Some(Condition::Exists))?;
        debug!(med_id = %current.med_id, "medication patched");
        Ok(updated.to_record()?)
    }

    /// Stop a running order by setting its end to now. An order that has
    /// already ended keeps its end.
    pub fn stop_medication(&self, any_id: &str, med_id: &str) -> LedgerResult<Medication> {
        let current = self.get_medication(any_id, med_id)?;
        let now = Utc::now();
        if !current.is_active(now) {
            debug!(med_id = %current.med_id, "medication already stopped");
            return Ok(current);
        }
        let now = timestamp(now);
        let updated = self.db.update_item(
            &current.key(),
            &[
                Mutation::set("end", now.as_str()),
                Mutation::set("updated_at", now.as_str()),
            ],
            Some(Condition::Exists),
        )?;
        info!(patient_id = %current.patient_id, med_id = %current.med_id, "medication stopped");
        Ok(updated.to_record()?)
    }

    /// Attach an uploaded object to an order. Attaching twice is a no-op.
    pub fn attach_file(&self, any_id: &str, med_id: &str, object_key: &str) -> LedgerResult<Medication> {
        let current = self.get_medication(any_id, med_id)?;
        attach_file(self.db, &current.key(), &current.patient_id, object_key)?;
        self.get_medication(&current.patient_id, med_id)
    }

    /// Detach an object from an order.
    pub fn detach_file(&self, any_id: &str, med_id: &str, object_key: &str) -> LedgerResult<Medication> {
        let current = self.get_medication(any_id, med_id)?;
        detach_file(self.db, &current.key(), object_key)?;
        self.get_medication(&current.patient_id, med_id)
    }
}

fn med_key(patient_id: &str, med_id: &str) -> LedgerResult<ItemKey> {
    let med_id = med_id.trim();
    if med_id.is_empty() {
        return Err(LedgerError::Validation("medication id is required".into()));
    }
    Ok(ItemKey::new(patient_pk(patient_id), med_sk(med_id)))
}

/// `start` and `end` must be readable instants, and `end` not before `start`.
fn check_window(start: &str, end: Option<&str>) -> LedgerResult<()> {
    let start_at = readable("start", start)?;
    if let Some(end) = end {
        let end_at = readable("end", end)?;
        if end_at < start_at {
            return Err(LedgerError::Validation("end is before start".into()));
        }
    }
    Ok(())
}

fn readable(field: &str, value: &str) -> LedgerResult<DateTime<Utc>> {
    parse_instant(value)
        .ok_or_else(|| LedgerError::Validation(format!("{} is not a date: {:?}", field, value)))
}

fn clean_times(times: Vec<String>) -> Vec<String> {
    times
        .into_iter()
        .filter_map(|t| non_blank(Some(t)))
        .collect()
}
