//! Checklist gate: the table of allowed stage transitions.
//!
//! An entry keyed by `(from, to)` allows the transition and carries the items
//! required on entering `to` and on leaving `from`. Absence forbids it.

use tracing::{debug, info};

use crate::db::{Condition, Database, DbError, Item, ItemKey, Query};
use crate::error::{LedgerError, LedgerResult};
use crate::models::keys::{checklist_prefix, checklist_sk, is_valid_stage, CHECKLIST_PK};
use crate::models::ChecklistEntry;

/// Stock surgical pathway with its non-surgical shortcut.
pub fn default_pathway() -> Vec<ChecklistEntry> {
    vec![
        ChecklistEntry::new(
            "onboarding",
            "preop",
            &["vitals-recorded", "allergies-checked"],
            &["registration-complete"],
        ),
        ChecklistEntry::new(
            "preop",
            "intraop",
            &["timeout-completed", "anesthesia-cleared", "antibiotics-given"],
            &["fasting-confirmed"],
        ),
        ChecklistEntry::new(
            "intraop",
            "postop",
            &["procedure-completed", "counts-correct"],
            &["op-notes-signed"],
        ),
        ChecklistEntry::new(
            "postop",
            "discharge",
            &["recovery-stable", "pain-managed"],
            &["followup-scheduled"],
        ),
        ChecklistEntry::new(
            "preop",
            "discharge",
            &["non-surgical-plan", "education-complete"],
            &["preop-cancelled"],
        ),
    ]
}

fn entry_key(from_stage: &str, to_stage: &str) -> ItemKey {
    ItemKey::new(CHECKLIST_PK, checklist_sk(from_stage, to_stage))
}

/// Read access to the transition table, plus admin seeding.
pub struct ChecklistGate<'a> {
    db: &'a Database,
}

impl<'a> ChecklistGate<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Look up the entry for a stage pair.
    pub fn requirement(&self, from_stage: &str, to_stage: &str) -> LedgerResult<Option<ChecklistEntry>> {
        if !is_valid_stage(from_stage) || !is_valid_stage(to_stage) {
            return Ok(None);
        }
        let item = self.db.get_item(&entry_key(from_stage, to_stage))?;
        Ok(item.map(|i| i.to_record()).transpose()?)
    }

    /// Like [`requirement`](Self::requirement), but absence is an error.
    pub fn require(&self, from_stage: &str, to_stage: &str) -> LedgerResult<ChecklistEntry> {
        self.requirement(from_stage, to_stage)?.ok_or_else(|| {
            debug!(from = %from_stage, to = %to_stage, "no checklist entry");
            LedgerError::TransitionNotAllowed {
                from: from_stage.to_string(),
                to: to_stage.to_string(),
            }
        })
    }

    /// Every transition allowed out of `from_stage`.
    pub fn targets_from(&self, from_stage: &str) -> LedgerResult<Vec<ChecklistEntry>> {
        if !is_valid_stage(from_stage) {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.db.query_items(
                &Query::new(CHECKLIST_PK, checklist_prefix(from_stage))
                    .limit(100)
                    .after(cursor),
            )?;
            for item in &page.items {
                entries.push(item.to_record()?);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Insert or replace an entry.
    pub fn upsert(&self, entry: &ChecklistEntry) -> LedgerResult<()> {
        validate_entry(entry)?;
        let item = Item::from_record(entry_key(&entry.from_stage, &entry.to_stage), entry)?;
        self.db.put_item(&item, None)?;
        info!(from = %entry.from_stage, to = %entry.to_stage, "checklist entry stored");
        Ok(())
    }

    /// Write the stock pathway, leaving existing entries untouched.
    ///
    /// Returns the number of entries written.
    pub fn seed_defaults(&self) -> LedgerResult<usize> {
        let mut written = 0;
        for entry in default_pathway() {
            let item = Item::from_record(entry_key(&entry.from_stage, &entry.to_stage), &entry)?;
            match self.db.put_item(&item, Some(Condition::NotExists)) {
                Ok(()) => written += 1,
                Err(DbError::ConditionFailed { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(written, "checklist defaults seeded");
        Ok(written)
    }
}

fn validate_entry(entry: &ChecklistEntry) -> LedgerResult<()> {
    for stage in [&entry.from_stage, &entry.to_stage] {
        if !is_valid_stage(stage) {
            return Err(LedgerError::Validation(format!("invalid stage name: {:?}", stage)));
        }
    }
    if entry.from_stage == entry.to_stage {
        return Err(LedgerError::Validation(
            "a stage cannot transition to itself".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_require_missing_pair() {
        let db = setup();
        let gate = ChecklistGate::new(&db);
        let err = gate.require("onboarding", "postop").unwrap_err();
        assert!(matches!(err, LedgerError::TransitionNotAllowed { .. }));
    }

    #[test]
    fn test_seed_defaults_is_idempotent() {
        let db = setup();
        let gate = ChecklistGate::new(&db);
        assert_eq!(gate.seed_defaults().unwrap(), 5);
        assert_eq!(gate.seed_defaults().unwrap(), 0);

        let entry = gate.require("onboarding", "preop").unwrap();
        assert_eq!(entry.required_on_entry, vec!["vitals-recorded", "allergies-checked"]);
        assert_eq!(entry.required_on_exit, vec!["registration-complete"]);
    }

    #[test]
    fn test_seed_keeps_custom_entry() {
        let db = setup();
        let gate = ChecklistGate::new(&db);
        gate.upsert(&ChecklistEntry::new("onboarding", "preop", &["custom"], &[]))
            .unwrap();
        gate.seed_defaults().unwrap();
        assert_eq!(
            gate.require("onboarding", "preop").unwrap().required_on_entry,
            vec!["custom"]
        );
    }

    #[test]
    fn test_targets_from() {
        let db = setup();
        let gate = ChecklistGate::new(&db);
        gate.seed_defaults().unwrap();

        let mut targets: Vec<_> = gate
            .targets_from("preop")
            .unwrap()
            .into_iter()
            .map(|e| e.to_stage)
            .collect();
        targets.sort();
        assert_eq!(targets, vec!["discharge", "intraop"]);
        assert!(gate.targets_from("discharge").unwrap().is_empty());
    }

    #[test]
    fn test_upsert_rejects_bad_stages() {
        let db = setup();
        let gate = ChecklistGate::new(&db);
        assert!(gate.upsert(&ChecklistEntry::new("a:b", "c", &[], &[])).is_err());
        assert!(gate.upsert(&ChecklistEntry::new("preop", "preop", &[], &[])).is_err());
        assert!(gate.upsert(&ChecklistEntry::new("", "preop", &[], &[])).is_err());
    }
}
