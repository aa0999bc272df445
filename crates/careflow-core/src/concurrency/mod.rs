//! Optimistic-concurrency list mutator.
//!
//! List-valued fields on shared records are changed by read, compute, write:
//! the write is conditioned on the record's `revision` stamp being unchanged
//! since the read (or the record still not existing). A failed condition is
//! surfaced as [`LedgerError::Conflict`]; the mutator never retries on its own.
//! Callers that want retries wrap the whole read-compute-write in
//! [`retry_on_conflict`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{Condition, Database, ItemKey, Mutation};
use crate::error::{LedgerError, LedgerResult};
use crate::models::keys::now_timestamp;

/// Attribute holding the concurrency stamp.
pub const REVISION_ATTR: &str = "revision";

/// A list value together with the stamp it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot<T> {
    pub items: Vec<T>,
    /// `None` when the record does not exist yet
    pub revision: Option<i64>,
}

/// Read and conditionally write one list field of one record.
pub struct ListMutator<'a> {
    db: &'a Database,
}

impl<'a> ListMutator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Read the list and its stamp. A missing field reads as empty.
    pub fn read<T: DeserializeOwned>(&self, key: &ItemKey, field: &str) -> LedgerResult<ListSnapshot<T>> {
        let Some(item) = self.db.get_item(key)? else {
            return Ok(ListSnapshot {
                items: Vec::new(),
                revision: None,
            });
        };
        let items = match item.get(field) {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(crate::db::DbError::from)?,
        };
        Ok(ListSnapshot {
            items,
            revision: Some(item.get_i64(REVISION_ATTR).unwrap_or(0)),
        })
    }

    /// Write the list if the stamp still equals `expected`. Returns the new stamp.
    pub fn write<T: Serialize>(
        &self,
        key: &ItemKey,
        field: &str,
        items: &[T],
        expected: Option<i64>,
    ) -> LedgerResult<i64> {
        let mutations = [
            Mutation::set_json(field, &items)?,
            Mutation::increment(REVISION_ATTR, 1),
            Mutation::set("updated_at", now_timestamp()),
        ];
        match self.db.update_item(key, &mutations, Some(stamp_condition(expected))) {
            Ok(item) => Ok(item.get_i64(REVISION_ATTR).unwrap_or(0)),
            Err(e) => {
                let err = LedgerError::from(e);
                if err.is_conflict() {
                    warn!(key = %key, field, ?expected, "list write lost a race");
                    return Err(LedgerError::Conflict(format!(
                        "{} on {} changed since it was read",
                        field, key
                    )));
                }
                Err(err)
            }
        }
    }

    /// Append one item. One read, one conditional write.
    pub fn append<T>(&self, key: &ItemKey, field: &str, item: T) -> LedgerResult<ListSnapshot<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut snapshot = self.read::<T>(key, field)?;
        snapshot.items.push(item);
        let revision = self.write(key, field, &snapshot.items, snapshot.revision)?;
        debug!(key = %key, field, revision, "list appended");
        Ok(ListSnapshot {
            items: snapshot.items,
            revision: Some(revision),
        })
    }

    /// Remove every item matching `predicate`. Returns the new list and the
    /// number removed; nothing is written when nothing matches.
    pub fn remove_where<T>(
        &self,
        key: &ItemKey,
        field: &str,
        predicate: impl Fn(&T) -> bool,
    ) -> LedgerResult<(ListSnapshot<T>, usize)>
    where
        T: Serialize + DeserializeOwned,
    {
        let snapshot = self.read::<T>(key, field)?;
        let before = snapshot.items.len();
        let kept: Vec<T> = snapshot.items.into_iter().filter(|i| !predicate(i)).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok((
                ListSnapshot {
                    items: kept,
                    revision: snapshot.revision,
                },
                0,
            ));
        }
        let revision = self.write(key, field, &kept, snapshot.revision)?;
        debug!(key = %key, field, revision, removed, "list items removed");
        Ok((
            ListSnapshot {
                items: kept,
                revision: Some(revision),
            },
            removed,
        ))
    }
}

/// Condition for a write expecting `expected`.
///
/// A record written before stamps existed reads as revision 0.
fn stamp_condition(expected: Option<i64>) -> Condition {
    match expected {
        None => Condition::NotExists,
        Some(0) => Condition::Any(vec![
            Condition::equals(REVISION_ATTR, 0),
            Condition::equals(REVISION_ATTR, Value::Null),
        ]),
        Some(n) => Condition::equals(REVISION_ATTR, n),
    }
}

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or `attempts` runs out. `op` must re-read on every call.
pub fn retry_on_conflict<T>(
    attempts: usize,
    mut op: impl FnMut() -> LedgerResult<T>,
) -> LedgerResult<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, attempts, "retrying after conflict");
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Item;

    fn key() -> ItemKey {
        ItemKey::new("patient:p-1", "documents")
    }

    #[test]
    fn test_read_missing_record() {
        let db = Database::open_in_memory().unwrap();
        let snapshot = ListMutator::new(&db).read::<String>(&key(), "lab_reports").unwrap();
        assert!(snapshot.items.is_empty());
        assert_eq!(snapshot.revision, None);
    }

    #[test]
    fn test_append_bumps_revision() {
        let db = Database::open_in_memory().unwrap();
        let mutator = ListMutator::new(&db);

        let first = mutator.append(&key(), "lab_reports", "a".to_string()).unwrap();
        assert_eq!(first.revision, Some(1));
        let second = mutator.append(&key(), "lab_reports", "b".to_string()).unwrap();
        assert_eq!(second.revision, Some(2));
        assert_eq!(second.items, vec!["a", "b"]);
    }

    #[test]
    fn test_stale_write_conflicts() {
        let db = Database::open_in_memory().unwrap();
        let mutator = ListMutator::new(&db);
        let snapshot = mutator.read::<String>(&key(), "radiology").unwrap();

        mutator.write(&key(), "radiology", &["x"], snapshot.revision).unwrap();
        let err = mutator
            .write(&key(), "radiology", &["y"], snapshot.revision)
            .unwrap_err();
        assert!(err.is_conflict());

        let current = mutator.read::<String>(&key(), "radiology").unwrap();
        assert_eq!(current.items, vec!["x"]);
    }

    #[test]
    fn test_unstamped_record_reads_as_zero() {
        let db = Database::open_in_memory().unwrap();
        db.put_item(&Item::new(key()).with("ot_notes", serde_json::json!(["old"])), None)
            .unwrap();
        let mutator = ListMutator::new(&db);

        let appended = mutator.append(&key(), "ot_notes", "new".to_string()).unwrap();
        assert_eq!(appended.items, vec!["old", "new"]);
        assert_eq!(appended.revision, Some(1));
    }

    #[test]
    fn test_remove_where() {
        let db = Database::open_in_memory().unwrap();
        let mutator = ListMutator::new(&db);
        for v in ["a", "b", "a"] {
            mutator.append(&key(), "ot_notes", v.to_string()).unwrap();
        }

        let (snapshot, removed) = mutator
            .remove_where(&key(), "ot_notes", |v: &String| v == "a")
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(snapshot.items, vec!["b"]);
        assert_eq!(snapshot.revision, Some(4));

        let (_, removed) = mutator
            .remove_where(&key(), "ot_notes", |v: &String| v == "zzz")
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_retry_on_conflict() {
        let mut calls = 0;
        let result = retry_on_conflict(3, || {
            calls += 1;
            if calls < 3 {
                Err(LedgerError::Conflict("busy".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: LedgerResult<()> = retry_on_conflict(2, || {
            calls += 1;
            Err(LedgerError::Conflict("busy".into()))
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 2);

        let mut calls = 0;
        let result: LedgerResult<()> = retry_on_conflict(5, || {
            calls += 1;
            Err(LedgerError::NotFound("gone".into()))
        });
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
        assert_eq!(calls, 1);
    }
}
