//! Discharge version store.
//!
//! Every save appends an immutable version keyed by creation time. A single
//! mutable "latest" record per patient mirrors whichever version is current
//! and carries a back-reference to it. Creation and soft deletion keep the
//! projection consistent inside one transaction; status patches mirror into
//! it best-effort and report the outcome through [`MirrorSync`].
//!
//! # Invariant
//!
//! The latest pointer's back-reference names a version with `deleted = false`,
//! or the pointer is absent.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::db::{
    cursor_after, Condition, Database, DbError, Item, ItemKey, Mutation, Query, WriteOp,
};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::IdentityResolver;
use crate::models::keys::{
    discharge_latest_key, new_canonical_id, now_timestamp, patient_pk, profile_key,
    DISCHARGE_LATEST_SK, DISCHARGE_PREFIX,
};
use crate::models::{
    DischargeDraft, DischargeVersion, EpisodeRecord, LatestPointer, VersionPatch,
    ANONYMOUS_AUTHOR,
};

/// State of the latest-pointer mirror after a status patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorSync {
    /// The pointer does not reference the patched version; nothing to mirror.
    NotCurrent,
    /// The pointer was updated.
    Synced,
    /// The version was updated but the pointer was not; it stays stale until
    /// the next version is created or deleted.
    Pending { reason: String },
}

/// Result of patching a version.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub version: DischargeVersion,
    pub mirror: MirrorSync,
}

/// What happened to the latest pointer on soft delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatestChange {
    /// The deleted version was not current.
    Unchanged,
    /// The pointer now mirrors this version id.
    Repointed(String),
    /// No live version remains; the pointer was removed.
    Removed,
}

/// Result of soft-deleting a version.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOutcome {
    pub version: DischargeVersion,
    pub latest: LatestChange,
}

/// Options for listing versions.
#[derive(Debug, Clone, Default)]
pub struct ListVersions {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub include_deleted: bool,
}

/// One page of versions, newest first.
#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    pub versions: Vec<DischargeVersion>,
    pub next_cursor: Option<String>,
}

/// Append-only discharge versions with a latest projection.
pub struct DischargeStore<'a> {
    db: &'a Database,
    config: CoreConfig,
}

impl<'a> DischargeStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self::with_config(db, CoreConfig::default())
    }

    pub fn with_config(db: &'a Database, config: CoreConfig) -> Self {
        Self { db, config }
    }

    fn episode(&self, any_id: &str) -> LedgerResult<EpisodeRecord> {
        IdentityResolver::new(self.db).resolve_existing(any_id)
    }

    /// Save a new version and make it the latest.
    pub fn create_version(&self, any_id: &str, draft: DischargeDraft) -> LedgerResult<DischargeVersion> {
        let content = draft.content.sanitized();
        if !content.has_content() {
            return Err(LedgerError::Validation(
                "discharge summary needs text or at least one section".into(),
            ));
        }
        let episode = self.episode(any_id)?;
        let now = now_timestamp();

        let version = DischargeVersion {
            version_id: new_canonical_id(),
            patient_id: episode.patient_id.clone(),
            status: draft.status,
            content,
            registration_number: episode.active_registration_number.clone(),
            scheme: episode.active_scheme.clone(),
            author_id: non_blank(draft.author_id).unwrap_or_else(|| ANONYMOUS_AUTHOR.to_string()),
            author_name: non_blank(draft.author_name),
            commit_message: non_blank(draft.commit_message),
            deleted: false,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        self.db.transact_write(vec![
            WriteOp::Put {
                item: Item::from_record(version.key(), &version)?,
                condition: Some(Condition::NotExists),
            },
            WriteOp::Put {
                item: Item::from_record(
                    discharge_latest_key(&episode.patient_id),
                    &LatestPointer::mirror(&version),
                )?,
                condition: None,
            },
            WriteOp::Update {
                key: profile_key(&episode.patient_id),
                mutations: vec![Mutation::increment("update_counter", 1)],
                condition: Some(Condition::Exists),
            },
        ])?;

        info!(
            patient_id = %episode.patient_id,
            version_id = %version.version_id,
            status = version.status.as_str(),
            "discharge version created"
        );
        Ok(version)
    }

    /// Edit a version's status and/or commit message.
    ///
    /// The version is updated first; the latest pointer's status is mirrored in
    /// a second write when it references this version.
    pub fn patch_version(
        &self,
        any_id: &str,
        version_id: &str,
        patch: VersionPatch,
    ) -> LedgerResult<PatchOutcome> {
        let commit_message = non_blank(patch.commit_message.clone());
        if patch.status.is_none() && commit_message.is_none() {
            return Err(LedgerError::Validation("nothing to update".into()));
        }
        let episode = self.episode(any_id)?;
        let (key, _) = self
            .find_version(&episode.patient_id, version_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("discharge version {}", version_id)))?;

        let now = now_timestamp();
        let mut mutations = vec![Mutation::set("updated_at", now.as_str())];
        if let Some(status) = patch.status {
            mutations.push(Mutation::set("status", status.as_str()));
        }
        if let Some(message) = &commit_message {
            mutations.push(Mutation::set("commit_message", message.as_str()));
        }
        let updated = self
            .db
            .update_item(&key, &mutations, Some(Condition::Exists))?;
        let version: DischargeVersion = updated.to_record()?;

        let mirror = match patch.status {
            Some(status) => self.mirror_status(&episode.patient_id, &key, status.as_str(), &now),
            None => MirrorSync::NotCurrent,
        };
        debug!(version_id = %version_id, ?mirror, "discharge version patched");
        Ok(PatchOutcome { version, mirror })
    }

    fn mirror_status(&self, patient_id: &str, version_key: &ItemKey, status: &str, now: &str) -> MirrorSync {
        let latest_key = discharge_latest_key(patient_id);
        let pointer = match self.db.get_item(&latest_key) {
            Ok(pointer) => pointer,
            Err(e) => return pending(patient_id, e),
        };
        let references = pointer
            .as_ref()
            .and_then(|p| p.get_str("current_version_key"))
            == Some(version_key.sk.as_str());
        if !references {
            return MirrorSync::NotCurrent;
        }

        let result = self.db.update_item(
            &latest_key,
            &[
                Mutation::set("status", status),
                Mutation::set("updated_at", now),
            ],
            Some(Condition::equals("current_version_key", version_key.sk.as_str())),
        );
        match result {
            Ok(_) => MirrorSync::Synced,
            Err(DbError::ConditionFailed { .. }) => {
                debug!(patient_id, "latest pointer moved during patch");
                MirrorSync::NotCurrent
            }
            Err(e) => pending(patient_id, e),
        }
    }

    /// Soft-delete a version, re-pointing the latest projection if needed.
    ///
    /// The flag and the pointer change are one transaction, conditioned on the
    /// pointer still referencing what was read and on the replacement still
    /// being live.
    pub fn soft_delete_version(&self, any_id: &str, version_id: &str) -> LedgerResult<DeleteOutcome> {
        let episode = self.episode(any_id)?;
        let patient_id = episode.patient_id.as_str();
        let (key, mut version) = self
            .find_version(patient_id, version_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("discharge version {}", version_id)))?;

        let latest_key = discharge_latest_key(patient_id);
        let pointer_ref = self
            .db
            .get_item(&latest_key)?
            .and_then(|p| p.get_str("current_version_key").map(str::to_string));
        let is_current = pointer_ref.as_deref() == Some(key.sk.as_str());

        if version.deleted && !is_current {
            debug!(version_id, "version already deleted");
            return Ok(DeleteOutcome {
                version,
                latest: LatestChange::Unchanged,
            });
        }

        let now = now_timestamp();
        let mut ops = vec![WriteOp::Update {
            key: key.clone(),
            mutations: vec![
                Mutation::set("deleted", true),
                Mutation::set("updated_at", now.as_str()),
            ],
            condition: Some(Condition::Exists),
        }];

        let latest = if is_current {
            let pointer_unchanged = Condition::equals("current_version_key", key.sk.as_str());
            match self.newest_live_version(patient_id, Some(&key.sk))? {
                Some(next) => {
                    ops.push(WriteOp::Check {
                        key: next.key(),
                        condition: Condition::equals("deleted", false),
                    });
                    ops.push(WriteOp::Put {
                        item: Item::from_record(latest_key, &LatestPointer::mirror(&next))?,
                        condition: Some(pointer_unchanged),
                    });
                    LatestChange::Repointed(next.version_id)
                }
                None => {
                    ops.push(WriteOp::Delete {
                        key: latest_key,
                        condition: Some(pointer_unchanged),
                    });
                    LatestChange::Removed
                }
            }
        } else {
            // The pointer must not move onto this version while it is being flagged.
            ops.push(WriteOp::Check {
                key: latest_key,
                condition: match &pointer_ref {
                    Some(sk) => Condition::equals("current_version_key", sk.as_str()),
                    None => Condition::NotExists,
                },
            });
            LatestChange::Unchanged
        };

        self.db.transact_write(ops)?;
        version.deleted = true;
        version.updated_at = now;

        info!(patient_id, version_id, latest = ?latest, "discharge version deleted");
        Ok(DeleteOutcome { version, latest })
    }

    /// Versions newest first, skipping deleted ones unless asked.
    pub fn list_versions(&self, any_id: &str, options: ListVersions) -> LedgerResult<VersionPage> {
        let episode = self.episode(any_id)?;
        let limit = self.config.clamp_page(options.limit);
        let mut versions = Vec::new();
        let mut cursor = options.cursor;

        loop {
            let page = self.db.query_items(
                &Query::new(patient_pk(&episode.patient_id), DISCHARGE_PREFIX)
                    .descending()
                    .limit(limit)
                    .after(cursor),
            )?;
            let has_more = page.next_cursor.is_some();
            let count = page.items.len();

            for (i, item) in page.items.iter().enumerate() {
                if item.key.sk == DISCHARGE_LATEST_SK {
                    continue;
                }
                let version: DischargeVersion = item.to_record()?;
                if version.deleted && !options.include_deleted {
                    continue;
                }
                versions.push(version);
                if versions.len() == limit {
                    let more = has_more || i + 1 < count;
                    return Ok(VersionPage {
                        versions,
                        next_cursor: more.then(|| cursor_after(&item.key.sk)),
                    });
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    return Ok(VersionPage {
                        versions,
                        next_cursor: None,
                    })
                }
            }
        }
    }

    /// One version by id. Deleted versions only with `include_deleted`.
    pub fn get_version(
        &self,
        any_id: &str,
        version_id: &str,
        include_deleted: bool,
    ) -> LedgerResult<DischargeVersion> {
        let episode = self.episode(any_id)?;
        match self.find_version(&episode.patient_id, version_id)? {
            Some((_, version)) if include_deleted || !version.deleted => Ok(version),
            _ => Err(LedgerError::NotFound(format!("discharge version {}", version_id))),
        }
    }

    /// The current version, or `None` when no live version exists.
    ///
    /// The pointer's back-reference is verified; a stale pointer is logged and
    /// the newest live version is returned instead. Nothing is written.
    pub fn get_latest(&self, any_id: &str) -> LedgerResult<Option<DischargeVersion>> {
        let episode = self.episode(any_id)?;
        let patient_id = episode.patient_id.as_str();
        let Some(item) = self.db.get_item(&discharge_latest_key(patient_id))? else {
            return Ok(None);
        };
        let pointer: LatestPointer = item.to_record()?;

        let target = self
            .db
            .get_item(&ItemKey::new(patient_pk(patient_id), pointer.current_version_key.as_str()))?;
        let live = match target {
            Some(target) => !target.get("deleted").and_then(Value::as_bool).unwrap_or(false),
            None => false,
        };
        if live {
            return Ok(Some(pointer.version));
        }

        warn!(
            patient_id,
            current_version_key = %pointer.current_version_key,
            "latest discharge pointer is stale"
        );
        self.newest_live_version(patient_id, None)
    }

    fn find_version(
        &self,
        patient_id: &str,
        version_id: &str,
    ) -> LedgerResult<Option<(ItemKey, DischargeVersion)>> {
        let version_id = version_id.trim();
        if version_id.is_empty() {
            return Err(LedgerError::Validation("version id is required".into()));
        }
        let mut found = None;
        self.scan_versions(patient_id, |key, version| {
            if version.version_id == version_id {
                found = Some((key.clone(), version));
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    fn newest_live_version(
        &self,
        patient_id: &str,
        excluding_sk: Option<&str>,
    ) -> LedgerResult<Option<DischargeVersion>> {
        let mut found = None;
        self.scan_versions(patient_id, |key, version| {
            if version.deleted || Some(key.sk.as_str()) == excluding_sk {
                true
            } else {
                found = Some(version);
                false
            }
        })?;
        Ok(found)
    }

    /// Walk versions newest first until `visit` returns false.
    fn scan_versions(
        &self,
        patient_id: &str,
        mut visit: impl FnMut(&ItemKey, DischargeVersion) -> bool,
    ) -> LedgerResult<()> {
        let mut cursor = None;
        loop {
            let page = self.db.query_items(
                &Query::new(patient_pk(patient_id), DISCHARGE_PREFIX)
                    .descending()
                    .limit(self.config.scan_page_size())
                    .after(cursor),
            )?;
            for item in &page.items {
                if item.key.sk == DISCHARGE_LATEST_SK {
                    continue;
                }
                if !visit(&item.key, item.to_record()?) {
                    return Ok(());
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }
}

fn pending(patient_id: &str, e: DbError) -> MirrorSync {
    warn!(patient_id, error = %e, "latest pointer status mirror pending");
    MirrorSync::Pending {
        reason: e.to_string(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeService;
    use crate::models::{DischargeContent, DischargeStatus, NewPatient};

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let record = EpisodeService::new(&db)
            .create_patient(NewPatient::new("Asha", "MRN-1", "UHID", "ortho"))
            .unwrap();
        (db, record.patient_id)
    }

    fn draft(text: &str) -> DischargeDraft {
        DischargeDraft::new(DischargeContent::from_text(text))
    }

    #[test]
    fn test_create_then_latest_round_trip() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let mut input = draft("Stable, discharge home");
        input.author_id = Some("dr-1".into());

        let version = store.create_version("MRN-1", input).unwrap();
        let latest = store.get_latest(&id).unwrap().unwrap();
        assert_eq!(latest.content, DischargeContent::from_text("Stable, discharge home"));
        assert_eq!(latest.version_id, version.version_id);
        assert_eq!(latest.author_id, "dr-1");
        assert_eq!(latest.registration_number, "MRN-1");

        let episode = EpisodeService::new(&db).get(&id).unwrap();
        assert_eq!(episode.update_counter, 1);
    }

    #[test]
    fn test_empty_content_rejected() {
        let (db, id) = setup();
        let err = DischargeStore::new(&db).create_version(&id, draft("  ")).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_author_defaults_to_anon() {
        let (db, id) = setup();
        let version = DischargeStore::new(&db).create_version(&id, draft("x")).unwrap();
        assert_eq!(version.author_id, ANONYMOUS_AUTHOR);
        assert_eq!(version.status, DischargeStatus::Draft);
    }

    #[test]
    fn test_patch_current_version_syncs_mirror() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let version = store.create_version(&id, draft("x")).unwrap();

        let outcome = store
            .patch_version(
                &id,
                &version.version_id,
                VersionPatch {
                    status: Some(DischargeStatus::Published),
                    commit_message: Some("sign off".into()),
                },
            )
            .unwrap();
        assert_eq!(outcome.mirror, MirrorSync::Synced);
        assert_eq!(outcome.version.status, DischargeStatus::Published);
        assert_eq!(outcome.version.commit_message.as_deref(), Some("sign off"));
        assert_eq!(
            store.get_latest(&id).unwrap().unwrap().status,
            DischargeStatus::Published
        );
    }

    #[test]
    fn test_patch_older_version_is_not_current() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let old = store.create_version(&id, draft("v1")).unwrap();
        store.create_version(&id, draft("v2")).unwrap();

        let outcome = store
            .patch_version(
                &id,
                &old.version_id,
                VersionPatch {
                    status: Some(DischargeStatus::Archived),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.mirror, MirrorSync::NotCurrent);
        assert_eq!(
            store.get_latest(&id).unwrap().unwrap().status,
            DischargeStatus::Draft
        );
    }

    #[test]
    fn test_patch_mirror_failure_is_pending() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let version = store.create_version(&id, draft("x")).unwrap();
        db.conn()
            .execute_batch(
                "CREATE TRIGGER block_latest BEFORE UPDATE ON items
                 WHEN new.sk = 'discharge:latest'
                 BEGIN SELECT RAISE(ABORT, 'latest pointer locked'); END;",
            )
            .unwrap();

        let outcome = store
            .patch_version(
                &id,
                &version.version_id,
                VersionPatch {
                    status: Some(DischargeStatus::Published),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(outcome.mirror, MirrorSync::Pending { .. }));
        assert_eq!(outcome.version.status, DischargeStatus::Published);
        assert_eq!(
            store.get_latest(&id).unwrap().unwrap().status,
            DischargeStatus::Draft
        );
    }

    #[test]
    fn test_empty_patch_rejected() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let version = store.create_version(&id, draft("x")).unwrap();
        let err = store
            .patch_version(
                &id,
                &version.version_id,
                VersionPatch {
                    status: None,
                    commit_message: Some("   ".into()),
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(matches!(
            store.patch_version(&id, "missing", VersionPatch { status: Some(DischargeStatus::Archived), ..Default::default() }),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_current_repoints_to_previous() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let first = store.create_version(&id, draft("v1")).unwrap();
        let second = store.create_version(&id, draft("v2")).unwrap();

        let outcome = store.soft_delete_version(&id, &second.version_id).unwrap();
        assert_eq!(outcome.latest, LatestChange::Repointed(first.version_id.clone()));
        assert!(outcome.version.deleted);

        let latest = store.get_latest(&id).unwrap().unwrap();
        assert_eq!(latest.version_id, first.version_id);
    }

    #[test]
    fn test_delete_only_version_removes_pointer() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let only = store.create_version(&id, draft("v1")).unwrap();

        let outcome = store.soft_delete_version(&id, &only.version_id).unwrap();
        assert_eq!(outcome.latest, LatestChange::Removed);
        assert!(store.get_latest(&id).unwrap().is_none());
        assert!(db.get_item(&discharge_latest_key(&id)).unwrap().is_none());
    }

    #[test]
    fn test_delete_non_current_leaves_pointer() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let first = store.create_version(&id, draft("v1")).unwrap();
        let second = store.create_version(&id, draft("v2")).unwrap();

        let outcome = store.soft_delete_version(&id, &first.version_id).unwrap();
        assert_eq!(outcome.latest, LatestChange::Unchanged);
        assert_eq!(
            store.get_latest(&id).unwrap().unwrap().version_id,
            second.version_id
        );
    }

    #[test]
    fn test_list_hides_deleted_unless_asked() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let v1 = store.create_version(&id, draft("v1")).unwrap();
        let v2 = store.create_version(&id, draft("v2")).unwrap();
        let v3 = store.create_version(&id, draft("v3")).unwrap();
        store.soft_delete_version(&id, &v2.version_id).unwrap();

        let page = store.list_versions(&id, ListVersions::default()).unwrap();
        let ids: Vec<_> = page.versions.iter().map(|v| v.version_id.clone()).collect();
        assert_eq!(ids, vec![v3.version_id.clone(), v1.version_id.clone()]);

        let all = store
            .list_versions(
                &id,
                ListVersions {
                    include_deleted: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(all.versions.len(), 3);

        assert!(matches!(
            store.get_version(&id, &v2.version_id, false),
            Err(LedgerError::NotFound(_))
        ));
        assert!(store.get_version(&id, &v2.version_id, true).unwrap().deleted);
    }

    #[test]
    fn test_list_pages_skip_deleted() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let mut created = Vec::new();
        for n in 0..4 {
            created.push(store.create_version(&id, draft(&format!("v{}", n))).unwrap());
        }
        store.soft_delete_version(&id, &created[2].version_id).unwrap();

        let first = store
            .list_versions(&id, ListVersions { limit: Some(2), ..Default::default() })
            .unwrap();
        assert_eq!(first.versions.len(), 2);
        assert_eq!(first.versions[0].version_id, created[3].version_id);
        assert_eq!(first.versions[1].version_id, created[1].version_id);

        let rest = store
            .list_versions(
                &id,
                ListVersions {
                    limit: Some(2),
                    cursor: first.next_cursor,
                    include_deleted: false,
                },
            )
            .unwrap();
        assert_eq!(rest.versions.len(), 1);
        assert_eq!(rest.versions[0].version_id, created[0].version_id);
        assert!(rest.next_cursor.is_none());
    }

    #[test]
    fn test_stale_pointer_falls_back_without_writing() {
        let (db, id) = setup();
        let store = DischargeStore::new(&db);
        let first = store.create_version(&id, draft("v1")).unwrap();
        let second = store.create_version(&id, draft("v2")).unwrap();
        db.update_item(&second.key(), &[Mutation::set("deleted", true)], None)
            .unwrap();

        let latest = store.get_latest(&id).unwrap().unwrap();
        assert_eq!(latest.version_id, first.version_id);

        let pointer: LatestPointer = db
            .get_item(&discharge_latest_key(&id))
            .unwrap()
            .unwrap()
            .to_record()
            .unwrap();
        assert_eq!(pointer.current_version_id, second.version_id);
    }
}
