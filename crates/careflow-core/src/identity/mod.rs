//! Identity resolution.
//!
//! Callers may address a patient by canonical id or by any registration number
//! that was ever assigned to them. The resolver tries both without assuming
//! which kind of identifier it was given.

use tracing::{debug, warn};

use crate::db::Database;
use crate::error::{LedgerError, LedgerResult};
use crate::models::keys::{pointer_key, profile_key};
use crate::models::{EpisodeRecord, MrnPointer};

/// How an identifier was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    CanonicalId,
    RegistrationNumber,
}

/// Result of resolving an arbitrary identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Canonical id
    pub patient_id: String,
    /// Current episode snapshot; `None` when a pointer dangles
    pub episode: Option<EpisodeRecord>,
    /// Registration number used as provenance
    pub registration_number: Option<String>,
    pub scheme: Option<String>,
    pub via: ResolvedVia,
}

/// Turns canonical ids and registration numbers into episode snapshots.
pub struct IdentityResolver<'a> {
    db: &'a Database,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Resolve an identifier. Read-only.
    pub fn resolve(&self, any_id: &str) -> LedgerResult<Resolution> {
        let id = any_id.trim();
        if id.is_empty() {
            return Err(LedgerError::Validation("identifier is required".into()));
        }

        if let Some(item) = self.db.get_item(&profile_key(id))? {
            let episode: EpisodeRecord = item.to_record()?;
            debug!(patient_id = %id, "resolved canonical id");
            return Ok(Resolution {
                patient_id: episode.patient_id.clone(),
                registration_number: Some(episode.active_registration_number.clone()),
                scheme: Some(episode.active_scheme.clone()),
                episode: Some(episode),
                via: ResolvedVia::CanonicalId,
            });
        }

        let pointer: MrnPointer = match self.db.get_item(&pointer_key(id))? {
            Some(item) => item.to_record()?,
            None => return Err(LedgerError::NotFound(format!("patient {}", id))),
        };

        let episode = match self.db.get_item(&profile_key(&pointer.patient_id))? {
            Some(item) => Some(item.to_record::<EpisodeRecord>()?),
            None => {
                warn!(
                    registration_number = %pointer.registration_number,
                    patient_id = %pointer.patient_id,
                    "MRN pointer references a missing episode"
                );
                None
            }
        };
        debug!(registration_number = %id, patient_id = %pointer.patient_id, "resolved registration number");

        Ok(Resolution {
            patient_id: pointer.patient_id,
            episode,
            registration_number: Some(pointer.registration_number),
            scheme: Some(pointer.scheme),
            via: ResolvedVia::RegistrationNumber,
        })
    }

    /// Resolve an identifier and require the episode to exist.
    pub fn resolve_existing(&self, any_id: &str) -> LedgerResult<EpisodeRecord> {
        let resolution = self.resolve(any_id)?;
        resolution
            .episode
            .ok_or_else(|| LedgerError::NotFound(format!("episode for {}", resolution.patient_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Item;
    use crate::models::{EpisodeStatus, NewPatient};

    fn seed(db: &Database) -> EpisodeRecord {
        let record = EpisodeRecord::from_new(&NewPatient::new("Asha", "MRN-1", "UHID", "ortho"), "onboarding");
        db.put_item(
            &Item::from_record(profile_key(&record.patient_id), &record).unwrap(),
            None,
        )
        .unwrap();
        let pointer = MrnPointer {
            registration_number: "MRN-1".into(),
            scheme: "UHID".into(),
            patient_id: record.patient_id.clone(),
            department: "ortho".into(),
            status: EpisodeStatus::Active,
            created_at: record.created_at.clone(),
            updated_at: record.created_at.clone(),
        };
        db.put_item(&Item::from_record(pointer_key("MRN-1"), &pointer).unwrap(), None)
            .unwrap();
        record
    }

    #[test]
    fn test_resolve_by_canonical_id() {
        let db = Database::open_in_memory().unwrap();
        let record = seed(&db);

        let resolution = IdentityResolver::new(&db).resolve(&record.patient_id).unwrap();
        assert_eq!(resolution.via, ResolvedVia::CanonicalId);
        assert_eq!(resolution.registration_number.as_deref(), Some("MRN-1"));
        assert_eq!(resolution.episode, Some(record));
    }

    #[test]
    fn test_resolve_by_registration_number() {
        let db = Database::open_in_memory().unwrap();
        let record = seed(&db);

        let resolution = IdentityResolver::new(&db).resolve(" MRN-1 ").unwrap();
        assert_eq!(resolution.via, ResolvedVia::RegistrationNumber);
        assert_eq!(resolution.patient_id, record.patient_id);
        assert!(resolution.episode.is_some());
    }

    #[test]
    fn test_unknown_identifier_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let result = IdentityResolver::new(&db).resolve("nobody");
        assert!(matches!(result, Err(LedgerError::NotFound(_))));

        let result = IdentityResolver::new(&db).resolve("  ");
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_dangling_pointer() {
        let db = Database::open_in_memory().unwrap();
        let record = seed(&db);
        db.delete_item(&profile_key(&record.patient_id), None).unwrap();

        let resolver = IdentityResolver::new(&db);
        let resolution = resolver.resolve("MRN-1").unwrap();
        assert_eq!(resolution.patient_id, record.patient_id);
        assert!(resolution.episode.is_none());

        assert!(matches!(
            resolver.resolve_existing("MRN-1"),
            Err(LedgerError::NotFound(_))
        ));
    }
}
