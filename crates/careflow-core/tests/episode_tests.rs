//! Episode, transition and registration integration tests.

use std::collections::HashMap;

use careflow_core::checklist::ChecklistGate;
use careflow_core::db::{Database, SortOrder};
use careflow_core::episode::{EpisodeService, TransitionRequest};
use careflow_core::error::LedgerError;
use careflow_core::models::{ChecklistEntry, EpisodeRecord, EpisodeStatus, NewPatient, TimelineSegment};
use careflow_core::registry::{MrnRegistry, RegistrationSwitch};
use proptest::prelude::*;

fn seeded_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    ChecklistGate::new(&db).seed_defaults().unwrap();
    db
}

fn admit(db: &Database, name: &str, mrn: &str) -> EpisodeRecord {
    EpisodeService::new(db)
        .create_patient(NewPatient::new(name, mrn, "UHID", "ortho"))
        .unwrap()
}

fn segments(db: &Database, patient_id: &str) -> Vec<TimelineSegment> {
    EpisodeService::new(db)
        .timeline(patient_id, SortOrder::Ascending, Some(200), None)
        .unwrap()
        .segments
}

fn open_count(db: &Database, patient_id: &str) -> usize {
    segments(db, patient_id).iter().filter(|s| s.is_open()).count()
}

#[test]
fn test_transition_sets_first_seen_once() {
    let db = seeded_db();
    ChecklistGate::new(&db)
        .upsert(&ChecklistEntry::new("preop", "onboarding", &[], &[]))
        .unwrap();
    let service = EpisodeService::new(&db);
    let created = admit(&db, "Asha Rao", "MRN-1");
    let onboarding_seen = created.stage_first_seen_at["onboarding"].clone();
    assert_eq!(segments(&db, &created.patient_id).len(), 1);

    let preop = service
        .transition(&created.patient_id, TransitionRequest::to("preop"))
        .unwrap();
    assert_eq!(preop.current_stage, "preop");
    assert!(preop.stage_first_seen_at.contains_key("preop"));
    assert_eq!(segments(&db, &created.patient_id).len(), 2);
    assert_eq!(open_count(&db, &created.patient_id), 1);

    let back = service
        .transition("MRN-1", TransitionRequest::to("onboarding"))
        .unwrap();
    assert_eq!(back.current_stage, "onboarding");
    assert_eq!(back.stage_first_seen_at["onboarding"], onboarding_seen);
    assert_eq!(back.stage_first_seen_at["preop"], preop.stage_first_seen_at["preop"]);

    let timeline = segments(&db, &created.patient_id);
    assert_eq!(timeline.len(), 3);
    let open: Vec<_> = timeline.iter().filter(|s| s.is_open()).collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].stage, "onboarding");
    assert_eq!(back.open_segment_ref.as_deref(), Some(open[0].sort_key().as_str()));
}

#[test]
fn test_transition_to_current_stage_adds_nothing() {
    let db = seeded_db();
    let created = admit(&db, "Asha Rao", "MRN-1");

    let same = EpisodeService::new(&db)
        .transition("MRN-1", TransitionRequest::to("onboarding"))
        .unwrap();
    assert_eq!(same, created);
    assert_eq!(segments(&db, &created.patient_id).len(), 1);
}

#[test]
fn test_transition_gate_blocks_unknown_pair() {
    let db = seeded_db();
    let created = admit(&db, "Asha Rao", "MRN-1");

    let err = EpisodeService::new(&db)
        .transition("MRN-1", TransitionRequest::to("discharge"))
        .unwrap_err();
    assert!(matches!(err, LedgerError::TransitionNotAllowed { .. }));
    assert_eq!(EpisodeService::new(&db).get("MRN-1").unwrap(), created);
}

#[test]
fn test_switch_to_active_twice_is_idempotent() {
    let db = seeded_db();
    let created = admit(&db, "Asha Rao", "MRN-1");
    let registry = MrnRegistry::new(&db);

    let first = registry
        .switch_registration("MRN-1", RegistrationSwitch::new("MRN-2", "UHID"))
        .unwrap();
    let second = registry
        .switch_registration(&created.patient_id, RegistrationSwitch::new("MRN-2", "UHID"))
        .unwrap();

    assert_eq!(first.registration_history.len(), 2);
    assert_eq!(second.registration_history.len(), 2);
    assert_eq!(second.active_registration_number, "MRN-2");
    assert_eq!(open_count(&db, &created.patient_id), 1);
}

#[test]
fn test_old_and_new_numbers_resolve_to_same_patient() {
    let db = seeded_db();
    let created = admit(&db, "Asha Rao", "MRN-1");
    MrnRegistry::new(&db)
        .switch_registration("MRN-1", RegistrationSwitch::new("MRN-2", "IPD"))
        .unwrap();

    let service = EpisodeService::new(&db);
    assert_eq!(service.get("MRN-1").unwrap().patient_id, created.patient_id);
    assert_eq!(service.get("MRN-2").unwrap().patient_id, created.patient_id);
    assert_eq!(service.get("MRN-2").unwrap().active_scheme, "IPD");

    let timeline = segments(&db, &created.patient_id);
    assert_eq!(timeline.len(), 2);
    let (open, closed): (Vec<_>, Vec<_>) = timeline.into_iter().partition(|s| s.is_open());
    assert_eq!(open[0].registration_number, "MRN-2");
    assert_eq!(closed[0].registration_number, "MRN-1");
}

#[test]
fn test_switch_to_foreign_number_leaves_everything_unchanged() {
    let db = seeded_db();
    let asha = admit(&db, "Asha Rao", "MRN-A");
    let ravi = admit(&db, "Ravi Iyer", "MRN-B");
    let before = segments(&db, &asha.patient_id);

    let err = MrnRegistry::new(&db)
        .switch_registration(&asha.patient_id, RegistrationSwitch::new("MRN-B", "UHID"))
        .unwrap_err();
    assert!(err.is_conflict());

    let service = EpisodeService::new(&db);
    assert_eq!(service.get(&asha.patient_id).unwrap(), asha);
    assert_eq!(segments(&db, &asha.patient_id), before);
    assert_eq!(service.get("MRN-B").unwrap().patient_id, ravi.patient_id);
    assert_eq!(
        MrnRegistry::new(&db).pointer("MRN-B").unwrap().patient_id,
        ravi.patient_id
    );
}

#[test]
fn test_cohort_follows_department_change() {
    let db = seeded_db();
    admit(&db, "Asha Rao", "MRN-1");
    admit(&db, "Ravi Iyer", "MRN-2");
    let service = EpisodeService::new(&db);

    let mut switch = RegistrationSwitch::new("MRN-3", "IPD");
    switch.updates.department = Some("cardio".into());
    MrnRegistry::new(&db).switch_registration("MRN-2", switch).unwrap();

    let ortho = service
        .list_by_cohort("ortho", EpisodeStatus::Active, None, None)
        .unwrap();
    assert_eq!(ortho.episodes.len(), 1);
    let cardio = service
        .list_by_cohort("cardio", EpisodeStatus::Active, None, None)
        .unwrap();
    assert_eq!(cardio.episodes.len(), 1);
    assert_eq!(cardio.episodes[0].active_registration_number, "MRN-3");
    assert_eq!(MrnRegistry::new(&db).pointer("MRN-3").unwrap().department, "cardio");
}

#[derive(Debug, Clone)]
enum Step {
    Transition { patient: usize, stage: &'static str },
    Switch { patient: usize, number: &'static str },
}

fn step() -> impl Strategy<Value = Step> {
    let stages = prop::sample::select(vec!["onboarding", "preop", "intraop", "postop", "discharge"]);
    let numbers = prop::sample::select(vec!["N-1", "N-2", "N-3", "N-4"]);
    prop_oneof![
        (0..2usize, stages).prop_map(|(patient, stage)| Step::Transition { patient, stage }),
        (0..2usize, numbers).prop_map(|(patient, number)| Step::Switch { patient, number }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// No sequence of transitions and switches leaves two open segments,
    /// and a claimed registration number never changes owner.
    #[test]
    fn open_segments_and_pointer_owners_hold(steps in proptest::collection::vec(step(), 1..25)) {
        let db = seeded_db();
        let patients = [
            admit(&db, "Asha Rao", "MRN-A").patient_id,
            admit(&db, "Ravi Iyer", "MRN-B").patient_id,
        ];
        let mut owners: HashMap<String, String> = HashMap::new();
        owners.insert("MRN-A".into(), patients[0].clone());
        owners.insert("MRN-B".into(), patients[1].clone());

        for step in steps {
            match step {
                Step::Transition { patient, stage } => {
                    let _ = EpisodeService::new(&db)
                        .transition(&patients[patient], TransitionRequest::to(stage));
                }
                Step::Switch { patient, number } => {
                    let result = MrnRegistry::new(&db)
                        .switch_registration(&patients[patient], RegistrationSwitch::new(number, "UHID"));
                    match owners.get(number) {
                        Some(owner) if owner != &patients[patient] => {
                            prop_assert!(result.is_err());
                        }
                        _ => {
                            prop_assert!(result.is_ok());
                            owners.insert(number.to_string(), patients[patient].clone());
                        }
                    }
                }
            }

            for id in &patients {
                prop_assert!(open_count(&db, id) <= 1);
            }
            for (number, owner) in &owners {
                let pointer = MrnRegistry::new(&db).pointer(number).unwrap();
                prop_assert_eq!(&pointer.patient_id, owner);
            }
        }
    }
}
