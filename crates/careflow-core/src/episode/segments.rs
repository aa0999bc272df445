//! Timeline ledger write helpers shared by transitions and registration switches.

use serde_json::Value;
use tracing::warn;

use crate::db::{Condition, Database, Item, ItemKey, Mutation, WriteOp};
use crate::error::LedgerResult;
use crate::models::keys::patient_pk;
use crate::models::{EpisodeRecord, TimelineSegment};

/// Load the segment the episode claims is open, verifying it.
///
/// A reference that dangles, names another patient's segment, or names a
/// segment that is already closed is logged and treated as absent.
pub(crate) fn verified_open_segment(
    db: &Database,
    episode: &EpisodeRecord,
) -> LedgerResult<Option<TimelineSegment>> {
    let Some(sk) = episode.open_segment_ref.as_deref() else {
        return Ok(None);
    };
    let key = ItemKey::new(patient_pk(&episode.patient_id), sk);
    let Some(item) = db.get_item(&key)? else {
        warn!(patient_id = %episode.patient_id, segment = %sk, "open segment reference dangles");
        return Ok(None);
    };
    let segment: TimelineSegment = item.to_record()?;
    if segment.patient_id != episode.patient_id {
        warn!(
            patient_id = %episode.patient_id,
            owner = %segment.patient_id,
            "open segment reference names another patient's segment"
        );
        return Ok(None);
    }
    if !segment.is_open() {
        warn!(patient_id = %episode.patient_id, segment = %sk, "open segment reference is already closed");
        return Ok(None);
    }
    Ok(Some(segment))
}

/// Close a segment, conditioned on it still being open.
pub(crate) fn close_segment_op(
    segment: &TimelineSegment,
    closed_at: &str,
    required_on_exit: &[String],
    completed_on_exit: &[String],
) -> LedgerResult<WriteOp> {
    Ok(WriteOp::Update {
        key: segment.key(),
        mutations: vec![
            Mutation::set("closed_at", closed_at),
            Mutation::set_json("required_on_exit", &required_on_exit)?,
            Mutation::set_json("completed_on_exit", &completed_on_exit)?,
        ],
        condition: Some(Condition::All(vec![
            Condition::Exists,
            Condition::equals("closed_at", Value::Null),
        ])),
    })
}

/// Append a new segment; its key must be unused.
pub(crate) fn open_segment_op(segment: &TimelineSegment) -> LedgerResult<WriteOp> {
    Ok(WriteOp::Put {
        item: Item::from_record(segment.key(), segment)?,
        condition: Some(Condition::NotExists),
    })
}

/// Condition that the episode's stage and open segment are as read.
pub(crate) fn episode_unchanged(episode: &EpisodeRecord) -> Condition {
    Condition::All(vec![
        Condition::Exists,
        Condition::equals("current_stage", episode.current_stage.as_str()),
        Condition::equals(
            "open_segment_ref",
            episode
                .open_segment_ref
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Null),
        ),
    ])
}

/// Mutations that move the episode onto a newly opened segment.
pub(crate) fn enter_segment_mutations(segment: &TimelineSegment, now: &str) -> Vec<Mutation> {
    vec![
        Mutation::set("current_stage", segment.stage.as_str()),
        Mutation::set("open_segment_ref", segment.sort_key()),
        Mutation::set_entry_if_absent("stage_first_seen_at", &segment.stage, now),
        Mutation::set("updated_at", now),
    ]
}
