//! Checklist-gated stage transitions.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    close_segment_op, enter_segment_mutations, episode_unchanged, open_segment_op,
    verified_open_segment, EpisodeService,
};
use crate::checklist::ChecklistGate;
use crate::db::WriteOp;
use crate::error::{LedgerError, LedgerResult};
use crate::models::keys::{is_valid_stage, now_timestamp, profile_key};
use crate::models::{EpisodeRecord, TimelineSegment};

/// A request to move a patient to another stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransitionRequest {
    pub to_stage: String,
    /// Items the caller reports complete on entering `to_stage`
    pub completed_on_entry: Vec<String>,
    /// Items the caller reports complete on leaving the current stage
    pub completed_on_exit: Vec<String>,
    pub actor_id: Option<String>,
    pub note: Option<String>,
}

impl TransitionRequest {
    pub fn to(stage: impl Into<String>) -> Self {
        Self {
            to_stage: stage.into(),
            ..Default::default()
        }
    }
}

impl<'a> EpisodeService<'a> {
    /// Move a patient to `request.to_stage`.
    ///
    /// Closing the open segment, opening the new one and repointing the
    /// episode happen in one transaction. Completed-item lists are recorded
    /// as reported; they are not checked against the required lists.
    pub fn transition(&self, any_id: &str, request: TransitionRequest) -> LedgerResult<EpisodeRecord> {
        let to_stage = request.to_stage.trim();
        if !is_valid_stage(to_stage) {
            return Err(LedgerError::Validation(format!("invalid stage name: {:?}", request.to_stage)));
        }

        let episode = self.get(any_id)?;
        if episode.current_stage == to_stage {
            debug!(patient_id = %episode.patient_id, stage = %to_stage, "transition to current stage is a no-op");
            return Ok(episode);
        }

        let entry = ChecklistGate::new(self.db).require(&episode.current_stage, to_stage)?;
        let now = now_timestamp();

        let mut ops = Vec::with_capacity(3);
        let open = verified_open_segment(self.db, &episode)?;
        if let Some(open) = &open {
            ops.push(close_segment_op(
                open,
                &now,
                &entry.required_on_exit,
                &request.completed_on_exit,
            )?);
        }

        let mut segment = TimelineSegment::open(
            &episode.patient_id,
            to_stage,
            &episode.active_registration_number,
            &episode.active_scheme,
            &now,
        );
        segment.required_on_entry = entry.required_on_entry.clone();
        segment.completed_on_entry = request.completed_on_entry.clone();
        segment.actor_id = request.actor_id.clone();
        segment.note = request.note.clone();
        ops.push(open_segment_op(&segment)?);

        ops.push(WriteOp::Update {
            key: profile_key(&episode.patient_id),
            mutations: enter_segment_mutations(&segment, &now),
            condition: Some(episode_unchanged(&episode)),
        });

        if let Err(e) = self.db.transact_write(ops) {
            let err = LedgerError::from(e);
            if err.is_conflict() {
                warn!(patient_id = %episode.patient_id, to = %to_stage, "concurrent transition detected");
            }
            return Err(err);
        }

        info!(
            patient_id = %episode.patient_id,
            from = %episode.current_stage,
            to = %to_stage,
            closed_previous = open.is_some(),
            "stage transition"
        );
        self.reload(&episode.patient_id)
    }
}
