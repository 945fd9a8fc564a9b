use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::models::SessionStatus;
use crate::payload;
use crate::sirh::SirhClient;
use crate::store::{FollowUpStore, StorageError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(
        "follow-up run reported failures ({failed} of {sessions} sessions)",
        failed = .0.failed_sessions,
        sessions = .0.sessions
    )]
    RunFailed(RunReport),
}

/// What one run did, for the caller (scheduler loop, CLI, HTTP trigger).
#[derive(Serialize, Debug, Clone, Default)]
pub struct RunReport {
    pub run_id: Option<Uuid>,
    pub sessions: usize,
    pub entries: usize,
    pub clean_sessions: usize,
    pub failed_sessions: usize,
    pub any_failure: bool,
}

/// One pass of the completion follow-up sync:
/// fetch candidates, build payloads, transmit, advance watermarks.
pub struct SyncTask<S> {
    store: S,
    client: SirhClient,
    statuses: Vec<SessionStatus>,
    fail_on_error: bool,
}

impl<S: FollowUpStore + Sync> SyncTask<S> {
    /// `fail_on_error` decides whether a run with remote failures is reported
    /// as failed to the caller or merely logged.
    pub fn new(
        store: S,
        client: SirhClient,
        statuses: Vec<SessionStatus>,
        fail_on_error: bool,
    ) -> Self {
        Self {
            store,
            client,
            statuses,
            fail_on_error,
        }
    }

    /// Execute one run. Storage errors abort the run; transmission failures
    /// are per-session and never block other sessions' watermarks.
    pub async fn run(&self) -> Result<RunReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sirh_followup", %run_id);
        self.run_once(run_id).instrument(span).await
    }

    async fn run_once(&self, run_id: Uuid) -> Result<RunReport, SyncError> {
        let rows = self.store.pending_completions(&self.statuses).await?;
        let grouped = payload::group_completions(rows);
        let batches = payload::build_payloads(&self.store, &grouped).await?;

        let mut report = RunReport {
            run_id: Some(run_id),
            sessions: batches.len(),
            ..RunReport::default()
        };

        for batch in &batches {
            report.entries += batch.payload.utilisateurs.len();
            let outcome = self
                .client
                .follow_up_session(batch.session_id, &batch.payload)
                .await;

            if outcome.is_clean() {
                // Advance immediately, so a later session's failure cannot
                // undo this one's progress.
                let prior = self.store.watermark(batch.session_id).await?;
                let target = watermark_target(prior, batch.newest_completion);
                self.store.set_watermark(batch.session_id, target).await?;
                report.clean_sessions += 1;
                tracing::info!(
                    session_id = batch.session_id,
                    entries = batch.payload.utilisateurs.len(),
                    watermark = target,
                    "session synced"
                );
            } else {
                report.failed_sessions += 1;
                report.any_failure = true;
            }
        }

        if self.fail_on_error && report.any_failure {
            return Err(SyncError::RunFailed(report));
        }

        tracing::info!(
            sessions = report.sessions,
            entries = report.entries,
            failed = report.failed_sessions,
            "follow-up run complete"
        );
        Ok(report)
    }
}

/// The watermark is a monotonic high-water mark; never move it backward.
pub fn watermark_target(prior: Option<i64>, newest_completion: i64) -> i64 {
    match prior {
        Some(prior) => prior.max(newest_completion),
        None => newest_completion,
    }
}
