use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::db::Db;
use crate::models::{CompletionRow, InstanceInfo, Learner, SessionDetail, SessionStatus, SirhLink};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("session {0} does not exist")]
    SessionNotFound(i64),
    #[error("learner {0} does not exist")]
    LearnerNotFound(i64),
    #[error("sirh instance {0} does not exist")]
    InstanceNotFound(i64),
}

/// What the payload builder and the sync task need from the completion
/// store. `Store` is the Postgres implementation; tests substitute an
/// in-memory one.
#[async_trait]
pub trait FollowUpStore {
    /// All completions newer than their session's watermark, for sessions in
    /// the given status set, excluding deleted learners.
    async fn pending_completions(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<CompletionRow>, StorageError>;

    /// All SIRH bindings with their enrolled learner ids.
    async fn sirh_links(&self) -> Result<Vec<SirhLink>, StorageError>;

    async fn session_detail(&self, session_id: i64) -> Result<SessionDetail, StorageError>;

    async fn learner(&self, learner_id: i64) -> Result<Learner, StorageError>;

    /// SIRH codes for one organizational entity; empty when the entity is
    /// unknown.
    async fn entity_sirh_codes(&self, entity: &str) -> Result<Vec<String>, StorageError>;

    async fn watermark(&self, session_id: i64) -> Result<Option<i64>, StorageError>;

    /// Single-row watermark update; the caller guarantees monotonicity.
    async fn set_watermark(&self, session_id: i64, ts: i64) -> Result<(), StorageError>;
}

/// Query handle over the completion store. Explicitly constructed and passed
/// around; cheap to clone (wraps the pool).
#[derive(Clone)]
pub struct Store {
    db: Db,
}

#[async_trait]
impl FollowUpStore for Store {
    async fn pending_completions(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<CompletionRow>, StorageError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, CompletionRow>(
            r#"
            SELECT cc.session_id, cc.learner_id, cc.time_completed
            FROM course_completion cc
            JOIN session s ON s.id = cc.session_id
            JOIN learner l ON l.id = cc.learner_id
            WHERE s.status = ANY($1)
                AND cc.time_completed IS NOT NULL
                AND (s.last_sync_sirh IS NULL OR s.last_sync_sirh < cc.time_completed)
                AND NOT l.deleted
            ORDER BY cc.session_id, cc.learner_id
            "#,
        )
        .bind(&statuses)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn sirh_links(&self) -> Result<Vec<SirhLink>, StorageError> {
        let rows = sqlx::query_as::<_, SirhLink>(
            r#"
            SELECT
                i.id, i.session_id, i.sirh_code, i.sirh_training, i.sirh_session,
                COALESCE(
                    array_agg(e.learner_id) FILTER (WHERE e.learner_id IS NOT NULL),
                    '{}'
                ) AS learner_ids
            FROM sirh_instance i
            LEFT JOIN sirh_enrolment e ON e.instance_id = i.id
            GROUP BY i.id
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn session_detail(&self, session_id: i64) -> Result<SessionDetail, StorageError> {
        sqlx::query_as::<_, SessionDetail>(
            r#"
            SELECT
                s.id, s.course_shortname, s.fullname, s.start_date, s.end_date,
                t.shortname AS training_shortname,
                t.name AS training_name,
                t.id_sirh AS training_id_sirh
            FROM session s
            JOIN training t ON t.id = s.training_id
            WHERE s.id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StorageError::SessionNotFound(session_id))
    }

    async fn learner(&self, learner_id: i64) -> Result<Learner, StorageError> {
        sqlx::query_as::<_, Learner>(
            "SELECT id, email, firstname, lastname, main_entity FROM learner WHERE id = $1",
        )
        .bind(learner_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StorageError::LearnerNotFound(learner_id))
    }

    async fn entity_sirh_codes(&self, entity: &str) -> Result<Vec<String>, StorageError> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT sirh_code FROM entity_sirh WHERE entity = $1 ORDER BY sirh_code",
        )
        .bind(entity)
        .fetch_all(&self.db)
        .await?;
        Ok(codes)
    }

    async fn watermark(&self, session_id: i64) -> Result<Option<i64>, StorageError> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT last_sync_sirh FROM session WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(StorageError::SessionNotFound(session_id))
    }

    async fn set_watermark(&self, session_id: i64, ts: i64) -> Result<(), StorageError> {
        let done = sqlx::query("UPDATE session SET last_sync_sirh = $2 WHERE id = $1")
            .bind(session_id)
            .bind(ts)
            .execute(&self.db)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound(session_id));
        }
        Ok(())
    }
}

impl Store {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn instance_info(&self, instance_id: i64) -> Result<InstanceInfo, StorageError> {
        sqlx::query_as::<_, InstanceInfo>(
            r#"
            SELECT
                i.id, i.session_id, s.course_shortname,
                i.sirh_code, i.sirh_training, i.sirh_session,
                (SELECT count(*) FROM sirh_enrolment e WHERE e.instance_id = i.id) AS enrolled
            FROM sirh_instance i
            JOIN session s ON s.id = i.session_id
            WHERE i.id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StorageError::InstanceNotFound(instance_id))
    }

    /// Enrol a learner into a SIRH instance. Already-enrolled is a no-op;
    /// returns false in that case.
    pub async fn enrol_learner(
        &self,
        instance_id: i64,
        learner_id: i64,
    ) -> Result<bool, StorageError> {
        let instance_exists =
            sqlx::query("SELECT 1 FROM sirh_instance WHERE id = $1")
                .bind(instance_id)
                .fetch_optional(&self.db)
                .await?;
        if instance_exists.is_none() {
            return Err(StorageError::InstanceNotFound(instance_id));
        }

        let learner_exists =
            sqlx::query("SELECT 1 FROM learner WHERE id = $1 AND NOT deleted")
                .bind(learner_id)
                .fetch_optional(&self.db)
                .await?;
        if learner_exists.is_none() {
            return Err(StorageError::LearnerNotFound(learner_id));
        }

        let done = sqlx::query(
            r#"
            INSERT INTO sirh_enrolment (instance_id, learner_id, time_created)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id, learner_id) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(learner_id)
        .bind(Utc::now().timestamp())
        .execute(&self.db)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}
