use serde::{Deserialize, Serialize};

/// Lifecycle of a course session. Stored as text in the `session` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NotStarted,
    InProgress,
    Completed,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "not_started",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Archived => "archived",
        }
    }

    /// Statuses whose completions the scheduled sync considers.
    pub fn default_sync_filter() -> Vec<SessionStatus> {
        vec![SessionStatus::InProgress, SessionStatus::Completed]
    }

    /// Widened filter used by the one-shot archived send.
    pub fn sync_filter_with_archived() -> Vec<SessionStatus> {
        vec![
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Archived,
        ]
    }
}

/// One course completion eligible for sync: strictly newer than the
/// session watermark, learner not deleted.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CompletionRow {
    pub session_id: i64,
    pub learner_id: i64,
    pub time_completed: i64,
}

/// Session joined with its training template, as needed for the wire payload.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SessionDetail {
    pub id: i64,
    pub course_shortname: String,
    pub fullname: String,
    pub start_date: i64,
    pub end_date: i64,
    pub training_shortname: String,
    pub training_name: String,
    pub training_id_sirh: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Learner {
    pub id: i64,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
    pub main_entity: Option<String>,
}

/// SIRH binding for one session, annotated with the enrolled learner ids.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SirhLink {
    pub id: i64,
    pub session_id: i64,
    pub sirh_code: String,
    pub sirh_training: String,
    pub sirh_session: String,
    pub learner_ids: Vec<i64>,
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
pub struct InstanceInfo {
    pub id: i64,
    pub session_id: i64,
    pub course_shortname: String,
    pub sirh_code: String,
    pub sirh_training: String,
    pub sirh_session: String,
    pub enrolled: i64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EnrolReq {
    pub instance_id: i64,
    pub learner_id: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct EnrolResp {
    pub status: bool,
    pub already_enrolled: bool,
}
