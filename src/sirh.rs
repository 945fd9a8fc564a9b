use std::time::Duration;

use anyhow::Context;
use http::StatusCode;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::payload::{FollowUpPayload, UserEntry};

/// Maximum user entries per API call.
pub const CHUNK_SIZE: usize = 100;

const FOLLOW_UP_PATH: &str = "v1/followUpSession";

/// Aggregate result of transmitting one session's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    PartialFailure,
    Failure,
}

impl SessionOutcome {
    /// Only a fully clean session may have its watermark advanced.
    pub fn is_clean(&self) -> bool {
        matches!(self, SessionOutcome::Success)
    }

    pub fn from_counts(sent: usize, failed: usize) -> SessionOutcome {
        match (sent, failed) {
            (_, 0) => SessionOutcome::Success,
            (0, _) => SessionOutcome::Failure,
            _ => SessionOutcome::PartialFailure,
        }
    }
}

/// Why one chunk did not go through.
#[derive(Error, Debug)]
pub enum ChunkFailure {
    #[error("transport error: {0}")]
    Transmission(#[from] reqwest::Error),
    #[error("endpoint rejected the chunk (status {status})")]
    Rejection {
        status: String,
        field_errors: Vec<(String, String)>,
        raw: Option<String>,
    },
}

/// Verdict on a single HTTP response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Rejected {
        status: String,
        field_errors: Vec<(String, String)>,
        raw: Option<String>,
    },
}

/// A success is the sentinel body `true` on a 2xx response. Anything else is
/// a rejection; the endpoint may carry a business status code and an
/// `erreurs` field -> message mapping.
pub fn classify_response(http_status: StatusCode, body: &Value) -> Verdict {
    if http_status.is_success() && *body == Value::Bool(true) {
        return Verdict::Success;
    }

    // A string status goes into the log bare, not with JSON quotes.
    let status = body
        .get("status")
        .map(|s| s.as_str().map(str::to_owned).unwrap_or_else(|| s.to_string()))
        .unwrap_or_else(|| http_status.as_u16().to_string());

    match body.get("erreurs").and_then(Value::as_object) {
        Some(errors) => Verdict::Rejected {
            status,
            field_errors: errors
                .iter()
                .map(|(field, msg)| {
                    (
                        field.clone(),
                        msg.as_str().map(str::to_owned).unwrap_or_else(|| msg.to_string()),
                    )
                })
                .collect(),
            raw: None,
        },
        None => Verdict::Rejected {
            status,
            field_errors: Vec::new(),
            raw: Some(body.to_string()),
        },
    }
}

/// Client for the SIRH follow-up endpoint.
#[derive(Clone, Debug)]
pub struct SirhClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl SirhClient {
    /// Endpoint configuration from `SIRH_API_URL` / `SIRH_API_TOKEN`.
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("SIRH_API_URL").context("SIRH_API_URL not set")?;
        Self::new(base_url, std::env::var("SIRH_API_TOKEN").ok())
    }

    pub fn new(base_url: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn follow_up_url(&self) -> String {
        format!("{}{}", self.base_url, FOLLOW_UP_PATH)
    }

    /// Transmit one session's payload in chunks of at most [`CHUNK_SIZE`]
    /// user entries. Every chunk is an independent call; a failed chunk never
    /// stops the remaining ones.
    pub async fn follow_up_session(
        &self,
        session_id: i64,
        payload: &FollowUpPayload,
    ) -> SessionOutcome {
        let mut sent = 0;
        let mut failed = 0;

        for chunk in user_chunks(&payload.utilisateurs) {
            let part = FollowUpPayload {
                session: payload.session.clone(),
                utilisateurs: chunk.to_vec(),
            };
            match self.send_chunk(&part).await {
                Ok(()) => sent += 1,
                Err(failure) => {
                    failed += 1;
                    log_failure(session_id, &self.follow_up_url(), &part, &failure);
                }
            }
        }

        SessionOutcome::from_counts(sent, failed)
    }

    async fn send_chunk(&self, part: &FollowUpPayload) -> Result<(), ChunkFailure> {
        let mut req = self.http.post(self.follow_up_url()).json(part);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let http_status = resp.status();
        let text = resp.text().await?;
        // A body that is not JSON still has to show up verbatim in the log.
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        match classify_response(http_status, &body) {
            Verdict::Success => Ok(()),
            Verdict::Rejected {
                status,
                field_errors,
                raw,
            } => Err(ChunkFailure::Rejection {
                status,
                field_errors,
                raw,
            }),
        }
    }
}

/// Immutable ≤[`CHUNK_SIZE`] slices over the full user list. An empty list
/// still yields one (empty) chunk, matching the final-bundle send.
pub fn user_chunks(entries: &[UserEntry]) -> Vec<&[UserEntry]> {
    if entries.is_empty() {
        return vec![entries];
    }
    entries.chunks(CHUNK_SIZE).collect()
}

fn log_failure(session_id: i64, url: &str, part: &FollowUpPayload, failure: &ChunkFailure) {
    let data = serde_json::to_string_pretty(part).unwrap_or_default();
    match failure {
        ChunkFailure::Transmission(err) => {
            tracing::error!(session_id, url, error = %err, %data, "follow-up chunk unreachable");
        }
        ChunkFailure::Rejection {
            status,
            field_errors,
            raw,
        } => {
            if field_errors.is_empty() {
                let raw = raw.as_deref().unwrap_or("");
                tracing::error!(session_id, url, %status, %data, raw, "follow-up chunk rejected");
            } else {
                tracing::error!(session_id, url, %status, %data, "follow-up chunk rejected");
                for (field, message) in field_errors {
                    tracing::error!(session_id, %field, %message, "field error");
                }
            }
        }
    }
}
