use std::collections::{BTreeMap, HashMap};

use chrono::DateTime;
use serde::Serialize;

use crate::models::{CompletionRow, SirhLink};
use crate::store::{FollowUpStore, StorageError};

/// session id -> learner id -> completion timestamp. Ordered so a run
/// processes sessions and learners deterministically.
pub type CompletionsBySession = BTreeMap<i64, BTreeMap<i64, i64>>;

// The structs below are the one place that knows the literal external field
// names (including the key with embedded spaces). Everything else in the
// crate uses the semantic Rust names.

#[derive(Serialize, Debug, Clone)]
pub struct FollowUpPayload {
    #[serde(rename = "sessionMentor")]
    pub session: SessionBlock,
    pub utilisateurs: Vec<UserEntry>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionBlock {
    #[serde(rename = "identifiantSessionMentor")]
    pub session_id: i64,
    #[serde(rename = "nomAbregeFormation")]
    pub training_shortname: String,
    #[serde(rename = "nomAbregeSession")]
    pub session_shortname: String,
    #[serde(rename = "libelleFormation")]
    pub training_name: String,
    #[serde(rename = "libelleSession")]
    pub session_name: String,
    #[serde(rename = "identifiantSirhOrigineFormation")]
    pub training_sirh_id: Option<String>,
    #[serde(rename = "dateDebut")]
    pub start_date: String,
    #[serde(rename = "dateFin")]
    pub end_date: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct UserEntry {
    #[serde(rename = "Suivi session utilisateur")]
    pub follow_up: FollowUp,
    pub email: String,
    #[serde(rename = "nom")]
    pub lastname: String,
    #[serde(rename = "prenom")]
    pub firstname: String,
    #[serde(rename = "listeSIRHUtilisateur")]
    pub sirh_codes: Vec<SirhCode>,
}

#[derive(Serialize, Debug, Clone)]
pub struct FollowUp {
    #[serde(rename = "dateAchevement")]
    pub completed_on: String,
    #[serde(rename = "identifiantSirhOrigine")]
    pub sirh_origin: Option<String>,
    #[serde(rename = "identifiantFormation")]
    pub sirh_training: Option<String>,
    #[serde(rename = "identifiantSession")]
    pub sirh_session: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SirhCode {
    #[serde(rename = "identifiantSIRH")]
    pub code: String,
}

/// One session's payload plus what the sync task needs to advance the
/// watermark after a clean transmission.
#[derive(Debug, Clone)]
pub struct SessionSync {
    pub session_id: i64,
    pub newest_completion: i64,
    pub payload: FollowUpPayload,
}

/// Nest flat completion rows into the per-session, per-learner mapping.
pub fn group_completions(rows: Vec<CompletionRow>) -> CompletionsBySession {
    let mut grouped = CompletionsBySession::new();
    for row in rows {
        grouped
            .entry(row.session_id)
            .or_default()
            .insert(row.learner_id, row.time_completed);
    }
    grouped
}

/// Epoch seconds to the external `YYYY-MM-DD` form.
pub fn format_day(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// The SIRH identifier triple for one learner: the link's values when the
/// session has a link and the learner is enrolled in it, null otherwise.
pub fn sirh_triple(
    link: Option<&SirhLink>,
    learner_id: i64,
) -> (Option<String>, Option<String>, Option<String>) {
    match link {
        Some(link) if link.learner_ids.contains(&learner_id) => (
            Some(link.sirh_code.clone()),
            Some(link.sirh_training.clone()),
            Some(link.sirh_session.clone()),
        ),
        _ => (None, None, None),
    }
}

/// Build one wire payload per session. Learner and entity lookups are cached
/// for the duration of the call since a learner may appear in several
/// sessions and entity -> codes is invariant within a run.
pub async fn build_payloads<S: FollowUpStore + Sync>(
    store: &S,
    completions: &CompletionsBySession,
) -> Result<Vec<SessionSync>, StorageError> {
    let mut learners = HashMap::new();
    let mut codes_by_entity: HashMap<String, Vec<SirhCode>> = HashMap::new();

    // One batch query for every link, indexed by session.
    let links: HashMap<i64, SirhLink> = store
        .sirh_links()
        .await?
        .into_iter()
        .map(|link| (link.session_id, link))
        .collect();

    let mut out = Vec::with_capacity(completions.len());

    for (&session_id, by_learner) in completions {
        let detail = store.session_detail(session_id).await?;
        let link = links.get(&session_id);

        let session = SessionBlock {
            session_id: detail.id,
            training_shortname: detail.training_shortname,
            session_shortname: detail.course_shortname,
            training_name: detail.training_name,
            session_name: detail.fullname,
            training_sirh_id: detail.training_id_sirh,
            start_date: format_day(detail.start_date),
            end_date: format_day(detail.end_date),
        };

        let mut utilisateurs = Vec::with_capacity(by_learner.len());
        let mut newest = 0;

        for (&learner_id, &time_completed) in by_learner {
            newest = newest.max(time_completed);
            let (sirh_origin, sirh_training, sirh_session) = sirh_triple(link, learner_id);

            if !learners.contains_key(&learner_id) {
                learners.insert(learner_id, store.learner(learner_id).await?);
            }
            let learner = &learners[&learner_id];

            let entity = learner.main_entity.clone().unwrap_or_default();
            if !codes_by_entity.contains_key(&entity) {
                let codes = if entity.is_empty() {
                    Vec::new()
                } else {
                    store.entity_sirh_codes(&entity).await?
                };
                codes_by_entity.insert(
                    entity.clone(),
                    codes.into_iter().map(|code| SirhCode { code }).collect(),
                );
            }

            utilisateurs.push(UserEntry {
                follow_up: FollowUp {
                    completed_on: format_day(time_completed),
                    sirh_origin,
                    sirh_training,
                    sirh_session,
                },
                email: learner.email.clone(),
                lastname: learner.lastname.clone(),
                firstname: learner.firstname.clone(),
                sirh_codes: codes_by_entity[&entity].clone(),
            });
        }

        out.push(SessionSync {
            session_id,
            newest_completion: newest,
            payload: FollowUpPayload {
                session,
                utilisateurs,
            },
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(session_id: i64, learner_ids: Vec<i64>) -> SirhLink {
        SirhLink {
            id: 1,
            session_id,
            sirh_code: "RENOIRH".into(),
            sirh_training: "F-042".into(),
            sirh_session: "S-007".into(),
            learner_ids,
        }
    }

    #[test]
    fn grouping_nests_rows_by_session_then_learner() {
        let rows = vec![
            CompletionRow { session_id: 10, learner_id: 5, time_completed: 2000 },
            CompletionRow { session_id: 10, learner_id: 6, time_completed: 3000 },
            CompletionRow { session_id: 11, learner_id: 5, time_completed: 4000 },
        ];
        let grouped = group_completions(rows);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&10][&5], 2000);
        assert_eq!(grouped[&10][&6], 3000);
        assert_eq!(grouped[&11][&5], 4000);
    }

    #[test]
    fn epoch_formats_as_calendar_day() {
        assert_eq!(format_day(0), "1970-01-01");
        assert_eq!(format_day(86_400), "1970-01-02");
        assert_eq!(format_day(1_650_000_000), "2022-04-15");
    }

    #[test]
    fn enrolled_learner_gets_the_link_triple() {
        let link = link(10, vec![5, 6]);
        let (origin, training, session) = sirh_triple(Some(&link), 5);
        assert_eq!(origin.as_deref(), Some("RENOIRH"));
        assert_eq!(training.as_deref(), Some("F-042"));
        assert_eq!(session.as_deref(), Some("S-007"));
    }

    #[test]
    fn unenrolled_learner_gets_nulls() {
        let link = link(10, vec![5, 6]);
        assert_eq!(sirh_triple(Some(&link), 7), (None, None, None));
        assert_eq!(sirh_triple(None, 5), (None, None, None));
    }

    #[test]
    fn wire_schema_uses_the_external_field_names() {
        let payload = FollowUpPayload {
            session: SessionBlock {
                session_id: 10,
                training_shortname: "TR".into(),
                session_shortname: "TR-2022-1".into(),
                training_name: "Training".into(),
                session_name: "Session one".into(),
                training_sirh_id: None,
                start_date: "2022-01-01".into(),
                end_date: "2022-06-30".into(),
            },
            utilisateurs: vec![UserEntry {
                follow_up: FollowUp {
                    completed_on: "2022-04-15".into(),
                    sirh_origin: None,
                    sirh_training: None,
                    sirh_session: None,
                },
                email: "a@b.fr".into(),
                lastname: "Doe".into(),
                firstname: "Jane".into(),
                sirh_codes: vec![SirhCode { code: "RENOIRH".into() }],
            }],
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["sessionMentor"]["identifiantSessionMentor"], 10);
        assert_eq!(value["sessionMentor"]["nomAbregeSession"], "TR-2022-1");
        assert!(value["sessionMentor"]["identifiantSirhOrigineFormation"].is_null());

        let user = &value["utilisateurs"][0];
        let follow_up = &user["Suivi session utilisateur"];
        assert_eq!(follow_up["dateAchevement"], "2022-04-15");
        assert!(follow_up["identifiantSirhOrigine"].is_null());
        assert!(follow_up["identifiantFormation"].is_null());
        assert!(follow_up["identifiantSession"].is_null());
        assert_eq!(user["nom"], "Doe");
        assert_eq!(user["prenom"], "Jane");
        assert_eq!(user["listeSIRHUtilisateur"][0]["identifiantSIRH"], "RENOIRH");
    }
}
