use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sirh_followup::payload::{FollowUp, FollowUpPayload, SessionBlock, UserEntry};
use sirh_followup::sirh::{SessionOutcome, SirhClient};

fn session_block(session_id: i64) -> SessionBlock {
    SessionBlock {
        session_id,
        training_shortname: "TR".into(),
        session_shortname: "TR-2022-1".into(),
        training_name: "Training".into(),
        session_name: "Session one".into(),
        training_sirh_id: Some("F-042".into()),
        start_date: "2022-01-01".into(),
        end_date: "2022-06-30".into(),
    }
}

fn entries(n: usize) -> Vec<UserEntry> {
    (0..n)
        .map(|i| UserEntry {
            follow_up: FollowUp {
                completed_on: "2022-04-15".into(),
                sirh_origin: None,
                sirh_training: None,
                sirh_session: None,
            },
            email: format!("user{i}@example.fr"),
            lastname: "Doe".into(),
            firstname: "Jane".into(),
            sirh_codes: Vec::new(),
        })
        .collect()
}

fn payload(session_id: i64, users: usize) -> FollowUpPayload {
    FollowUpPayload {
        session: session_block(session_id),
        utilisateurs: entries(users),
    }
}

#[tokio::test]
async fn large_session_is_sent_in_ordered_hundred_entry_chunks() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/followUpSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(3)
        .mount(&server)
        .await;

    let client = SirhClient::new(server.uri(), None).unwrap();
    let outcome = client.follow_up_session(10, &payload(10, 250)).await;
    assert_eq!(outcome, SessionOutcome::Success);

    let requests = server.received_requests().await.unwrap();
    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    for req in &requests {
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["sessionMentor"]["identifiantSessionMentor"], 10);
        let users = body["utilisateurs"].as_array().unwrap();
        sizes.push(users.len());
        for user in users {
            seen.push(user["email"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(sizes, vec![100, 100, 50]);

    // Chunks are disjoint, ordered, and cover the whole user list.
    let expected: Vec<String> = (0..250).map(|i| format!("user{i}@example.fr")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn bearer_token_is_attached_when_configured() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/followUpSession"))
        .and(wiremock::matchers::header("Authorization", "Bearer sirh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    let client = SirhClient::new(server.uri(), Some("sirh-token".into())).unwrap();
    let outcome = client.follow_up_session(10, &payload(10, 1)).await;
    assert_eq!(outcome, SessionOutcome::Success);
}

#[tokio::test]
async fn business_rejection_marks_the_session_failed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/followUpSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 400,
            "erreurs": {"email": "format invalide"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = SirhClient::new(server.uri(), None).unwrap();
    let outcome = client.follow_up_session(10, &payload(10, 2)).await;
    assert_eq!(outcome, SessionOutcome::Failure);
}

#[tokio::test]
async fn one_bad_chunk_yields_a_partial_failure() {
    let server = MockServer::start().await;

    // First chunk rejected, second accepted.
    Mock::given(method("POST"))
        .and(path("/v1/followUpSession"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/followUpSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    let client = SirhClient::new(server.uri(), None).unwrap();
    let outcome = client.follow_up_session(10, &payload(10, 150)).await;
    assert_eq!(outcome, SessionOutcome::PartialFailure);
    assert!(!outcome.is_clean());
}

#[tokio::test]
async fn unreachable_endpoint_is_a_failure_not_a_panic() {
    // Nothing listens here.
    let client = SirhClient::new("http://127.0.0.1:9", None).unwrap();
    let outcome = client.follow_up_session(10, &payload(10, 1)).await;
    assert_eq!(outcome, SessionOutcome::Failure);
}

#[tokio::test]
async fn session_without_entries_is_still_announced_once() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/followUpSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    let client = SirhClient::new(server.uri(), None).unwrap();
    let outcome = client.follow_up_session(10, &payload(10, 0)).await;
    assert_eq!(outcome, SessionOutcome::Success);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["utilisateurs"].as_array().unwrap().len(), 0);
}
