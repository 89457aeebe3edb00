mod common;

use common::{strategy, test_app_data, user, TestApp, MEMBER_EMAIL, MEMBER_ID};
use identity_service::models::{
    AppData, ChallengeType, Identity, Transport, User, UserData, MAX_VERIFY_ATTEMPTS,
};
use identity_service::services::challenge::code_challenge_for;
use serde_json::{json, Value};
use service_core::axum::http::StatusCode;

fn email_otp(value: &str) -> Value {
    json!({ "identity": "email", "challenge": "otp", "transport": "email", "value": value })
}

fn verify_body(value: &str, code: &str) -> Value {
    json!({
        "identity": "email",
        "challenge": "otp",
        "transport": "email",
        "value": value,
        "code": code,
    })
}

async fn request_email_code(app: &TestApp, email: &str) -> String {
    let response = app
        .post("/auth/challenge/request", None, email_otp(email))
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.body);
    app.last_email_data()["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn email_otp_logs_in_existing_user() {
    let app = TestApp::new().await;

    let response = app
        .post("/auth/challenge/request", None, email_otp(MEMBER_EMAIL))
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED);
    assert!(response.body["challenge_id"].as_str().is_some());
    assert_eq!(response.body["expires_mins"], 10);

    let sent = app.email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, MEMBER_EMAIL);
    let code = sent[0].data["code"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|c| c.is_ascii_digit()));

    let verified = app
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &code))
        .await;
    assert_eq!(verified.status, StatusCode::OK, "{}", verified.body);

    let access = verified.body["access_token"].as_str().unwrap();
    let token = app.controller().token_service().parse(access).unwrap();
    assert_eq!(token.claims.sub, MEMBER_ID);
}

#[tokio::test]
async fn solved_code_cannot_be_replayed() {
    let app = TestApp::new().await;
    let code = request_email_code(&app, MEMBER_EMAIL).await;

    let first = app
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &code))
        .await;
    assert_eq!(first.status, StatusCode::OK);

    let replay = app
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &code))
        .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn concurrent_verification_succeeds_once() {
    let app = TestApp::new().await;
    let code = request_email_code(&app, MEMBER_EMAIL).await;

    let (a, b) = tokio::join!(
        app.post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &code)),
        app.post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &code)),
    );

    let successes = [a.status, b.status]
        .iter()
        .filter(|s| **s == StatusCode::OK)
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn challenge_locks_after_failed_attempts() {
    let app = TestApp::new().await;
    let code = request_email_code(&app, MEMBER_EMAIL).await;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    for _ in 0..MAX_VERIFY_ATTEMPTS {
        let response = app
            .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, wrong))
            .await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["error"], "invalid credentials");
    }

    let locked = app
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &code))
        .await;
    assert_eq!(locked.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn newest_challenge_supersedes_older_one() {
    let app = TestApp::new().await;
    let first = request_email_code(&app, MEMBER_EMAIL).await;
    let second = request_email_code(&app, MEMBER_EMAIL).await;
    if first == second {
        return;
    }

    let stale = app
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &first))
        .await;
    assert_eq!(stale.status, StatusCode::UNAUTHORIZED);

    let fresh = app
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &second))
        .await;
    assert_eq!(fresh.status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_email_registers_passwordless_user() {
    let app = TestApp::new().await;
    let email = "newcomer@example.test";
    let code = request_email_code(&app, email).await;

    let verified = app
        .post("/auth/challenge/verify", None, verify_body(email, &code))
        .await;
    assert_eq!(verified.status, StatusCode::OK);

    let access = verified.body["access_token"].as_str().unwrap();
    let token = app.controller().token_service().parse(access).unwrap();
    assert!(!token.claims.sub.is_empty());
    assert!(!token.claims.sub.starts_with("pending:"));

    // The account now exists and is reused.
    let again = request_email_code(&app, email).await;
    let second = app
        .post("/auth/challenge/verify", None, verify_body(email, &again))
        .await;
    let token2 = app
        .controller()
        .token_service()
        .parse(second.body["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(token.claims.sub, token2.claims.sub);
}

#[tokio::test]
async fn forbidden_registration_rejects_unknown_identity() {
    let app = TestApp::with_app(AppData {
        registration_forbidden: true,
        ..test_app_data()
    })
    .await;

    let response = app
        .post("/auth/challenge/request", None, email_otp("stranger@example.test"))
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert!(app.email.sent().is_empty());
}

#[tokio::test]
async fn unsupported_strategy_is_rejected() {
    let app = TestApp::new().await;

    let response = app
        .post(
            "/auth/challenge/request",
            None,
            json!({
                "identity": "username",
                "challenge": "otp",
                "transport": "sms",
                "value": MEMBER_ID,
            }),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sms_otp_reaches_the_phone() {
    let app = TestApp::new().await;
    let phone = "+15550100";

    let response = app
        .post(
            "/auth/challenge/request",
            None,
            json!({ "identity": "phone", "challenge": "otp", "transport": "sms", "value": phone }),
        )
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.body);
    assert_eq!(response.body["expires_mins"], 5);

    let sent = app.sms.sent();
    assert_eq!(sent.len(), 1);
    let code = sent[0]
        .text
        .split(|c: char| !c.is_ascii_digit())
        .find(|run| run.len() == 6)
        .unwrap()
        .to_string();

    let verified = app
        .post(
            "/auth/challenge/verify",
            None,
            json!({
                "identity": "phone",
                "challenge": "otp",
                "transport": "sms",
                "value": phone,
                "code": code,
            }),
        )
        .await;
    assert_eq!(verified.status, StatusCode::OK, "{}", verified.body);
}

#[tokio::test]
async fn code_challenge_binds_verification_to_the_requester() {
    let app = TestApp::new().await;
    let verifier = "d2VsbC1rbm93bi12ZXJpZmllcg";

    let mut body = email_otp(MEMBER_EMAIL);
    body["code_challenge"] = json!(code_challenge_for(verifier));
    let response = app.post("/auth/challenge/request", None, body).await;
    assert_eq!(response.status, StatusCode::ACCEPTED);
    let code = app.last_email_data()["code"].as_str().unwrap().to_string();

    let unbound = app
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, &code))
        .await;
    assert_eq!(unbound.status, StatusCode::UNAUTHORIZED);

    let mut bound = verify_body(MEMBER_EMAIL, &code);
    bound["code_verifier"] = json!(verifier);
    let verified = app.post("/auth/challenge/verify", None, bound).await;
    assert_eq!(verified.status, StatusCode::OK);
}

#[tokio::test]
async fn magic_link_carries_the_code() {
    let app = TestApp::new().await;

    let response = app
        .post(
            "/auth/challenge/request",
            None,
            json!({
                "identity": "email",
                "challenge": "magic_link",
                "transport": "email",
                "value": MEMBER_EMAIL,
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED);

    let link = app.last_email_data()["link"].as_str().unwrap().to_string();
    let url = reqwest::Url::parse(&link).unwrap();
    assert_eq!(url.path(), "/login");
    let code = url
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert_eq!(code.len(), 32);

    let verified = app
        .post(
            "/auth/challenge/verify",
            None,
            json!({
                "identity": "email",
                "challenge": "magic_link",
                "transport": "email",
                "value": MEMBER_EMAIL,
                "code": code,
            }),
        )
        .await;
    assert_eq!(verified.status, StatusCode::OK);
}

#[tokio::test]
async fn debug_code_only_works_when_app_allows_it() {
    let data = UserData {
        debug_otp_code: Some("424242".to_string()),
        ..Default::default()
    };

    let strict = TestApp::new().await;
    strict
        .store
        .insert_user(user(MEMBER_ID, MEMBER_EMAIL), data.clone())
        .unwrap();
    let rejected = strict
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, "424242"))
        .await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);

    let lenient = TestApp::with_app(AppData {
        debug_otp_code_allowed: true,
        ..test_app_data()
    })
    .await;
    lenient
        .store
        .insert_user(user(MEMBER_ID, MEMBER_EMAIL), data)
        .unwrap();
    let accepted = lenient
        .post("/auth/challenge/verify", None, verify_body(MEMBER_EMAIL, "424242"))
        .await;
    assert_eq!(accepted.status, StatusCode::OK);
}

#[tokio::test]
async fn pending_email_is_matched_without_case() {
    let app = TestApp::new().await;
    let code = request_email_code(&app, "Newcomer@Example.test").await;

    let verified = app
        .post("/auth/challenge/verify", None, verify_body("newcomer@example.test", &code))
        .await;
    assert_eq!(verified.status, StatusCode::OK, "{}", verified.body);
}

fn email_by_sms_app() -> AppData {
    AppData {
        auth_strategies: vec![strategy(Identity::Email, ChallengeType::Otp, Transport::Sms)],
        ..test_app_data()
    }
}

fn email_by_sms(value: &str) -> Value {
    json!({ "identity": "email", "challenge": "otp", "transport": "sms", "value": value })
}

#[tokio::test]
async fn sms_code_is_never_sent_to_an_email_address() {
    let app = TestApp::with_app(email_by_sms_app()).await;

    let response = app
        .post("/auth/challenge/request", None, email_by_sms("new@x.test"))
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST, "{}", response.body);
    assert!(app.sms.sent().is_empty());
    assert_eq!(app.store.challenge_count().unwrap(), 0);
}

#[tokio::test]
async fn sms_code_goes_to_the_stored_phone() {
    let app = TestApp::with_app(email_by_sms_app()).await;
    app.store
        .insert_user(
            User {
                phone_number: "+61450111222".to_string(),
                ..user("u-phone", "phone@x.test")
            },
            UserData::default(),
        )
        .unwrap();

    let response = app
        .post("/auth/challenge/request", None, email_by_sms("phone@x.test"))
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.body);

    let sent = app.sms.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].phone_number, "+61450111222");

    // A member without a phone has nowhere to receive the code.
    let missing = app
        .post("/auth/challenge/request", None, email_by_sms(MEMBER_EMAIL))
        .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.sms.sent().len(), 1);
}
