use super::*;

use axum::extract::State;
use axum::Json;
use meetpoint_core::{AuthProvider, UserId};

use crate::server::{
    auth::{hash_password, hash_reset_token, now_unix, verify_password},
    core::{AppState, UserRecord},
    db::default_role_id,
    errors::ApiFailure,
    handlers::auth::reset_password,
    types::ResetPasswordRequest,
};

#[tokio::test]
async fn register_login_and_me_round_trip() {
    let app = test_app();
    let session = register_and_login_as(&app, "alice@example.com", "Alice").await;

    let (status, payload) = json_request(
        &app,
        "GET",
        String::from("/api/auth/me"),
        Some(&session.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payload = payload.unwrap();
    assert_eq!(payload["email"], "alice@example.com");
    assert_eq!(payload["display_name"], "Alice");
    assert_eq!(payload["auth_provider"], "local");
}

#[tokio::test]
async fn register_existing_email_returns_the_same_accepted_response() {
    let app = test_app();
    register_and_login_as(&app, "taken@example.com", "First").await;

    let (status, payload) = json_request(
        &app,
        "POST",
        String::from("/api/auth/register"),
        None,
        Some(json!({
            "email": "taken@example.com",
            "password": "another-password",
            "display_name": "Second",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload.unwrap()["accepted"], true);

    // The original credentials still work.
    let (login_status, _) = json_request(
        &app,
        "POST",
        String::from("/api/auth/login"),
        None,
        Some(json!({"email": "taken@example.com", "password": "super-secure-password"})),
    )
    .await;
    assert_eq!(login_status, StatusCode::OK);
}

#[tokio::test]
async fn login_failures_are_indistinguishable() {
    let app = test_app();
    register_and_login_as(&app, "bob@example.com", "Bob").await;

    let (wrong_password, wrong_payload) = json_request(
        &app,
        "POST",
        String::from("/api/auth/login"),
        None,
        Some(json!({"email": "bob@example.com", "password": "not-the-password"})),
    )
    .await;
    let (unknown_email, unknown_payload) = json_request(
        &app,
        "POST",
        String::from("/api/auth/login"),
        None,
        Some(json!({"email": "nobody@example.com", "password": "not-the-password"})),
    )
    .await;
    assert_eq!(wrong_password, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_email, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_payload, unknown_payload);
}

#[tokio::test]
async fn repeated_login_failures_lock_the_account() {
    let app = test_app();
    register_and_login_as(&app, "locked@example.com", "Locky").await;

    for _ in 0..5 {
        let (status, _) = json_request(
            &app,
            "POST",
            String::from("/api/auth/login"),
            None,
            Some(json!({"email": "locked@example.com", "password": "wrong-password"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // Correct password is rejected while the lock is active.
    let (status, _) = json_request(
        &app,
        "POST",
        String::from("/api/auth/login"),
        None,
        Some(json!({"email": "locked@example.com", "password": "super-secure-password"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn forgot_password_does_not_reveal_whether_the_account_exists() {
    let app = test_app();
    register_and_login_as(&app, "known@example.com", "Known").await;

    for email in ["known@example.com", "unknown@example.com"] {
        let (status, payload) = json_request(
            &app,
            "POST",
            String::from("/api/auth/forgot-password"),
            None,
            Some(json!({"email": email})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.unwrap()["accepted"], true);
    }
}

fn seeded_reset_user(token: &str) -> UserRecord {
    UserRecord {
        user_id: UserId::new(),
        email: String::from("resetter@example.com"),
        auth_provider: AuthProvider::Local,
        provider_id: None,
        display_name: String::from("Resetter"),
        avatar_url: None,
        birth_date_unix: None,
        gender: None,
        password_hash: Some(hash_password("old-password-123").unwrap()),
        role_id: Some(default_role_id().to_owned()),
        is_active: true,
        is_blocked: false,
        reset_token_hash: Some(hash_reset_token(token)),
        reset_token_expires_unix: Some(now_unix() + 600),
        failed_logins: 0,
        locked_until_unix: None,
        created_at_unix: now_unix(),
    }
}

#[tokio::test]
async fn reset_token_is_valid_exactly_once() {
    let state = AppState::new(&test_config()).unwrap();
    let token = "ab".repeat(32);
    let user = seeded_reset_user(&token);
    let user_id = user.user_id.to_string();
    state.users.write().await.insert(user_id.clone(), user);

    let first = reset_password(
        State(state.clone()),
        Json(ResetPasswordRequest {
            token: token.clone(),
            new_password: String::from("brand-new-password"),
        }),
    )
    .await;
    assert!(first.is_ok());

    let second = reset_password(
        State(state.clone()),
        Json(ResetPasswordRequest {
            token: token.clone(),
            new_password: String::from("yet-another-password"),
        }),
    )
    .await;
    assert!(matches!(second, Err(ApiFailure::Unauthorized)));

    let users = state.users.read().await;
    let stored = users.get(&user_id).unwrap();
    assert!(stored.reset_token_hash.is_none());
    assert!(verify_password(
        stored.password_hash.as_deref().unwrap(),
        "brand-new-password"
    ));
}

#[tokio::test]
async fn expired_reset_token_is_rejected() {
    let state = AppState::new(&test_config()).unwrap();
    let token = "cd".repeat(32);
    let mut user = seeded_reset_user(&token);
    user.reset_token_expires_unix = Some(now_unix() - 1);
    state
        .users
        .write()
        .await
        .insert(user.user_id.to_string(), user);

    let result = reset_password(
        State(state),
        Json(ResetPasswordRequest {
            token,
            new_password: String::from("brand-new-password"),
        }),
    )
    .await;
    assert!(matches!(result, Err(ApiFailure::Unauthorized)));
}

#[tokio::test]
async fn oauth_callbacks_validate_the_provider() {
    let app = test_app();

    // Unknown provider name.
    let (status, _) = json_request(
        &app,
        "GET",
        String::from("/api/auth/github/callback?code=abc"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The local provider has no oauth flow.
    let (status, _) = json_request(
        &app,
        "GET",
        String::from("/api/auth/local/callback?code=abc"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Valid provider without configured credentials fails generically.
    let (status, payload) = json_request(
        &app,
        "GET",
        String::from("/api/auth/google/callback?code=abc"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload.unwrap()["error"], "oauth_failed");

    // Mobile callback requires a configured redirect scheme.
    let (status, _) = json_request(
        &app,
        "GET",
        String::from("/api/auth/google/callback/mobile?code=abc"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let app = test_app();
    for uri in ["/api/auth/me", "/api/friends", "/api/events", "/api/chats"] {
        let (status, _) = json_request(&app, "GET", String::from(uri), None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "uri: {uri}");
    }
}
