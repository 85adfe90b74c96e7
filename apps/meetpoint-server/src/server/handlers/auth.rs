use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Redirect,
    Json,
};
use meetpoint_core::{AuthProvider, DisplayName, Email, Gender, UserId};

use crate::server::{
    auth::{
        authenticate, enforce_auth_route_rate_limit, hash_password, hash_reset_token,
        issue_session_token, mint_reset_token, now_unix, validate_password, verify_password,
    },
    core::{AppState, UserRecord, LOGIN_LOCK_SECS, LOGIN_LOCK_THRESHOLD, RESET_TOKEN_TTL_SECS},
    db::{default_role_id, ensure_db_schema, user_record_from_row},
    errors::ApiFailure,
    oauth::{fetch_profile, NormalizedProfile},
    types::{
        AcceptedResponse, AuthResponse, ForgotPasswordRequest, LoginRequest, MeResponse,
        OauthCallbackQuery, RegisterRequest, ResetPasswordRequest,
    },
};

pub(crate) const USER_COLUMNS: &str = "user_id, email, auth_provider, provider_id, display_name, \
     avatar_url, birth_date_unix, gender, password_hash, role_id, is_active, is_blocked, \
     reset_token_hash, reset_token_expires_unix, failed_logins, locked_until_unix, created_at_unix";

fn session_ttl_secs(state: &AppState) -> i64 {
    i64::try_from(state.runtime.session_token_ttl.as_secs()).unwrap_or(i64::MAX)
}

pub(crate) async fn load_user_record(
    state: &AppState,
    user_id: &str,
) -> Result<Option<UserRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return row.as_ref().map(user_record_from_row).transpose();
    }
    Ok(state.users.read().await.get(user_id).cloned())
}

async fn find_user_by_email(
    state: &AppState,
    email: &str,
    provider: AuthProvider,
) -> Result<Option<UserRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND auth_provider = $2"
        ))
        .bind(email)
        .bind(provider.as_str())
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return row.as_ref().map(user_record_from_row).transpose();
    }
    let users = state.users.read().await;
    Ok(users
        .values()
        .find(|user| user.email == email && user.auth_provider == provider)
        .cloned())
}

fn send_welcome_email(state: &AppState, email: &str, display_name: &str) {
    let Some(mailer) = &state.mailer else {
        return;
    };
    let mailer = Arc::clone(mailer);
    let email = email.to_owned();
    let display_name = display_name.to_owned();
    tokio::spawn(async move {
        if let Err(e) = mailer.send_welcome(&email, &display_name).await {
            tracing::warn!(event = "mail.welcome_failed", error = %e);
        }
    });
}

fn send_reset_email(state: &AppState, email: &str, token: &str) {
    let Some(mailer) = &state.mailer else {
        return;
    };
    let mailer = Arc::clone(mailer);
    let email = email.to_owned();
    let token = token.to_owned();
    let base_url = state.runtime.public_base_url.clone();
    tokio::spawn(async move {
        if let Err(e) = mailer.send_password_reset(&email, &token, &base_url).await {
            tracing::warn!(event = "mail.reset_failed", error = %e);
        }
    });
}

pub(crate) async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<AcceptedResponse>, ApiFailure> {
    let email = Email::try_from(payload.email).map_err(|_| ApiFailure::InvalidRequest)?;
    enforce_auth_route_rate_limit(&state, "register", email.as_str()).await?;
    let display_name =
        DisplayName::try_from(payload.display_name).map_err(|_| ApiFailure::InvalidRequest)?;
    validate_password(&payload.password)?;
    let gender = payload
        .gender
        .map(Gender::try_from)
        .transpose()
        .map_err(|_| ApiFailure::InvalidRequest)?;
    let password_hash = hash_password(&payload.password).map_err(|_| ApiFailure::Internal)?;
    let user_id = UserId::new();
    let now = now_unix();

    let created = if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let result = sqlx::query(
            "INSERT INTO users (user_id, email, auth_provider, display_name, birth_date_unix, \
                 gender, password_hash, role_id, created_at_unix)
             VALUES ($1, $2, 'local', $3, $4, $5, $6, $7, $8)
             ON CONFLICT (email, auth_provider) DO NOTHING",
        )
        .bind(user_id.to_string())
        .bind(email.as_str())
        .bind(display_name.as_str())
        .bind(payload.birth_date_unix)
        .bind(gender.map(Gender::as_str))
        .bind(&password_hash)
        .bind(default_role_id())
        .bind(now)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        result.rows_affected() > 0
    } else {
        let mut users = state.users.write().await;
        let exists = users
            .values()
            .any(|user| user.email == email.as_str() && user.auth_provider == AuthProvider::Local);
        if exists {
            false
        } else {
            users.insert(
                user_id.to_string(),
                UserRecord {
                    user_id,
                    email: email.as_str().to_owned(),
                    auth_provider: AuthProvider::Local,
                    provider_id: None,
                    display_name: display_name.as_str().to_owned(),
                    avatar_url: None,
                    birth_date_unix: payload.birth_date_unix,
                    gender,
                    password_hash: Some(password_hash),
                    role_id: Some(default_role_id().to_owned()),
                    is_active: true,
                    is_blocked: false,
                    reset_token_hash: None,
                    reset_token_expires_unix: None,
                    failed_logins: 0,
                    locked_until_unix: None,
                    created_at_unix: now,
                },
            );
            true
        }
    };

    // Existing accounts get the same accepted response so registration
    // cannot be used to probe for emails.
    if created {
        tracing::info!(event = "auth.register", outcome = "created", user_id = %user_id);
        send_welcome_email(&state, email.as_str(), display_name.as_str());
    } else {
        tracing::info!(event = "auth.register", outcome = "existing_account");
    }

    Ok(Json(AcceptedResponse { accepted: true }))
}

async fn clear_login_failures(state: &AppState, user_id: UserId) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        sqlx::query("UPDATE users SET failed_logins = 0, locked_until_unix = NULL WHERE user_id = $1")
            .bind(user_id.to_string())
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        return Ok(());
    }
    let mut users = state.users.write().await;
    if let Some(user) = users.get_mut(&user_id.to_string()) {
        user.failed_logins = 0;
        user.locked_until_unix = None;
    }
    Ok(())
}

async fn record_login_failure(
    state: &AppState,
    user_id: UserId,
    previous_failures: u8,
    now: i64,
) -> Result<(), ApiFailure> {
    let failures = previous_failures.saturating_add(1);
    let (failed_logins, locked_until) = if failures >= LOGIN_LOCK_THRESHOLD {
        (0_u8, Some(now + LOGIN_LOCK_SECS))
    } else {
        (failures, None)
    };

    if let Some(pool) = &state.db_pool {
        sqlx::query("UPDATE users SET failed_logins = $2, locked_until_unix = $3 WHERE user_id = $1")
            .bind(user_id.to_string())
            .bind(i16::from(failed_logins))
            .bind(locked_until)
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut users = state.users.write().await;
        if let Some(user) = users.get_mut(&user_id.to_string()) {
            user.failed_logins = failed_logins;
            user.locked_until_unix = locked_until;
        }
    }

    if locked_until.is_some() {
        tracing::warn!(event = "auth.login.locked", user_id = %user_id);
    }
    Ok(())
}

pub(crate) async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiFailure> {
    let email = Email::try_from(payload.email).map_err(|_| ApiFailure::Unauthorized)?;
    enforce_auth_route_rate_limit(&state, "login", email.as_str()).await?;
    validate_password(&payload.password).map_err(|_| ApiFailure::Unauthorized)?;
    let now = now_unix();

    let user = find_user_by_email(&state, email.as_str(), AuthProvider::Local).await?;
    let Some(user) = user else {
        // Unknown account still pays for a hash verification so response
        // timing does not reveal which emails exist.
        let _ = verify_password(&state.dummy_password_hash, &payload.password);
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
        return Err(ApiFailure::Unauthorized);
    };

    if user.locked_until_unix.is_some_and(|until| until > now) {
        tracing::warn!(event = "auth.login", outcome = "locked", user_id = %user.user_id);
        return Err(ApiFailure::Unauthorized);
    }
    if user.is_blocked || !user.is_active {
        let _ = verify_password(&state.dummy_password_hash, &payload.password);
        tracing::warn!(event = "auth.login", outcome = "inactive", user_id = %user.user_id);
        return Err(ApiFailure::Unauthorized);
    }
    let Some(stored_hash) = user.password_hash.as_deref() else {
        let _ = verify_password(&state.dummy_password_hash, &payload.password);
        tracing::warn!(event = "auth.login", outcome = "no_local_password", user_id = %user.user_id);
        return Err(ApiFailure::Unauthorized);
    };

    if !verify_password(stored_hash, &payload.password) {
        record_login_failure(&state, user.user_id, user.failed_logins, now).await?;
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
        return Err(ApiFailure::Unauthorized);
    }

    clear_login_failures(&state, user.user_id).await?;
    let token = issue_session_token(
        &state,
        user.user_id,
        &user.email,
        &user.display_name,
        AuthProvider::Local.as_str(),
        user.avatar_url.as_deref(),
    )
    .map_err(|_| ApiFailure::Internal)?;

    tracing::info!(event = "auth.login", outcome = "success", user_id = %user.user_id);

    Ok(Json(AuthResponse {
        token,
        expires_in_secs: session_ttl_secs(&state),
    }))
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let user = load_user_record(&state, &auth.user_id.to_string())
        .await?
        .ok_or(ApiFailure::Unauthorized)?;

    Ok(Json(MeResponse {
        user_id: user.user_id.to_string(),
        email: user.email,
        display_name: user.display_name,
        auth_provider: user.auth_provider.as_str(),
        avatar_url: user.avatar_url,
    }))
}

pub(crate) async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<AcceptedResponse>, ApiFailure> {
    let email = Email::try_from(payload.email).map_err(|_| ApiFailure::InvalidRequest)?;
    enforce_auth_route_rate_limit(&state, "forgot_password", email.as_str()).await?;

    let user = find_user_by_email(&state, email.as_str(), AuthProvider::Local).await?;
    let Some(user) = user else {
        tracing::info!(event = "auth.forgot_password", outcome = "unknown_account");
        return Ok(Json(AcceptedResponse { accepted: true }));
    };

    let (token, digest) = mint_reset_token();
    let expires_at = now_unix() + RESET_TOKEN_TTL_SECS;
    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "UPDATE users SET reset_token_hash = $2, reset_token_expires_unix = $3 WHERE user_id = $1",
        )
        .bind(user.user_id.to_string())
        .bind(&digest)
        .bind(expires_at)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut users = state.users.write().await;
        if let Some(record) = users.get_mut(&user.user_id.to_string()) {
            record.reset_token_hash = Some(digest);
            record.reset_token_expires_unix = Some(expires_at);
        }
    }

    send_reset_email(&state, &user.email, &token);
    tracing::info!(event = "auth.forgot_password", outcome = "token_issued", user_id = %user.user_id);
    Ok(Json(AcceptedResponse { accepted: true }))
}

pub(crate) async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<AcceptedResponse>, ApiFailure> {
    enforce_auth_route_rate_limit(&state, "reset_password", &payload.token).await?;
    validate_password(&payload.new_password)?;
    if payload.token.len() != 64 || !payload.token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ApiFailure::Unauthorized);
    }
    let digest = hash_reset_token(&payload.token);
    let password_hash = hash_password(&payload.new_password).map_err(|_| ApiFailure::Internal)?;
    let now = now_unix();

    let updated = if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let result = sqlx::query(
            "UPDATE users
             SET password_hash = $2,
                 reset_token_hash = NULL,
                 reset_token_expires_unix = NULL,
                 failed_logins = 0,
                 locked_until_unix = NULL
             WHERE reset_token_hash = $1
               AND reset_token_expires_unix > $3
               AND auth_provider = 'local'",
        )
        .bind(&digest)
        .bind(&password_hash)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        result.rows_affected() == 1
    } else {
        let mut users = state.users.write().await;
        let record = users.values_mut().find(|user| {
            user.auth_provider == AuthProvider::Local
                && user.reset_token_hash.as_deref() == Some(digest.as_str())
                && user.reset_token_expires_unix.is_some_and(|expiry| expiry > now)
        });
        match record {
            Some(user) => {
                user.password_hash = Some(password_hash);
                user.reset_token_hash = None;
                user.reset_token_expires_unix = None;
                user.failed_logins = 0;
                user.locked_until_unix = None;
                true
            }
            None => false,
        }
    };

    if !updated {
        tracing::warn!(event = "auth.reset_password", outcome = "invalid_token");
        return Err(ApiFailure::Unauthorized);
    }

    tracing::info!(event = "auth.reset_password", outcome = "success");
    Ok(Json(AcceptedResponse { accepted: true }))
}

fn parse_oauth_provider(value: &str) -> Result<AuthProvider, ApiFailure> {
    let provider =
        AuthProvider::try_from(value.to_owned()).map_err(|_| ApiFailure::InvalidRequest)?;
    if provider == AuthProvider::Local {
        return Err(ApiFailure::InvalidRequest);
    }
    Ok(provider)
}

async fn upsert_oauth_user(
    state: &AppState,
    provider: AuthProvider,
    profile: &NormalizedProfile,
    refresh_profile: bool,
) -> Result<UserRecord, ApiFailure> {
    let email = Email::try_from(profile.email.clone()).map_err(|_| ApiFailure::OauthFailed)?;
    let now = now_unix();

    let existing = find_user_by_email(state, email.as_str(), provider).await?;
    if let Some(mut user) = existing {
        let refresh_fields = refresh_profile || user.provider_id.is_none();
        if refresh_fields {
            user.provider_id = Some(profile.provider_id.clone());
            if refresh_profile {
                user.display_name = profile.display_name.clone();
                user.avatar_url = profile.avatar_url.clone();
            }
            if let Some(pool) = &state.db_pool {
                sqlx::query(
                    "UPDATE users SET provider_id = $2, display_name = $3, avatar_url = $4 \
                     WHERE user_id = $1",
                )
                .bind(user.user_id.to_string())
                .bind(user.provider_id.as_deref())
                .bind(&user.display_name)
                .bind(user.avatar_url.as_deref())
                .execute(pool)
                .await
                .map_err(|_| ApiFailure::Internal)?;
            } else {
                let mut users = state.users.write().await;
                if let Some(record) = users.get_mut(&user.user_id.to_string()) {
                    record.provider_id = user.provider_id.clone();
                    record.display_name = user.display_name.clone();
                    record.avatar_url = user.avatar_url.clone();
                }
            }
        }
        return Ok(user);
    }

    let user = UserRecord {
        user_id: UserId::new(),
        email: email.as_str().to_owned(),
        auth_provider: provider,
        provider_id: Some(profile.provider_id.clone()),
        display_name: profile.display_name.clone(),
        avatar_url: profile.avatar_url.clone(),
        birth_date_unix: None,
        gender: None,
        password_hash: None,
        role_id: Some(default_role_id().to_owned()),
        is_active: true,
        is_blocked: false,
        reset_token_hash: None,
        reset_token_expires_unix: None,
        failed_logins: 0,
        locked_until_unix: None,
        created_at_unix: now,
    };

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO users (user_id, email, auth_provider, provider_id, display_name, \
                 avatar_url, role_id, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (email, auth_provider) DO NOTHING",
        )
        .bind(user.user_id.to_string())
        .bind(&user.email)
        .bind(provider.as_str())
        .bind(user.provider_id.as_deref())
        .bind(&user.display_name)
        .bind(user.avatar_url.as_deref())
        .bind(user.role_id.as_deref())
        .bind(now)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut users = state.users.write().await;
        users.insert(user.user_id.to_string(), user.clone());
    }

    tracing::info!(
        event = "auth.oauth.first_login",
        provider = provider.as_str(),
        user_id = %user.user_id
    );
    Ok(user)
}

async fn oauth_session(
    state: &AppState,
    provider_name: &str,
    query: OauthCallbackQuery,
) -> Result<String, ApiFailure> {
    let provider = parse_oauth_provider(provider_name)?;
    if query.code.is_empty() || query.code.len() > 512 {
        return Err(ApiFailure::InvalidRequest);
    }
    enforce_auth_route_rate_limit(state, "oauth_callback", &query.code).await?;
    let provider_config = state.runtime.oauth.get(provider).ok_or_else(|| {
        tracing::warn!(event = "oauth.provider_unconfigured", provider = provider.as_str());
        ApiFailure::OauthFailed
    })?;

    let profile = fetch_profile(&state.http_client, provider, provider_config, &query.code).await?;
    let user = upsert_oauth_user(state, provider, &profile, query.refresh_profile).await?;
    if user.is_blocked || !user.is_active {
        return Err(ApiFailure::Unauthorized);
    }

    let token = issue_session_token(
        state,
        user.user_id,
        &user.email,
        &user.display_name,
        provider.as_str(),
        user.avatar_url.as_deref(),
    )
    .map_err(|_| ApiFailure::Internal)?;

    tracing::info!(
        event = "auth.oauth.login",
        provider = provider.as_str(),
        user_id = %user.user_id
    );
    Ok(token)
}

pub(crate) async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OauthCallbackQuery>,
) -> Result<Json<AuthResponse>, ApiFailure> {
    let token = oauth_session(&state, &provider, query).await?;
    Ok(Json(AuthResponse {
        token,
        expires_in_secs: session_ttl_secs(&state),
    }))
}

/// Mobile variant: the token travels back to the app through a deep link
/// on a configured custom URL scheme.
pub(crate) async fn oauth_callback_mobile(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OauthCallbackQuery>,
) -> Result<Redirect, ApiFailure> {
    let scheme = state
        .runtime
        .mobile_redirect_scheme
        .clone()
        .ok_or(ApiFailure::InvalidRequest)?;
    let token = oauth_session(&state, &provider, query).await?;
    Ok(Redirect::temporary(&format!(
        "{scheme}://auth/callback?token={token}"
    )))
}
