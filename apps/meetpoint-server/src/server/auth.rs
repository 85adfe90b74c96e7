use std::{
    fmt::Write as _,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use meetpoint_core::UserId;
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use sha2::{Digest, Sha256};
use sqlx::Row;

use super::{
    core::{AppState, AuthContext},
    errors::ApiFailure,
};

const RATE_LIMIT_WINDOW_SECS: i64 = 60;
const RATE_LIMIT_SWEEP_THRESHOLD: usize = 1024;

pub(crate) fn validate_password(value: &str) -> Result<(), ApiFailure> {
    let len = value.len();
    if (8..=128).contains(&len) {
        Ok(())
    } else {
        Err(ApiFailure::InvalidRequest)
    }
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

pub(crate) fn issue_session_token(
    state: &AppState,
    user_id: UserId,
    email: &str,
    display_name: &str,
    provider: &str,
    avatar_url: Option<&str>,
) -> anyhow::Result<String> {
    let mut claims = Claims::new_expires_in(&state.runtime.session_token_ttl)
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional("email", email)
        .map_err(|e| anyhow!("claim email failed: {e}"))?;
    claims
        .add_additional("name", display_name)
        .map_err(|e| anyhow!("claim name failed: {e}"))?;
    claims
        .add_additional("provider", provider)
        .map_err(|e| anyhow!("claim provider failed: {e}"))?;
    if let Some(avatar_url) = avatar_url {
        claims
            .add_additional("avatar", avatar_url)
            .map_err(|e| anyhow!("claim avatar failed: {e}"))?;
    }

    local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("session token mint failed: {e}"))
}

pub(crate) fn verify_session_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiFailure> {
    let token = bearer_token(headers).ok_or(ApiFailure::Unauthorized)?;
    authenticate_with_token(state, token).await
}

pub(crate) async fn authenticate_with_token(
    state: &AppState,
    token: &str,
) -> Result<AuthContext, ApiFailure> {
    let claims = verify_session_token(state, token).map_err(|_| ApiFailure::Unauthorized)?;
    let subject = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or(ApiFailure::Unauthorized)?;
    let context = find_auth_context(state, subject)
        .await
        .ok_or(ApiFailure::Unauthorized)?;
    Ok(context)
}

/// Blocked and deactivated accounts fail authentication even while their
/// tokens are still within TTL.
async fn find_auth_context(state: &AppState, subject: &str) -> Option<AuthContext> {
    let user_id = UserId::try_from(subject.to_owned()).ok()?;
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT email, display_name FROM users \
             WHERE user_id = $1 AND is_active AND NOT is_blocked",
        )
        .bind(subject)
        .fetch_optional(pool)
        .await
        .ok()??;
        let email: String = row.try_get("email").ok()?;
        let display_name: String = row.try_get("display_name").ok()?;
        return Some(AuthContext {
            user_id,
            email,
            display_name,
        });
    }
    let users = state.users.read().await;
    let record = users.get(subject)?;
    if !record.is_active || record.is_blocked {
        return None;
    }
    Some(AuthContext {
        user_id,
        email: record.email.clone(),
        display_name: record.display_name.clone(),
    })
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Returns the plaintext reset token and the sha256 digest stored server-side.
pub(crate) fn mint_reset_token() -> (String, String) {
    let mut secret = [0_u8; 32];
    OsRng.fill_bytes(&mut secret);
    let token = hex_encode(&secret);
    let digest = hash_reset_token(&token);
    (token, digest)
}

pub(crate) fn hash_reset_token(token: &str) -> String {
    hex_encode(&Sha256::digest(token.as_bytes()))
}

pub(crate) async fn enforce_auth_route_rate_limit(
    state: &AppState,
    route: &str,
    caller_key: &str,
) -> Result<(), ApiFailure> {
    let key = format!("{route}:{caller_key}");
    let now = now_unix();

    let mut hits = state.auth_route_hits.write().await;
    if hits.len() >= RATE_LIMIT_SWEEP_THRESHOLD {
        hits.retain(|_, route_hits| {
            route_hits.retain(|timestamp| now.saturating_sub(*timestamp) < RATE_LIMIT_WINDOW_SECS);
            !route_hits.is_empty()
        });
    }
    let route_hits = hits.entry(key).or_default();
    route_hits.retain(|timestamp| now.saturating_sub(*timestamp) < RATE_LIMIT_WINDOW_SECS);
    let max_hits =
        usize::try_from(state.runtime.auth_route_requests_per_minute).unwrap_or(usize::MAX);
    if route_hits.len() >= max_hits {
        tracing::warn!(event = "auth.rate_limit", route = %route, caller = %caller_key);
        return Err(ApiFailure::RateLimited);
    }
    route_hits.push(now);
    Ok(())
}
