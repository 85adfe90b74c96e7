use meetpoint_core::{AuthProvider, Gender, Permission, UserId, ADMINISTRATOR_ROLE_ID, DEFAULT_ROLE_NAME};
use sqlx::{postgres::PgRow, Row};

use super::{
    core::{AppState, UserRecord},
    errors::ApiFailure,
};

const CREATE_FRIEND_REQUESTS_UNIQUE_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_friend_requests_pair_unique
                    ON friend_requests(sender_user_id, recipient_user_id)";
const CREATE_PARTICIPATION_REQUESTS_UNIQUE_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_participation_requests_event_user_unique
                    ON participation_requests(event_id, user_id)";
const CREATE_CHATS_PAIR_KEY_UNIQUE_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_pair_key_unique
                    ON chats(pair_key) WHERE pair_key IS NOT NULL";
const CREATE_CHATS_EVENT_UNIQUE_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_event_unique
                    ON chats(event_id) WHERE event_id IS NOT NULL";
const CREATE_MESSAGES_CHAT_CREATED_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_chat_created
                    ON messages(chat_id, created_at_unix DESC, message_id DESC)";
const CREATE_NOTIFICATIONS_USER_CREATED_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_notifications_user_created
                    ON notifications(user_id, created_at_unix DESC)";

#[allow(clippy::too_many_lines)]
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ApiFailure> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x4d45_4554_504f_494e;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS roles (
                    role_id TEXT PRIMARY KEY,
                    name TEXT UNIQUE NOT NULL,
                    permissions TEXT NOT NULL DEFAULT ''
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    email TEXT NOT NULL,
                    auth_provider TEXT NOT NULL,
                    provider_id TEXT NULL,
                    display_name TEXT NOT NULL,
                    avatar_url TEXT NULL,
                    birth_date_unix BIGINT NULL,
                    gender TEXT NULL,
                    password_hash TEXT NULL,
                    role_id TEXT NULL REFERENCES roles(role_id) ON DELETE SET NULL,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    is_blocked BOOLEAN NOT NULL DEFAULT FALSE,
                    reset_token_hash TEXT NULL,
                    reset_token_expires_unix BIGINT NULL,
                    failed_logins SMALLINT NOT NULL DEFAULT 0,
                    locked_until_unix BIGINT NULL,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_provider_unique
                    ON users(email, auth_provider)",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS events (
                    event_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    starts_at_unix BIGINT NOT NULL,
                    location TEXT NOT NULL,
                    location_hidden BOOLEAN NOT NULL DEFAULT FALSE,
                    max_participants BIGINT NOT NULL,
                    min_age BIGINT NULL,
                    max_age BIGINT NULL,
                    gender_constraint TEXT NULL,
                    creator_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS event_participants (
                    event_id TEXT NOT NULL REFERENCES events(event_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    joined_at_unix BIGINT NOT NULL,
                    PRIMARY KEY(event_id, user_id)
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS friend_requests (
                    request_id TEXT PRIMARY KEY,
                    sender_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    recipient_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    created_at_unix BIGINT NOT NULL,
                    CHECK (sender_user_id <> recipient_user_id)
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS friends (
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    friend_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    created_at_unix BIGINT NOT NULL,
                    CHECK (user_id <> friend_user_id),
                    PRIMARY KEY(user_id, friend_user_id)
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS participation_requests (
                    request_id TEXT PRIMARY KEY,
                    event_id TEXT NOT NULL REFERENCES events(event_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    meets_age BOOLEAN NULL,
                    meets_gender BOOLEAN NULL,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS chats (
                    chat_id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    pair_key TEXT NULL,
                    event_id TEXT NULL REFERENCES events(event_id) ON DELETE CASCADE,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS chat_participants (
                    chat_id TEXT NOT NULL REFERENCES chats(chat_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    last_read_at_unix BIGINT NULL,
                    PRIMARY KEY(chat_id, user_id)
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    chat_id TEXT NOT NULL REFERENCES chats(chat_id) ON DELETE CASCADE,
                    author_user_id TEXT NULL REFERENCES users(user_id) ON DELETE SET NULL,
                    content TEXT NOT NULL,
                    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at_unix BIGINT NOT NULL,
                    edited_at_unix BIGINT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS notifications (
                    notification_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    actor_user_id TEXT NULL,
                    event_id TEXT NULL,
                    chat_id TEXT NULL,
                    is_read BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(CREATE_FRIEND_REQUESTS_UNIQUE_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_PARTICIPATION_REQUESTS_UNIQUE_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_CHATS_PAIR_KEY_UNIQUE_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_CHATS_EVENT_UNIQUE_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_MESSAGES_CHAT_CREATED_INDEX_SQL)
                .execute(&mut *tx)
                .await?;
            sqlx::query(CREATE_NOTIFICATIONS_USER_CREATED_INDEX_SQL)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO roles (role_id, name, permissions)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (role_id) DO NOTHING",
            )
            .bind(ADMINISTRATOR_ROLE_ID)
            .bind("Administrator")
            .bind(administrator_permission_codes())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO roles (role_id, name, permissions)
                 VALUES ($1, $2, '')
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(default_role_id())
            .bind(DEFAULT_ROLE_NAME)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|e| {
            tracing::error!(event = "db.init", error = %e);
            ApiFailure::Internal
        })?;

    Ok(())
}

pub(crate) fn default_role_id() -> &'static str {
    "00000000-0000-4000-8000-000000000002"
}

pub(crate) fn administrator_permission_codes() -> String {
    [
        Permission::ManageUsers,
        Permission::ManageEvents,
        Permission::ManageRoles,
        Permission::ViewStorage,
    ]
    .iter()
    .map(|permission| permission.as_str())
    .collect::<Vec<_>>()
    .join(",")
}

pub(crate) fn user_record_from_row(row: &PgRow) -> Result<UserRecord, ApiFailure> {
    let user_id: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
    let user_id = UserId::try_from(user_id).map_err(|_| ApiFailure::Internal)?;
    let auth_provider: String = row
        .try_get("auth_provider")
        .map_err(|_| ApiFailure::Internal)?;
    let auth_provider =
        AuthProvider::try_from(auth_provider).map_err(|_| ApiFailure::Internal)?;
    let gender: Option<String> = row.try_get("gender").map_err(|_| ApiFailure::Internal)?;
    let gender = gender
        .map(Gender::try_from)
        .transpose()
        .map_err(|_| ApiFailure::Internal)?;
    let failed_logins: i16 = row
        .try_get("failed_logins")
        .map_err(|_| ApiFailure::Internal)?;

    Ok(UserRecord {
        user_id,
        email: row.try_get("email").map_err(|_| ApiFailure::Internal)?,
        auth_provider,
        provider_id: row.try_get("provider_id").map_err(|_| ApiFailure::Internal)?,
        display_name: row
            .try_get("display_name")
            .map_err(|_| ApiFailure::Internal)?,
        avatar_url: row.try_get("avatar_url").map_err(|_| ApiFailure::Internal)?,
        birth_date_unix: row
            .try_get("birth_date_unix")
            .map_err(|_| ApiFailure::Internal)?,
        gender,
        password_hash: row
            .try_get("password_hash")
            .map_err(|_| ApiFailure::Internal)?,
        role_id: row.try_get("role_id").map_err(|_| ApiFailure::Internal)?,
        is_active: row.try_get("is_active").map_err(|_| ApiFailure::Internal)?,
        is_blocked: row.try_get("is_blocked").map_err(|_| ApiFailure::Internal)?,
        reset_token_hash: row
            .try_get("reset_token_hash")
            .map_err(|_| ApiFailure::Internal)?,
        reset_token_expires_unix: row
            .try_get("reset_token_expires_unix")
            .map_err(|_| ApiFailure::Internal)?,
        failed_logins: u8::try_from(failed_logins).unwrap_or(u8::MAX),
        locked_until_unix: row
            .try_get("locked_until_unix")
            .map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

pub(crate) fn permission_codes_from_column(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_owned)
        .collect()
}
