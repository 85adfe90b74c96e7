use std::collections::HashMap;

use axum::{extract::State, http::HeaderMap, Json};
use meetpoint_core::UserId;
use sqlx::Row;

use crate::server::{
    auth::{authenticate, now_unix},
    core::{pair_key, AppState, ChatKind, ChatRecord},
    db::ensure_db_schema,
    errors::ApiFailure,
    handlers::auth::load_user_record,
    types::{ChatListResponse, ChatResponse, DirectChatRequest},
};

fn chat_response(record: &ChatRecord, unread_count: i64) -> ChatResponse {
    let mut participants: Vec<String> = record.participants.keys().cloned().collect();
    participants.sort();
    ChatResponse {
        chat_id: record.chat_id.clone(),
        kind: record.kind.as_str().to_owned(),
        event_id: record.event_id.clone(),
        participants,
        unread_count,
        created_at_unix: record.created_at_unix,
    }
}

/// Loads a chat with its participant map (user id to last-read watermark).
pub(crate) async fn load_chat(
    state: &AppState,
    chat_id: &str,
) -> Result<Option<ChatRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query(
            "SELECT chat_id, kind, pair_key, event_id, created_at_unix FROM chats WHERE chat_id = $1",
        )
        .bind(chat_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let kind: String = row.try_get("kind").map_err(|_| ApiFailure::Internal)?;
        let kind = ChatKind::parse(&kind).ok_or(ApiFailure::Internal)?;
        let mut record = ChatRecord {
            chat_id: row.try_get("chat_id").map_err(|_| ApiFailure::Internal)?,
            kind,
            pair_key: row.try_get("pair_key").map_err(|_| ApiFailure::Internal)?,
            event_id: row.try_get("event_id").map_err(|_| ApiFailure::Internal)?,
            participants: HashMap::new(),
            created_at_unix: row
                .try_get("created_at_unix")
                .map_err(|_| ApiFailure::Internal)?,
        };
        let participant_rows =
            sqlx::query("SELECT user_id, last_read_at_unix FROM chat_participants WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_all(pool)
                .await
                .map_err(|_| ApiFailure::Internal)?;
        for participant in &participant_rows {
            let user_id: String = participant
                .try_get("user_id")
                .map_err(|_| ApiFailure::Internal)?;
            let last_read: Option<i64> = participant
                .try_get("last_read_at_unix")
                .map_err(|_| ApiFailure::Internal)?;
            record.participants.insert(user_id, last_read);
        }
        return Ok(Some(record));
    }
    Ok(state.chats.read().await.get(chat_id).cloned())
}

pub(crate) async fn create_event_chat(
    state: &AppState,
    event_id: &str,
    creator: UserId,
    now: i64,
) -> Result<String, ApiFailure> {
    let chat_id = state.next_id();
    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "INSERT INTO chats (chat_id, kind, event_id, created_at_unix) VALUES ($1, 'event', $2, $3)",
        )
        .bind(&chat_id)
        .bind(event_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)")
            .bind(&chat_id)
            .bind(creator.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        let record = ChatRecord {
            chat_id: chat_id.clone(),
            kind: ChatKind::Event,
            pair_key: None,
            event_id: Some(event_id.to_owned()),
            participants: HashMap::from([(creator.to_string(), None)]),
            created_at_unix: now,
        };
        state.chats.write().await.insert(chat_id.clone(), record);
    }
    Ok(chat_id)
}

/// Adds a user to the chat of an event they just joined. Returns the chat id
/// when the event still has one.
pub(crate) async fn enroll_in_event_chat(
    state: &AppState,
    event_id: &str,
    user_id: UserId,
) -> Result<Option<String>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT chat_id FROM chats WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let chat_id: String = row.try_get("chat_id").map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&chat_id)
        .bind(user_id.to_string())
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return Ok(Some(chat_id));
    }

    let mut chats = state.chats.write().await;
    let chat = chats
        .values_mut()
        .find(|chat| chat.event_id.as_deref() == Some(event_id));
    Ok(chat.map(|chat| {
        chat.participants.entry(user_id.to_string()).or_insert(None);
        chat.chat_id.clone()
    }))
}

pub(crate) async fn mark_chat_read(
    state: &AppState,
    chat_id: &str,
    user_id: UserId,
    now: i64,
) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "UPDATE chat_participants SET last_read_at_unix = $3 \
             WHERE chat_id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(user_id.to_string())
        .bind(now)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return Ok(());
    }
    let mut chats = state.chats.write().await;
    if let Some(chat) = chats.get_mut(chat_id) {
        if let Some(last_read) = chat.participants.get_mut(&user_id.to_string()) {
            *last_read = Some(now);
        }
    }
    Ok(())
}

/// Find-or-create keyed by the unordered user pair, so repeated requests from
/// either side land in the same chat.
pub(crate) async fn direct_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DirectChatRequest>,
) -> Result<Json<ChatResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let other_user_id =
        UserId::try_from(payload.user_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if other_user_id == auth.user_id {
        return Err(ApiFailure::InvalidRequest);
    }
    load_user_record(&state, &other_user_id.to_string())
        .await?
        .ok_or(ApiFailure::NotFound)?;

    let key = pair_key(auth.user_id, other_user_id);
    let now = now_unix();

    if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let existing = sqlx::query("SELECT chat_id FROM chats WHERE pair_key = $1")
            .bind(&key)
            .fetch_optional(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        let chat_id = match existing {
            Some(row) => row.try_get("chat_id").map_err(|_| ApiFailure::Internal)?,
            None => {
                let chat_id = state.next_id();
                let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
                // The unique index on pair_key resolves races; the loser of a
                // concurrent create retries as a reader.
                let inserted = sqlx::query(
                    "INSERT INTO chats (chat_id, kind, pair_key, created_at_unix) \
                     VALUES ($1, 'direct', $2, $3) \
                     ON CONFLICT (pair_key) WHERE pair_key IS NOT NULL DO NOTHING",
                )
                .bind(&chat_id)
                .bind(&key)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|_| ApiFailure::Internal)?;
                if inserted.rows_affected() == 0 {
                    tx.rollback().await.map_err(|_| ApiFailure::Internal)?;
                    let row = sqlx::query("SELECT chat_id FROM chats WHERE pair_key = $1")
                        .bind(&key)
                        .fetch_one(pool)
                        .await
                        .map_err(|_| ApiFailure::Internal)?;
                    row.try_get("chat_id").map_err(|_| ApiFailure::Internal)?
                } else {
                    for user in [auth.user_id, other_user_id] {
                        sqlx::query(
                            "INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)",
                        )
                        .bind(&chat_id)
                        .bind(user.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(|_| ApiFailure::Internal)?;
                    }
                    tx.commit().await.map_err(|_| ApiFailure::Internal)?;
                    chat_id
                }
            }
        };
        let record = load_chat(&state, &chat_id)
            .await?
            .ok_or(ApiFailure::Internal)?;
        let unread = unread_count(&state, &record, auth.user_id).await?;
        return Ok(Json(chat_response(&record, unread)));
    }

    let mut chats = state.chats.write().await;
    let existing = chats
        .values()
        .find(|chat| chat.pair_key.as_deref() == Some(key.as_str()))
        .cloned();
    let record = match existing {
        Some(record) => record,
        None => {
            let record = ChatRecord {
                chat_id: state.next_id(),
                kind: ChatKind::Direct,
                pair_key: Some(key),
                event_id: None,
                participants: HashMap::from([
                    (auth.user_id.to_string(), None),
                    (other_user_id.to_string(), None),
                ]),
                created_at_unix: now,
            };
            chats.insert(record.chat_id.clone(), record.clone());
            tracing::info!(event = "chat.direct_created", chat_id = %record.chat_id);
            record
        }
    };
    drop(chats);
    let unread = unread_count(&state, &record, auth.user_id).await?;
    Ok(Json(chat_response(&record, unread)))
}

/// Unread means newer than the caller's last-read watermark and not authored
/// by the caller; with no watermark everything counts. Soft-deleted messages
/// still hold a slot in the history, so they count too.
async fn unread_count(
    state: &AppState,
    record: &ChatRecord,
    viewer: UserId,
) -> Result<i64, ApiFailure> {
    let viewer_key = viewer.to_string();
    let last_read = record.participants.get(&viewer_key).copied().flatten();

    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unread FROM messages
             WHERE chat_id = $1
               AND author_user_id IS DISTINCT FROM $2
               AND ($3::bigint IS NULL OR created_at_unix > $3)",
        )
        .bind(&record.chat_id)
        .bind(&viewer_key)
        .bind(last_read)
        .fetch_one(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return row.try_get("unread").map_err(|_| ApiFailure::Internal);
    }

    let messages = state.messages.read().await;
    let unread = messages
        .get(&record.chat_id)
        .map(|records| {
            records
                .iter()
                .filter(|message| {
                    message.author_user_id != Some(viewer)
                        && last_read.is_none_or(|watermark| message.created_at_unix > watermark)
                })
                .count()
        })
        .unwrap_or(0);
    Ok(i64::try_from(unread).unwrap_or(i64::MAX))
}

pub(crate) async fn list_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ChatListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let viewer_key = auth.user_id.to_string();

    let mut records: Vec<ChatRecord> = if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let rows = sqlx::query("SELECT chat_id FROM chat_participants WHERE user_id = $1")
            .bind(&viewer_key)
            .fetch_all(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        let mut loaded = Vec::with_capacity(rows.len());
        for row in &rows {
            let chat_id: String = row.try_get("chat_id").map_err(|_| ApiFailure::Internal)?;
            if let Some(record) = load_chat(&state, &chat_id).await? {
                loaded.push(record);
            }
        }
        loaded
    } else {
        state
            .chats
            .read()
            .await
            .values()
            .filter(|chat| chat.participants.contains_key(&viewer_key))
            .cloned()
            .collect()
    };

    records.sort_by(|a, b| {
        b.created_at_unix
            .cmp(&a.created_at_unix)
            .then_with(|| a.chat_id.cmp(&b.chat_id))
    });
    let mut chats = Vec::with_capacity(records.len());
    for record in &records {
        let unread = unread_count(&state, record, auth.user_id).await?;
        chats.push(chat_response(record, unread));
    }

    Ok(Json(ChatListResponse { chats }))
}

pub(crate) async fn get_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Path(chat_id): axum::extract::Path<String>,
) -> Result<Json<ChatResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_chat(&state, &chat_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if !record.participants.contains_key(&auth.user_id.to_string()) {
        return Err(ApiFailure::Forbidden);
    }
    let unread = unread_count(&state, &record, auth.user_id).await?;
    Ok(Json(chat_response(&record, unread)))
}
