use std::{pin::pin, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use meetpoint_core::UserId;
use sqlx::{postgres::PgRow, Row};
use tokio::sync::Notify;

use crate::server::{
    auth::{authenticate, now_unix},
    core::{AppState, ChatRecord, MessageRecord, MAX_MESSAGE_CONTENT_CHARS},
    errors::ApiFailure,
    gateway_events,
    handlers::{
        chats::{load_chat, mark_chat_read},
        notifications::{clamp_page_limit, notify_user},
    },
    realtime::push_user_event,
    types::{
        EditMessageRequest, MessageListQuery, MessageListResponse, MessagePollQuery,
        MessageResponse, SendMessageRequest,
    },
};

/// Deleted messages keep their slot in history but lose their content.
fn message_response(record: &MessageRecord) -> MessageResponse {
    MessageResponse {
        message_id: record.message_id.clone(),
        chat_id: record.chat_id.clone(),
        author_user_id: record.author_user_id.map(|id| id.to_string()),
        content: if record.is_deleted {
            String::new()
        } else {
            record.content.clone()
        },
        is_deleted: record.is_deleted,
        created_at_unix: record.created_at_unix,
        edited_at_unix: record.edited_at_unix,
    }
}

fn message_record_from_row(row: &PgRow) -> Result<MessageRecord, ApiFailure> {
    let author: Option<String> = row
        .try_get("author_user_id")
        .map_err(|_| ApiFailure::Internal)?;
    let author_user_id = author
        .map(UserId::try_from)
        .transpose()
        .map_err(|_| ApiFailure::Internal)?;
    Ok(MessageRecord {
        message_id: row.try_get("message_id").map_err(|_| ApiFailure::Internal)?,
        chat_id: row.try_get("chat_id").map_err(|_| ApiFailure::Internal)?,
        author_user_id,
        content: row.try_get("content").map_err(|_| ApiFailure::Internal)?,
        is_deleted: row.try_get("is_deleted").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
        edited_at_unix: row
            .try_get("edited_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

pub(crate) async fn chat_signal(state: &AppState, chat_id: &str) -> Arc<Notify> {
    let mut signals = state.chat_signals.write().await;
    Arc::clone(signals.entry(chat_id.to_owned()).or_default())
}

async fn require_chat_member(
    state: &AppState,
    chat_id: &str,
    user_id: UserId,
) -> Result<ChatRecord, ApiFailure> {
    let record = load_chat(state, chat_id).await?.ok_or(ApiFailure::NotFound)?;
    if !record.participants.contains_key(&user_id.to_string()) {
        return Err(ApiFailure::Forbidden);
    }
    Ok(record)
}

fn validate_content(content: &str) -> Result<(), ApiFailure> {
    let trimmed = content.trim();
    if trimmed.is_empty() || content.chars().count() > MAX_MESSAGE_CONTENT_CHARS {
        return Err(ApiFailure::InvalidRequest);
    }
    Ok(())
}

async fn persist_message(state: &AppState, record: &MessageRecord) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO messages (message_id, chat_id, author_user_id, content, is_deleted, \
                 created_at_unix)
             VALUES ($1, $2, $3, $4, FALSE, $5)",
        )
        .bind(&record.message_id)
        .bind(&record.chat_id)
        .bind(record.author_user_id.map(|id| id.to_string()))
        .bind(&record.content)
        .bind(record.created_at_unix)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut messages = state.messages.write().await;
        messages
            .entry(record.chat_id.clone())
            .or_default()
            .push(record.clone());
    }
    Ok(())
}

/// Authorless announcement in a chat, e.g. when someone joins an event.
/// Failures are logged and swallowed.
pub(crate) async fn append_system_message(state: &AppState, chat_id: &str, content: &str) {
    let record = MessageRecord {
        message_id: state.next_id(),
        chat_id: chat_id.to_owned(),
        author_user_id: None,
        content: content.to_owned(),
        is_deleted: false,
        created_at_unix: now_unix(),
        edited_at_unix: None,
    };
    if let Err(e) = persist_message(state, &record).await {
        tracing::warn!(event = "chat.system_message_failed", chat_id = %chat_id, error = ?e);
        return;
    }
    chat_signal(state, chat_id).await.notify_waiters();
}

pub(crate) async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let chat = require_chat_member(&state, &chat_id, auth.user_id).await?;
    validate_content(&payload.content)?;

    let record = MessageRecord {
        message_id: state.next_id(),
        chat_id: chat_id.clone(),
        author_user_id: Some(auth.user_id),
        content: payload.content,
        is_deleted: false,
        created_at_unix: now_unix(),
        edited_at_unix: None,
    };
    persist_message(&state, &record).await?;
    chat_signal(&state, &chat_id).await.notify_waiters();

    let response = message_response(&record);
    let message_event = gateway_events::message(&response);
    let refresh_event =
        gateway_events::chat_message(&chat_id, &record.message_id, record.created_at_unix);
    for participant in chat.participants.keys() {
        let Ok(participant_id) = UserId::try_from(participant.clone()) else {
            continue;
        };
        if participant_id == auth.user_id {
            continue;
        }
        push_user_event(&state, participant_id, &message_event).await;
        push_user_event(&state, participant_id, &refresh_event).await;
        notify_user(
            &state,
            participant_id,
            "message",
            Some(auth.user_id),
            None,
            Some(&chat_id),
        )
        .await;
    }

    Ok((StatusCode::CREATED, Json(response)))
}

async fn messages_after(
    state: &AppState,
    chat_id: &str,
    after_unix: i64,
) -> Result<Vec<MessageResponse>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT message_id, chat_id, author_user_id, content, is_deleted, created_at_unix, \
                 edited_at_unix
             FROM messages WHERE chat_id = $1 AND created_at_unix > $2
             ORDER BY created_at_unix ASC, message_id ASC",
        )
        .bind(chat_id)
        .bind(after_unix)
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return rows
            .iter()
            .map(|row| message_record_from_row(row).map(|record| message_response(&record)))
            .collect();
    }

    let messages = state.messages.read().await;
    let mut items: Vec<MessageResponse> = messages
        .get(chat_id)
        .map(|records| {
            records
                .iter()
                .filter(|record| record.created_at_unix > after_unix)
                .map(message_response)
                .collect()
        })
        .unwrap_or_default();
    items.sort_by(|a, b| {
        a.created_at_unix
            .cmp(&b.created_at_unix)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
    Ok(items)
}

pub(crate) async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(query): Query<MessageListQuery>,
) -> Result<Json<MessageListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    require_chat_member(&state, &chat_id, auth.user_id).await?;
    let limit = clamp_page_limit(query.limit);

    let mut items: Vec<MessageResponse> = if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT message_id, chat_id, author_user_id, content, is_deleted, created_at_unix, \
                 edited_at_unix
             FROM messages WHERE chat_id = $1 AND ($2::text IS NULL OR message_id < $2)
             ORDER BY message_id DESC
             LIMIT $3",
        )
        .bind(&chat_id)
        .bind(query.before.as_deref())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        rows.iter()
            .map(|row| message_record_from_row(row).map(|record| message_response(&record)))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let messages = state.messages.read().await;
        let mut items: Vec<MessageResponse> = messages
            .get(&chat_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| {
                        query
                            .before
                            .as_deref()
                            .is_none_or(|before| record.message_id.as_str() < before)
                    })
                    .map(message_response)
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| b.message_id.cmp(&a.message_id));
        items.truncate(limit);
        items
    };
    // Oldest first in the page.
    items.reverse();

    // Reading the history moves the caller's unread watermark.
    mark_chat_read(&state, &chat_id, auth.user_id, now_unix()).await?;

    Ok(Json(MessageListResponse { messages: items }))
}

/// Long poll: returns immediately when messages newer than `after_unix`
/// exist, otherwise parks on the chat's notifier until the timeout.
pub(crate) async fn poll_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(query): Query<MessagePollQuery>,
) -> Result<Json<MessageListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    require_chat_member(&state, &chat_id, auth.user_id).await?;

    let after_unix = query.after_unix.unwrap_or_else(now_unix);
    let max_timeout = state.runtime.long_poll_max_timeout;
    let timeout = query
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(max_timeout)
        .min(max_timeout);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let signal = chat_signal(&state, &chat_id).await;
        let mut notified = pin!(signal.notified());
        // Arm before the check so a message landing in between still wakes us.
        notified.as_mut().enable();

        let messages = messages_after(&state, &chat_id, after_unix).await?;
        if !messages.is_empty() {
            return Ok(Json(MessageListResponse { messages }));
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(Json(MessageListResponse {
                messages: Vec::new(),
            }));
        }
        if tokio::time::timeout(deadline - now, notified).await.is_err() {
            return Ok(Json(MessageListResponse {
                messages: Vec::new(),
            }));
        }
    }
}

async fn load_message(
    state: &AppState,
    chat_id: &str,
    message_id: &str,
) -> Result<Option<MessageRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT message_id, chat_id, author_user_id, content, is_deleted, created_at_unix, \
                 edited_at_unix
             FROM messages WHERE chat_id = $1 AND message_id = $2",
        )
        .bind(chat_id)
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return row.as_ref().map(message_record_from_row).transpose();
    }
    let messages = state.messages.read().await;
    Ok(messages.get(chat_id).and_then(|records| {
        records
            .iter()
            .find(|record| record.message_id == message_id)
            .cloned()
    }))
}

pub(crate) async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((chat_id, message_id)): Path<(String, String)>,
    Json(payload): Json<EditMessageRequest>,
) -> Result<Json<MessageResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let chat = require_chat_member(&state, &chat_id, auth.user_id).await?;
    validate_content(&payload.content)?;

    let mut record = load_message(&state, &chat_id, &message_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.author_user_id != Some(auth.user_id) {
        return Err(ApiFailure::Forbidden);
    }
    if record.is_deleted {
        return Err(ApiFailure::NotFound);
    }

    record.content = payload.content;
    record.edited_at_unix = Some(now_unix());

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "UPDATE messages SET content = $3, edited_at_unix = $4 \
             WHERE chat_id = $1 AND message_id = $2",
        )
        .bind(&chat_id)
        .bind(&message_id)
        .bind(&record.content)
        .bind(record.edited_at_unix)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut messages = state.messages.write().await;
        if let Some(records) = messages.get_mut(&chat_id) {
            if let Some(stored) = records
                .iter_mut()
                .find(|stored| stored.message_id == message_id)
            {
                stored.content = record.content.clone();
                stored.edited_at_unix = record.edited_at_unix;
            }
        }
    }

    let response = message_response(&record);
    let message_event = gateway_events::message(&response);
    for participant in chat.participants.keys() {
        if let Ok(participant_id) = UserId::try_from(participant.clone()) {
            if participant_id != auth.user_id {
                push_user_event(&state, participant_id, &message_event).await;
            }
        }
    }

    Ok(Json(response))
}

pub(crate) async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    require_chat_member(&state, &chat_id, auth.user_id).await?;
    let record = load_message(&state, &chat_id, &message_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.author_user_id != Some(auth.user_id) {
        return Err(ApiFailure::Forbidden);
    }

    if let Some(pool) = &state.db_pool {
        sqlx::query("UPDATE messages SET is_deleted = TRUE WHERE chat_id = $1 AND message_id = $2")
            .bind(&chat_id)
            .bind(&message_id)
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut messages = state.messages.write().await;
        if let Some(records) = messages.get_mut(&chat_id) {
            if let Some(stored) = records
                .iter_mut()
                .find(|stored| stored.message_id == message_id)
            {
                stored.is_deleted = true;
            }
        }
    }

    tracing::info!(event = "chat.message_deleted", chat_id = %chat_id, message_id = %message_id);
    Ok(StatusCode::NO_CONTENT)
}
