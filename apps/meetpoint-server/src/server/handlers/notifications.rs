use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use meetpoint_core::UserId;
use sqlx::Row;

use crate::server::{
    auth::{authenticate, now_unix},
    core::{AppState, NotificationRecord, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT},
    db::ensure_db_schema,
    errors::ApiFailure,
    gateway_events,
    realtime::push_user_event,
    types::{
        MarkReadRequest, NotificationListQuery, NotificationListResponse, NotificationResponse,
        UnreadCountResponse,
    },
};

pub(crate) fn clamp_page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

fn notification_response(record: &NotificationRecord) -> NotificationResponse {
    NotificationResponse {
        notification_id: record.notification_id.clone(),
        kind: record.kind.clone(),
        actor_user_id: record.actor_user_id.map(|id| id.to_string()),
        event_id: record.event_id.clone(),
        chat_id: record.chat_id.clone(),
        is_read: record.is_read,
        created_at_unix: record.created_at_unix,
    }
}

fn notification_from_row(row: &sqlx::postgres::PgRow) -> Result<NotificationResponse, ApiFailure> {
    let actor_user_id: Option<String> = row
        .try_get("actor_user_id")
        .map_err(|_| ApiFailure::Internal)?;
    Ok(NotificationResponse {
        notification_id: row
            .try_get("notification_id")
            .map_err(|_| ApiFailure::Internal)?,
        kind: row.try_get("kind").map_err(|_| ApiFailure::Internal)?,
        actor_user_id,
        event_id: row.try_get("event_id").map_err(|_| ApiFailure::Internal)?,
        chat_id: row.try_get("chat_id").map_err(|_| ApiFailure::Internal)?,
        is_read: row.try_get("is_read").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

/// Newest first. Also backs the gateway replay sent on connect.
pub(crate) async fn list_notifications_for_user(
    state: &AppState,
    user_id: UserId,
    limit: usize,
) -> Result<Vec<NotificationResponse>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let rows = sqlx::query(
            "SELECT notification_id, kind, actor_user_id, event_id, chat_id, is_read, \
                 created_at_unix
             FROM notifications WHERE user_id = $1
             ORDER BY created_at_unix DESC, notification_id DESC
             LIMIT $2",
        )
        .bind(user_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return rows.iter().map(notification_from_row).collect();
    }

    let notifications = state.notifications.read().await;
    let mut items: Vec<NotificationResponse> = notifications
        .get(&user_id.to_string())
        .map(|records| records.iter().map(notification_response).collect())
        .unwrap_or_default();
    items.sort_by(|a, b| {
        b.created_at_unix
            .cmp(&a.created_at_unix)
            .then_with(|| b.notification_id.cmp(&a.notification_id))
    });
    items.truncate(limit);
    Ok(items)
}

/// Best-effort: a notification that fails to persist is logged and dropped,
/// it never fails the operation that triggered it.
pub(crate) async fn notify_user(
    state: &AppState,
    user_id: UserId,
    kind: &str,
    actor_user_id: Option<UserId>,
    event_id: Option<&str>,
    chat_id: Option<&str>,
) {
    let record = NotificationRecord {
        notification_id: state.next_id(),
        user_id,
        kind: kind.to_owned(),
        actor_user_id,
        event_id: event_id.map(str::to_owned),
        chat_id: chat_id.map(str::to_owned),
        is_read: false,
        created_at_unix: now_unix(),
    };

    if let Some(pool) = &state.db_pool {
        let result = sqlx::query(
            "INSERT INTO notifications (notification_id, user_id, kind, actor_user_id, \
                 event_id, chat_id, is_read, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)",
        )
        .bind(&record.notification_id)
        .bind(user_id.to_string())
        .bind(&record.kind)
        .bind(record.actor_user_id.map(|id| id.to_string()))
        .bind(record.event_id.as_deref())
        .bind(record.chat_id.as_deref())
        .bind(record.created_at_unix)
        .execute(pool)
        .await;
        if let Err(e) = result {
            tracing::warn!(event = "notification.persist_failed", kind = %record.kind, error = %e);
            return;
        }
    } else {
        let mut notifications = state.notifications.write().await;
        notifications
            .entry(user_id.to_string())
            .or_default()
            .push(record.clone());
    }

    let response = notification_response(&record);
    let gateway_event = gateway_events::notification(&response);
    push_user_event(state, user_id, &gateway_event).await;
}

pub(crate) async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NotificationListQuery>,
) -> Result<Json<NotificationListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let limit = clamp_page_limit(query.limit);
    let notifications = list_notifications_for_user(&state, auth.user_id, limit).await?;
    Ok(Json(NotificationListResponse { notifications }))
}

/// With no ids in the body every notification for the caller is marked read.
pub(crate) async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<MarkReadRequest>,
) -> Result<Json<UnreadCountResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let user_key = auth.user_id.to_string();

    if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        match &payload.notification_ids {
            Some(ids) => {
                sqlx::query(
                    "UPDATE notifications SET is_read = TRUE \
                     WHERE user_id = $1 AND notification_id = ANY($2)",
                )
                .bind(&user_key)
                .bind(ids)
                .execute(pool)
                .await
                .map_err(|_| ApiFailure::Internal)?;
            }
            None => {
                sqlx::query("UPDATE notifications SET is_read = TRUE WHERE user_id = $1")
                    .bind(&user_key)
                    .execute(pool)
                    .await
                    .map_err(|_| ApiFailure::Internal)?;
            }
        }
    } else {
        let mut notifications = state.notifications.write().await;
        if let Some(records) = notifications.get_mut(&user_key) {
            for record in records.iter_mut() {
                let selected = payload
                    .notification_ids
                    .as_ref()
                    .is_none_or(|ids| ids.contains(&record.notification_id));
                if selected {
                    record.is_read = true;
                }
            }
        }
    }

    let unread = unread_count_for_user(&state, auth.user_id).await?;
    Ok(Json(UnreadCountResponse { unread }))
}

async fn unread_count_for_user(state: &AppState, user_id: UserId) -> Result<i64, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unread FROM notifications WHERE user_id = $1 AND NOT is_read",
        )
        .bind(user_id.to_string())
        .fetch_one(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return row.try_get("unread").map_err(|_| ApiFailure::Internal);
    }
    let notifications = state.notifications.read().await;
    let unread = notifications
        .get(&user_id.to_string())
        .map(|records| records.iter().filter(|record| !record.is_read).count())
        .unwrap_or(0);
    Ok(i64::try_from(unread).unwrap_or(i64::MAX))
}

pub(crate) async fn unread_count(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UnreadCountResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let unread = unread_count_for_user(&state, auth.user_id).await?;
    Ok(Json(UnreadCountResponse { unread }))
}
