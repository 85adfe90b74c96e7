use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use meetpoint_core::UserId;
use sqlx::{postgres::PgRow, Row};

use crate::server::{
    auth::{authenticate, now_unix},
    core::{AppState, FriendRequestRecord},
    db::ensure_db_schema,
    errors::ApiFailure,
    gateway_events,
    handlers::{auth::load_user_record, notifications::notify_user},
    realtime::push_user_event,
    types::{
        CreateFriendRequestBody, FriendItem, FriendListResponse, FriendRequestItem,
        FriendRequestsResponse, FriendshipResponse,
    },
};

fn request_item(record: &FriendRequestRecord) -> FriendRequestItem {
    FriendRequestItem {
        request_id: record.request_id.clone(),
        sender_user_id: record.sender_user_id.to_string(),
        recipient_user_id: record.recipient_user_id.to_string(),
        created_at_unix: record.created_at_unix,
    }
}

fn request_from_row(row: &PgRow) -> Result<FriendRequestRecord, ApiFailure> {
    let sender: String = row
        .try_get("sender_user_id")
        .map_err(|_| ApiFailure::Internal)?;
    let recipient: String = row
        .try_get("recipient_user_id")
        .map_err(|_| ApiFailure::Internal)?;
    Ok(FriendRequestRecord {
        request_id: row.try_get("request_id").map_err(|_| ApiFailure::Internal)?,
        sender_user_id: UserId::try_from(sender).map_err(|_| ApiFailure::Internal)?,
        recipient_user_id: UserId::try_from(recipient).map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

async fn load_request(
    state: &AppState,
    request_id: &str,
) -> Result<Option<FriendRequestRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query(
            "SELECT request_id, sender_user_id, recipient_user_id, created_at_unix \
             FROM friend_requests WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return row.as_ref().map(request_from_row).transpose();
    }
    Ok(state.friend_requests.read().await.get(request_id).cloned())
}

async fn are_friends(state: &AppState, a: UserId, b: UserId) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT 1 AS present FROM friends WHERE user_id = $1 AND friend_user_id = $2",
        )
        .bind(a.to_string())
        .bind(b.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return Ok(row.is_some());
    }
    let edges = state.friend_edges.read().await;
    Ok(edges.contains_key(&(a.to_string(), b.to_string())))
}

async fn pending_request_between(
    state: &AppState,
    a: UserId,
    b: UserId,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT 1 AS present FROM friend_requests \
             WHERE (sender_user_id = $1 AND recipient_user_id = $2) \
                OR (sender_user_id = $2 AND recipient_user_id = $1)",
        )
        .bind(a.to_string())
        .bind(b.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return Ok(row.is_some());
    }
    let requests = state.friend_requests.read().await;
    Ok(requests.values().any(|request| {
        (request.sender_user_id == a && request.recipient_user_id == b)
            || (request.sender_user_id == b && request.recipient_user_id == a)
    }))
}

async fn delete_request(state: &AppState, request_id: &str) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        sqlx::query("DELETE FROM friend_requests WHERE request_id = $1")
            .bind(request_id)
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        return Ok(());
    }
    state.friend_requests.write().await.remove(request_id);
    Ok(())
}

/// A pending request in either direction blocks a new one; so does an
/// existing friendship.
pub(crate) async fn create_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateFriendRequestBody>,
) -> Result<(StatusCode, Json<FriendRequestItem>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let recipient =
        UserId::try_from(payload.recipient_user_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if recipient == auth.user_id {
        return Err(ApiFailure::InvalidRequest);
    }
    load_user_record(&state, &recipient.to_string())
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if are_friends(&state, auth.user_id, recipient).await? {
        return Err(ApiFailure::Conflict);
    }
    if pending_request_between(&state, auth.user_id, recipient).await? {
        return Err(ApiFailure::Conflict);
    }

    let record = FriendRequestRecord {
        request_id: state.next_id(),
        sender_user_id: auth.user_id,
        recipient_user_id: recipient,
        created_at_unix: now_unix(),
    };

    if let Some(pool) = &state.db_pool {
        let inserted = sqlx::query(
            "INSERT INTO friend_requests (request_id, sender_user_id, recipient_user_id, \
                 created_at_unix)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (sender_user_id, recipient_user_id) DO NOTHING",
        )
        .bind(&record.request_id)
        .bind(record.sender_user_id.to_string())
        .bind(record.recipient_user_id.to_string())
        .bind(record.created_at_unix)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        if inserted.rows_affected() == 0 {
            return Err(ApiFailure::Conflict);
        }
    } else {
        let mut requests = state.friend_requests.write().await;
        requests.insert(record.request_id.clone(), record.clone());
    }

    notify_user(
        &state,
        recipient,
        "friend_request",
        Some(auth.user_id),
        None,
        None,
    )
    .await;
    let update = gateway_events::friend_update(
        "requested",
        &recipient.to_string(),
        &auth.user_id.to_string(),
        Some(&record.request_id),
        record.created_at_unix,
    );
    push_user_event(&state, recipient, &update).await;

    tracing::info!(
        event = "friend.request",
        request_id = %record.request_id,
        sender = %auth.user_id,
        recipient = %recipient
    );
    Ok((StatusCode::CREATED, Json(request_item(&record))))
}

pub(crate) async fn list_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FriendRequestsResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let user_key = auth.user_id.to_string();

    let (mut incoming, mut outgoing) = if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let rows = sqlx::query(
            "SELECT request_id, sender_user_id, recipient_user_id, created_at_unix \
             FROM friend_requests WHERE sender_user_id = $1 OR recipient_user_id = $1",
        )
        .bind(&user_key)
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();
        for row in &rows {
            let record = request_from_row(row)?;
            if record.recipient_user_id == auth.user_id {
                incoming.push(request_item(&record));
            } else {
                outgoing.push(request_item(&record));
            }
        }
        (incoming, outgoing)
    } else {
        let requests = state.friend_requests.read().await;
        let incoming = requests
            .values()
            .filter(|record| record.recipient_user_id == auth.user_id)
            .map(request_item)
            .collect();
        let outgoing = requests
            .values()
            .filter(|record| record.sender_user_id == auth.user_id)
            .map(request_item)
            .collect();
        (incoming, outgoing)
    };

    incoming.sort_by(|a: &FriendRequestItem, b| b.created_at_unix.cmp(&a.created_at_unix));
    outgoing.sort_by(|a: &FriendRequestItem, b| b.created_at_unix.cmp(&a.created_at_unix));
    Ok(Json(FriendRequestsResponse { incoming, outgoing }))
}

/// Acceptance writes both directed rows atomically, so the friendship reads
/// the same from either side.
pub(crate) async fn accept_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<Json<FriendshipResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_request(&state, &request_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.recipient_user_id != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }

    let now = now_unix();
    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        for (a, b) in [
            (record.sender_user_id, record.recipient_user_id),
            (record.recipient_user_id, record.sender_user_id),
        ] {
            sqlx::query(
                "INSERT INTO friends (user_id, friend_user_id, created_at_unix) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(a.to_string())
            .bind(b.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        }
        sqlx::query("DELETE FROM friend_requests WHERE request_id = $1")
            .bind(&request_id)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut edges = state.friend_edges.write().await;
        edges.insert(
            (
                record.sender_user_id.to_string(),
                record.recipient_user_id.to_string(),
            ),
            now,
        );
        edges.insert(
            (
                record.recipient_user_id.to_string(),
                record.sender_user_id.to_string(),
            ),
            now,
        );
        drop(edges);
        state.friend_requests.write().await.remove(&request_id);
    }

    notify_user(
        &state,
        record.sender_user_id,
        "friend_accepted",
        Some(auth.user_id),
        None,
        None,
    )
    .await;
    for (recipient, other) in [
        (record.sender_user_id, record.recipient_user_id),
        (record.recipient_user_id, record.sender_user_id),
    ] {
        let update = gateway_events::friend_update(
            "accepted",
            &recipient.to_string(),
            &other.to_string(),
            Some(&request_id),
            now,
        );
        push_user_event(&state, recipient, &update).await;
    }

    tracing::info!(event = "friend.accept", request_id = %request_id);
    Ok(Json(FriendshipResponse {
        user_id: record.recipient_user_id.to_string(),
        friend_user_id: record.sender_user_id.to_string(),
        created_at_unix: now,
    }))
}

pub(crate) async fn reject_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_request(&state, &request_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.recipient_user_id != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }

    delete_request(&state, &request_id).await?;
    notify_user(
        &state,
        record.sender_user_id,
        "friend_rejected",
        Some(auth.user_id),
        None,
        None,
    )
    .await;
    let update = gateway_events::friend_update(
        "rejected",
        &record.sender_user_id.to_string(),
        &auth.user_id.to_string(),
        Some(&request_id),
        now_unix(),
    );
    push_user_event(&state, record.sender_user_id, &update).await;

    tracing::info!(event = "friend.reject", request_id = %request_id);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn cancel_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_request(&state, &request_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.sender_user_id != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }

    delete_request(&state, &request_id).await?;
    notify_user(
        &state,
        record.recipient_user_id,
        "friend_cancelled",
        Some(auth.user_id),
        None,
        None,
    )
    .await;
    let update = gateway_events::friend_update(
        "cancelled",
        &record.recipient_user_id.to_string(),
        &auth.user_id.to_string(),
        Some(&request_id),
        now_unix(),
    );
    push_user_event(&state, record.recipient_user_id, &update).await;

    tracing::info!(event = "friend.cancel", request_id = %request_id);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_friends(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FriendListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let user_key = auth.user_id.to_string();

    let mut friends = Vec::new();
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let rows = sqlx::query(
            "SELECT f.friend_user_id, f.created_at_unix, u.display_name, u.avatar_url
             FROM friends f JOIN users u ON u.user_id = f.friend_user_id
             WHERE f.user_id = $1
             ORDER BY f.created_at_unix DESC, f.friend_user_id ASC",
        )
        .bind(&user_key)
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        for row in &rows {
            friends.push(FriendItem {
                user_id: row
                    .try_get("friend_user_id")
                    .map_err(|_| ApiFailure::Internal)?,
                display_name: row
                    .try_get("display_name")
                    .map_err(|_| ApiFailure::Internal)?,
                avatar_url: row.try_get("avatar_url").map_err(|_| ApiFailure::Internal)?,
                created_at_unix: row
                    .try_get("created_at_unix")
                    .map_err(|_| ApiFailure::Internal)?,
            });
        }
    } else {
        let edges = state.friend_edges.read().await;
        let users = state.users.read().await;
        for ((from, to), created_at_unix) in edges.iter() {
            if from != &user_key {
                continue;
            }
            let Some(user) = users.get(to) else {
                continue;
            };
            friends.push(FriendItem {
                user_id: to.clone(),
                display_name: user.display_name.clone(),
                avatar_url: user.avatar_url.clone(),
                created_at_unix: *created_at_unix,
            });
        }
        friends.sort_by(|a, b| {
            b.created_at_unix
                .cmp(&a.created_at_unix)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
    }

    Ok(Json(FriendListResponse { friends }))
}

pub(crate) async fn remove_friend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(friend_user_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let friend = UserId::try_from(friend_user_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if !are_friends(&state, auth.user_id, friend).await? {
        return Err(ApiFailure::NotFound);
    }

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "DELETE FROM friends \
             WHERE (user_id = $1 AND friend_user_id = $2) \
                OR (user_id = $2 AND friend_user_id = $1)",
        )
        .bind(auth.user_id.to_string())
        .bind(friend.to_string())
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut edges = state.friend_edges.write().await;
        edges.remove(&(auth.user_id.to_string(), friend.to_string()));
        edges.remove(&(friend.to_string(), auth.user_id.to_string()));
    }

    let update = gateway_events::friend_update(
        "removed",
        &friend.to_string(),
        &auth.user_id.to_string(),
        None,
        now_unix(),
    );
    push_user_event(&state, friend, &update).await;

    tracing::info!(event = "friend.remove", user_id = %auth.user_id, friend = %friend);
    Ok(StatusCode::NO_CONTENT)
}
