use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use meetpoint_core::{EventTitle, Gender, Permission, UserId};
use sqlx::{postgres::PgRow, Row};

use crate::server::{
    auth::{authenticate, now_unix},
    core::{AppState, EventRecord},
    db::ensure_db_schema,
    errors::ApiFailure,
    gateway_events,
    handlers::{
        chats::create_event_chat, notifications::clamp_page_limit, notifications::notify_user,
        users::require_permission,
    },
    realtime::push_user_event,
    types::{
        CreateEventRequest, EventListQuery, EventListResponse, EventParticipantItem,
        EventParticipantsResponse, EventResponse, UpdateEventRequest,
    },
};

const EVENT_COLUMNS: &str = "event_id, title, description, starts_at_unix, location, \
     location_hidden, max_participants, min_age, max_age, gender_constraint, creator_user_id, \
     created_at_unix";

fn validate_age_window(min_age: Option<i64>, max_age: Option<i64>) -> Result<(), ApiFailure> {
    for age in [min_age, max_age].into_iter().flatten() {
        if !(0..=150).contains(&age) {
            return Err(ApiFailure::InvalidRequest);
        }
    }
    if let (Some(min), Some(max)) = (min_age, max_age) {
        if min > max {
            return Err(ApiFailure::InvalidRequest);
        }
    }
    Ok(())
}

/// Hidden locations are only revealed to participants.
pub(crate) fn event_response(record: &EventRecord, viewer: UserId) -> EventResponse {
    let is_participant = record.participants.contains_key(&viewer.to_string());
    let location = if record.location_hidden && !is_participant {
        String::new()
    } else {
        record.location.clone()
    };
    EventResponse {
        event_id: record.event_id.clone(),
        title: record.title.clone(),
        description: record.description.clone(),
        starts_at_unix: record.starts_at_unix,
        location,
        location_hidden: record.location_hidden,
        max_participants: record.max_participants,
        participant_count: i64::try_from(record.participants.len()).unwrap_or(i64::MAX),
        min_age: record.min_age,
        max_age: record.max_age,
        gender_constraint: record.gender_constraint.map(|g| g.as_str().to_owned()),
        creator_user_id: record.creator_user_id.to_string(),
        is_participant,
        created_at_unix: record.created_at_unix,
    }
}

fn event_record_from_row(row: &PgRow) -> Result<EventRecord, ApiFailure> {
    let creator: String = row
        .try_get("creator_user_id")
        .map_err(|_| ApiFailure::Internal)?;
    let creator_user_id = UserId::try_from(creator).map_err(|_| ApiFailure::Internal)?;
    let gender_constraint: Option<String> = row
        .try_get("gender_constraint")
        .map_err(|_| ApiFailure::Internal)?;
    let gender_constraint = gender_constraint
        .map(Gender::try_from)
        .transpose()
        .map_err(|_| ApiFailure::Internal)?;
    Ok(EventRecord {
        event_id: row.try_get("event_id").map_err(|_| ApiFailure::Internal)?,
        title: row.try_get("title").map_err(|_| ApiFailure::Internal)?,
        description: row
            .try_get("description")
            .map_err(|_| ApiFailure::Internal)?,
        starts_at_unix: row
            .try_get("starts_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
        location: row.try_get("location").map_err(|_| ApiFailure::Internal)?,
        location_hidden: row
            .try_get("location_hidden")
            .map_err(|_| ApiFailure::Internal)?,
        max_participants: row
            .try_get("max_participants")
            .map_err(|_| ApiFailure::Internal)?,
        min_age: row.try_get("min_age").map_err(|_| ApiFailure::Internal)?,
        max_age: row.try_get("max_age").map_err(|_| ApiFailure::Internal)?,
        gender_constraint,
        creator_user_id,
        participants: HashMap::new(),
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

/// Loads an event with its participant map populated.
pub(crate) async fn load_event(
    state: &AppState,
    event_id: &str,
) -> Result<Option<EventRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = event_record_from_row(&row)?;
        let participant_rows =
            sqlx::query("SELECT user_id, joined_at_unix FROM event_participants WHERE event_id = $1")
                .bind(event_id)
                .fetch_all(pool)
                .await
                .map_err(|_| ApiFailure::Internal)?;
        for participant in &participant_rows {
            let user_id: String = participant
                .try_get("user_id")
                .map_err(|_| ApiFailure::Internal)?;
            let joined_at: i64 = participant
                .try_get("joined_at_unix")
                .map_err(|_| ApiFailure::Internal)?;
            record.participants.insert(user_id, joined_at);
        }
        return Ok(Some(record));
    }
    Ok(state.events.read().await.get(event_id).cloned())
}

pub(crate) async fn add_event_participant(
    state: &AppState,
    event_id: &str,
    user_id: UserId,
    joined_at_unix: i64,
) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO event_participants (event_id, user_id, joined_at_unix) \
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .bind(user_id.to_string())
        .bind(joined_at_unix)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return Ok(());
    }
    let mut events = state.events.write().await;
    if let Some(record) = events.get_mut(event_id) {
        record
            .participants
            .entry(user_id.to_string())
            .or_insert(joined_at_unix);
    }
    Ok(())
}

pub(crate) async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<EventResponse>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let title = EventTitle::try_from(payload.title).map_err(|_| ApiFailure::InvalidRequest)?;
    if payload.max_participants < 1 {
        return Err(ApiFailure::InvalidRequest);
    }
    validate_age_window(payload.min_age, payload.max_age)?;
    let gender_constraint = payload
        .gender_constraint
        .map(Gender::try_from)
        .transpose()
        .map_err(|_| ApiFailure::InvalidRequest)?;
    if payload.location.trim().is_empty() || payload.location.len() > 512 {
        return Err(ApiFailure::InvalidRequest);
    }

    let now = now_unix();
    let event_id = state.next_id();
    let record = EventRecord {
        event_id: event_id.clone(),
        title: title.as_str().to_owned(),
        description: payload.description.unwrap_or_default(),
        starts_at_unix: payload.starts_at_unix,
        location: payload.location,
        location_hidden: payload.location_hidden.unwrap_or(false),
        max_participants: payload.max_participants,
        min_age: payload.min_age,
        max_age: payload.max_age,
        gender_constraint,
        creator_user_id: auth.user_id,
        participants: HashMap::from([(auth.user_id.to_string(), now)]),
        created_at_unix: now,
    };

    if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        sqlx::query(&format!(
            "INSERT INTO events ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(&record.event_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.starts_at_unix)
        .bind(&record.location)
        .bind(record.location_hidden)
        .bind(record.max_participants)
        .bind(record.min_age)
        .bind(record.max_age)
        .bind(record.gender_constraint.map(Gender::as_str))
        .bind(record.creator_user_id.to_string())
        .bind(record.created_at_unix)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "INSERT INTO event_participants (event_id, user_id, joined_at_unix) VALUES ($1, $2, $3)",
        )
        .bind(&record.event_id)
        .bind(auth.user_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut events = state.events.write().await;
        events.insert(event_id.clone(), record.clone());
    }

    // Every event gets a chat up front with the creator enrolled.
    create_event_chat(&state, &event_id, auth.user_id, now).await?;

    tracing::info!(event = "event.create", event_id = %event_id, creator = %auth.user_id);
    Ok((StatusCode::CREATED, Json(event_response(&record, auth.user_id))))
}

pub(crate) async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventListQuery>,
) -> Result<Json<EventListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let limit = clamp_page_limit(query.limit);
    let offset = query.offset.unwrap_or(0);
    let now = now_unix();
    let needle = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase);
    let upcoming_only = query.upcoming.unwrap_or(false);

    let mut records: Vec<EventRecord> = if state.db_pool.is_some() {
        let event_ids = list_event_ids(&state).await?;
        let mut loaded = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            if let Some(record) = load_event(&state, &event_id).await? {
                loaded.push(record);
            }
        }
        loaded
    } else {
        state.events.read().await.values().cloned().collect()
    };

    records.retain(|record| {
        if upcoming_only && record.starts_at_unix < now {
            return false;
        }
        match &needle {
            Some(needle) => record.title.to_lowercase().contains(needle),
            None => true,
        }
    });
    records.sort_by(|a, b| {
        a.starts_at_unix
            .cmp(&b.starts_at_unix)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    let events = records
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|record| event_response(&record, auth.user_id))
        .collect();

    Ok(Json(EventListResponse { events }))
}

async fn list_event_ids(state: &AppState) -> Result<Vec<String>, ApiFailure> {
    let Some(pool) = &state.db_pool else {
        return Ok(Vec::new());
    };
    ensure_db_schema(state).await?;
    let rows = sqlx::query("SELECT event_id FROM events")
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    rows.iter()
        .map(|row| row.try_get("event_id").map_err(|_| ApiFailure::Internal))
        .collect()
}

pub(crate) async fn get_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<Json<EventResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_event(&state, &event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    Ok(Json(event_response(&record, auth.user_id)))
}

pub(crate) async fn update_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Json(payload): Json<UpdateEventRequest>,
) -> Result<Json<EventResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let mut record = load_event(&state, &event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.creator_user_id != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }

    if let Some(title) = payload.title {
        let title = EventTitle::try_from(title).map_err(|_| ApiFailure::InvalidRequest)?;
        record.title = title.as_str().to_owned();
    }
    if let Some(description) = payload.description {
        record.description = description;
    }
    if let Some(starts_at_unix) = payload.starts_at_unix {
        record.starts_at_unix = starts_at_unix;
    }
    if let Some(location) = payload.location {
        if location.trim().is_empty() || location.len() > 512 {
            return Err(ApiFailure::InvalidRequest);
        }
        record.location = location;
    }
    if let Some(location_hidden) = payload.location_hidden {
        record.location_hidden = location_hidden;
    }
    if let Some(max_participants) = payload.max_participants {
        // Capacity never shrinks below the current headcount.
        if max_participants < i64::try_from(record.participants.len()).unwrap_or(i64::MAX) {
            return Err(ApiFailure::InvalidRequest);
        }
        record.max_participants = max_participants;
    }
    if let Some(min_age) = payload.min_age {
        record.min_age = Some(min_age);
    }
    if let Some(max_age) = payload.max_age {
        record.max_age = Some(max_age);
    }
    validate_age_window(record.min_age, record.max_age)?;
    if let Some(gender_constraint) = payload.gender_constraint {
        let gender =
            Gender::try_from(gender_constraint).map_err(|_| ApiFailure::InvalidRequest)?;
        record.gender_constraint = Some(gender);
    }

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "UPDATE events SET title = $2, description = $3, starts_at_unix = $4, location = $5, \
                 location_hidden = $6, max_participants = $7, min_age = $8, max_age = $9, \
                 gender_constraint = $10
             WHERE event_id = $1",
        )
        .bind(&record.event_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.starts_at_unix)
        .bind(&record.location)
        .bind(record.location_hidden)
        .bind(record.max_participants)
        .bind(record.min_age)
        .bind(record.max_age)
        .bind(record.gender_constraint.map(Gender::as_str))
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut events = state.events.write().await;
        events.insert(record.event_id.clone(), record.clone());
    }

    let response = event_response(&record, auth.user_id);
    let gateway_event = gateway_events::event_update(&response);
    for participant in record.participants.keys() {
        if let Ok(participant_id) = UserId::try_from(participant.clone()) {
            if participant_id != auth.user_id {
                push_user_event(&state, participant_id, &gateway_event).await;
            }
        }
    }

    tracing::info!(event = "event.update", event_id = %record.event_id);
    Ok(Json(response))
}

pub(crate) async fn delete_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_event(&state, &event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.creator_user_id != auth.user_id {
        require_permission(&state, auth.user_id, Permission::ManageEvents).await?;
    }

    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "DELETE FROM messages WHERE chat_id IN (SELECT chat_id FROM chats WHERE event_id = $1)",
        )
        .bind(&event_id)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "DELETE FROM chat_participants \
             WHERE chat_id IN (SELECT chat_id FROM chats WHERE event_id = $1)",
        )
        .bind(&event_id)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        for table_sql in [
            "DELETE FROM chats WHERE event_id = $1",
            "DELETE FROM participation_requests WHERE event_id = $1",
            "DELETE FROM event_participants WHERE event_id = $1",
            "DELETE FROM events WHERE event_id = $1",
        ] {
            sqlx::query(table_sql)
                .bind(&event_id)
                .execute(&mut *tx)
                .await
                .map_err(|_| ApiFailure::Internal)?;
        }
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        let chat_id = {
            let mut chats = state.chats.write().await;
            let chat_id = chats
                .values()
                .find(|chat| chat.event_id.as_deref() == Some(event_id.as_str()))
                .map(|chat| chat.chat_id.clone());
            if let Some(chat_id) = &chat_id {
                chats.remove(chat_id);
            }
            chat_id
        };
        if let Some(chat_id) = chat_id {
            state.messages.write().await.remove(&chat_id);
        }
        state
            .participation_requests
            .write()
            .await
            .retain(|_, request| request.event_id != event_id);
        state.events.write().await.remove(&event_id);
    }

    for participant in record.participants.keys() {
        if let Ok(participant_id) = UserId::try_from(participant.clone()) {
            if participant_id != auth.user_id {
                notify_user(
                    &state,
                    participant_id,
                    "event_cancelled",
                    Some(auth.user_id),
                    Some(&event_id),
                    None,
                )
                .await;
            }
        }
    }

    tracing::info!(event = "event.delete", event_id = %event_id, actor = %auth.user_id);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_participants(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<Json<EventParticipantsResponse>, ApiFailure> {
    authenticate(&state, &headers).await?;
    let record = load_event(&state, &event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;

    let mut participants = Vec::with_capacity(record.participants.len());
    if let Some(pool) = &state.db_pool {
        let rows = sqlx::query(
            "SELECT p.user_id, p.joined_at_unix, u.display_name
             FROM event_participants p JOIN users u ON u.user_id = p.user_id
             WHERE p.event_id = $1
             ORDER BY p.joined_at_unix ASC, p.user_id ASC",
        )
        .bind(&event_id)
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        for row in &rows {
            participants.push(EventParticipantItem {
                user_id: row.try_get("user_id").map_err(|_| ApiFailure::Internal)?,
                display_name: row
                    .try_get("display_name")
                    .map_err(|_| ApiFailure::Internal)?,
                joined_at_unix: row
                    .try_get("joined_at_unix")
                    .map_err(|_| ApiFailure::Internal)?,
            });
        }
    } else {
        let users = state.users.read().await;
        for (user_id, joined_at_unix) in &record.participants {
            let display_name = users
                .get(user_id)
                .map(|user| user.display_name.clone())
                .unwrap_or_default();
            participants.push(EventParticipantItem {
                user_id: user_id.clone(),
                display_name,
                joined_at_unix: *joined_at_unix,
            });
        }
        participants.sort_by(|a, b| {
            a.joined_at_unix
                .cmp(&b.joined_at_unix)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
    }

    Ok(Json(EventParticipantsResponse { participants }))
}

/// The creator cannot leave their own event; they delete it instead.
pub(crate) async fn leave_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_event(&state, &event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if record.creator_user_id == auth.user_id {
        return Err(ApiFailure::InvalidRequest);
    }
    if !record.participants.contains_key(&auth.user_id.to_string()) {
        return Err(ApiFailure::NotFound);
    }

    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        sqlx::query("DELETE FROM event_participants WHERE event_id = $1 AND user_id = $2")
            .bind(&event_id)
            .bind(auth.user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "DELETE FROM chat_participants WHERE user_id = $2 \
             AND chat_id IN (SELECT chat_id FROM chats WHERE event_id = $1)",
        )
        .bind(&event_id)
        .bind(auth.user_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut events = state.events.write().await;
        if let Some(record) = events.get_mut(&event_id) {
            record.participants.remove(&auth.user_id.to_string());
        }
        drop(events);
        let mut chats = state.chats.write().await;
        if let Some(chat) = chats
            .values_mut()
            .find(|chat| chat.event_id.as_deref() == Some(event_id.as_str()))
        {
            chat.participants.remove(&auth.user_id.to_string());
        }
    }

    notify_user(
        &state,
        record.creator_user_id,
        "participant_left",
        Some(auth.user_id),
        Some(&event_id),
        None,
    )
    .await;

    tracing::info!(event = "event.leave", event_id = %event_id, user_id = %auth.user_id);
    Ok(StatusCode::NO_CONTENT)
}
