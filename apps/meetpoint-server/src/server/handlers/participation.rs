use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use meetpoint_core::UserId;
use sqlx::{postgres::PgRow, Row};

use crate::server::{
    auth::{authenticate, now_unix},
    core::{AppState, EventRecord, ParticipationKind, ParticipationRequestRecord, UserRecord},
    db::ensure_db_schema,
    errors::ApiFailure,
    gateway_events,
    handlers::{
        auth::load_user_record,
        chats::enroll_in_event_chat,
        events::{add_event_participant, event_response, load_event},
        messages::append_system_message,
        notifications::notify_user,
    },
    realtime::push_user_event,
    types::{
        EventResponse, InviteRequestBody, ParticipationRequestItem, ParticipationRequestsResponse,
    },
};

const SECONDS_PER_YEAR: i64 = 31_557_600;

fn request_item(record: &ParticipationRequestRecord) -> ParticipationRequestItem {
    ParticipationRequestItem {
        request_id: record.request_id.clone(),
        event_id: record.event_id.clone(),
        user_id: record.user_id.to_string(),
        kind: record.kind.as_str().to_owned(),
        meets_age: record.meets_age,
        meets_gender: record.meets_gender,
        created_at_unix: record.created_at_unix,
    }
}

fn request_from_row(row: &PgRow) -> Result<ParticipationRequestRecord, ApiFailure> {
    let user_id: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
    let kind: String = row.try_get("kind").map_err(|_| ApiFailure::Internal)?;
    Ok(ParticipationRequestRecord {
        request_id: row.try_get("request_id").map_err(|_| ApiFailure::Internal)?,
        event_id: row.try_get("event_id").map_err(|_| ApiFailure::Internal)?,
        user_id: UserId::try_from(user_id).map_err(|_| ApiFailure::Internal)?,
        kind: ParticipationKind::parse(&kind).ok_or(ApiFailure::Internal)?,
        meets_age: row.try_get("meets_age").map_err(|_| ApiFailure::Internal)?,
        meets_gender: row.try_get("meets_gender").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

/// Advisory eligibility flags shown to the event creator. None means the
/// event has no constraint of that kind.
fn eligibility(user: &UserRecord, event: &EventRecord, now: i64) -> (Option<bool>, Option<bool>) {
    let meets_age = if event.min_age.is_none() && event.max_age.is_none() {
        None
    } else {
        Some(match user.birth_date_unix {
            Some(birth) => {
                let age = (now.saturating_sub(birth)) / SECONDS_PER_YEAR;
                event.min_age.is_none_or(|min| age >= min)
                    && event.max_age.is_none_or(|max| age <= max)
            }
            None => false,
        })
    };
    let meets_gender = event
        .gender_constraint
        .map(|required| user.gender == Some(required));
    (meets_age, meets_gender)
}

async fn load_request(
    state: &AppState,
    request_id: &str,
) -> Result<Option<ParticipationRequestRecord>, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query(
            "SELECT request_id, event_id, user_id, kind, meets_age, meets_gender, created_at_unix \
             FROM participation_requests WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return row.as_ref().map(request_from_row).transpose();
    }
    Ok(state
        .participation_requests
        .read()
        .await
        .get(request_id)
        .cloned())
}

async fn insert_request(
    state: &AppState,
    record: &ParticipationRequestRecord,
) -> Result<bool, ApiFailure> {
    if let Some(pool) = &state.db_pool {
        let inserted = sqlx::query(
            "INSERT INTO participation_requests (request_id, event_id, user_id, kind, meets_age, \
                 meets_gender, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (event_id, user_id) DO NOTHING",
        )
        .bind(&record.request_id)
        .bind(&record.event_id)
        .bind(record.user_id.to_string())
        .bind(record.kind.as_str())
        .bind(record.meets_age)
        .bind(record.meets_gender)
        .bind(record.created_at_unix)
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        return Ok(inserted.rows_affected() > 0);
    }
    let mut requests = state.participation_requests.write().await;
    let duplicate = requests
        .values()
        .any(|existing| existing.event_id == record.event_id && existing.user_id == record.user_id);
    if duplicate {
        return Ok(false);
    }
    requests.insert(record.request_id.clone(), record.clone());
    Ok(true)
}

async fn delete_request(state: &AppState, request_id: &str) -> Result<(), ApiFailure> {
    if let Some(pool) = &state.db_pool {
        sqlx::query("DELETE FROM participation_requests WHERE request_id = $1")
            .bind(request_id)
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        return Ok(());
    }
    state.participation_requests.write().await.remove(request_id);
    Ok(())
}

fn event_is_full(event: &EventRecord) -> bool {
    i64::try_from(event.participants.len()).unwrap_or(i64::MAX) >= event.max_participants
}

pub(crate) async fn apply(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<(StatusCode, Json<ParticipationRequestItem>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let event = load_event(&state, &event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if event.participants.contains_key(&auth.user_id.to_string()) {
        return Err(ApiFailure::Conflict);
    }
    if event_is_full(&event) {
        return Err(ApiFailure::EventFull);
    }

    let now = now_unix();
    let user = load_user_record(&state, &auth.user_id.to_string())
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    let (meets_age, meets_gender) = eligibility(&user, &event, now);
    let record = ParticipationRequestRecord {
        request_id: state.next_id(),
        event_id: event_id.clone(),
        user_id: auth.user_id,
        kind: ParticipationKind::Application,
        meets_age,
        meets_gender,
        created_at_unix: now,
    };
    if !insert_request(&state, &record).await? {
        return Err(ApiFailure::Conflict);
    }

    notify_user(
        &state,
        event.creator_user_id,
        "event_application",
        Some(auth.user_id),
        Some(&event_id),
        None,
    )
    .await;

    tracing::info!(
        event = "participation.apply",
        request_id = %record.request_id,
        event_id = %event_id,
        user_id = %auth.user_id
    );
    Ok((StatusCode::CREATED, Json(request_item(&record))))
}

pub(crate) async fn invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
    Json(payload): Json<InviteRequestBody>,
) -> Result<(StatusCode, Json<ParticipationRequestItem>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let event = load_event(&state, &event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if event.creator_user_id != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }
    let invitee = UserId::try_from(payload.user_id).map_err(|_| ApiFailure::InvalidRequest)?;
    if invitee == auth.user_id {
        return Err(ApiFailure::InvalidRequest);
    }
    let user = load_user_record(&state, &invitee.to_string())
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if event.participants.contains_key(&invitee.to_string()) {
        return Err(ApiFailure::Conflict);
    }

    let now = now_unix();
    let (meets_age, meets_gender) = eligibility(&user, &event, now);
    let record = ParticipationRequestRecord {
        request_id: state.next_id(),
        event_id: event_id.clone(),
        user_id: invitee,
        kind: ParticipationKind::Invitation,
        meets_age,
        meets_gender,
        created_at_unix: now,
    };
    if !insert_request(&state, &record).await? {
        return Err(ApiFailure::Conflict);
    }

    notify_user(
        &state,
        invitee,
        "event_invitation",
        Some(auth.user_id),
        Some(&event_id),
        None,
    )
    .await;

    tracing::info!(
        event = "participation.invite",
        request_id = %record.request_id,
        event_id = %event_id,
        invitee = %invitee
    );
    Ok((StatusCode::CREATED, Json(request_item(&record))))
}

/// Incoming requests await the caller's decision; outgoing ones were
/// initiated by the caller and await someone else's.
pub(crate) async fn list_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ParticipationRequestsResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;

    let records: Vec<ParticipationRequestRecord> = if let Some(pool) = &state.db_pool {
        ensure_db_schema(&state).await?;
        let rows = sqlx::query(
            "SELECT r.request_id, r.event_id, r.user_id, r.kind, r.meets_age, r.meets_gender, \
                 r.created_at_unix
             FROM participation_requests r JOIN events e ON e.event_id = r.event_id
             WHERE r.user_id = $1 OR e.creator_user_id = $1",
        )
        .bind(auth.user_id.to_string())
        .fetch_all(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        rows.iter().map(request_from_row).collect::<Result<_, _>>()?
    } else {
        let requests = state.participation_requests.read().await;
        let events = state.events.read().await;
        requests
            .values()
            .filter(|record| {
                record.user_id == auth.user_id
                    || events
                        .get(&record.event_id)
                        .is_some_and(|event| event.creator_user_id == auth.user_id)
            })
            .cloned()
            .collect()
    };

    let mut incoming = Vec::new();
    let mut outgoing = Vec::new();
    for record in &records {
        let initiated_by_caller = match record.kind {
            ParticipationKind::Application => record.user_id == auth.user_id,
            ParticipationKind::Invitation => record.user_id != auth.user_id,
        };
        if initiated_by_caller {
            outgoing.push(request_item(record));
        } else {
            incoming.push(request_item(record));
        }
    }
    incoming.sort_by(|a, b| b.created_at_unix.cmp(&a.created_at_unix));
    outgoing.sort_by(|a, b| b.created_at_unix.cmp(&a.created_at_unix));

    Ok(Json(ParticipationRequestsResponse { incoming, outgoing }))
}

fn decider_for(record: &ParticipationRequestRecord, event: &EventRecord) -> UserId {
    match record.kind {
        ParticipationKind::Application => event.creator_user_id,
        ParticipationKind::Invitation => record.user_id,
    }
}

fn initiator_for(record: &ParticipationRequestRecord, event: &EventRecord) -> UserId {
    match record.kind {
        ParticipationKind::Application => record.user_id,
        ParticipationKind::Invitation => event.creator_user_id,
    }
}

/// A full event rejects the acceptance but keeps the request, so it can be
/// accepted later if a seat frees up.
pub(crate) async fn accept_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<Json<EventResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let record = load_request(&state, &request_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    let event = load_event(&state, &record.event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if decider_for(&record, &event) != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }
    if event.participants.contains_key(&record.user_id.to_string()) {
        delete_request(&state, &request_id).await?;
        return Ok(Json(event_response(&event, auth.user_id)));
    }
    if event_is_full(&event) {
        return Err(ApiFailure::EventFull);
    }

    let now = now_unix();
    if let Some(pool) = &state.db_pool {
        let mut tx = pool.begin().await.map_err(|_| ApiFailure::Internal)?;
        sqlx::query(
            "INSERT INTO event_participants (event_id, user_id, joined_at_unix) \
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(&record.event_id)
        .bind(record.user_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiFailure::Internal)?;
        sqlx::query("DELETE FROM participation_requests WHERE request_id = $1")
            .bind(&request_id)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        tx.commit().await.map_err(|_| ApiFailure::Internal)?;
    } else {
        add_event_participant(&state, &record.event_id, record.user_id, now).await?;
        delete_request(&state, &request_id).await?;
    }

    // The chat enrollment and announcements are best-effort; membership is
    // already committed.
    match enroll_in_event_chat(&state, &record.event_id, record.user_id).await {
        Ok(Some(chat_id)) => {
            let display_name = load_user_record(&state, &record.user_id.to_string())
                .await
                .ok()
                .flatten()
                .map(|user| user.display_name)
                .unwrap_or_else(|| record.user_id.to_string());
            append_system_message(&state, &chat_id, &format!("{display_name} joined")).await;
        }
        Ok(None) => {}
        Err(_) => {
            tracing::warn!(event = "participation.chat_enroll_failed", event_id = %record.event_id);
        }
    }

    let other = initiator_for(&record, &event);
    let kind = match record.kind {
        ParticipationKind::Application => "application_accepted",
        ParticipationKind::Invitation => "invitation_accepted",
    };
    notify_user(
        &state,
        other,
        kind,
        Some(auth.user_id),
        Some(&record.event_id),
        None,
    )
    .await;

    let updated = load_event(&state, &record.event_id)
        .await?
        .ok_or(ApiFailure::Internal)?;
    let gateway_event = gateway_events::event_update(&event_response(&updated, auth.user_id));
    for participant in updated.participants.keys() {
        if let Ok(participant_id) = UserId::try_from(participant.clone()) {
            if participant_id != auth.user_id {
                push_user_event(&state, participant_id, &gateway_event).await;
            }
        }
    }

    tracing::info!(event = "participation.accept", request_id = %request_id);
    Ok(Json(event_response(&updated, auth.user_id)))
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
    let event = load_event(&state, &record.event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if decider_for(&record, &event) != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }

    delete_request(&state, &request_id).await?;
    let other = initiator_for(&record, &event);
    let kind = match record.kind {
        ParticipationKind::Application => "application_rejected",
        ParticipationKind::Invitation => "invitation_rejected",
    };
    notify_user(
        &state,
        other,
        kind,
        Some(auth.user_id),
        Some(&record.event_id),
        None,
    )
    .await;

    tracing::info!(event = "participation.reject", request_id = %request_id);
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
    let event = load_event(&state, &record.event_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    if initiator_for(&record, &event) != auth.user_id {
        return Err(ApiFailure::Forbidden);
    }

    delete_request(&state, &request_id).await?;
    let kind = match record.kind {
        ParticipationKind::Application => "application_cancelled",
        ParticipationKind::Invitation => "invitation_cancelled",
    };
    notify_user(
        &state,
        decider_for(&record, &event),
        kind,
        Some(auth.user_id),
        Some(&record.event_id),
        None,
    )
    .await;

    tracing::info!(event = "participation.cancel", request_id = %request_id);
    Ok(StatusCode::NO_CONTENT)
}
