use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use meetpoint_core::{DisplayName, Gender, Permission, UserId, ADMINISTRATOR_ROLE_ID};
use object_store::{path::Path as ObjectPath, ObjectStore, ObjectStoreExt, PutPayload};
use sqlx::Row;

use crate::server::{
    auth::authenticate,
    core::{AppState, UserRecord},
    db::permission_codes_from_column,
    errors::ApiFailure,
    handlers::auth::load_user_record,
    storage::{extension_for_photo_mime, list_tree, profile_photo_key},
    types::{
        PhotoUploadResponse, StorageTreeQuery, StorageTreeResponse, UpdateProfileRequest,
        UserProfileResponse,
    },
};

const PHOTO_EXTENSIONS: [&str; 4] = ["jpg", "png", "gif", "webp"];

fn profile_response(user: &UserRecord) -> UserProfileResponse {
    UserProfileResponse {
        user_id: user.user_id.to_string(),
        display_name: user.display_name.clone(),
        avatar_url: user.avatar_url.clone(),
        gender: user.gender.map(Gender::as_str),
        birth_date_unix: user.birth_date_unix,
        created_at_unix: user.created_at_unix,
    }
}

/// Role-based authorization. The administrator role is recognized by id so it
/// keeps every permission even if its stored permission list is edited.
pub(crate) async fn require_permission(
    state: &AppState,
    user_id: UserId,
    permission: Permission,
) -> Result<(), ApiFailure> {
    let user = load_user_record(state, &user_id.to_string())
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    let Some(role_id) = user.role_id else {
        return Err(ApiFailure::Forbidden);
    };
    if role_id == ADMINISTRATOR_ROLE_ID {
        return Ok(());
    }

    let codes = if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT permissions FROM roles WHERE role_id = $1")
            .bind(&role_id)
            .fetch_optional(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
        let Some(row) = row else {
            return Err(ApiFailure::Forbidden);
        };
        let raw: String = row.try_get("permissions").map_err(|_| ApiFailure::Internal)?;
        permission_codes_from_column(&raw)
    } else {
        let roles = state.roles.read().await;
        match roles.get(&role_id) {
            Some(role) => role.permissions.clone(),
            None => return Err(ApiFailure::Forbidden),
        }
    };

    if codes.iter().any(|code| code == permission.as_str()) {
        Ok(())
    } else {
        Err(ApiFailure::Forbidden)
    }
}

pub(crate) async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfileResponse>, ApiFailure> {
    authenticate(&state, &headers).await?;
    let user_id = UserId::try_from(user_id).map_err(|_| ApiFailure::InvalidRequest)?;
    let user = load_user_record(&state, &user_id.to_string())
        .await?
        .ok_or(ApiFailure::NotFound)?;
    Ok(Json(profile_response(&user)))
}

pub(crate) async fn update_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<UserProfileResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let display_name = payload
        .display_name
        .map(DisplayName::try_from)
        .transpose()
        .map_err(|_| ApiFailure::InvalidRequest)?;
    let gender = payload
        .gender
        .map(Gender::try_from)
        .transpose()
        .map_err(|_| ApiFailure::InvalidRequest)?;

    let mut user = load_user_record(&state, &auth.user_id.to_string())
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    if let Some(display_name) = display_name {
        user.display_name = display_name.as_str().to_owned();
    }
    if let Some(birth_date_unix) = payload.birth_date_unix {
        user.birth_date_unix = Some(birth_date_unix);
    }
    if let Some(gender) = gender {
        user.gender = Some(gender);
    }

    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "UPDATE users SET display_name = $2, birth_date_unix = $3, gender = $4 \
             WHERE user_id = $1",
        )
        .bind(user.user_id.to_string())
        .bind(&user.display_name)
        .bind(user.birth_date_unix)
        .bind(user.gender.map(Gender::as_str))
        .execute(pool)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut users = state.users.write().await;
        if let Some(record) = users.get_mut(&user.user_id.to_string()) {
            record.display_name = user.display_name.clone();
            record.birth_date_unix = user.birth_date_unix;
            record.gender = user.gender;
        }
    }

    tracing::info!(event = "profile.update", user_id = %user.user_id);
    Ok(Json(profile_response(&user)))
}

fn photo_mime_for_extension(extension: &str) -> &'static str {
    match extension {
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Content type is taken from the bytes themselves, never from headers the
/// client controls.
pub(crate) async fn upload_my_photo(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PhotoUploadResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    if body.is_empty() || body.len() > state.runtime.max_profile_photo_bytes {
        return Err(ApiFailure::InvalidRequest);
    }
    let kind = infer::get(&body).ok_or(ApiFailure::InvalidRequest)?;
    let extension = extension_for_photo_mime(kind.mime_type()).ok_or(ApiFailure::InvalidRequest)?;

    let user_id = auth.user_id.to_string();
    let photo_bytes = body.len();
    let key = ObjectPath::from(profile_photo_key(&user_id, extension));
    state
        .object_store
        .put(&key, PutPayload::from(body))
        .await
        .map_err(|e| {
            tracing::warn!(event = "storage.photo_put_failed", user_id = %user_id, error = %e);
            ApiFailure::Internal
        })?;

    // A re-upload with a different format leaves the old object behind;
    // clear the stale variants so the listing stays one photo per user.
    for stale in PHOTO_EXTENSIONS.iter().filter(|ext| **ext != extension) {
        let stale_key = ObjectPath::from(profile_photo_key(&user_id, stale));
        let _ = state.object_store.delete(&stale_key).await;
    }

    let avatar_url = format!("/api/users/{user_id}/photo");
    if let Some(pool) = &state.db_pool {
        sqlx::query("UPDATE users SET avatar_url = $2 WHERE user_id = $1")
            .bind(&user_id)
            .bind(&avatar_url)
            .execute(pool)
            .await
            .map_err(|_| ApiFailure::Internal)?;
    } else {
        let mut users = state.users.write().await;
        if let Some(record) = users.get_mut(&user_id) {
            record.avatar_url = Some(avatar_url.clone());
        }
    }

    tracing::info!(event = "profile.photo_uploaded", user_id = %user_id, bytes = photo_bytes);
    Ok(Json(PhotoUploadResponse { avatar_url }))
}

pub(crate) async fn get_user_photo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Response, ApiFailure> {
    authenticate(&state, &headers).await?;
    let user_id = UserId::try_from(user_id).map_err(|_| ApiFailure::InvalidRequest)?;

    let prefix = ObjectPath::from(format!("users/{user_id}"));
    let listing = state
        .object_store
        .list_with_delimiter(Some(&prefix))
        .await
        .map_err(|_| ApiFailure::Internal)?;
    let photo = listing
        .objects
        .into_iter()
        .find(|meta| {
            meta.location
                .filename()
                .is_some_and(|name| name.starts_with("profile-photo."))
        })
        .ok_or(ApiFailure::NotFound)?;

    let mime = photo
        .location
        .extension()
        .map(photo_mime_for_extension)
        .unwrap_or("application/octet-stream");
    let bytes = state
        .object_store
        .get(&photo.location)
        .await
        .map_err(|_| ApiFailure::NotFound)?
        .bytes()
        .await
        .map_err(|_| ApiFailure::Internal)?;

    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

pub(crate) async fn storage_tree(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StorageTreeQuery>,
) -> Result<Json<StorageTreeResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    require_permission(&state, auth.user_id, Permission::ViewStorage).await?;
    let tree = list_tree(&state, query.prefix.as_deref()).await?;
    Ok(Json(tree))
}
