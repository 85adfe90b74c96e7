use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegisterRequest {
    pub(crate) email: String,
    pub(crate) password: String,
    pub(crate) display_name: String,
    pub(crate) birth_date_unix: Option<i64>,
    pub(crate) gender: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AcceptedResponse {
    pub(crate) accepted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) email: String,
    pub(crate) password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AuthResponse {
    pub(crate) token: String,
    pub(crate) expires_in_secs: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MeResponse {
    pub(crate) user_id: String,
    pub(crate) email: String,
    pub(crate) display_name: String,
    pub(crate) auth_provider: &'static str,
    pub(crate) avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OauthCallbackQuery {
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) refresh_profile: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ForgotPasswordRequest {
    pub(crate) email: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ResetPasswordRequest {
    pub(crate) token: String,
    pub(crate) new_password: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserProfileResponse {
    pub(crate) user_id: String,
    pub(crate) display_name: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) gender: Option<&'static str>,
    pub(crate) birth_date_unix: Option<i64>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateProfileRequest {
    pub(crate) display_name: Option<String>,
    pub(crate) birth_date_unix: Option<i64>,
    pub(crate) gender: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PhotoUploadResponse {
    pub(crate) avatar_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StorageTreeQuery {
    pub(crate) prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StorageObjectItem {
    pub(crate) key: String,
    pub(crate) size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct StorageTreeResponse {
    pub(crate) prefixes: Vec<String>,
    pub(crate) objects: Vec<StorageObjectItem>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateEventRequest {
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) starts_at_unix: i64,
    pub(crate) location: String,
    pub(crate) location_hidden: Option<bool>,
    pub(crate) max_participants: i64,
    pub(crate) min_age: Option<i64>,
    pub(crate) max_age: Option<i64>,
    pub(crate) gender_constraint: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateEventRequest {
    pub(crate) title: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) starts_at_unix: Option<i64>,
    pub(crate) location: Option<String>,
    pub(crate) location_hidden: Option<bool>,
    pub(crate) max_participants: Option<i64>,
    pub(crate) min_age: Option<i64>,
    pub(crate) max_age: Option<i64>,
    pub(crate) gender_constraint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EventResponse {
    pub(crate) event_id: String,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) starts_at_unix: i64,
    pub(crate) location: String,
    pub(crate) location_hidden: bool,
    pub(crate) max_participants: i64,
    pub(crate) participant_count: i64,
    pub(crate) min_age: Option<i64>,
    pub(crate) max_age: Option<i64>,
    pub(crate) gender_constraint: Option<String>,
    pub(crate) creator_user_id: String,
    pub(crate) is_participant: bool,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventListQuery {
    pub(crate) q: Option<String>,
    pub(crate) upcoming: Option<bool>,
    pub(crate) limit: Option<usize>,
    pub(crate) offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EventListResponse {
    pub(crate) events: Vec<EventResponse>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EventParticipantItem {
    pub(crate) user_id: String,
    pub(crate) display_name: String,
    pub(crate) joined_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct EventParticipantsResponse {
    pub(crate) participants: Vec<EventParticipantItem>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateFriendRequestBody {
    pub(crate) recipient_user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FriendRequestItem {
    pub(crate) request_id: String,
    pub(crate) sender_user_id: String,
    pub(crate) recipient_user_id: String,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct FriendRequestsResponse {
    pub(crate) incoming: Vec<FriendRequestItem>,
    pub(crate) outgoing: Vec<FriendRequestItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FriendshipResponse {
    pub(crate) user_id: String,
    pub(crate) friend_user_id: String,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct FriendItem {
    pub(crate) user_id: String,
    pub(crate) display_name: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct FriendListResponse {
    pub(crate) friends: Vec<FriendItem>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct InviteRequestBody {
    pub(crate) user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ParticipationRequestItem {
    pub(crate) request_id: String,
    pub(crate) event_id: String,
    pub(crate) user_id: String,
    pub(crate) kind: String,
    pub(crate) meets_age: Option<bool>,
    pub(crate) meets_gender: Option<bool>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ParticipationRequestsResponse {
    pub(crate) incoming: Vec<ParticipationRequestItem>,
    pub(crate) outgoing: Vec<ParticipationRequestItem>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DirectChatRequest {
    pub(crate) user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChatResponse {
    pub(crate) chat_id: String,
    pub(crate) kind: String,
    pub(crate) event_id: Option<String>,
    pub(crate) participants: Vec<String>,
    pub(crate) unread_count: i64,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatListResponse {
    pub(crate) chats: Vec<ChatResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SendMessageRequest {
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EditMessageRequest {
    pub(crate) content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MessageResponse {
    pub(crate) message_id: String,
    pub(crate) chat_id: String,
    pub(crate) author_user_id: Option<String>,
    pub(crate) content: String,
    pub(crate) is_deleted: bool,
    pub(crate) created_at_unix: i64,
    pub(crate) edited_at_unix: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageListQuery {
    pub(crate) limit: Option<usize>,
    pub(crate) before: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageListResponse {
    pub(crate) messages: Vec<MessageResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagePollQuery {
    pub(crate) after_unix: Option<i64>,
    pub(crate) timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct NotificationResponse {
    pub(crate) notification_id: String,
    pub(crate) kind: String,
    pub(crate) actor_user_id: Option<String>,
    pub(crate) event_id: Option<String>,
    pub(crate) chat_id: Option<String>,
    pub(crate) is_read: bool,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationListQuery {
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(crate) struct NotificationListResponse {
    pub(crate) notifications: Vec<NotificationResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MarkReadRequest {
    pub(crate) notification_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UnreadCountResponse {
    pub(crate) unread: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayQuery {
    pub(crate) token: Option<String>,
}
