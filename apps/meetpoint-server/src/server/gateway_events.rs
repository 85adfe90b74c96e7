use meetpoint_core::UserId;
use meetpoint_protocol::{Envelope, EventType, PROTOCOL_VERSION};
use serde::Serialize;

use super::types::{EventResponse, MessageResponse, NotificationResponse};

pub(crate) const CONNECTED_EVENT: &str = "connected";
pub(crate) const NOTIFICATIONS_EVENT: &str = "notifications";
pub(crate) const NOTIFICATION_EVENT: &str = "notification";
pub(crate) const MESSAGE_EVENT: &str = "message";
pub(crate) const CHAT_MESSAGE_EVENT: &str = "chat_message";
pub(crate) const EVENT_UPDATE_EVENT: &str = "event_update";
pub(crate) const FRIEND_UPDATE_EVENT: &str = "friend_update";

pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

fn build_event<T: Serialize>(event_type: &'static str, payload: T) -> GatewayEvent {
    GatewayEvent {
        event_type,
        payload: outbound_event(event_type, payload),
    }
}

pub(crate) fn outbound_event<T: Serialize>(event_type: &str, data: T) -> String {
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        t: EventType::try_from(event_type.to_owned()).unwrap_or_else(|_| {
            EventType::try_from(String::from(CONNECTED_EVENT)).expect("valid event type")
        }),
        d: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
    };

    serde_json::to_string(&envelope)
        .unwrap_or_else(|_| String::from(r#"{"v":1,"t":"connected","d":{}}"#))
}

#[derive(Serialize)]
struct ConnectedPayload {
    user_id: String,
}

#[derive(Serialize)]
struct NotificationsPayload<'a> {
    notifications: &'a [NotificationResponse],
}

#[derive(Serialize)]
struct ChatMessagePayload<'a> {
    chat_id: &'a str,
    message_id: &'a str,
    created_at_unix: i64,
}

#[derive(Serialize)]
struct FriendUpdatePayload<'a> {
    state: &'static str,
    user_id: &'a str,
    other_user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    updated_at_unix: i64,
}

pub(crate) fn connected(user_id: UserId) -> GatewayEvent {
    build_event(
        CONNECTED_EVENT,
        ConnectedPayload {
            user_id: user_id.to_string(),
        },
    )
}

/// Replay of the newest unacknowledged notifications on connect.
pub(crate) fn notifications(items: &[NotificationResponse]) -> GatewayEvent {
    build_event(
        NOTIFICATIONS_EVENT,
        NotificationsPayload {
            notifications: items,
        },
    )
}

pub(crate) fn notification(item: &NotificationResponse) -> GatewayEvent {
    build_event(NOTIFICATION_EVENT, item)
}

pub(crate) fn message(item: &MessageResponse) -> GatewayEvent {
    build_event(MESSAGE_EVENT, item)
}

/// Light chat-list refresh signal; carries ids only, never the content.
pub(crate) fn chat_message(chat_id: &str, message_id: &str, created_at_unix: i64) -> GatewayEvent {
    build_event(
        CHAT_MESSAGE_EVENT,
        ChatMessagePayload {
            chat_id,
            message_id,
            created_at_unix,
        },
    )
}

pub(crate) fn event_update(item: &EventResponse) -> GatewayEvent {
    build_event(EVENT_UPDATE_EVENT, item)
}

pub(crate) fn friend_update(
    state: &'static str,
    user_id: &str,
    other_user_id: &str,
    request_id: Option<&str>,
    updated_at_unix: i64,
) -> GatewayEvent {
    build_event(
        FRIEND_UPDATE_EVENT,
        FriendUpdatePayload {
            state,
            user_id,
            other_user_id,
            request_id,
            updated_at_unix,
        },
    )
}
