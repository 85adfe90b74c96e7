use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit},
    http::{request::Request, HeaderName, StatusCode},
    routing::{delete, get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{
        auth::{
            forgot_password, login, me, oauth_callback, oauth_callback_mobile, register,
            reset_password,
        },
        chats::{direct_chat, get_chat, list_chats},
        events::{
            create_event, delete_event, get_event, leave_event, list_events, list_participants,
            update_event,
        },
        friends::{
            accept_request as accept_friend_request, cancel_request as cancel_friend_request,
            create_request as create_friend_request, list_friends,
            list_requests as list_friend_requests, reject_request as reject_friend_request,
            remove_friend,
        },
        messages::{delete_message, edit_message, list_messages, poll_messages, send_message},
        notifications::{list_notifications, mark_read, unread_count},
        participation::{
            accept_request as accept_participation_request, apply,
            cancel_request as cancel_participation_request, invite,
            list_requests as list_participation_requests,
            reject_request as reject_participation_request,
        },
        users::{get_user, get_user_photo, storage_tree, update_me, upload_my_photo},
    },
    realtime::gateway_ws,
    types::health,
};

/// Peer-address rate-limit key. Connections without peer info (in-process
/// service calls) share the unspecified-address bucket instead of erroring.
#[derive(Clone)]
struct ClientIpKeyExtractor;

impl KeyExtractor for ClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|value| value.0.ip())
            .or_else(|| req.extensions().get::<SocketAddr>().map(SocketAddr::ip));
        Ok(peer_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
    }
}

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured limits are invalid or a backing service
/// (object store, mailer, oauth) is misconfigured.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    if config.max_gateway_event_bytes > meetpoint_protocol::MAX_EVENT_BYTES {
        return Err(anyhow!(
            "gateway event limit cannot exceed protocol max of {} bytes",
            meetpoint_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!("rate limit must be at least 1 request per minute"));
    }
    if config.auth_route_requests_per_minute == 0 {
        return Err(anyhow!(
            "auth route rate limit must be at least 1 request per minute"
        ));
    }
    if config.session_token_ttl.is_zero() {
        return Err(anyhow!("session token ttl must be at least 1 second"));
    }
    if config.long_poll_max_timeout.is_zero() {
        return Err(anyhow!("long poll timeout must be at least 1 second"));
    }
    if config.max_profile_photo_bytes == 0 {
        return Err(anyhow!("max profile photo bytes must be at least 1 byte"));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(ClientIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/{provider}/callback", get(oauth_callback))
        .route(
            "/auth/{provider}/callback/mobile",
            get(oauth_callback_mobile),
        )
        .route("/users/me", patch(update_me))
        .route("/users/{user_id}", get(get_user))
        .route("/users/{user_id}/photo", get(get_user_photo))
        .route("/storage/tree", get(storage_tree))
        .route("/events", post(create_event).get(list_events))
        .route(
            "/events/{event_id}",
            get(get_event).patch(update_event).delete(delete_event),
        )
        .route("/events/{event_id}/participants", get(list_participants))
        .route("/events/{event_id}/participants/me", delete(leave_event))
        .route("/events/{event_id}/apply", post(apply))
        .route("/events/{event_id}/invite", post(invite))
        .route("/friends", get(list_friends))
        .route("/friends/{friend_user_id}", delete(remove_friend))
        .route(
            "/friends/requests",
            post(create_friend_request).get(list_friend_requests),
        )
        .route(
            "/friends/requests/{request_id}/accept",
            post(accept_friend_request),
        )
        .route(
            "/friends/requests/{request_id}/reject",
            post(reject_friend_request),
        )
        .route(
            "/friends/requests/{request_id}",
            delete(cancel_friend_request),
        )
        .route(
            "/participation/requests",
            get(list_participation_requests),
        )
        .route(
            "/participation/requests/{request_id}/accept",
            post(accept_participation_request),
        )
        .route(
            "/participation/requests/{request_id}/reject",
            post(reject_participation_request),
        )
        .route(
            "/participation/requests/{request_id}",
            delete(cancel_participation_request),
        )
        .route("/chats", get(list_chats))
        .route("/chats/direct", post(direct_chat))
        .route("/chats/{chat_id}", get(get_chat))
        .route(
            "/chats/{chat_id}/messages",
            post(send_message).get(list_messages),
        )
        .route("/chats/{chat_id}/messages/poll", get(poll_messages))
        .route(
            "/chats/{chat_id}/messages/{message_id}",
            patch(edit_message).delete(delete_message),
        )
        .route("/notifications", get(list_notifications))
        .route("/notifications/read", post(mark_read))
        .route("/notifications/unread-count", get(unread_count))
        .route("/gateway/ws", get(gateway_ws));

    // Photo uploads carry their own, larger body cap.
    let photo_route = Router::new()
        .route("/users/me/photo", post(upload_my_photo))
        .layer(DefaultBodyLimit::max(config.max_profile_photo_bytes));

    Ok(Router::new()
        .nest("/api", routes.merge(photo_route))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
