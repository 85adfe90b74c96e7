use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::anyhow;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use meetpoint_core::{AuthProvider, Gender, UserId};
use object_store::ObjectStore;
use pasetors::{keys::SymmetricKey, version4::V4};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::{mpsc, watch, Notify, OnceCell, RwLock};
use ulid::{Generator, Ulid};
use uuid::Uuid;

use super::{
    auth::hash_password,
    mailer::{build_mailer, Mailer},
    oauth::{build_oauth_providers, OauthProviders},
    storage::build_object_store,
};

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE: u32 = 20;
pub const DEFAULT_SESSION_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = meetpoint_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_LONG_POLL_MAX_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_PROFILE_PHOTO_BYTES: usize = 5 * 1024 * 1024;
pub const NOTIFICATION_REPLAY_LIMIT: usize = 15;
pub const RESET_TOKEN_TTL_SECS: i64 = 60 * 60;
pub const MAX_PAGE_LIMIT: usize = 100;
pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub(crate) const LOGIN_LOCK_THRESHOLD: u8 = 5;
pub(crate) const LOGIN_LOCK_SECS: i64 = 30;
pub(crate) const MAX_MESSAGE_CONTENT_CHARS: usize = 2000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub auth_route_requests_per_minute: u32,
    pub session_token_ttl: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub long_poll_max_timeout: Duration,
    pub max_profile_photo_bytes: usize,
    pub storage_root: PathBuf,
    pub s3_bucket: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    pub public_base_url: String,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_token_url: String,
    pub google_profile_url: String,
    pub yandex_client_id: Option<String>,
    pub yandex_client_secret: Option<String>,
    pub yandex_token_url: String,
    pub yandex_profile_url: String,
    pub mobile_redirect_scheme: Option<String>,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            auth_route_requests_per_minute: DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE,
            session_token_ttl: Duration::from_secs(DEFAULT_SESSION_TOKEN_TTL_SECS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            long_poll_max_timeout: Duration::from_secs(DEFAULT_LONG_POLL_MAX_TIMEOUT_SECS),
            max_profile_photo_bytes: DEFAULT_MAX_PROFILE_PHOTO_BYTES,
            storage_root: PathBuf::from("./data/storage"),
            s3_bucket: None,
            s3_endpoint: None,
            s3_region: None,
            s3_access_key: None,
            s3_secret_key: None,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            smtp_from: None,
            public_base_url: String::from("http://127.0.0.1:3000"),
            google_client_id: None,
            google_client_secret: None,
            google_token_url: String::from("https://oauth2.googleapis.com/token"),
            google_profile_url: String::from("https://www.googleapis.com/oauth2/v2/userinfo"),
            yandex_client_id: None,
            yandex_client_secret: None,
            yandex_token_url: String::from("https://oauth.yandex.ru/token"),
            yandex_profile_url: String::from("https://login.yandex.ru/info"),
            mobile_redirect_scheme: None,
            database_url: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub auth_route_requests_per_minute: u32,
    pub session_token_ttl: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub long_poll_max_timeout: Duration,
    pub max_profile_photo_bytes: usize,
    pub public_base_url: String,
    pub mobile_redirect_scheme: Option<String>,
    pub oauth: OauthProviders,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) http_client: reqwest::Client,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) auth_route_hits: Arc<RwLock<HashMap<String, Vec<i64>>>>,
    pub(crate) users: Arc<RwLock<HashMap<String, UserRecord>>>,
    pub(crate) roles: Arc<RwLock<HashMap<String, RoleRecord>>>,
    pub(crate) events: Arc<RwLock<HashMap<String, EventRecord>>>,
    pub(crate) friend_requests: Arc<RwLock<HashMap<String, FriendRequestRecord>>>,
    pub(crate) friend_edges: Arc<RwLock<HashMap<(String, String), i64>>>,
    pub(crate) participation_requests: Arc<RwLock<HashMap<String, ParticipationRequestRecord>>>,
    pub(crate) chats: Arc<RwLock<HashMap<String, ChatRecord>>>,
    pub(crate) messages: Arc<RwLock<HashMap<String, Vec<MessageRecord>>>>,
    pub(crate) notifications: Arc<RwLock<HashMap<String, Vec<NotificationRecord>>>>,
    pub(crate) connection_senders: Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>,
    pub(crate) connection_controls: Arc<RwLock<HashMap<Uuid, watch::Sender<ConnectionControl>>>>,
    pub(crate) user_connections: Arc<RwLock<HashMap<String, Uuid>>>,
    pub(crate) chat_signals: Arc<RwLock<HashMap<String, Arc<Notify>>>>,
    pub(crate) id_generator: Arc<Mutex<Generator>>,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) mailer: Option<Arc<Mailer>>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let mut key_bytes = [0_u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let token_key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let dummy_password_hash = hash_password("meetpoint-dummy-password")?;
        let oauth = build_oauth_providers(config)?;
        let mailer = build_mailer(config)?;
        let object_store = build_object_store(config)?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            http_client: reqwest::Client::new(),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            auth_route_hits: Arc::new(RwLock::new(HashMap::new())),
            users: Arc::new(RwLock::new(HashMap::new())),
            roles: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(HashMap::new())),
            friend_requests: Arc::new(RwLock::new(HashMap::new())),
            friend_edges: Arc::new(RwLock::new(HashMap::new())),
            participation_requests: Arc::new(RwLock::new(HashMap::new())),
            chats: Arc::new(RwLock::new(HashMap::new())),
            messages: Arc::new(RwLock::new(HashMap::new())),
            notifications: Arc::new(RwLock::new(HashMap::new())),
            connection_senders: Arc::new(RwLock::new(HashMap::new())),
            connection_controls: Arc::new(RwLock::new(HashMap::new())),
            user_connections: Arc::new(RwLock::new(HashMap::new())),
            chat_signals: Arc::new(RwLock::new(HashMap::new())),
            id_generator: Arc::new(Mutex::new(Generator::new())),
            object_store,
            mailer: mailer.map(Arc::new),
            runtime: Arc::new(RuntimeConfig {
                auth_route_requests_per_minute: config.auth_route_requests_per_minute,
                session_token_ttl: config.session_token_ttl,
                gateway_outbound_queue: config.gateway_outbound_queue,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
                long_poll_max_timeout: config.long_poll_max_timeout,
                max_profile_photo_bytes: config.max_profile_photo_bytes,
                public_base_url: config.public_base_url.clone(),
                mobile_redirect_scheme: config.mobile_redirect_scheme.clone(),
                oauth,
            }),
        })
    }

    /// Entity ids double as ordering cursors, so same-millisecond mints must
    /// still come out in creation order.
    pub(crate) fn next_id(&self) -> String {
        let mut generator = self
            .id_generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        generator
            .generate()
            .unwrap_or_else(|_| Ulid::new())
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub user_id: UserId,
    pub email: String,
    pub auth_provider: AuthProvider,
    pub provider_id: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub birth_date_unix: Option<i64>,
    pub gender: Option<Gender>,
    pub password_hash: Option<String>,
    pub role_id: Option<String>,
    pub is_active: bool,
    pub is_blocked: bool,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_unix: Option<i64>,
    pub failed_logins: u8,
    pub locked_until_unix: Option<i64>,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct RoleRecord {
    pub role_id: String,
    pub name: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct EventRecord {
    pub event_id: String,
    pub title: String,
    pub description: String,
    pub starts_at_unix: i64,
    pub location: String,
    pub location_hidden: bool,
    pub max_participants: i64,
    pub min_age: Option<i64>,
    pub max_age: Option<i64>,
    pub gender_constraint: Option<Gender>,
    pub creator_user_id: UserId,
    pub participants: HashMap<String, i64>,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct FriendRequestRecord {
    pub request_id: String,
    pub sender_user_id: UserId,
    pub recipient_user_id: UserId,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParticipationKind {
    Invitation,
    Application,
}

impl ParticipationKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Invitation => "invitation",
            Self::Application => "application",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "invitation" => Some(Self::Invitation),
            "application" => Some(Self::Application),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ParticipationRequestRecord {
    pub request_id: String,
    pub event_id: String,
    pub user_id: UserId,
    pub kind: ParticipationKind,
    pub meets_age: Option<bool>,
    pub meets_gender: Option<bool>,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChatKind {
    Direct,
    Event,
}

impl ChatKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Event => "event",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(Self::Direct),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChatRecord {
    pub chat_id: String,
    pub kind: ChatKind,
    pub pair_key: Option<String>,
    pub event_id: Option<String>,
    pub participants: HashMap<String, Option<i64>>,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageRecord {
    pub message_id: String,
    pub chat_id: String,
    pub author_user_id: Option<UserId>,
    pub content: String,
    pub is_deleted: bool,
    pub created_at_unix: i64,
    pub edited_at_unix: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct NotificationRecord {
    pub notification_id: String,
    pub user_id: UserId,
    pub kind: String,
    pub actor_user_id: Option<UserId>,
    pub event_id: Option<String>,
    pub chat_id: Option<String>,
    pub is_read: bool,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}

/// Unordered pair key for direct chats and duplicate-friendship checks.
pub(crate) fn pair_key(user_a: UserId, user_b: UserId) -> String {
    let left = user_a.to_string();
    let right = user_b.to_string();
    if left < right {
        format!("{left}:{right}")
    } else {
        format!("{right}:{left}")
    }
}
