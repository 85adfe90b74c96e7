#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use meetpoint_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {name} value {value:?}: {e}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let defaults = AppConfig::default();
    let session_token_ttl_secs = env_parsed(
        "MEETPOINT_TOKEN_TTL_SECS",
        defaults.session_token_ttl.as_secs(),
    )?;
    let smtp_port = env_parsed("MEETPOINT_SMTP_PORT", defaults.smtp_port)?;
    let app_config = AppConfig {
        session_token_ttl: Duration::from_secs(session_token_ttl_secs),
        storage_root: env_opt("MEETPOINT_STORAGE_ROOT")
            .map_or_else(|| defaults.storage_root.clone(), PathBuf::from),
        s3_bucket: env_opt("MEETPOINT_S3_BUCKET"),
        s3_endpoint: env_opt("MEETPOINT_S3_ENDPOINT"),
        s3_region: env_opt("MEETPOINT_S3_REGION"),
        s3_access_key: env_opt("MEETPOINT_S3_ACCESS_KEY"),
        s3_secret_key: env_opt("MEETPOINT_S3_SECRET_KEY"),
        smtp_host: env_opt("MEETPOINT_SMTP_HOST"),
        smtp_port,
        smtp_username: env_opt("MEETPOINT_SMTP_USERNAME"),
        smtp_password: env_opt("MEETPOINT_SMTP_PASSWORD"),
        smtp_from: env_opt("MEETPOINT_SMTP_FROM"),
        public_base_url: env_opt("MEETPOINT_PUBLIC_BASE_URL")
            .unwrap_or_else(|| defaults.public_base_url.clone()),
        google_client_id: env_opt("MEETPOINT_GOOGLE_CLIENT_ID"),
        google_client_secret: env_opt("MEETPOINT_GOOGLE_CLIENT_SECRET"),
        google_token_url: env_opt("MEETPOINT_GOOGLE_TOKEN_URL")
            .unwrap_or_else(|| defaults.google_token_url.clone()),
        google_profile_url: env_opt("MEETPOINT_GOOGLE_PROFILE_URL")
            .unwrap_or_else(|| defaults.google_profile_url.clone()),
        yandex_client_id: env_opt("MEETPOINT_YANDEX_CLIENT_ID"),
        yandex_client_secret: env_opt("MEETPOINT_YANDEX_CLIENT_SECRET"),
        yandex_token_url: env_opt("MEETPOINT_YANDEX_TOKEN_URL")
            .unwrap_or_else(|| defaults.yandex_token_url.clone()),
        yandex_profile_url: env_opt("MEETPOINT_YANDEX_PROFILE_URL")
            .unwrap_or_else(|| defaults.yandex_profile_url.clone()),
        mobile_redirect_scheme: env_opt("MEETPOINT_MOBILE_REDIRECT_SCHEME"),
        database_url: env_opt("MEETPOINT_DATABASE_URL"),
        ..defaults.clone()
    };

    let app = build_router(&app_config)?;
    let addr = std::env::var("MEETPOINT_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid MEETPOINT_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "meetpoint-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
