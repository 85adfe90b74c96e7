use anyhow::anyhow;
use meetpoint_core::AuthProvider;
use serde::Deserialize;

use super::{core::AppConfig, errors::ApiFailure};

#[derive(Clone)]
pub(crate) struct OauthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub profile_url: String,
}

#[derive(Clone)]
pub(crate) struct OauthProviders {
    google: Option<OauthProviderConfig>,
    yandex: Option<OauthProviderConfig>,
}

impl OauthProviders {
    pub(crate) fn get(&self, provider: AuthProvider) -> Option<&OauthProviderConfig> {
        match provider {
            AuthProvider::Google => self.google.as_ref(),
            AuthProvider::Yandex => self.yandex.as_ref(),
            AuthProvider::Local => None,
        }
    }
}

/// Provider-agnostic profile shape every callback normalizes into.
#[derive(Debug, Clone)]
pub(crate) struct NormalizedProfile {
    pub provider_id: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

pub(crate) fn build_oauth_providers(config: &AppConfig) -> anyhow::Result<OauthProviders> {
    Ok(OauthProviders {
        google: build_provider(
            "google",
            &config.google_client_id,
            &config.google_client_secret,
            &config.google_token_url,
            &config.google_profile_url,
        )?,
        yandex: build_provider(
            "yandex",
            &config.yandex_client_id,
            &config.yandex_client_secret,
            &config.yandex_token_url,
            &config.yandex_profile_url,
        )?,
    })
}

fn build_provider(
    name: &str,
    client_id: &Option<String>,
    client_secret: &Option<String>,
    token_url: &str,
    profile_url: &str,
) -> anyhow::Result<Option<OauthProviderConfig>> {
    match (client_id, client_secret) {
        (None, None) => Ok(None),
        (Some(_), None) | (None, Some(_)) => Err(anyhow!(
            "{name} oauth client id and secret must be set together"
        )),
        (Some(client_id), Some(client_secret)) => {
            let client_id = client_id.trim();
            let client_secret = client_secret.trim();
            if client_id.is_empty() || client_secret.is_empty() {
                return Err(anyhow!("{name} oauth client id and secret cannot be empty"));
            }
            let token_url = validate_provider_url(name, token_url)?;
            let profile_url = validate_provider_url(name, profile_url)?;
            Ok(Some(OauthProviderConfig {
                client_id: client_id.to_owned(),
                client_secret: client_secret.to_owned(),
                token_url,
                profile_url,
            }))
        }
    }
}

fn validate_provider_url(name: &str, value: &str) -> anyhow::Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 256 {
        return Err(anyhow!("{name} oauth url is invalid"));
    }
    if trimmed.starts_with("https://")
        || trimmed.starts_with("http://127.0.0.1")
        || trimmed.starts_with("http://localhost")
    {
        return Ok(trimmed.to_owned());
    }
    Err(anyhow!(
        "{name} oauth url must use https://, or localhost http:// for tests"
    ))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GoogleProfile {
    id: String,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YandexProfile {
    id: String,
    #[serde(default)]
    default_email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    is_avatar_empty: bool,
    #[serde(default)]
    default_avatar_id: Option<String>,
}

/// Code-for-token exchange plus a profile fetch. Provider errors never reach
/// the client beyond a generic oauth failure.
pub(crate) async fn fetch_profile(
    http_client: &reqwest::Client,
    provider: AuthProvider,
    provider_config: &OauthProviderConfig,
    code: &str,
) -> Result<NormalizedProfile, ApiFailure> {
    let token_response = http_client
        .post(&provider_config.token_url)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", provider_config.client_id.as_str()),
            ("client_secret", provider_config.client_secret.as_str()),
        ])
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| {
            tracing::warn!(event = "oauth.token_exchange_failed", provider = provider.as_str(), error = %e);
            ApiFailure::OauthFailed
        })?;
    let token: TokenResponse = token_response.json().await.map_err(|e| {
        tracing::warn!(event = "oauth.token_decode_failed", provider = provider.as_str(), error = %e);
        ApiFailure::OauthFailed
    })?;

    let profile_response = http_client
        .get(&provider_config.profile_url)
        .bearer_auth(&token.access_token)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| {
            tracing::warn!(event = "oauth.profile_fetch_failed", provider = provider.as_str(), error = %e);
            ApiFailure::OauthFailed
        })?;

    match provider {
        AuthProvider::Google => {
            let profile: GoogleProfile = profile_response.json().await.map_err(|e| {
                tracing::warn!(event = "oauth.profile_decode_failed", provider = "google", error = %e);
                ApiFailure::OauthFailed
            })?;
            Ok(normalize_google(profile))
        }
        AuthProvider::Yandex => {
            let profile: YandexProfile = profile_response.json().await.map_err(|e| {
                tracing::warn!(event = "oauth.profile_decode_failed", provider = "yandex", error = %e);
                ApiFailure::OauthFailed
            })?;
            normalize_yandex(profile)
        }
        AuthProvider::Local => Err(ApiFailure::OauthFailed),
    }
}

fn normalize_google(profile: GoogleProfile) -> NormalizedProfile {
    let display_name = profile
        .name
        .filter(|value| !value.trim().is_empty())
        .or_else(|| join_names(profile.given_name.as_deref(), profile.family_name.as_deref()))
        .unwrap_or_else(|| email_local_part(&profile.email));
    NormalizedProfile {
        provider_id: profile.id,
        email: profile.email,
        display_name,
        avatar_url: profile.picture,
    }
}

fn normalize_yandex(profile: YandexProfile) -> Result<NormalizedProfile, ApiFailure> {
    let email = profile.default_email.ok_or(ApiFailure::OauthFailed)?;
    let display_name = profile
        .display_name
        .or(profile.real_name)
        .filter(|value| !value.trim().is_empty())
        .or_else(|| join_names(profile.first_name.as_deref(), profile.last_name.as_deref()))
        .unwrap_or_else(|| email_local_part(&email));
    let avatar_url = match (profile.is_avatar_empty, profile.default_avatar_id) {
        (false, Some(avatar_id)) => Some(format!(
            "https://avatars.yandex.net/get-yapic/{avatar_id}/islands-200"
        )),
        _ => None,
    };
    Ok(NormalizedProfile {
        provider_id: profile.id,
        email,
        display_name,
        avatar_url,
    })
}

fn join_names(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let joined = [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn email_local_part(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_owned()
}
