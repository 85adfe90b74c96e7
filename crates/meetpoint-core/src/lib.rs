#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Reserved administrator role id. Never persisted; checked at the
/// authorization boundary and implicitly grants every permission.
pub const ADMINISTRATOR_ROLE_ID: &str = "00000000-0000-4000-8000-000000000001";

/// Name of the role assigned to freshly created accounts.
pub const DEFAULT_ROLE_NAME: &str = "User";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("email is invalid")]
    InvalidEmail,
    #[error("display name is invalid")]
    InvalidDisplayName,
    #[error("event title is invalid")]
    InvalidEventTitle,
    #[error("auth provider is invalid")]
    InvalidAuthProvider,
    #[error("gender is invalid")]
    InvalidGender,
    #[error("permission code is invalid")]
    InvalidPermission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lower-cased, trimmed email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Email(String);

impl Email {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        validate_email(&normalized)?;
        Ok(Self(normalized))
    }
}

fn validate_email(value: &str) -> Result<(), DomainError> {
    if value.is_empty() || value.len() > 254 {
        return Err(DomainError::InvalidEmail);
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err(DomainError::InvalidEmail);
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(DomainError::InvalidEmail);
    }
    if value.chars().any(char::is_whitespace) {
        return Err(DomainError::InvalidEmail);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayName(String);

impl DisplayName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DisplayName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.len() > 64 {
            return Err(DomainError::InvalidDisplayName);
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::InvalidDisplayName);
        }
        Ok(Self(trimmed.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventTitle(String);

impl EventTitle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventTitle {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.len() > 128 {
            return Err(DomainError::InvalidEventTitle);
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::InvalidEventTitle);
        }
        Ok(Self(trimmed.to_owned()))
    }
}

/// Identity source of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProvider {
    Local,
    Google,
    Yandex,
}

impl AuthProvider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Google => "google",
            Self::Yandex => "yandex",
        }
    }
}

impl TryFrom<String> for AuthProvider {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "local" => Ok(Self::Local),
            "google" => Ok(Self::Google),
            "yandex" => Ok(Self::Yandex),
            _ => Err(DomainError::InvalidAuthProvider),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }
}

impl TryFrom<String> for Gender {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            _ => Err(DomainError::InvalidGender),
        }
    }
}

/// Permission codes carried by stored roles. The Administrator sentinel
/// bypasses the list entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageUsers,
    ManageEvents,
    ManageRoles,
    ViewStorage,
}

impl Permission {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManageUsers => "users.manage",
            Self::ManageEvents => "events.manage",
            Self::ManageRoles => "roles.manage",
            Self::ViewStorage => "storage.view",
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "users.manage" => Ok(Self::ManageUsers),
            "events.manage" => Ok(Self::ManageEvents),
            "roles.manage" => Ok(Self::ManageRoles),
            "storage.view" => Ok(Self::ViewStorage),
            _ => Err(DomainError::InvalidPermission),
        }
    }
}
