use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

pub const PASSWORD_AUTH_PATH: &str = "/api/collections/users/auth-with-password";
pub const ADMIN_AUTH_PATH: &str = "/api/admins/auth-with-password";
pub const ANONYMOUS_AUTH_PATH: &str = "/api/v1/auth/anonymous";
pub const AUTH_INFO_PATH: &str = "/api/v1/auth/info";

pub const PASSWORD_LOGIN_FAILED: &str = "Login failed";
pub const ADMIN_LOGIN_FAILED: &str = "Admin login failed";
pub const ANONYMOUS_LOGIN_FAILED: &str = "Anonymous login failed";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthInputError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("password must not be empty")]
    EmptySecret,
    #[error("token must not be empty")]
    EmptyToken,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthenticationError {
    #[error("{message}")]
    Rejected { message: String },
    #[error("failed to persist session token: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InvalidInput(#[from] AuthInputError),
}

impl AuthenticationError {
    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Resolved identity of the session holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub is_anonymous: bool,
    pub is_admin: bool,
}

#[derive(Clone, Serialize)]
pub struct PasswordAuthRequest {
    pub identity: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PasswordAuthResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub record: Option<AuthRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminAuthResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub admin: Option<AuthRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_anonymous: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnonymousAuthResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthInfoResponse {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_anonymous: Option<bool>,
    #[serde(default)]
    pub is_admin: Option<bool>,
}

/// A successful login: the token to persist plus the identity it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IssuedSession {
    pub token: String,
    pub user: User,
    pub expires_at: Option<String>,
}

pub fn normalize_identity(raw: &str) -> Result<String, AuthInputError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AuthInputError::EmptyIdentity);
    }
    Ok(trimmed.to_string())
}

pub fn normalize_token(raw: &str) -> Result<String, AuthInputError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AuthInputError::EmptyToken);
    }
    Ok(trimmed.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub(crate) fn issued_from_password(
    response: PasswordAuthResponse,
    submitted_identity: &str,
) -> Option<IssuedSession> {
    let token = non_empty(response.token)?;
    let record = response.record.unwrap_or_default();
    Some(IssuedSession {
        token,
        user: User {
            id: record.id.unwrap_or_default(),
            email: non_empty(record.email).unwrap_or_else(|| submitted_identity.to_string()),
            is_anonymous: record.is_anonymous.unwrap_or(false),
            is_admin: false,
        },
        expires_at: None,
    })
}

pub(crate) fn issued_from_admin(
    response: AdminAuthResponse,
    submitted_identity: &str,
) -> Option<IssuedSession> {
    let token = non_empty(response.token)?;
    let admin = response.admin.unwrap_or_default();
    Some(IssuedSession {
        token,
        user: User {
            id: admin.id.unwrap_or_default(),
            email: non_empty(admin.email).unwrap_or_else(|| submitted_identity.to_string()),
            is_anonymous: false,
            is_admin: true,
        },
        expires_at: None,
    })
}

pub(crate) fn issued_from_anonymous(response: AnonymousAuthResponse) -> Option<IssuedSession> {
    let token = non_empty(response.token)?;
    Some(IssuedSession {
        token,
        user: User {
            id: response.user_id.unwrap_or_default(),
            email: String::new(),
            is_anonymous: true,
            is_admin: false,
        },
        expires_at: non_empty(response.expires_at),
    })
}

impl From<AuthInfoResponse> for User {
    fn from(info: AuthInfoResponse) -> Self {
        Self {
            id: info.id,
            email: info.email.unwrap_or_default(),
            is_anonymous: info.is_anonymous.unwrap_or(false),
            is_admin: info.is_admin.unwrap_or(false),
        }
    }
}

/// Anonymous-auth failures carry a JSON `message` when the backend has one.
pub(crate) fn anonymous_failure_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|message| !message.is_empty())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| ANONYMOUS_LOGIN_FAILED.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_identity_trims() {
        assert_eq!(
            normalize_identity("  dev@sitepod.dev ").expect("valid identity"),
            "dev@sitepod.dev"
        );
        assert_eq!(
            normalize_identity("   ").expect_err("empty"),
            AuthInputError::EmptyIdentity
        );
    }

    #[test]
    fn password_response_falls_back_to_submitted_identity() {
        let response: PasswordAuthResponse =
            serde_json::from_str(r#"{"token":"tok_1","record":{"id":"u_1"}}"#).expect("decode");
        let issued = issued_from_password(response, "dev@sitepod.dev").expect("issued");
        assert_eq!(issued.token, "tok_1");
        assert_eq!(
            issued.user,
            User {
                id: "u_1".to_string(),
                email: "dev@sitepod.dev".to_string(),
                is_anonymous: false,
                is_admin: false,
            }
        );
    }

    #[test]
    fn password_response_without_token_is_not_a_session() {
        let response: PasswordAuthResponse =
            serde_json::from_str(r#"{"record":{"id":"u_1"}}"#).expect("decode");
        assert!(issued_from_password(response, "dev@sitepod.dev").is_none());

        let response: PasswordAuthResponse =
            serde_json::from_str(r#"{"token":"  "}"#).expect("decode");
        assert!(issued_from_password(response, "dev@sitepod.dev").is_none());
    }

    #[test]
    fn admin_response_is_privileged() {
        let response: AdminAuthResponse = serde_json::from_str(
            r#"{"token":"tok_admin","admin":{"id":"a_1","email":"root@sitepod.dev"}}"#,
        )
        .expect("decode");
        let issued = issued_from_admin(response, "ignored").expect("issued");
        assert!(issued.user.is_admin);
        assert!(!issued.user.is_anonymous);
        assert_eq!(issued.user.email, "root@sitepod.dev");
    }

    #[test]
    fn anonymous_response_has_no_email() {
        let response: AnonymousAuthResponse = serde_json::from_str(
            r#"{"token":"tok_anon","user_id":"anon_1","expires_at":"2026-10-19T00:00:00Z"}"#,
        )
        .expect("decode");
        let issued = issued_from_anonymous(response).expect("issued");
        assert_eq!(issued.user.email, "");
        assert!(issued.user.is_anonymous);
        assert!(!issued.user.is_admin);
        assert_eq!(issued.expires_at.as_deref(), Some("2026-10-19T00:00:00Z"));
    }

    #[test]
    fn auth_info_defaults_missing_flags() {
        let info: AuthInfoResponse = serde_json::from_str(r#"{"id":"u_9"}"#).expect("decode");
        let user = User::from(info);
        assert_eq!(user.email, "");
        assert!(!user.is_anonymous);
        assert!(!user.is_admin);
    }

    #[test]
    fn anonymous_failure_prefers_server_message() {
        assert_eq!(
            anonymous_failure_message(r#"{"message":"anonymous sessions disabled"}"#),
            "anonymous sessions disabled"
        );
        assert_eq!(anonymous_failure_message("gateway exploded"), ANONYMOUS_LOGIN_FAILED);
        assert_eq!(anonymous_failure_message(""), ANONYMOUS_LOGIN_FAILED);
    }
}
