//! Token verification against the external account service.
//!
//! The hall never stores credentials. A client presents the user id and token
//! it obtained from the account service, and [`TokenVerifier::token_login`]
//! exchanges them for a verified profile. The call runs outside the dispatcher
//! loop so a slow account service only delays the session that asked.

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use shared::{conveyor_of, UserData, EMPTY_THEME_COLOR};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("user id and token are required")]
    MissingCredentials,
    #[error("account service unreachable: {0}")]
    Transport(String),
    #[error("account service did not answer within {0:?}")]
    Timeout(Duration),
    #[error("account service returned HTTP {0}")]
    Status(u16),
    #[error("token rejected: {0}")]
    Rejected(String),
    #[error("invalid account service response: {0}")]
    InvalidResponse(String),
}

/// Verified identity of a logged-in session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_theme_color")]
    pub theme_color: String,
    #[serde(default, rename = "anonymous_user")]
    pub is_anonymous: bool,
}

fn default_theme_color() -> String {
    EMPTY_THEME_COLOR.to_string()
}

impl UserProfile {
    pub fn conveyor(&self) -> String {
        conveyor_of(&self.name, &self.email)
    }

    pub fn user_data(&self) -> UserData {
        UserData {
            id: self.id,
            anonymous_user: self.is_anonymous,
            email: self.email.clone(),
            name: self.name.clone(),
            theme_color: self.theme_color.clone(),
        }
    }
}

/// Body of `POST /tokenlogin`.
#[derive(Debug, Deserialize)]
struct TokenLoginResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

/// Interprets a `/tokenlogin` response body.
pub fn interpret_response(body: &str) -> Result<UserProfile, AuthError> {
    let response: TokenLoginResponse =
        serde_json::from_str(body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

    if !response.success {
        return Err(AuthError::Rejected(response.message.unwrap_or_default()));
    }

    response
        .user
        .ok_or_else(|| AuthError::InvalidResponse("success without user".to_string()))
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn token_login(&self, user_id: &str, token: &str) -> Result<UserProfile, AuthError>;
}

/// HTTP client for the account service.
#[derive(Clone)]
pub struct AccountClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl AccountClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn endpoint(&self) -> String {
        format!("{}/tokenlogin", self.base_url)
    }
}

#[async_trait]
impl TokenVerifier for AccountClient {
    async fn token_login(&self, user_id: &str, token: &str) -> Result<UserProfile, AuthError> {
        if user_id.is_empty() || token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        debug!("Verifying token for user {} at {}", user_id, self.endpoint());

        let response = self
            .client
            .post(self.endpoint())
            .form(&[("user_id", user_id), ("user_token", token)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthError::Timeout(self.timeout)
                } else {
                    AuthError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AuthError::Status(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        interpret_response(&body)
    }
}
