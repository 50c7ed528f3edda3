use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::util::Timestamp;

/// Login material for the weather API.
///
/// Supplied by the hosting application (config file or environment); the
/// reconciliation core never sees it. Debug output redacts the password.
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
    pub device_id: String,
    pub device_name: String,
}

/// SEC-006: Mask the password in Debug output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .finish()
    }
}

#[derive(Serialize)]
struct DevicePayload<'a> {
    device_id: &'a str,
    device_name: &'a str,
}

#[derive(Serialize)]
pub(crate) struct LoginPayload<'a> {
    email: &'a str,
    password: &'a str,
    device: DevicePayload<'a>,
}

impl<'a> LoginPayload<'a> {
    pub(crate) fn from_credentials(credentials: &'a Credentials) -> Self {
        Self {
            email: &credentials.email,
            password: credentials.password.expose_secret(),
            device: DevicePayload {
                device_id: &credentials.device_id,
                device_name: &credentials.device_name,
            },
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct LoginResponse {
    #[serde(rename = "Authorization")]
    authorization: Option<String>,
}

/// Tokens obtained from one successful login.
///
/// Held by the client and replaced by a fresh login when the API reports the
/// access token as expired (HTTP 401). The API's refresh token is ignored:
/// it offers no refresh endpoint.
pub struct AuthTokens {
    pub(crate) authorization: SecretString,
    pub(crate) acquired_at: Timestamp,
}

impl AuthTokens {
    /// Returns `None` when the login response carried no access token.
    pub(crate) fn from_response(response: LoginResponse) -> Option<Self> {
        let authorization = response.authorization.filter(|t| !t.trim().is_empty())?;
        Some(Self {
            authorization: SecretString::from(authorization),
            acquired_at: Utc::now(),
        })
    }
}

/// SEC-006: Tokens are bearer secrets; never print them.
impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("authorization", &"[REDACTED]")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}
