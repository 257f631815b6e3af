//! Core identifiers and push-delivery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRunId(pub String);

impl TaskRunId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// APNs delivery tier. Each tier has its own endpoint host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PushEnvironment {
    Development,
    #[default]
    Production,
}

impl PushEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            PushEnvironment::Development => "development",
            PushEnvironment::Production => "production",
        }
    }

    pub fn host(self) -> &'static str {
        match self {
            PushEnvironment::Development => "api.sandbox.push.apple.com",
            PushEnvironment::Production => "api.push.apple.com",
        }
    }
}

impl std::str::FromStr for PushEnvironment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "development" | "sandbox" => Ok(PushEnvironment::Development),
            "production" => Ok(PushEnvironment::Production),
            other => Err(format!(
                "invalid push environment '{other}'. valid values: development, production"
            )),
        }
    }
}

impl std::fmt::Display for PushEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered device push credential, keyed by `token`.
///
/// Invalidated records are kept for audit and excluded from delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub token: String,
    pub user_id: UserId,
    pub environment: PushEnvironment,
    pub bundle_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub invalidated_reason: Option<String>,
}

impl DeviceToken {
    pub fn is_active(&self) -> bool {
        self.invalidated_at.is_none()
    }

    pub fn to_active(&self) -> ActiveToken {
        ActiveToken {
            token: self.token.clone(),
            environment: self.environment,
            bundle_id: self.bundle_id.clone(),
        }
    }
}

/// The slice of a device token needed to address a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveToken {
    pub token: String,
    pub environment: PushEnvironment,
    pub bundle_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRegistration {
    pub token: String,
    pub user_id: UserId,
    pub environment: PushEnvironment,
    pub bundle_id: String,
}
