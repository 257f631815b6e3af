//! APNs wire model: notification body, per-token request, response.

use sentinel_core::types::ActiveToken;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::PushError;

pub const APNS_PUSH_TYPE_ALERT: &str = "alert";
/// Immediate delivery.
pub const APNS_PRIORITY_IMMEDIATE: &str = "10";
pub const DEFAULT_SOUND: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl PushPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            sound: None,
            data: Map::new(),
        }
    }

    pub fn with_sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = Some(sound.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn to_apns_body(&self) -> Value {
        json!({
            "aps": {
                "alert": {
                    "title": &self.title,
                    "body": &self.body,
                },
                "sound": self.sound.as_deref().unwrap_or(DEFAULT_SOUND),
            },
            "data": &self.data,
        })
    }
}

/// One `POST /3/device/{token}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnsRequest {
    pub device_token: String,
    pub provider_token: String,
    pub topic: String,
    pub body: String,
}

impl ApnsRequest {
    pub fn new(
        token: &ActiveToken,
        provider_token: &str,
        body: &Value,
    ) -> Result<Self, PushError> {
        Ok(Self {
            device_token: token.token.clone(),
            provider_token: provider_token.to_string(),
            topic: token.bundle_id.clone(),
            body: serde_json::to_string(body)?,
        })
    }

    pub fn path(&self) -> String {
        format!("/3/device/{}", self.device_token)
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("authorization", format!("bearer {}", self.provider_token)),
            ("apns-topic", self.topic.clone()),
            ("apns-push-type", APNS_PUSH_TYPE_ALERT.to_string()),
            ("apns-priority", APNS_PRIORITY_IMMEDIATE.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnsResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub apns_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    reason: Option<String>,
}

/// What a response means for the device token it was sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Permanent rejection; the token must not be used again.
    InvalidToken { reason: String },
    /// Anything else non-2xx. Logged, not retried.
    Rejected { status: u16, reason: Option<String> },
}

const INVALIDATING_REASONS: [&str; 2] = ["Unregistered", "BadDeviceToken"];

impl ApnsResponse {
    /// The body is only inspected for a `reason`; anything unparseable is
    /// treated as absent.
    pub fn from_parts(status: u16, apns_id: Option<String>, body: &[u8]) -> Self {
        let reason = if body.is_empty() {
            None
        } else {
            serde_json::from_slice::<ApnsErrorBody>(body)
                .ok()
                .and_then(|parsed| parsed.reason)
        };
        Self {
            status,
            reason,
            apns_id,
        }
    }

    pub fn outcome(&self) -> DeliveryOutcome {
        if (200..300).contains(&self.status) {
            return DeliveryOutcome::Delivered;
        }
        let reason_invalidates = self
            .reason
            .as_deref()
            .is_some_and(|reason| INVALIDATING_REASONS.contains(&reason));
        if self.status == 410 || reason_invalidates {
            return DeliveryOutcome::InvalidToken {
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("status {}", self.status)),
            };
        }
        DeliveryOutcome::Rejected {
            status: self.status,
            reason: self.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use sentinel_core::types::{ActiveToken, PushEnvironment};
    use serde_json::json;

    use super::{ApnsRequest, ApnsResponse, DeliveryOutcome, PushPayload};

    #[test]
    fn apns_body_nests_alert_under_aps_and_keeps_custom_data() {
        let payload = PushPayload::new("Task completed", "Fix login flow")
            .with_data("taskRunId", "run-1")
            .with_data("attempt", 2);
        let body = payload.to_apns_body();
        assert_eq!(
            body,
            json!({
                "aps": {
                    "alert": {"title": "Task completed", "body": "Fix login flow"},
                    "sound": "default"
                },
                "data": {"taskRunId": "run-1", "attempt": 2}
            })
        );

        let chime = PushPayload::new("t", "b").with_sound("chime").to_apns_body();
        assert_eq!(chime["aps"]["sound"], "chime");
        assert_eq!(chime["data"], json!({}));
    }

    #[test]
    fn request_targets_device_path_with_required_headers() {
        let token = ActiveToken {
            token: "deadbeef".to_string(),
            environment: PushEnvironment::Production,
            bundle_id: "dev.sentinel.app".to_string(),
        };
        let request =
            ApnsRequest::new(&token, "jwt.value.sig", &json!({"aps": {}})).expect("request");

        assert_eq!(request.path(), "/3/device/deadbeef");
        assert_eq!(request.body, r#"{"aps":{}}"#);
        assert_eq!(
            request.headers(),
            vec![
                ("authorization", "bearer jwt.value.sig".to_string()),
                ("apns-topic", "dev.sentinel.app".to_string()),
                ("apns-push-type", "alert".to_string()),
                ("apns-priority", "10".to_string()),
            ]
        );
    }

    #[test]
    fn success_statuses_are_delivered() {
        let response = ApnsResponse::from_parts(200, Some("id-1".to_string()), b"");
        assert_eq!(response.outcome(), DeliveryOutcome::Delivered);
        assert_eq!(response.apns_id.as_deref(), Some("id-1"));
    }

    #[test]
    fn gone_status_invalidates_token() {
        let response =
            ApnsResponse::from_parts(410, None, br#"{"reason":"Unregistered","timestamp":1}"#);
        assert_eq!(
            response.outcome(),
            DeliveryOutcome::InvalidToken {
                reason: "Unregistered".to_string()
            }
        );

        let bare = ApnsResponse::from_parts(410, None, b"");
        assert_eq!(
            bare.outcome(),
            DeliveryOutcome::InvalidToken {
                reason: "status 410".to_string()
            }
        );
    }

    #[test]
    fn bad_device_token_reason_invalidates_regardless_of_status() {
        let response = ApnsResponse::from_parts(400, None, br#"{"reason":"BadDeviceToken"}"#);
        assert_eq!(
            response.outcome(),
            DeliveryOutcome::InvalidToken {
                reason: "BadDeviceToken".to_string()
            }
        );
    }

    #[test]
    fn other_failures_are_transient_rejections() {
        let throttled = ApnsResponse::from_parts(429, None, br#"{"reason":"TooManyRequests"}"#);
        assert_eq!(
            throttled.outcome(),
            DeliveryOutcome::Rejected {
                status: 429,
                reason: Some("TooManyRequests".to_string())
            }
        );

        let garbled = ApnsResponse::from_parts(500, None, b"<html>oops</html>");
        assert_eq!(
            garbled.outcome(),
            DeliveryOutcome::Rejected {
                status: 500,
                reason: None
            }
        );
    }
}
