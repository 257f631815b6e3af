//! ES256 provider tokens for APNs token-based auth.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use sentinel_core::config::ApnsConfig;
use serde_json::json;
use std::fmt;

use crate::error::PushError;

/// APNs refuses provider tokens older than an hour.
pub const PROVIDER_TOKEN_TTL_MINUTES: i64 = 50;

pub struct ApnsSigner {
    team_id: String,
    key_id: String,
    key: SigningKey,
}

impl fmt::Debug for ApnsSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApnsSigner")
            .field("team_id", &self.team_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProviderToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl ApnsSigner {
    pub fn new(config: &ApnsConfig) -> Result<Self, PushError> {
        let key = SigningKey::from_pkcs8_pem(&config.private_key).map_err(|err| {
            PushError::InvalidKey {
                message: err.to_string(),
            }
        })?;
        Ok(Self {
            team_id: config.team_id.clone(),
            key_id: config.key_id.clone(),
            key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn mint(&self, issued_at: DateTime<Utc>) -> Result<ProviderToken, PushError> {
        let expires_at = issued_at + Duration::minutes(PROVIDER_TOKEN_TTL_MINUTES);
        let header = json!({ "alg": "ES256", "kid": &self.key_id });
        let claims = json!({
            "iss": &self.team_id,
            "iat": issued_at.timestamp(),
            "exp": expires_at.timestamp(),
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?),
        );
        let signature: Signature =
            self.key
                .try_sign(signing_input.as_bytes())
                .map_err(|err| PushError::Signing {
                    message: err.to_string(),
                })?;

        Ok(ProviderToken {
            token: format!(
                "{signing_input}.{}",
                URL_SAFE_NO_PAD.encode(signature.to_bytes())
            ),
            issued_at,
            expires_at,
        })
    }
}
