//! Test doubles shared by the dispatcher and composer tests.

use async_trait::async_trait;
use p256::ecdsa::SigningKey;
use p256::pkcs8::{EncodePrivateKey, LineEnding};
use sentinel_core::config::ApnsConfig;
use sentinel_core::types::{PushEnvironment, TokenRegistration, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::PushError;
use crate::payload::{ApnsRequest, ApnsResponse};
use crate::store::TokenStore;
use crate::transport::{ApnsSession, ApnsTransport};

/// Deterministic P-256 key wrapped as a PKCS8 PEM, as APNs hands out.
pub fn test_apns_config() -> ApnsConfig {
    let key = SigningKey::from_slice(&[7u8; 32]).expect("signing key");
    let pem = key.to_pkcs8_pem(LineEnding::LF).expect("pem");
    ApnsConfig {
        team_id: "TEAM123456".to_string(),
        key_id: "KEY7654321".to_string(),
        private_key: pem.to_string(),
    }
}

pub fn register(store: &dyn TokenStore, token: &str, environment: PushEnvironment) {
    store
        .register(&TokenRegistration {
            token: token.to_string(),
            user_id: UserId::new("alice"),
            environment,
            bundle_id: "dev.sentinel.app".to_string(),
        })
        .expect("register");
}

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, Option<&'static str>),
    NetworkError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub environment: PushEnvironment,
    pub token: String,
    pub authorization: String,
    pub body: String,
}

#[derive(Default)]
pub struct Journal {
    pub opened: Vec<PushEnvironment>,
    pub closed: Vec<PushEnvironment>,
    pub sent: Vec<Sent>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pub journal: Arc<Mutex<Journal>>,
    pub replies: Arc<HashMap<String, Reply>>,
    pub refuse: Option<PushEnvironment>,
}

impl MockTransport {
    pub fn with_replies(replies: &[(&str, Reply)]) -> Self {
        Self {
            journal: Arc::default(),
            replies: Arc::new(
                replies
                    .iter()
                    .map(|(token, reply)| (token.to_string(), reply.clone()))
                    .collect(),
            ),
            refuse: None,
        }
    }
}

#[async_trait]
impl ApnsTransport for MockTransport {
    async fn open(
        &self,
        environment: PushEnvironment,
    ) -> Result<Box<dyn ApnsSession>, PushError> {
        if self.refuse == Some(environment) {
            return Err(PushError::Transport {
                message: "connection refused".to_string(),
            });
        }
        self.journal.lock().expect("journal").opened.push(environment);
        Ok(Box::new(MockSession {
            environment,
            journal: self.journal.clone(),
            replies: self.replies.clone(),
        }))
    }
}

struct MockSession {
    environment: PushEnvironment,
    journal: Arc<Mutex<Journal>>,
    replies: Arc<HashMap<String, Reply>>,
}

#[async_trait]
impl ApnsSession for MockSession {
    async fn send(&mut self, request: &ApnsRequest) -> Result<ApnsResponse, PushError> {
        let authorization = request
            .headers()
            .into_iter()
            .find(|(name, _)| *name == "authorization")
            .map(|(_, value)| value)
            .unwrap_or_default();
        self.journal.lock().expect("journal").sent.push(Sent {
            environment: self.environment,
            token: request.device_token.clone(),
            authorization,
            body: request.body.clone(),
        });
        match self.replies.get(&request.device_token) {
            None => Ok(ApnsResponse::from_parts(200, Some("apns-id".to_string()), b"")),
            Some(Reply::Status(status, reason)) => {
                let body = reason
                    .map(|reason| format!(r#"{{"reason":"{reason}"}}"#))
                    .unwrap_or_default();
                Ok(ApnsResponse::from_parts(*status, None, body.as_bytes()))
            }
            Some(Reply::NetworkError) => Err(PushError::Transport {
                message: "stream reset".to_string(),
            }),
        }
    }

    async fn close(self: Box<Self>) {
        self.journal
            .lock()
            .expect("journal")
            .closed
            .push(self.environment);
    }
}
