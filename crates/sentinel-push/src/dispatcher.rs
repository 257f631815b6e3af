use chrono::Utc;
use sentinel_core::config::ApnsConfig;
use sentinel_core::types::{ActiveToken, PushEnvironment, UserId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::jwt::ApnsSigner;
use crate::payload::{ApnsRequest, DeliveryOutcome, PushPayload};
use crate::store::TokenStore;
use crate::transport::ApnsTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotConfigured,
    NoActiveTokens,
    StoreUnavailable,
}

/// Per-call tally. Failures never propagate out of `send_to_user`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub skipped: Option<SkipReason>,
    pub sessions_opened: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub invalidated: Vec<String>,
    pub failed: usize,
}

impl DeliveryReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

pub struct PushDispatcher {
    signer: Option<ApnsSigner>,
    transport: Arc<dyn ApnsTransport>,
    store: Arc<dyn TokenStore>,
}

impl PushDispatcher {
    /// A missing or unusable config yields a dispatcher that logs and no-ops.
    pub fn new(
        config: Option<&ApnsConfig>,
        transport: Arc<dyn ApnsTransport>,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        let signer = match config {
            None => {
                info!("apns credentials not configured; push delivery disabled");
                None
            }
            Some(config) => match ApnsSigner::new(config) {
                Ok(signer) => Some(signer),
                Err(err) => {
                    error!(key_id = %config.key_id, error = %err, "apns signing key rejected; push delivery disabled");
                    None
                }
            },
        };
        Self {
            signer,
            transport,
            store,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.signer.is_some()
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub async fn send_to_user(&self, user_id: &UserId, payload: &PushPayload) -> DeliveryReport {
        let Some(signer) = &self.signer else {
            debug!(user_id = %user_id, "skipping push: apns not configured");
            return DeliveryReport::skipped(SkipReason::NotConfigured);
        };

        let owner = user_id.clone();
        let listed = self
            .with_store(move |store| store.list_active_tokens_for_user(&owner))
            .await;
        let tokens = match listed {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "failed to load device tokens");
                return DeliveryReport::skipped(SkipReason::StoreUnavailable);
            }
        };
        if tokens.is_empty() {
            debug!(user_id = %user_id, "no active device tokens");
            return DeliveryReport::skipped(SkipReason::NoActiveTokens);
        }

        let body = payload.to_apns_body();
        let mut report = DeliveryReport::default();
        for (environment, group) in partition_by_environment(tokens) {
            self.deliver_group(signer, environment, &group, &body, &mut report)
                .await;
        }
        info!(
            user_id = %user_id,
            delivered = report.delivered,
            invalidated = report.invalidated.len(),
            failed = report.failed,
            "push delivery finished"
        );
        report
    }

    async fn deliver_group(
        &self,
        signer: &ApnsSigner,
        environment: PushEnvironment,
        group: &[ActiveToken],
        body: &Value,
        report: &mut DeliveryReport,
    ) {
        let provider_token = match signer.mint(Utc::now()) {
            Ok(token) => token,
            Err(err) => {
                error!(environment = %environment, error = %err, "failed to sign provider token");
                report.failed += group.len();
                return;
            }
        };
        let mut session = match self.transport.open(environment).await {
            Ok(session) => session,
            Err(err) => {
                warn!(environment = %environment, error = %err, "failed to open apns session");
                report.failed += group.len();
                return;
            }
        };
        report.sessions_opened += 1;

        for token in group {
            report.attempted += 1;
            let request = match ApnsRequest::new(token, &provider_token.token, body) {
                Ok(request) => request,
                Err(err) => {
                    warn!(environment = %environment, error = %err, "failed to build apns request");
                    report.failed += 1;
                    continue;
                }
            };

            let response = match session.send(&request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(environment = %environment, token = %redact(&token.token), error = %err, "apns request failed");
                    report.failed += 1;
                    continue;
                }
            };

            match response.outcome() {
                DeliveryOutcome::Delivered => {
                    debug!(environment = %environment, apns_id = ?response.apns_id, "push delivered");
                    report.delivered += 1;
                }
                DeliveryOutcome::InvalidToken { reason } => {
                    info!(token = %redact(&token.token), reason = %reason, "apns rejected device token; invalidating");
                    let invalid = token.token.clone();
                    let marked = self
                        .with_store(move |store| store.mark_token_invalid(&invalid, &reason))
                        .await;
                    match marked {
                        Ok(true) => report.invalidated.push(token.token.clone()),
                        Ok(false) => {
                            debug!(token = %redact(&token.token), "device token was already invalid");
                        }
                        Err(err) => {
                            warn!(token = %redact(&token.token), error = %err, "failed to invalidate device token");
                            report.failed += 1;
                        }
                    }
                }
                DeliveryOutcome::Rejected { status, reason } => {
                    warn!(
                        environment = %environment,
                        token = %redact(&token.token),
                        status,
                        reason = reason.as_deref().unwrap_or("none"),
                        "apns rejected push"
                    );
                    report.failed += 1;
                }
            }
        }

        session.close().await;
    }

    /// Token stores block, so calls run on tokio's blocking pool.
    async fn with_store<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TokenStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|err| StoreError::Task {
                message: err.to_string(),
            })?
    }
}

/// Groups preserve the store's ordering within each environment.
pub fn partition_by_environment(
    tokens: Vec<ActiveToken>,
) -> BTreeMap<PushEnvironment, Vec<ActiveToken>> {
    let mut groups: BTreeMap<PushEnvironment, Vec<ActiveToken>> = BTreeMap::new();
    for token in tokens {
        groups.entry(token.environment).or_default().push(token);
    }
    groups
}

fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if prefix.len() < token.len() {
        format!("{prefix}…")
    } else {
        prefix
    }
}
