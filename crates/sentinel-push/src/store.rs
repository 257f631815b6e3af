use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sentinel_core::types::{ActiveToken, DeviceToken, PushEnvironment, TokenRegistration, UserId};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::StoreError;

/// Device-token persistence used by the dispatcher.
///
/// Listing returns only tokens without an invalidation timestamp. Marking a
/// token invalid is idempotent and reports whether a live record changed.
/// Registering an existing token updates it in place and revives it.
pub trait TokenStore: Send + Sync {
    fn register(&self, registration: &TokenRegistration) -> Result<DeviceToken, StoreError>;

    fn list_active_tokens_for_user(&self, user_id: &UserId) -> Result<Vec<ActiveToken>, StoreError>;

    fn mark_token_invalid(&self, token: &str, reason: &str) -> Result<bool, StoreError>;

    fn get(&self, token: &str) -> Result<Option<DeviceToken>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<BTreeMap<String, DeviceToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn register(&self, registration: &TokenRegistration) -> Result<DeviceToken, StoreError> {
        let mut tokens = self.tokens.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Utc::now();
        let created_at = tokens
            .get(&registration.token)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        let record = DeviceToken {
            token: registration.token.clone(),
            user_id: registration.user_id.clone(),
            environment: registration.environment,
            bundle_id: registration.bundle_id.clone(),
            created_at,
            updated_at: now,
            invalidated_at: None,
            invalidated_reason: None,
        };
        tokens.insert(record.token.clone(), record.clone());
        Ok(record)
    }

    fn list_active_tokens_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ActiveToken>, StoreError> {
        let tokens = self.tokens.lock().map_err(|_| StoreError::Poisoned)?;
        let mut active: Vec<&DeviceToken> = tokens
            .values()
            .filter(|record| &record.user_id == user_id && record.is_active())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.token.cmp(&b.token)));
        Ok(active.into_iter().map(DeviceToken::to_active).collect())
    }

    fn mark_token_invalid(&self, token: &str, reason: &str) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(record) = tokens.get_mut(token) else {
            return Ok(false);
        };
        if !record.is_active() {
            return Ok(false);
        }
        let now = Utc::now();
        record.invalidated_at = Some(now);
        record.invalidated_reason = Some(reason.to_string());
        record.updated_at = now;
        Ok(true)
    }

    fn get(&self, token: &str) -> Result<Option<DeviceToken>, StoreError> {
        let tokens = self.tokens.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tokens.get(token).cloned())
    }
}

#[derive(Debug)]
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

type TokenRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

impl SqliteTokenStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS device_tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    environment TEXT NOT NULL,
    bundle_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    invalidated_at TEXT,
    invalidated_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_device_tokens_user ON device_tokens(user_id, invalidated_at);
"#,
        )?;
        Ok(())
    }

    fn load(conn: &Connection, token: &str) -> Result<Option<DeviceToken>, StoreError> {
        let row: Option<TokenRow> = conn
            .query_row(
                r#"
SELECT token, user_id, environment, bundle_id, created_at, updated_at, invalidated_at, invalidated_reason
FROM device_tokens
WHERE token = ?1
"#,
                params![token],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;
        row.map(device_token_from_row).transpose()
    }
}

impl TokenStore for SqliteTokenStore {
    fn register(&self, registration: &TokenRegistration) -> Result<DeviceToken, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
INSERT INTO device_tokens (token, user_id, environment, bundle_id, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?5)
ON CONFLICT(token) DO UPDATE SET
  user_id = excluded.user_id,
  environment = excluded.environment,
  bundle_id = excluded.bundle_id,
  updated_at = excluded.updated_at,
  invalidated_at = NULL,
  invalidated_reason = NULL
"#,
            params![
                registration.token,
                registration.user_id.0,
                registration.environment.as_str(),
                registration.bundle_id,
                now,
            ],
        )?;
        Self::load(&conn, &registration.token)?.ok_or(StoreError::Sql {
            source: rusqlite::Error::QueryReturnedNoRows,
        })
    }

    fn list_active_tokens_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ActiveToken>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            r#"
SELECT token, environment, bundle_id
FROM device_tokens
WHERE user_id = ?1 AND invalidated_at IS NULL
ORDER BY created_at ASC, token ASC
"#,
        )?;
        let rows = stmt.query_map(params![user_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (token, environment, bundle_id) = row?;
            out.push(ActiveToken {
                token,
                environment: parse_environment(environment)?,
                bundle_id,
            });
        }
        Ok(out)
    }

    fn mark_token_invalid(&self, token: &str, reason: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            r#"
UPDATE device_tokens
SET invalidated_at = ?2, invalidated_reason = ?3, updated_at = ?2
WHERE token = ?1 AND invalidated_at IS NULL
"#,
            params![token, now, reason],
        )?;
        Ok(changed > 0)
    }

    fn get(&self, token: &str) -> Result<Option<DeviceToken>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Self::load(&conn, token)
    }
}

fn device_token_from_row(row: TokenRow) -> Result<DeviceToken, StoreError> {
    let (token, user_id, environment, bundle_id, created_at, updated_at, invalidated_at, reason) =
        row;
    Ok(DeviceToken {
        token,
        user_id: UserId(user_id),
        environment: parse_environment(environment)?,
        bundle_id,
        created_at: parse_timestamp(created_at)?,
        updated_at: parse_timestamp(updated_at)?,
        invalidated_at: invalidated_at.map(parse_timestamp).transpose()?,
        invalidated_reason: reason,
    })
}

fn parse_environment(value: String) -> Result<PushEnvironment, StoreError> {
    value
        .parse::<PushEnvironment>()
        .map_err(|_| StoreError::Environment { value })
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse { value, source })
}
