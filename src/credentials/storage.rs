use super::{encryption, StoredTokens};
use crate::settings::SettingsFingerprint;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed vault of sealed token records.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_tokens (
///     destination TEXT NOT NULL,
///     fingerprint TEXT NOT NULL,
///     sealed TEXT NOT NULL,        -- AES-256-GCM sealed JSON of StoredTokens
///     updated_at TEXT NOT NULL,    -- RFC 3339
///     PRIMARY KEY (destination, fingerprint)
/// );
/// ```
pub struct TokenVault {
    conn: Mutex<Connection>,
    key: [u8; 32],
}

impl TokenVault {
    /// Opens (or creates) a vault. `key` is the base64 256-bit vault key.
    pub fn open<P: AsRef<Path>>(path: P, key: &str) -> Result<Self> {
        let key = encryption::parse_key(key).context("Invalid vault key")?;
        let conn = Connection::open(path).context("Failed to open token vault")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                destination TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                sealed TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (destination, fingerprint)
            )
            "#,
            [],
        )
        .context("Failed to create oauth_tokens table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("token vault connection lock poisoned"))
    }

    /// Stores the latest tokens, replacing any previous record.
    pub fn put(
        &self,
        destination: &str,
        fingerprint: &SettingsFingerprint,
        tokens: &StoredTokens,
    ) -> Result<()> {
        let json = serde_json::to_vec(tokens).context("Failed to serialize tokens")?;
        let sealed = encryption::seal(&json, &self.key).context("Failed to seal tokens")?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO oauth_tokens (destination, fingerprint, sealed, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(destination, fingerprint) DO UPDATE SET
                    sealed = excluded.sealed,
                    updated_at = excluded.updated_at
                "#,
                params![destination, fingerprint.as_str(), sealed, Utc::now().to_rfc3339()],
            )
            .context("Failed to store tokens")?;
        Ok(())
    }

    pub fn get(
        &self,
        destination: &str,
        fingerprint: &SettingsFingerprint,
    ) -> Result<Option<StoredTokens>> {
        let sealed: Option<String> = self
            .conn()?
            .query_row(
                "SELECT sealed FROM oauth_tokens WHERE destination = ?1 AND fingerprint = ?2",
                params![destination, fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read tokens")?;

        let Some(sealed) = sealed else {
            return Ok(None);
        };
        let json = encryption::open(&sealed, &self.key).context("Failed to open tokens")?;
        let tokens = serde_json::from_slice(&json).context("Stored tokens are malformed")?;
        Ok(Some(tokens))
    }

    /// Drops the record; returns whether one existed.
    pub fn remove(&self, destination: &str, fingerprint: &SettingsFingerprint) -> Result<bool> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM oauth_tokens WHERE destination = ?1 AND fingerprint = ?2",
                params![destination, fingerprint.as_str()],
            )
            .context("Failed to delete tokens")?;
        Ok(removed > 0)
    }
}
