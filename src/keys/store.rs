//! Secret key repositories.
//!
//! A key row is keyed by UPN; writes are single atomic upserts so concurrent
//! re-enrollment can never produce duplicate rows or interleave an insert
//! with an update. A directory-attribute store is an external implementor of
//! the same trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::config::KeyFormat;

/// Persisted secret-key row. `seed` holds base32 seed material for the RNG
/// format and a base64 sealed blob for the RSA format; `certificate` is the
/// base64-encoded encrypted certificate bundle (RSA format only).
#[derive(Clone, Debug)]
pub struct KeyRecord {
    pub upn: String,
    pub format: KeyFormat,
    pub seed: String,
    pub certificate: Option<String>,
    pub creation_date: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for KeyRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let format: String = row.try_get("format")?;
        let format = KeyFormat::from_str(&format).ok_or_else(|| {
            sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid mfa_secret_keys.format value: {format}"),
            )))
        })?;
        Ok(Self {
            upn: row.try_get("upn")?,
            format,
            seed: row.try_get("seed")?,
            certificate: row.try_get("certificate")?,
            creation_date: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Atomic insert-or-replace of the single key row for the UPN.
    async fn upsert(&self, record: KeyRecord) -> Result<()>;
    async fn fetch(&self, upn: &str) -> Result<Option<KeyRecord>>;
    async fn delete(&self, upn: &str) -> Result<bool>;
}

/// Relational store backed by Postgres.
#[derive(Clone)]
pub struct SqlKeyStore {
    pool: PgPool,
}

impl SqlKeyStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyStore for SqlKeyStore {
    async fn upsert(&self, record: KeyRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO mfa_secret_keys (upn, format, seed, certificate, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (upn) DO UPDATE
            SET format = $2,
                seed = $3,
                certificate = $4,
                created_at = NOW()
            ",
        )
        .bind(&record.upn)
        .bind(record.format.as_str())
        .bind(&record.seed)
        .bind(&record.certificate)
        .execute(&self.pool)
        .await
        .context("Failed to upsert secret key")?;
        Ok(())
    }

    async fn fetch(&self, upn: &str) -> Result<Option<KeyRecord>> {
        sqlx::query_as::<_, KeyRecord>("SELECT * FROM mfa_secret_keys WHERE upn = $1")
            .bind(upn)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch secret key")
    }

    async fn delete(&self, upn: &str) -> Result<bool> {
        let row = sqlx::query("DELETE FROM mfa_secret_keys WHERE upn = $1 RETURNING upn")
            .bind(upn)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to delete secret key")?;
        Ok(row.is_some())
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    rows: Arc<RwLock<HashMap<String, KeyRecord>>>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn upsert(&self, record: KeyRecord) -> Result<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        rows.insert(record.upn.clone(), record);
        Ok(())
    }

    async fn fetch(&self, upn: &str) -> Result<Option<KeyRecord>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        Ok(rows.get(upn).cloned())
    }

    async fn delete(&self, upn: &str) -> Result<bool> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        Ok(rows.remove(upn).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(upn: &str, seed: &str) -> KeyRecord {
        KeyRecord {
            upn: upn.to_string(),
            format: KeyFormat::Rng,
            seed: seed.to_string(),
            certificate: None,
            creation_date: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_the_single_row() {
        let store = MemoryKeyStore::new();
        store.upsert(record("alice@example.com", "AAAA")).await.unwrap();
        store.upsert(record("alice@example.com", "BBBB")).await.unwrap();
        let fetched = store.fetch("alice@example.com").await.unwrap().unwrap();
        assert_eq!(fetched.seed, "BBBB");
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryKeyStore::new();
        assert!(!store.delete("alice@example.com").await.unwrap());
        store.upsert(record("alice@example.com", "AAAA")).await.unwrap();
        assert!(store.delete("alice@example.com").await.unwrap());
        assert!(store.fetch("alice@example.com").await.unwrap().is_none());
    }
}
