//! Registration repositories.
//!
//! UPNs are stored normalized (lowercased) so lookups are case-insensitive.
//! Writes are atomic upserts keyed by UPN; concurrent enrollment retries for
//! the same identity serialize on the unique key rather than racing an
//! insert/update pair.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::registration::models::Registration;
use crate::validate::normalize_upn;

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn fetch(&self, upn: &str) -> Result<Option<Registration>>;
    /// Atomic insert-or-replace keyed by UPN.
    async fn upsert(&self, registration: &Registration) -> Result<()>;
    async fn delete(&self, upn: &str) -> Result<bool>;
    async fn set_enabled(&self, upn: &str, enabled: bool) -> Result<bool>;
    async fn list(&self) -> Result<Vec<Registration>>;
}

/// Relational store backed by Postgres.
#[derive(Clone)]
pub struct SqlRegistrationStore {
    pool: PgPool,
}

impl SqlRegistrationStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistrationStore for SqlRegistrationStore {
    async fn fetch(&self, upn: &str) -> Result<Option<Registration>> {
        sqlx::query_as::<_, Registration>("SELECT * FROM mfa_registrations WHERE upn = $1")
            .bind(normalize_upn(upn))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch registration")
    }

    async fn upsert(&self, registration: &Registration) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO mfa_registrations
            (id, upn, mail_address, phone_number, enabled, is_registered,
             created_at, preferred_method, pin_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (upn) DO UPDATE
            SET mail_address = $3,
                phone_number = $4,
                enabled = $5,
                is_registered = $6,
                preferred_method = $8,
                pin_hash = $9
            ",
        )
        .bind(registration.id)
        .bind(normalize_upn(&registration.upn))
        .bind(&registration.mail_address)
        .bind(&registration.phone_number)
        .bind(registration.enabled)
        .bind(registration.is_registered)
        .bind(registration.creation_date)
        .bind(registration.preferred_method.as_str())
        .bind(&registration.pin_hash)
        .execute(&self.pool)
        .await
        .context("Failed to upsert registration")?;
        Ok(())
    }

    async fn delete(&self, upn: &str) -> Result<bool> {
        let row = sqlx::query("DELETE FROM mfa_registrations WHERE upn = $1 RETURNING upn")
            .bind(normalize_upn(upn))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to delete registration")?;
        Ok(row.is_some())
    }

    async fn set_enabled(&self, upn: &str, enabled: bool) -> Result<bool> {
        let row = sqlx::query(
            "UPDATE mfa_registrations SET enabled = $2 WHERE upn = $1 RETURNING upn",
        )
        .bind(normalize_upn(upn))
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update registration enablement")?;
        Ok(row.is_some())
    }

    async fn list(&self) -> Result<Vec<Registration>> {
        sqlx::query_as::<_, Registration>("SELECT * FROM mfa_registrations ORDER BY upn")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list registrations")
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryRegistrationStore {
    rows: Arc<RwLock<HashMap<String, Registration>>>,
}

impl MemoryRegistrationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn fetch(&self, upn: &str) -> Result<Option<Registration>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        Ok(rows.get(&normalize_upn(upn)).cloned())
    }

    async fn upsert(&self, registration: &Registration) -> Result<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        let mut stored = registration.clone();
        stored.upn = normalize_upn(&stored.upn);
        rows.insert(stored.upn.clone(), stored);
        Ok(())
    }

    async fn delete(&self, upn: &str) -> Result<bool> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        Ok(rows.remove(&normalize_upn(upn)).is_some())
    }

    async fn set_enabled(&self, upn: &str, enabled: bool) -> Result<bool> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        match rows.get_mut(&normalize_upn(upn)) {
            Some(registration) => {
                registration.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<Registration>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow::anyhow!("poisoned lock"))?;
        let mut all: Vec<Registration> = rows.values().cloned().collect();
        all.sort_by(|a, b| a.upn.cmp(&b.upn));
        Ok(all)
    }
}
