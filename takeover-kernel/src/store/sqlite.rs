use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::info;

use super::{check_unique, MappingStore, PlatformStore};
use crate::error::Result;
use crate::models::{PlatformInstance, PlatformType, TakeoverScope, UuidMapping};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS platform_instance (
        uuid       TEXT PRIMARY KEY,
        name       TEXT NOT NULL,
        type       TEXT NOT NULL,
        domain     TEXT NOT NULL,
        hostname   TEXT NOT NULL UNIQUE,
        endpoint   TEXT NOT NULL UNIQUE,
        username   TEXT NOT NULL,
        password   TEXT NOT NULL,
        scope_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS uuid_map_a (
        external_id TEXT PRIMARY KEY,
        internal_id TEXT NOT NULL UNIQUE,
        ip          TEXT,
        flavor_id   TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS uuid_map_b (
        external_id TEXT PRIMARY KEY,
        internal_id TEXT NOT NULL UNIQUE,
        ip          TEXT,
        flavor_id   TEXT
    )
    "#,
];

// Table names come from this match only; every value is bound.
fn mapping_table(platform_type: PlatformType) -> &'static str {
    match platform_type {
        PlatformType::A => "uuid_map_a",
        PlatformType::B => "uuid_map_b",
    }
}

/// SQLite-backed platform registry and id mapping tables.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url`, e.g.
    /// `sqlite://./data/takeover.db` or `sqlite::memory:`.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // an in-memory database lives and dies with its single connection
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!(url, "store ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn all_platforms(&self) -> Result<Vec<PlatformInstance>> {
        let rows = sqlx::query(
            "SELECT uuid, name, type, domain, hostname, endpoint, username, password, scope_json
             FROM platform_instance ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_platform).collect()
    }
}

fn row_to_platform(row: &SqliteRow) -> Result<PlatformInstance> {
    let raw_type: String = row.try_get("type")?;
    let scope_json: String = row.try_get("scope_json")?;
    let takeover_scope: TakeoverScope = serde_json::from_str(&scope_json)?;
    Ok(PlatformInstance {
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        platform_type: raw_type.parse()?,
        domain: row.try_get("domain")?,
        hostname: row.try_get("hostname")?,
        api_endpoint: row.try_get("endpoint")?,
        api_username: row.try_get("username")?,
        api_password: row.try_get("password")?,
        takeover_scope,
    })
}

fn row_to_mapping(platform_type: PlatformType, row: &SqliteRow) -> Result<UuidMapping> {
    Ok(UuidMapping {
        platform_type,
        external_id: row.try_get("external_id")?,
        internal_id: row.try_get("internal_id")?,
        ip: row.try_get("ip")?,
        flavor_id: row.try_get("flavor_id")?,
    })
}

#[async_trait]
impl PlatformStore for SqliteStore {
    async fn insert_platform(&self, instance: &PlatformInstance) -> Result<()> {
        check_unique(&self.all_platforms().await?, instance)?;
        sqlx::query(
            "INSERT INTO platform_instance
             (uuid, name, type, domain, hostname, endpoint, username, password, scope_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.uuid)
        .bind(&instance.name)
        .bind(instance.platform_type.as_str())
        .bind(&instance.domain)
        .bind(&instance.hostname)
        .bind(&instance.api_endpoint)
        .bind(&instance.api_username)
        .bind(&instance.api_password)
        .bind(serde_json::to_string(&instance.takeover_scope)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_platform(&self, uuid: &str) -> Result<Option<PlatformInstance>> {
        let row = sqlx::query(
            "SELECT uuid, name, type, domain, hostname, endpoint, username, password, scope_json
             FROM platform_instance WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_platform).transpose()
    }

    async fn list_platforms(&self, platform_type: PlatformType) -> Result<Vec<PlatformInstance>> {
        let rows = sqlx::query(
            "SELECT uuid, name, type, domain, hostname, endpoint, username, password, scope_json
             FROM platform_instance WHERE type = ? ORDER BY name",
        )
        .bind(platform_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_platform).collect()
    }

    async fn update_platform(&self, instance: &PlatformInstance) -> Result<()> {
        check_unique(&self.all_platforms().await?, instance)?;
        sqlx::query(
            "UPDATE platform_instance
             SET name = ?, domain = ?, hostname = ?, endpoint = ?, username = ?, password = ?, scope_json = ?
             WHERE uuid = ?",
        )
        .bind(&instance.name)
        .bind(&instance.domain)
        .bind(&instance.hostname)
        .bind(&instance.api_endpoint)
        .bind(&instance.api_username)
        .bind(&instance.api_password)
        .bind(serde_json::to_string(&instance.takeover_scope)?)
        .bind(&instance.uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_platform(&self, uuid: &str) -> Result<()> {
        sqlx::query("DELETE FROM platform_instance WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn upsert_mapping(&self, mapping: &UuidMapping) -> Result<()> {
        // REPLACE also evicts a row that still claims the same internal id
        let sql = format!(
            "INSERT OR REPLACE INTO {} (external_id, internal_id, ip, flavor_id) VALUES (?, ?, ?, ?)",
            mapping_table(mapping.platform_type)
        );
        sqlx::query(&sql)
            .bind(&mapping.external_id)
            .bind(&mapping.internal_id)
            .bind(&mapping.ip)
            .bind(&mapping.flavor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mapping_by_external(
        &self,
        platform_type: PlatformType,
        external_id: &str,
    ) -> Result<Option<UuidMapping>> {
        let sql = format!(
            "SELECT external_id, internal_id, ip, flavor_id FROM {} WHERE external_id = ?",
            mapping_table(platform_type)
        );
        let row = sqlx::query(&sql).bind(external_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(|r| row_to_mapping(platform_type, r)).transpose()
    }

    async fn mapping_by_internal(
        &self,
        platform_type: PlatformType,
        internal_id: &str,
    ) -> Result<Option<UuidMapping>> {
        let sql = format!(
            "SELECT external_id, internal_id, ip, flavor_id FROM {} WHERE internal_id = ?",
            mapping_table(platform_type)
        );
        let row = sqlx::query(&sql).bind(internal_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(|r| row_to_mapping(platform_type, r)).transpose()
    }

    async fn list_mappings(&self, platform_type: PlatformType) -> Result<Vec<UuidMapping>> {
        let sql = format!(
            "SELECT external_id, internal_id, ip, flavor_id FROM {} ORDER BY external_id",
            mapping_table(platform_type)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|r| row_to_mapping(platform_type, r)).collect()
    }

    async fn delete_mapping(&self, platform_type: PlatformType, internal_id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE internal_id = ?", mapping_table(platform_type));
        sqlx::query(&sql).bind(internal_id).execute(&self.pool).await?;
        Ok(())
    }
}
