use crate::documents::DocumentPersistence;
use crate::errors::{AppError, AppResult};
use crate::models::{
    DashboardDocument, DashboardVersionRecord, DashboardVersionSummary, LegacyConnectionRow, NewDocument,
    OverwriteRequest, StoreSettings, StoredConnectionRow, TenantConnectionConfig,
};
use crate::tenant_config::ConnectionConfigPersistence;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_KEY: &str = "store";

/// SQLite-backed implementation of both persistence ports. The mutex only
/// guards the handle; writers serialize through SQLite transactions, so several
/// processes may share one database file.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_default_settings()?;

        tracing::info!(path = %path.display(), "opened dashboard config database");
        Ok(db)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn get_settings(&self) -> AppResult<StoreSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<StoreSettings>(&raw).unwrap_or_else(|error| {
                tracing::warn!(error = %error, "stored settings are unreadable; using defaults");
                StoreSettings::default()
            })),
            None => Ok(StoreSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<StoreSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: StoreSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("invalid settings: {}", error)))?;
        validate_settings(&settings)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![SETTINGS_KEY, serde_json::to_string(&settings)?, format_time(Utc::now())],
        )?;

        tracing::info!(
            retention_limit = settings.retention_limit,
            grid_columns = settings.grid_columns,
            "updated store settings"
        );
        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [SETTINGS_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    SETTINGS_KEY,
                    serde_json::to_string(&StoreSettings::default())?,
                    format_time(Utc::now())
                ],
            )?;
        }
        Ok(())
    }
}

impl DocumentPersistence for Database {
    fn find_document(&self, tenant_id: &str, dashboard_id: &str) -> AppResult<Option<DashboardDocument>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT tenant_id, dashboard_id, name, data_json, created_at, updated_at, created_by
             FROM dashboards WHERE tenant_id = ?1 AND dashboard_id = ?2",
            params![tenant_id, dashboard_id],
            parse_dashboard_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn find_version(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        version_id: &str,
    ) -> AppResult<Option<DashboardVersionRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT version_id, tenant_id, dashboard_id, name, data_json, source_updated_at, created_by, created_at
             FROM dashboard_versions
             WHERE tenant_id = ?1 AND dashboard_id = ?2 AND version_id = ?3",
            params![tenant_id, dashboard_id, version_id],
            parse_version_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_versions(&self, tenant_id: &str, dashboard_id: &str, limit: u32) -> AppResult<Vec<DashboardVersionSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT version_id, tenant_id, dashboard_id, name, source_updated_at, created_by, created_at
             FROM dashboard_versions
             WHERE tenant_id = ?1 AND dashboard_id = ?2
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![tenant_id, dashboard_id, limit], |row| {
            Ok(DashboardVersionSummary {
                version_id: row.get(0)?,
                tenant_id: row.get(1)?,
                dashboard_id: row.get(2)?,
                name: row.get(3)?,
                source_updated_at: parse_time(&row.get::<_, String>(4)?)?,
                created_by: row.get(5)?,
                created_at: parse_time(&row.get::<_, String>(6)?)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn insert_document(&self, document: &NewDocument<'_>) -> AppResult<()> {
        let written_at = format_time(document.written_at);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dashboards (tenant_id, dashboard_id, name, data_json, created_at, updated_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)",
            params![
                document.tenant_id,
                document.dashboard_id,
                document.name,
                document.data_json,
                written_at,
                document.actor_id,
            ],
        )
        .map_err(|error| match error {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                AppError::Transaction(format!(
                    "dashboard {} was created concurrently",
                    document.dashboard_id
                ))
            }
            other => AppError::from(other),
        })?;
        Ok(())
    }

    fn snapshot_and_overwrite(&self, request: &OverwriteRequest<'_>) -> AppResult<usize> {
        let expected = format_time(request.expected_updated_at);
        let written_at = format_time(request.written_at);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(transaction_error)?;

        let copied = tx
            .execute(
                "INSERT INTO dashboard_versions
                   (version_id, tenant_id, dashboard_id, name, data_json, source_updated_at, created_by, created_at)
                 SELECT ?1, tenant_id, dashboard_id, name, data_json, updated_at, ?2, ?3
                 FROM dashboards
                 WHERE tenant_id = ?4 AND dashboard_id = ?5 AND updated_at = ?6",
                params![
                    request.backup_version_id,
                    request.actor_id,
                    written_at,
                    request.tenant_id,
                    request.dashboard_id,
                    expected,
                ],
            )
            .map_err(transaction_error)?;
        if copied == 0 {
            return Err(AppError::Transaction(format!(
                "dashboard {} changed since it was read",
                request.dashboard_id
            )));
        }

        let updated = tx
            .execute(
                "UPDATE dashboards SET name = ?1, data_json = ?2, updated_at = ?3
                 WHERE tenant_id = ?4 AND dashboard_id = ?5 AND updated_at = ?6",
                params![
                    request.name,
                    request.data_json,
                    written_at,
                    request.tenant_id,
                    request.dashboard_id,
                    expected,
                ],
            )
            .map_err(transaction_error)?;
        if updated == 0 {
            return Err(AppError::Transaction(format!(
                "dashboard {} changed since it was read",
                request.dashboard_id
            )));
        }

        let pruned = tx
            .execute(
                "DELETE FROM dashboard_versions
                 WHERE tenant_id = ?1 AND dashboard_id = ?2 AND version_id NOT IN (
                   SELECT version_id FROM dashboard_versions
                   WHERE tenant_id = ?1 AND dashboard_id = ?2
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT ?3
                 )",
                params![request.tenant_id, request.dashboard_id, request.retention_limit],
            )
            .map_err(transaction_error)?;

        tx.commit().map_err(transaction_error)?;
        Ok(pruned)
    }
}

impl ConnectionConfigPersistence for Database {
    fn load_connection_row(&self, tenant_id: &str) -> AppResult<Option<StoredConnectionRow>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT url, fallback_url, auth_method, token, oauth_tokens, config_json
             FROM tenant_connection_configs WHERE tenant_id = ?1",
            [tenant_id],
            |row| {
                let config_json: Option<String> = row.get(5)?;
                Ok(match config_json.filter(|raw| !raw.trim().is_empty()) {
                    Some(config_json) => StoredConnectionRow::Current { config_json },
                    None => StoredConnectionRow::Legacy(LegacyConnectionRow {
                        url: row.get(0)?,
                        fallback_url: row.get(1)?,
                        auth_method: row.get(2)?,
                        token: row.get(3)?,
                        oauth_tokens: row.get(4)?,
                    }),
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn upsert_connection_config(&self, tenant_id: &str, config: &TenantConnectionConfig) -> AppResult<()> {
        let config_json = config.to_stored_json();
        let oauth_tokens = config
            .oauth_tokens
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tenant_connection_configs
               (tenant_id, url, fallback_url, auth_method, token, oauth_tokens, config_json, primary_connection_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(tenant_id) DO UPDATE SET
               url = excluded.url,
               fallback_url = excluded.fallback_url,
               auth_method = excluded.auth_method,
               token = excluded.token,
               oauth_tokens = excluded.oauth_tokens,
               config_json = excluded.config_json,
               primary_connection_id = excluded.primary_connection_id,
               updated_at = excluded.updated_at",
            params![
                tenant_id,
                config.url,
                config.fallback_url,
                config.auth_method.as_str(),
                config.token,
                oauth_tokens,
                config_json,
                config.primary_connection_id,
                format_time(Utc::now()),
            ],
        )?;
        Ok(())
    }
}

fn transaction_error(error: rusqlite::Error) -> AppError {
    AppError::Transaction(error.to_string())
}

fn validate_settings(settings: &StoreSettings) -> AppResult<()> {
    if settings.retention_limit < 1 {
        return Err(AppError::Validation("retentionLimit must be at least 1".to_string()));
    }
    if settings.grid_columns < 1 {
        return Err(AppError::Validation("gridColumns must be at least 1".to_string()));
    }
    if settings.max_row_span < 1 {
        return Err(AppError::Validation("maxRowSpan must be at least 1".to_string()));
    }
    Ok(())
}

fn parse_dashboard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DashboardDocument> {
    Ok(DashboardDocument {
        tenant_id: row.get(0)?,
        dashboard_id: row.get(1)?,
        name: row.get(2)?,
        data: parse_json(&row.get::<_, String>(3)?)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
        created_by: row.get(6)?,
    })
}

fn parse_version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DashboardVersionRecord> {
    Ok(DashboardVersionRecord {
        version_id: row.get(0)?,
        tenant_id: row.get(1)?,
        dashboard_id: row.get(2)?,
        name: row.get(3)?,
        data_json: row.get(4)?,
        source_updated_at: parse_time(&row.get::<_, String>(5)?)?,
        created_by: row.get(6)?,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

/// Fixed-width UTC timestamps so text ordering in SQL matches time ordering.
fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_failure(Box::new(error)))
}

fn parse_json(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(raw).map_err(|error| conversion_failure(Box::new(error)))
}

fn conversion_failure(error: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, error)
}

/// JSON merge patch: objects merge key by key, `null` drops the key so the
/// field falls back to its default on deserialize.
fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    let serde_json::Value::Object(patch_map) = patch else {
        *target = patch;
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(&key);
            } else {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
    }
}
