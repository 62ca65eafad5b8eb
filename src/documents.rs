use crate::errors::{AppError, AppResult};
use crate::models::{
    DashboardDocument, DashboardVersion, DashboardVersionRecord, DashboardVersionSummary, NewDocument,
    OverwriteRequest, RestoreOutcome, SaveOutcome, StoreSettings,
};
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_LIST_LIMIT: u32 = 200;
const MAX_NAME_CHARS: usize = 120;
const DEFAULT_DASHBOARD_NAME: &str = "Untitled dashboard";

/// Storage seen by [`VersionedDocumentStore`]. `snapshot_and_overwrite` must run
/// as a single atomic unit: copy the live row into history, overwrite it only if
/// its `updated_at` still equals `expected_updated_at`, then prune history for
/// that dashboard down to `retention_limit` rows by `created_at`. It returns the
/// number of pruned rows. A writer that lost the race on `updated_at` gets a
/// retryable [`AppError::Transaction`] immediately; it is not queued behind the
/// winner.
pub trait DocumentPersistence: Send + Sync {
    fn find_document(&self, tenant_id: &str, dashboard_id: &str) -> AppResult<Option<DashboardDocument>>;
    fn find_version(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        version_id: &str,
    ) -> AppResult<Option<DashboardVersionRecord>>;
    fn list_versions(&self, tenant_id: &str, dashboard_id: &str, limit: u32) -> AppResult<Vec<DashboardVersionSummary>>;
    fn insert_document(&self, document: &NewDocument<'_>) -> AppResult<()>;
    fn snapshot_and_overwrite(&self, request: &OverwriteRequest<'_>) -> AppResult<usize>;
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Storage keeps microsecond precision; truncating here keeps in-memory and
/// stored timestamps identical.
fn system_clock() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Clone)]
pub struct VersionedDocumentStore {
    persistence: Arc<dyn DocumentPersistence>,
    retention_limit: u32,
    max_document_bytes: u64,
    clock: Clock,
}

impl VersionedDocumentStore {
    pub fn new(persistence: Arc<dyn DocumentPersistence>, settings: &StoreSettings) -> Self {
        Self {
            persistence,
            retention_limit: settings.retention_limit.max(1),
            max_document_bytes: settings.max_document_bytes,
            clock: Arc::new(system_clock),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn retention_limit(&self) -> u32 {
        self.retention_limit
    }

    pub fn save(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        next_data: &serde_json::Value,
        next_name: &str,
        actor_id: &str,
    ) -> AppResult<SaveOutcome> {
        validate_scope(tenant_id, dashboard_id)?;
        let data_json = validate_data(next_data, self.max_document_bytes)?;
        let name = normalize_dashboard_name(next_name);
        let now = (self.clock)();

        let Some(current) = self.persistence.find_document(tenant_id, dashboard_id)? else {
            self.persistence.insert_document(&NewDocument {
                tenant_id,
                dashboard_id,
                name: &name,
                data_json: &data_json,
                actor_id,
                written_at: now,
            })?;
            tracing::info!(tenant_id = %tenant_id, dashboard_id = %dashboard_id, "created dashboard document");
            return Ok(SaveOutcome {
                document: DashboardDocument {
                    tenant_id: tenant_id.to_string(),
                    dashboard_id: dashboard_id.to_string(),
                    name,
                    data: next_data.clone(),
                    created_at: now,
                    updated_at: now,
                    created_by: actor_id.to_string(),
                },
                snapshot_version_id: None,
                pruned: 0,
            });
        };

        let version_id = Uuid::new_v4().to_string();
        let pruned = self.persistence.snapshot_and_overwrite(&OverwriteRequest {
            tenant_id,
            dashboard_id,
            expected_updated_at: current.updated_at,
            backup_version_id: &version_id,
            actor_id,
            name: &name,
            data_json: &data_json,
            written_at: now,
            retention_limit: self.retention_limit,
        })?;
        tracing::debug!(
            tenant_id = %tenant_id,
            dashboard_id = %dashboard_id,
            version_id = %version_id,
            pruned,
            "saved dashboard document"
        );

        Ok(SaveOutcome {
            document: DashboardDocument {
                name,
                data: next_data.clone(),
                updated_at: now,
                ..current
            },
            snapshot_version_id: Some(version_id),
            pruned,
        })
    }

    pub fn restore(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        version_id: &str,
        actor_id: &str,
    ) -> AppResult<RestoreOutcome> {
        let version = self
            .persistence
            .find_version(tenant_id, dashboard_id, version_id)?
            .ok_or_else(|| {
                AppError::NotFound(format!("version {} of dashboard {}", version_id, dashboard_id))
            })?;
        let data = parse_snapshot(&version)?;
        let current = self
            .persistence
            .find_document(tenant_id, dashboard_id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {}", dashboard_id)))?;

        let backup_version_id = Uuid::new_v4().to_string();
        let pruned = self.persistence.snapshot_and_overwrite(&OverwriteRequest {
            tenant_id,
            dashboard_id,
            expected_updated_at: current.updated_at,
            backup_version_id: &backup_version_id,
            actor_id,
            name: &version.name,
            data_json: &version.data_json,
            written_at: (self.clock)(),
            retention_limit: self.retention_limit,
        })?;
        tracing::info!(
            tenant_id = %tenant_id,
            dashboard_id = %dashboard_id,
            version_id = %version_id,
            backup_version_id = %backup_version_id,
            pruned,
            "restored dashboard version"
        );

        Ok(RestoreOutcome {
            name: version.name,
            data,
            backup_version_id,
        })
    }

    pub fn list(&self, tenant_id: &str, dashboard_id: &str, limit: u32) -> AppResult<Vec<DashboardVersionSummary>> {
        self.persistence
            .list_versions(tenant_id, dashboard_id, limit.clamp(1, MAX_LIST_LIMIT))
    }

    pub fn get(&self, tenant_id: &str, dashboard_id: &str) -> AppResult<DashboardDocument> {
        self.persistence
            .find_document(tenant_id, dashboard_id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {}", dashboard_id)))
    }

    pub fn get_version(&self, tenant_id: &str, dashboard_id: &str, version_id: &str) -> AppResult<DashboardVersion> {
        let record = self
            .persistence
            .find_version(tenant_id, dashboard_id, version_id)?
            .ok_or_else(|| {
                AppError::NotFound(format!("version {} of dashboard {}", version_id, dashboard_id))
            })?;
        let data = parse_snapshot(&record)?;
        Ok(DashboardVersion {
            version_id: record.version_id,
            tenant_id: record.tenant_id,
            dashboard_id: record.dashboard_id,
            name: record.name,
            data,
            source_updated_at: record.source_updated_at,
            created_by: record.created_by,
            created_at: record.created_at,
        })
    }
}

fn validate_scope(tenant_id: &str, dashboard_id: &str) -> AppResult<()> {
    if tenant_id.trim().is_empty() {
        return Err(AppError::Validation("tenant id cannot be empty".to_string()));
    }
    if dashboard_id.trim().is_empty() {
        return Err(AppError::Validation("dashboard id cannot be empty".to_string()));
    }
    Ok(())
}

/// Serializes `data` and checks it parses back to the same value.
fn validate_data(data: &serde_json::Value, max_bytes: u64) -> AppResult<String> {
    let encoded = serde_json::to_string(data)
        .map_err(|error| AppError::Validation(format!("dashboard data is not serializable: {}", error)))?;
    let decoded = serde_json::from_str::<serde_json::Value>(&encoded)
        .map_err(|error| AppError::Validation(format!("dashboard data does not parse back: {}", error)))?;
    if &decoded != data {
        return Err(AppError::Validation(
            "dashboard data does not survive a JSON round trip".to_string(),
        ));
    }
    if encoded.len() as u64 > max_bytes {
        return Err(AppError::Validation(format!(
            "dashboard data is {} bytes, limit is {}",
            encoded.len(),
            max_bytes
        )));
    }
    Ok(encoded)
}

fn parse_snapshot(record: &DashboardVersionRecord) -> AppResult<serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(&record.data_json).map_err(|error| {
        tracing::warn!(
            tenant_id = %record.tenant_id,
            dashboard_id = %record.dashboard_id,
            version_id = %record.version_id,
            error = %error,
            "stored dashboard version is not valid JSON"
        );
        AppError::CorruptSnapshot(format!("version {}: {}", record.version_id, error))
    })
}

fn normalize_dashboard_name(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return DEFAULT_DASHBOARD_NAME.to_string();
    }
    if first_line.chars().count() <= MAX_NAME_CHARS {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(MAX_NAME_CHARS - 3).collect();
    format!("{}...", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn open_db(dir: &tempfile::TempDir) -> Arc<Database> {
        Arc::new(Database::new(&dir.path().join("test.db")).expect("db"))
    }

    fn settings(retention_limit: u32) -> StoreSettings {
        StoreSettings {
            retention_limit,
            ..StoreSettings::default()
        }
    }

    /// Clock that advances one minute per call, starting at 2024-01-01.
    fn stepping_clock() -> impl Fn() -> DateTime<Utc> + Send + Sync + 'static {
        let tick = AtomicI64::new(0);
        move || {
            let minutes = tick.fetch_add(1, Ordering::SeqCst);
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
        }
    }

    struct FailingOverwrite(Arc<Database>);

    impl DocumentPersistence for FailingOverwrite {
        fn find_document(&self, tenant_id: &str, dashboard_id: &str) -> AppResult<Option<DashboardDocument>> {
            self.0.find_document(tenant_id, dashboard_id)
        }
        fn find_version(
            &self,
            tenant_id: &str,
            dashboard_id: &str,
            version_id: &str,
        ) -> AppResult<Option<DashboardVersionRecord>> {
            self.0.find_version(tenant_id, dashboard_id, version_id)
        }
        fn list_versions(&self, tenant_id: &str, dashboard_id: &str, limit: u32) -> AppResult<Vec<DashboardVersionSummary>> {
            self.0.list_versions(tenant_id, dashboard_id, limit)
        }
        fn insert_document(&self, document: &NewDocument<'_>) -> AppResult<()> {
            self.0.insert_document(document)
        }
        fn snapshot_and_overwrite(&self, _request: &OverwriteRequest<'_>) -> AppResult<usize> {
            Err(AppError::Transaction("disk I/O error".to_string()))
        }
    }

    #[test]
    fn first_save_inserts_without_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(100));

        let outcome = store
            .save("tenant-a", "main", &json!({ "cards": [] }), "Main", "user-1")
            .expect("save");
        assert!(outcome.snapshot_version_id.is_none());
        assert_eq!(outcome.document.created_by, "user-1");

        let loaded = store.get("tenant-a", "main").expect("get");
        assert_eq!(loaded, outcome.document);
        assert!(store.list("tenant-a", "main", 50).expect("list").is_empty());
    }

    #[test]
    fn later_saves_snapshot_the_replaced_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(100)).with_clock(stepping_clock());

        let first = store
            .save("tenant-a", "main", &json!({ "cards": ["light"] }), "Main", "user-1")
            .expect("first save");
        let second = store
            .save("tenant-a", "main", &json!({ "cards": ["light", "lock"] }), "Main v2", "user-2")
            .expect("second save");

        let snapshot_id = second.snapshot_version_id.expect("snapshot id");
        let version = store.get_version("tenant-a", "main", &snapshot_id).expect("version");
        assert_eq!(version.data, json!({ "cards": ["light"] }));
        assert_eq!(version.name, "Main");
        assert_eq!(version.source_updated_at, first.document.updated_at);
        assert_eq!(version.created_by, "user-2");

        let live = store.get("tenant-a", "main").expect("live");
        assert_eq!(live.name, "Main v2");
        assert_eq!(live.created_at, first.document.created_at);
        assert_eq!(live.created_by, "user-1");
    }

    #[test]
    fn retention_keeps_the_most_recent_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(3)).with_clock(stepping_clock());

        let mut snapshots = Vec::new();
        for n in 0..=4 {
            let outcome = store
                .save("tenant-a", "main", &json!({ "n": n }), "Main", "user-1")
                .expect("save");
            snapshots.extend(outcome.snapshot_version_id);
        }
        assert_eq!(snapshots.len(), 4);

        let listed: Vec<String> = store
            .list("tenant-a", "main", 200)
            .expect("list")
            .into_iter()
            .map(|summary| summary.version_id)
            .collect();
        let expected: Vec<String> = snapshots.iter().rev().take(3).cloned().collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn pruning_orders_by_created_at_even_when_backdated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let times = [100, 200, 300, 50];
        let tick = AtomicI64::new(0);
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(2)).with_clock(move || {
            let index = tick.fetch_add(1, Ordering::SeqCst) as usize;
            Utc.timestamp_opt(times[index.min(times.len() - 1)], 0).unwrap()
        });

        for n in 0..4 {
            store
                .save("tenant-a", "main", &json!({ "n": n }), "Main", "user-1")
                .expect("save");
        }

        let created: Vec<i64> = store
            .list("tenant-a", "main", 10)
            .expect("list")
            .iter()
            .map(|summary| summary.created_at.timestamp())
            .collect();
        assert_eq!(created, vec![300, 200]);
    }

    #[test]
    fn restore_is_itself_undoable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(100)).with_clock(stepping_clock());

        store
            .save("tenant-a", "main", &json!({ "theme": "dark" }), "Main", "user-1")
            .expect("save 1");
        let second = store
            .save("tenant-a", "main", &json!({ "theme": "light" }), "Main", "user-1")
            .expect("save 2");
        let original_version = second.snapshot_version_id.expect("snapshot");

        let restored = store
            .restore("tenant-a", "main", &original_version, "admin")
            .expect("restore");
        assert_eq!(restored.data, json!({ "theme": "dark" }));
        assert_eq!(store.get("tenant-a", "main").expect("live").data, json!({ "theme": "dark" }));

        let backup = store.get_version("tenant-a", "main", &restored.backup_version_id).expect("backup");
        assert_eq!(backup.created_by, "admin");

        let undone = store
            .restore("tenant-a", "main", &restored.backup_version_id, "admin")
            .expect("undo restore");
        assert_eq!(undone.data, json!({ "theme": "light" }));
        assert_eq!(store.get("tenant-a", "main").expect("live").data, json!({ "theme": "light" }));
    }

    #[test]
    fn restore_unknown_version_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(100));
        store
            .save("tenant-a", "main", &json!({}), "Main", "user-1")
            .expect("save");

        let error = store
            .restore("tenant-a", "main", "missing", "user-1")
            .expect_err("missing version");
        assert!(matches!(error, AppError::NotFound(_)));
    }

    #[test]
    fn versions_are_scoped_to_their_dashboard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(100)).with_clock(stepping_clock());
        store.save("tenant-a", "main", &json!({ "a": 1 }), "Main", "u").expect("save");
        let second = store.save("tenant-a", "main", &json!({ "a": 2 }), "Main", "u").expect("save");
        let version_id = second.snapshot_version_id.expect("snapshot");

        store.save("tenant-b", "main", &json!({ "b": 1 }), "Main", "u").expect("save");
        let error = store
            .restore("tenant-b", "main", &version_id, "u")
            .expect_err("cross-tenant restore");
        assert!(matches!(error, AppError::NotFound(_)));
        assert!(store.list("tenant-b", "main", 10).expect("list").is_empty());
    }

    #[test]
    fn list_limit_is_clamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(open_db(&dir), &settings(100)).with_clock(stepping_clock());
        for n in 0..4 {
            store.save("tenant-a", "main", &json!({ "n": n }), "Main", "u").expect("save");
        }
        assert_eq!(store.list("tenant-a", "main", 0).expect("list").len(), 1);
        assert_eq!(store.list("tenant-a", "main", 5_000).expect("list").len(), 3);
    }

    #[test]
    fn oversized_data_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VersionedDocumentStore::new(
            open_db(&dir),
            &StoreSettings {
                max_document_bytes: 16,
                ..StoreSettings::default()
            },
        );
        let error = store
            .save("tenant-a", "main", &json!({ "blob": "x".repeat(64) }), "Main", "u")
            .expect_err("too large");
        assert!(matches!(error, AppError::Validation(_)));
        assert!(matches!(store.get("tenant-a", "main"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn failed_overwrite_leaves_live_document_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let healthy = VersionedDocumentStore::new(db.clone(), &settings(100));
        let before = healthy
            .save("tenant-a", "main", &json!({ "v": 1 }), "Main", "u")
            .expect("save")
            .document;

        let failing = VersionedDocumentStore::new(Arc::new(FailingOverwrite(db)), &settings(100));
        let error = failing
            .save("tenant-a", "main", &json!({ "v": 2 }), "Main", "u")
            .expect_err("overwrite fails");
        assert!(error.is_retryable());

        let after = healthy.get("tenant-a", "main").expect("get");
        assert_eq!(after.data, before.data);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn dashboard_names_are_normalized() {
        assert_eq!(normalize_dashboard_name("   "), DEFAULT_DASHBOARD_NAME);
        assert_eq!(normalize_dashboard_name(" Kitchen \nsecond line"), "Kitchen");
        let long = "k".repeat(200);
        assert_eq!(normalize_dashboard_name(&long).chars().count(), MAX_NAME_CHARS);
    }
}
