use crate::connections::{default_config, merge_config_payload, parse_stored_config};
use crate::errors::AppResult;
use crate::models::{ConnectionConfigPayload, StoredConnectionRow, TenantConnectionConfig};
use std::sync::Arc;

/// Storage for the per-tenant singleton connection record.
pub trait ConnectionConfigPersistence: Send + Sync {
    fn load_connection_row(&self, tenant_id: &str) -> AppResult<Option<StoredConnectionRow>>;
    fn upsert_connection_config(&self, tenant_id: &str, config: &TenantConnectionConfig) -> AppResult<()>;
}

#[derive(Clone)]
pub struct TenantConfigService {
    persistence: Arc<dyn ConnectionConfigPersistence>,
}

impl TenantConfigService {
    pub fn new(persistence: Arc<dyn ConnectionConfigPersistence>) -> Self {
        Self { persistence }
    }

    /// A tenant without a stored row gets the synthesized default config.
    pub fn read(&self, tenant_id: &str) -> AppResult<TenantConnectionConfig> {
        Ok(self
            .persistence
            .load_connection_row(tenant_id)?
            .map(|row| parse_stored_config(&row))
            .unwrap_or_else(default_config))
    }

    pub fn apply(&self, tenant_id: &str, payload: &ConnectionConfigPayload) -> AppResult<TenantConnectionConfig> {
        let existing = self
            .persistence
            .load_connection_row(tenant_id)?
            .map(|row| parse_stored_config(&row));
        let merged = merge_config_payload(existing.as_ref(), payload);
        self.persistence.upsert_connection_config(tenant_id, &merged)?;

        tracing::info!(
            tenant_id = %tenant_id,
            primary_connection_id = %merged.primary_connection_id,
            connections = merged.connections.len(),
            replaced = payload.connections.is_some(),
            "updated connection config"
        );
        tracing::debug!(
            tenant_id = %tenant_id,
            config = %serde_json::to_string(&merged.redacted()).unwrap_or_default(),
            "connection config after merge"
        );
        Ok(merged)
    }

    pub fn apply_json(&self, tenant_id: &str, body: &serde_json::Value) -> AppResult<TenantConnectionConfig> {
        self.apply(tenant_id, &ConnectionConfigPayload::from_json(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::AuthMethod;
    use serde_json::json;

    fn service(dir: &tempfile::TempDir) -> TenantConfigService {
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        TenantConfigService::new(Arc::new(db))
    }

    #[test]
    fn unknown_tenant_reads_default_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = service(&dir).read("tenant-a").expect("read");
        assert_eq!(config, default_config());
    }

    #[test]
    fn applied_config_reads_back_identically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);

        let written = service
            .apply_json(
                "tenant-a",
                &json!({
                    "primaryConnectionId": "cabin",
                    "connections": [
                        { "id": "home", "url": "https://home", "authMethod": "oauth", "oauthTokens": { "access_token": "a" } },
                        { "id": "cabin", "url": "https://cabin", "authMethod": "token", "token": "secret" }
                    ]
                }),
            )
            .expect("apply");
        assert_eq!(written.primary_connection_id, "cabin");
        assert_eq!(written.auth_method, AuthMethod::Token);

        let read = service.read("tenant-a").expect("read");
        assert_eq!(read, written);
    }

    #[test]
    fn patches_accumulate_across_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);

        service
            .apply_json("tenant-a", &json!({ "url": "https://ha", "authMethod": "token", "token": "t1" }))
            .expect("first write");
        service
            .apply_json("tenant-a", &json!({ "fallbackUrl": "http://10.0.0.2:8123" }))
            .expect("second write");

        let config = service.read("tenant-a").expect("read");
        assert_eq!(config.url, "https://ha");
        assert_eq!(config.fallback_url, "http://10.0.0.2:8123");
        assert_eq!(config.token, "t1");
        assert!(service.read("tenant-b").expect("other tenant").url.is_empty());
    }
}
