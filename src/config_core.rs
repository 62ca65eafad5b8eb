use crate::db::Database;
use crate::documents::VersionedDocumentStore;
use crate::errors::AppResult;
use crate::grid::pack_cards;
use crate::models::{
    CardSize, CardSpec, DashboardDocument, DashboardVersion, DashboardVersionSummary, GridLayout, RestoreOutcome,
    SaveOutcome, StoreSettings, TenantConnectionConfig,
};
use crate::tenant_config::TenantConfigService;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const DATABASE_FILE: &str = "dashboard-config.sqlite";

/// Entry point for hosts: owns the database and hands out the services bound to
/// the current settings.
pub struct ConfigCore {
    db: Arc<Database>,
    connections: TenantConfigService,
}

impl ConfigCore {
    pub fn new(data_dir: PathBuf) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);
        let connections = TenantConfigService::new(db.clone());
        Ok(Arc::new(Self { db, connections }))
    }

    pub fn settings(&self) -> AppResult<StoreSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, patch: serde_json::Value) -> AppResult<StoreSettings> {
        self.db.update_settings(patch)
    }

    pub fn connection_config(&self, tenant_id: &str) -> AppResult<TenantConnectionConfig> {
        self.connections.read(tenant_id)
    }

    pub fn update_connection_config(
        &self,
        tenant_id: &str,
        body: &serde_json::Value,
    ) -> AppResult<TenantConnectionConfig> {
        self.connections.apply_json(tenant_id, body)
    }

    // Rebuilt per call so settings changes apply to the next operation.
    fn documents(&self) -> AppResult<VersionedDocumentStore> {
        Ok(VersionedDocumentStore::new(self.db.clone(), &self.settings()?))
    }

    pub fn save_dashboard(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        data: &serde_json::Value,
        name: &str,
        actor_id: &str,
    ) -> AppResult<SaveOutcome> {
        self.documents()?.save(tenant_id, dashboard_id, data, name, actor_id)
    }

    pub fn restore_dashboard(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        version_id: &str,
        actor_id: &str,
    ) -> AppResult<RestoreOutcome> {
        self.documents()?.restore(tenant_id, dashboard_id, version_id, actor_id)
    }

    pub fn list_dashboard_versions(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        limit: u32,
    ) -> AppResult<Vec<DashboardVersionSummary>> {
        self.documents()?.list(tenant_id, dashboard_id, limit)
    }

    pub fn get_dashboard(&self, tenant_id: &str, dashboard_id: &str) -> AppResult<DashboardDocument> {
        self.documents()?.get(tenant_id, dashboard_id)
    }

    pub fn get_dashboard_version(
        &self,
        tenant_id: &str,
        dashboard_id: &str,
        version_id: &str,
    ) -> AppResult<DashboardVersion> {
        self.documents()?.get_version(tenant_id, dashboard_id, version_id)
    }

    /// Packs cards onto the configured grid. Sizes are clamped to the grid width
    /// and the row ceiling first, so every card is placed.
    pub fn layout_cards(&self, cards: &[CardSpec]) -> AppResult<GridLayout> {
        let settings = self.settings()?;
        let mut sizes: HashMap<&str, CardSize> = HashMap::with_capacity(cards.len());
        for card in cards {
            sizes.entry(card.id.as_str()).or_insert_with(|| {
                CardSize::new(card.col_span, card.row_span).clamped(settings.grid_columns, settings.max_row_span)
            });
        }

        Ok(pack_cards(
            cards.iter().map(|card| card.id.as_str()),
            |id| sizes.get(id).copied().unwrap_or(CardSize::new(1, 1)),
            settings.grid_columns,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn card(id: &str, col_span: u32, row_span: u32) -> CardSpec {
        CardSpec {
            id: id.to_string(),
            col_span,
            row_span,
        }
    }

    #[test]
    fn layout_clamps_to_configured_grid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = ConfigCore::new(dir.path().to_path_buf()).expect("core");
        core.update_settings(json!({ "gridColumns": 3, "maxRowSpan": 2 }))
            .expect("settings");

        let layout = core
            .layout_cards(&[card("wide", 9, 1), card("tall", 1, 40), card("small", 0, 0)])
            .expect("layout");

        assert_eq!(layout.columns, 3);
        assert_eq!(layout.len(), 3);
        let wide = layout.get("wide").expect("wide");
        assert_eq!((wide.row, wide.col, wide.col_span), (1, 1, 3));
        let tall = layout.get("tall").expect("tall");
        assert_eq!((tall.row, tall.col, tall.row_span), (2, 1, 2));
        let small = layout.get("small").expect("small");
        assert_eq!((small.row, small.col, small.col_span, small.row_span), (2, 2, 1, 1));
        assert_eq!(layout.rows, 3);
    }

    #[test]
    fn empty_card_list_has_no_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = ConfigCore::new(dir.path().to_path_buf()).expect("core");
        let layout = core.layout_cards(&[]).expect("layout");
        assert!(layout.is_empty());
        assert_eq!(layout.rows, 0);
    }
}
