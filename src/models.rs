use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Connections ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    #[default]
    Oauth,
    Token,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Oauth => "oauth",
            Self::Token => "token",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "oauth" => Some(Self::Oauth),
            "token" => Some(Self::Token),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub url: String,
    pub fallback_url: String,
    pub auth_method: AuthMethod,
    pub token: String,
    pub oauth_tokens: Option<serde_json::Value>,
}

/// A connection as supplied by a caller or a stored blob, before normalization.
/// Every field is optional; `None` means the key was absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionCandidate {
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub fallback_url: Option<String>,
    pub auth_method: Option<String>,
    pub token: Option<String>,
    pub oauth_tokens: Option<serde_json::Value>,
}

impl From<&Connection> for ConnectionCandidate {
    fn from(value: &Connection) -> Self {
        Self {
            id: Some(value.id.clone()),
            name: Some(value.name.clone()),
            url: Some(value.url.clone()),
            fallback_url: Some(value.fallback_url.clone()),
            auth_method: Some(value.auth_method.as_str().to_string()),
            token: Some(value.token.clone()),
            oauth_tokens: value.oauth_tokens.clone(),
        }
    }
}

/// Resolved connection configuration of one tenant. The flat fields mirror the
/// primary connection for consumers that predate multi-connection support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConnectionConfig {
    pub connections: Vec<Connection>,
    pub primary_connection_id: String,
    pub url: String,
    pub fallback_url: String,
    pub auth_method: AuthMethod,
    pub token: String,
    pub oauth_tokens: Option<serde_json::Value>,
}

/// Inbound config change. `connections` selects replace mode; otherwise the
/// flat fields patch the primary connection. For the flat fields `None` means
/// "key absent" and `Some("")` means "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionConfigPayload {
    pub connections: Option<Vec<ConnectionCandidate>>,
    pub primary_connection_id: Option<String>,
    pub url: Option<String>,
    pub fallback_url: Option<String>,
    pub auth_method: Option<String>,
    pub token: Option<String>,
    pub oauth_tokens: Option<serde_json::Value>,
}

/// Flat single-connection columns written before multi-connection support.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyConnectionRow {
    pub url: Option<String>,
    pub fallback_url: Option<String>,
    pub auth_method: Option<String>,
    pub token: Option<String>,
    pub oauth_tokens: Option<String>,
}

/// The two generations of persisted connection config, told apart once by the
/// storage adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredConnectionRow {
    Legacy(LegacyConnectionRow),
    Current { config_json: String },
}

// ─── Dashboard documents ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardDocument {
    pub tenant_id: String,
    pub dashboard_id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

/// Version row exactly as stored; `data_json` is the raw snapshot text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardVersionRecord {
    pub version_id: String,
    pub tenant_id: String,
    pub dashboard_id: String,
    pub name: String,
    pub data_json: String,
    pub source_updated_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardVersion {
    pub version_id: String,
    pub tenant_id: String,
    pub dashboard_id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub source_updated_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardVersionSummary {
    pub version_id: String,
    pub tenant_id: String,
    pub dashboard_id: String,
    pub name: String,
    pub source_updated_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl From<&DashboardVersionRecord> for DashboardVersionSummary {
    fn from(value: &DashboardVersionRecord) -> Self {
        Self {
            version_id: value.version_id.clone(),
            tenant_id: value.tenant_id.clone(),
            dashboard_id: value.dashboard_id.clone(),
            name: value.name.clone(),
            source_updated_at: value.source_updated_at,
            created_by: value.created_by.clone(),
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDocument<'a> {
    pub tenant_id: &'a str,
    pub dashboard_id: &'a str,
    pub name: &'a str,
    pub data_json: &'a str,
    pub actor_id: &'a str,
    pub written_at: DateTime<Utc>,
}

/// Everything the storage port needs to snapshot the live row, overwrite it and
/// prune history as one atomic unit.
#[derive(Debug, Clone)]
pub struct OverwriteRequest<'a> {
    pub tenant_id: &'a str,
    pub dashboard_id: &'a str,
    pub expected_updated_at: DateTime<Utc>,
    pub backup_version_id: &'a str,
    pub actor_id: &'a str,
    pub name: &'a str,
    pub data_json: &'a str,
    pub written_at: DateTime<Utc>,
    pub retention_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub document: DashboardDocument,
    pub snapshot_version_id: Option<String>,
    pub pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub name: String,
    pub data: serde_json::Value,
    pub backup_version_id: String,
}

// ─── Grid ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSize {
    pub col_span: u32,
    pub row_span: u32,
}

impl CardSize {
    pub fn new(col_span: u32, row_span: u32) -> Self {
        Self { col_span, row_span }
    }

    /// Caller-side clamp into what a `columns`-wide grid with a row ceiling accepts.
    pub fn clamped(self, columns: u32, max_row_span: u32) -> Self {
        Self {
            col_span: self.col_span.clamp(1, columns.max(1)),
            row_span: self.row_span.clamp(1, max_row_span.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSpec {
    pub id: String,
    pub col_span: u32,
    pub row_span: u32,
}

/// 1-indexed rectangle on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridPlacement {
    pub row: u32,
    pub col: u32,
    pub col_span: u32,
    pub row_span: u32,
}

impl GridPlacement {
    pub fn overlaps(&self, other: &GridPlacement) -> bool {
        self.col < other.col + other.col_span
            && other.col < self.col + self.col_span
            && self.row < other.row + other.row_span
            && other.row < self.row + self.row_span
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedCard {
    pub card_id: String,
    pub placement: GridPlacement,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridLayout {
    pub columns: u32,
    pub rows: u32,
    pub placements: Vec<PlacedCard>,
}

impl GridLayout {
    pub fn get(&self, card_id: &str) -> Option<&GridPlacement> {
        self.placements
            .iter()
            .find(|placed| placed.card_id == card_id)
            .map(|placed| &placed.placement)
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }
}

// ─── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub retention_limit: u32,
    pub max_document_bytes: u64,
    pub grid_columns: u32,
    pub max_row_span: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retention_limit: 100,
            max_document_bytes: 1024 * 1024,
            grid_columns: 4,
            max_row_span: 8,
        }
    }
}
