//! Normalization and merging of a tenant's external-service connections.
//!
//! Nothing in here returns an error: malformed input degrades to defaults so a
//! corrupt blob can never lock a tenant out of its own configuration.

use crate::models::{
    AuthMethod, Connection, ConnectionCandidate, ConnectionConfigPayload, LegacyConnectionRow,
    StoredConnectionRow, TenantConnectionConfig,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;

pub const DEFAULT_PRIMARY_ID: &str = "primary";
const REDACTED: &str = "[REDACTED]";

static NON_SLUG_CHARS: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"[^a-z0-9_-]+").expect("valid regex"));

pub fn slugify(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    NON_SLUG_CHARS
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

fn default_connection_id(index: usize) -> String {
    if index == 0 {
        DEFAULT_PRIMARY_ID.to_string()
    } else {
        format!("connection-{}", index + 1)
    }
}

fn default_connection_name(index: usize) -> String {
    if index == 0 {
        "Primary".to_string()
    } else {
        format!("Connection {}", index + 1)
    }
}

fn normalize_url(raw: Option<&str>) -> String {
    raw.unwrap_or_default().trim().trim_end_matches('/').to_string()
}

pub fn normalize_connection(candidate: &ConnectionCandidate, index: usize) -> Connection {
    let id = candidate
        .id
        .as_deref()
        .map(slugify)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| default_connection_id(index));
    let name = candidate
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| default_connection_name(index));
    let token = candidate.token.as_deref().unwrap_or_default().trim().to_string();

    // Rows written before auth_method existed only carried a token.
    let auth_method = candidate
        .auth_method
        .as_deref()
        .and_then(AuthMethod::parse)
        .unwrap_or(if token.is_empty() {
            AuthMethod::Oauth
        } else {
            AuthMethod::Token
        });

    Connection {
        id,
        name,
        url: normalize_url(candidate.url.as_deref()),
        fallback_url: normalize_url(candidate.fallback_url.as_deref()),
        auth_method,
        token: if auth_method == AuthMethod::Token {
            token
        } else {
            String::new()
        },
        oauth_tokens: candidate.oauth_tokens.clone().filter(|tokens| !tokens.is_null()),
    }
}

pub fn default_connection() -> Connection {
    normalize_connection(&ConnectionCandidate::default(), 0)
}

pub fn dedupe_connections(candidates: &[ConnectionCandidate]) -> Vec<Connection> {
    let mut seen: HashSet<String> = HashSet::with_capacity(candidates.len());
    let mut connections = Vec::with_capacity(candidates.len().max(1));

    for (index, candidate) in candidates.iter().enumerate() {
        let mut connection = normalize_connection(candidate, index);
        if seen.contains(&connection.id) {
            let base = connection.id.clone();
            let mut suffix = 2usize;
            while seen.contains(&format!("{}-{}", base, suffix)) {
                suffix += 1;
            }
            connection.id = format!("{}-{}", base, suffix);
        }
        seen.insert(connection.id.clone());
        connections.push(connection);
    }

    if connections.is_empty() {
        connections.push(default_connection());
    }
    connections
}

pub fn resolve_primary(connections: &[Connection], preferred_id: Option<&str>) -> String {
    let preferred = preferred_id.map(slugify).unwrap_or_default();
    if !preferred.is_empty() && connections.iter().any(|connection| connection.id == preferred) {
        return preferred;
    }
    connections
        .first()
        .map(|connection| connection.id.clone())
        .unwrap_or_else(|| DEFAULT_PRIMARY_ID.to_string())
}

fn build_config(candidates: &[ConnectionCandidate], preferred_id: Option<&str>) -> TenantConnectionConfig {
    let connections = dedupe_connections(candidates);
    let primary_connection_id = resolve_primary(&connections, preferred_id);
    let primary = connections
        .iter()
        .find(|connection| connection.id == primary_connection_id)
        .cloned()
        .unwrap_or_else(default_connection);

    TenantConnectionConfig {
        primary_connection_id,
        url: primary.url,
        fallback_url: primary.fallback_url,
        auth_method: primary.auth_method,
        token: primary.token,
        oauth_tokens: primary.oauth_tokens,
        connections,
    }
}

pub fn default_config() -> TenantConnectionConfig {
    build_config(&[], None)
}

pub fn parse_stored_config(row: &StoredConnectionRow) -> TenantConnectionConfig {
    match row {
        StoredConnectionRow::Legacy(legacy) => build_config(&[legacy_candidate(legacy)], None),
        StoredConnectionRow::Current { config_json } => {
            let value = match serde_json::from_str::<Value>(config_json) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(error = %error, "stored connection config is not valid JSON; using defaults");
                    return default_config();
                }
            };
            let candidates = value
                .get("connections")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(candidate_from_value).collect::<Vec<_>>())
                .unwrap_or_default();
            let preferred = value.get("primaryConnectionId").and_then(Value::as_str);
            build_config(&candidates, preferred)
        }
    }
}

fn legacy_candidate(row: &LegacyConnectionRow) -> ConnectionCandidate {
    let oauth_tokens = row
        .oauth_tokens
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string())));

    ConnectionCandidate {
        id: None,
        name: None,
        url: row.url.clone(),
        fallback_url: row.fallback_url.clone(),
        auth_method: row.auth_method.clone(),
        token: row.token.clone(),
        oauth_tokens,
    }
}

pub fn merge_config_payload(
    existing: Option<&TenantConnectionConfig>,
    payload: &ConnectionConfigPayload,
) -> TenantConnectionConfig {
    if let Some(candidates) = &payload.connections {
        return build_config(candidates, payload.primary_connection_id.as_deref());
    }

    let base = existing.cloned().unwrap_or_else(default_config);
    let requested = payload
        .primary_connection_id
        .as_deref()
        .map(slugify)
        .filter(|id| base.connections.iter().any(|connection| &connection.id == id));
    let primary_id = requested
        .unwrap_or_else(|| resolve_primary(&base.connections, Some(&base.primary_connection_id)));

    let candidates: Vec<ConnectionCandidate> = base
        .connections
        .iter()
        .map(|connection| {
            if connection.id == primary_id {
                patch_connection(connection, payload)
            } else {
                ConnectionCandidate::from(connection)
            }
        })
        .collect();

    build_config(&candidates, Some(&primary_id))
}

fn patch_connection(current: &Connection, payload: &ConnectionConfigPayload) -> ConnectionCandidate {
    let mut patched = ConnectionCandidate::from(current);
    if let Some(url) = &payload.url {
        patched.url = Some(url.clone());
    }
    if let Some(fallback_url) = &payload.fallback_url {
        patched.fallback_url = Some(fallback_url.clone());
    }
    if let Some(token) = &payload.token {
        patched.token = Some(token.clone());
    }
    if let Some(oauth_tokens) = &payload.oauth_tokens {
        patched.oauth_tokens = Some(oauth_tokens.clone());
    }

    let auth_method = payload
        .auth_method
        .as_deref()
        .and_then(AuthMethod::parse)
        .unwrap_or(current.auth_method);
    patched.auth_method = Some(auth_method.as_str().to_string());
    if auth_method == AuthMethod::Oauth {
        patched.token = Some(String::new());
    }
    patched
}

/// Reads a loose JSON value as a string field. `null` counts as an explicit
/// empty value; objects and arrays count as absent.
fn read_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Null => Some(String::new()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn field<'a>(map: &'a serde_json::Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    map.get(camel).or_else(|| map.get(snake))
}

pub fn candidate_from_value(value: &Value) -> Option<ConnectionCandidate> {
    let map = value.as_object()?;
    Some(ConnectionCandidate {
        id: map.get("id").and_then(read_string),
        name: map.get("name").and_then(read_string),
        url: map.get("url").and_then(read_string),
        fallback_url: field(map, "fallbackUrl", "fallback_url").and_then(read_string),
        auth_method: field(map, "authMethod", "auth_method").and_then(read_string),
        token: map.get("token").and_then(read_string),
        oauth_tokens: field(map, "oauthTokens", "oauth_tokens").cloned(),
    })
}

impl ConnectionConfigPayload {
    /// Builds a payload from a loose JSON body, recording which keys were present.
    pub fn from_json(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };
        Self {
            connections: map
                .get("connections")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(candidate_from_value).collect()),
            primary_connection_id: field(map, "primaryConnectionId", "primary_connection_id")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            url: map.get("url").and_then(read_string),
            fallback_url: field(map, "fallbackUrl", "fallback_url").and_then(read_string),
            auth_method: field(map, "authMethod", "auth_method").and_then(read_string),
            token: map.get("token").and_then(read_string),
            oauth_tokens: field(map, "oauthTokens", "oauth_tokens").cloned(),
        }
    }
}

impl TenantConnectionConfig {
    pub fn primary(&self) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|connection| connection.id == self.primary_connection_id)
    }

    /// Renders the persisted wire shape read back by [`parse_stored_config`].
    /// Flat mirror fields are derived on read and are not part of it.
    pub fn to_stored_json(&self) -> String {
        serde_json::json!({
            "primaryConnectionId": self.primary_connection_id,
            "connections": self.connections,
        })
        .to_string()
    }

    /// Copy with every secret masked, suitable for logs and exports.
    pub fn redacted(&self) -> Self {
        fn mask(token: &str) -> String {
            if token.is_empty() {
                String::new()
            } else {
                REDACTED.to_string()
            }
        }
        let mask_tokens = |tokens: &Option<Value>| tokens.as_ref().map(|_| Value::String(REDACTED.to_string()));

        Self {
            connections: self
                .connections
                .iter()
                .map(|connection| Connection {
                    token: mask(&connection.token),
                    oauth_tokens: mask_tokens(&connection.oauth_tokens),
                    ..connection.clone()
                })
                .collect(),
            token: mask(&self.token),
            oauth_tokens: mask_tokens(&self.oauth_tokens),
            ..self.clone()
        }
    }
}
