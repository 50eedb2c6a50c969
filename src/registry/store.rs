//! Versioned on-disk persistence for the subagent registry.
//!
//! The registry lives at `<stateDir>/subagents/runs.json` as a
//! `{version, runs}` envelope. Version 2 is always written. Version 1
//! payloads (with `announceCompletedAt`/`announceHandled` and separate
//! `requesterChannel`/`requesterAccountId` fields) are migrated on read.
//! Unknown versions load as an empty registry without touching the file.

use crate::delivery::DeliveryContext;
use crate::registry::SubagentRecord;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub const REGISTRY_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRegistry {
    pub version: u32,
    #[serde(default)]
    pub runs: HashMap<String, SubagentRecord>,
}

/// Result of reading the persisted registry.
#[derive(Debug, Default)]
pub struct LoadedRegistry {
    pub runs: HashMap<String, SubagentRecord>,
    /// True when a v1 payload was upgraded in memory; the caller should
    /// persist so the file becomes v2.
    pub migrated: bool,
}

/// Read the registry file. Read and parse failures degrade to an empty
/// registry (logged at warn) — they never fail the caller and never
/// overwrite the file.
pub fn load_registry(path: &Path) -> LoadedRegistry {
    if !path.exists() {
        return LoadedRegistry::default();
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to read subagent registry, starting empty");
            return LoadedRegistry::default();
        }
    };

    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to parse subagent registry, starting empty");
            return LoadedRegistry::default();
        }
    };

    match value.get("version").and_then(Value::as_u64) {
        Some(2) => match serde_json::from_value::<PersistedRegistry>(value) {
            Ok(persisted) => LoadedRegistry {
                runs: persisted.runs,
                migrated: false,
            },
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "unreadable v2 subagent registry, starting empty");
                LoadedRegistry::default()
            }
        },
        Some(1) => migrate_v1(value),
        version => {
            tracing::warn!(path = %path.display(), ?version, "unknown subagent registry version, starting empty");
            LoadedRegistry::default()
        }
    }
}

fn migrate_v1(value: Value) -> LoadedRegistry {
    let mut runs = HashMap::new();
    let entries = value
        .get("runs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (run_id, entry) in entries {
        match migrate_v1_record(&entry) {
            Some(record) => {
                runs.insert(run_id, record);
            }
            None => {
                tracing::warn!(run_id = %run_id, "dropping unreadable v1 registry record");
            }
        }
    }

    tracing::info!(runs = runs.len(), "migrated subagent registry from v1");
    LoadedRegistry {
        runs,
        migrated: true,
    }
}

fn migrate_v1_record(entry: &Value) -> Option<SubagentRecord> {
    let mut fields = entry.as_object()?.clone();

    let completed_at = fields
        .remove("announceCompletedAt")
        .filter(|value| !value.is_null());
    let handled = fields
        .remove("announceHandled")
        .and_then(|value| value.as_bool())
        .unwrap_or(false)
        // Fallback truthiness: an announced record counts as handled.
        || completed_at.is_some();
    if let Some(completed_at) = completed_at {
        fields.insert("cleanupCompletedAt".to_string(), completed_at);
    }
    fields.insert("cleanupHandled".to_string(), Value::Bool(handled));

    let channel = fields
        .remove("requesterChannel")
        .and_then(|value| value.as_str().map(str::to_string));
    let account_id = fields
        .remove("requesterAccountId")
        .and_then(|value| value.as_str().map(str::to_string));
    if !fields.contains_key("requesterOrigin") {
        let origin = DeliveryContext {
            channel,
            account_id,
            ..Default::default()
        };
        if let Some(origin) = origin.normalized() {
            fields.insert(
                "requesterOrigin".to_string(),
                serde_json::to_value(origin).ok()?,
            );
        }
    }

    serde_json::from_value(Value::Object(fields)).ok()
}

/// Serialize and write the registry as version 2.
pub fn save_registry(path: &Path, runs: &HashMap<String, SubagentRecord>) -> anyhow::Result<()> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Envelope<'a> {
        version: u32,
        runs: &'a HashMap<String, SubagentRecord>,
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create registry dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(&Envelope {
        version: REGISTRY_VERSION,
        runs,
    })
    .context("failed to serialize subagent registry")?;

    std::fs::write(path, json)
        .with_context(|| format!("failed to write registry: {}", path.display()))?;
    Ok(())
}
