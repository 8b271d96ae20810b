/// CLI command handlers

pub mod archive;
pub mod completion;
pub mod cron;
pub mod workflow;

use crate::client::Client;
use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Shared context for all commands
pub struct Context {
    pub client: Client,
    pub namespace: String,
}

/// Read a JSON or YAML manifest
pub fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if raw.trim_start().starts_with('{') {
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON manifest {}", path.display()))
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("Invalid YAML manifest {}", path.display()))
    }
}

/// Compact age such as `45s`, `12m`, `3h` or `2d`
pub fn human_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

pub fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}
