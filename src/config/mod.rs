/// Configuration management for the argosy engine
///
/// Handles server, database, controller, packer, archive, cron and auth
/// settings. Everything is read from `ARGOSY_*` environment variables with
/// fallbacks and passed into components at construction.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub controller: ControllerConfig,
    pub packer: PackerConfig,
    pub archive: ArchiveConfig,
    pub cron: CronConfig,
    pub auth: AuthConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
    /// Namespace used when a submission names none
    pub default_namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL for resources, archive and offloaded status
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Workflows reconciled concurrently
    pub workers: usize,
    pub resync_seconds: u64,
    /// Graceful termination window before tasks are killed
    pub cancel_grace_seconds: u64,
    /// Infrastructure retries per node before it is marked Error
    pub dispatch_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Largest encoded workflow the resource store accepts, in bytes
    pub max_status_size: usize,
    pub offload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub enabled: bool,
    /// Only completed workflows matching this selector are archived; empty matches all
    pub label_selector: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token required by the API when set
    pub token: Option<String>,
    /// Server the CLI talks to
    pub server_url: String,
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("ARGOSY_HOST", "0.0.0.0"),
                port: env_parse("ARGOSY_PORT", 2746),
                default_namespace: env_or("ARGOSY_NAMESPACE", "argo"),
            },
            database: DatabaseConfig {
                url: env_or("ARGOSY_DATABASE_URL", "sqlite://argosy.db"),
            },
            controller: ControllerConfig {
                workers: env_parse("ARGOSY_WORKERS", 8),
                resync_seconds: env_parse("ARGOSY_RESYNC_SECONDS", 2),
                cancel_grace_seconds: env_parse("ARGOSY_CANCEL_GRACE_SECONDS", 10),
                dispatch_retries: env_parse("ARGOSY_DISPATCH_RETRIES", 3),
            },
            packer: PackerConfig {
                max_status_size: env_parse("ARGOSY_MAX_STATUS_SIZE", 1024 * 1024),
                offload: env_parse("ARGOSY_OFFLOAD", false),
            },
            archive: ArchiveConfig {
                enabled: env_parse("ARGOSY_ARCHIVE", true),
                label_selector: env_or("ARGOSY_ARCHIVE_LABEL_SELECTOR", ""),
            },
            cron: CronConfig {
                enabled: env_parse("ARGOSY_CRON", true),
            },
            auth: AuthConfig {
                token: std::env::var("ARGOSY_TOKEN").ok().filter(|t| !t.is_empty()),
                server_url: env_or("ARGOSY_SERVER", "http://localhost:2746"),
            },
        }
    }
}
