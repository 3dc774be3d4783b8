//! Runtime settings (environment) and pipeline topology (TOML).

mod pipeline;
mod validation;

#[cfg(test)]
mod tests;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::{Principal, StageIdentities};

pub use pipeline::{DatasetConfig, JoinConfig, PipelineConfig};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_secs(profile: &str, key: &str, default: u64) -> Duration {
    Duration::from_secs(profiled_env_parse(profile, key, default))
}

fn profiled_env_millis(profile: &str, key: &str, default: u64) -> Duration {
    Duration::from_millis(profiled_env_parse(profile, key, default))
}

// ── Top-level settings ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerSettings,
    pub landing: LandingSettings,
    pub warehouse: WarehouseSettings,
    pub bus: BusSettings,
    pub timeouts: TimeoutSettings,
    pub auth: AuthSettings,
    pub identities: StageIdentities,
}

impl Settings {
    /// Build settings from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DATAFEED_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("DATAFEED_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build settings for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerSettings::from_env_profiled(p),
            landing: LandingSettings::from_env_profiled(p),
            warehouse: WarehouseSettings::from_env_profiled(p),
            bus: BusSettings::from_env_profiled(p),
            timeouts: TimeoutSettings::from_env_profiled(p),
            auth: AuthSettings::from_env_profiled(p),
            identities: identities_from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() {
            "default"
        } else {
            &self.profile
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Settings loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:     {}:{}", self.server.host, self.server.port);
        tracing::info!("  landing:    backend={}", self.landing.backend_label());
        tracing::info!(
            "  warehouse:  dataset={}, dir={}",
            self.warehouse.dataset,
            self.warehouse
                .dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "(memory)".into())
        );
        tracing::info!(
            "  bus:        ack_deadline={:?}, max_attempts={}, backoff={:?}..{:?}",
            self.bus.ack_deadline,
            self.bus.max_delivery_attempts,
            self.bus.min_backoff,
            self.bus.max_backoff
        );
        tracing::info!(
            "  timeouts:   fetch={:?}, load={:?}, join={:?}",
            self.timeouts.fetch,
            self.timeouts.load,
            self.timeouts.join
        );
        tracing::info!("  auth:       push tokens {}", if self.auth.is_configured() { "enforced" } else { "disabled" });
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_parse(p, "PORT", 8080),
        }
    }
}

// ── Landing store ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingSettings {
    /// Local directory root; buckets become subdirectories.
    pub dir: Option<PathBuf>,
    pub aws: AwsSettings,
}

impl LandingSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            dir: profiled_env_opt(p, "LANDING_DIR").map(PathBuf::from),
            aws: AwsSettings::from_env_profiled(p),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        if self.aws.is_configured() {
            "s3"
        } else if self.dir.is_some() {
            "local"
        } else {
            "memory"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSettings {
    pub region: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── Warehouse ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseSettings {
    /// Directory holding Parquet tables; in-memory when unset.
    pub dir: Option<PathBuf>,
    /// Warehouse dataset that owns every pipeline table.
    pub dataset: String,
}

impl WarehouseSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            dir: profiled_env_opt(p, "WAREHOUSE_DIR").map(PathBuf::from),
            dataset: profiled_env_or(p, "WAREHOUSE_DATASET", "public_data"),
        }
    }
}

// ── Message bus ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Acknowledgment window per delivery attempt.
    pub ack_deadline: Duration,
    /// Deliveries before a message is dead-lettered.
    pub max_delivery_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Internal retries for a notification publish after a landing write.
    pub publish_retry_attempts: u32,
}

impl BusSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            ack_deadline: profiled_env_secs(p, "ACK_DEADLINE_SECS", 20),
            max_delivery_attempts: profiled_env_parse(p, "MAX_DELIVERY_ATTEMPTS", 5),
            min_backoff: profiled_env_millis(p, "RETRY_MIN_BACKOFF_MS", 1_000),
            max_backoff: profiled_env_millis(p, "RETRY_MAX_BACKOFF_MS", 60_000),
            publish_retry_attempts: profiled_env_parse(p, "PUBLISH_RETRY_ATTEMPTS", 4),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self::from_env_profiled("")
    }
}

// ── Operation timeouts ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub fetch: Duration,
    pub load: Duration,
    pub join: Duration,
    /// Join coordinator re-evaluation interval.
    pub join_poll: Duration,
}

impl TimeoutSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            fetch: profiled_env_secs(p, "FETCH_TIMEOUT_SECS", 15),
            load: profiled_env_secs(p, "LOAD_TIMEOUT_SECS", 15),
            join: profiled_env_secs(p, "JOIN_TIMEOUT_SECS", 60),
            join_poll: profiled_env_secs(p, "JOIN_POLL_SECS", 30),
        }
    }
}

// ── Push authentication ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret used to verify push identity tokens.
    #[serde(skip_serializing)]
    pub push_token_secret: Option<String>,
    /// Expected `aud` claim on push tokens.
    pub push_audience: String,
}

impl AuthSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            push_token_secret: profiled_env_opt(p, "PUSH_TOKEN_SECRET"),
            push_audience: profiled_env_or(p, "PUSH_AUDIENCE", "datafeed-push"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.push_token_secret.is_some()
    }
}

fn identities_from_env_profiled(p: &str) -> StageIdentities {
    let defaults = StageIdentities::default();
    let pick = |key: &str, fallback: &Principal| {
        profiled_env_opt(p, key)
            .map(Principal::new)
            .unwrap_or_else(|| fallback.clone())
    };
    StageIdentities {
        scheduler: pick("SCHEDULER_PRINCIPAL", &defaults.scheduler),
        ingest: pick("INGEST_PRINCIPAL", &defaults.ingest),
        load: pick("LOAD_PRINCIPAL", &defaults.load),
        join: pick("JOIN_PRINCIPAL", &defaults.join),
    }
}
