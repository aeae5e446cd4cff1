use crate::{
    models::{event::StorageKind, share::ShareMode},
    services::{
        share_aggregator::ShareSettings, share_policy::CodePolicy, upload_pool::PoolSettings,
    },
};
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines `OFFLOAD_*` environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,

    pub remote_base_url: String,
    /// Opaque session cookie for the remote provider.
    pub remote_credential: String,
    pub local_kind: StorageKind,
    pub remote_kind: StorageKind,

    /// Inline JSON path rules, used when no rules file is given.
    pub mappings: String,
    pub mappings_file: Option<PathBuf>,

    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub attempt_timeout_secs: u64,
    pub auth_retry_limit: u32,

    pub share_enabled: bool,
    pub share_mode: ShareMode,
    /// `None` means the share never expires.
    pub share_expiry_days: Option<u32>,
    pub share_code: CodePolicy,
    pub share_debounce_secs: u64,
    pub share_sweep_secs: u64,
    /// Media ids that are uploaded but never shared.
    pub share_skip: Vec<String>,

    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Uploads organized media to cloud storage")]
pub struct Args {
    /// Host to bind to (overrides OFFLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OFFLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Host history database URL (overrides OFFLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Remote storage API base URL (overrides OFFLOAD_REMOTE_BASE_URL)
    #[arg(long)]
    pub remote_base_url: Option<String>,

    /// JSON file with path rules (overrides OFFLOAD_MAPPINGS_FILE)
    #[arg(long)]
    pub mappings_file: Option<PathBuf>,

    /// Number of upload workers (overrides OFFLOAD_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over the variables `lookup` returns over defaults.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let share_expiry_days = match var("OFFLOAD_SHARE_EXPIRY_DAYS") {
            None => None,
            Some(value) => match value.trim() {
                "0" | "permanent" => None,
                days => Some(parse_value("OFFLOAD_SHARE_EXPIRY_DAYS", days)?),
            },
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| var("OFFLOAD_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => parse_or(&var, "OFFLOAD_PORT", 3000)?,
            },
            database_url: args
                .database_url
                .or_else(|| var("OFFLOAD_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/offload.db".into()),

            remote_base_url: args
                .remote_base_url
                .or_else(|| var("OFFLOAD_REMOTE_BASE_URL"))
                .unwrap_or_default(),
            remote_credential: var("OFFLOAD_REMOTE_CREDENTIAL").unwrap_or_default(),
            local_kind: StorageKind::new(
                var("OFFLOAD_LOCAL_KIND").unwrap_or_else(|| "local".into()),
            ),
            remote_kind: StorageKind::new(
                var("OFFLOAD_REMOTE_KIND").unwrap_or_else(|| "u115".into()),
            ),

            mappings: var("OFFLOAD_MAPPINGS").unwrap_or_else(|| "[]".into()),
            mappings_file: args
                .mappings_file
                .or_else(|| var("OFFLOAD_MAPPINGS_FILE").map(PathBuf::from)),

            workers: match args.workers {
                Some(workers) => workers,
                None => parse_or(&var, "OFFLOAD_WORKERS", 3)?,
            },
            max_attempts: parse_or(&var, "OFFLOAD_MAX_ATTEMPTS", 3)?,
            backoff_base_ms: parse_or(&var, "OFFLOAD_BACKOFF_BASE_MS", 2_000)?,
            backoff_cap_ms: parse_or(&var, "OFFLOAD_BACKOFF_CAP_MS", 60_000)?,
            attempt_timeout_secs: parse_or(&var, "OFFLOAD_ATTEMPT_TIMEOUT_SECS", 1_800)?,
            auth_retry_limit: parse_or(&var, "OFFLOAD_AUTH_RETRY_LIMIT", 2)?,

            share_enabled: parse_or(&var, "OFFLOAD_SHARE_ENABLED", false)?,
            share_mode: parse_or(&var, "OFFLOAD_SHARE_MODE", ShareMode::Files)?,
            share_expiry_days,
            share_code: parse_or(&var, "OFFLOAD_SHARE_CODE", CodePolicy::None)?,
            share_debounce_secs: parse_or(&var, "OFFLOAD_SHARE_DEBOUNCE_SECS", 300)?,
            share_sweep_secs: parse_or(&var, "OFFLOAD_SHARE_SWEEP_SECS", 5)?,
            share_skip: var("OFFLOAD_SHARE_SKIP")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),

            telegram_token: var("OFFLOAD_TELEGRAM_TOKEN"),
            telegram_chat_id: var("OFFLOAD_TELEGRAM_CHAT_ID"),
        };

        Ok(cfg)
    }

    /// Checks that only matter when the pipeline actually runs.
    pub fn validate(&self) -> Result<()> {
        if self.remote_base_url.is_empty() {
            bail!("OFFLOAD_REMOTE_BASE_URL is required");
        }
        if self.remote_credential.is_empty() {
            bail!("OFFLOAD_REMOTE_CREDENTIAL is required");
        }
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        if self.auth_retry_limit == 0 {
            bail!("auth retry limit must be at least 1");
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            bail!(
                "backoff cap ({} ms) is below backoff base ({} ms)",
                self.backoff_cap_ms,
                self.backoff_base_ms
            );
        }
        if self.share_sweep_secs == 0 {
            bail!("share sweep interval must be at least 1 second");
        }
        if self.local_kind == self.remote_kind {
            bail!("local and remote storage kinds are both `{}`", self.local_kind);
        }
        if self.telegram_token.is_some() != self.telegram_chat_id.is_some() {
            bail!("OFFLOAD_TELEGRAM_TOKEN and OFFLOAD_TELEGRAM_CHAT_ID must be set together");
        }
        Ok(())
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.workers,
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            auth_retry_limit: self.auth_retry_limit,
        }
    }

    /// `None` when sharing is switched off.
    pub fn share_settings(&self) -> Option<ShareSettings> {
        if !self.share_enabled {
            return None;
        }
        Some(ShareSettings {
            mode: self.share_mode,
            debounce: Duration::from_secs(self.share_debounce_secs),
            sweep_interval: Duration::from_secs(self.share_sweep_secs),
            expiry_days: self.share_expiry_days,
            codes: self.share_code.clone(),
            skip_media_ids: self.share_skip.iter().cloned().collect(),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow!("{}", err))
        .with_context(|| format!("parsing {} value `{}`", key, value))
}
