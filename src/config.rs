use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Where upload payloads and records live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Payloads on local disk, records in SQLite.
    File,
    /// Everything in process memory; lost on restart.
    Memory,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Backend::File),
            "memory" => Ok(Backend::Memory),
            other => anyhow::bail!("unknown backend `{}` (expected `file` or `memory`)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub base_path: String,
    pub backend: Backend,
    pub max_size: Option<u64>,
    /// Inactivity window before the reaper removes an upload; `None` disables it.
    pub retention: Option<Duration>,
    pub reap_interval: Duration,
    pub reap_completed: bool,
    pub auth_token: Option<String>,
    pub auto_migrate: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable upload server (tus 1.0.0)")]
pub struct Args {
    /// Host to bind to (overrides TUS_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TUS_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload payloads are stored (overrides TUS_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TUS_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// URL prefix of the upload endpoints (overrides TUS_STORE_BASE_PATH)
    #[arg(long)]
    pub base_path: Option<String>,

    /// Storage backend (overrides TUS_STORE_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Largest accepted upload in bytes (overrides TUS_STORE_MAX_SIZE)
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Seconds of inactivity before an upload expires, 0 disables expiry
    /// (overrides TUS_STORE_RETENTION_SECS)
    #[arg(long)]
    pub retention_secs: Option<u64>,

    /// Seconds between reaper passes (overrides TUS_STORE_REAP_INTERVAL_SECS)
    #[arg(long)]
    pub reap_interval_secs: Option<u64>,

    /// Let the reaper remove completed uploads too
    #[arg(long)]
    pub reap_completed: bool,

    /// Shared bearer token required on upload requests (overrides TUS_STORE_AUTH_TOKEN)
    #[arg(long)]
    pub auth_token: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run migrations before serving
    #[arg(long)]
    pub auto_migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = env("TUS_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_parse(&env, "TUS_STORE_PORT")?.unwrap_or(8080);
        let env_storage =
            env("TUS_STORE_STORAGE_DIR").unwrap_or_else(|| "./data/uploads".into());
        let env_db = env("TUS_STORE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/tus_store.db".into());
        let env_base = env("TUS_STORE_BASE_PATH").unwrap_or_else(|| "/files/".into());
        let env_backend = env_parse(&env, "TUS_STORE_BACKEND")?.unwrap_or(Backend::File);
        let env_max_size = env_parse(&env, "TUS_STORE_MAX_SIZE")?;
        let env_retention = env_parse(&env, "TUS_STORE_RETENTION_SECS")?.unwrap_or(24 * 60 * 60);
        let env_reap_interval = env_parse(&env, "TUS_STORE_REAP_INTERVAL_SECS")?.unwrap_or(60);
        let env_reap_completed = env_parse(&env, "TUS_STORE_REAP_COMPLETED")?.unwrap_or(false);
        let env_token = env("TUS_STORE_AUTH_TOKEN").filter(|t| !t.is_empty());

        let retention_secs: u64 = args.retention_secs.unwrap_or(env_retention);
        let reap_interval_secs: u64 = args.reap_interval_secs.unwrap_or(env_reap_interval);
        if reap_interval_secs == 0 {
            anyhow::bail!("reap interval must be at least one second");
        }

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            base_path: args.base_path.unwrap_or(env_base),
            backend: args.backend.unwrap_or(env_backend),
            max_size: args.max_size.or(env_max_size),
            retention: (retention_secs > 0).then(|| Duration::from_secs(retention_secs)),
            reap_interval: Duration::from_secs(reap_interval_secs),
            reap_completed: args.reap_completed || env_reap_completed,
            auth_token: args.auth_token.or(env_token),
            auto_migrate: args.auto_migrate,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}
