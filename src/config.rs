use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};

pub const DEFAULT_MAX_UPLOAD_LENGTH: u64 = 1_073_741_824;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 52_428_800;
pub const DEFAULT_EXPIRATION_SECS: i64 = 86_400;

/// Which upload tracker backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TrackerKind {
    /// Process-local map; state is lost on restart.
    Memory,
    /// SQLite database at `database_url`.
    Sqlite,
}

impl FromStr for TrackerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(s, true)
            .map_err(|_| anyhow::anyhow!("unknown tracker `{}` (expected memory or sqlite)", s))
    }
}

/// Settings the protocol engine needs, independent of how it is served.
#[derive(Debug, Clone)]
pub struct TusSettings {
    /// Largest upload a client may declare.
    pub max_upload_length: u64,
    /// Most bytes accepted by a single PATCH.
    pub max_chunk_size: u64,
    /// Request header carrying the public upload URL when behind a proxy.
    pub location_header: Option<String>,
    pub enable_creation: bool,
    pub enable_termination: bool,
    /// Sliding window an upload survives without progress.
    pub expiration: chrono::Duration,
}

impl Default for TusSettings {
    fn default() -> Self {
        Self {
            max_upload_length: DEFAULT_MAX_UPLOAD_LENGTH,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            location_header: None,
            enable_creation: true,
            enable_termination: true,
            expiration: chrono::Duration::seconds(DEFAULT_EXPIRATION_SECS),
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
    pub tracker: TrackerKind,
    pub database_url: String,
    pub base_path: String,
    pub sweep_interval_secs: u64,
    pub tus: TusSettings,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable upload server (tus 1.0.0)")]
pub struct Args {
    /// Host to bind to (overrides TUS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TUS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload payloads are stored (overrides TUS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Upload tracker backend (overrides TUS_TRACKER)
    #[arg(long, value_enum)]
    pub tracker: Option<TrackerKind>,

    /// Database URL for the sqlite tracker (overrides TUS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// URL path of the upload collection (overrides TUS_BASE_PATH)
    #[arg(long)]
    pub base_path: Option<String>,

    /// Largest accepted upload in bytes (overrides TUS_MAX_UPLOAD_LENGTH)
    #[arg(long)]
    pub max_upload_length: Option<u64>,

    /// Most bytes accepted per PATCH (overrides TUS_MAX_CHUNK_SIZE)
    #[arg(long)]
    pub max_chunk_size: Option<u64>,

    /// Header holding the public upload URL behind a proxy (overrides TUS_LOCATION_HEADER)
    #[arg(long)]
    pub location_header: Option<String>,

    /// Turn off the creation extension
    #[arg(long)]
    pub disable_creation: bool,

    /// Turn off the termination extension
    #[arg(long)]
    pub disable_termination: bool,

    /// Seconds an upload survives without progress (overrides TUS_EXPIRATION_SECS)
    #[arg(long)]
    pub expiration_secs: Option<i64>,

    /// Seconds between expiry sweeps (overrides TUS_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Parse `key` from the environment lookup, falling back to `default`.
fn parsed<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}

fn flag<F>(lookup: &F, key: &str) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => anyhow::bail!("parsing {} value `{}`: expected true or false", key, other),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values from `lookup`, then over defaults.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Environment fallback ---
        let env_host = lookup("TUS_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parsed(&lookup, "TUS_PORT", 1080u16)?;
        let env_storage = lookup("TUS_STORAGE_DIR").unwrap_or_else(|| "./data/uploads".into());
        let env_tracker = parsed(&lookup, "TUS_TRACKER", TrackerKind::Memory)?;
        let env_db = lookup("TUS_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/uploads.db".into());
        let env_base = lookup("TUS_BASE_PATH").unwrap_or_else(|| "/files".into());
        let env_max_upload = parsed(&lookup, "TUS_MAX_UPLOAD_LENGTH", DEFAULT_MAX_UPLOAD_LENGTH)?;
        let env_max_chunk = parsed(&lookup, "TUS_MAX_CHUNK_SIZE", DEFAULT_MAX_CHUNK_SIZE)?;
        let env_location = lookup("TUS_LOCATION_HEADER").filter(|h| !h.trim().is_empty());
        let env_no_creation = flag(&lookup, "TUS_DISABLE_CREATION")?;
        let env_no_termination = flag(&lookup, "TUS_DISABLE_TERMINATION")?;
        let env_expiration = parsed(&lookup, "TUS_EXPIRATION_SECS", DEFAULT_EXPIRATION_SECS)?;
        let env_sweep = parsed(&lookup, "TUS_SWEEP_INTERVAL_SECS", 3600u64)?;

        // --- Merge ---
        let max_chunk_size = args.max_chunk_size.unwrap_or(env_max_chunk);
        if max_chunk_size == 0 {
            anyhow::bail!("max chunk size must be greater than zero");
        }
        let expiration_secs = args.expiration_secs.unwrap_or(env_expiration);
        if expiration_secs <= 0 {
            anyhow::bail!("expiration must be a positive number of seconds");
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            tracker: args.tracker.unwrap_or(env_tracker),
            database_url: args.database_url.unwrap_or(env_db),
            base_path: normalize_base_path(&args.base_path.unwrap_or(env_base)),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep).max(1),
            tus: TusSettings {
                max_upload_length: args.max_upload_length.unwrap_or(env_max_upload),
                max_chunk_size,
                location_header: args.location_header.or(env_location),
                enable_creation: !(args.disable_creation || env_no_creation),
                enable_termination: !(args.disable_termination || env_no_termination),
                expiration: chrono::Duration::seconds(expiration_secs),
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Leading slash, no trailing slash; the root collection is the empty string.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_input() {
        let cfg = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:1080");
        assert_eq!(cfg.tracker, TrackerKind::Memory);
        assert_eq!(cfg.base_path, "/files");
        assert_eq!(cfg.tus.max_upload_length, DEFAULT_MAX_UPLOAD_LENGTH);
        assert!(cfg.tus.enable_creation && cfg.tus.enable_termination);
    }

    #[test]
    fn cli_overrides_environment() {
        let args = Args {
            port: Some(9000),
            max_chunk_size: Some(1024),
            ..Args::default()
        };
        let cfg = AppConfig::resolve(
            args,
            env_of(&[
                ("TUS_PORT", "8000"),
                ("TUS_TRACKER", "sqlite"),
                ("TUS_DISABLE_TERMINATION", "true"),
                ("TUS_BASE_PATH", "uploads/"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.tus.max_chunk_size, 1024);
        assert_eq!(cfg.tracker, TrackerKind::Sqlite);
        assert!(!cfg.tus.enable_termination);
        assert_eq!(cfg.base_path, "/uploads");
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let err = AppConfig::resolve(Args::default(), env_of(&[("TUS_PORT", "eighty")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("TUS_PORT"));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let args = Args {
            max_chunk_size: Some(0),
            ..Args::default()
        };
        assert!(AppConfig::resolve(args, env_of(&[])).is_err());
    }
}
