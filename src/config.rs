use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::upload_service::UploadLimits;

const ENV_PREFIX: &str = "CHUNK_INGEST_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_staged_bytes: u64,
    pub max_chunk_bytes: u64,
    pub max_total_chunks: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked upload ingestion service")]
pub struct Args {
    /// Host to bind to (overrides CHUNK_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNK_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding staging and artifacts (overrides CHUNK_INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNK_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Idle seconds before an incomplete upload is abandoned
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between background sweeps
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Cap on staged, not yet assembled bytes
    #[arg(long)]
    pub max_staged_bytes: Option<u64>,

    /// Largest accepted chunk in bytes
    #[arg(long)]
    pub max_chunk_bytes: Option<u64>,

    /// Largest accepted chunk count per upload
    #[arg(long)]
    pub max_total_chunks: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `CHUNK_INGEST_{name}`, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {key}")),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let defaults = UploadLimits::default();

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => env_or("HOST", "0.0.0.0".to_string())?,
            },
            port: match args.port {
                Some(port) => port,
                None => env_or("PORT", 3000)?,
            },
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => env_or("STORAGE_DIR", "./data/uploads".to_string())?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => env_or(
                    "DATABASE_URL",
                    "sqlite://./data/meta/chunk_ingest.db".to_string(),
                )?,
            },
            session_ttl: Duration::from_secs(match args.session_ttl_secs {
                Some(secs) => secs,
                None => env_or("SESSION_TTL_SECS", defaults.session_ttl.as_secs())?,
            }),
            sweep_interval: Duration::from_secs(match args.sweep_interval_secs {
                Some(secs) => secs,
                None => env_or("SWEEP_INTERVAL_SECS", 300)?,
            }),
            max_staged_bytes: match args.max_staged_bytes {
                Some(bytes) => bytes,
                None => env_or("MAX_STAGED_BYTES", defaults.max_staged_bytes)?,
            },
            max_chunk_bytes: match args.max_chunk_bytes {
                Some(bytes) => bytes,
                None => env_or("MAX_CHUNK_BYTES", defaults.max_chunk_bytes)?,
            },
            max_total_chunks: match args.max_total_chunks {
                Some(count) => count,
                None => env_or("MAX_TOTAL_CHUNKS", defaults.max_total_chunks)?,
            },
        };

        if cfg.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be at least one second");
        }
        if cfg.max_chunk_bytes == 0 {
            anyhow::bail!("max chunk size must be positive");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn limits(&self) -> UploadLimits {
        UploadLimits {
            max_staged_bytes: self.max_staged_bytes,
            max_chunk_bytes: self.max_chunk_bytes,
            max_total_chunks: self.max_total_chunks,
            session_ttl: self.session_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_defaults() {
        let cfg = AppConfig::merge(Args {
            host: Some("127.0.0.1".into()),
            port: Some(8081),
            storage_dir: Some("/tmp/uploads".into()),
            database_url: Some("sqlite::memory:".into()),
            session_ttl_secs: Some(60),
            sweep_interval_secs: Some(5),
            max_staged_bytes: Some(1024),
            max_chunk_bytes: Some(128),
            max_total_chunks: Some(8),
            migrate: false,
        })
        .unwrap();

        assert_eq!(cfg.addr(), "127.0.0.1:8081");
        let limits = cfg.limits();
        assert_eq!(limits.session_ttl, Duration::from_secs(60));
        assert_eq!(limits.max_staged_bytes, 1024);
        assert_eq!(limits.max_chunk_bytes, 128);
        assert_eq!(limits.max_total_chunks, 8);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let err = AppConfig::merge(Args {
            sweep_interval_secs: Some(0),
            ..Args::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("sweep interval"));
    }
}
