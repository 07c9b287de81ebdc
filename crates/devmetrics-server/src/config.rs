use anyhow::{Context, Result};
use clap::Parser;
use devmetrics_common::settings::{self, duration_serde, parse_bool, parse_duration};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "localhost:8080";
pub const DEFAULT_STORE_FILE: &str = "/tmp/devops-metrics-db.json";
pub const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(300);

/// Command-line flags. Every flag is optional so that unset flags fall
/// through to the config file and the defaults.
#[derive(Debug, Default, Parser)]
#[command(name = "devmetrics-server", version, about = "Metrics collection server")]
pub struct ServerArgs {
    /// HTTP listen address
    #[arg(short = 'a', long)]
    pub address: Option<String>,
    /// gRPC listen address (gRPC binding disabled when unset)
    #[arg(short = 'g', long = "grpc-address")]
    pub grpc_address: Option<String>,
    /// Backup interval ("300s", "5m", or seconds; 0 writes on every update)
    #[arg(short = 'i', long = "store-interval")]
    pub store_interval: Option<String>,
    /// Snapshot file path (empty disables the file backend)
    #[arg(short = 'f', long = "store-file")]
    pub store_file: Option<String>,
    /// Restore the snapshot at startup
    #[arg(short = 'r', long)]
    pub restore: Option<String>,
    /// Shared HMAC secret
    #[arg(short = 'k', long)]
    pub key: Option<String>,
    /// Database DSN (SQLite path, optionally prefixed with sqlite://)
    #[arg(short = 'd', long = "database-dsn")]
    pub database_dsn: Option<String>,
    /// PEM file with the RSA private key
    #[arg(long = "crypto-key")]
    pub crypto_key: Option<String>,
    /// CIDR allowed to push updates, checked against X-Real-IP
    #[arg(short = 't', long = "trusted-subnet")]
    pub trusted_subnet: Option<String>,
    /// Reject records without a hash
    #[arg(long = "require-hash")]
    pub require_hash: Option<String>,
    /// JSON (or .toml) config file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

/// One configuration source. Unset fields defer to lower-precedence
/// sources.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PartialServerConfig {
    pub address: Option<String>,
    pub grpc_address: Option<String>,
    #[serde(with = "duration_serde")]
    pub store_interval: Option<Duration>,
    pub store_file: Option<String>,
    pub restore: Option<bool>,
    pub key: Option<String>,
    pub database_dsn: Option<String>,
    pub crypto_key: Option<String>,
    pub trusted_subnet: Option<String>,
    pub require_hash: Option<bool>,
}

impl PartialServerConfig {
    /// Reads the environment through `lookup`.
    pub fn from_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            address: lookup("ADDRESS"),
            grpc_address: lookup("GRPC_ADDRESS"),
            store_interval: lookup("STORE_INTERVAL")
                .map(|v| parse_duration(&v).context("STORE_INTERVAL"))
                .transpose()?,
            store_file: lookup("STORE_FILE"),
            restore: lookup("RESTORE")
                .map(|v| parse_bool(&v).context("RESTORE"))
                .transpose()?,
            key: lookup("KEY"),
            database_dsn: lookup("DATABASE_DSN"),
            crypto_key: lookup("CRYPTO_KEY"),
            trusted_subnet: lookup("TRUSTED_SUBNET"),
            require_hash: lookup("REQUIRE_HASH")
                .map(|v| parse_bool(&v).context("REQUIRE_HASH"))
                .transpose()?,
        })
    }

    pub fn from_args(args: &ServerArgs) -> Result<Self> {
        Ok(Self {
            address: args.address.clone(),
            grpc_address: args.grpc_address.clone(),
            store_interval: args
                .store_interval
                .as_deref()
                .map(|v| parse_duration(v).context("--store-interval"))
                .transpose()?,
            store_file: args.store_file.clone(),
            restore: args
                .restore
                .as_deref()
                .map(|v| parse_bool(v).context("--restore"))
                .transpose()?,
            key: args.key.clone(),
            database_dsn: args.database_dsn.clone(),
            crypto_key: args.crypto_key.clone(),
            trusted_subnet: args.trusted_subnet.clone(),
            require_hash: args
                .require_hash
                .as_deref()
                .map(|v| parse_bool(v).context("--require-hash"))
                .transpose()?,
        })
    }

    /// Fills unset fields from `lower`.
    pub fn or(self, lower: Self) -> Self {
        Self {
            address: self.address.or(lower.address),
            grpc_address: self.grpc_address.or(lower.grpc_address),
            store_interval: self.store_interval.or(lower.store_interval),
            store_file: self.store_file.or(lower.store_file),
            restore: self.restore.or(lower.restore),
            key: self.key.or(lower.key),
            database_dsn: self.database_dsn.or(lower.database_dsn),
            crypto_key: self.crypto_key.or(lower.crypto_key),
            trusted_subnet: self.trusted_subnet.or(lower.trusted_subnet),
            require_hash: self.require_hash.or(lower.require_hash),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub grpc_address: Option<String>,
    pub store_interval: Duration,
    pub store_file: Option<String>,
    pub restore: bool,
    pub key: Option<String>,
    pub database_dsn: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<IpNetwork>,
    pub require_hash: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            grpc_address: None,
            store_interval: DEFAULT_STORE_INTERVAL,
            store_file: Some(DEFAULT_STORE_FILE.to_string()),
            restore: true,
            key: None,
            database_dsn: None,
            crypto_key: None,
            trusted_subnet: None,
            require_hash: false,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Folds `sources` (highest precedence first) over the built-in defaults.
pub fn resolve(sources: Vec<PartialServerConfig>) -> Result<ServerConfig> {
    let merged = sources
        .into_iter()
        .reduce(PartialServerConfig::or)
        .unwrap_or_default();
    let defaults = ServerConfig::default();

    let trusted_subnet = non_empty(merged.trusted_subnet)
        .map(|cidr| {
            cidr.trim()
                .parse::<IpNetwork>()
                .with_context(|| format!("invalid trusted subnet '{cidr}'"))
        })
        .transpose()?;

    Ok(ServerConfig {
        address: non_empty(merged.address).unwrap_or(defaults.address),
        grpc_address: non_empty(merged.grpc_address),
        store_interval: merged.store_interval.unwrap_or(defaults.store_interval),
        // An explicitly empty path disables the file backend.
        store_file: match merged.store_file {
            Some(path) => non_empty(Some(path)),
            None => defaults.store_file,
        },
        restore: merged.restore.unwrap_or(defaults.restore),
        key: non_empty(merged.key),
        database_dsn: non_empty(merged.database_dsn),
        crypto_key: non_empty(merged.crypto_key).map(PathBuf::from),
        trusted_subnet,
        require_hash: merged.require_hash.unwrap_or(defaults.require_hash),
    })
}

impl ServerConfig {
    /// Resolves the configuration: environment > flags > config file >
    /// defaults. The config file is named by `CONFIG` or `-c`.
    pub fn load<F>(args: &ServerArgs, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = PartialServerConfig::from_env(&lookup)?;
        let flags = PartialServerConfig::from_args(args)?;
        let file_path = non_empty(lookup("CONFIG"))
            .map(PathBuf::from)
            .or_else(|| args.config.clone());
        let file = match file_path {
            Some(path) => settings::load_file::<PartialServerConfig>(&path)?,
            None => PartialServerConfig::default(),
        };
        resolve(vec![env, flags, file])
    }
}
