use anyhow::{bail, Context, Result};
use clap::Parser;
use devmetrics_common::settings::{self, duration_serde, parse_duration};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "localhost:8080";
pub const DEFAULT_GRPC_ADDRESS: &str = "localhost:3200";
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Which binding the agent pushes its chunks through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Http,
    Grpc,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "grpc" => Ok(Self::Grpc),
            other => bail!("unknown transport '{other}' (expected http or grpc)"),
        }
    }
}

#[derive(Debug, Default, Parser)]
#[command(name = "devmetrics-agent", version, about = "Metrics reporting agent")]
pub struct AgentArgs {
    /// Server HTTP address
    #[arg(short = 'a', long)]
    pub address: Option<String>,
    /// Report interval ("10s", or seconds)
    #[arg(short = 'r', long = "report-interval")]
    pub report_interval: Option<String>,
    /// Poll interval ("2s", or seconds)
    #[arg(short = 'p', long = "poll-interval")]
    pub poll_interval: Option<String>,
    /// Shared HMAC secret
    #[arg(short = 'k', long)]
    pub key: Option<String>,
    /// PEM file with the server's RSA public key
    #[arg(long = "crypto-key")]
    pub crypto_key: Option<String>,
    /// http or grpc
    #[arg(long)]
    pub transport: Option<String>,
    /// Server gRPC address
    #[arg(short = 'g', long = "grpc-address")]
    pub grpc_address: Option<String>,
    /// Address sent as X-Real-IP (detected when unset)
    #[arg(long = "real-ip")]
    pub real_ip: Option<String>,
    /// Deadline for a single send
    #[arg(long = "request-timeout")]
    pub request_timeout: Option<String>,
    /// JSON (or .toml) config file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PartialAgentConfig {
    pub address: Option<String>,
    #[serde(with = "duration_serde")]
    pub report_interval: Option<Duration>,
    #[serde(with = "duration_serde")]
    pub poll_interval: Option<Duration>,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
    pub transport: Option<String>,
    pub grpc_address: Option<String>,
    pub real_ip: Option<String>,
    #[serde(with = "duration_serde")]
    pub request_timeout: Option<Duration>,
}

fn duration_field(value: Option<String>, name: &'static str) -> Result<Option<Duration>> {
    value
        .map(|v| parse_duration(&v).context(name))
        .transpose()
}

impl PartialAgentConfig {
    pub fn from_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            address: lookup("ADDRESS"),
            report_interval: duration_field(lookup("REPORT_INTERVAL"), "REPORT_INTERVAL")?,
            poll_interval: duration_field(lookup("POLL_INTERVAL"), "POLL_INTERVAL")?,
            key: lookup("KEY"),
            crypto_key: lookup("CRYPTO_KEY"),
            transport: lookup("TRANSPORT"),
            grpc_address: lookup("GRPC_ADDRESS"),
            real_ip: lookup("REAL_IP"),
            request_timeout: duration_field(lookup("REQUEST_TIMEOUT"), "REQUEST_TIMEOUT")?,
        })
    }

    pub fn from_args(args: &AgentArgs) -> Result<Self> {
        Ok(Self {
            address: args.address.clone(),
            report_interval: duration_field(args.report_interval.clone(), "--report-interval")?,
            poll_interval: duration_field(args.poll_interval.clone(), "--poll-interval")?,
            key: args.key.clone(),
            crypto_key: args.crypto_key.clone(),
            transport: args.transport.clone(),
            grpc_address: args.grpc_address.clone(),
            real_ip: args.real_ip.clone(),
            request_timeout: duration_field(args.request_timeout.clone(), "--request-timeout")?,
        })
    }

    pub fn or(self, lower: Self) -> Self {
        Self {
            address: self.address.or(lower.address),
            report_interval: self.report_interval.or(lower.report_interval),
            poll_interval: self.poll_interval.or(lower.poll_interval),
            key: self.key.or(lower.key),
            crypto_key: self.crypto_key.or(lower.crypto_key),
            transport: self.transport.or(lower.transport),
            grpc_address: self.grpc_address.or(lower.grpc_address),
            real_ip: self.real_ip.or(lower.real_ip),
            request_timeout: self.request_timeout.or(lower.request_timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub address: String,
    pub report_interval: Duration,
    pub poll_interval: Duration,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub transport: TransportKind,
    pub grpc_address: String,
    pub real_ip: Option<String>,
    pub request_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            report_interval: DEFAULT_REPORT_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            key: None,
            crypto_key: None,
            transport: TransportKind::Http,
            grpc_address: DEFAULT_GRPC_ADDRESS.to_string(),
            real_ip: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Folds `sources` (highest precedence first) over the built-in defaults.
pub fn resolve(sources: Vec<PartialAgentConfig>) -> Result<AgentConfig> {
    let merged = sources
        .into_iter()
        .reduce(PartialAgentConfig::or)
        .unwrap_or_default();
    let defaults = AgentConfig::default();

    let report_interval = merged.report_interval.unwrap_or(defaults.report_interval);
    let poll_interval = merged.poll_interval.unwrap_or(defaults.poll_interval);
    if report_interval.is_zero() || poll_interval.is_zero() {
        bail!("report and poll intervals must be positive");
    }

    Ok(AgentConfig {
        address: non_empty(merged.address).unwrap_or(defaults.address),
        report_interval,
        poll_interval,
        key: non_empty(merged.key),
        crypto_key: non_empty(merged.crypto_key).map(PathBuf::from),
        transport: non_empty(merged.transport)
            .map(|t| t.parse::<TransportKind>())
            .transpose()?
            .unwrap_or(defaults.transport),
        grpc_address: non_empty(merged.grpc_address).unwrap_or(defaults.grpc_address),
        real_ip: non_empty(merged.real_ip),
        request_timeout: merged.request_timeout.unwrap_or(defaults.request_timeout),
    })
}

impl AgentConfig {
    /// Resolves the configuration: environment > flags > config file >
    /// defaults.
    pub fn load<F>(args: &AgentArgs, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = PartialAgentConfig::from_env(&lookup)?;
        let flags = PartialAgentConfig::from_args(args)?;
        let file_path = non_empty(lookup("CONFIG"))
            .map(PathBuf::from)
            .or_else(|| args.config.clone());
        let file = match file_path {
            Some(path) => settings::load_file::<PartialAgentConfig>(&path)?,
            None => PartialAgentConfig::default(),
        };
        resolve(vec![env, flags, file])
    }

    /// Address of the server for the configured transport.
    pub fn target(&self) -> &str {
        match self.transport {
            TransportKind::Http => &self.address,
            TransportKind::Grpc => &self.grpc_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = AgentConfig::load(&AgentArgs::default(), env(&[])).unwrap();
        assert_eq!(cfg.address, "localhost:8080");
        assert_eq!(cfg.report_interval, Duration::from_secs(10));
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.transport, TransportKind::Http);
        assert_eq!(cfg.target(), "localhost:8080");
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(
            &path,
            r#"{"report_interval": "30s", "poll_interval": 5, "key": "file-key"}"#,
        )
        .unwrap();

        let args = AgentArgs::try_parse_from([
            "devmetrics-agent",
            "-r",
            "20s",
            "-k",
            "flag-key",
            "-c",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let cfg = AgentConfig::load(&args, env(&[("KEY", "env-key"), ("TRANSPORT", "GRPC")]))
            .unwrap();

        assert_eq!(cfg.key.as_deref(), Some("env-key"));
        assert_eq!(cfg.report_interval, Duration::from_secs(20));
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.transport, TransportKind::Grpc);
        assert_eq!(cfg.target(), "localhost:3200");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(AgentConfig::load(&AgentArgs::default(), env(&[("TRANSPORT", "udp")])).is_err());
        assert!(AgentConfig::load(&AgentArgs::default(), env(&[("POLL_INTERVAL", "0s")])).is_err());
        assert!(AgentConfig::load(&AgentArgs::default(), env(&[("REPORT_INTERVAL", "x")])).is_err());
    }
}
