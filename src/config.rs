use crate::cli::Cli;
use crate::labels::{LabelPrecedence, is_valid_label_name};
use crate::retry::RetryPolicy;
use crate::sink::LokiClientConfig;
use crate::sink::loki::PUSH_PATH;
use crate::utils::parse_bind_address;
use reqwest::Url;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub const CONFIG_FILE_NAME: &str = "config.env";

const DEFAULT_LEADER_ELECTION_ID: &str = "ea28a4b8.eventviewer";
const DEFAULT_METRICS_ADDR: &str = ":8080";
const DEFAULT_PROBE_ADDR: &str = ":8081";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected KEY=VALUE")]
    Malformed { path: String, line: usize },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("LOKI_LABELS must be a JSON object of strings: {0}")]
    Labels(#[source] serde_json::Error),
    #[error("invalid label name '{0}' in LOKI_LABELS")]
    LabelName(String),
}

/// Settings resolved once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct Config {
    pub leader_elect: bool,
    pub leader_election_id: String,
    pub leader_election_namespace: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub probe_addr: Option<SocketAddr>,
    pub log_level: LevelFilter,
    pub common_labels: BTreeMap<String, String>,
    pub label_precedence: LabelPrecedence,
    pub watch_namespace: Option<String>,
    pub direct_reads: bool,
    pub max_concurrent_reconciles: u16,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    pub retry: RetryPolicy,
    pub client: LokiClientConfig,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Resolve flags and environment (via clap) on top of `config.env`.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = read_env_file(&cli.config_dir.join(CONFIG_FILE_NAME))?;
        Self::resolve(cli, &file)
    }

    pub fn resolve(cli: &Cli, file: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let value = |flag: Option<&String>, key: &'static str| -> Option<String> {
            flag.cloned().or_else(|| file.get(key).cloned())
        };

        let gateway_url = value(cli.gateway_url.as_ref(), "LOKI_GATEWAY_URL")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("LOKI_GATEWAY_URL"))?;
        let push_url = push_url(&gateway_url)?;

        let common_labels = parse_labels(
            value(cli.labels.as_ref(), "LOKI_LABELS")
                .as_deref()
                .unwrap_or_default(),
        )?;

        let log_level = if cli.verbose {
            LevelFilter::DEBUG
        } else {
            parse_log_level(
                value(cli.log_level.as_ref(), "LOG_LEVEL")
                    .as_deref()
                    .unwrap_or("info"),
            )?
        };

        let metrics_addr = bind_address(
            value(cli.metrics_addr.as_ref(), "METRICS_BIND_ADDRESS"),
            "METRICS_BIND_ADDRESS",
            DEFAULT_METRICS_ADDR,
        )?;
        let probe_addr = bind_address(
            value(cli.probe_addr.as_ref(), "HEALTH_PROBE_BIND_ADDRESS"),
            "HEALTH_PROBE_BIND_ADDRESS",
            DEFAULT_PROBE_ADDR,
        )?;

        let label_precedence = match value(cli.label_precedence.as_ref(), "LABEL_PRECEDENCE") {
            Some(s) => s.parse::<LabelPrecedence>().map_err(|reason| ConfigError::Invalid {
                key: "LABEL_PRECEDENCE",
                reason,
            })?,
            None => LabelPrecedence::default(),
        };

        let retry = RetryPolicy {
            base: Duration::from_millis(pick(cli.retry_base_ms, file, "RETRY_BASE_MS", 500)?),
            max_delay: Duration::from_millis(pick(
                cli.retry_max_delay_ms,
                file,
                "RETRY_MAX_DELAY_MS",
                60_000,
            )?),
            max_attempts: pick(cli.retry_max_attempts, file, "RETRY_MAX_ATTEMPTS", 8)?,
        };

        let client = LokiClientConfig {
            push_url,
            batch_size: pick(cli.batch_size, file, "BATCH_SIZE", 100)?,
            flush_interval: Duration::from_millis(pick(
                cli.flush_interval_ms,
                file,
                "FLUSH_INTERVAL_MS",
                1_000,
            )?),
            request_timeout: Duration::from_millis(pick(
                cli.request_timeout_ms,
                file,
                "REQUEST_TIMEOUT_MS",
                10_000,
            )?),
            deliver_timeout: Duration::from_millis(pick(
                cli.deliver_timeout_ms,
                file,
                "DELIVER_TIMEOUT_MS",
                30_000,
            )?),
            queue_capacity: 1024,
        };

        let config = Config {
            leader_elect: pick(cli.leader_elect, file, "LEADER_ELECT", false)?,
            leader_election_id: value(cli.leader_election_id.as_ref(), "LEADER_ELECTION_ID")
                .unwrap_or_else(|| DEFAULT_LEADER_ELECTION_ID.to_string()),
            leader_election_namespace: value(
                cli.leader_election_namespace.as_ref(),
                "LEADER_ELECTION_NAMESPACE",
            ),
            metrics_addr,
            probe_addr,
            log_level,
            common_labels,
            label_precedence,
            watch_namespace: value(cli.watch_namespace.as_ref(), "WATCH_NAMESPACE"),
            direct_reads: pick(cli.direct_reads, file, "DIRECT_READS", false)?,
            max_concurrent_reconciles: pick(
                cli.max_concurrent_reconciles,
                file,
                "MAX_CONCURRENT_RECONCILES",
                4,
            )?,
            dedup_capacity: pick(cli.dedup_capacity, file, "DEDUP_CAPACITY", 10_000)?,
            dedup_ttl: Duration::from_secs(pick(cli.dedup_ttl_secs, file, "DEDUP_TTL_SECS", 3_600)?),
            retry,
            client,
            shutdown_grace: Duration::from_secs(pick(
                cli.shutdown_grace_secs,
                file,
                "SHUTDOWN_GRACE_SECS",
                10,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };
        if self.max_concurrent_reconciles == 0 {
            return invalid("MAX_CONCURRENT_RECONCILES", "must be at least 1");
        }
        if self.dedup_capacity == 0 {
            return invalid("DEDUP_CAPACITY", "must be at least 1");
        }
        if self.dedup_ttl.is_zero() {
            return invalid("DEDUP_TTL_SECS", "must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("RETRY_MAX_ATTEMPTS", "must be at least 1");
        }
        if self.retry.base.is_zero() || self.retry.base > self.retry.max_delay {
            return invalid("RETRY_BASE_MS", "must be positive and not above RETRY_MAX_DELAY_MS");
        }
        if self.client.batch_size == 0 {
            return invalid("BATCH_SIZE", "must be at least 1");
        }
        if self.client.deliver_timeout <= self.client.flush_interval + self.client.request_timeout {
            return invalid(
                "DELIVER_TIMEOUT_MS",
                "must exceed FLUSH_INTERVAL_MS + REQUEST_TIMEOUT_MS",
            );
        }
        Ok(())
    }
}

/// Flag/env value, else file value, else `default`.
fn pick<T>(
    flag: Option<T>,
    file: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(v) = flag {
        return Ok(v);
    }
    match file.get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn bind_address(
    raw: Option<String>,
    key: &'static str,
    default: &str,
) -> Result<Option<SocketAddr>, ConfigError> {
    parse_bind_address(raw.as_deref().unwrap_or(default))
        .map_err(|reason| ConfigError::Invalid { key, reason })
}

/// A gateway URL without a path gets the Loki push path.
pub fn push_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| ConfigError::Invalid {
        key: "LOKI_GATEWAY_URL",
        reason: format!("'{}': {}", raw, e),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            key: "LOKI_GATEWAY_URL",
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(PUSH_PATH);
    }
    Ok(url)
}

/// Parse the static label map. Empty input means no labels.
pub fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let labels: BTreeMap<String, String> =
        serde_json::from_str(raw).map_err(ConfigError::Labels)?;
    if let Some(bad) = labels.keys().find(|k| !is_valid_label_name(k)) {
        return Err(ConfigError::LabelName(bad.clone()));
    }
    Ok(labels)
}

/// Accepts tracing level names, plus the zap names `dpanic`, `panic` and `fatal`.
pub fn parse_log_level(raw: &str) -> Result<LevelFilter, ConfigError> {
    let raw = raw.trim().to_ascii_lowercase();
    match raw.as_str() {
        "dpanic" | "panic" | "fatal" => Ok(LevelFilter::ERROR),
        "warning" => Ok(LevelFilter::WARN),
        other => other.parse().map_err(|_| ConfigError::Invalid {
            key: "LOG_LEVEL",
            reason: format!("unknown level '{}'", other),
        }),
    }
}

/// Read `KEY=VALUE` lines. A missing file yields no values.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_env_file(&contents, &path.display().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn parse_env_file(contents: &str, path: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut values = HashMap::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Malformed {
                path: path.to_string(),
                line: index + 1,
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::Malformed {
                path: path.to_string(),
                line: index + 1,
            });
        }
        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(values)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
