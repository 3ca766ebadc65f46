use clap::Parser;
use std::path::PathBuf;

/// Every option can also come from the environment variable named next to
/// it, or from `config.env` in `--config-dir`. Unset options take the
/// defaults documented in `config.rs`.
#[derive(Parser, Debug, Default)]
#[command(name = "kube-event-forwarder")]
#[command(about = "Forward Kubernetes events to a Loki push gateway")]
pub struct Cli {
    /// Directory holding an optional config.env file
    #[arg(long, env = "CONFIG_DIR", default_value = ".")]
    pub config_dir: PathBuf,

    /// Enable leader election so only one replica forwards events
    #[arg(long = "leader-elect", env = "LEADER_ELECT", num_args = 0..=1, default_missing_value = "true")]
    pub leader_elect: Option<bool>,

    /// Name of the Lease used for leader election
    #[arg(long, env = "LEADER_ELECTION_ID")]
    pub leader_election_id: Option<String>,

    /// Namespace of the leader election Lease (defaults to the client namespace)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    pub leader_election_namespace: Option<String>,

    /// Address the metrics endpoint binds to (":8080", "127.0.0.1:8080", "0" to disable)
    #[arg(long = "metrics-bind-address", env = "METRICS_BIND_ADDRESS")]
    pub metrics_addr: Option<String>,

    /// Address the health probe endpoint binds to
    #[arg(long = "health-probe-bind-address", env = "HEALTH_PROBE_BIND_ADDRESS")]
    pub probe_addr: Option<String>,

    /// Loki push gateway URL
    #[arg(long = "loki-gateway-url", env = "LOKI_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Static labels attached to every record, as a JSON object
    #[arg(long = "loki-labels", env = "LOKI_LABELS")]
    pub labels: Option<String>,

    /// Which labels win on a name collision: static-wins or event-wins
    #[arg(long, env = "LABEL_PRECEDENCE")]
    pub label_precedence: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Verbose output (same as --log-level debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Only watch events in this namespace
    #[arg(short = 'n', long = "namespace", env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Read events from the API server instead of the informer cache
    #[arg(long, env = "DIRECT_READS", num_args = 0..=1, default_missing_value = "true")]
    pub direct_reads: Option<bool>,

    /// Events reconciled in parallel
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES")]
    pub max_concurrent_reconciles: Option<u16>,

    /// Forwarded occurrences remembered for deduplication
    #[arg(long, env = "DEDUP_CAPACITY")]
    pub dedup_capacity: Option<usize>,

    /// Seconds a forwarded occurrence is remembered
    #[arg(long, env = "DEDUP_TTL_SECS")]
    pub dedup_ttl_secs: Option<u64>,

    /// First retry delay in milliseconds
    #[arg(long, env = "RETRY_BASE_MS")]
    pub retry_base_ms: Option<u64>,

    /// Longest retry delay in milliseconds
    #[arg(long, env = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: Option<u64>,

    /// Delivery attempts before an event is dropped
    #[arg(long, env = "RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: Option<u32>,

    /// Records per push request
    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Longest time a record waits for its batch to fill, in milliseconds
    #[arg(long, env = "FLUSH_INTERVAL_MS")]
    pub flush_interval_ms: Option<u64>,

    /// HTTP timeout of one push request, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Longest time a reconcile waits for a delivery outcome, in milliseconds
    #[arg(long, env = "DELIVER_TIMEOUT_MS")]
    pub deliver_timeout_ms: Option<u64>,

    /// Seconds in-flight work gets to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: Option<u64>,
}
