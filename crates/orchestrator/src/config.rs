use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_str(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub http_addr: SocketAddr,

    pub rpc_url: String,
    pub marketplace_address: Option<String>,
    pub training_pool_address: Option<String>,
    pub rental_lookback_blocks: u64,

    pub api_key: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_ttl_secs: u64,

    pub rate_limit_per_minute: u64,
    pub sensitive_gets_per_minute: u64,

    pub auto_assign_on_event: bool,
    pub auto_assign_size: usize,
    pub auto_start_round_on_event: bool,
    pub auto_round_steps: u32,
    pub event_poll_interval: Duration,

    /// Gates the raw-private-key rent flow; off unless explicitly enabled.
    pub allow_insecure_rent: bool,

    pub ssh_user: String,
    pub worker_control_key: Option<String>,
    pub aggregator_command: Option<String>,
    /// Network-reachable alias substituted for loopback/any bind addresses
    /// when telling workers where to dial.
    pub aggregator_client_alias: String,

    pub snapshot_interval: Duration,
    pub snapshot_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            http_addr: env_parse("HTTP_ADDR", "127.0.0.1:8080".parse().expect("static addr")),
            rpc_url: env_str("WEB3_PROVIDER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8545".to_string()),
            marketplace_address: env_str("COMPUTE_MARKETPLACE_ADDRESS"),
            training_pool_address: env_str("TRAINING_POOL_ADDRESS"),
            rental_lookback_blocks: env_parse("RENTAL_LOOKBACK_BLOCKS", 5000),
            api_key: env_str("API_KEY"),
            jwt_secret: env_str("JWT_SECRET"),
            jwt_issuer: env_str("JWT_ISSUER").unwrap_or_else(|| "orchestrator".to_string()),
            jwt_audience: env_str("JWT_AUDIENCE").unwrap_or_else(|| "orchestrator".to_string()),
            jwt_ttl_secs: env_parse("JWT_TTL_SECS", 3600),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 60),
            sensitive_gets_per_minute: env_parse("SENSITIVE_GETS_PER_MINUTE", 30),
            auto_assign_on_event: env_flag("AUTO_ASSIGN_ON_EVENT", false),
            auto_assign_size: env_parse("AUTO_ASSIGN_SIZE", 1),
            auto_start_round_on_event: env_flag("AUTO_START_ROUND_ON_EVENT", false),
            auto_round_steps: env_parse("AUTO_ROUND_STEPS", 1),
            event_poll_interval: Duration::from_secs(env_parse("EVENT_POLL_INTERVAL_SECS", 5)),
            allow_insecure_rent: env_flag("ALLOW_INSECURE_RENT_API", false),
            ssh_user: env_str("SSH_USER").unwrap_or_else(|| "root".to_string()),
            worker_control_key: env_str("WORKER_CONTROL_KEY"),
            aggregator_command: env_str("AGGREGATOR_COMMAND"),
            aggregator_client_alias: env_str("AGGREGATOR_CLIENT_ALIAS")
                .unwrap_or_else(|| "server".to_string()),
            snapshot_interval: Duration::from_secs(env_parse("SNAPSHOT_INTERVAL_SECS", 30)),
            snapshot_path: env_str("SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("orchestrator-state.json")),
        }
    }

    /// Open-mode configuration on ephemeral ports, for tests.
    pub fn for_tests() -> Self {
        Self {
            http_addr: "127.0.0.1:0".parse().expect("static addr"),
            rpc_url: "http://127.0.0.1:8545".to_string(),
            marketplace_address: None,
            training_pool_address: None,
            rental_lookback_blocks: 5000,
            api_key: None,
            jwt_secret: None,
            jwt_issuer: "orchestrator".to_string(),
            jwt_audience: "orchestrator".to_string(),
            jwt_ttl_secs: 3600,
            rate_limit_per_minute: 10_000,
            sensitive_gets_per_minute: 10_000,
            auto_assign_on_event: false,
            auto_assign_size: 1,
            auto_start_round_on_event: false,
            auto_round_steps: 1,
            event_poll_interval: Duration::from_millis(50),
            allow_insecure_rent: false,
            ssh_user: "root".to_string(),
            worker_control_key: None,
            aggregator_command: None,
            aggregator_client_alias: "server".to_string(),
            snapshot_interval: Duration::from_secs(30),
            snapshot_path: std::env::temp_dir().join("orchestrator-test-state.json"),
        }
    }
}
