//! Federated-training orchestrator: HTTP API, node registry, on-chain
//! rental validation, round dispatch, and chain event automation.

pub mod aggregator;
pub mod api;
pub mod auth;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod middleware;
pub mod persistence;
pub mod rate_limit;
pub mod registry;
pub mod remote;
pub mod rounds;
pub mod ws;

use std::sync::Arc;

use alloy_primitives::Address;
use chain_client::{ChainClient, ChainConfig, ChainError};

use crate::aggregator::AggregatorRegistry;
use crate::auth::AuthGateway;
use crate::broadcast::RealtimeBroadcaster;
use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::jobs::JobStore;
use crate::rate_limit::{InMemoryCounters, RateLimiter};
use crate::registry::NodeRegistry;
use crate::remote::{OpenSsh, RemoteExec};
use crate::rounds::RoundCoordinator;

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct AppState {
    pub config: Config,
    pub auth: AuthGateway,
    pub limiter: RateLimiter,
    pub jobs: JobStore,
    pub registry: NodeRegistry,
    pub cluster: ClusterManager,
    pub rounds: RoundCoordinator,
    pub aggregators: AggregatorRegistry,
    pub broadcaster: Arc<RealtimeBroadcaster>,
    pub chain: Option<Arc<ChainClient>>,
    pub http: reqwest::Client,
}

fn parse_address(label: &str, value: &Option<String>) -> Result<Option<Address>, ChainError> {
    match value {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ChainError::InvalidConfig(format!("invalid {label} address: {e}"))),
        None => Ok(None),
    }
}

impl AppState {
    /// Wire the full state graph from configuration. The chain client only
    /// exists when at least one contract address is configured.
    pub fn from_config(config: Config) -> Result<Arc<Self>, ChainError> {
        let remote: Arc<dyn RemoteExec> = Arc::new(OpenSsh::new(config.ssh_user.clone()));
        Self::new(config, remote)
    }

    pub fn new(config: Config, remote: Arc<dyn RemoteExec>) -> Result<Arc<Self>, ChainError> {
        let marketplace = parse_address("marketplace", &config.marketplace_address)?;
        let training_pool = parse_address("training pool", &config.training_pool_address)?;
        let chain = if marketplace.is_some() || training_pool.is_some() {
            Some(Arc::new(ChainClient::new(ChainConfig {
                rpc_url: config.rpc_url.clone(),
                marketplace,
                training_pool,
                lookback_blocks: config.rental_lookback_blocks,
            })?))
        } else {
            None
        };

        let http = reqwest::Client::new();
        let broadcaster = Arc::new(RealtimeBroadcaster::new());
        let auth = AuthGateway::new(
            config.api_key.clone(),
            config.jwt_secret.clone(),
            config.jwt_issuer.clone(),
            config.jwt_audience.clone(),
            config.jwt_ttl_secs,
        );
        let limiter = RateLimiter::new(
            Arc::new(InMemoryCounters::new()),
            config.rate_limit_per_minute,
            config.sensitive_gets_per_minute,
        );
        let cluster = ClusterManager::new(
            chain.clone(),
            remote,
            http.clone(),
            config.allow_insecure_rent,
            config.worker_control_key.clone(),
        );
        let rounds = RoundCoordinator::new(http.clone(), config.worker_control_key.clone());
        let aggregators = AggregatorRegistry::new(
            config.aggregator_command.clone(),
            config.aggregator_client_alias.clone(),
        );

        Ok(Arc::new(Self {
            auth,
            limiter,
            jobs: JobStore::new(),
            registry: NodeRegistry::new(broadcaster.clone()),
            cluster,
            rounds,
            aggregators,
            broadcaster,
            chain,
            http,
            config,
        }))
    }
}
