//! Typed JSON-RPC access to the marketplace and training-pool contracts.
//!
//! Reads (listings, allowances, event logs) use a plain HTTP provider;
//! renting builds a wallet provider from the renter key and submits the
//! approval plus one rental transaction per machine sequentially, tracking
//! the nonce locally between submissions.

use std::collections::HashSet;
use std::str::FromStr;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::http::reqwest::Url;
use mesh_core::ids::MachineId;

pub const DEFAULT_TOKEN_DECIMALS: u8 = 18;

sol! {
    #[sol(rpc)]
    contract ComputeMarketplace {
        function machines(uint256 machineId) external view
            returns (address provider, string memory specs, uint256 pricePerHour, bool listed);
        function paymentToken() external view returns (address token);
        function rentMachine(uint256 machineId, uint256 hoursPaid) external;

        event MachineRented(uint256 indexed machineId, address indexed renter, uint256 hoursPaid);
    }

    #[sol(rpc)]
    contract TrainingPool {
        event TrainingJobCreated(uint256 indexed jobId, address indexed requester, uint256 totalReward);
    }

    #[sol(rpc)]
    contract Erc20 {
        function approve(address spender, uint256 value) external returns (bool ok);
        function allowance(address owner, address spender) external view returns (uint256 remaining);
        function decimals() external view returns (uint8 count);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0} contract not configured")]
    NotConfigured(&'static str),

    #[error("contract call failed: {0}")]
    CallFailed(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContractKind {
    Marketplace,
    TrainingPool,
}

impl ContractKind {
    pub fn name(self) -> &'static str {
        match self {
            ContractKind::Marketplace => "ComputeMarketplace",
            ContractKind::TrainingPool => "TrainingPool",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub marketplace: Option<Address>,
    pub training_pool: Option<Address>,
    /// Block window for rental event queries; bounds provider query cost.
    pub lookback_blocks: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RentalEvent {
    pub machine_id: u64,
    pub renter: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobCreatedEvent {
    pub job_id: u64,
    pub total_reward: U256,
}

#[derive(Clone, Debug)]
pub struct MachineListing {
    pub provider: Address,
    pub specs: String,
    pub price_per_hour: U256,
    pub listed: bool,
}

#[derive(Clone, Debug)]
pub struct RentalOutcome {
    pub renter: Address,
    pub total_required: U256,
    pub approve_tx: Option<String>,
    pub rent_txs: Vec<String>,
}

pub struct ChainClient {
    url: Url,
    marketplace: Option<Address>,
    training_pool: Option<Address>,
    lookback_blocks: u64,
}

impl ChainClient {
    pub fn new(config: ChainConfig) -> Result<Self, ChainError> {
        let url: Url = config
            .rpc_url
            .parse()
            .map_err(|e| ChainError::InvalidConfig(format!("invalid rpc url: {e}")))?;
        Ok(Self {
            url,
            marketplace: config.marketplace,
            training_pool: config.training_pool,
            lookback_blocks: config.lookback_blocks.max(1),
        })
    }

    fn provider(&self) -> impl Provider + Clone {
        ProviderBuilder::new().connect_http(self.url.clone())
    }

    /// Capability table: which contracts this client can talk to.
    pub fn contract_address(&self, kind: ContractKind) -> Result<Address, ChainError> {
        let addr = match kind {
            ContractKind::Marketplace => self.marketplace,
            ContractKind::TrainingPool => self.training_pool,
        };
        addr.ok_or(ChainError::NotConfigured(kind.name()))
    }

    pub fn configured_contracts(&self) -> Vec<&'static str> {
        [
            (ContractKind::Marketplace, self.marketplace),
            (ContractKind::TrainingPool, self.training_pool),
        ]
        .into_iter()
        .filter_map(|(kind, addr)| addr.map(|_| kind.name()))
        .collect()
    }

    pub async fn latest_block(&self) -> Result<u64, ChainError> {
        self.provider()
            .get_block_number()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))
    }

    /// Rental events over the configured lookback window ending at the
    /// current head. Renter filtering is the caller's concern, see
    /// [`confirmed_rentals`].
    pub async fn rental_events(&self) -> Result<Vec<RentalEvent>, ChainError> {
        let address = self.contract_address(ContractKind::Marketplace)?;
        let provider = self.provider();
        let latest = provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;
        let from_block = latest.saturating_sub(self.lookback_blocks);

        let contract = ComputeMarketplace::new(address, &provider);
        let logs = contract
            .MachineRented_filter()
            .from_block(from_block)
            .to_block(latest)
            .query()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for (event, _log) in logs {
            let Ok(machine_id) = u64::try_from(event.machineId) else {
                tracing::warn!(machine_id = %event.machineId, "rental event machine id out of range");
                continue;
            };
            events.push(RentalEvent {
                machine_id,
                renter: event.renter,
            });
        }
        Ok(events)
    }

    /// Job-creation events in `[from_block, to_block]`.
    pub async fn job_created_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<JobCreatedEvent>, ChainError> {
        let address = self.contract_address(ContractKind::TrainingPool)?;
        let provider = self.provider();
        let contract = TrainingPool::new(address, &provider);

        let logs = contract
            .TrainingJobCreated_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for (event, _log) in logs {
            let Ok(job_id) = u64::try_from(event.jobId) else {
                tracing::warn!(job_id = %event.jobId, "job-created event id out of range");
                continue;
            };
            events.push(JobCreatedEvent {
                job_id,
                total_reward: event.totalReward,
            });
        }
        Ok(events)
    }

    /// Decimal count of the marketplace payment token.
    pub async fn payment_token_decimals(&self) -> Result<u8, ChainError> {
        let address = self.contract_address(ContractKind::Marketplace)?;
        let provider = self.provider();
        let token = ComputeMarketplace::new(address, &provider)
            .paymentToken()
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;
        Erc20::new(token, &provider)
            .decimals()
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))
    }

    pub async fn machine_listing(&self, machine_id: u64) -> Result<MachineListing, ChainError> {
        let address = self.contract_address(ContractKind::Marketplace)?;
        let provider = self.provider();
        let m = ComputeMarketplace::new(address, &provider)
            .machines(U256::from(machine_id))
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;
        Ok(MachineListing {
            provider: m.provider,
            specs: m.specs,
            price_per_hour: m.pricePerHour,
            listed: m.listed,
        })
    }

    /// Rent `machine_ids` for `hours` each, paying from the key's account.
    ///
    /// Approves the marketplace for the total when the current allowance is
    /// short, waiting for the approval receipt before any rental. Rentals
    /// are submitted one at a time with a locally incremented nonce; a
    /// failed receipt aborts the remaining machines but already-confirmed
    /// rentals stay in place.
    pub async fn rent_machines(
        &self,
        machine_ids: &[u64],
        hours: u64,
        renter_key: &str,
    ) -> Result<RentalOutcome, ChainError> {
        let address = self.contract_address(ContractKind::Marketplace)?;
        let signer = PrivateKeySigner::from_str(renter_key)
            .map_err(|e| ChainError::InvalidConfig(format!("invalid renter key: {e}")))?;
        let renter = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(self.url.clone());
        let marketplace = ComputeMarketplace::new(address, &provider);

        let mut total_required = U256::ZERO;
        for &machine_id in machine_ids {
            let m = marketplace
                .machines(U256::from(machine_id))
                .call()
                .await
                .map_err(|e| {
                    ChainError::CallFailed(format!("failed to fetch machine {machine_id}: {e}"))
                })?;
            if !m.listed {
                return Err(ChainError::TransactionFailed(format!(
                    "machine {machine_id} is not listed"
                )));
            }
            total_required += m.pricePerHour * U256::from(hours);
        }

        let token = marketplace
            .paymentToken()
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(format!("failed to read payment token: {e}")))?;
        let erc20 = Erc20::new(token, &provider);
        let allowance = erc20
            .allowance(renter, address)
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(format!("failed to read allowance: {e}")))?;

        let mut nonce = provider
            .get_transaction_count(renter)
            .await
            .map_err(|e| ChainError::CallFailed(format!("failed to get nonce: {e}")))?;

        let mut approve_tx = None;
        if allowance < total_required {
            let receipt = erc20
                .approve(address, total_required)
                .nonce(nonce)
                .send()
                .await
                .map_err(|e| ChainError::TransactionFailed(format!("approve failed: {e}")))?
                .get_receipt()
                .await
                .map_err(|e| ChainError::TransactionFailed(format!("approve receipt: {e}")))?;
            if !receipt.status() {
                return Err(ChainError::TransactionFailed("token approve reverted".into()));
            }
            approve_tx = Some(format!("{:#x}", receipt.transaction_hash));
            nonce += 1;
        }

        let mut rent_txs = Vec::with_capacity(machine_ids.len());
        for &machine_id in machine_ids {
            let receipt = marketplace
                .rentMachine(U256::from(machine_id), U256::from(hours))
                .nonce(nonce)
                .send()
                .await
                .map_err(|e| {
                    ChainError::TransactionFailed(format!("rent of machine {machine_id} failed: {e}"))
                })?
                .get_receipt()
                .await
                .map_err(|e| {
                    ChainError::TransactionFailed(format!(
                        "rent receipt for machine {machine_id}: {e}"
                    ))
                })?;
            if !receipt.status() {
                return Err(ChainError::TransactionFailed(format!(
                    "rent of machine {machine_id} reverted"
                )));
            }
            rent_txs.push(format!("{:#x}", receipt.transaction_hash));
            nonce += 1;
        }

        Ok(RentalOutcome {
            renter,
            total_required,
            approve_tx,
            rent_txs,
        })
    }
}

/// The subset of `requested` confirmed by `events`: a machine counts only
/// when an event names it and, if a renter is given, the event's renter
/// matches (addresses compare checksum-insensitively as raw bytes).
pub fn confirmed_rentals(
    events: &[RentalEvent],
    requested: &[MachineId],
    renter: Option<Address>,
) -> HashSet<MachineId> {
    let wanted: HashSet<u64> = requested.iter().map(|m| m.0).collect();
    events
        .iter()
        .filter(|ev| wanted.contains(&ev.machine_id))
        .filter(|ev| renter.map_or(true, |r| ev.renter == r))
        .map(|ev| MachineId(ev.machine_id))
        .collect()
}

/// Convert a base-unit amount to a decimal token amount, best-effort.
pub fn to_decimal_amount(base_units: U256, decimals: u8) -> f64 {
    let raw: f64 = base_units.to_string().parse().unwrap_or(0.0);
    raw / 10f64.powi(decimals as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn confirms_only_requested_machines_with_matching_renter() {
        let events = vec![
            RentalEvent { machine_id: 1, renter: addr(0xaa) },
            RentalEvent { machine_id: 2, renter: addr(0xbb) },
            RentalEvent { machine_id: 9, renter: addr(0xaa) },
        ];
        let requested = [MachineId(1), MachineId(2), MachineId(3)];

        let confirmed = confirmed_rentals(&events, &requested, Some(addr(0xaa)));
        assert_eq!(confirmed, HashSet::from([MachineId(1)]));
    }

    #[test]
    fn no_renter_confirms_any_matching_event() {
        let events = vec![
            RentalEvent { machine_id: 1, renter: addr(0xaa) },
            RentalEvent { machine_id: 2, renter: addr(0xbb) },
        ];
        let requested = [MachineId(1), MachineId(2)];

        let confirmed = confirmed_rentals(&events, &requested, None);
        assert_eq!(confirmed, HashSet::from([MachineId(1), MachineId(2)]));
    }

    #[test]
    fn machines_without_events_are_excluded() {
        let confirmed = confirmed_rentals(&[], &[MachineId(7)], None);
        assert!(confirmed.is_empty());
    }

    #[test]
    fn parsed_addresses_compare_case_insensitively() {
        let lower: Address = "0xd8da6bf26964af9d7eed9e03e53415d37aa96045".parse().unwrap();
        let checksummed: Address = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap();
        let events = vec![RentalEvent { machine_id: 4, renter: lower }];
        let confirmed = confirmed_rentals(&events, &[MachineId(4)], Some(checksummed));
        assert_eq!(confirmed, HashSet::from([MachineId(4)]));
    }

    #[test]
    fn base_units_convert_to_decimal() {
        let one_token = U256::from(10u64).pow(U256::from(18u64));
        assert!((to_decimal_amount(one_token, 18) - 1.0).abs() < 1e-9);
        assert!((to_decimal_amount(U256::from(1_500u64), 3) - 1.5).abs() < 1e-9);
        assert_eq!(to_decimal_amount(U256::ZERO, 18), 0.0);
    }

    #[test]
    fn capability_table_reports_configured_contracts() {
        let client = ChainClient::new(ChainConfig {
            rpc_url: "http://127.0.0.1:8545".into(),
            marketplace: Some(addr(0x11)),
            training_pool: None,
            lookback_blocks: 5000,
        })
        .unwrap();

        assert_eq!(client.configured_contracts(), vec!["ComputeMarketplace"]);
        assert!(client.contract_address(ContractKind::Marketplace).is_ok());
        assert!(matches!(
            client.contract_address(ContractKind::TrainingPool),
            Err(ChainError::NotConfigured("TrainingPool"))
        ));
    }
}
