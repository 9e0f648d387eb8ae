//! Chain event listener: polls the training pool for job-creation events
//! and materializes orchestrator jobs from them, optionally assigning nodes
//! and kicking off a first round without any API involvement.
//!
//! The block cursor starts at the head observed on the first poll, so a
//! restart never replays history; materialization is idempotent anyway.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chain_client::{to_decimal_amount, ChainError, JobCreatedEvent, DEFAULT_TOKEN_DECIMALS};
use mesh_core::ids::{JobId, MachineId};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{unix_now, AppState};

pub struct EventListener {
    state: Arc<AppState>,
    running: AtomicBool,
    /// Bumped on every start so a loop from a previous start/stop cycle
    /// exits instead of racing the new one.
    epoch: AtomicU64,
    stop: Notify,
    last_block: Mutex<Option<u64>>,
}

impl EventListener {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            stop: Notify::new(),
            last_block: Mutex::new(None),
        }
    }

    /// Spawn the poll loop. Returns false when the listener is already
    /// running or no training-pool contract is configured.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.state.chain.is_none() {
            tracing::info!("event listener disabled: no chain configured");
            return false;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = Arc::clone(self);
        tokio::spawn(async move {
            let interval = listener.state.config.event_poll_interval;
            tracing::info!(interval_secs = interval.as_secs(), "event listener started");
            while listener.running.load(Ordering::SeqCst)
                && listener.epoch.load(Ordering::SeqCst) == epoch
            {
                if let Err(e) = listener.poll_once().await {
                    tracing::warn!(error = %e, "event poll failed");
                }
                // A stop issued while the poll was in flight left a permit
                // behind; the notified arm consumes it immediately and the
                // loop condition observes the cleared flag.
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = listener.stop.notified() => {}
                }
            }
            tracing::info!("event listener stopped");
        });
        true
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit even when nobody is parked yet, so a
        // stop racing an in-flight poll still shuts down promptly.
        self.stop.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One poll iteration: fetch events past the cursor and process them.
    /// The first iteration only records the current head.
    pub async fn poll_once(&self) -> Result<usize, ChainError> {
        let Some(chain) = &self.state.chain else {
            return Ok(0);
        };
        let latest = chain.latest_block().await?;

        let from_block = {
            let mut cursor = self.last_block.lock();
            match *cursor {
                None => {
                    *cursor = Some(latest);
                    return Ok(0);
                }
                Some(prev) if prev >= latest => return Ok(0),
                Some(prev) => prev + 1,
            }
        };

        let events = chain.job_created_events(from_block, latest).await?;
        *self.last_block.lock() = Some(latest);
        if events.is_empty() {
            return Ok(0);
        }

        let decimals = chain
            .payment_token_decimals()
            .await
            .unwrap_or(DEFAULT_TOKEN_DECIMALS);
        let count = events.len();
        for event in events {
            self.handle_job_created(event, decimals).await;
        }
        Ok(count)
    }

    async fn handle_job_created(&self, event: JobCreatedEvent, decimals: u8) {
        let job_id = JobId(event.job_id);
        let reward = to_decimal_amount(event.total_reward, decimals);
        let job = self
            .state
            .jobs
            .materialize_from_chain(job_id, reward, unix_now());
        tracing::info!(
            job_id = job_id.0,
            reward = job.reward_pool,
            "job materialized from chain event"
        );

        if !self.state.config.auto_assign_on_event || self.state.cluster.has_assignment(job_id) {
            return;
        }
        let candidates: Vec<MachineId> = self
            .state
            .registry
            .with_endpoints(self.state.config.auto_assign_size)
            .into_iter()
            .map(|m| m.machine_id)
            .collect();
        if candidates.is_empty() {
            tracing::info!(job_id = job_id.0, "no machines available for auto-assignment");
            return;
        }

        let assigned = match self
            .state
            .cluster
            .assign(&self.state.registry, job_id, &candidates, None, unix_now())
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(job_id = job_id.0, error = %e, "auto-assignment failed");
                return;
            }
        };
        tracing::info!(job_id = job_id.0, nodes = assigned.len(), "auto-assigned nodes");

        if self.state.config.auto_start_round_on_event {
            self.state.jobs.set_status(job_id, mesh_core::job::JobStatus::Running);
            self.state
                .rounds
                .dispatch_train(job_id, &assigned, self.state.config.auto_round_steps)
                .await;
        }
    }
}
